//! Quantized data types, schemes and parameters
//!
//! Provides the numeric vocabulary shared by observers and graph passes:
//! - **QDType**: integer storage type (`qint8`, `quint8`, `qint32`)
//! - **QScheme**: per-tensor/per-channel, affine/symmetric
//! - **QParams**: scale(s) and zero-point(s) for one tensor
//!
//! Per-channel parameters always group along axis 0 (output channels for weights).

use ndarray::{ArrayD, IxDyn, ShapeError};
use serde::{Deserialize, Serialize};

/// Smallest scale ever produced, keeps quantization away from division by zero
pub const MIN_SCALE: f32 = f32::EPSILON;

/// Integer storage type of a quantized value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QDType {
    /// Signed 8-bit, range [-128, 127]
    QInt8,
    /// Unsigned 8-bit, range [0, 255]
    QUInt8,
    /// Signed 32-bit, used for biases
    QInt32,
}

impl QDType {
    /// Smallest representable integer
    pub fn qmin(self) -> i64 {
        match self {
            QDType::QInt8 => i8::MIN as i64,
            QDType::QUInt8 => 0,
            QDType::QInt32 => i32::MIN as i64,
        }
    }

    /// Largest representable integer
    pub fn qmax(self) -> i64 {
        match self {
            QDType::QInt8 => i8::MAX as i64,
            QDType::QUInt8 => u8::MAX as i64,
            QDType::QInt32 => i32::MAX as i64,
        }
    }

    /// Storage width in bits
    pub fn bits(self) -> u8 {
        match self {
            QDType::QInt8 | QDType::QUInt8 => 8,
            QDType::QInt32 => 32,
        }
    }

    pub fn is_signed(self) -> bool {
        !matches!(self, QDType::QUInt8)
    }
}

/// Quantization scheme: granularity and symmetry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QScheme {
    PerTensorAffine,
    PerTensorSymmetric,
    PerChannelAffine,
    PerChannelSymmetric,
}

impl QScheme {
    pub fn is_per_channel(self) -> bool {
        matches!(self, QScheme::PerChannelAffine | QScheme::PerChannelSymmetric)
    }

    pub fn is_symmetric(self) -> bool {
        matches!(self, QScheme::PerTensorSymmetric | QScheme::PerChannelSymmetric)
    }
}

/// Quantization parameters for a tensor
///
/// Holds one scale and one zero-point per group: a single group for per-tensor
/// schemes, one group per axis-0 channel for per-channel schemes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QParams {
    /// Scale factor(s)
    pub scales: Vec<f32>,
    /// Zero point(s), same length as `scales`
    pub zero_points: Vec<i32>,
    /// Integer storage type
    pub dtype: QDType,
    /// Scheme the parameters were computed for
    pub qscheme: QScheme,
}

impl QParams {
    /// Single-group parameters
    pub fn per_tensor(scale: f32, zero_point: i32, dtype: QDType, qscheme: QScheme) -> Self {
        Self {
            scales: vec![scale],
            zero_points: vec![zero_point],
            dtype,
            qscheme,
        }
    }

    /// Get number of scale/zero-point groups
    pub fn num_groups(&self) -> usize {
        self.scales.len()
    }

    pub fn is_per_channel(&self) -> bool {
        self.qscheme.is_per_channel()
    }
}

/// Compute quantization parameters from observed ranges
///
/// `min_vals`/`max_vals` hold one entry per group. The range is always widened
/// to include zero so that zero is exactly representable. With no observed
/// range the identity parameters (scale 1, zero-point 0) are returned.
pub fn calculate_qparams(
    min_vals: &[f32],
    max_vals: &[f32],
    dtype: QDType,
    qscheme: QScheme,
) -> QParams {
    if min_vals.is_empty() || max_vals.is_empty() {
        return QParams::per_tensor(1.0, 0, dtype, qscheme);
    }

    let qmin = dtype.qmin() as f32;
    let qmax = dtype.qmax() as f32;

    let (scales, zero_points) = min_vals
        .iter()
        .zip(max_vals.iter())
        .map(|(&min_val, &max_val)| {
            let min_val = min_val.min(0.0);
            let max_val = max_val.max(0.0);

            if qscheme.is_symmetric() {
                let max_abs = (-min_val).max(max_val);
                let scale = (max_abs / ((qmax - qmin) / 2.0)).max(MIN_SCALE);
                let zero_point = if dtype.is_signed() {
                    0
                } else {
                    ((qmin + qmax) / 2.0).ceil() as i32
                };
                (scale, zero_point)
            } else {
                let scale = ((max_val - min_val) / (qmax - qmin)).max(MIN_SCALE);
                let zero_point = (qmin - (min_val / scale).round()).clamp(qmin, qmax) as i32;
                (scale, zero_point)
            }
        })
        .unzip();

    QParams {
        scales,
        zero_points,
        dtype,
        qscheme,
    }
}

fn group_size(len: usize, params: &QParams) -> usize {
    (len / params.scales.len().max(1)).max(1)
}

/// Quantize values using given parameters
pub fn quantize(values: &[f32], params: &QParams) -> Vec<i32> {
    let qmin = params.dtype.qmin() as f32;
    let qmax = params.dtype.qmax() as f32;
    let group_size = group_size(values.len(), params);
    let last_group = params.scales.len().saturating_sub(1);

    values
        .iter()
        .enumerate()
        .map(|(i, &val)| {
            let group_idx = (i / group_size).min(last_group);
            let scale = params.scales.get(group_idx).copied().unwrap_or(1.0);
            let zp = params.zero_points.get(group_idx).copied().unwrap_or(0);
            ((val / scale).round() + zp as f32).clamp(qmin, qmax) as i32
        })
        .collect()
}

/// Dequantize values using given parameters
pub fn dequantize(quantized: &[i32], params: &QParams) -> Vec<f32> {
    let group_size = group_size(quantized.len(), params);
    let last_group = params.scales.len().saturating_sub(1);

    quantized
        .iter()
        .enumerate()
        .map(|(i, &q_val)| {
            let group_idx = (i / group_size).min(last_group);
            let scale = params.scales.get(group_idx).copied().unwrap_or(1.0);
            let zp = params.zero_points.get(group_idx).copied().unwrap_or(0);
            (q_val as i64 - zp as i64) as f32 * scale
        })
        .collect()
}

/// Quantize then dequantize, simulating quantization noise in f32
pub fn fake_quantize(values: &[f32], params: &QParams) -> Vec<f32> {
    dequantize(&quantize(values, params), params)
}

/// Compute quantization error (MSE)
pub fn quantization_mse(original: &[f32], dequantized: &[f32]) -> f32 {
    if original.len() != dequantized.len() || original.is_empty() {
        return f32::MAX;
    }

    let sum_sq: f32 = original
        .iter()
        .zip(dequantized.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum();

    sum_sq / original.len() as f32
}

/// Statically quantized tensor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizedTensor {
    /// Quantized integer data, within `params.dtype` range
    pub data: Vec<i32>,
    /// Quantization parameters
    pub params: QParams,
    /// Original shape
    pub shape: Vec<usize>,
}

impl QuantizedTensor {
    /// Quantize an f32 tensor with precomputed parameters
    pub fn quantize(tensor: &ArrayD<f32>, params: QParams) -> Self {
        let values: Vec<f32> = tensor.iter().copied().collect();
        Self {
            data: quantize(&values, &params),
            params,
            shape: tensor.shape().to_vec(),
        }
    }

    /// Recover an f32 tensor
    pub fn dequantize(&self) -> Result<ArrayD<f32>, ShapeError> {
        ArrayD::from_shape_vec(
            IxDyn(&self.shape),
            dequantize(&self.data, &self.params),
        )
    }

    pub fn dtype(&self) -> QDType {
        self.params.dtype
    }

    /// Memory usage in bytes
    pub fn memory_bytes(&self) -> usize {
        let data_bytes = self.data.len() * (self.params.dtype.bits() as usize / 8);
        let scale_bytes = self.params.scales.len() * 4;
        let zp_bytes = self.params.zero_points.len() * 4;
        data_bytes + scale_bytes + zp_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn test_symmetric_qint8_scale() {
        let params = calculate_qparams(&[-1.0], &[0.5], QDType::QInt8, QScheme::PerTensorSymmetric);

        // max_abs / ((127 - (-128)) / 2)
        assert_abs_diff_eq!(params.scales[0], 1.0 / 127.5, epsilon = 1e-7);
        assert_eq!(params.zero_points, vec![0]);
    }

    #[test]
    fn test_symmetric_quint8_centered_zero_point() {
        let params = calculate_qparams(&[-2.0], &[2.0], QDType::QUInt8, QScheme::PerTensorSymmetric);
        assert_eq!(params.zero_points, vec![128]);
    }

    #[test]
    fn test_affine_quint8_zero_point() {
        let params = calculate_qparams(&[-1.0], &[3.0], QDType::QUInt8, QScheme::PerTensorAffine);

        assert_abs_diff_eq!(params.scales[0], 4.0 / 255.0, epsilon = 1e-7);
        // 0 - round(-1 / (4/255)) = round(63.75)
        assert_eq!(params.zero_points, vec![64]);
    }

    #[test]
    fn test_range_includes_zero() {
        // All-positive data still maps zero to the zero-point
        let params = calculate_qparams(&[2.0], &[4.0], QDType::QUInt8, QScheme::PerTensorAffine);
        assert_eq!(params.zero_points, vec![0]);
        assert_abs_diff_eq!(params.scales[0], 4.0 / 255.0, epsilon = 1e-7);
    }

    #[test]
    fn test_no_observations_gives_identity() {
        let params = calculate_qparams(&[], &[], QDType::QInt8, QScheme::PerTensorSymmetric);
        assert_eq!(params.scales, vec![1.0]);
        assert_eq!(params.zero_points, vec![0]);
    }

    #[test]
    fn test_zeros_do_not_divide_by_zero() {
        let params = calculate_qparams(&[0.0], &[0.0], QDType::QInt8, QScheme::PerTensorSymmetric);
        assert!(params.scales[0] >= MIN_SCALE);

        let values = vec![0.0; 10];
        for val in fake_quantize(&values, &params) {
            assert_abs_diff_eq!(val, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_per_channel_groups() {
        let params = calculate_qparams(
            &[-1.0, -10.0],
            &[1.0, 10.0],
            QDType::QInt8,
            QScheme::PerChannelSymmetric,
        );
        assert_eq!(params.num_groups(), 2);

        let values = vec![1.0, -1.0, 10.0, -10.0];
        let quantized = quantize(&values, &params);
        // Each channel saturates at its own max
        assert_eq!(quantized, vec![127, -128, 127, -128]);
    }

    #[test]
    fn test_quantize_clamps_to_dtype() {
        let params = QParams::per_tensor(0.1, 0, QDType::QInt8, QScheme::PerTensorSymmetric);
        assert_eq!(quantize(&[1000.0, -1000.0], &params), vec![127, -128]);
    }

    #[test]
    fn test_quantized_tensor_struct() {
        let tensor = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1.0, 2.0, 3.0, -4.0, 5.0, 6.0])
            .unwrap();
        let params = calculate_qparams(&[-4.0], &[6.0], QDType::QInt8, QScheme::PerTensorSymmetric);

        let quantized = QuantizedTensor::quantize(&tensor, params);
        assert_eq!(quantized.shape, vec![2, 3]);
        assert_eq!(quantized.data.len(), 6);
        assert_eq!(quantized.dtype(), QDType::QInt8);

        let restored = quantized.dequantize().unwrap();
        assert_eq!(restored.shape(), &[2, 3]);
        for (orig, deq) in tensor.iter().zip(restored.iter()) {
            assert_abs_diff_eq!(orig, deq, epsilon = 0.03);
        }
    }

    #[test]
    fn test_memory_bytes() {
        let tensor = ArrayD::from_elem(IxDyn(&[100]), 1.0f32);
        let params = calculate_qparams(&[1.0], &[1.0], QDType::QInt8, QScheme::PerTensorSymmetric);
        let quantized = QuantizedTensor::quantize(&tensor, params);

        // 100 bytes data + 4 bytes scale + 4 bytes zero-point
        assert_eq!(quantized.memory_bytes(), 108);
    }

    #[test]
    fn test_qscheme_serde_names() {
        let yaml = serde_yaml::to_string(&QScheme::PerChannelSymmetric).unwrap();
        assert_eq!(yaml.trim(), "per_channel_symmetric");
        let dtype: QDType = serde_yaml::from_str("quint8").unwrap();
        assert_eq!(dtype, QDType::QUInt8);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_round_trip_error_within_half_step(
            values in proptest::collection::vec(-100.0f32..100.0, 1..100)
        ) {
            let min_val = values.iter().cloned().fold(f32::INFINITY, f32::min);
            let max_val = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let params = calculate_qparams(&[min_val], &[max_val], QDType::QUInt8, QScheme::PerTensorAffine);
            let restored = fake_quantize(&values, &params);

            let half_step = params.scales[0] / 2.0 + 1e-4;
            for (orig, deq) in values.iter().zip(restored.iter()) {
                prop_assert!((orig - deq).abs() <= half_step, "{} vs {}", orig, deq);
            }
        }

        #[test]
        fn prop_symmetric_zero_maps_to_zero(
            values in proptest::collection::vec(-100.0f32..100.0, 1..100)
        ) {
            let max_abs = values.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            let params = calculate_qparams(&[-max_abs], &[max_abs], QDType::QInt8, QScheme::PerTensorSymmetric);
            let zero = fake_quantize(&[0.0], &params);
            prop_assert!(zero[0].abs() < 1e-6);
        }
    }
}
