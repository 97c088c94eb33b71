//! Observers: statistics collection and fake quantization
//!
//! An [`ObserverConstructor`] is a deferred factory: it captures the observer
//! kind and its numeric format, and only produces an [`Observer`] when a graph
//! pass inserts one. Every `build()` yields an independent instance, so one
//! constructor can serve any number of insertion points.
//!
//! Observers run in two modes that are toggled independently:
//! - **observe**: accumulate range statistics from every value seen
//! - **fake-quant**: return `dequantize(quantize(x))` instead of `x`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::qparams::{calculate_qparams, fake_quantize, QDType, QParams, QScheme, MIN_SCALE};

/// Parameters a QAT constructor inherits from its post-training source
pub const QAT_INHERITED_PARAMS: [&str; 2] = ["qscheme", "dtype"];

const DEFAULT_UPPER_PERCENTILE: f32 = 99.99;
const DEFAULT_MAX_SAMPLES: usize = 16384;

/// Statistic an observer keeps
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverKind {
    /// Running min/max over the whole tensor
    MinMax,
    /// Running min/max per axis-0 channel
    PerChannelMinMax,
    /// Percentile range over collected samples, robust to outliers
    Histogram,
    /// Learned step size (QAT): scale is a trainable parameter
    Lsq,
    /// 32-bit bias observer
    Bias,
}

impl ObserverKind {
    pub fn name(self) -> &'static str {
        match self {
            ObserverKind::MinMax => "min_max",
            ObserverKind::PerChannelMinMax => "per_channel_min_max",
            ObserverKind::Histogram => "histogram",
            ObserverKind::Lsq => "lsq",
            ObserverKind::Bias => "bias",
        }
    }

    /// Data type used when the constructor leaves it unbound
    pub fn default_dtype(self) -> QDType {
        match self {
            ObserverKind::MinMax | ObserverKind::PerChannelMinMax | ObserverKind::Histogram => {
                QDType::QUInt8
            }
            ObserverKind::Lsq => QDType::QInt8,
            ObserverKind::Bias => QDType::QInt32,
        }
    }

    /// Scheme used when the constructor leaves it unbound
    pub fn default_qscheme(self) -> QScheme {
        match self {
            ObserverKind::MinMax | ObserverKind::Histogram => QScheme::PerTensorAffine,
            ObserverKind::PerChannelMinMax => QScheme::PerChannelAffine,
            ObserverKind::Lsq | ObserverKind::Bias => QScheme::PerTensorSymmetric,
        }
    }

    /// Whether the kind keeps per-channel statistics
    pub fn supports_per_channel(self) -> bool {
        matches!(self, ObserverKind::PerChannelMinMax | ObserverKind::Lsq)
    }
}

impl std::fmt::Display for ObserverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Deferred observer factory with bound numeric parameters
///
/// Recognized extra parameters:
/// - `averaging_constant` (min/max kinds): moving-average range update
/// - `lower_percentile`, `upper_percentile`, `max_samples` (histogram)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObserverConstructor {
    /// Observer kind
    pub kind: ObserverKind,

    /// Bound data type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<QDType>,

    /// Bound quantization scheme
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qscheme: Option<QScheme>,

    /// Kind-specific parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl ObserverConstructor {
    /// Constructor with nothing bound
    pub fn new(kind: ObserverKind) -> Self {
        Self {
            kind,
            dtype: None,
            qscheme: None,
            params: BTreeMap::new(),
        }
    }

    pub fn with_dtype(mut self, dtype: QDType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_qscheme(mut self, qscheme: QScheme) -> Self {
        self.qscheme = Some(qscheme);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Names of every bound parameter
    pub fn bound_params(&self) -> Vec<String> {
        let mut bound = Vec::with_capacity(2 + self.params.len());
        if self.dtype.is_some() {
            bound.push("dtype".to_string());
        }
        if self.qscheme.is_some() {
            bound.push("qscheme".to_string());
        }
        bound.extend(self.params.keys().cloned());
        bound
    }

    /// Rebind this constructor's kind with only the numeric format of `source`
    ///
    /// Keeps `dtype` and `qscheme` from `source` and drops every other bound
    /// parameter of both constructors.
    pub fn with_numeric_format_of(&self, source: &ObserverConstructor) -> Self {
        Self {
            kind: self.kind,
            dtype: source.dtype,
            qscheme: source.qscheme,
            params: BTreeMap::new(),
        }
    }

    /// Data type the built observer will use
    pub fn resolved_dtype(&self) -> QDType {
        self.dtype.unwrap_or_else(|| self.kind.default_dtype())
    }

    /// Scheme the built observer will use
    ///
    /// Kinds without per-channel statistics fall back to the per-tensor
    /// scheme of the same symmetry.
    pub fn resolved_qscheme(&self) -> QScheme {
        let qscheme = self.qscheme.unwrap_or_else(|| self.kind.default_qscheme());
        match qscheme {
            QScheme::PerChannelAffine if !self.kind.supports_per_channel() => {
                QScheme::PerTensorAffine
            }
            QScheme::PerChannelSymmetric if !self.kind.supports_per_channel() => {
                QScheme::PerTensorSymmetric
            }
            other => other,
        }
    }

    fn param_f32(&self, key: &str) -> Option<f32> {
        self.params.get(key).and_then(|v| v.as_f64()).map(|v| v as f32)
    }

    /// Produce a fresh observer
    pub fn build(&self) -> Observer {
        let averaging_constant = match self.kind {
            ObserverKind::MinMax | ObserverKind::PerChannelMinMax => self
                .param_f32("averaging_constant")
                .filter(|c| *c > 0.0 && *c <= 1.0),
            _ => None,
        };
        let max_samples = self
            .params
            .get("max_samples")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_SAMPLES);

        Observer {
            kind: self.kind,
            dtype: self.resolved_dtype(),
            qscheme: self.resolved_qscheme(),
            observe: true,
            fake_quant: false,
            min_vals: Vec::new(),
            max_vals: Vec::new(),
            averaging_constant,
            samples: Vec::new(),
            max_samples,
            percentiles: (
                self.param_f32("lower_percentile").unwrap_or(0.0),
                self.param_f32("upper_percentile")
                    .unwrap_or(DEFAULT_UPPER_PERCENTILE),
            ),
            learned_scales: Vec::new(),
            num_batches: 0,
        }
    }
}

/// Stateful observer instance
#[derive(Clone, Debug, PartialEq)]
pub struct Observer {
    kind: ObserverKind,
    dtype: QDType,
    qscheme: QScheme,
    observe: bool,
    fake_quant: bool,
    /// Running minimum per group
    min_vals: Vec<f32>,
    /// Running maximum per group
    max_vals: Vec<f32>,
    averaging_constant: Option<f32>,
    /// Collected samples (histogram)
    samples: Vec<f32>,
    max_samples: usize,
    percentiles: (f32, f32),
    /// Trainable step sizes (LSQ)
    learned_scales: Vec<f32>,
    num_batches: usize,
}

impl Observer {
    pub fn kind(&self) -> ObserverKind {
        self.kind
    }

    pub fn dtype(&self) -> QDType {
        self.dtype
    }

    pub fn qscheme(&self) -> QScheme {
        self.qscheme
    }

    pub fn is_observing(&self) -> bool {
        self.observe
    }

    pub fn is_fake_quant(&self) -> bool {
        self.fake_quant
    }

    /// Toggle statistics collection and fake quantization
    pub fn set_mode(&mut self, observe: bool, fake_quant: bool) {
        self.observe = observe;
        self.fake_quant = fake_quant;
    }

    /// Number of batches observed
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    /// Check if any data has been observed
    pub fn has_data(&self) -> bool {
        self.num_batches > 0
    }

    pub fn min_vals(&self) -> &[f32] {
        &self.min_vals
    }

    pub fn max_vals(&self) -> &[f32] {
        &self.max_vals
    }

    pub fn learned_scales(&self) -> &[f32] {
        &self.learned_scales
    }

    /// Overwrite the trainable step sizes, e.g. after an optimizer step
    pub fn set_learned_scales(&mut self, scales: Vec<f32>) {
        self.learned_scales = scales.into_iter().map(|s| s.abs().max(MIN_SCALE)).collect();
    }

    /// Reset observed state
    pub fn reset(&mut self) {
        self.min_vals.clear();
        self.max_vals.clear();
        self.samples.clear();
        self.learned_scales.clear();
        self.num_batches = 0;
    }

    /// Observe a flat tensor
    pub fn observe(&mut self, values: &[f32]) {
        self.observe_tensor(values, &[values.len()]);
    }

    /// Observe a tensor with its shape; per-channel schemes group along axis 0
    pub fn observe_tensor(&mut self, values: &[f32], shape: &[usize]) {
        if values.is_empty() {
            return;
        }

        let channels = self.channels_for(values.len(), shape);
        let per_channel = values.len() / channels;

        let (batch_min, batch_max): (Vec<f32>, Vec<f32>) = values
            .chunks(per_channel)
            .map(|chunk| {
                chunk
                    .iter()
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), &v| {
                        (min.min(v), max.max(v))
                    })
            })
            .unzip();

        if self.min_vals.len() != channels {
            self.min_vals = batch_min;
            self.max_vals = batch_max;
        } else if let Some(c) = self.averaging_constant {
            for (running, batch) in self.min_vals.iter_mut().zip(batch_min) {
                *running = *running * (1.0 - c) + batch * c;
            }
            for (running, batch) in self.max_vals.iter_mut().zip(batch_max) {
                *running = *running * (1.0 - c) + batch * c;
            }
        } else {
            for (running, batch) in self.min_vals.iter_mut().zip(batch_min) {
                *running = running.min(batch);
            }
            for (running, batch) in self.max_vals.iter_mut().zip(batch_max) {
                *running = running.max(batch);
            }
        }

        match self.kind {
            ObserverKind::Histogram => {
                let remaining = self.max_samples.saturating_sub(self.samples.len());
                self.samples.extend(values.iter().take(remaining).copied());
            }
            ObserverKind::Lsq if self.learned_scales.len() != channels => {
                // LSQ init: 2 * mean(|x|) / sqrt(qmax)
                let qmax = (self.dtype.qmax() as f32).sqrt();
                self.learned_scales = values
                    .chunks(per_channel)
                    .map(|chunk| {
                        let mean_abs = chunk.iter().map(|v| v.abs()).sum::<f32>() / chunk.len() as f32;
                        (2.0 * mean_abs / qmax).max(MIN_SCALE)
                    })
                    .collect();
            }
            _ => {}
        }

        self.num_batches += 1;
    }

    fn channels_for(&self, len: usize, shape: &[usize]) -> usize {
        if !self.qscheme.is_per_channel() || shape.len() < 2 {
            return 1;
        }
        match shape.first() {
            Some(&c) if c > 0 && len % c == 0 => c,
            _ => 1,
        }
    }

    fn percentile_bounds(&self) -> (f32, f32) {
        if self.samples.is_empty() {
            return (
                self.min_vals.first().copied().unwrap_or(0.0),
                self.max_vals.first().copied().unwrap_or(0.0),
            );
        }

        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let (lower, upper) = self.percentiles;
        let n = sorted.len();
        let lower_idx = (((lower / 100.0) * n as f32) as usize).min(n - 1);
        let upper_idx = (((upper / 100.0) * n as f32) as usize).min(n - 1);

        (sorted[lower_idx], sorted[upper_idx])
    }

    /// Compute quantization parameters from observed statistics
    pub fn qparams(&self) -> QParams {
        match self.kind {
            ObserverKind::Histogram => {
                if !self.has_data() {
                    return calculate_qparams(&[], &[], self.dtype, self.qscheme);
                }
                let (lo, hi) = self.percentile_bounds();
                calculate_qparams(&[lo], &[hi], self.dtype, self.qscheme)
            }
            ObserverKind::Lsq => {
                let mut params =
                    calculate_qparams(&self.min_vals, &self.max_vals, self.dtype, self.qscheme);
                if !self.learned_scales.is_empty() {
                    if params.zero_points.len() != self.learned_scales.len() {
                        params.zero_points = vec![params.zero_points[0]; self.learned_scales.len()];
                    }
                    params.scales = self.learned_scales.clone();
                }
                params
            }
            _ => calculate_qparams(&self.min_vals, &self.max_vals, self.dtype, self.qscheme),
        }
    }

    /// Run the observer on a value flowing through its edge
    pub fn forward(&mut self, values: &[f32], shape: &[usize]) -> Vec<f32> {
        if self.observe {
            self.observe_tensor(values, shape);
        }
        if self.fake_quant {
            fake_quantize(values, &self.qparams())
        } else {
            values.to_vec()
        }
    }
}
