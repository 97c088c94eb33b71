//! Quantization error analysis and sensitivity ranking
//!
//! Provides error statistics for a tensor under given parameters, and the
//! default ranker used by `Quantizer::fallback` to pick the layers least
//! suited for quantization.

use serde::{Deserialize, Serialize};

use super::observer::{ObserverConstructor, ObserverKind};
use super::qparams::{fake_quantize, quantization_mse, QDType, QParams, QScheme};
use crate::error::Result;
use crate::module::Module;

/// Error statistics for quantization analysis
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QuantErrorStats {
    /// Mean Squared Error
    pub mse: f32,
    /// Mean Absolute Error
    pub mae: f32,
    /// Maximum absolute error
    pub max_error: f32,
    /// Signal-to-Quantization-Noise Ratio (SQNR) in dB
    pub sqnr_db: f32,
    /// Number of samples
    pub num_samples: usize,
}

impl QuantErrorStats {
    /// Root Mean Squared Error
    pub fn rmse(&self) -> f32 {
        self.mse.sqrt()
    }
}

/// Analyze quantization error for given values and parameters
pub fn analyze_error(original: &[f32], params: &QParams) -> QuantErrorStats {
    if original.is_empty() {
        return QuantErrorStats::default();
    }

    let dequantized = fake_quantize(original, params);

    let errors: Vec<f32> = original
        .iter()
        .zip(dequantized.iter())
        .map(|(o, d)| (o - d).abs())
        .collect();

    let mse = quantization_mse(original, &dequantized);
    let mae = errors.iter().sum::<f32>() / errors.len() as f32;
    let max_error = errors.iter().cloned().fold(0.0f32, f32::max);

    // SQNR = 10 * log10(signal_power / noise_power)
    let signal_power: f32 = original.iter().map(|x| x * x).sum::<f32>() / original.len() as f32;
    let sqnr_db = if mse > 1e-10 {
        10.0 * (signal_power / mse).log10()
    } else {
        f32::INFINITY
    };

    QuantErrorStats {
        mse,
        mae,
        max_error,
        sqnr_db,
        num_samples: original.len(),
    }
}

/// Ranks submodules by how much quantization hurts them
pub trait SensitivityRanker {
    /// Up to `n` submodule paths, most sensitive first
    fn fallback_names(&self, model: &Module, n: usize) -> Result<Vec<String>>;
}

/// Ranks quantizable layers by weight SQNR, lowest first
///
/// Each layer's weight is fake-quantized with its qconfig's weight observer,
/// or with `default_weight` for layers without one.
#[derive(Clone, Debug)]
pub struct WeightErrorRanker {
    pub default_weight: ObserverConstructor,
}

impl Default for WeightErrorRanker {
    fn default() -> Self {
        Self {
            default_weight: ObserverConstructor::new(ObserverKind::MinMax)
                .with_dtype(QDType::QInt8)
                .with_qscheme(QScheme::PerTensorSymmetric),
        }
    }
}

impl WeightErrorRanker {
    /// SQNR of every quantizable layer, in module order
    pub fn layer_errors(&self, model: &Module) -> Vec<(String, QuantErrorStats)> {
        model
            .named_modules()
            .into_iter()
            .filter_map(|(path, module)| {
                let layer = module.as_layer()?;
                let ctr = module
                    .qconfig
                    .as_ref()
                    .map(|types| &types.weight)
                    .unwrap_or(&self.default_weight);
                let params = layer.observe_weight(ctr).qparams();
                let values: Vec<f32> = layer.weight.iter().copied().collect();
                Some((path, analyze_error(&values, &params)))
            })
            .collect()
    }
}

impl SensitivityRanker for WeightErrorRanker {
    fn fallback_names(&self, model: &Module, n: usize) -> Result<Vec<String>> {
        let mut errors = self.layer_errors(model);
        errors.sort_by(|(_, a), (_, b)| a.sqnr_db.total_cmp(&b.sqnr_db));
        Ok(errors.into_iter().take(n).map(|(path, _)| path).collect())
    }
}
