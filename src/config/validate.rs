//! Configuration validation

use super::schema::QuantizerConfig;
use crate::module::MODULE_KINDS;
use crate::quant::ObserverKind;
use crate::registry::{self, Backend, Device, ObserverTable};

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Backend {backend} has no default observers on device {device}; supply activation and weight observers")]
    UnsupportedCombination { backend: Backend, device: Device },

    #[error("Observer `{role}` uses a per-channel scheme but kind {kind} keeps per-tensor statistics")]
    PerChannelUnsupported { role: &'static str, kind: ObserverKind },

    #[error("Observer `{role}` cannot use kind {kind}")]
    MisplacedKind { role: &'static str, kind: ObserverKind },

    #[error("Unknown module kind in filter: {0} (must be one of: {kinds})", kinds = MODULE_KINDS.join(", "))]
    UnknownModuleKind(String),

    #[error("Invalid percentile range for `{role}`: {lower}..{upper} (must satisfy 0 <= lower < upper <= 100)")]
    InvalidPercentiles { role: &'static str, lower: f64, upper: f64 },

    #[error("Invalid averaging constant for `{role}`: {value} (must be in (0, 1])")]
    InvalidAveragingConstant { role: &'static str, value: f64 },
}

/// Validate a quantizer configuration
///
/// Checks:
/// - default observers exist for the device/backend pair when needed
/// - per-channel schemes only on per-channel-capable kinds
/// - `bias` observers only in the bias role
/// - filter kinds and observer parameters are in range
pub fn validate_config(config: &QuantizerConfig) -> Result<(), ValidationError> {
    let observers = &config.observers;

    if !observers.is_complete() {
        let missing_act = observers.activation.is_none()
            && registry::resolve(ObserverTable::Activation, config.device, config.backend).is_err();
        let missing_w = observers.weight.is_none()
            && registry::resolve(ObserverTable::Weight, config.device, config.backend).is_err();
        if missing_act || missing_w {
            return Err(ValidationError::UnsupportedCombination {
                backend: config.backend,
                device: config.device,
            });
        }
    }

    for (role, ctr) in observers.entries() {
        let is_bias = ctr.kind == ObserverKind::Bias;
        if is_bias != (role == "bias") {
            return Err(ValidationError::MisplacedKind { role, kind: ctr.kind });
        }

        if ctr.qscheme.is_some_and(|q| q.is_per_channel()) && !ctr.kind.supports_per_channel() {
            return Err(ValidationError::PerChannelUnsupported { role, kind: ctr.kind });
        }

        let param = |key: &str| ctr.params.get(key).and_then(|v| v.as_f64());

        if let Some(value) = param("averaging_constant") {
            if value <= 0.0 || value > 1.0 {
                return Err(ValidationError::InvalidAveragingConstant { role, value });
            }
        }

        let lower = param("lower_percentile");
        let upper = param("upper_percentile");
        if lower.is_some() || upper.is_some() {
            let (lower, upper) = (lower.unwrap_or(0.0), upper.unwrap_or(100.0));
            if !(0.0..=100.0).contains(&lower) || !(0.0..=100.0).contains(&upper) || lower >= upper {
                return Err(ValidationError::InvalidPercentiles { role, lower, upper });
            }
        }
    }

    if let Some(filter) = &config.filter {
        if let Some(kind) = filter
            .include_kinds
            .iter()
            .chain(filter.exclude_kinds.iter())
            .find(|k| !MODULE_KINDS.contains(&k.as_str()))
        {
            return Err(ValidationError::UnknownModuleKind(kind.clone()));
        }
    }

    Ok(())
}
