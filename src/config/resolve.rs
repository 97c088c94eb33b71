//! Observer type resolution
//!
//! Merges caller-supplied observer constructors with the registry defaults,
//! and derives QAT constructors from post-training ones.

use serde::{Deserialize, Serialize};

use crate::quant::ObserverConstructor;

/// Observer constructors used to annotate a module
///
/// Activation and weight are always resolved; bias is optional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObserverTypes {
    pub activation: ObserverConstructor,
    pub weight: ObserverConstructor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<ObserverConstructor>,
}

impl ObserverTypes {
    pub fn new(activation: ObserverConstructor, weight: ObserverConstructor) -> Self {
        Self {
            activation,
            weight,
            bias: None,
        }
    }

    pub fn with_bias(mut self, bias: Option<ObserverConstructor>) -> Self {
        self.bias = bias;
        self
    }
}

/// Caller-supplied constructors for one stage call
///
/// Unset fields fall back to the quantizer's constructors.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverOverrides {
    pub activation: Option<ObserverConstructor>,
    pub weight: Option<ObserverConstructor>,
    pub bias: Option<ObserverConstructor>,
}

impl ObserverOverrides {
    pub fn activation(mut self, ctr: ObserverConstructor) -> Self {
        self.activation = Some(ctr);
        self
    }

    pub fn weight(mut self, ctr: ObserverConstructor) -> Self {
        self.weight = Some(ctr);
        self
    }

    pub fn bias(mut self, ctr: ObserverConstructor) -> Self {
        self.bias = Some(ctr);
        self
    }
}

/// Each explicit constructor overrides its default
pub fn get_observer_types(
    act: Option<ObserverConstructor>,
    w: Option<ObserverConstructor>,
    bias: Option<ObserverConstructor>,
    default_act: ObserverConstructor,
    default_w: ObserverConstructor,
    default_bias: Option<ObserverConstructor>,
) -> ObserverTypes {
    ObserverTypes {
        activation: act.unwrap_or(default_act),
        weight: w.unwrap_or(default_w),
        bias: bias.or(default_bias),
    }
}

/// QAT constructor carrying only the numeric format of `source`
///
/// QAT keeps the post-training dtype and qscheme but always uses its own
/// statistics, so every other parameter bound on either side is dropped.
pub fn derive_qat_constructor(qat: &ObserverConstructor, source: &ObserverConstructor) -> ObserverConstructor {
    qat.with_numeric_format_of(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::{ObserverKind, QAT_INHERITED_PARAMS, QDType, QScheme};
    use crate::registry;

    fn min_max() -> ObserverConstructor {
        ObserverConstructor::new(ObserverKind::MinMax)
    }

    #[test]
    fn test_defaults_fill_missing() {
        let types = get_observer_types(
            None,
            None,
            None,
            min_max(),
            ObserverConstructor::new(ObserverKind::PerChannelMinMax),
            None,
        );
        assert_eq!(types.activation.kind, ObserverKind::MinMax);
        assert_eq!(types.weight.kind, ObserverKind::PerChannelMinMax);
        assert!(types.bias.is_none());
    }

    #[test]
    fn test_explicit_overrides_default() {
        let types = get_observer_types(
            Some(ObserverConstructor::new(ObserverKind::Histogram)),
            None,
            None,
            min_max(),
            min_max(),
            Some(registry::default_bias_constructor()),
        );
        assert_eq!(types.activation.kind, ObserverKind::Histogram);
        assert_eq!(types.bias.map(|b| b.kind), Some(ObserverKind::Bias));
    }

    #[test]
    fn test_derive_qat_inherits_numeric_format() {
        let source = ObserverConstructor::new(ObserverKind::PerChannelMinMax)
            .with_dtype(QDType::QInt8)
            .with_qscheme(QScheme::PerChannelSymmetric)
            .with_param("averaging_constant", 0.01);

        let derived = derive_qat_constructor(&registry::default_qat_constructor(), &source);

        assert_eq!(derived.kind, ObserverKind::Lsq);
        assert_eq!(derived.dtype, source.dtype);
        assert_eq!(derived.qscheme, source.qscheme);
        assert!(derived
            .bound_params()
            .iter()
            .all(|p| QAT_INHERITED_PARAMS.contains(&p.as_str())));
    }

    #[test]
    fn test_derive_from_unbound_source() {
        let derived = derive_qat_constructor(&registry::default_qat_constructor(), &min_max());
        assert!(derived.bound_params().is_empty());
    }
}
