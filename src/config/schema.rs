//! YAML schema definitions for quantizer configuration

use serde::{Deserialize, Serialize};

use crate::module::ModuleFilter;
use crate::quant::ObserverConstructor;
use crate::registry::{Backend, Device};

/// Complete quantizer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantizerConfig {
    /// Lowering backend
    #[serde(default)]
    pub backend: Backend,

    /// Target device
    #[serde(default)]
    pub device: Device,

    /// Optional submodule filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ModuleFilter>,

    /// Observer overrides; unset entries use the registry defaults
    #[serde(default)]
    pub observers: ObserverSpec,
}

/// Observer constructors supplied by the user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObserverSpec {
    /// Activation observer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<ObserverConstructor>,

    /// Weight observer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<ObserverConstructor>,

    /// Bias observer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<ObserverConstructor>,

    /// QAT observer, numeric format inherited from the post-training ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qat: Option<ObserverConstructor>,
}

impl ObserverSpec {
    /// Whether both post-training constructors are supplied
    pub fn is_complete(&self) -> bool {
        self.activation.is_some() && self.weight.is_some()
    }

    /// Every supplied constructor with the role it is used for
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &ObserverConstructor)> {
        [
            ("activation", self.activation.as_ref()),
            ("weight", self.weight.as_ref()),
            ("bias", self.bias.as_ref()),
            ("qat", self.qat.as_ref()),
        ]
        .into_iter()
        .filter_map(|(role, ctr)| ctr.map(|c| (role, c)))
    }
}
