//! Graph transformation passes
//!
//! Each pass is a unit struct implementing [`Pass`]. Passes do not check
//! what ran before them; the stage pipelines in [`crate::quantizer`] decide
//! ordering per backend.

mod fbgemm;
mod fuse;
mod observe;
mod qconfig;
mod qdq;
mod swap;

pub use fbgemm::QRefDqToFbgemm;
pub use fuse::FuseModules;
pub use observe::{InsertActObserver, InsertWObserver};
pub use qconfig::SetQConfig;
pub use qdq::{FoldQdq, ObserverToQdq};
pub use swap::{QuantizableModuleToAmp, QuantizableModuleToObserved, QuantizableModuleToRef};

use crate::config::ObserverTypes;
use crate::error::Result;

use super::context::GraphModContext;
use super::ir::NodeId;
use super::module::GraphModule;

/// Named graph transformation
pub trait Pass {
    fn name(&self) -> &'static str;

    fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()>;
}

/// `CallModule` nodes calling a quantizable layer, with their targets
pub(crate) fn layer_nodes(gm: &GraphModule) -> Vec<(NodeId, String)> {
    gm.graph
        .nodes()
        .filter(|node| gm.is_layer_node(node))
        .filter_map(|node| node.target().map(|t| (node.id(), t.to_string())))
        .collect()
}

/// Layer nodes whose module carries a qconfig
pub(crate) fn annotated_layer_nodes(gm: &GraphModule) -> Vec<(NodeId, String)> {
    layer_nodes(gm)
        .into_iter()
        .filter(|(_, target)| {
            gm.submodule(target)
                .is_some_and(|module| module.qconfig.is_some())
        })
        .collect()
}

/// Observer types a layer was annotated with
pub(crate) fn layer_qconfig(gm: &GraphModule, target: &str) -> Option<ObserverTypes> {
    gm.submodule(target).and_then(|module| module.qconfig.clone())
}

/// Remove a submodule once no node calls it
pub(crate) fn drop_if_unused(gm: &mut GraphModule, target: &str) {
    if gm.graph.call_count(target) == 0 {
        gm.remove_submodule(target);
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use ndarray::Array;

    use crate::config::ObserverTypes;
    use crate::module::{BatchNorm2d, Module, SequentialTracer, Tracer};
    use crate::quant::{ObserverConstructor, ObserverKind, QDType, QScheme};

    use super::super::module::GraphModule;

    pub fn types() -> ObserverTypes {
        ObserverTypes::new(
            ObserverConstructor::new(ObserverKind::MinMax)
                .with_dtype(QDType::QUInt8)
                .with_qscheme(QScheme::PerTensorAffine),
            ObserverConstructor::new(ObserverKind::MinMax)
                .with_dtype(QDType::QInt8)
                .with_qscheme(QScheme::PerTensorSymmetric),
        )
    }

    pub fn linear_model() -> Module {
        Module::sequential([(
            "fc",
            Module::linear(Array::from_shape_fn((3, 2), |(i, j)| i as f32 - j as f32 * 0.5), None),
        )])
    }

    pub fn mlp() -> Module {
        Module::sequential([
            ("fc1", Module::linear(Array::from_elem((4, 2), 0.5), None)),
            ("relu", Module::relu()),
            ("fc2", Module::linear(Array::from_elem((2, 4), -0.25), None)),
        ])
    }

    pub fn conv_bn_relu() -> Module {
        Module::sequential([
            ("conv", Module::conv2d(Array::from_elem((2, 1, 3, 3), 0.1), None, 1, 1)),
            ("bn", Module::batch_norm(BatchNorm2d::new(2))),
            ("relu", Module::relu()),
        ])
    }

    pub fn trace(model: &Module) -> GraphModule {
        SequentialTracer.trace(model).unwrap()
    }
}
