use crate::error::Result;
use crate::graph::context::GraphModContext;
use crate::module::LayerStage;
use crate::quant::QuantizedTensor;

use super::{annotated_layer_nodes, layer_qconfig, Pass};

/// Float annotated layers become observed layers
///
/// Observed layers fake-quantize their weight through the weight observer,
/// which is attached here from the layer's qconfig when missing.
pub struct QuantizableModuleToObserved;

/// Float annotated layers become mixed-precision layers
pub struct QuantizableModuleToAmp;

/// Float or observed annotated layers become reference quantized layers
///
/// The weight is quantized once with the weight observer's parameters; a
/// fresh observer from the layer's qconfig weight constructor is used when
/// the layer carries none.
pub struct QuantizableModuleToRef;

fn to_fake_quant_stage(ctx: &mut GraphModContext<'_>, stage: LayerStage) {
    let gm = ctx.gm_mut();

    for (_, target) in annotated_layer_nodes(gm) {
        let Some(qconfig) = layer_qconfig(gm, &target) else {
            continue;
        };
        let Some(layer) = gm.layer_mut(&target) else {
            continue;
        };
        if layer.stage != LayerStage::Float {
            continue;
        }
        if layer.weight_observer.is_none() {
            layer.weight_observer = Some(layer.observe_weight(&qconfig.weight));
        }
        layer.stage = stage.clone();
    }
}

impl Pass for QuantizableModuleToObserved {
    fn name(&self) -> &'static str {
        "quantizable_module_to_observed"
    }

    fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()> {
        to_fake_quant_stage(ctx, LayerStage::Observed);
        Ok(())
    }
}

impl Pass for QuantizableModuleToAmp {
    fn name(&self) -> &'static str {
        "quantizable_module_to_amp"
    }

    fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()> {
        to_fake_quant_stage(ctx, LayerStage::Amp);
        Ok(())
    }
}

impl Pass for QuantizableModuleToRef {
    fn name(&self) -> &'static str {
        "quantizable_module_to_ref"
    }

    fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()> {
        let gm = ctx.gm_mut();

        for (_, target) in annotated_layer_nodes(gm) {
            let Some(qconfig) = layer_qconfig(gm, &target) else {
                continue;
            };
            let Some(layer) = gm.layer_mut(&target) else {
                continue;
            };
            if !matches!(layer.stage, LayerStage::Float | LayerStage::Observed) {
                continue;
            }
            let observer = layer
                .weight_observer
                .take()
                .unwrap_or_else(|| layer.observe_weight(&qconfig.weight));
            let weight = QuantizedTensor::quantize(&layer.weight, observer.qparams());
            layer.stage = LayerStage::Reference { weight };
        }
        Ok(())
    }
}
