use crate::error::Result;
use crate::graph::context::GraphModContext;
use crate::graph::ir::NodeId;
use crate::graph::module::GraphModule;
use crate::module::LayerStage;
use crate::quant::QParams;

use super::{layer_nodes, Pass};

/// Lower `dequantize → reference layer → quantize` to an FBGEMM layer
///
/// The lowered layer consumes the quantized input directly and produces
/// values quantized with the output parameters. The bypassed dequantize is
/// left for [`super::FoldQdq`] to erase.
pub struct QRefDqToFbgemm;

struct Lowering {
    layer: NodeId,
    target: String,
    quantized_input: NodeId,
    quantize_out: NodeId,
    output: QParams,
}

fn match_pattern(gm: &GraphModule, layer: NodeId, target: &str) -> Option<Lowering> {
    if gm.graph.call_count(target) != 1 {
        return None;
    }
    if !matches!(gm.layer(target)?.stage, LayerStage::Reference { .. }) {
        return None;
    }

    let node = gm.graph.node(layer)?;
    let [input] = node.args() else {
        return None;
    };
    let dq = gm.graph.node(*input).filter(|n| n.is_dequantize())?;
    let quantized_input = *dq.args().first()?;

    let users = gm.graph.users(layer);
    let &[user] = users.as_slice() else {
        return None;
    };
    let output = gm.graph.node(user)?.quantize_params()?.clone();

    Some(Lowering {
        layer,
        target: target.to_string(),
        quantized_input,
        quantize_out: user,
        output,
    })
}

impl Pass for QRefDqToFbgemm {
    fn name(&self) -> &'static str {
        "q_ref_dq_to_fbgemm"
    }

    fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()> {
        let gm = ctx.gm_mut();

        for (id, target) in layer_nodes(gm) {
            let Some(lowering) = match_pattern(gm, id, &target) else {
                continue;
            };
            if let Some(layer) = gm.layer_mut(&lowering.target) {
                let stage = std::mem::replace(&mut layer.stage, LayerStage::Float);
                if let LayerStage::Reference { weight } = stage {
                    layer.stage = LayerStage::Fbgemm {
                        weight,
                        output: lowering.output,
                    };
                }
            }
            gm.graph.set_args(lowering.layer, vec![lowering.quantized_input])?;
            gm.graph.replace_all_uses_with(lowering.quantize_out, lowering.layer);
            gm.graph.erase_node(lowering.quantize_out)?;
        }
        Ok(())
    }
}
