use crate::error::{Error, Result};
use crate::graph::context::GraphModContext;
use crate::graph::ir::{NodeId, Op};
use crate::module::{LayerStage, Module};
use crate::quant::ObserverConstructor;

use super::{annotated_layer_nodes, layer_qconfig, Pass};

/// Observe the input and output value of every annotated layer
///
/// Observers are built from the layer's qconfig activation constructor. A
/// value gets at most one activation observer. An observer already on the
/// value, either the value itself or one of its users, is reused; with
/// `override_module` on it is replaced by a fresh observer.
pub struct InsertActObserver;

const ACT_PASS: &str = "insert_act_observer";

/// Observer node already sitting on `value`
fn existing_observer(ctx: &GraphModContext<'_>, value: NodeId) -> Result<Option<(NodeId, String)>> {
    let gm = ctx.gm();
    let node = gm.graph.expect_node(value)?;
    if gm.is_observer_node(node) {
        return Ok(node.target().map(|t| (value, t.to_string())));
    }
    Ok(gm
        .graph
        .users(value)
        .into_iter()
        .filter_map(|id| gm.graph.node(id))
        .find(|user| gm.is_observer_node(user) && user.args() == [value])
        .and_then(|user| user.target().map(|t| (user.id(), t.to_string()))))
}

fn ensure_observed(ctx: &mut GraphModContext<'_>, value: NodeId, ctr: &ObserverConstructor) -> Result<NodeId> {
    if let Some((node, target)) = existing_observer(ctx, value)? {
        if ctx.override_module() {
            ctx.gm_mut().insert_submodule(target, Module::observer(ctr.build()));
        }
        return Ok(node);
    }

    let gm = ctx.gm_mut();
    let base = format!("{}_observer", gm.graph.expect_node(value)?.name());
    let target = gm.add_submodule(&base, Module::observer(ctr.build()));
    let observer = gm
        .graph
        .insert_after(value, &target.replace('.', "_"), Op::CallModule { target }, vec![value])
        .map_err(|e| Error::transform(ACT_PASS, e.to_string()))?;
    gm.graph.replace_uses_except(value, observer, observer);
    Ok(observer)
}

impl Pass for InsertActObserver {
    fn name(&self) -> &'static str {
        ACT_PASS
    }

    fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()> {
        for (node, target) in annotated_layer_nodes(ctx.gm()) {
            let Some(qconfig) = layer_qconfig(ctx.gm(), &target) else {
                continue;
            };
            let input = match ctx.gm().graph.expect_node(node)?.args() {
                [input, ..] => *input,
                [] => {
                    return Err(Error::transform(ACT_PASS, format!("layer `{target}` has no input")));
                }
            };
            ensure_observed(ctx, input, &qconfig.activation)?;
            ensure_observed(ctx, node, &qconfig.activation)?;
        }
        Ok(())
    }
}

/// Attach weight (and bias) observers to every annotated float layer
///
/// Constructors come from the layer's qconfig. An existing weight observer
/// is kept unless `override_weight` is on, an existing bias observer unless
/// `override_module` is on. A bias observer is only attached when the
/// qconfig carries a bias constructor and the layer has a bias.
pub struct InsertWObserver;

impl Pass for InsertWObserver {
    fn name(&self) -> &'static str {
        "insert_w_observer"
    }

    fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()> {
        let override_module = ctx.override_module();
        let override_weight = ctx.override_weight();
        let gm = ctx.gm_mut();

        for (_, target) in annotated_layer_nodes(gm) {
            let Some(qconfig) = layer_qconfig(gm, &target) else {
                continue;
            };
            let Some(layer) = gm.layer_mut(&target) else {
                continue;
            };
            if matches!(layer.stage, LayerStage::Reference { .. } | LayerStage::Fbgemm { .. }) {
                continue;
            }
            if layer.weight_observer.is_none() || override_weight {
                layer.weight_observer = Some(layer.observe_weight(&qconfig.weight));
            }
            if let Some(bias_ctr) = &qconfig.bias {
                if layer.bias_observer.is_none() || override_module {
                    layer.bias_observer = layer.observe_bias(bias_ctr);
                }
            }
        }
        Ok(())
    }
}
