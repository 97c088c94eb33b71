use crate::error::{Error, Result};
use crate::graph::context::GraphModContext;
use crate::graph::ir::{Function, Node, NodeId, Op};
use crate::graph::module::GraphModule;
use crate::module::{LayerOp, LayerStage, ModuleKind};

use super::{annotated_layer_nodes, drop_if_unused, Pass};

/// Fuse layer → (batch norm) → relu chains into the head layer
///
/// Supported chains: conv2d → batchnorm2d → relu, conv2d → batchnorm2d,
/// conv2d → relu, linear → relu. Each intermediate value must have exactly
/// one user. Only annotated layers still in float form are fused.
pub struct FuseModules;

const PASS: &str = "fuse_modules";

fn is_relu(gm: &GraphModule, node: &Node) -> bool {
    match node.op() {
        Op::CallFunction(Function::Relu) => true,
        Op::CallModule { target } => gm
            .submodule(target)
            .is_some_and(|m| matches!(m.kind, ModuleKind::ReLU)),
        _ => false,
    }
}

fn is_batch_norm(gm: &GraphModule, node: &Node) -> bool {
    node.target()
        .and_then(|target| gm.submodule(target))
        .is_some_and(|m| matches!(m.kind, ModuleKind::BatchNorm2d(_)))
}

/// Sole consumer of `id`, if it takes `id` as its only input
fn single_user<'g>(gm: &'g GraphModule, id: NodeId) -> Option<&'g Node> {
    match gm.graph.users(id).as_slice() {
        [user] => gm
            .graph
            .node(*user)
            .filter(|node| node.args() == [id]),
        _ => None,
    }
}

/// Nodes to fold into the head, in graph order
fn match_chain(gm: &GraphModule, head: NodeId, op: LayerOp) -> Vec<NodeId> {
    let mut chain = Vec::new();
    let mut last = head;

    if let LayerOp::Conv2d { .. } = op {
        if let Some(bn) = single_user(gm, last).filter(|n| is_batch_norm(gm, n)) {
            chain.push(bn.id());
            last = bn.id();
        }
    }
    if let Some(relu) = single_user(gm, last).filter(|n| is_relu(gm, n)) {
        chain.push(relu.id());
    }
    chain
}

impl Pass for FuseModules {
    fn name(&self) -> &'static str {
        PASS
    }

    fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()> {
        let gm = ctx.gm_mut();

        for (head, target) in annotated_layer_nodes(gm) {
            let Some(layer) = gm.layer(&target) else {
                continue;
            };
            if layer.stage != LayerStage::Float || layer.fused_relu {
                continue;
            }
            let chain = match_chain(gm, head, layer.op);
            let Some(&last) = chain.last() else {
                continue;
            };

            let mut fused = layer.clone();
            let mut dropped = Vec::new();
            for &id in &chain {
                let node = gm.graph.expect_node(id)?;
                if is_relu(gm, node) {
                    fused.fused_relu = true;
                } else if let Some(bn_target) = node.target() {
                    if let Some(ModuleKind::BatchNorm2d(bn)) = gm.submodule(bn_target).map(|m| &m.kind) {
                        fused
                            .fold_batch_norm(bn)
                            .map_err(|msg| Error::transform(PASS, format!("{target}: {msg}")))?;
                    }
                }
                if let Some(t) = node.target() {
                    dropped.push(t.to_string());
                }
            }

            if let Some(module) = gm.submodule_mut(&target) {
                module.kind = ModuleKind::Layer(fused);
            }
            gm.graph.replace_all_uses_with(last, head);
            for &id in chain.iter().rev() {
                gm.graph.erase_node(id)?;
            }
            for t in dropped {
                drop_if_unused(gm, &t);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::passes::test_util::{conv_bn_relu, mlp, trace, types};
    use crate::graph::passes::SetQConfig;
    use crate::module::{BatchNorm2d, Module};
    use approx::assert_abs_diff_eq;
    use ndarray::Array;

    #[test]
    fn test_conv_bn_relu_fused() {
        let mut model = conv_bn_relu();
        if let Some(Module { kind: ModuleKind::BatchNorm2d(bn), .. }) = model.get_mut("bn") {
            bn.weight.fill(2.0);
            bn.eps = 0.0;
        }
        let mut ctx = GraphModContext::new(trace(&model), &model, "", None, types());
        ctx.modify_graph(&[&SetQConfig, &FuseModules]).unwrap();

        let gm = ctx.gm();
        let targets: Vec<&str> = gm.graph.nodes().filter_map(|n| n.target()).collect();
        assert_eq!(targets, vec!["conv"]);
        assert_eq!(gm.submodule_names(), vec!["conv".to_string()]);

        let layer = gm.layer("conv").unwrap();
        assert!(layer.fused_relu);
        assert_abs_diff_eq!(layer.weight[[0, 0, 0, 0]], 0.2, epsilon = 1e-6);
        assert!(layer.bias.is_some());
        assert!(gm.graph.lint().is_ok());
    }

    #[test]
    fn test_linear_relu_fused() {
        let model = mlp();
        let mut ctx = GraphModContext::new(trace(&model), &model, "", None, types());
        ctx.modify_graph(&[&SetQConfig, &FuseModules]).unwrap();

        let gm = ctx.gm();
        assert!(gm.layer("fc1").unwrap().fused_relu);
        assert!(!gm.layer("fc2").unwrap().fused_relu);
        assert!(gm.submodule("relu").is_none());
        let fc2 = gm.graph.find("fc2").unwrap();
        assert_eq!(fc2.args(), &[gm.graph.find("fc1").unwrap().id()]);
    }

    #[test]
    fn test_unannotated_head_not_fused() {
        let model = mlp();
        let mut ctx = GraphModContext::new(trace(&model), &model, "", None, types());
        ctx.modify_graph(&[&FuseModules]).unwrap();
        assert!(ctx.gm().submodule("relu").is_some());
    }

    #[test]
    fn test_branching_value_not_fused() {
        let model = Module::sequential([
            ("conv", Module::conv2d(Array::ones((2, 1, 1, 1)), None, 1, 0)),
            ("bn", Module::batch_norm(BatchNorm2d::new(2))),
        ]);
        let mut gm = trace(&model);
        let conv = gm.graph.find("conv").unwrap().id();
        let out = gm.graph.output_node().unwrap().id();
        // Second consumer of the conv output
        let add = gm
            .graph
            .insert_before(out, "add", Op::CallFunction(Function::Add), vec![conv, conv])
            .unwrap();
        let bn = gm.graph.find("bn").unwrap().id();
        gm.graph.set_args(out, vec![add]).unwrap();
        gm.graph.set_args(add, vec![conv, bn]).unwrap();

        let mut ctx = GraphModContext::new(gm, &model, "", None, types());
        ctx.modify_graph(&[&SetQConfig, &FuseModules]).unwrap();
        assert!(ctx.gm().submodule("bn").is_some());
    }
}
