use crate::error::{Error, Result};
use crate::graph::context::GraphModContext;
use crate::graph::ir::{Function, NodeId, Op};
use crate::graph::module::GraphModule;
use crate::module::LayerStage;
use crate::quant::QParams;

use super::{drop_if_unused, Pass};

/// Replace every activation observer node with a quantize/dequantize pair
///
/// The quantize node carries the observer's current parameters.
pub struct ObserverToQdq;

const QDQ_PASS: &str = "observer_to_qdq";

impl Pass for ObserverToQdq {
    fn name(&self) -> &'static str {
        QDQ_PASS
    }

    fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()> {
        let gm = ctx.gm_mut();
        let observers: Vec<(NodeId, String)> = gm
            .graph
            .nodes()
            .filter(|node| gm.is_observer_node(node))
            .filter_map(|node| node.target().map(|t| (node.id(), t.to_string())))
            .collect();

        for (id, target) in observers {
            let params = gm
                .observer(&target)
                .map(|observer| observer.qparams())
                .ok_or_else(|| Error::transform(QDQ_PASS, format!("`{target}` is not an observer")))?;
            let node = gm.graph.expect_node(id)?;
            let (name, args) = (node.name().to_string(), node.args().to_vec());

            let q = gm.graph.insert_after(
                id,
                &format!("{name}_quantize"),
                Op::CallFunction(Function::Quantize(params)),
                args,
            )?;
            let dq = gm.graph.insert_after(
                q,
                &format!("{name}_dequantize"),
                Op::CallFunction(Function::Dequantize),
                vec![q],
            )?;
            gm.graph.replace_all_uses_with(id, dq);
            gm.graph.erase_node(id)?;
            drop_if_unused(gm, &target);
        }
        Ok(())
    }
}

/// Drop quantize/dequantize round trips left behind by lowering
///
/// `quantize(p)` fed by a `dequantize` whose source already produces values
/// quantized with `p` is bypassed; quantize/dequantize nodes without users
/// are then erased.
pub struct FoldQdq;

/// Parameters of the quantized value a node produces, if any
fn produced_params<'g>(gm: &'g GraphModule, id: NodeId) -> Option<&'g QParams> {
    let node = gm.graph.node(id)?;
    if let Some(params) = node.quantize_params() {
        return Some(params);
    }
    match &gm.layer(node.target()?)?.stage {
        LayerStage::Fbgemm { output, .. } => Some(output),
        _ => None,
    }
}

fn redundant_quantizes(gm: &GraphModule) -> Vec<(NodeId, NodeId)> {
    gm.graph
        .nodes()
        .filter_map(|node| {
            let params = node.quantize_params()?;
            let dq = gm.graph.node(*node.args().first()?)?;
            if !dq.is_dequantize() {
                return None;
            }
            let source = *dq.args().first()?;
            (produced_params(gm, source)? == params).then_some((node.id(), source))
        })
        .collect()
}

fn dead_qdq_nodes(gm: &GraphModule) -> Vec<NodeId> {
    gm.graph
        .nodes()
        .filter(|node| node.quantize_params().is_some() || node.is_dequantize())
        .filter(|node| gm.graph.users(node.id()).is_empty())
        .map(|node| node.id())
        .collect()
}

impl Pass for FoldQdq {
    fn name(&self) -> &'static str {
        "fold_qdq"
    }

    fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()> {
        let gm = ctx.gm_mut();

        for (q, source) in redundant_quantizes(gm) {
            gm.graph.replace_all_uses_with(q, source);
        }
        loop {
            let dead = dead_qdq_nodes(gm);
            if dead.is_empty() {
                return Ok(());
            }
            for id in dead {
                gm.graph.erase_node(id)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::passes::test_util::{linear_model, mlp, trace, types};
    use crate::graph::passes::{InsertActObserver, SetQConfig};
    use crate::quant::{QDType, QScheme};

    fn function_names(gm: &GraphModule) -> Vec<String> {
        gm.graph
            .nodes()
            .map(|n| match n.op() {
                Op::Placeholder => "placeholder".to_string(),
                Op::CallModule { target } => target.clone(),
                Op::CallFunction(func) => func.name().to_string(),
                Op::Output => "output".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_observers_become_qdq_pairs() {
        let model = linear_model();
        let mut ctx = GraphModContext::new(trace(&model), &model, "", None, types());
        ctx.modify_graph(&[&SetQConfig, &InsertActObserver, &ObserverToQdq])
            .unwrap();

        let gm = ctx.gm();
        assert_eq!(
            function_names(gm),
            vec!["placeholder", "quantize", "dequantize", "fc", "quantize", "dequantize", "output"]
        );
        assert!(gm.observer("x_observer").is_none());
        assert!(gm.graph.lint().is_ok());
    }

    #[test]
    fn test_qdq_carries_observer_params() {
        let model = linear_model();
        let mut ctx = GraphModContext::new(trace(&model), &model, "", None, types());
        ctx.modify_graph(&[&SetQConfig, &InsertActObserver]).unwrap();
        if let Some(observer) = ctx
            .gm_mut()
            .submodule_mut("x_observer")
            .and_then(crate::module::Module::as_observer_mut)
        {
            observer.observe(&[0.0, 2.55]);
        }
        ctx.modify_graph(&[&ObserverToQdq]).unwrap();

        let q = ctx.gm().graph.find("x_observer_quantize").unwrap();
        let params = q.quantize_params().unwrap();
        assert_eq!(params.dtype, QDType::QUInt8);
        assert!((params.scales[0] - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_fold_bypasses_matching_roundtrip() {
        let model = mlp();
        let mut gm = trace(&model);
        let x = gm.graph.find("x").unwrap().id();
        let fc1 = gm.graph.find("fc1").unwrap().id();
        let params = QParams::per_tensor(0.1, 0, QDType::QInt8, QScheme::PerTensorSymmetric);

        let q1 = gm
            .graph
            .insert_after(x, "q1", Op::CallFunction(Function::Quantize(params.clone())), vec![x])
            .unwrap();
        let dq = gm
            .graph
            .insert_after(q1, "dq", Op::CallFunction(Function::Dequantize), vec![q1])
            .unwrap();
        let q2 = gm
            .graph
            .insert_after(dq, "q2", Op::CallFunction(Function::Quantize(params)), vec![dq])
            .unwrap();
        gm.graph.set_args(fc1, vec![q2]).unwrap();

        let mut ctx = GraphModContext::new(gm, &model, "", None, types());
        ctx.modify_graph(&[&FoldQdq]).unwrap();

        let gm = ctx.gm();
        assert!(gm.graph.find("q2").is_none());
        assert!(gm.graph.find("dq").is_none());
        assert_eq!(gm.graph.find("fc1").unwrap().args(), &[q1]);
    }

    #[test]
    fn test_fold_keeps_requantization() {
        let model = mlp();
        let mut gm = trace(&model);
        let x = gm.graph.find("x").unwrap().id();
        let fc1 = gm.graph.find("fc1").unwrap().id();
        let p1 = QParams::per_tensor(0.1, 0, QDType::QInt8, QScheme::PerTensorSymmetric);
        let p2 = QParams::per_tensor(0.2, 0, QDType::QInt8, QScheme::PerTensorSymmetric);

        let q1 = gm
            .graph
            .insert_after(x, "q1", Op::CallFunction(Function::Quantize(p1)), vec![x])
            .unwrap();
        let dq = gm
            .graph
            .insert_after(q1, "dq", Op::CallFunction(Function::Dequantize), vec![q1])
            .unwrap();
        let q2 = gm
            .graph
            .insert_after(dq, "q2", Op::CallFunction(Function::Quantize(p2)), vec![dq])
            .unwrap();
        gm.graph.set_args(fc1, vec![q2]).unwrap();

        let mut ctx = GraphModContext::new(gm, &model, "", None, types());
        ctx.modify_graph(&[&FoldQdq]).unwrap();
        assert!(ctx.gm().graph.find("q2").is_some());
    }
}
