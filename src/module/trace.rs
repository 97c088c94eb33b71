//! Tracing modules into graphs and splicing results back

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::graph::{Graph, GraphModule, NodeId, Op};

use super::{join_path, Module, ModuleFilter, ModuleKind};

/// Converts a module into a graph module
pub trait Tracer {
    fn trace(&self, module: &Module) -> Result<GraphModule>;
}

/// Tracer for feed-forward models
///
/// Flattens `Sequential` containers into a chain of module calls and
/// inlines graph modules found inside them. A graph module at the root is
/// returned as is, so transformed models can be traced again.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequentialTracer;

impl SequentialTracer {
    fn trace_into(
        &self,
        module: &Module,
        prefix: &str,
        input: NodeId,
        graph: &mut Graph,
        submodules: &mut BTreeMap<String, Module>,
    ) -> Result<NodeId> {
        match &module.kind {
            ModuleKind::Sequential(children) => {
                let mut value = input;
                for (name, child) in children {
                    value = self.trace_into(child, &join_path(prefix, name), value, graph, submodules)?;
                }
                Ok(value)
            }
            ModuleKind::Graph(inner) => inline_graph(inner, prefix, input, graph, submodules),
            _ => {
                let target = if prefix.is_empty() {
                    module.kind_name().to_string()
                } else {
                    prefix.to_string()
                };
                let node = graph.call_module(&target.replace('.', "_"), &target, vec![input]);
                submodules.insert(target, module.clone());
                Ok(node)
            }
        }
    }
}

fn inline_graph(
    inner: &GraphModule,
    prefix: &str,
    input: NodeId,
    graph: &mut Graph,
    submodules: &mut BTreeMap<String, Module>,
) -> Result<NodeId> {
    let mut mapped: HashMap<NodeId, NodeId> = HashMap::new();
    let mut result = None;

    for node in inner.graph.nodes() {
        let args = node
            .args()
            .iter()
            .map(|arg| {
                mapped
                    .get(arg)
                    .copied()
                    .ok_or_else(|| Error::Trace(format!("graph `{prefix}` uses {arg} before definition")))
            })
            .collect::<Result<Vec<_>>>()?;
        let name = join_path(prefix, node.name()).replace('.', "_");

        let id = match node.op() {
            Op::Placeholder => input,
            Op::CallModule { target } => {
                let qualified = join_path(prefix, target);
                let module = inner
                    .submodule(target)
                    .ok_or_else(|| Error::Trace(format!("graph `{prefix}` calls missing submodule `{target}`")))?;
                submodules.insert(qualified.clone(), module.clone());
                graph.call_module(&name, &qualified, args)
            }
            Op::CallFunction(func) => graph.call_function(&name, func.clone(), args),
            Op::Output => {
                result = args.first().copied();
                continue;
            }
        };
        mapped.insert(node.id(), id);
    }

    result.ok_or_else(|| Error::Trace(format!("graph `{prefix}` has no output")))
}

impl Tracer for SequentialTracer {
    fn trace(&self, module: &Module) -> Result<GraphModule> {
        if let ModuleKind::Graph(gm) = &module.kind {
            return Ok(gm.clone());
        }

        let mut graph = Graph::new();
        let mut submodules = BTreeMap::new();
        let input = graph.placeholder("x");
        let result = self.trace_into(module, "", input, &mut graph, &mut submodules)?;
        graph.output(result);
        Ok(GraphModule::new(graph, submodules))
    }
}

/// Traced submodules keyed by path, in discovery order
#[derive(Clone, Debug, Default)]
pub struct TraceMapping {
    entries: Vec<(String, GraphModule)>,
}

impl TraceMapping {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&GraphModule> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, gm)| gm)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &GraphModule)> {
        self.entries.iter().map(|(name, gm)| (name.as_str(), gm))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut GraphModule)> {
        self.entries.iter_mut().map(|(name, gm)| (name.as_str(), gm))
    }
}

/// Trace every filtered root submodule of `model`
///
/// Roots are the filter's include names in pre-order, skipping names nested
/// in an earlier root; without include names the whole model is the single
/// root `""`.
pub fn trace_module(model: &Module, filter: Option<&ModuleFilter>, tracer: &dyn Tracer) -> Result<TraceMapping> {
    let include = filter.map(|f| f.include_names.as_slice()).unwrap_or(&[]);

    let roots: Vec<String> = if include.is_empty() || include.iter().any(String::is_empty) {
        vec![String::new()]
    } else {
        if let Some(missing) = include.iter().find(|name| model.get(name).is_none()) {
            return Err(Error::Trace(format!("no submodule named `{missing}`")));
        }
        let mut roots: Vec<String> = Vec::new();
        for (path, _) in model.named_modules() {
            let nested = roots
                .iter()
                .any(|root| path.starts_with(root.as_str()) && path[root.len()..].starts_with('.'));
            if include.contains(&path) && !nested {
                roots.push(path);
            }
        }
        roots
    };

    let entries = roots
        .into_iter()
        .map(|root| {
            let module = model
                .get(&root)
                .ok_or_else(|| Error::Trace(format!("no submodule named `{root}`")))?;
            let gm = tracer.trace(module)?;
            Ok((root, gm))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TraceMapping { entries })
}

/// Copy of `model` with every traced submodule replaced by its graph module
pub fn copy_and_replace(model: &Module, mapping: TraceMapping) -> Result<Module> {
    let mut copy = model.clone();
    for (name, gm) in mapping.entries {
        copy.replace(&name, Module::graph(gm))
            .ok_or_else(|| Error::Trace(format!("no submodule named `{name}` to replace")))?;
    }
    Ok(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Function;
    use ndarray::Array;

    fn model() -> Module {
        Module::sequential([
            (
                "block",
                Module::sequential([
                    ("fc", Module::linear(Array::ones((4, 4)), None)),
                    ("relu", Module::relu()),
                ]),
            ),
            ("head", Module::linear(Array::ones((2, 4)), None)),
        ])
    }

    #[test]
    fn test_trace_flattens_sequential() {
        let gm = SequentialTracer.trace(&model()).unwrap();
        let targets: Vec<&str> = gm.graph.nodes().filter_map(|n| n.target()).collect();
        assert_eq!(targets, vec!["block.fc", "block.relu", "head"]);
        assert!(gm.graph.find("block_fc").is_some());
        assert!(gm.graph.lint().is_ok());
    }

    #[test]
    fn test_trace_leaf_root() {
        let gm = SequentialTracer.trace(&Module::linear(Array::ones((2, 2)), None)).unwrap();
        assert!(gm.layer("linear").is_some());
    }

    #[test]
    fn test_retrace_inlines_nested_graph() {
        let mut inner = SequentialTracer.trace(&model()).unwrap();
        let fc = inner.graph.find("block_fc").unwrap().id();
        let relu = inner
            .graph
            .insert_after(fc, "extra_relu", Op::CallFunction(Function::Relu), vec![fc])
            .unwrap();
        inner.graph.replace_uses_except(fc, relu, relu);

        let outer = Module::sequential([("body", Module::graph(inner)), ("tail", Module::relu())]);
        let gm = SequentialTracer.trace(&outer).unwrap();

        assert!(gm.layer("body.block.fc").is_some());
        assert!(gm.graph.find("body_extra_relu").is_some());
        assert!(gm.graph.lint().is_ok());
    }

    #[test]
    fn test_trace_module_roots() {
        let model = model();
        let mapping = trace_module(&model, None, &SequentialTracer).unwrap();
        assert_eq!(mapping.names(), vec![""]);

        let filter = ModuleFilter::new().include_names(["head", "block", "block.fc"]);
        let mapping = trace_module(&model, Some(&filter), &SequentialTracer).unwrap();
        assert_eq!(mapping.names(), vec!["block", "head"]);
    }

    #[test]
    fn test_trace_module_unknown_name() {
        let filter = ModuleFilter::new().include_names(["nope"]);
        let err = trace_module(&model(), Some(&filter), &SequentialTracer).unwrap_err();
        assert!(matches!(err, Error::Trace(_)));
    }

    #[test]
    fn test_copy_and_replace() {
        let model = model();
        let filter = ModuleFilter::new().include_names(["block"]);
        let mapping = trace_module(&model, Some(&filter), &SequentialTracer).unwrap();

        let copy = copy_and_replace(&model, mapping).unwrap();
        assert_eq!(copy.get("block").map(Module::kind_name), Some("graph"));
        assert_eq!(copy.get("block.fc").map(Module::kind_name), Some("linear"));
        assert_eq!(model.get("block").map(Module::kind_name), Some("sequential"));
    }
}
