//! Computation graph IR
//!
//! A [`Graph`] is an ordered list of nodes in topological order. Nodes refer
//! to their inputs by [`NodeId`]; users are derived on demand. Graphs are
//! small (one node per module call), so every query is a linear scan.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, Result};
use crate::quant::QParams;

/// Stable node handle, never reused within a graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Free function called by a graph node
#[derive(Clone, Debug, PartialEq)]
pub enum Function {
    /// f32 → integer domain with the given parameters
    Quantize(QParams),
    /// Integer domain → f32, parameters come from the producer
    Dequantize,
    Add,
    Relu,
    Flatten,
}

impl Function {
    pub fn name(&self) -> &'static str {
        match self {
            Function::Quantize(_) => "quantize",
            Function::Dequantize => "dequantize",
            Function::Add => "add",
            Function::Relu => "relu",
            Function::Flatten => "flatten",
        }
    }
}

/// Node operation
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Graph input
    Placeholder,
    /// Call a submodule of the owning graph module by qualified name
    CallModule { target: String },
    CallFunction(Function),
    /// Graph result, exactly one per graph
    Output,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    id: NodeId,
    name: String,
    op: Op,
    args: Vec<NodeId>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn args(&self) -> &[NodeId] {
        &self.args
    }

    /// Submodule target for `CallModule` nodes
    pub fn target(&self) -> Option<&str> {
        match &self.op {
            Op::CallModule { target } => Some(target),
            _ => None,
        }
    }

    pub fn function(&self) -> Option<&Function> {
        match &self.op {
            Op::CallFunction(func) => Some(func),
            _ => None,
        }
    }

    /// Quantization parameters of a `Quantize` node
    pub fn quantize_params(&self) -> Option<&QParams> {
        match &self.op {
            Op::CallFunction(Function::Quantize(params)) => Some(params),
            _ => None,
        }
    }

    pub fn is_dequantize(&self) -> bool {
        matches!(self.op, Op::CallFunction(Function::Dequantize))
    }
}

/// Ordered computation graph
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
    next_id: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in execution order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node lookup that reports a missing node as a graph error
    pub fn expect_node(&self, id: NodeId) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| Error::Graph(format!("node {id} is not in the graph")))
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn output_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.op == Op::Output)
    }

    /// `base`, or `base_N` for the first free N
    pub fn unique_name(&self, base: &str) -> String {
        if self.find(base).is_none() {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|candidate| self.find(candidate).is_none())
            .unwrap_or_else(|| base.to_string())
    }

    fn make_node(&mut self, name: &str, op: Op, args: Vec<NodeId>) -> Node {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        Node {
            id,
            name: self.unique_name(name),
            op,
            args,
        }
    }

    fn push(&mut self, name: &str, op: Op, args: Vec<NodeId>) -> NodeId {
        let node = self.make_node(name, op, args);
        let id = node.id;
        self.nodes.push(node);
        id
    }

    pub fn placeholder(&mut self, name: &str) -> NodeId {
        self.push(name, Op::Placeholder, Vec::new())
    }

    pub fn call_module(&mut self, name: &str, target: &str, args: Vec<NodeId>) -> NodeId {
        self.push(
            name,
            Op::CallModule {
                target: target.to_string(),
            },
            args,
        )
    }

    pub fn call_function(&mut self, name: &str, func: Function, args: Vec<NodeId>) -> NodeId {
        self.push(name, Op::CallFunction(func), args)
    }

    pub fn output(&mut self, arg: NodeId) -> NodeId {
        self.push("output", Op::Output, vec![arg])
    }

    /// Insert a node directly after `anchor`
    pub fn insert_after(&mut self, anchor: NodeId, name: &str, op: Op, args: Vec<NodeId>) -> Result<NodeId> {
        let pos = self
            .position(anchor)
            .ok_or_else(|| Error::Graph(format!("anchor {anchor} is not in the graph")))?;
        let node = self.make_node(name, op, args);
        let id = node.id;
        self.nodes.insert(pos + 1, node);
        Ok(id)
    }

    /// Insert a node directly before `anchor`
    pub fn insert_before(&mut self, anchor: NodeId, name: &str, op: Op, args: Vec<NodeId>) -> Result<NodeId> {
        let pos = self
            .position(anchor)
            .ok_or_else(|| Error::Graph(format!("anchor {anchor} is not in the graph")))?;
        let node = self.make_node(name, op, args);
        let id = node.id;
        self.nodes.insert(pos, node);
        Ok(id)
    }

    pub fn set_args(&mut self, id: NodeId, args: Vec<NodeId>) -> Result<()> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::Graph(format!("node {id} is not in the graph")))?;
        node.args = args;
        Ok(())
    }

    /// Nodes consuming `id`, in execution order
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.args.contains(&id))
            .map(|n| n.id)
            .collect()
    }

    /// Rewire every use of `old` to `new`, returns the number of rewired nodes
    pub fn replace_all_uses_with(&mut self, old: NodeId, new: NodeId) -> usize {
        self.replace_uses(old, new, None)
    }

    /// Like [`Graph::replace_all_uses_with`] but leaves `except` untouched
    pub fn replace_uses_except(&mut self, old: NodeId, new: NodeId, except: NodeId) -> usize {
        self.replace_uses(old, new, Some(except))
    }

    fn replace_uses(&mut self, old: NodeId, new: NodeId, except: Option<NodeId>) -> usize {
        let mut rewired = 0;
        for node in self.nodes.iter_mut() {
            if Some(node.id) == except || !node.args.contains(&old) {
                continue;
            }
            for arg in node.args.iter_mut().filter(|a| **a == old) {
                *arg = new;
            }
            rewired += 1;
        }
        rewired
    }

    /// Remove a node that has no users
    pub fn erase_node(&mut self, id: NodeId) -> Result<Node> {
        let users = self.users(id);
        if !users.is_empty() {
            return Err(Error::Graph(format!(
                "cannot erase node {id}: still used by {} node(s)",
                users.len()
            )));
        }
        let pos = self
            .position(id)
            .ok_or_else(|| Error::Graph(format!("node {id} is not in the graph")))?;
        Ok(self.nodes.remove(pos))
    }

    /// Remove call nodes whose results are never used
    pub fn eliminate_dead_code(&mut self) -> usize {
        let mut removed = 0;
        loop {
            let dead: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|n| matches!(n.op, Op::CallModule { .. } | Op::CallFunction(_)))
                .filter(|n| self.users(n.id).is_empty())
                .map(|n| n.id)
                .collect();
            if dead.is_empty() {
                return removed;
            }
            removed += dead.len();
            self.nodes.retain(|n| !dead.contains(&n.id));
        }
    }

    /// Every submodule target referenced by a `CallModule` node
    pub fn targets(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter_map(|n| n.target().map(str::to_string))
            .collect()
    }

    /// Number of `CallModule` nodes calling `target`
    pub fn call_count(&self, target: &str) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.target() == Some(target))
            .count()
    }

    /// Check topological order and the single-output invariant
    pub fn lint(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if let Some(arg) = node.args.iter().find(|a| !seen.contains(*a)) {
                return Err(Error::Graph(format!(
                    "node `{}` uses {arg} before it is defined",
                    node.name
                )));
            }
            seen.insert(node.id);
        }
        let outputs = self.nodes.iter().filter(|n| n.op == Op::Output).count();
        if outputs != 1 {
            return Err(Error::Graph(format!("expected one output node, found {outputs}")));
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            let args: Vec<String> = node
                .args
                .iter()
                .map(|a| {
                    self.node(*a)
                        .map(|n| format!("%{}", n.name))
                        .unwrap_or_else(|| a.to_string())
                })
                .collect();
            let args = args.join(", ");
            match &node.op {
                Op::Placeholder => writeln!(f, "%{} = placeholder", node.name)?,
                Op::CallModule { target } => {
                    writeln!(f, "%{} = call_module[{target}]({args})", node.name)?
                }
                Op::CallFunction(func) => {
                    writeln!(f, "%{} = {}({args})", node.name, func.name())?
                }
                Op::Output => writeln!(f, "return {args}")?,
            }
        }
        Ok(())
    }
}
