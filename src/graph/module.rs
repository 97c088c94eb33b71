//! Graph module: a graph plus the submodules its nodes call

use std::collections::BTreeMap;

use crate::module::{Layer, Module};
use crate::quant::Observer;

use super::ir::{Graph, Node};

/// Traced module
///
/// Submodules are held flat, keyed by the qualified target name used by
/// `CallModule` nodes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphModule {
    pub graph: Graph,
    submodules: BTreeMap<String, Module>,
}

impl GraphModule {
    pub fn new(graph: Graph, submodules: BTreeMap<String, Module>) -> Self {
        Self { graph, submodules }
    }

    pub fn submodule(&self, target: &str) -> Option<&Module> {
        self.submodules.get(target)
    }

    pub fn submodule_mut(&mut self, target: &str) -> Option<&mut Module> {
        self.submodules.get_mut(target)
    }

    pub fn submodules(&self) -> impl Iterator<Item = (&String, &Module)> {
        self.submodules.iter()
    }

    pub fn submodules_mut(&mut self) -> impl Iterator<Item = &mut Module> {
        self.submodules.values_mut()
    }

    pub fn submodule_names(&self) -> Vec<String> {
        self.submodules.keys().cloned().collect()
    }

    /// Insert or replace the submodule at `target`
    pub fn insert_submodule(&mut self, target: impl Into<String>, module: Module) -> Option<Module> {
        self.submodules.insert(target.into(), module)
    }

    /// Register a new submodule under a free name derived from `base`
    pub fn add_submodule(&mut self, base: &str, module: Module) -> String {
        let name = if self.submodules.contains_key(base) {
            (1..)
                .map(|i| format!("{base}_{i}"))
                .find(|candidate| !self.submodules.contains_key(candidate))
                .unwrap_or_else(|| base.to_string())
        } else {
            base.to_string()
        };
        self.submodules.insert(name.clone(), module);
        name
    }

    pub fn remove_submodule(&mut self, target: &str) -> Option<Module> {
        self.submodules.remove(target)
    }

    pub fn layer(&self, target: &str) -> Option<&Layer> {
        self.submodule(target).and_then(Module::as_layer)
    }

    pub fn layer_mut(&mut self, target: &str) -> Option<&mut Layer> {
        self.submodule_mut(target).and_then(Module::as_layer_mut)
    }

    pub fn observer(&self, target: &str) -> Option<&Observer> {
        self.submodule(target).and_then(Module::as_observer)
    }

    /// Node calls an observer submodule
    pub fn is_observer_node(&self, node: &Node) -> bool {
        node.target()
            .and_then(|target| self.observer(target))
            .is_some()
    }

    /// Node calls a quantizable layer
    pub fn is_layer_node(&self, node: &Node) -> bool {
        node.target()
            .and_then(|target| self.layer(target))
            .is_some()
    }

    /// Drop submodules no node calls any more
    pub fn delete_all_unused_submodules(&mut self) -> Vec<String> {
        let used = self.graph.targets();
        let unused: Vec<String> = self
            .submodules
            .keys()
            .filter(|name| !used.contains(*name))
            .cloned()
            .collect();
        for name in &unused {
            self.submodules.remove(name);
        }
        unused
    }

    /// Set observe/fake-quant mode on every observer this module holds
    pub fn toggle_observers(&mut self, observe: bool, fake_quant: bool) {
        for module in self.submodules.values_mut() {
            module.set_observer_mode(observe, fake_quant);
        }
    }
}
