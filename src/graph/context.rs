//! Per-submodule transform context

use std::fmt;

use tracing::debug;

use crate::config::ObserverTypes;
use crate::error::Result;
use crate::module::{join_path, Module, ModuleFilter};

use super::module::GraphModule;
use super::passes::Pass;

/// Ordered passes run with one observer-types snapshot
#[derive(Clone)]
pub struct PassPhase {
    pub name: &'static str,
    pub observers: ObserverTypes,
    pub override_module: bool,
    pub override_weight: bool,
    pub override_qconfig: bool,
    pub passes: &'static [&'static dyn Pass],
}

impl PassPhase {
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }
}

impl fmt::Debug for PassPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassPhase")
            .field("name", &self.name)
            .field("override_module", &self.override_module)
            .field("override_weight", &self.override_weight)
            .field("override_qconfig", &self.override_qconfig)
            .field("passes", &self.pass_names())
            .finish()
    }
}

/// Mutable state shared by the passes run on one traced submodule
///
/// Owns the graph module for the duration of the run. `root` is the model
/// the submodule was traced from and is only read, to resolve the original
/// module behind a call target. `override_weight` governs weight observers
/// separately from the other observers, so a phase can swap activation
/// observers while keeping trained weights. Passes are not transactional: on error the
/// graph module may be partially rewritten and the context must be dropped.
pub struct GraphModContext<'a> {
    gm: GraphModule,
    root: &'a Module,
    prefix: String,
    filter: Option<&'a ModuleFilter>,
    observers: ObserverTypes,
    override_module: bool,
    override_weight: bool,
    override_qconfig: bool,
}

impl<'a> GraphModContext<'a> {
    /// Context over `gm`, traced from `root` at path `prefix`
    pub fn new(
        gm: GraphModule,
        root: &'a Module,
        prefix: impl Into<String>,
        filter: Option<&'a ModuleFilter>,
        observers: ObserverTypes,
    ) -> Self {
        Self {
            gm,
            root,
            prefix: prefix.into(),
            filter,
            observers,
            override_module: true,
            override_weight: true,
            override_qconfig: true,
        }
    }

    pub fn with_overrides(mut self, override_module: bool, override_qconfig: bool) -> Self {
        self.override_module = override_module;
        self.override_weight = override_module;
        self.override_qconfig = override_qconfig;
        self
    }

    pub fn with_weight_override(mut self, override_weight: bool) -> Self {
        self.override_weight = override_weight;
        self
    }

    pub fn gm(&self) -> &GraphModule {
        &self.gm
    }

    pub fn gm_mut(&mut self) -> &mut GraphModule {
        &mut self.gm
    }

    pub fn root(&self) -> &Module {
        self.root
    }

    pub fn observers(&self) -> &ObserverTypes {
        &self.observers
    }

    pub fn override_module(&self) -> bool {
        self.override_module
    }

    pub fn override_weight(&self) -> bool {
        self.override_weight
    }

    pub fn override_qconfig(&self) -> bool {
        self.override_qconfig
    }

    /// Path of a call target within the root model
    pub fn qualified_name(&self, target: &str) -> String {
        join_path(&self.prefix, target)
    }

    /// Module in the root model a call target was traced from
    pub fn original(&self, target: &str) -> Option<&'a Module> {
        self.root.get(&self.qualified_name(target))
    }

    /// Whether the filter lets a call target take part
    ///
    /// Matches against the target's full path in the root model and the kind
    /// of the module it was traced from.
    pub fn is_included(&self, target: &str) -> bool {
        let Some(filter) = self.filter else {
            return true;
        };
        let kind = self
            .original(target)
            .or_else(|| self.gm.submodule(target))
            .map(Module::kind_name)
            .unwrap_or_default();
        filter.matches(&self.qualified_name(target), kind)
    }

    /// Apply passes in order; the first failure aborts the rest
    pub fn modify_graph(&mut self, passes: &[&dyn Pass]) -> Result<()> {
        for pass in passes {
            debug!(pass = pass.name(), submodule = %self.prefix, "applying pass");
            pass.apply(self)?;
        }
        Ok(())
    }

    /// Install a phase's observer types and flags, then run its passes
    pub fn run_phase(&mut self, phase: &PassPhase) -> Result<()> {
        debug!(phase = phase.name, submodule = %self.prefix, "entering phase");
        self.observers = phase.observers.clone();
        self.override_module = phase.override_module;
        self.override_weight = phase.override_weight;
        self.override_qconfig = phase.override_qconfig;
        self.modify_graph(phase.passes)
    }

    pub fn into_graph_module(self) -> GraphModule {
        self.gm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::module::{SequentialTracer, Tracer};
    use crate::quant::{ObserverConstructor, ObserverKind};
    use ndarray::Array;

    struct Record;
    struct Fail;

    impl Pass for Record {
        fn name(&self) -> &'static str {
            "record"
        }

        fn apply(&self, ctx: &mut GraphModContext<'_>) -> Result<()> {
            let name = ctx.gm().submodule_names().len().to_string();
            ctx.gm_mut().add_submodule(&name, Module::identity());
            Ok(())
        }
    }

    impl Pass for Fail {
        fn name(&self) -> &'static str {
            "fail"
        }

        fn apply(&self, _ctx: &mut GraphModContext<'_>) -> Result<()> {
            Err(Error::transform("fail", "always fails"))
        }
    }

    fn types(kind: ObserverKind) -> ObserverTypes {
        ObserverTypes::new(ObserverConstructor::new(kind), ObserverConstructor::new(kind))
    }

    fn model() -> Module {
        Module::sequential([
            ("fc", Module::linear(Array::ones((2, 2)), None)),
            ("relu", Module::relu()),
        ])
    }

    #[test]
    fn test_passes_see_earlier_mutations() {
        let model = model();
        let gm = SequentialTracer.trace(&model).unwrap();
        let mut ctx = GraphModContext::new(gm, &model, "", None, types(ObserverKind::MinMax));

        ctx.modify_graph(&[&Record, &Record]).unwrap();
        // fc, relu, then "2" and "3"
        assert!(ctx.gm().submodule("2").is_some());
        assert!(ctx.gm().submodule("3").is_some());
    }

    #[test]
    fn test_failure_aborts_without_rollback() {
        let model = model();
        let gm = SequentialTracer.trace(&model).unwrap();
        let mut ctx = GraphModContext::new(gm, &model, "", None, types(ObserverKind::MinMax));

        let err = ctx.modify_graph(&[&Record, &Fail, &Record]).unwrap_err();
        assert!(matches!(err, Error::Transform { pass: "fail", .. }));
        assert_eq!(ctx.gm().submodule_names().len(), 3);
    }

    #[test]
    fn test_run_phase_installs_snapshot() {
        const PASSES: &[&dyn Pass] = &[&Record];
        let model = model();
        let gm = SequentialTracer.trace(&model).unwrap();
        let mut ctx = GraphModContext::new(gm, &model, "", None, types(ObserverKind::MinMax));

        let phase = PassPhase {
            name: "qat",
            observers: types(ObserverKind::Lsq),
            override_module: true,
            override_weight: false,
            override_qconfig: true,
            passes: PASSES,
        };
        ctx.run_phase(&phase).unwrap();

        assert_eq!(ctx.observers().activation.kind, ObserverKind::Lsq);
        assert!(ctx.override_module());
        assert!(!ctx.override_weight());
        assert!(ctx.override_qconfig());
    }

    #[test]
    fn test_is_included_uses_full_path() {
        let model = Module::sequential([("block", model())]);
        let filter = ModuleFilter::new().exclude_names(["block.fc"]);
        let gm = SequentialTracer.trace(model.get("block").unwrap()).unwrap();
        let ctx = GraphModContext::new(gm, &model, "block", Some(&filter), types(ObserverKind::MinMax));

        assert_eq!(ctx.qualified_name("fc"), "block.fc");
        assert!(!ctx.is_included("fc"));
        assert!(ctx.is_included("relu"));
        assert_eq!(ctx.original("fc").map(Module::kind_name), Some("linear"));
    }

    #[test]
    fn test_module_override_carries_weight_unless_split() {
        let model = model();
        let gm = SequentialTracer.trace(&model).unwrap();
        let ctx = GraphModContext::new(gm, &model, "", None, types(ObserverKind::MinMax))
            .with_overrides(false, true);
        assert!(!ctx.override_weight());

        let ctx = ctx.with_overrides(true, true).with_weight_override(false);
        assert!(ctx.override_module());
        assert!(!ctx.override_weight());
    }
}
