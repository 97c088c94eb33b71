//! Stage pipelines: which passes run, in what order, per backend

use std::fmt;

use crate::config::ObserverTypes;
use crate::graph::passes::{
    FoldQdq, FuseModules, InsertActObserver, InsertWObserver, ObserverToQdq, QRefDqToFbgemm,
    QuantizableModuleToAmp, QuantizableModuleToObserved, QuantizableModuleToRef, SetQConfig,
};
use crate::graph::{Pass, PassPhase};
use crate::registry::Backend;

pub const CALIB_DISC: &[&dyn Pass] = &[&SetQConfig, &InsertActObserver];

pub const CALIB: &[&dyn Pass] = &[&SetQConfig, &FuseModules, &InsertActObserver];

pub const AMP_DISC: &[&dyn Pass] = &[&SetQConfig, &InsertWObserver, &QuantizableModuleToAmp];

pub const AMP: &[&dyn Pass] = &[
    &SetQConfig,
    &FuseModules,
    &InsertWObserver,
    &QuantizableModuleToAmp,
];

pub const QAT_DISC: &[&dyn Pass] = &[
    &SetQConfig,
    &InsertActObserver,
    &InsertWObserver,
    &QuantizableModuleToObserved,
];

/// Weight observers from post-training constructors
pub const QAT_PTQ: &[&dyn Pass] = &[&SetQConfig, &FuseModules, &InsertWObserver];

/// Re-annotated with QAT constructors; weight observers stay frozen
pub const QAT_QAT: &[&dyn Pass] = &[
    &SetQConfig,
    &InsertActObserver,
    &InsertWObserver,
    &QuantizableModuleToObserved,
];

pub const QUANT_DISC: &[&dyn Pass] = &[
    &SetQConfig,
    &InsertActObserver,
    &InsertWObserver,
    &QuantizableModuleToObserved,
];

pub const QUANT_REF: &[&dyn Pass] = &[
    &SetQConfig,
    &FuseModules,
    &InsertActObserver,
    &ObserverToQdq,
    &QuantizableModuleToRef,
];

pub const QUANT_FBGEMM: &[&dyn Pass] = &[
    &SetQConfig,
    &FuseModules,
    &InsertActObserver,
    &ObserverToQdq,
    &QuantizableModuleToRef,
    &QRefDqToFbgemm,
    &FoldQdq,
];

/// Quantizer entry stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Calibrate,
    Amp,
    Qat,
    Quantize,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Calibrate => "calib",
            Stage::Amp => "amp",
            Stage::Qat => "qat",
            Stage::Quantize => "quantize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Observer behavior after a stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverMode {
    /// Collect statistics, pass values through
    Observe,
    /// Freeze statistics, fake-quantize values
    FakeQuant,
}

impl ObserverMode {
    /// `(observe, fake_quant)`
    pub fn flags(self) -> (bool, bool) {
        match self {
            ObserverMode::Observe => (true, false),
            ObserverMode::FakeQuant => (false, true),
        }
    }
}

/// Everything a stage does to one traced submodule
#[derive(Clone, Debug)]
pub struct StagePlan {
    pub stage: Stage,
    pub phases: Vec<PassPhase>,
    /// Mode observers are switched to afterwards, `None` leaves them as is
    pub observer_mode: Option<ObserverMode>,
    /// Drop submodules no node calls any more
    pub prune_unused: bool,
}

impl StagePlan {
    pub fn pass_names(&self) -> Vec<&'static str> {
        self.phases.iter().flat_map(|p| p.pass_names()).collect()
    }
}

fn phase(
    name: &'static str,
    observers: ObserverTypes,
    overrides: bool,
    passes: &'static [&'static dyn Pass],
) -> PassPhase {
    PassPhase {
        name,
        observers,
        override_module: overrides,
        override_weight: overrides,
        override_qconfig: overrides,
        passes,
    }
}

pub fn calib_plan(backend: Backend, observers: ObserverTypes) -> StagePlan {
    let passes = match backend {
        Backend::Disc => CALIB_DISC,
        Backend::Reference | Backend::Fbgemm => CALIB,
    };
    StagePlan {
        stage: Stage::Calibrate,
        phases: vec![phase("calib", observers, true, passes)],
        observer_mode: Some(ObserverMode::Observe),
        prune_unused: false,
    }
}

/// Never re-annotates or replaces what earlier stages attached
pub fn amp_plan(backend: Backend, observers: ObserverTypes) -> StagePlan {
    let passes = match backend {
        Backend::Disc => AMP_DISC,
        Backend::Reference | Backend::Fbgemm => AMP,
    };
    StagePlan {
        stage: Stage::Amp,
        phases: vec![phase("amp", observers, false, passes)],
        observer_mode: Some(ObserverMode::FakeQuant),
        prune_unused: false,
    }
}

/// Outside DISC, runs two phases: weight observers from the post-training
/// constructors first, then a re-annotation with the QAT constructors that
/// replaces activation observers, calibrated ones included. Weight observers
/// are kept so weights stay on frozen post-training statistics.
pub fn qat_plan(backend: Backend, ptq: ObserverTypes, qat: ObserverTypes) -> StagePlan {
    let phases = match backend {
        Backend::Disc => vec![phase("qat", qat, true, QAT_DISC)],
        Backend::Reference | Backend::Fbgemm => vec![
            phase("ptq", ptq, true, QAT_PTQ),
            PassPhase {
                name: "qat",
                observers: qat,
                override_module: true,
                override_weight: false,
                override_qconfig: true,
                passes: QAT_QAT,
            },
        ],
    };
    StagePlan {
        stage: Stage::Qat,
        phases,
        observer_mode: Some(ObserverMode::FakeQuant),
        prune_unused: false,
    }
}

/// Only DISC keeps observers, which switch to fake-quant
pub fn quantize_plan(backend: Backend, observers: ObserverTypes) -> StagePlan {
    let (passes, observer_mode) = match backend {
        Backend::Disc => (QUANT_DISC, Some(ObserverMode::FakeQuant)),
        Backend::Reference => (QUANT_REF, None),
        Backend::Fbgemm => (QUANT_FBGEMM, None),
    };
    StagePlan {
        stage: Stage::Quantize,
        phases: vec![phase("quantize", observers, false, passes)],
        observer_mode,
        prune_unused: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::{ObserverConstructor, ObserverKind};

    fn types(kind: ObserverKind) -> ObserverTypes {
        ObserverTypes::new(ObserverConstructor::new(kind), ObserverConstructor::new(kind))
    }

    #[test]
    fn test_disc_never_fuses() {
        let plans = [
            calib_plan(Backend::Disc, types(ObserverKind::MinMax)),
            amp_plan(Backend::Disc, types(ObserverKind::MinMax)),
            qat_plan(Backend::Disc, types(ObserverKind::MinMax), types(ObserverKind::Lsq)),
            quantize_plan(Backend::Disc, types(ObserverKind::MinMax)),
        ];
        for plan in plans {
            assert!(!plan.pass_names().contains(&"fuse_modules"), "{:?}", plan.stage);
        }
    }

    #[test]
    fn test_calib_sequences() {
        let plan = calib_plan(Backend::Reference, types(ObserverKind::MinMax));
        assert_eq!(
            plan.pass_names(),
            vec!["set_qconfig", "fuse_modules", "insert_act_observer"]
        );
        assert_eq!(plan.observer_mode, Some(ObserverMode::Observe));
    }

    #[test]
    fn test_amp_never_overrides() {
        let plan = amp_plan(Backend::Fbgemm, types(ObserverKind::MinMax));
        assert!(plan
            .phases
            .iter()
            .all(|p| !p.override_module && !p.override_weight && !p.override_qconfig));
        assert_eq!(plan.pass_names().last(), Some(&"quantizable_module_to_amp"));
    }

    #[test]
    fn test_qat_two_phases() {
        let plan = qat_plan(
            Backend::Reference,
            types(ObserverKind::MinMax),
            types(ObserverKind::Lsq),
        );
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.phases[0].name, "ptq");
        assert_eq!(plan.phases[0].observers.weight.kind, ObserverKind::MinMax);
        assert_eq!(
            plan.phases[0].pass_names(),
            vec!["set_qconfig", "fuse_modules", "insert_w_observer"]
        );
        assert_eq!(plan.phases[1].observers.activation.kind, ObserverKind::Lsq);
        assert_eq!(plan.phases[1].pass_names()[0], "set_qconfig");
        let qat = &plan.phases[1];
        assert!(qat.override_module && qat.override_qconfig);
        assert!(!qat.override_weight);

        let disc = qat_plan(Backend::Disc, types(ObserverKind::MinMax), types(ObserverKind::Lsq));
        assert_eq!(disc.phases.len(), 1);
        assert_eq!(disc.phases[0].observers.weight.kind, ObserverKind::Lsq);
    }

    #[test]
    fn test_quantize_sequences() {
        let reference = quantize_plan(Backend::Reference, types(ObserverKind::MinMax));
        let fbgemm = quantize_plan(Backend::Fbgemm, types(ObserverKind::MinMax));

        let mut expected = reference.pass_names();
        expected.extend(["q_ref_dq_to_fbgemm", "fold_qdq"]);
        assert_eq!(fbgemm.pass_names(), expected);
        assert!(reference.prune_unused && fbgemm.prune_unused);
        assert_eq!(reference.observer_mode, None);
        assert_eq!(
            quantize_plan(Backend::Disc, types(ObserverKind::MinMax)).observer_mode,
            Some(ObserverMode::FakeQuant)
        );
    }
}
