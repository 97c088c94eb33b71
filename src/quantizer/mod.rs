//! Quantizer: the public entry point
//!
//! A [`Quantizer`] is configured once with a backend, a device, an optional
//! module filter and observer constructors, then drives a model through the
//! stages of a quantization workflow:
//!
//! - [`Quantizer::calib`]: attach activation observers that collect statistics
//! - [`Quantizer::amp`]: fake-quantize weights to measure accuracy loss
//! - [`Quantizer::qat`]: attach learnable observers for quantization-aware training
//! - [`Quantizer::quantize`]: lower to the backend's quantized form
//! - [`Quantizer::fallback`]: exclude the most sensitive layers from later stages
//!
//! Every stage reads its input and returns a new model. Stages are meant to
//! be chained: statistics collected by `calib` survive into `quantize`.
//!
//! ```no_run
//! use cuantizar::{Backend, Device, Quantizer};
//! # fn example(model: &cuantizar::Module) -> cuantizar::Result<()> {
//! let quantizer = Quantizer::new(Backend::Fbgemm, Device::X86)?;
//! let calibrated = quantizer.calib(model)?;
//! // run calibration data through `calibrated`
//! let quantized = quantizer.quantize(&calibrated)?;
//! # Ok(())
//! # }
//! ```

mod pipeline;

pub use pipeline::{
    amp_plan, calib_plan, qat_plan, quantize_plan, ObserverMode, Stage, StagePlan,
};

use std::fmt;

use tracing::{debug, info, warn};

use crate::config::{
    derive_qat_constructor, get_observer_types, validate_config, ObserverOverrides, ObserverTypes,
    QuantizerConfig,
};
use crate::error::{Error, Result};
use crate::graph::GraphModContext;
use crate::module::{copy_and_replace, trace_module, Module, ModuleFilter, SequentialTracer, Tracer};
use crate::quant::{ObserverConstructor, SensitivityRanker, WeightErrorRanker};
use crate::registry::{self, Backend, Device, ObserverTable};

/// Builder for [`Quantizer`]
#[derive(Default)]
pub struct QuantizerBuilder {
    backend: Backend,
    device: Device,
    filter: Option<ModuleFilter>,
    tracer: Option<Box<dyn Tracer>>,
    ranker: Option<Box<dyn SensitivityRanker>>,
    activation: Option<ObserverConstructor>,
    weight: Option<ObserverConstructor>,
    bias: Option<ObserverConstructor>,
    qat: Option<ObserverConstructor>,
}

impl QuantizerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Restrict which submodules are traced and transformed
    pub fn filter(mut self, filter: ModuleFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn tracer(mut self, tracer: impl Tracer + 'static) -> Self {
        self.tracer = Some(Box::new(tracer));
        self
    }

    /// Ranker consulted by [`Quantizer::fallback`]
    pub fn ranker(mut self, ranker: impl SensitivityRanker + 'static) -> Self {
        self.ranker = Some(Box::new(ranker));
        self
    }

    pub fn activation_observer(mut self, ctr: ObserverConstructor) -> Self {
        self.activation = Some(ctr);
        self
    }

    pub fn weight_observer(mut self, ctr: ObserverConstructor) -> Self {
        self.weight = Some(ctr);
        self
    }

    pub fn bias_observer(mut self, ctr: ObserverConstructor) -> Self {
        self.bias = Some(ctr);
        self
    }

    pub fn qat_observer(mut self, ctr: ObserverConstructor) -> Self {
        self.qat = Some(ctr);
        self
    }

    /// Resolve missing observer constructors from the registry
    ///
    /// Fails with `UnsupportedDevice`/`UnsupportedBackend` only when a
    /// constructor was left unset and the registry has no entry for it.
    pub fn build(self) -> Result<Quantizer> {
        let (backend, device) = (self.backend, self.device);

        if backend == Backend::Fbgemm && !registry::fbgemm_available() {
            warn!(
                "FBGEMM is not available, which is only for x86_64. \
                 This might cause the final quantization to fail."
            );
        }

        let activation = match self.activation {
            Some(ctr) => ctr,
            None => registry::resolve(ObserverTable::Activation, device, backend)?,
        };
        let weight = match self.weight {
            Some(ctr) => ctr,
            None => registry::resolve(ObserverTable::Weight, device, backend)?,
        };

        debug!(%backend, %device, activation = %activation.kind, weight = %weight.kind, "quantizer configured");

        Ok(Quantizer {
            filter: self.filter,
            backend,
            device,
            tracer: self.tracer.unwrap_or_else(|| Box::new(SequentialTracer)),
            ranker: self
                .ranker
                .unwrap_or_else(|| Box::new(WeightErrorRanker::default())),
            activation,
            weight,
            bias: self.bias.unwrap_or_else(registry::default_bias_constructor),
            qat: self.qat.unwrap_or_else(registry::default_qat_constructor),
        })
    }
}

/// Stage driver for one backend/device pair
pub struct Quantizer {
    filter: Option<ModuleFilter>,
    backend: Backend,
    device: Device,
    tracer: Box<dyn Tracer>,
    ranker: Box<dyn SensitivityRanker>,
    activation: ObserverConstructor,
    weight: ObserverConstructor,
    bias: ObserverConstructor,
    qat: ObserverConstructor,
}

impl fmt::Debug for Quantizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Quantizer")
            .field("backend", &self.backend)
            .field("device", &self.device)
            .field("filter", &self.filter)
            .field("activation", &self.activation)
            .field("weight", &self.weight)
            .field("bias", &self.bias)
            .field("qat", &self.qat)
            .finish_non_exhaustive()
    }
}

impl Quantizer {
    pub fn builder() -> QuantizerBuilder {
        QuantizerBuilder::new()
    }

    /// Quantizer with registry defaults for every observer
    pub fn new(backend: Backend, device: Device) -> Result<Self> {
        Self::builder().backend(backend).device(device).build()
    }

    /// Quantizer from a validated configuration
    pub fn from_config(config: &QuantizerConfig) -> Result<Self> {
        validate_config(config).map_err(|e| Error::ConfigError(e.to_string()))?;

        let mut builder = Self::builder().backend(config.backend).device(config.device);
        if let Some(filter) = &config.filter {
            builder = builder.filter(filter.clone());
        }
        let observers = &config.observers;
        if let Some(ctr) = &observers.activation {
            builder = builder.activation_observer(ctr.clone());
        }
        if let Some(ctr) = &observers.weight {
            builder = builder.weight_observer(ctr.clone());
        }
        if let Some(ctr) = &observers.bias {
            builder = builder.bias_observer(ctr.clone());
        }
        if let Some(ctr) = &observers.qat {
            builder = builder.qat_observer(ctr.clone());
        }
        builder.build()
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn filter(&self) -> Option<&ModuleFilter> {
        self.filter.as_ref()
    }

    pub fn activation_observer(&self) -> &ObserverConstructor {
        &self.activation
    }

    pub fn weight_observer(&self) -> &ObserverConstructor {
        &self.weight
    }

    pub fn bias_observer(&self) -> &ObserverConstructor {
        &self.bias
    }

    pub fn qat_observer(&self) -> &ObserverConstructor {
        &self.qat
    }

    /// Post-training observer types: the quantizer's own constructors
    pub fn ptq_observer_types(&self) -> ObserverTypes {
        ObserverTypes::new(self.activation.clone(), self.weight.clone())
            .with_bias(Some(self.bias.clone()))
    }

    /// Attach activation observers in observe mode
    pub fn calib(&self, model: &Module) -> Result<Module> {
        self.calib_with(model, ObserverOverrides::default())
    }

    /// [`Quantizer::calib`] with per-call observer constructors
    pub fn calib_with(&self, model: &Module, overrides: ObserverOverrides) -> Result<Module> {
        let types = get_observer_types(
            overrides.activation,
            overrides.weight,
            overrides.bias,
            self.activation.clone(),
            self.weight.clone(),
            Some(self.bias.clone()),
        );
        self.run(model, &calib_plan(self.backend, types))
    }

    /// Fake-quantize weights, activations stay in float
    pub fn amp(&self, model: &Module) -> Result<Module> {
        self.run(model, &amp_plan(self.backend, self.ptq_observer_types()))
    }

    /// Attach QAT observers in fake-quant mode
    pub fn qat(&self, model: &Module) -> Result<Module> {
        self.qat_with(model, ObserverOverrides::default())
    }

    /// [`Quantizer::qat`] with per-call observer constructors
    ///
    /// Unset activation and weight constructors are derived from the QAT
    /// constructor with the post-training numeric format. A bias observer is
    /// attached in the QAT phase only when supplied here.
    pub fn qat_with(&self, model: &Module, overrides: ObserverOverrides) -> Result<Module> {
        let activation = overrides
            .activation
            .unwrap_or_else(|| derive_qat_constructor(&self.qat, &self.activation));
        let weight = overrides
            .weight
            .unwrap_or_else(|| derive_qat_constructor(&self.qat, &self.weight));
        let qat_types = ObserverTypes::new(activation, weight).with_bias(overrides.bias);

        self.run(
            model,
            &qat_plan(self.backend, self.ptq_observer_types(), qat_types),
        )
    }

    /// Lower to the backend's quantized form
    ///
    /// Fails with `UnsupportedBackend` before touching the model when the
    /// backend cannot lower for the configured device.
    pub fn quantize(&self, model: &Module) -> Result<Module> {
        if !registry::lowering_supported(self.device, self.backend) {
            return Err(Error::UnsupportedBackend {
                backend: self.backend,
                device: self.device,
            });
        }
        self.run(model, &quantize_plan(self.backend, self.ptq_observer_types()))
    }

    /// Exclude the `n` most sensitive submodules from later stages
    ///
    /// Returns the ranked names. Exclusions accumulate across calls and
    /// never shrink.
    pub fn fallback(&mut self, model: &Module, n: usize) -> Result<Vec<String>> {
        let names = self.ranker.fallback_names(model, n)?;
        for name in names.iter().filter(|name| model.get(name).is_none()) {
            warn!(name = %name, "fallback name matches no submodule");
        }

        let added = self
            .filter
            .get_or_insert_with(ModuleFilter::new)
            .exclude(names.iter().cloned());
        info!(requested = n, ranked = names.len(), added, "fallback exclusions updated");
        Ok(names)
    }

    fn run(&self, model: &Module, plan: &StagePlan) -> Result<Module> {
        let Some(first) = plan.phases.first() else {
            return Ok(model.clone());
        };
        info!(stage = %plan.stage, backend = %self.backend, device = %self.device, "stage started");

        let filter = self.filter.as_ref();
        let mut mapping = trace_module(model, filter, self.tracer.as_ref())?;

        for (name, slot) in mapping.iter_mut() {
            let traced = std::mem::take(slot);
            let mut ctx = GraphModContext::new(traced, model, name, filter, first.observers.clone());
            for phase in &plan.phases {
                ctx.run_phase(phase)?;
            }

            let mut gm = ctx.into_graph_module();
            if let Some(mode) = plan.observer_mode {
                let (observe, fake_quant) = mode.flags();
                gm.toggle_observers(observe, fake_quant);
            }
            if plan.prune_unused {
                let removed = gm.delete_all_unused_submodules();
                debug!(submodule = %name, removed = removed.len(), "pruned unused submodules");
            }
            *slot = gm;
        }

        let submodules = mapping.len();
        let result = copy_and_replace(model, mapping)?;
        info!(stage = %plan.stage, submodules, "stage finished");
        Ok(result)
    }
}
