//! Module tree
//!
//! A [`Module`] is a node of the model hierarchy: containers
//! (`Sequential`), traced graph modules, and parameter-carrying leaves.
//! Every module may carry a qconfig, the observer types it was annotated
//! with. A quantizable layer without a qconfig does not participate in
//! quantization.

mod filter;
mod trace;

pub use filter::ModuleFilter;
pub use trace::{copy_and_replace, trace_module, SequentialTracer, TraceMapping, Tracer};

use ndarray::{Array1, Array2, Array4, ArrayD, Axis, ShapeError};

use crate::config::ObserverTypes;
use crate::graph::GraphModule;
use crate::quant::{fake_quantize, Observer, ObserverConstructor, QParams, QuantizedTensor};

/// Every module kind name, as used by kind filters
pub const MODULE_KINDS: [&str; 8] = [
    "sequential",
    "graph",
    "linear",
    "conv2d",
    "batchnorm2d",
    "relu",
    "identity",
    "observer",
];

/// Operator computed by a quantizable layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerOp {
    /// `y = x W^T + b`, weight `[out_features, in_features]`
    Linear,
    /// 2D convolution, weight `[out_channels, in_channels, kh, kw]`
    Conv2d { stride: usize, padding: usize },
}

/// Variant a quantizable layer has been converted to
#[derive(Clone, Debug, PartialEq)]
pub enum LayerStage {
    /// Plain floating point
    Float,
    /// Weight fake-quantized through the weight observer, activations observed
    Observed,
    /// Mixed precision: weight fake-quantized, activations untouched
    Amp,
    /// Reference numerics: statically quantized weight, float compute
    Reference { weight: QuantizedTensor },
    /// FBGEMM kernel: quantized input, weight and output
    Fbgemm { weight: QuantizedTensor, output: QParams },
}

impl LayerStage {
    pub fn name(&self) -> &'static str {
        match self {
            LayerStage::Float => "float",
            LayerStage::Observed => "observed",
            LayerStage::Amp => "amp",
            LayerStage::Reference { .. } => "reference",
            LayerStage::Fbgemm { .. } => "fbgemm",
        }
    }

    /// Statically quantized weight, if any
    pub fn quantized_weight(&self) -> Option<&QuantizedTensor> {
        match self {
            LayerStage::Reference { weight } | LayerStage::Fbgemm { weight, .. } => Some(weight),
            _ => None,
        }
    }
}

/// Quantizable layer (Linear or Conv2d)
#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub op: LayerOp,
    /// Float weight, output channels on axis 0
    pub weight: ArrayD<f32>,
    pub bias: Option<Array1<f32>>,
    /// A following ReLU has been fused into this layer
    pub fused_relu: bool,
    pub weight_observer: Option<Observer>,
    pub bias_observer: Option<Observer>,
    pub stage: LayerStage,
}

impl Layer {
    pub fn linear(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self::new(LayerOp::Linear, weight.into_dyn(), bias)
    }

    pub fn conv2d(weight: Array4<f32>, bias: Option<Array1<f32>>, stride: usize, padding: usize) -> Self {
        Self::new(LayerOp::Conv2d { stride, padding }, weight.into_dyn(), bias)
    }

    fn new(op: LayerOp, weight: ArrayD<f32>, bias: Option<Array1<f32>>) -> Self {
        Self {
            op,
            weight,
            bias,
            fused_relu: false,
            weight_observer: None,
            bias_observer: None,
            stage: LayerStage::Float,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.op {
            LayerOp::Linear => "linear",
            LayerOp::Conv2d { .. } => "conv2d",
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape().first().copied().unwrap_or(0)
    }

    /// Build an observer from `ctr` that has seen this layer's weight
    pub fn observe_weight(&self, ctr: &ObserverConstructor) -> Observer {
        let mut observer = ctr.build();
        let values: Vec<f32> = self.weight.iter().copied().collect();
        observer.observe_tensor(&values, self.weight.shape());
        observer
    }

    /// Build an observer from `ctr` that has seen this layer's bias
    pub fn observe_bias(&self, ctr: &ObserverConstructor) -> Option<Observer> {
        self.bias.as_ref().map(|bias| {
            let mut observer = ctr.build();
            let values: Vec<f32> = bias.iter().copied().collect();
            observer.observe(&values);
            observer
        })
    }

    /// Fold a following batch norm into the convolution weight and bias
    ///
    /// `w' = w * g / sqrt(var + eps)`, `b' = (b - mean) * g / sqrt(var + eps) + beta`
    pub fn fold_batch_norm(&mut self, bn: &BatchNorm2d) -> Result<(), String> {
        if !matches!(self.op, LayerOp::Conv2d { .. }) {
            return Err(format!("cannot fold batch norm into {}", self.kind_name()));
        }
        let channels = self.out_channels();
        if bn.num_features() != channels {
            return Err(format!(
                "batch norm has {} features, conv has {channels} output channels",
                bn.num_features()
            ));
        }

        let factor: Array1<f32> = bn
            .running_var
            .mapv(|var| 1.0 / (var + bn.eps).sqrt())
            * &bn.weight;

        for (c, mut filter) in self.weight.axis_iter_mut(Axis(0)).enumerate() {
            filter.mapv_inplace(|w| w * factor[c]);
        }

        let bias = self
            .bias
            .take()
            .unwrap_or_else(|| Array1::zeros(channels));
        self.bias = Some((bias - &bn.running_mean) * &factor + &bn.bias);
        Ok(())
    }

    /// Weight as seen by the layer's compute at its current stage
    pub fn effective_weight(&self) -> Result<ArrayD<f32>, ShapeError> {
        match &self.stage {
            LayerStage::Float => Ok(self.weight.clone()),
            LayerStage::Observed | LayerStage::Amp => match &self.weight_observer {
                Some(observer) if observer.is_fake_quant() => {
                    let values: Vec<f32> = self.weight.iter().copied().collect();
                    ArrayD::from_shape_vec(
                        self.weight.raw_dim(),
                        fake_quantize(&values, &observer.qparams()),
                    )
                }
                _ => Ok(self.weight.clone()),
            },
            LayerStage::Reference { weight } | LayerStage::Fbgemm { weight, .. } => weight.dequantize(),
        }
    }
}

/// 2D batch normalization in inference form
#[derive(Clone, Debug, PartialEq)]
pub struct BatchNorm2d {
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl BatchNorm2d {
    /// Identity statistics for `num_features` channels
    pub fn new(num_features: usize) -> Self {
        Self {
            running_mean: Array1::zeros(num_features),
            running_var: Array1::ones(num_features),
            weight: Array1::ones(num_features),
            bias: Array1::zeros(num_features),
            eps: 1e-5,
        }
    }

    pub fn num_features(&self) -> usize {
        self.running_mean.len()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ModuleKind {
    Sequential(Vec<(String, Module)>),
    Graph(GraphModule),
    Layer(Layer),
    BatchNorm2d(BatchNorm2d),
    ReLU,
    Identity,
    Observer(Observer),
}

/// Node of the model hierarchy
#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    pub kind: ModuleKind,
    /// Observer types this module was annotated with
    pub qconfig: Option<ObserverTypes>,
}

impl Module {
    pub fn new(kind: ModuleKind) -> Self {
        Self { kind, qconfig: None }
    }

    pub fn sequential<S: Into<String>>(children: impl IntoIterator<Item = (S, Module)>) -> Self {
        Self::new(ModuleKind::Sequential(
            children
                .into_iter()
                .map(|(name, module)| (name.into(), module))
                .collect(),
        ))
    }

    pub fn linear(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self::new(ModuleKind::Layer(Layer::linear(weight, bias)))
    }

    pub fn conv2d(weight: Array4<f32>, bias: Option<Array1<f32>>, stride: usize, padding: usize) -> Self {
        Self::new(ModuleKind::Layer(Layer::conv2d(weight, bias, stride, padding)))
    }

    pub fn batch_norm(bn: BatchNorm2d) -> Self {
        Self::new(ModuleKind::BatchNorm2d(bn))
    }

    pub fn relu() -> Self {
        Self::new(ModuleKind::ReLU)
    }

    pub fn identity() -> Self {
        Self::new(ModuleKind::Identity)
    }

    pub fn observer(observer: Observer) -> Self {
        Self::new(ModuleKind::Observer(observer))
    }

    pub fn graph(gm: GraphModule) -> Self {
        Self::new(ModuleKind::Graph(gm))
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ModuleKind::Sequential(_) => "sequential",
            ModuleKind::Graph(_) => "graph",
            ModuleKind::Layer(layer) => layer.kind_name(),
            ModuleKind::BatchNorm2d(_) => "batchnorm2d",
            ModuleKind::ReLU => "relu",
            ModuleKind::Identity => "identity",
            ModuleKind::Observer(_) => "observer",
        }
    }

    pub fn is_quantizable(&self) -> bool {
        matches!(self.kind, ModuleKind::Layer(_))
    }

    pub fn as_layer(&self) -> Option<&Layer> {
        match &self.kind {
            ModuleKind::Layer(layer) => Some(layer),
            _ => None,
        }
    }

    pub fn as_layer_mut(&mut self) -> Option<&mut Layer> {
        match &mut self.kind {
            ModuleKind::Layer(layer) => Some(layer),
            _ => None,
        }
    }

    pub fn as_observer(&self) -> Option<&Observer> {
        match &self.kind {
            ModuleKind::Observer(observer) => Some(observer),
            _ => None,
        }
    }

    pub fn as_observer_mut(&mut self) -> Option<&mut Observer> {
        match &mut self.kind {
            ModuleKind::Observer(observer) => Some(observer),
            _ => None,
        }
    }

    pub fn as_graph(&self) -> Option<&GraphModule> {
        match &self.kind {
            ModuleKind::Graph(gm) => Some(gm),
            _ => None,
        }
    }

    /// Look up a descendant by dotted path, `""` is the module itself
    ///
    /// Graph modules hold their submodules under qualified names, so the
    /// remainder of the path is looked up as a whole once a graph is reached.
    pub fn get(&self, path: &str) -> Option<&Module> {
        if path.is_empty() {
            return Some(self);
        }
        match &self.kind {
            ModuleKind::Sequential(children) => {
                let (head, rest) = split_path(path);
                children
                    .iter()
                    .find(|(name, _)| name == head)
                    .and_then(|(_, child)| child.get(rest))
            }
            ModuleKind::Graph(gm) => gm.submodule(path),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Module> {
        if path.is_empty() {
            return Some(self);
        }
        match &mut self.kind {
            ModuleKind::Sequential(children) => {
                let (head, rest) = split_path(path);
                children
                    .iter_mut()
                    .find(|(name, _)| name == head)
                    .and_then(|(_, child)| child.get_mut(rest))
            }
            ModuleKind::Graph(gm) => gm.submodule_mut(path),
            _ => None,
        }
    }

    /// Swap the module at `path`, returning the previous one
    pub fn replace(&mut self, path: &str, module: Module) -> Option<Module> {
        self.get_mut(path)
            .map(|slot| std::mem::replace(slot, module))
    }

    /// Every module with its path, pre-order, the module itself first as `""`
    pub fn named_modules(&self) -> Vec<(String, &Module)> {
        let mut out = Vec::new();
        self.collect_named(String::new(), &mut out);
        out
    }

    fn collect_named<'a>(&'a self, path: String, out: &mut Vec<(String, &'a Module)>) {
        out.push((path.clone(), self));
        match &self.kind {
            ModuleKind::Sequential(children) => {
                for (name, child) in children {
                    child.collect_named(join_path(&path, name), out);
                }
            }
            ModuleKind::Graph(gm) => {
                for (name, child) in gm.submodules() {
                    child.collect_named(join_path(&path, name), out);
                }
            }
            _ => {}
        }
    }

    /// Every observer in the tree: observer modules and layer-held observers
    ///
    /// Layer observers are named `<layer>.weight_observer` and
    /// `<layer>.bias_observer`.
    pub fn observers(&self) -> Vec<(String, &Observer)> {
        let mut out = Vec::new();
        for (path, module) in self.named_modules() {
            match &module.kind {
                ModuleKind::Observer(observer) => out.push((path, observer)),
                ModuleKind::Layer(layer) => {
                    if let Some(observer) = &layer.weight_observer {
                        out.push((join_path(&path, "weight_observer"), observer));
                    }
                    if let Some(observer) = &layer.bias_observer {
                        out.push((join_path(&path, "bias_observer"), observer));
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Apply `f` to every observer in the tree
    pub fn for_each_observer_mut(&mut self, f: &mut dyn FnMut(&mut Observer)) {
        match &mut self.kind {
            ModuleKind::Sequential(children) => {
                for (_, child) in children.iter_mut() {
                    child.for_each_observer_mut(f);
                }
            }
            ModuleKind::Graph(gm) => {
                for child in gm.submodules_mut() {
                    child.for_each_observer_mut(f);
                }
            }
            ModuleKind::Layer(layer) => {
                if let Some(observer) = layer.weight_observer.as_mut() {
                    f(observer);
                }
                if let Some(observer) = layer.bias_observer.as_mut() {
                    f(observer);
                }
            }
            ModuleKind::Observer(observer) => f(observer),
            ModuleKind::BatchNorm2d(_) | ModuleKind::ReLU | ModuleKind::Identity => {}
        }
    }

    /// Set observe/fake-quant mode on every observer in the tree
    pub fn set_observer_mode(&mut self, observe: bool, fake_quant: bool) {
        self.for_each_observer_mut(&mut |observer| observer.set_mode(observe, fake_quant));
    }
}

fn split_path(path: &str) -> (&str, &str) {
    path.split_once('.').unwrap_or((path, ""))
}

/// `parent.child`, or `child` at the root
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}.{child}")
    }
}
