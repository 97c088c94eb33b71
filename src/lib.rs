//! # Cuantizar: Graph-Rewriting Model Quantization
//!
//! Cuantizar traces a model into a dataflow graph, rewrites it with ordered
//! passes, and splices the result back, driving the model through
//! calibration, mixed-precision evaluation, quantization-aware training and
//! lowering to a quantized backend.
//!
//! ## Architecture
//!
//! - **registry**: Backends, devices and their default observers
//! - **quant**: Quantization numerics, observers and sensitivity analysis
//! - **module**: Model tree, submodule filters and tracing
//! - **graph**: Graph IR, transform context and the pass library
//! - **config**: Declarative YAML configuration and observer resolution
//! - **quantizer**: Stage pipelines and the `Quantizer` entry point

pub mod config;
pub mod graph;
pub mod module;
pub mod quant;
pub mod quantizer;
pub mod registry;

pub mod error;

// Re-export commonly used types
pub use config::{ObserverOverrides, ObserverTypes, QuantizerConfig};
pub use error::{Error, Result};
pub use module::{Module, ModuleFilter};
pub use quant::{ObserverConstructor, ObserverKind, QDType, QScheme};
pub use quantizer::{Quantizer, QuantizerBuilder};
pub use registry::{Backend, Device};
