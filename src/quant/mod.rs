//! Quantization numerics, observers and error analysis
//!
//! - [`qparams`]: dtypes, schemes, scale/zero-point computation
//! - [`observer`]: observer constructors and stateful observers
//! - [`sensitivity`]: error statistics and fallback ranking

mod observer;
mod qparams;
mod sensitivity;

pub use observer::{Observer, ObserverConstructor, ObserverKind, QAT_INHERITED_PARAMS};
pub use qparams::{
    calculate_qparams, dequantize, fake_quantize, quantization_mse, quantize, QDType, QParams,
    QScheme, QuantizedTensor, MIN_SCALE,
};
pub use sensitivity::{analyze_error, QuantErrorStats, SensitivityRanker, WeightErrorRanker};
