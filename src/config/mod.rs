//! Declarative YAML configuration and observer type resolution
//!
//! # Example
//!
//! ```yaml
//! backend: fbgemm
//! device: x86
//!
//! filter:
//!   exclude_names: [classifier]
//!
//! observers:
//!   activation:
//!     kind: histogram
//!     dtype: quint8
//!     qscheme: per_tensor_affine
//!     params:
//!       upper_percentile: 99.9
//!   qat:
//!     kind: lsq
//! ```

mod load;
mod resolve;
mod schema;
mod validate;

#[cfg(test)]
mod tests;

pub use load::{load_config, parse_config, save_config};
pub use resolve::{derive_qat_constructor, get_observer_types, ObserverOverrides, ObserverTypes};
pub use schema::{ObserverSpec, QuantizerConfig};
pub use validate::{validate_config, ValidationError};
