//! Error types for cuantizar

use thiserror::Error;

use crate::registry::{Backend, Device};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Device {device} is not supported")]
    UnsupportedDevice { device: Device },

    #[error("Backend {backend} is not supported on device {device}")]
    UnsupportedBackend { backend: Backend, device: Device },

    #[error("Pass `{pass}` failed: {message}")]
    Transform { pass: &'static str, message: String },

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Trace error: {0}")]
    Trace(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Shorthand for a pass failure
    pub(crate) fn transform(pass: &'static str, message: impl Into<String>) -> Self {
        Error::Transform {
            pass,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
