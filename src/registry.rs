//! Backend/device registry and default observer tables
//!
//! Hardware kernels constrain which quantization schemes a device can run, so
//! the default activation and weight observers depend on both the target
//! device and the lowering backend. Not every pair is populated: AArch64 and
//! GPU only support DISC.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::quant::{ObserverConstructor, ObserverKind, QDType, QScheme};

/// Lowering backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Reference quantized numerics, for correctness validation
    #[default]
    Reference,
    /// DISC compiler: keeps fake-quant graphs, fuses downstream
    Disc,
    /// FBGEMM x86 kernels
    Fbgemm,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Reference, Backend::Disc, Backend::Fbgemm];

    pub fn name(self) -> &'static str {
        match self {
            Backend::Reference => "reference",
            Backend::Disc => "disc",
            Backend::Fbgemm => "fbgemm",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Target device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    X86,
    AArch64,
    Gpu,
}

impl Device {
    pub const ALL: [Device; 3] = [Device::X86, Device::AArch64, Device::Gpu];

    pub fn name(self) -> &'static str {
        match self {
            Device::X86 => "x86",
            Device::AArch64 => "aarch64",
            Device::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which default table to consult
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverTable {
    Activation,
    Weight,
}

fn observer(kind: ObserverKind, dtype: QDType, qscheme: QScheme) -> ObserverConstructor {
    ObserverConstructor::new(kind)
        .with_dtype(dtype)
        .with_qscheme(qscheme)
}

impl ObserverTable {
    /// Table entry for a (device, backend) pair, `None` when unpopulated
    pub fn entry(self, device: Device, backend: Backend) -> Option<ObserverConstructor> {
        use ObserverKind::*;
        use QDType::*;
        use QScheme::*;

        match (self, device, backend) {
            (ObserverTable::Activation, Device::X86, Backend::Reference) => {
                Some(observer(MinMax, QUInt8, PerTensorAffine))
            }
            (ObserverTable::Activation, Device::X86, Backend::Disc) => {
                Some(observer(MinMax, QInt8, PerTensorSymmetric))
            }
            (ObserverTable::Activation, Device::X86, Backend::Fbgemm) => {
                Some(observer(Histogram, QUInt8, PerTensorAffine))
            }
            (ObserverTable::Activation, Device::AArch64 | Device::Gpu, Backend::Disc) => {
                Some(observer(MinMax, QInt8, PerTensorSymmetric))
            }

            (ObserverTable::Weight, Device::X86, Backend::Reference) => {
                Some(observer(MinMax, QUInt8, PerTensorAffine))
            }
            (ObserverTable::Weight, Device::X86, Backend::Disc | Backend::Fbgemm) => {
                Some(observer(PerChannelMinMax, QInt8, PerChannelSymmetric))
            }
            // Per-channel symmetric overflows in the ARM GEMMLowp output stage
            (ObserverTable::Weight, Device::AArch64, Backend::Disc) => {
                Some(observer(MinMax, QInt8, PerTensorSymmetric))
            }
            (ObserverTable::Weight, Device::Gpu, Backend::Disc) => {
                Some(observer(MinMax, QInt8, PerTensorSymmetric))
            }

            (_, Device::AArch64 | Device::Gpu, Backend::Reference | Backend::Fbgemm) => None,
        }
    }

    /// Backends populated for a device
    pub fn backends(self, device: Device) -> Vec<Backend> {
        Backend::ALL
            .into_iter()
            .filter(|&backend| self.entry(device, backend).is_some())
            .collect()
    }
}

/// Look up the default observer constructor for a (device, backend) pair
///
/// `UnsupportedDevice` is returned for a device with no populated backend
/// at all. Every current device has a DISC entry, so with the present
/// tables only `UnsupportedBackend` can occur; the variant stays for
/// devices added before their tables are filled in.
pub fn resolve(table: ObserverTable, device: Device, backend: Backend) -> Result<ObserverConstructor> {
    if table.backends(device).is_empty() {
        return Err(Error::UnsupportedDevice { device });
    }
    table
        .entry(device, backend)
        .ok_or(Error::UnsupportedBackend { backend, device })
}

/// Default bias observer: 32-bit symmetric
pub fn default_bias_constructor() -> ObserverConstructor {
    ObserverConstructor::new(ObserverKind::Bias)
}

/// Default QAT observer: learned step size, numeric format left unbound
pub fn default_qat_constructor() -> ObserverConstructor {
    ObserverConstructor::new(ObserverKind::Lsq)
}

/// Whether a backend can lower a quantized graph for a device
///
/// FBGEMM kernels only exist for x86; reference and DISC graphs are portable.
pub fn lowering_supported(device: Device, backend: Backend) -> bool {
    match backend {
        Backend::Fbgemm => device == Device::X86,
        Backend::Reference | Backend::Disc => true,
    }
}

/// Whether the host can run FBGEMM kernels
pub fn fbgemm_available() -> bool {
    cfg!(target_arch = "x86_64")
}
