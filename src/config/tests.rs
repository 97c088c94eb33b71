//! Integration tests for config module

use super::*;
use crate::quant::{ObserverKind, QDType, QScheme};
use crate::registry::{Backend, Device};
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_end_to_end_config_loading() {
    let yaml = r#"
backend: fbgemm
device: x86

filter:
  include_names: [features]
  exclude_names: [features.head]
  exclude_kinds: [conv2d]

observers:
  activation:
    kind: histogram
    dtype: quint8
    qscheme: per_tensor_affine
    params:
      upper_percentile: 99.9
      max_samples: 4096
  weight:
    kind: per_channel_min_max
    dtype: qint8
    qscheme: per_channel_symmetric
  bias:
    kind: bias
  qat:
    kind: lsq
"#;

    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(yaml.as_bytes()).unwrap();

    let config = load_config(temp_file.path()).unwrap();

    assert_eq!(config.backend, Backend::Fbgemm);
    assert_eq!(config.device, Device::X86);
    let filter = config.filter.as_ref().unwrap();
    assert!(filter.matches("features.body", "linear"));
    assert!(!filter.matches("features.head.fc", "linear"));
    assert!(!filter.matches("features.conv", "conv2d"));

    let act = config.observers.activation.as_ref().unwrap();
    assert_eq!(act.kind, ObserverKind::Histogram);
    assert_eq!(act.bound_params().len(), 4);
    let weight = config.observers.weight.as_ref().unwrap();
    assert_eq!(weight.resolved_qscheme(), QScheme::PerChannelSymmetric);
    assert_eq!(config.observers.qat.as_ref().unwrap().kind, ObserverKind::Lsq);
}

#[test]
fn test_minimal_config() {
    let config = parse_config("{}").unwrap();
    assert_eq!(config, QuantizerConfig::default());
    assert_eq!(config.backend, Backend::Reference);
    assert_eq!(config.device, Device::X86);
}

#[test]
fn test_aarch64_requires_disc_or_explicit_observers() {
    assert!(parse_config("backend: disc\ndevice: aarch64").is_ok());
    assert!(parse_config("backend: reference\ndevice: aarch64").is_err());

    let yaml = r#"
backend: reference
device: aarch64
observers:
  activation: { kind: min_max, dtype: qint8, qscheme: per_tensor_symmetric }
  weight: { kind: min_max, dtype: qint8, qscheme: per_tensor_symmetric }
"#;
    let config = parse_config(yaml).unwrap();
    assert_eq!(config.observers.weight.unwrap().dtype, Some(QDType::QInt8));
}

#[test]
fn test_unknown_backend_rejected() {
    assert!(parse_config("backend: tensorrt").is_err());
}

#[test]
fn test_save_and_reload() {
    let mut config = parse_config("backend: disc\ndevice: gpu").unwrap();
    config.observers.qat = Some(crate::registry::default_qat_constructor());

    let temp_file = NamedTempFile::new().unwrap();
    save_config(&config, temp_file.path()).unwrap();

    let reloaded = load_config(temp_file.path()).unwrap();
    assert_eq!(reloaded, config);
}
