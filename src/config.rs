// src/config.rs
use crate::backend::Device;
use crate::error::{GraphError, Result};

pub const DEVICE_VAR: &str = "FERROGRAD_DEVICE";
pub const ASYNC_VAR: &str = "FERROGRAD_ASYNC";
pub const MAX_WORKSPACE_VAR: &str = "FERROGRAD_MAX_WORKSPACE_MB";
pub const SEED_VAR: &str = "FERROGRAD_SEED";

const DEFAULT_MAX_WORKSPACE_BYTES: usize = 256 * 1024 * 1024;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Device of the tensors created by the engine's own factories.
    pub device: Device,
    /// Default sync mode of new nodes. Asynchronous device nodes return as soon as
    /// their kernels are queued.
    pub asynchronous: bool,
    /// Upper bound for the scratch memory of one convolution node. Larger
    /// workspaces make the node fall back to the direct kernels.
    pub max_workspace_bytes: usize,
    /// Seed for random fills; `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: Device::CPU,
            asynchronous: false,
            max_workspace_bytes: DEFAULT_MAX_WORKSPACE_BYTES,
            seed: None,
        }
    }
}

impl EngineConfig {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            ..Self::default()
        }
    }

    pub fn with_asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn with_max_workspace_bytes(mut self, bytes: usize) -> Self {
        self.max_workspace_bytes = bytes;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Reads `FERROGRAD_DEVICE`, `FERROGRAD_ASYNC`, `FERROGRAD_MAX_WORKSPACE_MB` and
    /// `FERROGRAD_SEED`; unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(raw) = read(DEVICE_VAR) {
            config.device = raw.parse()?;
        }
        if let Some(raw) = read(ASYNC_VAR) {
            config.asynchronous = parse_bool(ASYNC_VAR, &raw)?;
        }
        if let Some(raw) = read(MAX_WORKSPACE_VAR) {
            let mb: usize = parse_number(MAX_WORKSPACE_VAR, &raw)?;
            config.max_workspace_bytes = mb
                .checked_mul(1024 * 1024)
                .ok_or_else(|| GraphError::invalid(format!("{MAX_WORKSPACE_VAR}={raw} overflows")))?;
        }
        if let Some(raw) = read(SEED_VAR) {
            config.seed = Some(parse_number(SEED_VAR, &raw)?);
        }
        Ok(config)
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(GraphError::invalid(format!("{key}: expected a boolean, got '{raw}'"))),
    }
}

fn parse_number<N: std::str::FromStr>(key: &str, raw: &str) -> Result<N> {
    raw.trim()
        .parse()
        .map_err(|_| GraphError::invalid(format!("{key}: expected a number, got '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_workspace_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn test_reads_every_variable() {
        let config = EngineConfig::from_lookup(lookup(&[
            (DEVICE_VAR, "cuda:0"),
            (ASYNC_VAR, "yes"),
            (MAX_WORKSPACE_VAR, "16"),
            (SEED_VAR, "1234"),
        ]))
        .unwrap();
        assert_eq!(config.device, Device::CUDA(0));
        assert!(config.asynchronous);
        assert_eq!(config.max_workspace_bytes, 16 * 1024 * 1024);
        assert_eq!(config.seed, Some(1234));
    }

    #[test]
    fn test_rejects_invalid_values() {
        for (key, value) in [
            (DEVICE_VAR, "tpu"),
            (ASYNC_VAR, "maybe"),
            (MAX_WORKSPACE_VAR, "-3"),
            (SEED_VAR, "abc"),
        ] {
            let err = EngineConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(matches!(err, GraphError::InvalidParameter(_)), "{key}={value}");
        }
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::new(Device::CPU)
            .with_asynchronous(true)
            .with_max_workspace_bytes(0)
            .with_seed(9);
        assert!(config.asynchronous);
        assert_eq!(config.max_workspace_bytes, 0);
        assert_eq!(config.seed, Some(9));
    }
}
