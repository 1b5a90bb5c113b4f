use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::DispatchError;

// =============================================================================
// Dispatch config (figment-deserialized from defaults / dispatch.toml / env vars)
// =============================================================================
//
//   dispatch.toml:   [receiver]
//                    threads = 2
//
//   env var:         DISPATCH_RECEIVER__THREADS=2   (double underscore = nesting)

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Name reported by [`ClientManager::implementation_name`](crate::ClientManager::implementation_name).
    #[serde(default = "default_implementation_name")]
    pub implementation_name: String,
    /// Send one benign query right after each client is created.
    #[serde(default = "default_warm_up")]
    pub warm_up: bool,
    #[serde(default)]
    pub receiver: ReceiverConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            implementation_name: default_implementation_name(),
            warm_up: default_warm_up(),
            receiver: ReceiverConfig::default(),
        }
    }
}

/// Receiver thread tunables (lives under `[receiver]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Dedicated threads polling the transport. 0 leaves polling to the
    /// caller through `ClientManager::poll_once`.
    #[serde(default = "default_receiver_threads")]
    pub threads: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Pause after a failed poll before trying again.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            threads: default_receiver_threads(),
            poll_timeout_ms: default_poll_timeout_ms(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl ReceiverConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl DispatchConfig {
    /// Config with no receiver threads; events are pumped by hand.
    pub fn manual() -> Self {
        Self {
            receiver: ReceiverConfig {
                threads: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.receiver.poll_timeout_ms == 0 {
            return Err(DispatchError::Config(
                "receiver.poll_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.implementation_name.trim().is_empty() {
            return Err(DispatchError::Config(
                "implementation_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_implementation_name() -> String {
    "client_dispatch".to_string()
}
fn default_warm_up() -> bool {
    true
}
fn default_receiver_threads() -> usize {
    1
}
fn default_poll_timeout_ms() -> u64 {
    100
}
fn default_error_backoff_ms() -> u64 {
    50
}

/// Build a figment that layers: defaults → `path` (TOML, optional) → DISPATCH_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `DISPATCH_RECEIVER__THREADS=4`  →  `receiver.threads = 4`
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(DispatchConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("DISPATCH_").split("__"))
}

/// Load, extract and validate in one step.
pub fn resolve_config(path: Option<&Path>) -> Result<DispatchConfig, DispatchError> {
    let config: DispatchConfig = load_config(path)
        .extract()
        .map_err(|e| DispatchError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let d = DispatchConfig::default();
        assert_eq!(d.implementation_name, "client_dispatch");
        assert!(d.warm_up);
        assert_eq!(d.receiver.threads, 1);
        assert_eq!(d.receiver.poll_timeout(), Duration::from_millis(100));
        assert_eq!(d.receiver.error_backoff(), Duration::from_millis(50));
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_manual_has_no_threads() {
        let d = DispatchConfig::manual();
        assert_eq!(d.receiver.threads, 0);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn test_zero_poll_timeout_rejected() {
        let mut d = DispatchConfig::default();
        d.receiver.poll_timeout_ms = 0;
        assert!(matches!(d.validate(), Err(DispatchError::Config(_))));
    }

    #[test]
    fn test_empty_name_rejected() {
        let d = DispatchConfig {
            implementation_name: "  ".to_string(),
            ..Default::default()
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_load_config_without_file() {
        let config: DispatchConfig = load_config(None).extract().unwrap();
        assert_eq!(config.receiver.threads, 1);
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config: DispatchConfig = load_config(Some(&tmp.path().join("dispatch.toml")))
            .extract()
            .unwrap();
        assert!(config.warm_up);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dispatch.toml");
        std::fs::write(
            &path,
            "implementation_name = \"native-worker\"\nwarm_up = false\n[receiver]\nthreads = 3\npoll_timeout_ms = 250\n",
        )
        .unwrap();

        let config = resolve_config(Some(&path)).unwrap();
        assert_eq!(config.implementation_name, "native-worker");
        assert!(!config.warm_up);
        assert_eq!(config.receiver.threads, 3);
        assert_eq!(config.receiver.poll_timeout_ms, 250);
        assert_eq!(config.receiver.error_backoff_ms, 50);
    }

    #[test]
    fn test_resolve_config_rejects_invalid_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dispatch.toml");
        std::fs::write(&path, "[receiver]\npoll_timeout_ms = 0\n").unwrap();
        assert!(matches!(
            resolve_config(Some(&path)),
            Err(DispatchError::Config(_))
        ));
    }
}
