use crate::weak_error;
use log::error;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::PathBuf;
use std::time::Duration;

/// Adapter wide configuration, shared by every session served by the process.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct AdapterConfig {
    /// Runtime executable used to start debuggee programs.
    pub runtime: String,
    /// Extra arguments passed to the runtime before the program.
    pub runtime_args: Vec<String>,
    /// Executable of the multiplexing proxy, no proxy is started when absent.
    pub proxy_command: Option<PathBuf>,
    /// How long `terminate` waits for the debuggee to exit by itself.
    pub terminate_timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            runtime: "dart".to_string(),
            runtime_args: vec![],
            proxy_command: None,
            terminate_timeout_ms: 5_000,
        }
    }
}

impl AdapterConfig {
    const DEFAULT_PATH: &'static str = ".config/vmdap/config.toml";

    /// Load configuration from file. Return [`None`] on errors.
    pub fn from_file(path: Option<&str>) -> Option<Self> {
        let data = match path {
            None => {
                let path = home::home_dir()?;
                let path = path.join(Self::DEFAULT_PATH);
                // missing default file is not an error
                read_to_string(path).ok()?
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    error!(target: "dap", "Error while load config file: {err}");
                    return None;
                }
            },
        };

        weak_error!(toml::de::from_str(&data), "parse config:")
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let cfg: AdapterConfig = toml::de::from_str(
            r#"
            runtime = "/opt/sdk/bin/dart"
            proxy_command = "/opt/sdk/bin/dds"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.runtime, "/opt/sdk/bin/dart");
        assert_eq!(cfg.proxy_command, Some(PathBuf::from("/opt/sdk/bin/dds")));
        assert_eq!(cfg.terminate_timeout_ms, 5_000);
        assert!(cfg.runtime_args.is_empty());
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(AdapterConfig::from_file(Some("/definitely/not/here.toml")).is_none());
    }
}
