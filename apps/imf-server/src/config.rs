//! Server configuration.
//!
//! Layering, lowest to highest precedence:
//! 1) serialized defaults -> 2) YAML (`--config`) -> 3) env (`IMF__*`) -> 4) CLI overrides

use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use imf_runtime::RuntimeConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment overrides; `__` separates nested keys, e.g.
/// `IMF__RUNTIME__WORKER__PROGRAM=python3.12`.
pub const ENV_PREFIX: &str = "IMF__";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Answer CORS preflights for any origin (dashboard served from elsewhere).
    pub allow_any_origin: bool,
    /// How long in-flight HTTP requests may take to finish after shutdown.
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_owned(),
            allow_any_origin: false,
            drain_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Flags that win over every configuration source.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub no_worker: bool,
    pub verbose: u8,
}

impl AppConfig {
    /// Loads defaults, the optional YAML file and `IMF__*` environment
    /// variables. Call [`validate`](Self::validate) once CLI overrides are
    /// applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            if !path.is_file() {
                bail!("config file does not exist: {}", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn extract(figment: Figment) -> Result<Self> {
        figment.extract().context("failed to load configuration")
    }

    pub fn validate(&self) -> Result<()> {
        self.runtime
            .validate()
            .context("invalid runtime configuration")
    }

    pub fn apply_cli_overrides(&mut self, cli: &CliOverrides) {
        if let Some(bind) = &cli.bind {
            self.server.bind_addr.clone_from(bind);
        }
        if cli.no_worker {
            self.runtime.worker.enabled = false;
        }
        match cli.verbose {
            0 => {}
            1 => "info".clone_into(&mut self.logging.level),
            2 => "debug".clone_into(&mut self.logging.level),
            _ => "trace".clone_into(&mut self.logging.level),
        }
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to render configuration")
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn no_file_yields_defaults() {
        let config = AppConfig::extract(Figment::new().merge(Serialized::defaults(AppConfig::default())))
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn yaml_overrides_only_what_it_names() {
        let file = yaml(
            r#"
server:
  bind_addr: "0.0.0.0:9000"
logging:
  format: json
runtime:
  worker:
    program: /usr/bin/python3
    restart:
      max_restarts: 2
"#,
        );
        let config = AppConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.runtime.worker.program, "/usr/bin/python3");
        assert_eq!(config.runtime.worker.restart.max_restarts, 2);
        assert_eq!(config.runtime.worker.restart.base_delay_ms, 1_000);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(err.to_string().contains("config file does not exist"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = yaml("server:\n  bind: \"0.0.0.0:1\"\n");
        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("bind"));
    }

    #[test]
    fn invalid_runtime_section_fails_validation() {
        let file = yaml("runtime:\n  broadcast:\n    queue_capacity: 0\n");
        let config = AppConfig::load(Some(file.path())).unwrap();
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("queue_capacity"));
    }

    #[test]
    fn no_worker_flag_is_applied_before_validation() {
        let file = yaml("runtime:\n  worker:\n    program: \"\"\n");
        let mut config = AppConfig::load(Some(file.path())).unwrap();
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("worker.program"));

        config.apply_cli_overrides(&CliOverrides {
            no_worker: true,
            ..CliOverrides::default()
        });
        config.validate().unwrap();
    }

    #[test]
    fn cli_overrides_win() {
        let mut config = AppConfig::default();
        config.apply_cli_overrides(&CliOverrides {
            bind: Some("127.0.0.1:0".to_owned()),
            no_worker: true,
            verbose: 2,
        });
        assert_eq!(config.server.bind_addr, "127.0.0.1:0");
        assert!(!config.runtime.worker.enabled);
        assert_eq!(config.logging.level, "debug");

        config.apply_cli_overrides(&CliOverrides {
            verbose: 5,
            ..CliOverrides::default()
        });
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.server.bind_addr, "127.0.0.1:0");
    }
}
