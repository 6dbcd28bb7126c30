//! Service settings for the `tase2srv` binary
//!
//! Loaded with figment from an optional YAML/TOML/JSON file, then merged
//! with `TASE2SRV_`-prefixed environment variables (nested keys use `__`,
//! e.g. `TASE2SRV_LOGGING__LEVEL=trace`).

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, Tase2Error};

pub const ENV_PREFIX: &str = "TASE2SRV_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Asset name used for bridge status readings
    pub asset: String,
    /// Root of `etc/certs`
    pub data_dir: PathBuf,
    pub protocol_stack: PathBuf,
    pub exchanged_data: PathBuf,
    /// Optional; TLS stays unconfigured without it
    pub tls_conf: Option<PathBuf>,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            asset: "tase2".to_string(),
            data_dir: PathBuf::from("."),
            protocol_stack: PathBuf::from("config/protocol_stack.json"),
            exchanged_data: PathBuf::from("config/exchanged_data.json"),
            tls_conf: None,
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

impl ServiceSettings {
    /// Defaults, then the settings file (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ServiceSettings::default()));

        if let Some(path) = path {
            let extension = path
                .extension()
                .and_then(|s| s.to_str())
                .ok_or_else(|| Tase2Error::config("Invalid settings file extension"))?;

            figment = match extension {
                "json" => figment.merge(Json::file(path)),
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                _ => {
                    return Err(Tase2Error::config(format!(
                        "Unsupported settings format: {}",
                        extension
                    )))
                },
            };
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .map_err(|e| Tase2Error::config(format!("Failed to parse settings: {}", e)))
    }

    /// Resolve document paths relative to the settings file directory.
    pub fn resolve_relative_to(mut self, base: &Path) -> Self {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.protocol_stack);
        resolve(&mut self.exchanged_data);
        if let Some(tls) = self.tls_conf.as_mut() {
            resolve(tls);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        figment::Jail::expect_with(|_jail| {
            let settings = ServiceSettings::load(None).map_err(|e| e.to_string())?;
            assert_eq!(settings, ServiceSettings::default());
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file_and_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "tase2srv.yaml",
                r#"
asset: iccp_north
protocol_stack: conf/stack.json
exchanged_data: conf/exchange.json
logging:
  level: debug
"#,
            )?;
            jail.set_env("TASE2SRV_LOGGING__LEVEL", "trace");

            let settings = ServiceSettings::load(Some(Path::new("tase2srv.yaml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(settings.asset, "iccp_north");
            assert_eq!(settings.logging.level, "trace");
            assert_eq!(settings.protocol_stack, PathBuf::from("conf/stack.json"));
            assert!(settings.tls_conf.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.ini");
        std::fs::write(&path, "asset=x").unwrap();
        assert!(ServiceSettings::load(Some(&path)).is_err());
    }

    #[test]
    fn test_resolve_relative_paths() {
        let settings = ServiceSettings {
            tls_conf: Some(PathBuf::from("tls.json")),
            ..Default::default()
        }
        .resolve_relative_to(Path::new("/etc/tase2"));
        assert_eq!(settings.protocol_stack, PathBuf::from("/etc/tase2/config/protocol_stack.json"));
        assert_eq!(settings.tls_conf, Some(PathBuf::from("/etc/tase2/tls.json")));
    }
}
