//! Host configuration, layered from built-in defaults, config files and the environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::providers::{Data, Env, Format as _, Json, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tether::ManagerConfig;

use crate::logging::LevelFilter;

/// Base name of the configuration files, without extension.
const CONFIG_FILE: &str = ".tether";
const ENV_PREFIX: &str = "TETHER_";

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log_level: Option<LevelFilter>,
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub manager: ManagerConfig,
}

/// Directories searched for `.tether.{toml,json,yaml,yml}`, lowest priority first.
fn search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = directories::UserDirs::new().map(|user| user.home_dir().to_path_buf()) {
        paths.push(home);
    }
    paths.push(PathBuf::from("."));
    paths
}

fn figment(paths: &[PathBuf], extra: Option<&Path>) -> anyhow::Result<Figment> {
    let defaults = serde_json::to_string_pretty(&Config::default())
        .context("Serializing the default configuration failed")?;

    let mut figment = Figment::from(Data::<Json>::string(&defaults));
    for path in paths {
        figment = figment
            .merge(Toml::file(path.join(format!("{CONFIG_FILE}.toml"))))
            .merge(Json::file(path.join(format!("{CONFIG_FILE}.json"))))
            .merge(Yaml::file(path.join(format!("{CONFIG_FILE}.yaml"))))
            .merge(Yaml::file(path.join(format!("{CONFIG_FILE}.yml"))));
    }

    if let Some(extra) = extra {
        figment = match extra.extension().and_then(|e| e.to_str()) {
            Some("toml") => figment.merge(Toml::file_exact(extra)),
            Some("json") => figment.merge(Json::file_exact(extra)),
            Some("yml" | "yaml") => figment.merge(Yaml::file_exact(extra)),
            _ => anyhow::bail!(
                "File format of {} not recognized from extension (supported: .toml, .json, .yaml / .yml)",
                extra.display()
            ),
        };
    }

    Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// Loads the configuration. `extra` is an explicitly requested file that overrides the ones found
/// in the search paths, and must exist.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    load_from(&search_paths(), extra)
}

fn load_from(paths: &[PathBuf], extra: Option<&Path>) -> anyhow::Result<Config> {
    let config = figment(paths, extra)?.extract::<Config>().map_err(|error| {
        let messages = error
            .into_iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        anyhow::anyhow!("Failed to parse the configuration:\n{messages}")
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn defaults_without_files() {
        Jail::expect_with(|jail| {
            let config = load_from(&[jail.directory().to_path_buf()], None).unwrap();
            assert_eq!(config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn file_overrides_single_fields() {
        Jail::expect_with(|jail| {
            jail.create_file(
                ".tether.toml",
                r#"
                log_level = "DEBUG"

                [manager]
                tcp_connect_timeout = 750

                [manager.rtt]
                corruption_threshold = 5
                "#,
            )?;

            let config = load_from(&[jail.directory().to_path_buf()], None).unwrap();

            assert_eq!(config.log_level, Some(LevelFilter::Debug));
            assert_eq!(
                config.manager.tcp_connect_timeout,
                Duration::from_millis(750)
            );
            assert_eq!(config.manager.rtt.corruption_threshold, 5);
            // Untouched fields keep their defaults.
            assert_eq!(
                config.manager.udp_poll_timeout,
                ManagerConfig::default().udp_poll_timeout
            );
            Ok(())
        });
    }

    #[test]
    fn environment_wins_over_files() {
        Jail::expect_with(|jail| {
            jail.create_file(".tether.yaml", "manager:\n  read_buffer_size: 1024\n")?;
            jail.set_env("TETHER_MANAGER__READ_BUFFER_SIZE", "2048");

            let config = load_from(&[jail.directory().to_path_buf()], None).unwrap();

            assert_eq!(config.manager.read_buffer_size, 2048);
            Ok(())
        });
    }

    #[test]
    fn explicit_file_must_exist() {
        Jail::expect_with(|jail| {
            let missing = jail.directory().join("missing.toml");
            assert!(load_from(&[], Some(&missing)).is_err());
            Ok(())
        });
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let error = load_from(&[], Some(Path::new("tether.ini"))).unwrap_err();
        assert!(error.to_string().contains("not recognized"));
    }

    #[test]
    fn unknown_items_fail() {
        Jail::expect_with(|jail| {
            jail.create_file(".tether.json", r#"{ "bogus_invalid_item": "oops" }"#)?;

            assert!(load_from(&[jail.directory().to_path_buf()], None).is_err());
            Ok(())
        });
    }
}
