//! Layered configuration loading.
//!
//! A configuration is assembled from `configuration/base.{yaml,yml,json}`, then the
//! environment specific file (`configuration/{dev,prod}.{yaml,yml,json}`), and finally
//! `APP_`-prefixed environment variables. Nested keys in environment variables are
//! separated by `__`, e.g. `APP_SYNC__BATCH__MAX_SIZE=500`.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use rust_cli_config::builder::{ConfigBuilder, DefaultState};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory, relative to the working directory, holding the configuration files.
const CONFIGURATION_DIR: &str = "configuration";

const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

const ENV_PREFIX: &str = "APP";

const ENV_PREFIX_SEPARATOR: &str = "_";

const ENV_SEPARATOR: &str = "__";

const LIST_SEPARATOR: &str = ",";

/// Implemented by top level configuration structures.
pub trait Config {
    /// Keys whose environment variable values are parsed as comma separated lists.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

#[derive(Debug, Clone, Copy)]
enum ConfigFileKind {
    Base,
    Environment(Environment),
}

impl ConfigFileKind {
    fn stem(&self) -> Cow<'static, str> {
        match self {
            ConfigFileKind::Base => Cow::Borrowed("base"),
            ConfigFileKind::Environment(environment) => Cow::Borrowed(environment.as_str()),
        }
    }
}

impl fmt::Display for ConfigFileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigFileKind::Base => f.write_str("base configuration"),
            ConfigFileKind::Environment(environment) => {
                write!(f, "{environment} environment configuration")
            }
        }
    }
}

/// Errors raised while loading a configuration.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("could not locate {kind_description} in `{directory}`; attempted: {attempted}")]
    ConfigurationFileMissing {
        kind_description: String,
        directory: PathBuf,
        attempted: String,
    },

    #[error("failed to load {kind_description} from `{path}`: {source}")]
    ConfigurationFileLoad {
        kind_description: String,
        path: PathBuf,
        source: rust_cli_config::ConfigError,
    },

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[source] io::Error),

    #[error("failed to build configuration: {0}")]
    Builder(#[source] rust_cli_config::ConfigError),

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),
}

/// Loads `T` from `./configuration` using the environment selected by `APP_ENVIRONMENT`.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    load_config_from(&base_path.join(CONFIGURATION_DIR), environment)
}

/// Loads `T` from the given configuration directory for an explicit environment.
pub fn load_config_from<T>(directory: &Path, environment: Environment) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(
            directory.to_path_buf(),
        ));
    }

    let base_file = find_configuration_file(directory, ConfigFileKind::Base)?;
    let environment_file =
        find_configuration_file(directory, ConfigFileKind::Environment(environment))?;

    let mut environment_source = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    if !T::LIST_PARSE_KEYS.is_empty() {
        environment_source = environment_source
            .try_parsing(true)
            .list_separator(LIST_SEPARATOR);

        for key in T::LIST_PARSE_KEYS {
            environment_source = environment_source.with_list_parse_key(key);
        }
    }

    let builder =
        rust_cli_config::Config::builder().add_source(rust_cli_config::File::from(base_file.clone()));
    check_source(&builder, ConfigFileKind::Base, &base_file)?;

    let builder =
        builder.add_source(rust_cli_config::File::from(environment_file.clone()));
    check_source(
        &builder,
        ConfigFileKind::Environment(environment),
        &environment_file,
    )?;

    let settings = builder
        .add_source(environment_source)
        .build()
        .map_err(LoadConfigError::Builder)?;

    settings
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

fn find_configuration_file(
    directory: &Path,
    kind: ConfigFileKind,
) -> Result<PathBuf, LoadConfigError> {
    let stem = kind.stem();
    let candidates = CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .collect::<Vec<_>>();

    if let Some(path) = candidates.iter().find(|path| path.is_file()) {
        return Ok(path.clone());
    }

    let attempted = candidates
        .iter()
        .map(|path| format!("`{}`", path.display()))
        .collect::<Vec<_>>()
        .join(", ");

    Err(LoadConfigError::ConfigurationFileMissing {
        kind_description: kind.to_string(),
        directory: directory.to_path_buf(),
        attempted,
    })
}

/// Builds the partial configuration so a broken file is reported with its own path.
fn check_source(
    builder: &ConfigBuilder<DefaultState>,
    kind: ConfigFileKind,
    path: &Path,
) -> Result<(), LoadConfigError> {
    builder
        .clone()
        .build()
        .map(|_| ())
        .map_err(|source| LoadConfigError::ConfigurationFileLoad {
            kind_description: kind.to_string(),
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        name: String,
        batch: usize,
    }

    impl Config for TestConfig {
        const LIST_PARSE_KEYS: &'static [&'static str] = &[];
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sync-config-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn environment_file_overrides_base_file() {
        let dir = scratch_dir("override");
        fs::write(dir.join("base.yaml"), "name: base\nbatch: 10\n").unwrap();
        fs::write(dir.join("prod.yaml"), "batch: 20\n").unwrap();

        let config: TestConfig = load_config_from(&dir, Environment::Prod).unwrap();

        assert_eq!(config.name, "base");
        assert_eq!(config.batch, 20);
    }

    #[test]
    fn missing_environment_file_is_reported() {
        let dir = scratch_dir("missing");
        fs::write(dir.join("base.yaml"), "name: base\nbatch: 10\n").unwrap();

        let err = load_config_from::<TestConfig>(&dir, Environment::Dev).unwrap_err();

        assert!(matches!(
            err,
            LoadConfigError::ConfigurationFileMissing { .. }
        ));
    }
}
