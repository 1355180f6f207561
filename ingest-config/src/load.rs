use std::io;
use std::path::{Path, PathBuf};

use config::builder::{ConfigBuilder, DefaultState};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory holding the layered configuration files, relative to the working
/// directory of the process.
const CONFIGURATION_DIR: &str = "configuration";

/// File extensions probed for each configuration layer, in priority order.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Prefix for environment variable configuration overrides.
const ENV_PREFIX: &str = "APP";

/// Separator for nested configuration keys in environment variables
/// (`APP_INGEST__LOAD_FANOUT` sets `ingest.load_fanout`).
const ENV_NESTING_SEPARATOR: &str = "__";

/// One layer of the configuration stack, lower layers first.
#[derive(Debug, Clone, Copy)]
enum Layer {
    Base,
    Environment(Environment),
}

impl Layer {
    fn file_stem(self) -> &'static str {
        match self {
            Layer::Base => "base",
            Layer::Environment(env) => env.as_str(),
        }
    }

    fn describe(self) -> String {
        match self {
            Layer::Base => "base configuration".to_owned(),
            Layer::Environment(env) => format!("{env} environment configuration"),
        }
    }

    /// Resolves the layer to a concrete file in `directory`, trying every
    /// supported extension.
    fn locate(self, directory: &Path) -> Result<PathBuf, LoadConfigError> {
        let stem = self.file_stem();

        for extension in CONFIG_FILE_EXTENSIONS {
            let candidate = directory.join(format!("{stem}.{extension}"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        let attempted = CONFIG_FILE_EXTENSIONS
            .iter()
            .map(|extension| {
                let path = directory.join(format!("{stem}.{extension}"));
                format!("`{}`", path.display())
            })
            .collect::<Vec<_>>()
            .join(", ");

        Err(LoadConfigError::ConfigurationFileMissing {
            kind_description: self.describe(),
            directory: directory.to_path_buf(),
            attempted,
        })
    }
}

/// Errors that can occur while loading configuration files and overrides.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    /// Failed to determine the current working directory.
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    /// The configured `configuration` directory does not exist.
    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    /// One of the required configuration files is absent.
    #[error("could not locate {kind_description} in `{directory}`; attempted: {attempted}")]
    ConfigurationFileMissing {
        kind_description: String,
        directory: PathBuf,
        attempted: String,
    },

    /// A configuration file exists but does not parse.
    #[error("failed to load {kind_description} from `{path}`: {source}")]
    ConfigurationFileLoad {
        kind_description: String,
        path: PathBuf,
        source: config::ConfigError,
    },

    /// The merged configuration does not deserialize into the target struct.
    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] config::ConfigError),

    /// Failed to determine the runtime environment (`APP_ENVIRONMENT`).
    #[error("failed to determine runtime environment: {0}")]
    Environment(#[from] io::Error),

    /// Failed to initialize the configuration builder.
    #[error("failed to initialize configuration builder: {0}")]
    Builder(#[source] config::ConfigError),
}

/// Loads hierarchical configuration from base, environment, and environment-variable
/// sources.
///
/// Reads `configuration/base.(yaml|yml|json)` and `configuration/{environment}.(yaml|yml|json)`
/// below the current directory, then applies overrides from `APP_`-prefixed environment
/// variables.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: DeserializeOwned,
{
    let current_dir = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    load_config_from_dir(&current_dir.join(CONFIGURATION_DIR), environment)
}

/// Same as [`load_config`] but with an explicit configuration directory and environment.
pub fn load_config_from_dir<T>(
    configuration_directory: &Path,
    environment: Environment,
) -> Result<T, LoadConfigError>
where
    T: DeserializeOwned,
{
    if !configuration_directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(
            configuration_directory.to_path_buf(),
        ));
    }

    let mut builder = config::Config::builder();
    for layer in [Layer::Base, Layer::Environment(environment)] {
        builder = stack_layer(builder, layer, configuration_directory)?;
    }

    let overrides = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator(ENV_NESTING_SEPARATOR);

    builder
        .add_source(overrides)
        .build()
        .map_err(LoadConfigError::Builder)?
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

/// Locates the file for `layer` and stacks it onto `builder`.
fn stack_layer(
    builder: ConfigBuilder<DefaultState>,
    layer: Layer,
    directory: &Path,
) -> Result<ConfigBuilder<DefaultState>, LoadConfigError> {
    let path = layer.locate(directory)?;
    let builder = builder.add_source(config::File::from(path.clone()));

    // Parse eagerly so a broken file is reported against its own path instead of
    // surfacing later as a generic deserialization failure.
    if let Err(source) = builder.clone().build() {
        return Err(LoadConfigError::ConfigurationFileLoad {
            kind_description: layer.describe(),
            path,
            source,
        });
    }

    Ok(builder)
}
