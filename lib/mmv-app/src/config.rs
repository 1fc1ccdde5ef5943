//! Configuration loading.

use std::path::{Path, PathBuf};

use figment::{
    error::Kind,
    providers::{Data, Env, Serialized, Yaml},
    value::{Dict, Map},
    Figment, Metadata, Profile, Provider,
};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A configuration file could not be read or parsed.
    #[snafu(display("Failed to load configuration file '{}'.", path.display()))]
    File {
        /// Path to the file.
        path: PathBuf,

        /// Error source.
        source: figment::Error,
    },

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        help_text: String,

        /// Name of the missing field.
        field: String,
    },

    /// A field had an unexpected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Any other error while deserializing the configuration.
    #[snafu(display("Failed to deserialize configuration."))]
    Invalid {
        /// Error source.
        source: figment::Error,
    },
}

/// YAML file contents, read eagerly so that a missing or malformed file is reported when it's added.
struct FileProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl FileProvider {
    fn from_yaml(path: &Path) -> Result<Self, figment::Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let data = Data::<Yaml>::string(&contents).data()?;

        Ok(Self {
            data,
            metadata: Metadata::from("YAML file", path),
        })
    }
}

impl Provider for FileProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Ok(self.data.clone())
    }
}

struct BoxedProvider(Box<dyn Provider>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        self.0.data()
    }
}

/// Loads configuration from a YAML file and the environment.
///
/// Sources added later take precedence over sources added earlier. Once every source has been added, the merged
/// configuration is deserialized with [`into_typed`][Self::into_typed].
#[derive(Default)]
pub struct ConfigurationLoader {
    env_prefix: Option<String>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid YAML, an error is returned.
    pub fn from_yaml<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let provider = FileProvider::from_yaml(path).context(File { path })?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring it if it cannot be read or parsed.
    pub fn try_from_yaml<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        match FileProvider::from_yaml(path) {
            Ok(provider) => self.providers.push(BoxedProvider(Box::new(provider))),
            Err(e) => {
                debug!(error = %e, file_path = %path.display(), "Unable to read YAML configuration file. Ignoring.")
            }
        }
        self
    }

    /// Loads configuration from environment variables starting with `prefix`.
    ///
    /// An underscore is appended to the prefix if it doesn't already end with one, and matching is case-insensitive.
    /// Nested fields are separated by a double underscore: with a prefix of `app`, `APP_LOGGING__LEVEL` sets the
    /// `level` field of `logging`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error is returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return EmptyPrefix.fail();
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // Snapshot the environment now, so later changes to it don't leak into the configuration.
        let values = Env::prefixed(&prefix).split("__").data().context(Invalid)?;
        if let Some(dict) = values.get(&Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(dict.clone()))));
        }
        self.env_prefix = Some(prefix);
        Ok(self)
    }

    /// Consumes the loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error is returned.
    pub fn into_typed<T>(self) -> Result<T, ConfigurationError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let figment = self
            .providers
            .into_iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider));

        figment
            .extract()
            .map_err(|e| from_figment_error(self.env_prefix.as_deref(), e))
    }
}

fn from_figment_error(env_prefix: Option<&str>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut keys = vec![format!("`{}`", field)];
            if let Some(prefix) = env_prefix {
                keys.push(format!("`{}{}`", prefix, field.to_uppercase()));
            }

            ConfigurationError::MissingField {
                help_text: format!("Try setting {}.", keys.join(" or ")),
                field: field.into_owned(),
            }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Invalid { source: e },
    }
}
