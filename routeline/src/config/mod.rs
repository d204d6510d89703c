use crate::mapping::cors::CorsConfiguration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Settings for the request-mapping strategy and its handler mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Let `/users/` match a mapping declared as `/users`.
    pub use_trailing_slash_match: bool,
    /// Strip `;`-delimited matrix content from the path before lookup.
    pub remove_semicolon_content: bool,
    /// Name every mapping with the default naming strategy.
    pub naming_strategy: bool,
    /// Combined with every handler's own CORS configuration.
    pub global_cors: Option<CorsConfiguration>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            use_trailing_slash_match: true,
            remove_semicolon_content: true,
            naming_strategy: true,
            global_cors: None,
        }
    }
}

/// Settings for the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Raise `NoHandlerFound` through the exception resolvers instead of
    /// writing a plain 404.
    pub throw_exception_if_no_handler_found: bool,
    /// Default bound on how long a suspended dispatch may wait for its result.
    pub async_timeout_ms: Option<u64>,
}

impl DispatcherConfig {
    pub fn async_timeout(&self) -> Option<Duration> {
        self.async_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Default)]
pub struct Config<C> {
    config: C,
}

impl<C> Config<C>
where
    C: Default + DeserializeOwned,
{
    pub fn new(provider: impl ConfigProvider<C>) -> Result<Self, ConfigProviderError> {
        provider.load().map(|config| Config { config })
    }

    pub fn get(&self) -> &C {
        &self.config
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.config
    }

    pub fn into_inner(self) -> C {
        self.config
    }
}

pub trait ConfigProvider<C>
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError>;
}

pub struct DefaultConfigProvider;

impl<C> ConfigProvider<C> for DefaultConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(C::default())
    }
}

/// Loads a JSON file from `base_path/config_name`. Missing fields take their defaults.
pub struct FileConfigProvider {
    pub base_path: String,
    pub config_name: String,
}

impl<C> ConfigProvider<C> for FileConfigProvider
where
    C: Default + DeserializeOwned,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        let config_path = Path::new(&self.base_path).join(&self.config_name);
        let file = File::open(&config_path).map_err(|e| {
            let msg = format!("Could not open config file {}: {}", config_path.display(), e);
            ConfigProviderError::load_error(msg)
        })?;
        serde_json::from_reader(file).map_err(|e| {
            let msg = format!("Could not parse config file {}: {}", config_path.display(), e);
            ConfigProviderError::load_error(msg)
        })
    }
}

pub struct ProgrammaticConfigProvider<C> {
    pub config: C,
}

impl<C> ConfigProvider<C> for ProgrammaticConfigProvider<C>
where
    C: Default + DeserializeOwned + Clone + Serialize,
{
    fn load(&self) -> Result<C, ConfigProviderError> {
        Ok(self.config.clone())
    }
}

#[derive(Error, Debug)]
pub enum ConfigProviderError {
    #[error("Could not load config. {message}")]
    Load { message: String },
}

impl ConfigProviderError {
    #[inline]
    pub(crate) fn load_error(msg: impl Into<String>) -> Self {
        Self::Load {
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_provider() {
        let config: Config<MappingConfig> = Config::new(DefaultConfigProvider).unwrap();
        assert!(config.get().use_trailing_slash_match);
        assert!(config.get().naming_strategy);

        let config: Config<DispatcherConfig> = Config::new(DefaultConfigProvider).unwrap();
        assert!(!config.get().throw_exception_if_no_handler_found);
        assert_eq!(config.get().async_timeout(), None);
    }

    #[test]
    fn test_programmatic_provider() {
        let provider = ProgrammaticConfigProvider {
            config: DispatcherConfig {
                throw_exception_if_no_handler_found: true,
                async_timeout_ms: Some(250),
            },
        };
        let config = Config::new(provider).unwrap();
        assert!(config.get().throw_exception_if_no_handler_found);
        assert_eq!(config.get().async_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_file_provider() {
        let dir = std::env::temp_dir().join(format!("routeline-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut file = File::create(dir.join("mapping.json")).unwrap();
        file.write_all(
            br#"{
                "use_trailing_slash_match": false,
                "global_cors": { "allowed_origins": ["https://a.example"] }
            }"#,
        )
        .unwrap();

        let provider = FileConfigProvider {
            base_path: dir.to_string_lossy().into_owned(),
            config_name: "mapping.json".to_string(),
        };
        let config: Config<MappingConfig> = Config::new(provider).unwrap();
        assert!(!config.get().use_trailing_slash_match);
        assert!(config.get().remove_semicolon_content);
        assert_eq!(
            config.get().global_cors.as_ref().and_then(|cors| cors.allowed_origins()),
            Some(&["https://a.example".to_string()][..])
        );

        let missing = FileConfigProvider {
            base_path: dir.to_string_lossy().into_owned(),
            config_name: "missing.json".to_string(),
        };
        let result: Result<Config<MappingConfig>, _> = Config::new(missing);
        assert!(matches!(result, Err(ConfigProviderError::Load { .. })));

        std::fs::remove_dir_all(dir).unwrap();
    }
}
