//! Persisted reply-style settings
//!
//! A flat key/value file (`settings.toml`) holding the model endpoint, API key,
//! model name and the style preferences folded into every prompt. Missing
//! keys fall back to their documented defaults.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable that overrides the stored API key without persisting it
pub const API_KEY_ENV: &str = "TYAN_API_KEY";

const DEFAULT_SCENE: &str = "工作交流";
const DEFAULT_TONE: &str = "专业、友好";
const DEFAULT_TARGET: &str = "客户";
const DEFAULT_OTHER_REQUIREMENTS: &str = "无";
const DEFAULT_API_KEY: &str = "并行智算云的大模型api-key";
const DEFAULT_URL: &str = "https://llmapi.paratera.com/";
const DEFAULT_MODEL_NAME: &str = "Qwen2.5-VL-72B-Instruct-P003";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Unknown setting '{0}'. Valid keys: scene, tone, target, other_requirements, api_key, url, model_name")]
    UnknownKey(String),
    #[error("Settings I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    Scene,
    Tone,
    Target,
    OtherRequirements,
    ApiKey,
    Url,
    ModelName,
}

impl SettingKey {
    pub const ALL: [SettingKey; 7] = [
        SettingKey::Scene,
        SettingKey::Tone,
        SettingKey::Target,
        SettingKey::OtherRequirements,
        SettingKey::ApiKey,
        SettingKey::Url,
        SettingKey::ModelName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::Scene => "scene",
            SettingKey::Tone => "tone",
            SettingKey::Target => "target",
            SettingKey::OtherRequirements => "other_requirements",
            SettingKey::ApiKey => "api_key",
            SettingKey::Url => "url",
            SettingKey::ModelName => "model_name",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            SettingKey::Scene => DEFAULT_SCENE,
            SettingKey::Tone => DEFAULT_TONE,
            SettingKey::Target => DEFAULT_TARGET,
            SettingKey::OtherRequirements => DEFAULT_OTHER_REQUIREMENTS,
            SettingKey::ApiKey => DEFAULT_API_KEY,
            SettingKey::Url => DEFAULT_URL,
            SettingKey::ModelName => DEFAULT_MODEL_NAME,
        }
    }
}

impl std::str::FromStr for SettingKey {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| SettingsError::UnknownKey(s.to_string()))
    }
}

impl std::fmt::Display for SettingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleSettings {
    #[serde(default = "default_scene")]
    pub scene: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_other_requirements")]
    pub other_requirements: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

fn default_scene() -> String {
    DEFAULT_SCENE.to_string()
}
fn default_tone() -> String {
    DEFAULT_TONE.to_string()
}
fn default_target() -> String {
    DEFAULT_TARGET.to_string()
}
fn default_other_requirements() -> String {
    DEFAULT_OTHER_REQUIREMENTS.to_string()
}
fn default_api_key() -> String {
    DEFAULT_API_KEY.to_string()
}
fn default_url() -> String {
    DEFAULT_URL.to_string()
}
fn default_model_name() -> String {
    DEFAULT_MODEL_NAME.to_string()
}

impl Default for StyleSettings {
    fn default() -> Self {
        Self {
            scene: default_scene(),
            tone: default_tone(),
            target: default_target(),
            other_requirements: default_other_requirements(),
            api_key: default_api_key(),
            url: default_url(),
            model_name: default_model_name(),
        }
    }
}

impl StyleSettings {
    pub fn get(&self, key: SettingKey) -> &str {
        match key {
            SettingKey::Scene => &self.scene,
            SettingKey::Tone => &self.tone,
            SettingKey::Target => &self.target,
            SettingKey::OtherRequirements => &self.other_requirements,
            SettingKey::ApiKey => &self.api_key,
            SettingKey::Url => &self.url,
            SettingKey::ModelName => &self.model_name,
        }
    }

    pub fn set(&mut self, key: SettingKey, value: String) {
        let slot = match key {
            SettingKey::Scene => &mut self.scene,
            SettingKey::Tone => &mut self.tone,
            SettingKey::Target => &mut self.target,
            SettingKey::OtherRequirements => &mut self.other_requirements,
            SettingKey::ApiKey => &mut self.api_key,
            SettingKey::Url => &mut self.url,
            SettingKey::ModelName => &mut self.model_name,
        };
        *slot = value;
    }

    /// Stored value, or the key's default when the stored value is blank
    pub fn effective(&self, key: SettingKey) -> &str {
        let value = self.get(key);
        if value.trim().is_empty() {
            key.default_value()
        } else {
            value
        }
    }

    /// Copy with the API key taken from `TYAN_API_KEY` when it is set
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var(API_KEY_ENV)
            && !key.trim().is_empty()
        {
            debug!("Using API key from {}", API_KEY_ENV);
            self.api_key = key;
        }
        self
    }
}

/// Settings file plus its in-memory view
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: StyleSettings,
}

pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dirs = ProjectDirs::from("com", "tyan", "tyan").ok_or(SettingsError::NoConfigDir)?;
    Ok(dirs.config_dir().join("settings.toml"))
}

impl SettingsStore {
    /// Load settings from `path`; a missing file yields defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();

        let settings = match fs::read_to_string(&path) {
            Ok(contents) => {
                let settings =
                    toml::from_str(&contents).map_err(|source| SettingsError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                debug!(path = %path.display(), "Loaded settings");
                settings
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No settings file found, using defaults");
                StyleSettings::default()
            }
            Err(source) => return Err(SettingsError::Io { path, source }),
        };

        Ok(Self { path, settings })
    }

    /// Load from `path` if given, otherwise from the default location
    pub fn open(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(path) => Self::load(path),
            None => Self::load(default_settings_path()?),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &StyleSettings {
        &self.settings
    }

    pub fn get(&self, key: SettingKey) -> &str {
        self.settings.get(key)
    }

    /// Update one key and persist immediately
    pub fn set(&mut self, key: SettingKey, value: impl Into<String>) -> Result<(), SettingsError> {
        self.settings.set(key, value.into());
        self.save()
    }

    /// Rewrite every key to its default and persist
    pub fn reset(&mut self) -> Result<(), SettingsError> {
        self.settings = StyleSettings::default();
        self.save()
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let contents = toml::to_string_pretty(&self.settings)?;
        fs::write(&self.path, contents).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), "Saved settings");
        Ok(())
    }
}
