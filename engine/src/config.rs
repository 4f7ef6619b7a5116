use serde::Deserialize;
use std::{env, path::PathBuf, time::Duration};

use tally_context::extraction::DEFAULT_EXTRACTION_TIMEOUT;
use tally_providers::{DEFAULT_REQUEST_TIMEOUT_SECS, OPENAI_API_BASE_URL};
use tally_types::{ApiKey, ModelName, ModelParseError};
use thiserror::Error;

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 8;

pub const DEFAULT_INSTRUCTIONS: &str = "\
You are a calculator with memory.

Always use the calculate function for arithmetic; never compute results yourself.
When the user wants to keep a value (for example \"remember that as discount\"), confirm that it was saved.
When the user asks about a saved value, use the memory provided in these instructions.";

// Default value function for serde (bool::default() is false, so only true needs a fn)
const fn default_true() -> bool {
    true
}

/// Contents of `~/.tally/config.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct TallyConfig {
    pub app: Option<AppConfig>,
    pub api_keys: Option<ApiKeys>,
    pub openai: Option<OpenAIConfig>,
    pub memory: Option<MemoryConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("OPENAI_API_KEY is not set (set it in the environment or [api_keys] openai)")]
    MissingApiKey,
    #[error("invalid model '{value}': {source}")]
    InvalidModel {
        value: String,
        source: ModelParseError,
    },
}

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    pub model: Option<String>,
    /// Model for memory extraction; defaults to `model`.
    pub extraction_model: Option<String>,
    /// Replaces the built-in system instructions.
    pub instructions: Option<String>,
    pub max_tool_iterations: Option<usize>,
}

#[derive(Default, Deserialize)]
pub struct ApiKeys {
    pub openai: Option<String>,
}

// Manual Debug impl to prevent leaking API keys in logs.
impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let masked = if self.openai.is_some() {
            "[REDACTED]"
        } else {
            "None"
        };
        f.debug_struct("ApiKeys").field("openai", &masked).finish()
    }
}

/// ```toml
/// [openai]
/// base_url = "https://api.openai.com"
/// timeout_secs = 60
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct OpenAIConfig {
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// ```toml
/// [memory]
/// enabled = true
/// extraction_timeout_secs = 30
/// session_path = "${HOME}/.tally/session.json"
/// ```
#[derive(Debug, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub extraction_timeout_secs: Option<u64>,
    pub session_path: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extraction_timeout_secs: None,
            session_path: None,
        }
    }
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

impl TallyConfig {
    /// Load the default config file. `Ok(None)` when it does not exist.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(path).map(Some),
            _ => Ok(None),
        }
    }

    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read { path, source: err });
            }
        };

        toml::from_str(&content).map_err(|err| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            ConfigError::Parse { path, source: err }
        })
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

/// `~/.tally`, the root for config, logs and sessions.
#[must_use]
pub fn tally_home() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tally"))
}

pub fn config_path() -> Option<PathBuf> {
    tally_home().map(|home| home.join("config.toml"))
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: ApiKey,
    pub model: ModelName,
    pub extraction_model: Option<ModelName>,
    pub instructions: String,
    pub max_tool_iterations: usize,
    pub base_url: String,
    pub request_timeout: Duration,
    pub memory_enabled: bool,
    pub extraction_timeout: Duration,
    pub session_path: Option<PathBuf>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_model(raw: &str) -> Result<ModelName, ConfigError> {
    ModelName::parse(raw).map_err(|source| ConfigError::InvalidModel {
        value: raw.to_string(),
        source,
    })
}

impl Settings {
    /// Resolve against the process environment.
    pub fn from_env(config: Option<TallyConfig>) -> Result<Self, ConfigError> {
        Self::resolve(config, |name| env::var(name).ok())
    }

    /// Merge file config with environment overrides.
    ///
    /// `OPENAI_API_KEY`, `OPENAI_MODEL` and `TALLY_SESSION_PATH` win over the
    /// file. String values from the file get `${VAR}` expansion.
    pub fn resolve(
        config: Option<TallyConfig>,
        env_lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config = config.unwrap_or_default();
        let app = config.app.unwrap_or_default();
        let openai = config.openai.unwrap_or_default();
        let memory = config.memory.unwrap_or_default();
        let file_value = |v: Option<String>| non_blank(v.map(|s| expand_env_vars(&s)));

        let api_key = non_blank(env_lookup("OPENAI_API_KEY"))
            .or_else(|| file_value(config.api_keys.and_then(|k| k.openai)))
            .ok_or(ConfigError::MissingApiKey)?;
        let api_key = ApiKey::new(api_key).map_err(|_| ConfigError::MissingApiKey)?;

        let model = match non_blank(env_lookup("OPENAI_MODEL")).or_else(|| file_value(app.model))
        {
            Some(raw) => parse_model(&raw)?,
            None => ModelName::default(),
        };

        let extraction_model = file_value(app.extraction_model)
            .map(|raw| parse_model(&raw))
            .transpose()?;

        let session_path = non_blank(env_lookup("TALLY_SESSION_PATH"))
            .or_else(|| file_value(memory.session_path))
            .map(PathBuf::from);

        Ok(Self {
            api_key,
            model,
            extraction_model,
            instructions: file_value(app.instructions)
                .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string()),
            max_tool_iterations: app
                .max_tool_iterations
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_TOOL_ITERATIONS),
            base_url: file_value(openai.base_url)
                .unwrap_or_else(|| OPENAI_API_BASE_URL.to_string()),
            request_timeout: Duration::from_secs(
                openai.timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            memory_enabled: memory.enabled,
            extraction_timeout: memory
                .extraction_timeout_secs
                .map_or(DEFAULT_EXTRACTION_TIMEOUT, Duration::from_secs),
            session_path,
        })
    }
}
