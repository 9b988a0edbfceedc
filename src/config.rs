use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    /// Path to the SQLite database file.
    database_path: String,
    telegram_bot_token: String,
    gemini_api_key: String,
    /// Directory attachments are downloaded into. Defaults to "downloads".
    download_dir: Option<String>,
    /// Directory for state files (logs). Defaults to current directory.
    data_dir: Option<String>,
    /// Record each text exchange in the chats table.
    #[serde(default = "default_record_chat_history")]
    record_chat_history: bool,
}

fn default_record_chat_history() -> bool {
    true
}

pub struct Config {
    pub database_path: PathBuf,
    pub telegram_bot_token: String,
    pub gemini_api_key: String,
    /// Directory attachments are downloaded into.
    pub download_dir: PathBuf,
    /// Directory for state files (logs).
    pub data_dir: PathBuf,
    /// Record each text exchange in the chats table.
    pub record_chat_history: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        // Validate required fields
        if file.database_path.is_empty() {
            return Err(ConfigError::Validation("database_path is required".into()));
        }
        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        if file.gemini_api_key.is_empty() {
            return Err(ConfigError::Validation("gemini_api_key is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }

        let download_dir = file
            .download_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("downloads"));
        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            database_path: PathBuf::from(file.database_path),
            telegram_bot_token: file.telegram_bot_token,
            gemini_api_key: file.gemini_api_key,
            download_dir,
            data_dir,
            record_chat_history: file.record_chat_history,
        })
    }
}
