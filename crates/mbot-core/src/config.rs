use std::{
    collections::HashMap,
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::BotId, domain::Protocol, errors::Error, Result};

/// Typed configuration for a bot login.
#[derive(Clone, Debug)]
pub struct BotConfig {
    pub bot_id: BotId,
    pub protocol: Protocol,
    pub device_file: PathBuf,

    // Authorization
    /// Log every authorization channel transition (`MBOT_AUTH_LOGGING`).
    pub auth_debug_logging: bool,
    /// Deadline for the strategy to come up with the next method.
    pub auth_timeout: Duration,
    pub max_auth_attempts: u32,
}

impl BotConfig {
    /// Loads from the process environment, falling back to `.env` in the working directory.
    pub fn load() -> Result<Self> {
        Self::load_with(Path::new(".env"), |key| env::var(key).ok())
    }

    /// Like [`load`](Self::load) with an explicit dotenv path and environment.
    ///
    /// Values from `env` win; the file only fills in keys `env` does not have. A missing
    /// file is not an error.
    pub fn load_with(dotenv: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file = read_dotenv(dotenv)?;
        Self::from_lookup(|key| env(key).or_else(|| file.get(key).cloned()))
    }

    /// Builds a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bot_id = lookup("MBOT_ID")
            .and_then(non_empty)
            .ok_or_else(|| Error::Config("MBOT_ID environment variable is required".to_string()))?;
        let bot_id = bot_id
            .trim()
            .parse::<u64>()
            .map(BotId)
            .map_err(|e| Error::Config(format!("MBOT_ID must be a number: {e}")))?;

        let protocol = match lookup("MBOT_PROTOCOL").and_then(non_empty) {
            Some(raw) => raw.parse::<Protocol>().map_err(Error::Config)?,
            None => Protocol::default(),
        };

        let device_file = lookup("MBOT_DEVICE_FILE")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("device.json"));

        let auth_debug_logging = lookup("MBOT_AUTH_LOGGING")
            .map(|s| parse_bool(&s))
            .unwrap_or(false);
        let auth_timeout = Duration::from_millis(
            parse_num(&lookup, "MBOT_AUTH_TIMEOUT_MS")?.unwrap_or(300_000),
        );
        let max_auth_attempts = parse_num(&lookup, "MBOT_MAX_AUTH_ATTEMPTS")?
            .unwrap_or(5)
            .max(1);

        Ok(Self {
            bot_id,
            protocol,
            device_file,
            auth_debug_logging,
            auth_timeout,
            max_auth_attempts,
        })
    }

    /// Defaults for everything but the account number.
    pub fn for_bot(bot_id: BotId) -> Self {
        Self {
            bot_id,
            protocol: Protocol::default(),
            device_file: PathBuf::from("device.json"),
            auth_debug_logging: false,
            auth_timeout: Duration::from_millis(300_000),
            max_auth_attempts: 5,
        }
    }
}

/// Parses `KEY=value` lines; `#` comments and blank lines are skipped, surrounding quotes
/// are stripped.
fn read_dotenv(path: &Path) -> Result<HashMap<String, String>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let vars = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter_map(|(key, value)| {
            let key = key.trim().trim_start_matches("export ").trim();
            (!key.is_empty()).then(|| (key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect();
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{key}: {e}")))
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
