//! JSON configuration file and command-line entry point.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::charset::{self, CharsetError};

const DEFAULT_STREAM_BASE: &str = "https://trello.com/";
const DEFAULT_API_BASE: &str = "https://api.trello.com/";
const DEFAULT_IRC_PORT: u16 = 6667;
const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_TICK_MS: u64 = 1_000;
const DEFAULT_SHORT_LINK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Parser)]
#[command(
    name = "board-relay",
    author,
    version,
    about = "Relays board activity into chat channels"
)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "CONFIG_FILE")]
    pub config: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Charset(#[from] CharsetError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationConfig {
    pub key: String,
    pub token: String,
    #[serde(default = "default_api_base")]
    pub api_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSettings {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_stream_base")]
    pub base_url: String,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            token: None,
            base_url: default_stream_base(),
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrcSettings {
    pub host: String,
    #[serde(default = "default_irc_port")]
    pub port: u16,
    pub nick: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    pub board: String,
    #[serde(alias = "irc.channel")]
    pub channel: String,
    #[serde(default)]
    pub charset: Option<String>,
    #[serde(default)]
    pub delay_ms: u64,
}

impl SubscriptionConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_short_link_timeout_ms")]
    pub short_link_timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            short_link_timeout_ms: DEFAULT_SHORT_LINK_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub application: ApplicationConfig,
    #[serde(default)]
    pub stream: StreamSettings,
    /// Flat spelling of `stream.token` used by older config files.
    #[serde(rename = "stream.token", default)]
    legacy_stream_token: Option<String>,
    pub irc: IrcSettings,
    pub subscriptions: Vec<SubscriptionConfig>,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require("application.key", &self.application.key)?;
        require("application.token", &self.application.token)?;
        require("stream.token", self.stream_token().unwrap_or_default())?;
        require("irc.host", &self.irc.host)?;
        require("irc.nick", &self.irc.nick)?;
        if self.dispatch.tick_ms == 0 {
            return Err(ConfigError::Invalid("dispatch.tick_ms must be positive".into()));
        }
        if self.stream.rpc_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "stream.rpc_timeout_ms must be positive".into(),
            ));
        }
        self.stream_base_url()?;
        self.api_base_url()?;

        if self.subscriptions.is_empty() {
            return Err(ConfigError::Invalid("no subscriptions configured".into()));
        }
        let mut boards = HashSet::new();
        for subscription in &self.subscriptions {
            require("subscriptions[].board", &subscription.board)?;
            if !is_channel_name(&subscription.channel) {
                return Err(ConfigError::Invalid(format!(
                    "`{}` is not a channel name",
                    subscription.channel
                )));
            }
            if !boards.insert(subscription.board.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "board {} is subscribed more than once",
                    subscription.board
                )));
            }
            if let Some(label) = &subscription.charset {
                charset::lookup(label)?;
            }
        }
        Ok(())
    }

    pub fn stream_token(&self) -> Option<&str> {
        self.stream
            .token
            .as_deref()
            .or(self.legacy_stream_token.as_deref())
    }

    pub fn stream_base_url(&self) -> Result<Url, ConfigError> {
        Ok(Url::parse(&self.stream.base_url)?)
    }

    pub fn api_base_url(&self) -> Result<Url, ConfigError> {
        Ok(Url::parse(&with_trailing_slash(&self.application.api_base_url))?)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.stream.rpc_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.dispatch.tick_ms)
    }

    pub fn short_link_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.short_link_timeout_ms)
    }
}

fn require(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must not be empty")));
    }
    Ok(())
}

fn is_channel_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some('#' | '&' | '+' | '!'))
        && name.len() > 1
        && !name.contains([' ', ',', '\u{7}'])
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_stream_base() -> String {
    DEFAULT_STREAM_BASE.to_string()
}

fn default_irc_port() -> u16 {
    DEFAULT_IRC_PORT
}

fn default_rpc_timeout_ms() -> u64 {
    DEFAULT_RPC_TIMEOUT_MS
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}

fn default_short_link_timeout_ms() -> u64 {
    DEFAULT_SHORT_LINK_TIMEOUT_MS
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> serde_json::Value {
        json!({
            "application": {"key": "app-key", "token": "app-token"},
            "stream": {"token": "stream-token"},
            "irc": {"host": "irc.example.net", "nick": "boardbot"},
            "subscriptions": [
                {"board": "b1", "channel": "#team", "charset": "iso-2022-jp", "delay_ms": 30000}
            ]
        })
    }

    fn parse(value: serde_json::Value) -> Result<Config, ConfigError> {
        Config::from_json(&value.to_string())
    }

    #[test]
    fn applies_defaults() {
        let config = parse(base()).unwrap();
        assert_eq!(config.stream_token(), Some("stream-token"));
        assert_eq!(config.irc.port, 6667);
        assert_eq!(config.tick(), Duration::from_secs(1));
        assert_eq!(config.rpc_timeout(), Duration::from_secs(30));
        assert_eq!(config.short_link_timeout(), Duration::from_secs(5));
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.stream_base_url().unwrap().as_str(), "https://trello.com/");
        assert_eq!(
            config.api_base_url().unwrap().as_str(),
            "https://api.trello.com/"
        );
        assert_eq!(config.subscriptions[0].delay(), Duration::from_secs(30));
    }

    #[test]
    fn accepts_flat_legacy_keys() {
        let config = parse(json!({
            "application": {"key": "k", "token": "t"},
            "stream.token": "legacy-token",
            "irc": {"host": "irc.example.net", "port": 6697, "nick": "bot", "password": "pw"},
            "subscriptions": [{"board": "b1", "irc.channel": "#legacy"}]
        }))
        .unwrap();
        assert_eq!(config.stream_token(), Some("legacy-token"));
        assert_eq!(config.subscriptions[0].channel, "#legacy");
        assert_eq!(config.subscriptions[0].charset, None);
        assert_eq!(config.irc.password.as_deref(), Some("pw"));
    }

    #[test]
    fn api_base_gains_trailing_slash() {
        let mut value = base();
        value["application"]["api_base_url"] = json!("http://127.0.0.1:8080/trello");
        let config = parse(value).unwrap();
        assert_eq!(
            config.api_base_url().unwrap().join("1/boards/b1").unwrap().as_str(),
            "http://127.0.0.1:8080/trello/1/boards/b1"
        );
    }

    #[test]
    fn rejects_missing_stream_token() {
        let mut value = base();
        value["stream"] = json!({});
        assert!(matches!(parse(value), Err(ConfigError::Invalid(msg)) if msg.contains("stream.token")));
    }

    #[test]
    fn rejects_empty_subscriptions() {
        let mut value = base();
        value["subscriptions"] = json!([]);
        assert!(matches!(parse(value), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_channel_names() {
        for channel in ["team", "#", "#two words"] {
            let mut value = base();
            value["subscriptions"][0]["channel"] = json!(channel);
            assert!(
                matches!(parse(value), Err(ConfigError::Invalid(_))),
                "{channel}"
            );
        }
    }

    #[test]
    fn rejects_duplicate_boards() {
        let mut value = base();
        value["subscriptions"] = json!([
            {"board": "b1", "channel": "#one"},
            {"board": "b1", "channel": "#two"}
        ]);
        assert!(matches!(parse(value), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_charsets() {
        let mut value = base();
        value["subscriptions"][0]["charset"] = json!("klingon");
        assert!(matches!(parse(value), Err(ConfigError::Charset(_))));
    }

    #[test]
    fn rejects_zero_tick() {
        let mut value = base();
        value["dispatch"] = json!({"tick_ms": 0});
        assert!(matches!(parse(value), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn reports_malformed_json_and_missing_files() {
        assert!(matches!(
            Config::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
        let missing = std::env::temp_dir().join("board-relay-missing-config.json");
        assert!(matches!(
            Config::load(&missing),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn loads_from_disk() {
        let path = std::env::temp_dir().join(format!(
            "board-relay-config-{}.json",
            std::process::id()
        ));
        fs::write(&path, base().to_string()).unwrap();
        let config = Config::load(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(config.subscriptions[0].board, "b1");
    }

    #[test]
    fn cli_reads_config_path() {
        let cli = Cli::try_parse_from(["board-relay", "--config", "/etc/relay.json"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/relay.json"));
    }
}
