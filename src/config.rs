use crate::error::ProxyError;
use serde::Deserialize;
use std::fs::File;

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    80
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Panic,
    Fatal,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Panic and fatal have no `log` counterpart and collapse to error.
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Panic | LogLevel::Fatal | LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Prefix,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMatchKind {
    #[default]
    Exact,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    #[default]
    Ws,
    Wss,
}

impl std::fmt::Display for UpstreamScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamScheme::Ws => write!(f, "ws"),
            UpstreamScheme::Wss => write!(f, "wss"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GlobalConfig {
    #[serde(default)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_ip")]
    pub ip: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    #[serde(rename = "match", default)]
    pub matcher: MatchConfig,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MatchConfig {
    #[serde(default)]
    pub path: Vec<MatchRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchRuleConfig {
    #[serde(rename = "type")]
    pub kind: MatchKind,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub scheme: UpstreamScheme,
    #[serde(rename = "override", default)]
    pub overrides: OverrideConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OverrideConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub headers: Vec<HeaderOverrideConfig>,
    #[serde(default)]
    pub websocket_payload: Vec<PayloadRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderOverrideConfig {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayloadRuleConfig {
    #[serde(rename = "type", default)]
    pub kind: PayloadMatchKind,
    #[serde(rename = "match")]
    pub pattern: String,
    pub value: String,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Config, ProxyError> {
        let file = File::open(path)
            .map_err(|e| ProxyError::Config(format!("cannot open {path}: {e}")))?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ProxyError> {
        if self.servers.is_empty() {
            return Err(ProxyError::Config("no servers configured".into()));
        }
        for server in &self.servers {
            if server.upstream.ip.is_empty() {
                return Err(ProxyError::Config(format!(
                    "server {}:{} has no upstream ip",
                    server.ip, server.port
                )));
            }
        }
        Ok(())
    }

    /// Listen addresses across all servers, deduplicated while keeping
    /// declaration order.
    pub fn listen_addrs(&self) -> Vec<String> {
        let mut addrs = Vec::new();
        for server in &self.servers {
            let addr = format!("{}:{}", server.ip, server.port);
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }
}
