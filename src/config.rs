use easy_error::{Error, ResultExt};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Local address to accept connections on, e.g. "127.0.0.1:8388".
    pub listen: String,
    pub proxy: ProxyServerConfig,
    /// Fixed destination every connection is forwarded to, "host:port".
    pub target: String,
    #[serde(default)]
    pub timeouts: Timeouts,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProxyServerConfig {
    pub server: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    pub idle: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts { idle: 600 }
    }
}

impl Config {
    pub async fn load(path: &str) -> Result<Self, Error> {
        let s = tokio::fs::read(path).await.context("read file")?;
        let s = String::from_utf8(s).context("parse utf8")?;
        serde_yaml_ng::from_str(&s).context("parse yaml")
    }
}
