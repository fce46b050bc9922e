use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub net: NetConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WalletConfig {
    #[serde(default = "default_rpc_host")]
    pub rpc_host: String,
    #[serde(default)]
    pub rpc_user: String,
    #[serde(default)]
    pub rpc_password: String,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default)]
    pub trusted_peer: Option<String>,
    #[serde(default)]
    pub use_tor: bool,
    #[serde(default = "default_tor_control")]
    pub tor_control_port: u16,
    #[serde(default = "default_notify_port")]
    pub notify_port: u16,
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_startup_deadline")]
    pub startup_deadline_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeConfig {
    #[serde(default = "default_refresh")]
    pub refresh_secs: u64,
    #[serde(default)]
    pub socks_proxy: Option<String>, // e.g. socks5h://127.0.0.1:9050
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub bootstrap: Vec<String>, // multiaddrs
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_message")]
    pub max_message_size: usize,
}

fn default_rpc_host() -> String { "localhost:11772".into() }
fn default_rpc_timeout() -> u64 { 60 }
fn default_binary() -> String { "phored".into() }
fn default_tor_control() -> u16 { 9051 }
fn default_notify_port() -> u16 { 8330 }
fn default_startup_deadline() -> u64 { 30 }
fn default_refresh() -> u64 { 15 * 60 }
fn default_listen() -> String { "/ip4/0.0.0.0/tcp/4001".into() }
fn default_request_timeout() -> u64 { 30 }
fn default_max_message() -> usize { 4 << 20 }

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            rpc_host: default_rpc_host(),
            rpc_user: String::new(),
            rpc_password: String::new(),
            rpc_timeout_secs: default_rpc_timeout(),
            binary: default_binary(),
            trusted_peer: None,
            use_tor: false,
            tor_control_port: default_tor_control(),
            notify_port: default_notify_port(),
            testnet: false,
            startup_deadline_secs: default_startup_deadline(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self { refresh_secs: default_refresh(), socks_proxy: None }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bootstrap: Vec::new(),
            request_timeout_secs: default_request_timeout(),
            max_message_size: default_max_message(),
        }
    }
}

impl WalletConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn startup_deadline(&self) -> Duration {
        Duration::from_secs(self.startup_deadline_secs)
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
///
/// # Errors
/// * `Error::Config` if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p).map_err(|e| {
        Error::Config(format!("couldn't read config file {}: {}", p.as_ref().display(), e))
    })?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<Config> {
    toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML in config file: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.wallet.rpc_host, "localhost:11772");
        assert_eq!(cfg.wallet.notify_port, 8330);
        assert_eq!(cfg.wallet.startup_deadline(), Duration::from_secs(30));
        assert_eq!(cfg.exchange.refresh_secs, 900);
        assert_eq!(cfg.net.max_message_size, 4 * 1024 * 1024);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse(
            r#"
            [wallet]
            rpc_user = "bazaar"
            rpc_password = "secret"
            use_tor = true
            trusted_peer = "10.0.0.2:11771"

            [net]
            bootstrap = ["/ip4/1.2.3.4/tcp/4001"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.wallet.rpc_user, "bazaar");
        assert!(cfg.wallet.use_tor);
        assert_eq!(cfg.wallet.tor_control_port, 9051);
        assert_eq!(cfg.wallet.trusted_peer.as_deref(), Some("10.0.0.2:11771"));
        assert_eq!(cfg.net.bootstrap.len(), 1);
        assert_eq!(cfg.net.request_timeout_secs, 30);
    }

    #[test]
    fn load_reads_file_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "[exchange]\nrefresh_secs = 60\n").unwrap();
        assert_eq!(load(&path).unwrap().exchange.refresh_secs, 60);

        let err = load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_toml_is_config_error() {
        assert!(matches!(parse("[wallet\n"), Err(Error::Config(_))));
    }
}
