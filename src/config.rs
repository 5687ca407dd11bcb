//! 設定ファイル
//!
//! サーバー・クライアントそれぞれの YAML 設定を読み込み、起動に必要な
//! 解決済みの設定（[`ServerSettings`] / [`ClientSettings`]）に変換する。
//!
//! ```yaml
//! # tunnel-server.yaml
//! listen_addr: ":8443"
//! tls_cert_file: /etc/wgtunnel/server.crt
//! tls_key_file: /etc/wgtunnel/server.key
//! wireguard_remote_addr: "127.0.0.1:51820"
//! ```
//!
//! ```yaml
//! # tunnel-client.yaml
//! server_addr: "vpn.example.com:8443"
//! ca_cert_file: /etc/wgtunnel/ca.crt
//! wireguard_local_addr: "127.0.0.1:51820"
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// デフォルトの待ち受けアドレス
pub const DEFAULT_LISTEN_ADDR: &str = ":8443";

/// デフォルトの WireGuard アドレス（サーバーの転送先 / クライアントの待ち受け）
pub const DEFAULT_WIREGUARD_ADDR: &str = "127.0.0.1:51820";

/// 設定エラー
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },
}

/// QUIC のキープアライブとアイドルタイムアウト
///
/// 0 は無効を意味する。どちらもデフォルトでは無効。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportSettings {
    pub keep_alive_secs: u64,
    pub idle_timeout_secs: u64,
}

impl TransportSettings {
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// サーバー設定ファイル
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    #[serde(alias = "wireguard_remote")]
    pub wireguard_remote_addr: String,
    pub keep_alive_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            tls_cert_file: None,
            tls_key_file: None,
            wireguard_remote_addr: DEFAULT_WIREGUARD_ADDR.to_string(),
            keep_alive_secs: 0,
            idle_timeout_secs: 0,
        }
    }
}

/// 解決済みのサーバー設定
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
    pub tls_cert_file: PathBuf,
    pub tls_key_file: PathBuf,
    pub wireguard_remote: SocketAddr,
    pub transport: TransportSettings,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = read_config_file(path)?;
        Self::from_yaml(&contents, path)
    }

    pub fn from_yaml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = parse_yaml(contents, path)?;
        if config.listen_addr.is_empty() {
            config.listen_addr = DEFAULT_LISTEN_ADDR.to_string();
        }
        if config.wireguard_remote_addr.is_empty() {
            config.wireguard_remote_addr = DEFAULT_WIREGUARD_ADDR.to_string();
        }
        Ok(config)
    }

    /// コマンドライン引数で上書き（指定されたものだけ）
    pub fn apply_overrides(&mut self, listen_addr: Option<String>, wireguard_remote: Option<String>) {
        if let Some(addr) = listen_addr {
            self.listen_addr = addr;
        }
        if let Some(addr) = wireguard_remote {
            self.wireguard_remote_addr = addr;
        }
    }

    pub fn resolve(self) -> Result<ServerSettings, ConfigError> {
        let tls_cert_file = non_empty_path(self.tls_cert_file)
            .ok_or(ConfigError::MissingField("tls_cert_file"))?;
        let tls_key_file =
            non_empty_path(self.tls_key_file).ok_or(ConfigError::MissingField("tls_key_file"))?;

        Ok(ServerSettings {
            listen_addr: resolve_addr(&self.listen_addr)?,
            tls_cert_file,
            tls_key_file,
            wireguard_remote: resolve_addr(&self.wireguard_remote_addr)?,
            transport: TransportSettings {
                keep_alive_secs: self.keep_alive_secs,
                idle_timeout_secs: self.idle_timeout_secs,
            },
        })
    }
}

/// クライアント設定ファイル
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub server_addr: String,
    pub ca_cert_file: Option<PathBuf>,
    #[serde(alias = "wireguard_local")]
    pub wireguard_local_addr: String,
    pub keep_alive_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            ca_cert_file: None,
            wireguard_local_addr: DEFAULT_WIREGUARD_ADDR.to_string(),
            keep_alive_secs: 0,
            idle_timeout_secs: 0,
        }
    }
}

/// 解決済みのクライアント設定
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_addr: SocketAddr,
    /// TLS で検証するサーバー名（`server_addr` のホスト部分）
    pub server_name: String,
    pub ca_cert_file: Option<PathBuf>,
    pub wireguard_local: SocketAddr,
    pub transport: TransportSettings,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = read_config_file(path)?;
        Self::from_yaml(&contents, path)
    }

    pub fn from_yaml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = parse_yaml(contents, path)?;
        if config.wireguard_local_addr.is_empty() {
            config.wireguard_local_addr = DEFAULT_WIREGUARD_ADDR.to_string();
        }
        Ok(config)
    }

    /// コマンドライン引数で上書き（指定されたものだけ）
    pub fn apply_overrides(&mut self, server_addr: Option<String>, wireguard_local: Option<String>) {
        if let Some(addr) = server_addr {
            self.server_addr = addr;
        }
        if let Some(addr) = wireguard_local {
            self.wireguard_local_addr = addr;
        }
    }

    pub fn resolve(self) -> Result<ClientSettings, ConfigError> {
        if self.server_addr.is_empty() {
            return Err(ConfigError::MissingField("server_addr"));
        }

        Ok(ClientSettings {
            server_addr: resolve_addr(&self.server_addr)?,
            server_name: host_part(&self.server_addr)?,
            ca_cert_file: non_empty_path(self.ca_cert_file),
            wireguard_local: resolve_addr(&self.wireguard_local_addr)?,
            transport: TransportSettings {
                keep_alive_secs: self.keep_alive_secs,
                idle_timeout_secs: self.idle_timeout_secs,
            },
        })
    }
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_yaml<T>(contents: &str, path: &Path) -> Result<T, ConfigError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    // 空ファイルはすべてデフォルト値
    if contents.trim().is_empty() {
        return Ok(T::default());
    }

    serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn non_empty_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

/// "host:port" をソケットアドレスに解決する
///
/// ホストを省略した ":port" はすべてのインターフェース（0.0.0.0）を表す。
pub fn resolve_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };

    let invalid = |reason: String| ConfigError::InvalidAddress {
        addr: addr.to_string(),
        reason,
    };

    normalized
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("no addresses found".to_string()))
}

/// "host:port" からホスト部分を取り出す（IPv6 の角括弧は外す）
pub fn host_part(addr: &str) -> Result<String, ConfigError> {
    let (host, _port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress {
            addr: addr.to_string(),
            reason: "missing port".to_string(),
        })?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ConfigError::InvalidAddress {
            addr: addr.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(host.to_string())
}
