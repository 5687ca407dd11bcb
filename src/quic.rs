//! QUIC 設定モジュール
//!
//! トンネルの暗号化トランスポートと多重化を QUIC で提供します。
//!
//! - QUIC 接続 1 本がトンネルセッション 1 つに対応
//! - 双方向ストリーム 1 本がサブチャネル 1 つに対応
//! - TLS 1.3 のみ、ALPN は `wgtunnel/1`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use quinn::{
    ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, StreamId, VarInt,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tracing::debug;

use crate::config::TransportSettings;
use crate::framing::write_frame;

/// ALPN プロトコル識別子
pub const ALPN_WGTUNNEL: &[u8] = b"wgtunnel/1";

/// TLS 素材の読み込みエラー
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse PEM in {}: {source}", .path.display())]
    Pem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No certificates found in {}", .path.display())]
    NoCertificates { path: PathBuf },

    #[error("No private key found in {}", .path.display())]
    NoPrivateKey { path: PathBuf },

    #[error("Invalid CA certificate in {}: {source}", .path.display())]
    InvalidCaCertificate {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },
}

fn read_pem_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// PEM ファイルから証明書チェーンを読み込む
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_pem_file(path)?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

/// PEM ファイルから秘密鍵を読み込む（PKCS#8 / PKCS#1 / SEC1）
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_pem_file(path)?;
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|source| TlsError::Pem {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// キープアライブとアイドルタイムアウトを反映したトランスポート設定
///
/// 0 の項目は無効になる。アイドルタイムアウトを無効にすると、
/// 無通信の接続はどちらかが閉じるまで維持される。
pub fn transport_config(settings: &TransportSettings) -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(settings.keep_alive());

    let idle_timeout = match settings.idle_timeout() {
        Some(timeout) => Some(
            quinn::IdleTimeout::try_from(timeout)
                .map_err(|_| anyhow::anyhow!("idle timeout out of range: {:?}", timeout))?,
        ),
        None => None,
    };
    transport.max_idle_timeout(idle_timeout);

    Ok(transport)
}

/// サーバー用の QUIC 設定を作成
pub fn build_server_config(
    cert_file: &Path,
    key_file: &Path,
    settings: &TransportSettings,
) -> Result<ServerConfig> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("Failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to create server TLS config")?;

    server_crypto.alpn_protocols = vec![ALPN_WGTUNNEL.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("Failed to create QUIC server config")?,
    ));
    server_config.transport_config(Arc::new(transport_config(settings)?));

    Ok(server_config)
}

/// クライアント用の QUIC 設定を作成
///
/// サーバー証明書は Mozilla のルート証明書に加え、指定された CA ファイルで検証する。
/// CA ファイルが読めない場合はエラー。
pub fn build_client_config(
    ca_cert_file: Option<&Path>,
    settings: &TransportSettings,
) -> Result<ClientConfig> {
    let mut roots =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_cert_file {
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|source| TlsError::InvalidCaCertificate {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
    }

    let mut crypto = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("Failed to select TLS protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();

    crypto.alpn_protocols = vec![ALPN_WGTUNNEL.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .context("Failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(transport_config(settings)?));

    Ok(client_config)
}

/// サーバー用の QUIC エンドポイントを作成
pub fn create_server_endpoint(bind_addr: SocketAddr, server_config: ServerConfig) -> Result<Endpoint> {
    Endpoint::server(server_config, bind_addr)
        .with_context(|| format!("Failed to listen on {}", bind_addr))
}

/// クライアント用の QUIC エンドポイントを作成
///
/// server_addr の IP バージョンに応じてバインドアドレスを選択:
/// - IPv4 サーバー: 0.0.0.0:0 にバインド
/// - IPv6 サーバー: [::]:0 にバインド
pub fn create_client_endpoint(server_addr: &SocketAddr, client_config: ClientConfig) -> Result<Endpoint> {
    let bind_addr = unspecified_addr(server_addr);

    let mut endpoint = Endpoint::client(bind_addr).context("Failed to create client endpoint")?;
    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}

/// 相手と同じアドレスファミリーの未指定アドレス（ポート 0）
pub fn unspecified_addr(peer: &SocketAddr) -> SocketAddr {
    if peer.is_ipv6() {
        SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
    }
}

/// サブチャネル（QUIC 双方向ストリーム）
pub struct SubChannel {
    pub send: SendStream,
    pub recv: RecvStream,
}

impl SubChannel {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    /// ストリーム ID（ログ用）
    pub fn id(&self) -> StreamId {
        self.send.id()
    }

    /// 両方向を即座に閉じる
    pub fn abort(mut self) {
        // 既に閉じている方向はそのまま
        if let Err(e) = self.send.reset(VarInt::from_u32(0)) {
            debug!("Sub-channel send side already closed: {}", e);
        }
        if let Err(e) = self.recv.stop(VarInt::from_u32(0)) {
            debug!("Sub-channel receive side already closed: {}", e);
        }
    }
}

/// サブチャネルを開く（クライアント側）
///
/// QUIC のストリームはデータが送られるまでピアに通知されないため、
/// 開いた直後に空フレームを 1 つ送って相手側の accept を起こす。
/// 受信側は空フレームを読み飛ばすので転送内容には影響しない。
pub async fn open_subchannel(connection: &Connection) -> Result<SubChannel> {
    let (mut send, recv) = connection
        .open_bi()
        .await
        .context("Failed to open sub-channel")?;

    write_frame(&mut send, &[])
        .await
        .context("Failed to announce sub-channel")?;

    Ok(SubChannel::new(send, recv))
}
