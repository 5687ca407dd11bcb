//! サーバー実装
//!
//! QUIC コネクションを待ち受け、接続ごとにトンネルセッションを起動します。
//! セッション内で受け付けたサブチャネルはすべて、設定された 1 つの WireGuard
//! アドレスへの UDP ブリッジになります。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::{Connection, ConnectionError, Endpoint, VarInt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bridge::{ReplyMode, UdpBridge};
use crate::config::ServerSettings;
use crate::quic::{build_server_config, create_server_endpoint, unspecified_addr, SubChannel};
use crate::statistics::TunnelStatistics;

/// セッション ID カウンター（ログ用）
static SESSION_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// wait_idle() の上限
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TunnelServer {
    endpoint: Endpoint,
    wireguard_remote: SocketAddr,
    statistics: Arc<TunnelStatistics>,
    shutdown: CancellationToken,
}

impl TunnelServer {
    /// 待ち受けを開始する
    ///
    /// 証明書・秘密鍵が読めない場合や、アドレスにバインドできない場合はエラー。
    pub fn bind(settings: &ServerSettings, statistics: Arc<TunnelStatistics>) -> Result<Self> {
        let server_config = build_server_config(
            &settings.tls_cert_file,
            &settings.tls_key_file,
            &settings.transport,
        )?;
        let endpoint = create_server_endpoint(settings.listen_addr, server_config)?;

        Ok(Self {
            endpoint,
            wireguard_remote: settings.wireguard_remote,
            statistics,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .context("Failed to get listener address")
    }

    pub fn statistics(&self) -> &Arc<TunnelStatistics> {
        &self.statistics
    }

    /// 接続の受け付けループ
    ///
    /// 個々の接続の失敗ではループは止まらない。[`close`](Self::close) で
    /// エンドポイントが閉じられると終了する。
    pub async fn run(&self) -> Result<()> {
        info!(
            "Accepting tunnel connections on {} (WireGuard remote {})",
            self.local_addr()?,
            self.wireguard_remote
        );

        while let Some(incoming) = self.endpoint.accept().await {
            let wireguard_remote = self.wireguard_remote;
            let statistics = self.statistics.clone();
            let cancel = self.shutdown.child_token();
            let peer = incoming.remote_address();

            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        let session =
                            ServerSession::new(connection, wireguard_remote, statistics, cancel);
                        let span = info_span!("session", id = session.id, peer = %peer);
                        session.run().instrument(span).await;
                    }
                    Err(e) => {
                        error!("Failed to accept connection from {}: {}", peer, e);
                    }
                }
            });
        }

        info!("Listener closed");
        Ok(())
    }

    /// 待ち受けと全セッションを閉じる
    pub fn close(&self) {
        self.shutdown.cancel();
        self.endpoint.close(VarInt::from_u32(0), b"server shutdown");
    }

    /// 閉じた接続の後処理が終わるのを待つ
    pub async fn wait_idle(&self) {
        if tokio::time::timeout(IDLE_TIMEOUT, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            warn!("Timed out waiting for QUIC endpoint to become idle");
        }
    }
}

/// 1 本の QUIC 接続に対応するセッション
struct ServerSession {
    id: u32,
    connection: Connection,
    wireguard_remote: SocketAddr,
    statistics: Arc<TunnelStatistics>,
    cancel: CancellationToken,
}

impl ServerSession {
    fn new(
        connection: Connection,
        wireguard_remote: SocketAddr,
        statistics: Arc<TunnelStatistics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            connection,
            wireguard_remote,
            statistics,
            cancel,
        }
    }

    async fn run(self) {
        info!("New session from {}", self.connection.remote_address());
        self.statistics.session_opened();

        loop {
            let accepted = tokio::select! {
                result = self.connection.accept_bi() => result,
                _ = self.cancel.cancelled() => {
                    debug!("Session cancelled");
                    break;
                }
            };

            match accepted {
                Ok((send, recv)) => {
                    let subchannel = SubChannel::new(send, recv);
                    tokio::spawn(
                        bridge_subchannel(
                            subchannel,
                            self.wireguard_remote,
                            self.statistics.clone(),
                            self.cancel.child_token(),
                        )
                        .in_current_span(),
                    );
                }
                Err(ConnectionError::ApplicationClosed(close)) => {
                    info!("Session closed by peer: {}", close);
                    break;
                }
                Err(ConnectionError::LocallyClosed) => {
                    debug!("Session closed locally");
                    break;
                }
                Err(e) => {
                    warn!("Session ended: {}", e);
                    break;
                }
            }
        }

        // 残っているブリッジをすべて終了させる
        self.cancel.cancel();
        self.connection
            .close(VarInt::from_u32(0), b"session closed");
        self.statistics.session_closed();

        info!("Session closed: {}", self.statistics.snapshot());
    }
}

/// サブチャネルを WireGuard 宛ての UDP ソケットとブリッジする
///
/// UDP ソケットを用意できなければそのサブチャネルだけを閉じる。
async fn bridge_subchannel(
    subchannel: SubChannel,
    wireguard_remote: SocketAddr,
    statistics: Arc<TunnelStatistics>,
    cancel: CancellationToken,
) {
    let stream_id = subchannel.id();

    let socket = match dial_udp(wireguard_remote).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(
                "Failed to dial WireGuard at {} for sub-channel {}: {}",
                wireguard_remote, stream_id, e
            );
            subchannel.abort();
            return;
        }
    };

    debug!(
        "Sub-channel {} bridged to {} via {:?}",
        stream_id,
        wireguard_remote,
        socket.local_addr().ok()
    );

    let bridge =
        UdpBridge::new(socket, ReplyMode::Connected, statistics).with_cancel_token(cancel);
    let SubChannel { send, recv } = subchannel;
    if let Err(e) = bridge.spawn(recv, send).await {
        warn!("Bridge task failed: {}", e);
    }
}

/// 転送先に connect した UDP ソケットを作成
async fn dial_udp(remote: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(unspecified_addr(&remote)).await?;
    socket.connect(remote).await?;
    Ok(socket)
}
