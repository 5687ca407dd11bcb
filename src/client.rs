//! クライアント実装
//!
//! サーバーに接続してサブチャネルを 1 本開き、ローカルの WireGuard 向け UDP ソケットと
//! ブリッジする。接続が失われても再接続は行わない。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use quinn::{ClientConfig, Connection, ConnectionError, Endpoint, VarInt};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeReport, ReplyMode, UdpBridge};
use crate::config::ClientSettings;
use crate::quic::{build_client_config, create_client_endpoint, open_subchannel};
use crate::statistics::TunnelStatistics;

/// close() でブリッジやエンドポイントの終了を待つ上限
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// クライアントの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unstarted,
    Connected,
    Closed,
}

struct RunningBridge {
    cancel: CancellationToken,
    handle: JoinHandle<BridgeReport>,
}

pub struct TunnelClient {
    settings: ClientSettings,
    client_config: ClientConfig,
    statistics: Arc<TunnelStatistics>,
    state: ClientState,
    endpoint: Option<Endpoint>,
    connection: Option<Connection>,
    bridge: Option<RunningBridge>,
    local_udp_addr: Option<SocketAddr>,
}

impl TunnelClient {
    /// クライアントを作成
    ///
    /// TLS 設定（CA ファイルを含む）はここで読み込むため、読めない場合はこの時点でエラー。
    pub fn new(settings: ClientSettings, statistics: Arc<TunnelStatistics>) -> Result<Self> {
        let client_config =
            build_client_config(settings.ca_cert_file.as_deref(), &settings.transport)?;

        Ok(Self {
            settings,
            client_config,
            statistics,
            state: ClientState::Unstarted,
            endpoint: None,
            connection: None,
            bridge: None,
            local_udp_addr: None,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// WireGuard が送信先にするローカル UDP アドレス
    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.local_udp_addr
    }

    pub fn statistics(&self) -> &Arc<TunnelStatistics> {
        &self.statistics
    }

    /// 接続してブリッジを開始
    ///
    /// 失敗した場合は取得済みのリソースを解放し、クライアントは Closed になる。
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ClientState::Unstarted {
            bail!("Tunnel client cannot be started from state {:?}", self.state);
        }

        let result = self.connect_and_bridge().await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn connect_and_bridge(&mut self) -> Result<()> {
        let server_addr = self.settings.server_addr;
        info!("Connecting to {} ...", server_addr);

        let endpoint = create_client_endpoint(&server_addr, self.client_config.clone())?;
        let connecting = endpoint.connect(server_addr, &self.settings.server_name);
        self.endpoint = Some(endpoint);

        let connection = connecting
            .context("Failed to start connection")?
            .await
            .with_context(|| format!("Failed to connect to {}", server_addr))?;
        self.connection = Some(connection.clone());
        self.statistics.session_opened();
        info!("Connected to {}", server_addr);

        let subchannel = open_subchannel(&connection).await?;
        debug!("Opened sub-channel {}", subchannel.id());

        let socket = match UdpSocket::bind(self.settings.wireguard_local).await {
            Ok(socket) => socket,
            Err(e) => {
                subchannel.abort();
                return Err(e).with_context(|| {
                    format!(
                        "Failed to bind WireGuard UDP socket on {}",
                        self.settings.wireguard_local
                    )
                });
            }
        };
        let local_udp_addr = socket.local_addr()?;

        let bridge = UdpBridge::new(socket, ReplyMode::LastSender, self.statistics.clone());
        let cancel = bridge.cancel_token();
        let handle = bridge.spawn(subchannel.recv, subchannel.send);
        self.bridge = Some(RunningBridge { cancel, handle });
        self.local_udp_addr = Some(local_udp_addr);

        tokio::spawn(watch_connection(connection));

        self.state = ClientState::Connected;
        info!(
            "Tunnel ready: WireGuard UDP {} <-> {}",
            local_udp_addr, server_addr
        );
        Ok(())
    }

    /// トンネルを閉じる
    ///
    /// UDP ソケット、セッション、エンドポイントの順に閉じる。各段階のエラーは
    /// ログに記録して次に進む。2 回目以降の呼び出しは何もしない。
    pub async fn close(&mut self) {
        if self.state == ClientState::Closed {
            return;
        }
        self.state = ClientState::Closed;

        if let Some(bridge) = self.bridge.take() {
            bridge.cancel.cancel();
            let mut handle = bridge.handle;
            match tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await {
                Ok(Ok(report)) => debug!(
                    "Bridge {} stopped (udp->stream {}, stream->udp {})",
                    report.id, report.udp_to_stream, report.stream_to_udp
                ),
                Ok(Err(e)) => warn!("Bridge task failed: {}", e),
                Err(_) => {
                    warn!("Timed out waiting for bridge to stop");
                    handle.abort();
                }
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.close(VarInt::from_u32(0), b"client closed");
            self.statistics.session_closed();
        }

        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(VarInt::from_u32(0), b"client closed");
            if tokio::time::timeout(CLOSE_TIMEOUT, endpoint.wait_idle())
                .await
                .is_err()
            {
                warn!("Timed out waiting for QUIC endpoint to become idle");
            }
        }

        info!("Tunnel client closed");
    }
}

/// 接続の終了をログに記録する
async fn watch_connection(connection: Connection) {
    match connection.closed().await {
        ConnectionError::LocallyClosed => debug!("Connection closed locally"),
        reason => warn!(
            "Connection to {} lost: {} (not reconnecting)",
            connection.remote_address(),
            reason
        ),
    }
}
