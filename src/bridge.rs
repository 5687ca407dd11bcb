//! UDP トンネルブリッジ
//!
//! 1 つの UDP ソケットと 1 つのサブチャネルを組にし、方向ごとに 1 つずつ
//! フォワーディングポンプを起動する。2 つのポンプは運命を共有し、
//! どちらかが終了した時点でブリッジ全体（ソケットとサブチャネル）が閉じられる。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::framing::FrameError;
use crate::pump::{self, PumpExit, UdpDestination};
use crate::statistics::TunnelStatistics;

/// ブリッジ ID カウンター（ログ用）
static BRIDGE_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// ストリーム -> UDP 方向の送信先の決め方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// ソケットは転送先に `connect` 済み
    Connected,
    /// 最後にデータグラムを送ってきた相手に返す
    LastSender,
}

/// 終了したブリッジの結果
#[derive(Debug)]
pub struct BridgeReport {
    pub id: u32,
    pub udp_to_stream: PumpExit,
    pub stream_to_udp: PumpExit,
}

pub struct UdpBridge {
    id: u32,
    socket: UdpSocket,
    reply_mode: ReplyMode,
    statistics: Arc<TunnelStatistics>,
    cancel: CancellationToken,
}

impl UdpBridge {
    pub fn new(socket: UdpSocket, reply_mode: ReplyMode, statistics: Arc<TunnelStatistics>) -> Self {
        Self {
            id: BRIDGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            socket,
            reply_mode,
            statistics,
            cancel: CancellationToken::new(),
        }
    }

    /// セッションのトークンから派生したトークンを使う
    ///
    /// 親がキャンセルされるとこのブリッジも終了する。
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// ブリッジを外から閉じるためのトークン
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 2 つのポンプを起動する
    ///
    /// 返される JoinHandle は両方のポンプが終了した時点で完了する。
    /// その時点で UDP ソケットとサブチャネルの両半分は drop 済み。
    pub fn spawn<R, W>(self, reader: R, writer: W) -> JoinHandle<BridgeReport>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            id,
            socket,
            reply_mode,
            statistics,
            cancel,
        } = self;

        let span = match socket.local_addr() {
            Ok(addr) => info_span!("bridge", id, udp = %addr),
            Err(_) => info_span!("bridge", id),
        };

        let socket = Arc::new(socket);
        let (sender_tx, destination) = match reply_mode {
            ReplyMode::Connected => (None, UdpDestination::Connected),
            ReplyMode::LastSender => {
                let (tx, rx) = watch::channel(None);
                (Some(tx), UdpDestination::LastSender(rx))
            }
        };

        statistics.bridge_opened();

        let udp_to_stream = tokio::spawn(
            pump::datagram_to_stream(
                socket.clone(),
                writer,
                sender_tx,
                statistics.clone(),
                cancel.clone(),
            )
            .instrument(span.clone()),
        );
        let stream_to_udp = tokio::spawn(
            pump::stream_to_datagram(
                socket,
                reader,
                destination,
                statistics.clone(),
                cancel,
            )
            .instrument(span.clone()),
        );

        tokio::spawn(
            async move {
                debug!("Bridge started");

                let (udp_to_stream, stream_to_udp) = tokio::join!(udp_to_stream, stream_to_udp);
                let udp_to_stream = udp_to_stream.unwrap_or_else(join_failure);
                let stream_to_udp = stream_to_udp.unwrap_or_else(join_failure);

                statistics.bridge_closed();
                if udp_to_stream.is_failure() || stream_to_udp.is_failure() {
                    info!(
                        "Bridge closed (udp->stream {}, stream->udp {})",
                        udp_to_stream, stream_to_udp
                    );
                } else {
                    debug!("Bridge closed");
                }

                BridgeReport {
                    id,
                    udp_to_stream,
                    stream_to_udp,
                }
            }
            .instrument(span),
        )
    }
}

/// パニックしたポンプを失敗として扱う
fn join_failure(e: JoinError) -> PumpExit {
    warn!("Pump task failed: {}", e);
    PumpExit::Failed(FrameError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        e.to_string(),
    )))
}
