//! フォワーディングポンプ
//!
//! ブリッジの片方向を担当するループ。UDP ソケットとサブチャネル（QUIC ストリーム）の
//! 間でデータグラムをフレーム化・復元しながら転送する。
//!
//! 2 つのポンプは同じ [`CancellationToken`] を共有し、どちらかが終了するとトークンが
//! キャンセルされてもう一方も終了する。キャンセルは次の入力を待っている間だけ観測され、
//! すでに読み取り可能な入力は先に処理される。

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::framing::{write_frame, FrameError, FrameEvent, FrameReader, MAX_DATAGRAM_LEN};
use crate::statistics::TunnelStatistics;

/// ストリーム -> UDP 方向の送信先
#[derive(Debug)]
pub enum UdpDestination {
    /// `connect` 済みソケット（サーバー側）
    Connected,
    /// 同じブリッジの UDP -> ストリーム方向が最後に観測した送信元（クライアント側）
    LastSender(watch::Receiver<Option<SocketAddr>>),
}

/// ポンプの終了理由
#[derive(Debug)]
pub enum PumpExit {
    /// 兄弟ポンプの終了による停止
    Cancelled,
    /// I/O エラーによる停止
    Failed(FrameError),
}

impl PumpExit {
    pub fn is_failure(&self) -> bool {
        matches!(self, PumpExit::Failed(_))
    }
}

impl fmt::Display for PumpExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpExit::Cancelled => write!(f, "cancelled"),
            PumpExit::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// UDP -> ストリーム
///
/// データグラムを 1 つずつ受信してフレームとして書き込む。
/// 長さ 0 の受信は無視し、フレーム化できない大きさのものは破棄して継続する。
/// 終了時は書き込み側を shutdown してピアに通知する。
pub async fn datagram_to_stream<W>(
    socket: Arc<UdpSocket>,
    mut writer: W,
    sender_tx: Option<watch::Sender<Option<SocketAddr>>>,
    statistics: Arc<TunnelStatistics>,
    cancel: CancellationToken,
) -> PumpExit
where
    W: AsyncWrite + Unpin,
{
    let _guard = cancel.clone().drop_guard();

    // 65535 バイトを超える受信を検出できるよう 1 バイト余分に確保
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN + 1];

    let exit = loop {
        let (len, src_addr) = tokio::select! {
            biased;
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => break PumpExit::Failed(e.into()),
            },
            _ = cancel.cancelled() => break PumpExit::Cancelled,
        };

        if let Some(tx) = &sender_tx {
            tx.send_if_modified(|current| {
                if *current == Some(src_addr) {
                    return false;
                }
                info!("UDP peer is now {}", src_addr);
                *current = Some(src_addr);
                true
            });
        }

        if len == 0 {
            statistics.empty_datagram();
            debug!("Ignoring empty datagram from {}", src_addr);
            continue;
        }

        let written = tokio::select! {
            biased;
            result = write_frame(&mut writer, &buf[..len]) => result,
            _ = cancel.cancelled() => break PumpExit::Cancelled,
        };

        match written {
            Ok(()) => {
                statistics.add_datagram_to_stream(len);
                debug!("UDP->stream {} bytes from {}", len, src_addr);
            }
            Err(e) if e.is_recoverable() => {
                statistics.oversized_datagram();
                warn!("Dropping datagram from {}: {}", src_addr, e);
            }
            Err(e) => break PumpExit::Failed(e),
        }
    };

    if let Err(e) = writer.shutdown().await {
        debug!("Failed to shut down stream writer: {}", e);
    }

    exit
}

/// ストリーム -> UDP
///
/// フレームを 1 つずつ読み取り、ペイロードを 1 つの UDP データグラムとして送信する。
/// 空フレームは読み飛ばし、バッファ容量を超えるフレームは読み捨てて継続する。
/// リーダーは終了時に drop される。
pub async fn stream_to_datagram<R>(
    socket: Arc<UdpSocket>,
    reader: R,
    destination: UdpDestination,
    statistics: Arc<TunnelStatistics>,
    cancel: CancellationToken,
) -> PumpExit
where
    R: AsyncRead + Unpin,
{
    stream_to_datagram_with_reader(
        socket,
        FrameReader::new(reader),
        destination,
        statistics,
        cancel,
    )
    .await
}

/// 受信バッファ容量を指定できる [`stream_to_datagram`]
pub async fn stream_to_datagram_with_reader<R>(
    socket: Arc<UdpSocket>,
    mut frames: FrameReader<R>,
    destination: UdpDestination,
    statistics: Arc<TunnelStatistics>,
    cancel: CancellationToken,
) -> PumpExit
where
    R: AsyncRead + Unpin,
{
    let _guard = cancel.clone().drop_guard();
    let capacity = frames.capacity();

    loop {
        let event = tokio::select! {
            biased;
            result = frames.read_frame() => result,
            _ = cancel.cancelled() => return PumpExit::Cancelled,
        };

        let payload = match event {
            Ok(FrameEvent::Datagram(payload)) => payload,
            Ok(FrameEvent::Empty) => {
                statistics.empty_frame();
                debug!("Skipping empty frame");
                continue;
            }
            Ok(FrameEvent::Oversized(len)) => {
                statistics.oversized_frame();
                warn!(
                    "Dropped frame of {} bytes (exceeds buffer capacity {})",
                    len, capacity
                );
                continue;
            }
            Err(e) => return PumpExit::Failed(e),
        };

        let sent = match &destination {
            UdpDestination::Connected => socket.send(payload).await,
            UdpDestination::LastSender(rx) => {
                let target = *rx.borrow();
                match target {
                    Some(addr) => socket.send_to(payload, addr).await,
                    None => {
                        statistics.unroutable_frame();
                        warn!(
                            "Dropping {} bytes: no UDP peer has sent anything yet",
                            payload.len()
                        );
                        continue;
                    }
                }
            }
        };

        match sent {
            Ok(n) => {
                statistics.add_datagram_to_udp(n);
                debug!("stream->UDP {} bytes", n);
            }
            Err(e) => return PumpExit::Failed(e.into()),
        }
    }
}
