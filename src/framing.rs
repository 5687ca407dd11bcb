//! データグラムフレーミング
//!
//! QUIC ストリームはバイトストリームであり、UDP データグラムの境界を保持しない。
//! そのため各データグラムを長さプレフィックス付きのフレームとして送る。
//!
//! ```text
//! +----------------+---------------------------+
//! | length (2B BE) | payload (length bytes)    |
//! +----------------+---------------------------+
//! ```
//!
//! - length = 0 は空フレーム。受信側は読み飛ばす
//! - 65535 バイトを超えるデータグラムは表現できないため送信側で破棄する
//! - 受信バッファ容量を超えるフレームは、境界を維持するため宣言された長さ分を
//!   読み捨ててから次のフレームに進む（スキャンによる再同期は行わない）

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 長さプレフィックスのサイズ
pub const LENGTH_PREFIX_LEN: usize = 2;

/// 1 フレームで運べる最大データグラムサイズ
pub const MAX_DATAGRAM_LEN: usize = u16::MAX as usize;

/// フレーミングエラー
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Datagram too large to frame: {0} bytes (max {MAX_DATAGRAM_LEN})")]
    DatagramTooLarge(usize),

    #[error("Stream closed")]
    StreamClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// ループを継続してよいエラーかどうか
    ///
    /// データグラム単位で破棄すれば済むものだけが該当し、I/O エラーはすべて致命的。
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::DatagramTooLarge(_))
    }
}

/// データグラムをフレームにエンコード
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_DATAGRAM_LEN {
        return Err(FrameError::DatagramTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// フレームを 1 つ書き込む
///
/// ヘッダーとペイロードは 1 回の `write_all` で書き込む。
/// 大きすぎるデータグラムは何も書かずにエラーを返す。
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// 読み取ったフレームの種類
#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent<'a> {
    /// 通常のデータグラム
    Datagram(&'a [u8]),
    /// 長さ 0 の空フレーム
    Empty,
    /// バッファ容量を超えたため読み捨てたフレーム（宣言された長さ）
    Oversized(usize),
}

/// フレームリーダー
///
/// 受信バッファを 1 つだけ持ち、`read_frame` ごとに再利用する。
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// 最大データグラムサイズ分のバッファでリーダーを作成
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, MAX_DATAGRAM_LEN)
    }

    /// 指定容量のバッファでリーダーを作成
    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            buf: vec![0u8; capacity],
        }
    }

    /// 受信バッファ容量
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// フレームを 1 つ読み取る
    ///
    /// ヘッダー 2 バイトとペイロード全体が揃うまでブロックする。
    /// 途中でストリームが閉じた場合はエラーとなり、再開はできない。
    pub async fn read_frame(&mut self) -> Result<FrameEvent<'_>, FrameError> {
        let mut header = [0u8; LENGTH_PREFIX_LEN];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::StreamClosed);
            }
            Err(e) => return Err(e.into()),
        }

        let len = u16::from_be_bytes(header) as usize;
        if len == 0 {
            return Ok(FrameEvent::Empty);
        }

        if len > self.buf.len() {
            // 境界を維持するため宣言された長さ分をちょうど読み捨てる
            let drained =
                tokio::io::copy(&mut (&mut self.inner).take(len as u64), &mut tokio::io::sink())
                    .await?;
            if drained != len as u64 {
                return Err(FrameError::StreamClosed);
            }
            return Ok(FrameEvent::Oversized(len));
        }

        self.inner.read_exact(&mut self.buf[..len]).await?;
        Ok(FrameEvent::Datagram(&self.buf[..len]))
    }
}
