//! トンネル統計情報
//!
//! セッション数・ブリッジ数・方向別の転送量・破棄したデータグラム数を追跡します。
//! HTTP でのエクスポートは行わず、セッション終了時とシャットダウン時にログへ出力します。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// 統計情報を保持する構造体
///
/// すべてのフィールドは Atomic 型で、複数タスクから `Arc` 経由で共有されます。
pub struct TunnelStatistics {
    start_time: Instant,

    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    bridges_opened: AtomicU64,
    bridges_closed: AtomicU64,

    /// UDP -> ストリーム方向
    datagrams_to_stream: AtomicU64,
    bytes_to_stream: AtomicU64,
    /// ストリーム -> UDP 方向
    datagrams_to_udp: AtomicU64,
    bytes_to_udp: AtomicU64,

    /// フレーム化できず破棄したデータグラム
    oversized_datagrams: AtomicU64,
    /// 長さ 0 の UDP 受信
    empty_datagrams: AtomicU64,
    /// 長さ 0 のフレーム
    empty_frames: AtomicU64,
    /// 受信バッファ容量を超えて読み捨てたフレーム
    oversized_frames: AtomicU64,
    /// 返送先が未確定のため破棄したフレーム
    unroutable_frames: AtomicU64,
}

/// ある時点の統計値
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub uptime_secs: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub bridges_opened: u64,
    pub bridges_closed: u64,
    pub datagrams_to_stream: u64,
    pub bytes_to_stream: u64,
    pub datagrams_to_udp: u64,
    pub bytes_to_udp: u64,
    pub oversized_datagrams: u64,
    pub empty_datagrams: u64,
    pub empty_frames: u64,
    pub oversized_frames: u64,
    pub unroutable_frames: u64,
}

impl TunnelStatistics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            bridges_opened: AtomicU64::new(0),
            bridges_closed: AtomicU64::new(0),
            datagrams_to_stream: AtomicU64::new(0),
            bytes_to_stream: AtomicU64::new(0),
            datagrams_to_udp: AtomicU64::new(0),
            bytes_to_udp: AtomicU64::new(0),
            oversized_datagrams: AtomicU64::new(0),
            empty_datagrams: AtomicU64::new(0),
            empty_frames: AtomicU64::new(0),
            oversized_frames: AtomicU64::new(0),
            unroutable_frames: AtomicU64::new(0),
        }
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bridge_opened(&self) {
        self.bridges_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bridge_closed(&self) {
        self.bridges_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// UDP から受け取ったデータグラムをストリームへ送った
    pub fn add_datagram_to_stream(&self, bytes: usize) {
        self.datagrams_to_stream.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_stream.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// ストリームから受け取ったデータグラムを UDP へ送った
    pub fn add_datagram_to_udp(&self, bytes: usize) {
        self.datagrams_to_udp.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_udp.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn oversized_datagram(&self) {
        self.oversized_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn empty_datagram(&self) {
        self.empty_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn empty_frame(&self) {
        self.empty_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn oversized_frame(&self) {
        self.oversized_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unroutable_frame(&self) {
        self.unroutable_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// 現在値のスナップショットを取得
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            bridges_opened: self.bridges_opened.load(Ordering::Relaxed),
            bridges_closed: self.bridges_closed.load(Ordering::Relaxed),
            datagrams_to_stream: self.datagrams_to_stream.load(Ordering::Relaxed),
            bytes_to_stream: self.bytes_to_stream.load(Ordering::Relaxed),
            datagrams_to_udp: self.datagrams_to_udp.load(Ordering::Relaxed),
            bytes_to_udp: self.bytes_to_udp.load(Ordering::Relaxed),
            oversized_datagrams: self.oversized_datagrams.load(Ordering::Relaxed),
            empty_datagrams: self.empty_datagrams.load(Ordering::Relaxed),
            empty_frames: self.empty_frames.load(Ordering::Relaxed),
            oversized_frames: self.oversized_frames.load(Ordering::Relaxed),
            unroutable_frames: self.unroutable_frames.load(Ordering::Relaxed),
        }
    }
}

impl Default for TunnelStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsSnapshot {
    /// 破棄・読み飛ばしたものの合計
    pub fn dropped(&self) -> u64 {
        self.oversized_datagrams + self.oversized_frames + self.unroutable_frames
    }
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uptime={}s sessions={}/{} bridges={}/{} udp->stream={} ({} bytes) \
             stream->udp={} ({} bytes) dropped={} skipped_empty={}",
            self.uptime_secs,
            self.sessions_closed,
            self.sessions_opened,
            self.bridges_closed,
            self.bridges_opened,
            self.datagrams_to_stream,
            self.bytes_to_stream,
            self.datagrams_to_udp,
            self.bytes_to_udp,
            self.dropped(),
            self.empty_datagrams + self.empty_frames,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = TunnelStatistics::new();
        stats.session_opened();
        stats.bridge_opened();
        stats.add_datagram_to_stream(100);
        stats.add_datagram_to_stream(20);
        stats.add_datagram_to_udp(7);
        stats.oversized_datagram();
        stats.unroutable_frame();
        stats.empty_frame();
        stats.bridge_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.sessions_opened, 1);
        assert_eq!(snap.sessions_closed, 0);
        assert_eq!(snap.bridges_opened, 1);
        assert_eq!(snap.bridges_closed, 1);
        assert_eq!(snap.datagrams_to_stream, 2);
        assert_eq!(snap.bytes_to_stream, 120);
        assert_eq!(snap.datagrams_to_udp, 1);
        assert_eq!(snap.bytes_to_udp, 7);
        assert_eq!(snap.dropped(), 2);
        assert_eq!(snap.empty_frames, 1);
    }

    #[test]
    fn test_summary_format() {
        let stats = TunnelStatistics::new();
        stats.add_datagram_to_stream(3);
        let summary = stats.snapshot().to_string();
        assert!(summary.contains("udp->stream=1 (3 bytes)"));
        assert!(summary.contains("dropped=0"));
    }
}
