//! wgtunnel - QUIC-based UDP tunnel library
//!
//! WireGuard の UDP データグラムを、TLS 1.3 で暗号化された QUIC 接続の中に
//! 多重化して運ぶためのライブラリです。
//!
//! # 主要コンポーネント
//!
//! - [`framing`] - データグラムの長さプレフィックス付きフレーム化
//! - [`pump`] - 片方向のフォワーディングループ
//! - [`bridge`] - UDP ソケットとサブチャネルを結ぶブリッジ
//! - [`client`] - クライアント側トンネルセッション
//! - [`server`] - サーバー側のリスナーとトンネルセッション
//! - [`quic`] - QUIC/TLS 関連ユーティリティ
//! - [`config`] - YAML 設定ファイル
//! - [`statistics`] - 転送統計
//!
//! # アーキテクチャ
//!
//! ```text
//! [WireGuard] ←UDP→ [Client] ←QUIC (TLS 1.3)→ [Server] ←UDP→ [WireGuard]
//!                       └─ サブチャネル 1 本 ─┘     └ サブチャネルごとに UDP ソケット
//! ```
//!
//! # 使用例
//!
//! ## サーバー起動
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use wgtunnel::config::ServerConfig;
//! use wgtunnel::server::TunnelServer;
//! use wgtunnel::statistics::TunnelStatistics;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = ServerConfig::load(Path::new("tunnel-server.yaml"))?.resolve()?;
//!     let server = TunnelServer::bind(&settings, Arc::new(TunnelStatistics::new()))?;
//!     server.run().await
//! }
//! ```
//!
//! ## クライアント起動
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use wgtunnel::client::TunnelClient;
//! use wgtunnel::config::ClientConfig;
//! use wgtunnel::statistics::TunnelStatistics;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = ClientConfig::load(Path::new("tunnel-client.yaml"))?.resolve()?;
//!     let mut client = TunnelClient::new(settings, Arc::new(TunnelStatistics::new()))?;
//!     client.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod framing;
pub mod pump;
pub mod quic;
pub mod server;
pub mod statistics;

// 便利な再エクスポート
pub use client::TunnelClient;
pub use server::TunnelServer;
