//! wgtunnel CLI エントリーポイント

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::OpenOptions;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use wgtunnel::config::{ClientConfig, ServerConfig};
use wgtunnel::statistics::TunnelStatistics;
use wgtunnel::{TunnelClient, TunnelServer};

/// ログ出力形式
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    /// 人間が読みやすい形式
    #[default]
    Console,
    /// JSON 形式（構造化ログ）
    Json,
}

/// QUIC-based UDP tunnel for WireGuard
#[derive(Parser, Debug)]
#[command(name = "wgtunnel")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, default_value = "console", env = "WGTUNNEL_LOG_FORMAT", global = true)]
    log_format: LogFormat,

    /// Log output file (default: stdout)
    #[arg(long, env = "WGTUNNEL_LOG_OUTPUT", global = true)]
    log_output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel server
    ///
    /// Accepts QUIC connections and bridges every sub-channel to the
    /// WireGuard endpoint given by wireguard_remote_addr.
    Server {
        /// Path to the server config file
        #[arg(short, long, default_value = "tunnel-server.yaml")]
        config: PathBuf,

        /// Address to listen on (overrides listen_addr)
        #[arg(short, long)]
        listen: Option<String>,

        /// WireGuard address to forward to (overrides wireguard_remote_addr)
        #[arg(long)]
        wireguard_remote: Option<String>,
    },

    /// Run the tunnel client
    ///
    /// Connects to the server and exposes a local UDP socket for WireGuard.
    Client {
        /// Path to the client config file
        #[arg(short, long, default_value = "tunnel-client.yaml")]
        config: PathBuf,

        /// Server address (overrides server_addr)
        #[arg(short, long)]
        server: Option<String>,

        /// Local UDP address for WireGuard (overrides wireguard_local_addr)
        #[arg(long)]
        wireguard_local: Option<String>,
    },
}

fn init_logging(format: LogFormat, output: Option<&PathBuf>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match output {
        Some(log_path) => {
            // ファイルに出力（append モード）
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("Failed to open log file: {:?}", log_path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    match format {
        LogFormat::Console => {
            tracing_subscriber::fmt()
                .with_writer(writer)
                .with_env_filter(env_filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_writer(writer)
                .with_env_filter(env_filter)
                .json()
                .init();
        }
    }

    Ok(())
}

/// 終了シグナル（SIGINT / SIGTERM）を待つ
#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    Ok("Ctrl+C")
}

async fn run_server(
    config_path: PathBuf,
    listen: Option<String>,
    wireguard_remote: Option<String>,
) -> Result<()> {
    let mut config = ServerConfig::load(&config_path)?;
    config.apply_overrides(listen, wireguard_remote);
    let settings = config.resolve()?;

    let statistics = Arc::new(TunnelStatistics::new());
    let server = Arc::new(TunnelServer::bind(&settings, statistics)?);
    info!(
        "Tunnel server ready on {} -> WireGuard {}",
        server.local_addr()?,
        settings.wireguard_remote
    );

    let accept_loop = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    serve_until(&server, accept_loop, shutdown_signal()).await
}

/// 終了シグナルを待ってからサーバーを閉じる
///
/// シグナルの待機に失敗しても close と wait_idle は必ず行う。
async fn serve_until<F>(
    server: &TunnelServer,
    accept_loop: JoinHandle<Result<()>>,
    signal: F,
) -> Result<()>
where
    F: Future<Output = Result<&'static str>>,
{
    let signal_name = signal.await;
    match &signal_name {
        Ok(name) => info!("Received {}, shutting down", name),
        Err(e) => error!("Failed to wait for shutdown signal: {:#}", e),
    }

    server.close();
    match accept_loop.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Accept loop failed: {:#}", e),
        Err(e) => error!("Accept loop task failed: {}", e),
    }
    server.wait_idle().await;

    info!("Statistics: {}", server.statistics().snapshot());
    signal_name.map(|_| ())
}

async fn run_client(
    config_path: PathBuf,
    server: Option<String>,
    wireguard_local: Option<String>,
) -> Result<()> {
    let mut config = ClientConfig::load(&config_path)?;
    config.apply_overrides(server, wireguard_local);
    let settings = config.resolve()?;

    let statistics = Arc::new(TunnelStatistics::new());
    let mut client = TunnelClient::new(settings, statistics.clone())?;
    if let Err(e) = client.start().await {
        error!("Failed to start tunnel: {:#}", e);
        return Err(e);
    }

    let signal_name = shutdown_signal().await;
    match &signal_name {
        Ok(name) => info!("Received {}, shutting down", name),
        Err(e) => error!("Failed to wait for shutdown signal: {:#}", e),
    }

    client.close().await;
    info!("Statistics: {}", statistics.snapshot());
    signal_name.map(|_| ())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_format, cli.log_output.as_ref())?;

    match cli.command {
        Commands::Server {
            config,
            listen,
            wireguard_remote,
        } => run_server(config, listen, wireguard_remote).await,
        Commands::Client {
            config,
            server,
            wireguard_local,
        } => run_client(config, server, wireguard_local).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wgtunnel::config::{ServerSettings, TransportSettings};

    fn bind_test_server(name: &str) -> (TunnelServer, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "wgtunnel-main-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let certified =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = dir.join("server.crt");
        let key = dir.join("server.key");
        std::fs::write(&cert, certified.cert.pem()).unwrap();
        std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();

        let settings = ServerSettings {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            tls_cert_file: cert,
            tls_key_file: key,
            wireguard_remote: "127.0.0.1:51820".parse().unwrap(),
            transport: TransportSettings::default(),
        };
        let server = TunnelServer::bind(&settings, Arc::new(TunnelStatistics::new())).unwrap();
        (server, dir)
    }

    #[tokio::test]
    async fn test_server_closes_when_signal_wait_fails() {
        let (server, dir) = bind_test_server("signal-error");
        let server = Arc::new(server);
        let accept_loop = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });

        // close されなければ受け付けループが終わらずタイムアウトする
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            serve_until(&server, accept_loop, async {
                Err::<&'static str, _>(anyhow::anyhow!("signal handler unavailable"))
            }),
        )
        .await
        .expect("server was not closed");
        assert!(result.is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_server_closes_on_signal() {
        let (server, dir) = bind_test_server("signal-ok");
        let server = Arc::new(server);
        let accept_loop = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            serve_until(&server, accept_loop, async { Ok::<_, anyhow::Error>("SIGTERM") }),
        )
        .await
        .expect("server was not closed");
        assert!(result.is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }
}
