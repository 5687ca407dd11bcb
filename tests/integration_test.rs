//! wgtunnel 統合テスト
//!
//! ビルドされたバイナリをサーバー・クライアントとして起動し、以下をテストします:
//! - YAML 設定ファイルからの起動
//! - UDP データグラムの往復転送
//! - SIGTERM によるグレースフルシャットダウン
//! - 起動時エラー（設定・TLS 素材）での即時終了

use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// テスト用の一意なポート番号を取得
///
/// `portpicker` を使用して実際に利用可能なポートを取得する。
/// これにより並列実行時のポート競合を防ぐ。
fn get_test_port() -> u16 {
    portpicker::pick_unused_port().expect("No available port")
}

/// wgtunnel バイナリへのパス
///
/// `CARGO_BIN_EXE_<name>` は Cargo が統合テスト実行時に自動的に設定する環境変数。
fn wgtunnel_binary() -> &'static str {
    env!("CARGO_BIN_EXE_wgtunnel")
}

/// テストごとの作業ディレクトリ（証明書と設定ファイル）
struct TestDir {
    path: PathBuf,
}

impl TestDir {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "wgtunnel-integration-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&path).expect("Failed to create test dir");
        Self { path }
    }

    /// 自己署名証明書を生成して (証明書, 秘密鍵) のパスを返す
    fn write_certificate(&self) -> (PathBuf, PathBuf) {
        let certified = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .expect("Failed to generate certificate");
        let cert = self.path.join("server.crt");
        let key = self.path.join("server.key");
        std::fs::write(&cert, certified.cert.pem()).unwrap();
        std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();
        (cert, key)
    }

    fn write_file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// 起動した wgtunnel プロセス
struct TestProcess {
    process: Child,
}

impl TestProcess {
    fn spawn(args: &[&str]) -> Self {
        eprintln!("[TestProcess] wgtunnel {}", args.join(" "));
        let process = Command::new(wgtunnel_binary())
            .args(args)
            .stdout(Stdio::inherit()) // 標準出力を継承してログを見る
            .stderr(Stdio::inherit())
            .spawn()
            .expect("Failed to start wgtunnel");
        Self { process }
    }

    fn start_server(config: &Path) -> Self {
        let process = Self::spawn(&["server", "--config", config.to_str().unwrap()]);
        // サーバーが起動するまで待機
        thread::sleep(Duration::from_millis(500));
        process
    }

    fn start_client(config: &Path) -> Self {
        let process = Self::spawn(&["client", "--config", config.to_str().unwrap()]);
        // サーバーに接続してローカルソケットをバインドするまで待機
        thread::sleep(Duration::from_secs(1));
        process
    }

    /// SIGTERM を送信してグレースフルシャットダウン
    #[cfg(unix)]
    fn send_sigterm(&mut self) {
        unsafe {
            libc::kill(self.process.id() as i32, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn send_sigterm(&mut self) {
        let _ = self.process.kill();
    }

    /// 終了を待つ（タイムアウトしたら None）
    fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(status) = self.process.try_wait().expect("Failed to poll process") {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(50));
        }
        None
    }
}

impl Drop for TestProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.process.try_wait() {
            self.send_sigterm();
            if self.wait_timeout(Duration::from_secs(5)).is_none() {
                let _ = self.process.kill();
            }
        }
        let _ = self.process.wait();
    }
}

/// 応答が届くまでデータグラムを再送する
///
/// トンネル確立前に送ったデータグラムは失われる可能性があるため。
fn send_until_received(
    sender: &UdpSocket,
    target: &str,
    receiver: &UdpSocket,
    payload: &[u8],
) -> Option<(Vec<u8>, std::net::SocketAddr)> {
    receiver
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();

    let mut buf = [0u8; 2048];
    for attempt in 0..25 {
        sender.send_to(payload, target).unwrap();
        match receiver.recv_from(&mut buf) {
            Ok((n, from)) => return Some((buf[..n].to_vec(), from)),
            Err(e) => eprintln!("[send_until_received] attempt {}: {}", attempt, e),
        }
    }
    None
}

#[test]
fn test_udp_round_trip_and_sigterm() {
    let dir = TestDir::new("roundtrip");
    let (cert, key) = dir.write_certificate();

    let server_port = get_test_port();
    let client_port = get_test_port();

    // サーバー側の WireGuard 役
    let wg_remote = UdpSocket::bind("127.0.0.1:0").unwrap();
    let wg_remote_addr = wg_remote.local_addr().unwrap();

    let server_config = dir.write_file(
        "tunnel-server.yaml",
        &format!(
            "listen_addr: \"127.0.0.1:{}\"\ntls_cert_file: {}\ntls_key_file: {}\nwireguard_remote_addr: \"{}\"\n",
            server_port,
            cert.display(),
            key.display(),
            wg_remote_addr
        ),
    );
    let client_config = dir.write_file(
        "tunnel-client.yaml",
        &format!(
            "server_addr: \"127.0.0.1:{}\"\nca_cert_file: {}\nwireguard_local_addr: \"127.0.0.1:{}\"\n",
            server_port,
            cert.display(),
            client_port
        ),
    );

    let mut server = TestProcess::start_server(&server_config);
    let mut client = TestProcess::start_client(&client_config);

    // クライアント側 WireGuard -> サーバー側 WireGuard
    let wg_local = UdpSocket::bind("127.0.0.1:0").unwrap();
    let client_target = format!("127.0.0.1:{}", client_port);
    let (data, bridge_addr) =
        send_until_received(&wg_local, &client_target, &wg_remote, &[0x01, 0x02, 0x03])
            .expect("Datagram did not reach the server side");
    assert_eq!(data, vec![0x01, 0x02, 0x03]);

    // 逆方向
    wg_local
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    wg_remote.send_to(&[0x03, 0x02, 0x01], bridge_addr).unwrap();
    let mut buf = [0u8; 2048];
    let (n, from) = wg_local.recv_from(&mut buf).expect("No reply through tunnel");
    assert_eq!(&buf[..n], &[0x03, 0x02, 0x01]);
    assert_eq!(from.port(), client_port);

    // SIGTERM で正常終了すること
    client.send_sigterm();
    let status = client
        .wait_timeout(Duration::from_secs(10))
        .expect("Client did not exit after SIGTERM");
    assert!(status.success(), "Client exited with {}", status);

    server.send_sigterm();
    let status = server
        .wait_timeout(Duration::from_secs(10))
        .expect("Server did not exit after SIGTERM");
    assert!(status.success(), "Server exited with {}", status);
}

#[test]
fn test_server_without_tls_material_fails() {
    let dir = TestDir::new("no-tls");
    let config = dir.write_file(
        "tunnel-server.yaml",
        &format!("listen_addr: \"127.0.0.1:{}\"\n", get_test_port()),
    );

    let mut server = TestProcess::spawn(&["server", "--config", config.to_str().unwrap()]);
    let status = server
        .wait_timeout(Duration::from_secs(10))
        .expect("Server should exit on startup error");
    assert!(!status.success());
}

#[test]
fn test_server_with_unreadable_certificate_fails() {
    let dir = TestDir::new("bad-cert");
    let config = dir.write_file(
        "tunnel-server.yaml",
        &format!(
            "listen_addr: \"127.0.0.1:{}\"\ntls_cert_file: /nonexistent/server.crt\ntls_key_file: /nonexistent/server.key\n",
            get_test_port()
        ),
    );

    let mut server = TestProcess::spawn(&["server", "--config", config.to_str().unwrap()]);
    let status = server
        .wait_timeout(Duration::from_secs(10))
        .expect("Server should exit on startup error");
    assert!(!status.success());
}

#[test]
fn test_client_requires_server_addr() {
    let dir = TestDir::new("no-server");
    let config = dir.write_file("tunnel-client.yaml", "wireguard_local_addr: \"127.0.0.1:0\"\n");

    let mut client = TestProcess::spawn(&["client", "--config", config.to_str().unwrap()]);
    let status = client
        .wait_timeout(Duration::from_secs(10))
        .expect("Client should exit on startup error");
    assert!(!status.success());
}

#[test]
fn test_client_with_unreadable_ca_fails() {
    let dir = TestDir::new("bad-ca");
    let config = dir.write_file(
        "tunnel-client.yaml",
        &format!(
            "server_addr: \"127.0.0.1:{}\"\nca_cert_file: /nonexistent/ca.crt\n",
            get_test_port()
        ),
    );

    let mut client = TestProcess::spawn(&[
        "client",
        "--config",
        config.to_str().unwrap(),
        "--wireguard-local",
        "127.0.0.1:0",
    ]);
    let status = client
        .wait_timeout(Duration::from_secs(10))
        .expect("Client should exit on startup error");
    assert!(!status.success());
}

#[test]
fn test_missing_config_file_fails() {
    let mut server = TestProcess::spawn(&["server", "--config", "/nonexistent/tunnel-server.yaml"]);
    let status = server
        .wait_timeout(Duration::from_secs(10))
        .expect("Server should exit when the config file is missing");
    assert!(!status.success());
}
