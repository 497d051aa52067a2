use std::{sync::Arc, time::Duration};

use clap::Parser;
use gangway::{ApplicationConfig, entrypoint};
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;
use russh::{
    Channel, ChannelId, ChannelMsg, CryptoVec, Sig,
    keys::{key::PrivateKeyWithHashAlg, ssh_key::private::Ed25519Keypair},
    server::{Auth, Msg, Session},
};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};

fn generate_key() -> russh::keys::PrivateKey {
    russh::keys::PrivateKey::from(Ed25519Keypair::from_seed(
        &ChaCha20Rng::from_os_rng().random(),
    ))
}

// Backend SSH server that accepts the relay credential and answers exec
// requests with a canned reply and exit status.
struct BackendHandler;

impl russh::server::Handler for BackendHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == "root" && password == "root" {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        if data == b"crash" {
            session.exit_signal_request(channel, Sig::KILL, false, "killed", "")?;
        } else {
            let reply = format!("ran: {}", String::from_utf8_lossy(data));
            session.data(channel, CryptoVec::from(reply.into_bytes()))?;
            session.exit_status_request(channel, 0)?;
        }
        session.eof(channel)?;
        session.close(channel)?;
        Ok(())
    }

    // Accept forwarding to one well-known address only, so the test can see
    // both an accepted and a refused open.
    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(host_to_connect == "10.9.9.9")
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Forwarded-channel payloads are echoed straight back.
        session.data(channel, CryptoVec::from(data.to_vec()))?;
        Ok(())
    }
}

struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn authenticated_session() -> russh::client::Handle<ClientHandler> {
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18622", ClientHandler)
        .await
        .expect("Failed to connect to SSH relay");
    let authenticated = session
        .authenticate_publickey(
            "10-0-0-1-aaabbbcc",
            PrivateKeyWithHashAlg::new(
                Arc::new(generate_key()),
                session.best_supported_rsa_hash().await.unwrap().flatten(),
            ),
        )
        .await
        .expect("SSH authentication errored");
    assert!(authenticated.success(), "authentication didn't succeed");
    session
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ssh_relay() {
    // 1. Start a backend SSH server on a random port
    let backend_listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Backend bind failed");
    let backend_port = backend_listener.local_addr().unwrap().port();
    let backend_config = Arc::new(russh::server::Config {
        keys: vec![generate_key()],
        ..Default::default()
    });
    tokio::spawn(async move {
        loop {
            let (stream, _) = backend_listener.accept().await.unwrap();
            let config = Arc::clone(&backend_config);
            tokio::spawn(async move {
                let session = russh::server::run_stream(config, stream, BackendHandler)
                    .await
                    .expect("Backend session setup failed");
                let _ = session.await;
            });
        }
    });

    // 2. Initialize Gangway
    let routes_path = std::env::temp_dir().join("gangway-ssh-relay-routes.json");
    std::fs::write(
        &routes_path,
        format!(
            r#"[{{"id": "aaabbbcccddd", "instances": [{{"address": "10.0.0.1", "host": "127.0.0.1", "ssh_port": {backend_port}}}]}}]"#
        ),
    )
    .unwrap();
    let config = ApplicationConfig::parse_from([
        "gangway".into(),
        "--listen-address=127.0.0.1".into(),
        "--ssh-port=18622".into(),
        "--tls-port=18623".into(),
        "--http-port=18624".into(),
        "--disable-dns".into(),
        "--disable-daemon".into(),
        format!(
            "--private-key-file={}",
            std::env::temp_dir()
                .join("gangway-ssh-relay-keys/ssh")
                .display()
        ),
        format!("--routes-file={}", routes_path.display()),
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:18622").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for Gangway to start.")
    };

    // 3. A username outside the grammar is rejected, whatever the key
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18622", ClientHandler)
        .await
        .expect("Failed to connect to SSH relay");
    let authenticated = session
        .authenticate_publickey(
            "root",
            PrivateKeyWithHashAlg::new(
                Arc::new(generate_key()),
                session.best_supported_rsa_hash().await.unwrap().flatten(),
            ),
        )
        .await
        .expect("SSH authentication errored");
    assert!(!authenticated.success(), "invalid username must be rejected");

    // 4. A username encoding a known instance is accepted with any key
    let session = authenticated_session().await;

    // 5. An exec request is forwarded and its output relayed back
    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    channel.exec(true, "uptime").await.expect("exec failed");
    let mut output = Vec::new();
    let mut exit_status = None;
    timeout(Duration::from_secs(5), async {
        loop {
            let Some(message) = channel.wait().await else {
                break;
            };
            match message {
                ChannelMsg::Data { data } => output.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    })
    .await
    .expect("Timeout waiting for relayed channel");
    assert_eq!(String::from_utf8_lossy(&output), "ran: uptime");
    assert_eq!(exit_status, Some(0));

    // The backend closing the primary channel ends that whole session, so
    // the forwarding checks run on a fresh connection.
    drop(session);

    // 6. A direct-tcpip channel is paired with a matching backend channel
    let session = authenticated_session().await;
    let mut forwarded = session
        .channel_open_direct_tcpip("10.9.9.9", 7070, "127.0.0.1", 0)
        .await
        .expect("channel_open_direct_tcpip failed");
    forwarded
        .data(&b"ping through the relay"[..])
        .await
        .expect("Error writing to forwarded channel");
    let mut echoed = Vec::new();
    timeout(Duration::from_secs(5), async {
        while echoed.len() < b"ping through the relay".len() {
            let Some(message) = forwarded.wait().await else {
                break;
            };
            if let ChannelMsg::Data { data } = message {
                echoed.extend_from_slice(&data);
            }
        }
    })
    .await
    .expect("Timeout waiting for forwarded echo");
    assert_eq!(&echoed[..], b"ping through the relay");

    // 7. A backend-refused open is relayed back as a failed open
    assert!(
        session
            .channel_open_direct_tcpip("refused.invalid", 80, "127.0.0.1", 0)
            .await
            .is_err(),
        "refused forwarding must fail the inbound open"
    );

    // 8. A signal-terminated exec relays the exit signal, not a status
    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    channel.exec(true, "crash").await.expect("exec failed");
    let mut signal = None;
    timeout(Duration::from_secs(5), async {
        loop {
            let Some(message) = channel.wait().await else {
                break;
            };
            match message {
                ChannelMsg::ExitSignal {
                    signal_name,
                    error_message,
                    ..
                } => signal = Some((signal_name, error_message)),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    })
    .await
    .expect("Timeout waiting for exit signal");
    let (signal_name, error_message) = signal.expect("exit signal was not relayed");
    assert!(matches!(signal_name, Sig::KILL));
    assert_eq!(error_message, "killed");
}
