use std::{future, net::SocketAddr, sync::Arc, time::Duration};

use color_eyre::eyre::Context;
use hyper::{Request, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use russh::keys::{
    decode_secret_key,
    ssh_key::{LineEnding, private::Ed25519Keypair},
};
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;
use tokio::{
    fs,
    net::{TcpListener, TcpStream, UdpSocket},
    pin,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ApplicationConfig,
    dns::{NameResolver, SystemRecursor},
    droppable_handle::DroppableHandle,
    error::ServerError,
    http::{HttpProxy, proxy_handler},
    lookup::{InstanceLookup, MemoryLookup},
    router::SniRouter,
    ssh::SshRelay,
    telemetry::{
        TELEMETRY_COUNTER_DAEMON_CONNECTIONS, TELEMETRY_COUNTER_TLS_CONNECTIONS,
        describe_telemetry,
    },
};

#[doc(hidden)]
// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting Gangway...");
    describe_telemetry();
    // Build the instance lookup, optionally seeded from a routes file.
    let lookup: Arc<dyn InstanceLookup> = match config.routes_file {
        Some(ref path) => Arc::new(
            MemoryLookup::from_routes_file(path).with_context(|| "Error loading routes file")?,
        ),
        None => Arc::new(MemoryLookup::default()),
    };
    // Find the private SSH key for Gangway or create a new one.
    let key = match fs::read_to_string(config.private_key_file.as_path()).await {
        Ok(key) => decode_secret_key(&key, None).with_context(|| "Error decoding secret key")?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!("Key file not found. Creating...");
            let key = russh::keys::PrivateKey::from(Ed25519Keypair::from_seed(
                &ChaCha20Rng::from_os_rng().random(),
            ));
            fs::create_dir_all(
                config
                    .private_key_file
                    .as_path()
                    .parent()
                    .ok_or(ServerError::InvalidFilePath)
                    .with_context(|| "Error parsing secret key path")?,
            )
            .await
            .with_context(|| "Error creating secret key directory")?;
            let key_string = key.to_openssh(LineEnding::LF)?;
            fs::write(config.private_key_file.as_path(), key_string)
                .await
                .with_context(|| "Error saving secret key to filesystem")?;
            key
        }
        Err(error) => return Err(error).with_context(|| "Error reading secret key"),
    };

    // TLS router
    let tls_listener = TcpListener::bind((config.listen_address, config.tls_port))
        .await
        .with_context(|| "Error listening to TLS port")?;
    info!("Listening for TLS connections on port {}.", config.tls_port);
    let sni_router = Arc::new(
        SniRouter::builder()
            .lookup(Arc::clone(&lookup))
            .buffer_size(config.buffer_size)
            .maybe_connection_timeout(config.connection_timeout)
            .telemetry_counter(TELEMETRY_COUNTER_TLS_CONNECTIONS)
            .build(),
    );
    let mut join_handle_tls = DroppableHandle(tokio::spawn(sni_router.serve(tls_listener)));

    // Daemon API router: same SNI routing, fixed backend port.
    let mut join_handle_daemon = if config.disable_daemon {
        DroppableHandle(tokio::spawn(future::pending::<()>()))
    } else {
        let daemon_listener = TcpListener::bind((config.listen_address, config.daemon_port))
            .await
            .with_context(|| "Error listening to daemon port")?;
        info!(
            "Listening for daemon API connections on port {}.",
            config.daemon_port
        );
        let daemon_router = Arc::new(
            SniRouter::builder()
                .lookup(Arc::clone(&lookup))
                .buffer_size(config.buffer_size)
                .fixed_port(config.daemon_target_port)
                .maybe_connection_timeout(config.connection_timeout)
                .telemetry_counter(TELEMETRY_COUNTER_DAEMON_CONNECTIONS)
                .build(),
        );
        DroppableHandle(tokio::spawn(daemon_router.serve(daemon_listener)))
    };

    // HTTP handler
    let http_listener = TcpListener::bind((config.listen_address, config.http_port))
        .await
        .with_context(|| "Error listening to HTTP port")?;
    info!(
        "Listening for HTTP connections on port {}.",
        config.http_port
    );
    let http_proxy = Arc::new(
        HttpProxy::builder()
            .lookup(Arc::clone(&lookup))
            .buffer_size(config.buffer_size)
            .maybe_http_request_timeout(config.http_request_timeout)
            .maybe_websocket_timeout(config.websocket_timeout)
            .build(),
    );
    let connection_timeout = config.connection_timeout;
    let mut join_handle_http = DroppableHandle(tokio::spawn(async move {
        loop {
            let proxy = Arc::clone(&http_proxy);
            let (stream, address) = match http_listener.accept().await {
                Ok((stream, address)) => (stream, address),
                Err(error) => {
                    error!(%error, "Unable to accept HTTP connection.");
                    break;
                }
            };
            if let Err(error) = stream.set_nodelay(true) {
                warn!(%error, %address, "Error setting nodelay.");
            }
            // Create a Hyper service and serve over the accepted TCP connection.
            let service = service_fn(move |request: Request<Incoming>| {
                proxy_handler(request, address, Arc::clone(&proxy))
            });
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let server = auto::Builder::new(TokioExecutor::new());
                let conn = server.serve_connection_with_upgrades(io, service);
                match connection_timeout {
                    Some(duration) => {
                        let _ = timeout(duration, conn).await;
                    }
                    None => {
                        let _ = conn.await;
                    }
                }
            });
        }
    }));

    // DNS responder
    let mut join_handle_dns = if config.disable_dns {
        DroppableHandle(tokio::spawn(future::pending::<()>()))
    } else {
        let udp_socket = UdpSocket::bind((config.listen_address, config.dns_port))
            .await
            .with_context(|| "Error listening to DNS port (UDP)")?;
        let tcp_listener = TcpListener::bind((config.listen_address, config.dns_port))
            .await
            .with_context(|| "Error listening to DNS port (TCP)")?;
        info!("Listening for DNS queries on port {}.", config.dns_port);
        let recursor = SystemRecursor::new().with_context(|| "Error creating DNS recursor")?;
        let resolver = NameResolver::new(Arc::clone(&lookup), recursor);
        let mut server = hickory_server::server::ServerFuture::new(resolver);
        server.register_socket(udp_socket);
        server.register_listener(tcp_listener, Duration::from_secs(5));
        DroppableHandle(tokio::spawn(async move {
            if let Err(error) = server.block_until_done().await {
                error!(%error, "DNS server error.");
            }
        }))
    };

    // Start the SSH relay
    let ssh_relay = Arc::new(SshRelay {
        lookup: Arc::clone(&lookup),
        backend_user: config.backend_ssh_user.clone(),
        backend_password: config.backend_ssh_password.clone(),
        buffer_size: config.buffer_size,
    });
    let ssh_config = Arc::new(russh::server::Config {
        keys: vec![key],
        ..Default::default()
    });
    let ssh_listener = TcpListener::bind((config.listen_address, config.ssh_port))
        .await
        .with_context(|| "Error listening to SSH port")?;
    info!("Listening for SSH connections on port {}.", config.ssh_port);
    info!("Gangway is now running.");
    // Add OS signal handlers for termination.
    let signal_handler = wait_for_signal();
    pin!(signal_handler);
    loop {
        tokio::select! {
            conn = ssh_listener.accept() => {
                let (stream, address) = match conn {
                    Ok((stream, address)) => (stream, address),
                    Err(error) => {
                        error!(%error, "Unable to accept SSH connection.");
                        break;
                    },
                };
                if let Err(error) = stream.set_nodelay(true) {
                    warn!(%error, %address, "Error setting nodelay.");
                }
                handle_ssh_connection(stream, address, Arc::clone(&ssh_config), &ssh_relay);
            }
            _ = &mut signal_handler => {
                break;
            }
            _ = &mut join_handle_tls.0 => {
                break;
            }
            _ = &mut join_handle_daemon.0 => {
                break;
            }
            _ = &mut join_handle_http.0 => {
                break;
            }
            _ = &mut join_handle_dns.0 => {
                break;
            }
        }
    }
    info!("Gangway is shutting down.");
    Ok(())
}

fn handle_ssh_connection(
    stream: TcpStream,
    address: SocketAddr,
    config: Arc<russh::server::Config>,
    relay: &Arc<SshRelay>,
) {
    let cancellation_token = CancellationToken::new();
    // Create a new SSH handler.
    let handler = relay.new_client(address, cancellation_token.clone());
    tokio::spawn(async move {
        let mut session = match russh::server::run_stream(config, stream, handler).await {
            Ok(session) => session,
            Err(error) => {
                warn!(%error, "Connection setup failed.");
                return;
            }
        };
        tokio::select! {
            result = &mut session => {
                if let Err(error) = result {
                    warn!(%error, %address, "Connection closed.");
                }
            }
            _ = cancellation_token.cancelled() => {
                info!(%address, "Disconnecting client...");
                let _ = session.handle().disconnect(russh::Disconnect::ByApplication, "".into(), "English".into()).await;
            },
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c().unwrap();
    let mut signal_break = windows::ctrl_break().unwrap();
    let mut signal_close = windows::ctrl_close().unwrap();
    let mut signal_shutdown = windows::ctrl_shutdown().unwrap();

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
}
