use std::{sync::Arc, time::Duration};

use bon::Builder;
use metrics::counter;
use tokio::{
    io::copy_bidirectional_with_sizes,
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::ServerError,
    host::{decode_alias_host, decode_host},
    lookup::InstanceLookup,
    peek::{ReplayStream, read_tls_record},
    tls::parse_sni,
};

// Service that routes TLS connections by their ClientHello SNI without
// terminating TLS. Every failure along the way closes the one affected
// connection; the listener itself never stops accepting.
#[derive(Builder)]
pub(crate) struct SniRouter {
    // Instance storage to resolve decoded identities against.
    lookup: Arc<dyn InstanceLookup>,
    // Buffer size for bidirectional copying.
    buffer_size: usize,
    // When set, all connections go to this backend port and any port encoded
    // in the hostname is ignored. Used for the daemon API listener.
    fixed_port: Option<u16>,
    // Optional duration to time out relayed connections.
    connection_timeout: Option<Duration>,
    // Counter to increment per relayed connection.
    telemetry_counter: &'static str,
}

impl SniRouter {
    // Accept connections forever, spawning one relay task per connection.
    pub(crate) async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, address)) => {
                    if let Err(error) = stream.set_nodelay(true) {
                        warn!(%address, %error, "Error setting nodelay.");
                    }
                    let clone = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(error) = clone.route_connection(stream).await {
                            info!(%address, %error, "Closing TLS connection.");
                        }
                    });
                }
                Err(error) => {
                    error!(%error, "Error accepting TLS connection.");
                }
            }
        }
    }

    // Peek the ClientHello, resolve the SNI to a backend, then splice bytes
    // until either side ends. The peeked bytes are replayed to the backend,
    // so the handshake passes through intact.
    async fn route_connection(&self, mut stream: TcpStream) -> color_eyre::Result<()> {
        let record = read_tls_record(&mut stream).await?;
        let server_name = parse_sni(&record).ok_or(ServerError::UnknownHost)?;
        let (host, port) = self.resolve(&server_name).await?;
        let port = self.fixed_port.unwrap_or(port);
        let mut backend = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|_| ServerError::BackendUnreachable)?;
        counter!(self.telemetry_counter).increment(1);
        debug!(%server_name, %host, %port, "Relaying TLS connection.");
        let mut stream = ReplayStream::new(record, stream);
        match self.connection_timeout {
            Some(duration) => {
                let _ = timeout(
                    duration,
                    copy_bidirectional_with_sizes(
                        &mut stream,
                        &mut backend,
                        self.buffer_size,
                        self.buffer_size,
                    ),
                )
                .await;
            }
            None => {
                let _ = copy_bidirectional_with_sizes(
                    &mut stream,
                    &mut backend,
                    self.buffer_size,
                    self.buffer_size,
                )
                .await;
            }
        }
        Ok(())
    }

    // Decode the server name as a direct-form identity first, then as an
    // alias. The encoded port wins over the instance's default port.
    async fn resolve(&self, server_name: &str) -> color_eyre::Result<(String, u16)> {
        if let Ok(identity) = decode_host(server_name) {
            let (host, port) = self
                .lookup
                .resolve_by_address(&identity.session_id, &identity.instance_address)
                .await?;
            let port = if identity.encoded_port > 0 {
                identity.encoded_port
            } else {
                port
            };
            return Ok((host, port));
        }
        let identity = decode_alias_host(server_name)?;
        let address = self
            .lookup
            .resolve_by_alias(&identity.alias, &identity.session_prefix)
            .await?;
        let (host, port) = self
            .lookup
            .resolve_by_address(&identity.session_prefix, &address)
            .await
            .unwrap_or((address, 80));
        let port = if identity.encoded_port > 0 {
            identity.encoded_port
        } else {
            port
        };
        Ok((host, port))
    }
}
