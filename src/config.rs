use std::{net::IpAddr, path::PathBuf, time::Duration};

use clap::Parser;

fn parse_duration(arg: &str) -> Result<Duration, humantime::DurationError> {
    arg.parse::<humantime::Duration>().map(Into::into)
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen for all client connections.
    #[arg(long, default_value_t = IpAddr::from([0, 0, 0, 0]))]
    pub listen_address: IpAddr,

    /// Port to listen for SNI-routed TLS connections.
    #[arg(long, default_value_t = 443)]
    pub tls_port: u16,

    /// Port to listen for plain HTTP and WebSocket connections.
    #[arg(long, default_value_t = 80)]
    pub http_port: u16,

    /// Port to listen for DNS queries, over both UDP and TCP.
    #[arg(long, default_value_t = 53)]
    pub dns_port: u16,

    /// Port to listen for SSH relay connections.
    #[arg(long, default_value_t = 22)]
    pub ssh_port: u16,

    /// Port to listen for daemon API connections.
    #[arg(long, default_value_t = 2375)]
    pub daemon_port: u16,

    /// Backend port that daemon API connections are relayed to, regardless
    /// of any port encoded in the hostname.
    #[arg(long, default_value_t = 2375)]
    pub daemon_target_port: u16,

    /// Username presented to backend SSH servers by the relay.
    #[arg(long, default_value = "root")]
    pub backend_ssh_user: String,

    /// Password presented to backend SSH servers by the relay.
    #[arg(long, default_value = "root")]
    pub backend_ssh_password: String,

    /// File path for the server's private SSH key, created if missing.
    #[arg(long, default_value = "./deploy/server_keys/ssh")]
    pub private_key_file: PathBuf,

    /// Optional JSON file seeding the in-memory instance table.
    #[arg(long)]
    pub routes_file: Option<PathBuf>,

    /// Buffer size for bidirectional copying.
    #[arg(long, default_value_t = 32_768)]
    pub buffer_size: usize,

    /// Optional duration to time out relayed TCP connections.
    #[arg(long, value_parser = parse_duration)]
    pub connection_timeout: Option<Duration>,

    /// Optional duration until an outgoing HTTP request is canceled.
    #[arg(long, value_parser = parse_duration)]
    pub http_request_timeout: Option<Duration>,

    /// Optional duration until an established WebSocket connection is
    /// canceled.
    #[arg(long, value_parser = parse_duration)]
    pub websocket_timeout: Option<Duration>,

    /// Disable the DNS responder.
    #[arg(long, default_value_t = false)]
    pub disable_dns: bool,

    /// Disable the daemon API listener.
    #[arg(long, default_value_t = false)]
    pub disable_daemon: bool,
}
