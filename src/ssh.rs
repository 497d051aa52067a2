use std::{collections::HashMap, collections::VecDeque, net::SocketAddr, sync::Arc};

use metrics::counter;
use russh::{
    Channel, ChannelId, ChannelMsg, CryptoVec, MethodKind, MethodSet, Pty, Sig, client,
    keys::PublicKey,
    server::{Auth, Handle, Handler, Msg, Session},
};
use tokio::{
    io::copy_bidirectional_with_sizes,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    host::decode_ssh_username,
    lookup::{InstanceLookup, SshEndpoint},
    telemetry::TELEMETRY_COUNTER_SSH_SESSIONS,
};

#[derive(thiserror::Error, Debug)]
enum RelayError {
    #[error("username doesn't resolve to an instance")]
    Unresolved,
    #[error("cannot reach instance: {0}")]
    Dial(#[from] russh::Error),
    #[error("instance rejected relay credentials")]
    AuthFailed,
}

// Shared data for the SSH entry point.
pub(crate) struct SshRelay {
    // Instance storage to resolve decoded usernames against.
    pub(crate) lookup: Arc<dyn InstanceLookup>,
    // Fixed low-privilege credential presented to every backend.
    pub(crate) backend_user: String,
    pub(crate) backend_password: String,
    // Buffer size for bidirectional copying on forwarded channels.
    pub(crate) buffer_size: usize,
}

impl SshRelay {
    // Create a new handler for an inbound SSH connection.
    pub(crate) fn new_client(
        self: &Arc<Self>,
        peer: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> RelayHandler {
        info!(%peer, "SSH client connected.");
        RelayHandler {
            relay: Arc::clone(self),
            peer,
            cancellation_token,
            endpoint: None,
            backend: None,
            channels: HashMap::new(),
            primary_channel: None,
        }
    }
}

// Commands sent from the server-side handler to the task owning the
// matching outbound channel.
enum OutboundCommand {
    Data(Vec<u8>),
    ExtendedData(u32, Vec<u8>),
    Eof,
    Close,
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
        reply: oneshot::Sender<bool>,
    },
    Shell {
        reply: oneshot::Sender<bool>,
    },
    Exec {
        command: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },
    Subsystem {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Env {
        name: String,
        value: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
}

impl OutboundCommand {
    // Commands that enqueue a reply sender before going out. A failed send
    // of any other command must not consume an in-flight reply.
    fn carries_reply(&self) -> bool {
        matches!(
            self,
            OutboundCommand::Pty { .. }
                | OutboundCommand::Shell { .. }
                | OutboundCommand::Exec { .. }
                | OutboundCommand::Subsystem { .. }
        )
    }
}

// Per-connection state for the SSH relay.
pub(crate) struct RelayHandler {
    relay: Arc<SshRelay>,
    peer: SocketAddr,
    // Channel to communicate that this connection must be closed.
    cancellation_token: CancellationToken,
    // The backend SSH endpoint decoded from the username during auth.
    endpoint: Option<SshEndpoint>,
    // Outbound connection to the backend, established on the first channel.
    backend: Option<client::Handle<BackendClient>>,
    // Senders toward the outbound relay task, one per inbound channel.
    channels: HashMap<ChannelId, UnboundedSender<OutboundCommand>>,
    // The first session channel; errors on it end the whole connection.
    primary_channel: Option<ChannelId>,
}

impl RelayHandler {
    async fn ensure_backend(&mut self) -> Result<&mut client::Handle<BackendClient>, RelayError> {
        if self.backend.is_none() {
            let endpoint = self.endpoint.clone().ok_or(RelayError::Unresolved)?;
            let mut handle = client::connect(
                Default::default(),
                (endpoint.host.as_str(), endpoint.port),
                BackendClient,
            )
            .await?;
            let authenticated = handle
                .authenticate_password(
                    self.relay.backend_user.clone(),
                    self.relay.backend_password.clone(),
                )
                .await?;
            if !authenticated.success() {
                return Err(RelayError::AuthFailed);
            }
            self.backend = Some(handle);
        }
        match self.backend.as_mut() {
            Some(handle) => Ok(handle),
            None => Err(RelayError::Unresolved),
        }
    }

    // Report a failure on the stderr stream of an accepted channel, then
    // close the whole connection.
    fn fail_channel(&self, handle: Handle, channel_id: ChannelId, error: &RelayError) {
        warn!(peer = %self.peer, %error, "SSH relay setup failed.");
        let message = format!("gangway: {error}\r\n");
        let cancellation_token = self.cancellation_token.clone();
        tokio::spawn(async move {
            let _ = handle
                .extended_data(channel_id, 1, CryptoVec::from(message.into_bytes()))
                .await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
            cancellation_token.cancel();
        });
    }

    // Forward a channel request to the outbound side and wait for the
    // backend's reply.
    async fn forward_request<F>(&mut self, channel: ChannelId, build: F) -> bool
    where
        F: FnOnce(oneshot::Sender<bool>) -> OutboundCommand,
    {
        let Some(tx) = self.channels.get(&channel) else {
            return false;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(build(reply_tx)).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    fn forward(&mut self, channel: ChannelId, command: OutboundCommand) {
        if let Some(tx) = self.channels.get(&channel) {
            let _ = tx.send(command);
        }
    }
}

impl Handler for RelayHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        })
    }

    // Any key is accepted, but only for usernames that decode to a known
    // instance. Everything else is rejected before a channel can open.
    #[tracing::instrument(skip(self, _public_key), fields(peer = %self.peer), level = "debug")]
    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let Ok(target) = decode_ssh_username(user) else {
            warn!(peer = %self.peer, %user, "Rejecting SSH user: invalid username format.");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            });
        };
        match self
            .relay
            .lookup
            .resolve_ssh_target(&target.session_prefix, target.instance_ip)
            .await
        {
            Ok(endpoint) => {
                info!(
                    peer = %self.peer, %user, instance = %target.instance_ip,
                    "SSH client authenticated."
                );
                self.endpoint = Some(endpoint);
                Ok(Auth::Accept)
            }
            Err(error) => {
                warn!(peer = %self.peer, %user, %error, "Rejecting SSH user: unknown instance.");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    // Open a matching session channel on the backend and pair the two.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();
        let handle = session.handle();
        let outbound = async {
            let backend = self.ensure_backend().await?;
            backend
                .channel_open_session()
                .await
                .map_err(RelayError::Dial)
        }
        .await;
        let outbound = match outbound {
            Ok(outbound) => outbound,
            Err(error) => {
                // The channel is accepted so the error report can reach the
                // client's stderr before the connection closes.
                self.fail_channel(handle, channel_id, &error);
                return Ok(true);
            }
        };
        counter!(TELEMETRY_COUNTER_SSH_SESSIONS).increment(1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(channel_id, tx);
        // Errors on the primary channel tear down the whole session; the
        // others only kill their own pair.
        let close_session = if self.primary_channel.is_none() {
            self.primary_channel = Some(channel_id);
            Some(self.cancellation_token.clone())
        } else {
            None
        };
        tokio::spawn(relay_channel(RelayedChannel {
            outbound,
            channel_id,
            handle,
            rx,
            close_session,
        }));
        Ok(true)
    }

    // Pair a local forwarding request with an identical one to the backend.
    #[tracing::instrument(skip(self, channel, _session), fields(peer = %self.peer), level = "debug")]
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if port_to_connect > u16::MAX.into() || originator_port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        let backend = match self.ensure_backend().await {
            Ok(backend) => backend,
            Err(error) => {
                debug!(peer = %self.peer, %error, "Refusing direct-tcpip channel.");
                return Ok(false);
            }
        };
        let outbound = match backend
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(outbound) => outbound,
            Err(error) => {
                debug!(peer = %self.peer, %error, "Backend refused direct-tcpip channel.");
                return Ok(false);
            }
        };
        let buffer_size = self.relay.buffer_size;
        tokio::spawn(async move {
            let mut inbound = channel.into_stream();
            let mut outbound = outbound.into_stream();
            let _ = copy_bidirectional_with_sizes(
                &mut inbound,
                &mut outbound,
                buffer_size,
                buffer_size,
            )
            .await;
        });
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, OutboundCommand::Data(data.to_vec()));
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, OutboundCommand::ExtendedData(code, data.to_vec()));
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, OutboundCommand::Eof);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self.channels.remove(&channel) {
            let _ = tx.send(OutboundCommand::Close);
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let term = term.to_owned();
        let modes = modes.to_vec();
        if self
            .forward_request(channel, move |reply| OutboundCommand::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
                reply,
            })
            .await
        {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self
            .forward_request(channel, |reply| OutboundCommand::Shell { reply })
            .await
        {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = data.to_vec();
        if self
            .forward_request(channel, move |reply| OutboundCommand::Exec {
                command,
                reply,
            })
            .await
        {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let name = name.to_owned();
        if self
            .forward_request(channel, move |reply| OutboundCommand::Subsystem {
                name,
                reply,
            })
            .await
        {
            session.channel_success(channel)
        } else {
            session.channel_failure(channel)
        }
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            OutboundCommand::Env {
                name: variable_name.to_owned(),
                value: variable_value.to_owned(),
            },
        );
        session.channel_success(channel)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            OutboundCommand::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        );
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, OutboundCommand::Signal(signal));
        Ok(())
    }

    // Agent forwarding never crosses the relay.
    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    // Global forwarding requests are read and dropped.
    async fn tcpip_forward(
        &mut self,
        _address: &str,
        _port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }
}

impl Drop for RelayHandler {
    fn drop(&mut self) {
        info!(peer = %self.peer, "SSH client disconnected.");
    }
}

// Outbound client transport. The backend network is the trust boundary, so
// host keys are not pinned.
struct BackendClient;

impl client::Handler for BackendClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct RelayedChannel {
    outbound: Channel<client::Msg>,
    channel_id: ChannelId,
    handle: Handle,
    rx: UnboundedReceiver<OutboundCommand>,
    // Present on the primary channel only.
    close_session: Option<CancellationToken>,
}

// Own the outbound channel: apply commands from the inbound side and push
// the backend's channel messages back to the client. Replies to forwarded
// requests come back in order, so a queue of reply senders suffices.
async fn relay_channel(
    RelayedChannel {
        mut outbound,
        channel_id,
        handle,
        mut rx,
        close_session,
    }: RelayedChannel,
) {
    let mut pending_replies: VecDeque<oneshot::Sender<bool>> = VecDeque::new();
    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                let carries_reply = command.carries_reply();
                let result = match command {
                    OutboundCommand::Data(data) => outbound.data(&data[..]).await,
                    OutboundCommand::ExtendedData(code, data) => {
                        outbound.extended_data(code, &data[..]).await
                    }
                    OutboundCommand::Eof => outbound.eof().await,
                    OutboundCommand::Close => break,
                    OutboundCommand::Pty {
                        term,
                        col_width,
                        row_height,
                        pix_width,
                        pix_height,
                        modes,
                        reply,
                    } => {
                        pending_replies.push_back(reply);
                        outbound
                            .request_pty(
                                true,
                                &term,
                                col_width,
                                row_height,
                                pix_width,
                                pix_height,
                                &modes,
                            )
                            .await
                    }
                    OutboundCommand::Shell { reply } => {
                        pending_replies.push_back(reply);
                        outbound.request_shell(true).await
                    }
                    OutboundCommand::Exec { command, reply } => {
                        pending_replies.push_back(reply);
                        outbound.exec(true, command).await
                    }
                    OutboundCommand::Subsystem { name, reply } => {
                        pending_replies.push_back(reply);
                        outbound.request_subsystem(true, &name).await
                    }
                    OutboundCommand::Env { name, value } => {
                        outbound.set_env(false, &name, &value).await
                    }
                    OutboundCommand::WindowChange {
                        col_width,
                        row_height,
                        pix_width,
                        pix_height,
                    } => {
                        outbound
                            .window_change(col_width, row_height, pix_width, pix_height)
                            .await
                    }
                    OutboundCommand::Signal(signal) => outbound.signal(signal).await,
                };
                if let Err(error) = result {
                    debug!(%error, "Error forwarding to backend channel.");
                    // A request that never went out will never get a reply.
                    if carries_reply {
                        if let Some(reply) = pending_replies.pop_back() {
                            let _ = reply.send(false);
                        }
                    }
                }
            }
            message = outbound.wait() => {
                let Some(message) = message else { break };
                match message {
                    ChannelMsg::Data { data } => {
                        if handle.data(channel_id, data).await.is_err() {
                            break;
                        }
                    }
                    ChannelMsg::ExtendedData { data, ext } => {
                        if handle.extended_data(channel_id, ext, data).await.is_err() {
                            break;
                        }
                    }
                    ChannelMsg::Eof => {
                        let _ = handle.eof(channel_id).await;
                    }
                    ChannelMsg::Success => {
                        if let Some(reply) = pending_replies.pop_front() {
                            let _ = reply.send(true);
                        }
                    }
                    ChannelMsg::Failure => {
                        if let Some(reply) = pending_replies.pop_front() {
                            let _ = reply.send(false);
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        let _ = handle.exit_status_request(channel_id, exit_status).await;
                    }
                    ChannelMsg::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                        lang_tag,
                    } => {
                        let _ = handle
                            .exit_signal_request(
                                channel_id,
                                signal_name,
                                core_dumped,
                                error_message,
                                lang_tag,
                            )
                            .await;
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        }
    }
    // Teardown is idempotent from either direction.
    let _ = outbound.close().await;
    let _ = handle.close(channel_id).await;
    if let Some(cancellation_token) = close_session {
        cancellation_token.cancel();
    }
}
