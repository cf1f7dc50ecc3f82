//! SSH server implementation using russh.
//!
//! Handles:
//! - Password and public key authentication against the gateway's user table
//! - Session channels, whose requests are re-encoded and queued for the
//!   gateway's channel orchestrator
//! - Refusing port forwarding

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodKind, MethodSet, Sig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::gateway::{Gateway, User};
use crate::handlers::{ChannelControl, ChannelRequest, SessionChannel};
use crate::keys::fingerprint;
use crate::msg::{
    self, Env, ExitSignal, ExitStatus, Forwarding, PtyRequest, RemoteForward, Signal, Subsystem,
    WindowChange, WireMessage,
};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-connection handler state.
pub struct ConnectionHandler {
    gateway: Arc<Gateway>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// Authenticated user (set after auth).
    user: Option<Arc<User>>,

    /// Request queues of open session channels.
    channels: HashMap<ChannelId, mpsc::Sender<ChannelRequest>>,
}

impl ConnectionHandler {
    fn new(gateway: Arc<Gateway>, peer_addr: SocketAddr) -> Self {
        Self {
            gateway,
            peer_addr,
            user: None,
            channels: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Queue a request for the channel's orchestrator or handler. Requests
    /// nobody consumes anymore are refused here.
    async fn push_request(
        &mut self,
        channel_id: ChannelId,
        kind: &str,
        want_reply: bool,
        payload: Bytes,
        session: &mut Session,
    ) -> Result<()> {
        let request = ChannelRequest::new(kind, want_reply, payload);
        let delivered = match self.channels.get(&channel_id) {
            Some(tx) => tx.send(request).await.is_ok(),
            None => false,
        };
        if !delivered {
            debug!("[{}] no consumer on channel {:?}", kind, channel_id);
            self.channels.remove(&channel_id);
            if want_reply {
                session.channel_failure(channel_id)?;
            }
        }
        Ok(())
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.gateway.authenticate_password(user, password) {
            Some(found) => {
                info!("Password auth accepted for {} from {}", user, self.peer_addr);
                self.user = Some(found);
                Ok(Auth::Accept)
            }
            None => {
                warn!("Password auth rejected for {} from {}", user, self.peer_addr);
                Ok(Self::reject())
            }
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(
            "Public key {} offered by user '{}' from {}",
            fingerprint(public_key),
            user,
            self.peer_addr
        );
        match self.gateway.authenticate_public_key(user, public_key).await {
            Some(_) => Ok(Auth::Accept),
            None => Ok(Self::reject()),
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fp = fingerprint(public_key);
        match self.gateway.authenticate_public_key(user, public_key).await {
            Some(found) => {
                info!("Key {} accepted for {} from {}", fp, user, self.peer_addr);
                self.user = Some(found);
                Ok(Auth::Accept)
            }
            None => {
                warn!("Key {} rejected for {} from {}", fp, user, self.peer_addr);
                Ok(Self::reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let user = self
            .user
            .clone()
            .ok_or_else(|| anyhow!("Session channel before authentication"))?;
        if self.gateway.user(&user.name).is_none() {
            return Err(anyhow!("Unknown user {} from {}", user.name, self.peer_addr));
        }

        let id = channel.id();
        debug!("Session channel opened: {:?} by {}", id, user.name);

        let (tx, rx) = mpsc::channel(self.gateway.request_queue_capacity());
        self.channels.insert(id, tx);

        let control = Arc::new(RusshChannel {
            handle: session.handle(),
            id,
        });
        let stream = channel.into_stream();
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            let outcome = gateway
                .serve_channel(&user, SessionChannel::new(stream, control), rx)
                .await;
            debug!("Channel {:?} of {}: {:?}", id, user.name, outcome);
        });
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let modes: Vec<(u8, u32)> = modes.iter().map(|(op, v)| (*op as u8, *v)).collect();
        let payload = PtyRequest {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
            width: pix_width,
            height: pix_height,
            modes: msg::encode_terminal_modes(&modes),
        }
        .encode();
        self.push_request(channel_id, msg::PTY_REQ, true, payload, session)
            .await
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = WindowChange {
            cols: col_width,
            rows: row_height,
            width: pix_width,
            height: pix_height,
        }
        .encode();
        self.push_request(channel_id, msg::WINDOW_CHANGE, false, payload, session)
            .await
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        }
        .encode();
        self.push_request(channel_id, msg::ENV, true, payload, session)
            .await
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(
            "Exec request on channel {:?}: {}",
            channel_id,
            String::from_utf8_lossy(data)
        );
        self.push_request(channel_id, msg::EXEC, true, msg::encode_exec_raw(data), session)
            .await
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.push_request(channel_id, msg::SHELL, true, Bytes::new(), session)
            .await
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = Subsystem {
            name: name.to_string(),
        }
        .encode();
        self.push_request(channel_id, msg::SUBSYSTEM, true, payload, session)
            .await
    }

    async fn signal(
        &mut self,
        channel_id: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = Signal {
            signal: sig_name(&signal),
        }
        .encode();
        self.push_request(channel_id, msg::SIGNAL, false, payload, session)
            .await
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel_id);
        self.channels.remove(&channel_id);
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?}", channel_id);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = Forwarding {
            dest_addr: host_to_connect.to_string(),
            dest_port: port_to_connect,
            origin_addr: originator_address.to_string(),
            origin_port: originator_port,
        };
        warn!("Refusing direct-tcpip from {}: {:?}", self.peer_addr, request);
        // russh reports every refused open as administratively prohibited.
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let request = RemoteForward {
            bind_addr: address.to_string(),
            bind_port: *port,
        };
        warn!("Refusing tcpip-forward from {}: {:?}", self.peer_addr, request);
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Ignoring cancel-tcpip-forward for {}:{}", address, port);
        Ok(false)
    }
}

/// Control side of a session channel, driven through the connection handle.
struct RusshChannel {
    handle: Handle,
    id: ChannelId,
}

#[async_trait]
impl ChannelControl for RusshChannel {
    async fn reply(&self, ok: bool) {
        let _ = if ok {
            self.handle.channel_success(self.id).await
        } else {
            self.handle.channel_failure(self.id).await
        };
    }

    async fn exit_status(&self, msg: ExitStatus) {
        debug!("[{}] channel {:?}: {}", msg::EXIT_STATUS, self.id, msg.status);
        let _ = self.handle.exit_status_request(self.id, msg.status).await;
    }

    async fn exit_signal(&self, msg: ExitSignal) {
        debug!("[{}] channel {:?}: {}", msg::EXIT_SIGNAL, self.id, msg.signal);
        let _ = self
            .handle
            .exit_signal_request(
                self.id,
                sig_from_name(&msg.signal),
                msg.core_dumped,
                msg.error_message,
                msg.language_tag,
            )
            .await;
    }

    async fn close(&self) {
        let _ = self.handle.eof(self.id).await;
        let _ = self.handle.close(self.id).await;
    }

    async fn disconnect(&self, reason: &str) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, reason.to_string(), String::new())
            .await;
    }
}

fn sig_name(sig: &Sig) -> String {
    let name = match sig {
        Sig::ABRT => "ABRT",
        Sig::ALRM => "ALRM",
        Sig::FPE => "FPE",
        Sig::HUP => "HUP",
        Sig::ILL => "ILL",
        Sig::INT => "INT",
        Sig::KILL => "KILL",
        Sig::PIPE => "PIPE",
        Sig::QUIT => "QUIT",
        Sig::SEGV => "SEGV",
        Sig::TERM => "TERM",
        Sig::USR1 => "USR1",
        Sig::Custom(name) => name.as_str(),
    };
    name.to_string()
}

fn sig_from_name(name: &str) -> Sig {
    match name {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        other => Sig::Custom(other.to_string()),
    }
}

/// Accept connections forever, one task per connection.
pub async fn run_server(gateway: Arc<Gateway>, listener: TcpListener) -> Result<()> {
    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![gateway.host_key().clone()],
        methods: MethodSet::from(&[MethodKind::Password, MethodKind::PublicKey][..]),
        ..Default::default()
    });

    info!(
        "SSH server listening on {}",
        listener.local_addr().context("Listener has no local address")?
    );

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        debug!("Connection from {}", peer_addr);

        let gateway = gateway.clone();
        let russh_config = russh_config.clone();
        tokio::spawn(async move {
            let handler = ConnectionHandler::new(gateway, peer_addr);
            match russh::server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error from {}: {}", peer_addr, e);
                    }
                }
                Err(e) => {
                    warn!("SSH handshake with {} failed: {}", peer_addr, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names_round_trip() {
        for name in ["TERM", "KILL", "USR1", "HUP"] {
            assert_eq!(sig_name(&sig_from_name(name)), name);
        }
        assert!(matches!(sig_from_name("WINCH"), Sig::Custom(ref n) if n == "WINCH"));
    }
}
