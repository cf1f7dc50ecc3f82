//! User and route tables, authentication decisions and per-channel
//! orchestration.
//!
//! The gateway knows nothing about the SSH library. The `ssh` module turns
//! library callbacks into calls on [`Gateway`] and feeds every session
//! channel's requests into [`Gateway::serve_channel`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh::keys::{PrivateKey, PublicKey};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, UserConfig};
use crate::handlers::api::API_PATH;
use crate::handlers::{
    ApiHandler, ChannelRequest, CommandHandler, Handler, PendingRequests, RequestStream,
    SessionChannel,
};
use crate::keys;
use crate::msg::{self, Exec, ExitStatus, WireMessage};
use crate::router::{Access, Route, Router, extract_params, routing_key};

/// Parameter carrying the authenticated user name into every handler.
pub const USERNAME_PARAM: &str = "EXECGATE_USERNAME";

/// Exit status sent when a user may not use the requested route.
const FORBIDDEN_STATUS: u32 = 403;

/// A configured user and its credentials.
#[derive(Debug)]
pub struct User {
    pub name: String,
    password: Option<String>,
    public_keys: Vec<PublicKey>,
    public_key_path: Option<PathBuf>,
}

impl User {
    /// Build a user, validating literal keys and the key file once.
    async fn from_config(config: &UserConfig) -> Result<Self> {
        let mut public_keys = Vec::new();
        if let Some(line) = &config.public_key {
            let key = keys::parse_public_key(line)
                .with_context(|| format!("Invalid public_key for user {}", config.name))?;
            public_keys.push(key);
        }

        if let Some(path) = &config.public_key_path {
            let found = keys::read_public_keys(path)
                .await
                .with_context(|| format!("Invalid public_key_path for user {}", config.name))?;
            debug!("User {} has {} key(s) in {}", config.name, found.len(), path.display());
        }

        Ok(Self {
            name: config.name.clone(),
            password: config.password.clone(),
            public_keys,
            public_key_path: config.public_key_path.clone(),
        })
    }

    fn check_password(&self, password: &str) -> bool {
        self.password
            .as_deref()
            .is_some_and(|expected| expected.as_bytes() == password.as_bytes())
    }

    /// Compare against the literal key, then against a fresh read of the key file.
    async fn check_public_key(&self, key: &PublicKey) -> bool {
        if self.public_keys.iter().any(|k| keys::same_key(k, key)) {
            return true;
        }
        let Some(path) = &self.public_key_path else {
            return false;
        };
        match keys::read_public_keys(path).await {
            Ok(found) => found.iter().any(|k| keys::same_key(k, key)),
            Err(e) => {
                warn!("Failed to load public keys for {}: {:#}", self.name, e);
                false
            }
        }
    }
}

/// How the orchestrator finished with a session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// A handler for this route key owns the channel now.
    Dispatched(String),
    MalformedExec,
    RouteNotFound(String),
    Forbidden(String),
    /// The request stream ended before any `exec`.
    Closed,
}

pub struct Gateway {
    users: HashMap<String, Arc<User>>,
    router: Router,
    host_key: PrivateKey,
    request_queue_capacity: usize,
}

impl Gateway {
    /// Build the user and route tables. Invalid keys, unreadable key files and
    /// an unreadable host key are fatal.
    pub async fn new(config: &GatewayConfig) -> Result<Self> {
        let mut router = Router::new();
        for route in &config.routes {
            let Some(command) = &route.handler.command else {
                warn!("Route {} has no handler, skipping", route.uri);
                continue;
            };
            let spec = Arc::new(command.spec());
            info!("Route {} -> {} {:?}", route.uri, spec.cmd, spec.args);
            router.register(
                Route::new(&route.uri, route.access()),
                Arc::new(move || -> Box<dyn Handler> {
                    Box::new(CommandHandler::new(spec.clone()))
                }),
            );
        }

        let mut listing = router.keys();
        listing.push(API_PATH.to_string());
        listing.sort();
        listing.dedup();
        let listing: Arc<[String]> = listing.into();
        router.register(
            Route::new(API_PATH, Access::AllUsers),
            Arc::new(move || -> Box<dyn Handler> { Box::new(ApiHandler::new(listing.clone())) }),
        );

        let mut users = HashMap::new();
        for user_config in &config.users {
            let user = User::from_config(user_config).await?;
            if users.insert(user.name.clone(), Arc::new(user)).is_some() {
                warn!("User {} configured twice, using the last entry", user_config.name);
            }
        }
        info!("Loaded {} user(s) and {} route(s)", users.len(), router.keys().len());

        Ok(Self {
            users,
            router,
            host_key: keys::load_host_key(config.host_key_file.as_deref())?,
            request_queue_capacity: config.request_queue_capacity.max(1),
        })
    }

    pub fn host_key(&self) -> &PrivateKey {
        &self.host_key
    }

    pub fn request_queue_capacity(&self) -> usize {
        self.request_queue_capacity
    }

    pub fn user(&self, name: &str) -> Option<Arc<User>> {
        self.users.get(name).cloned()
    }

    pub fn authenticate_password(&self, name: &str, password: &str) -> Option<Arc<User>> {
        self.users
            .get(name)
            .filter(|user| user.check_password(password))
            .cloned()
    }

    pub async fn authenticate_public_key(&self, name: &str, key: &PublicKey) -> Option<Arc<User>> {
        let user = self.users.get(name)?;
        user.check_public_key(key).await.then(|| user.clone())
    }

    /// Sequence the requests of one session channel until `exec` arrives,
    /// then hand the channel and every buffered request to the route handler.
    pub async fn serve_channel(
        &self,
        user: &User,
        channel: SessionChannel,
        mut live: mpsc::Receiver<ChannelRequest>,
    ) -> ChannelOutcome {
        let control = channel.control.clone();
        let mut pending = PendingRequests::new(self.request_queue_capacity);

        while let Some(req) = live.recv().await {
            if req.kind != msg::EXEC {
                if let Err(req) = pending.push(req) {
                    warn!(
                        "Request queue full ({} pending), dropping {} request",
                        pending.len(),
                        req.kind
                    );
                    req.reply(control.as_ref(), false).await;
                }
                continue;
            }

            let command = match Exec::decode(&req.payload) {
                Ok(exec) => exec.command,
                Err(e) => {
                    warn!("[exec] failed to parse payload from {}: {}", user.name, e);
                    req.reply(control.as_ref(), false).await;
                    control.close().await;
                    return ChannelOutcome::MalformedExec;
                }
            };

            // Anything after the first space is ignored.
            let path = command.split_once(' ').map_or(command.as_str(), |(path, _)| path);
            let key = routing_key(path).to_string();

            let Some(route) = self.router.lookup(&key) else {
                warn!("No route for {} requested by {}", key, user.name);
                control.close().await;
                control.disconnect("route not found").await;
                return ChannelOutcome::RouteNotFound(key);
            };
            if !route.allows(&user.name) {
                warn!("User {} is not allowed to use {}", user.name, key);
                control
                    .exit_status(ExitStatus {
                        status: FORBIDDEN_STATUS,
                    })
                    .await;
                control.close().await;
                return ChannelOutcome::Forbidden(key);
            }

            let mut params = extract_params(path);
            params.insert(USERNAME_PARAM.to_string(), user.name.clone());
            info!(
                "{} -> {} ({} buffered request(s))",
                user.name,
                key,
                pending.len()
            );
            req.reply(control.as_ref(), true).await;

            let requests = RequestStream::new(pending, live);
            return match self.router.dispatch(&key, channel, requests, params) {
                Ok(()) => ChannelOutcome::Dispatched(key),
                Err(e) => {
                    warn!("Dispatch failed: {}", e);
                    control.close().await;
                    ChannelOutcome::RouteNotFound(key)
                }
            };
        }

        debug!("Channel of {} closed before exec", user.name);
        ChannelOutcome::Closed
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::{CommandConfig, HandlerConfig, RouteConfig};
    use crate::handlers::Params;
    use crate::handlers::testing::{Event, RecordingControl};
    use crate::keys::tests::{openssh_line, random_key};
    use crate::msg::{Env, PtyRequest, WindowChange};

    fn route(uri: &str, allow: &[&str], cmd: Option<(&str, &[&str])>) -> RouteConfig {
        RouteConfig {
            uri: uri.to_string(),
            allow: allow.iter().map(|s| s.to_string()).collect(),
            allow_all_users: allow.is_empty(),
            handler: HandlerConfig {
                command: cmd.map(|(cmd, args)| CommandConfig {
                    cmd: cmd.to_string(),
                    args: args.iter().map(|s| s.to_string()).collect(),
                    timeout_secs: None,
                }),
            },
        }
    }

    fn password_user(name: &str, password: &str) -> UserConfig {
        UserConfig {
            name: name.to_string(),
            password: Some(password.to_string()),
            ..Default::default()
        }
    }

    async fn gateway(capacity: usize) -> Gateway {
        let config = GatewayConfig {
            request_queue_capacity: capacity,
            users: vec![password_user("alice", "p"), password_user("bob", "b")],
            routes: vec![
                route("/echo", &[], Some(("echo", &["hello"]))),
                route("/admin", &["alice"], Some(("true", &[]))),
                route("/nothing", &[], None),
            ],
            ..Default::default()
        };
        Gateway::new(&config).await.unwrap()
    }

    fn exec(command: &str) -> ChannelRequest {
        ChannelRequest::new(msg::EXEC, true, Exec { command: command.to_string() }.encode())
    }

    fn env(name: &str) -> ChannelRequest {
        let payload = Env {
            name: name.to_string(),
            value: "1".to_string(),
        }
        .encode();
        ChannelRequest::new(msg::ENV, true, payload)
    }

    fn pty_req() -> ChannelRequest {
        let payload = PtyRequest {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
            width: 0,
            height: 0,
            modes: msg::encode_terminal_modes(&[]),
        }
        .encode();
        ChannelRequest::new(msg::PTY_REQ, true, payload)
    }

    struct Client {
        control: Arc<RecordingControl>,
        stream: tokio::io::DuplexStream,
        tx: mpsc::Sender<ChannelRequest>,
    }

    /// Queue `requests` on a fresh channel and run the orchestrator on it.
    async fn serve(
        gateway: &Gateway,
        user: &str,
        requests: Vec<ChannelRequest>,
    ) -> (ChannelOutcome, Client) {
        let user = gateway.user(user).unwrap();
        let (stream, peer) = tokio::io::duplex(4096);
        let control = Arc::new(RecordingControl::default());
        let (tx, rx) = mpsc::channel(64);
        for req in requests {
            tx.send(req).await.unwrap();
        }
        let outcome = gateway
            .serve_channel(&user, SessionChannel::new(stream, control.clone()), rx)
            .await;
        (
            outcome,
            Client {
                control,
                stream: peer,
                tx,
            },
        )
    }

    #[tokio::test]
    async fn test_routes_and_listing() {
        let gw = gateway(8).await;
        assert_eq!(gw.router.keys(), ["/admin", "/apis", "/echo"]);
        assert!(gw.router.lookup("/apis").unwrap().allows("anyone"));
        assert!(gw.router.lookup("/nothing").is_none());
    }

    #[tokio::test]
    async fn test_password_auth() {
        let gw = gateway(8).await;
        assert_eq!(gw.authenticate_password("alice", "p").unwrap().name, "alice");
        assert!(gw.authenticate_password("alice", "P").is_none());
        assert!(gw.authenticate_password("alice", "").is_none());
        assert!(gw.authenticate_password("bob", "p").is_none());
        assert!(gw.authenticate_password("carol", "p").is_none());
    }

    #[tokio::test]
    async fn test_public_key_auth() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("bob.pub");
        let (alice_key, bob_key, other) = (random_key(), random_key(), random_key());
        std::fs::write(&key_file, openssh_line(&bob_key)).unwrap();

        let config = GatewayConfig {
            users: vec![
                UserConfig {
                    name: "alice".to_string(),
                    public_key: Some(openssh_line(&alice_key)),
                    ..Default::default()
                },
                UserConfig {
                    name: "bob".to_string(),
                    public_key_path: Some(key_file.clone()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let gw = Gateway::new(&config).await.unwrap();

        assert!(gw.authenticate_public_key("alice", alice_key.public_key()).await.is_some());
        assert!(gw.authenticate_public_key("alice", bob_key.public_key()).await.is_none());
        assert!(gw.authenticate_public_key("bob", bob_key.public_key()).await.is_some());
        assert!(gw.authenticate_public_key("carol", bob_key.public_key()).await.is_none());
        assert!(gw.authenticate_password("alice", "").is_none());

        // The key file is re-read on every attempt.
        std::fs::write(&key_file, openssh_line(&other)).unwrap();
        assert!(gw.authenticate_public_key("bob", bob_key.public_key()).await.is_none());
        assert!(gw.authenticate_public_key("bob", other.public_key()).await.is_some());

        std::fs::remove_file(&key_file).unwrap();
        assert!(gw.authenticate_public_key("bob", other.public_key()).await.is_none());
    }

    #[tokio::test]
    async fn test_bad_keys_are_fatal() {
        let config = GatewayConfig {
            users: vec![UserConfig {
                name: "alice".to_string(),
                public_key: Some("ssh-ed25519 garbage".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(Gateway::new(&config).await.is_err());

        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig {
            users: vec![UserConfig {
                name: "bob".to_string(),
                public_key_path: Some(dir.path().join("missing.pub")),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(Gateway::new(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_forbidden_route_sends_403() {
        let gw = gateway(8).await;
        let (outcome, client) = serve(&gw, "bob", vec![pty_req(), exec("/admin")]).await;
        assert_eq!(outcome, ChannelOutcome::Forbidden("/admin".to_string()));
        assert_eq!(
            client.control.events(),
            [Event::ExitStatus(403), Event::Close]
        );
    }

    #[tokio::test]
    async fn test_unknown_route_disconnects() {
        let gw = gateway(8).await;
        let (outcome, client) = serve(&gw, "alice", vec![exec("/unknown?x=1")]).await;
        assert_eq!(outcome, ChannelOutcome::RouteNotFound("/unknown".to_string()));
        assert_eq!(client.control.events(), [Event::Close, Event::Disconnect]);
    }

    #[tokio::test]
    async fn test_non_utf8_exec_is_routed() {
        let gw = gateway(8).await;
        let raw = ChannelRequest::new(msg::EXEC, true, msg::encode_exec_raw(b"/\xff?x=1"));
        let (outcome, client) = serve(&gw, "alice", vec![raw]).await;
        assert_eq!(outcome, ChannelOutcome::RouteNotFound("/\u{fffd}".to_string()));
        assert_eq!(client.control.events(), [Event::Close, Event::Disconnect]);
    }

    #[tokio::test]
    async fn test_malformed_exec() {
        let gw = gateway(8).await;
        let bad = ChannelRequest::new(msg::EXEC, true, Bytes::from_static(b"\x00\x00"));
        let (outcome, client) = serve(&gw, "alice", vec![bad]).await;
        assert_eq!(outcome, ChannelOutcome::MalformedExec);
        assert_eq!(client.control.events(), [Event::Reply(false), Event::Close]);
    }

    #[tokio::test]
    async fn test_closed_before_exec() {
        let gw = gateway(8).await;
        let user = gw.user("alice").unwrap();
        let (stream, _peer) = tokio::io::duplex(64);
        let control = Arc::new(RecordingControl::default());
        let (tx, rx) = mpsc::channel(4);
        tx.send(env("LANG")).await.unwrap();
        drop(tx);

        let outcome = gw
            .serve_channel(&user, SessionChannel::new(stream, control.clone()), rx)
            .await;
        assert_eq!(outcome, ChannelOutcome::Closed);
        assert!(control.events().is_empty());
    }

    #[tokio::test]
    async fn test_apis_lists_sorted_routes() {
        let gw = gateway(8).await;
        let (outcome, mut client) = serve(&gw, "bob", vec![exec("/apis?x=1 trailing args")]).await;
        assert_eq!(outcome, ChannelOutcome::Dispatched("/apis".to_string()));

        let mut out = String::new();
        client.stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "\nexecgate routes:\r\n- /admin\r\n- /apis\r\n- /echo\r\n\n");
        client.control.wait_closed().await;
        assert_eq!(client.control.events(), [Event::Reply(true), Event::Close]);
    }

    #[tokio::test]
    async fn test_queue_overflow_refuses_request() {
        let gw = gateway(2).await;
        let (outcome, client) = serve(
            &gw,
            "alice",
            vec![env("A"), env("B"), env("C"), exec("/apis")],
        )
        .await;
        assert_eq!(outcome, ChannelOutcome::Dispatched("/apis".to_string()));
        client.control.wait_closed().await;
        assert_eq!(
            client.control.events(),
            [Event::Reply(false), Event::Reply(true), Event::Close]
        );
    }

    struct ProbeHandler {
        params: Params,
        done: Option<oneshot::Sender<(Params, Vec<String>)>>,
    }

    #[async_trait]
    impl Handler for ProbeHandler {
        fn inject_parameters(&mut self, params: Params) {
            self.params = params;
        }

        async fn handle(&mut self, _channel: SessionChannel, mut requests: RequestStream) {
            let mut kinds = Vec::new();
            while let Some(req) = requests.next().await {
                kinds.push(req.kind);
            }
            if let Some(done) = self.done.take() {
                let _ = done.send((self.params.clone(), kinds));
            }
        }
    }

    #[tokio::test]
    async fn test_buffered_requests_reach_handler_in_order() {
        let mut gw = gateway(8).await;
        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = Arc::new(std::sync::Mutex::new(Some(done_tx)));
        gw.router.register(
            Route::new("/probe", Access::AllUsers),
            Arc::new(move || -> Box<dyn Handler> {
                Box::new(ProbeHandler {
                    params: Params::new(),
                    done: done_tx.lock().unwrap().take(),
                })
            }),
        );

        let resize = WindowChange {
            cols: 120,
            rows: 40,
            width: 0,
            height: 0,
        };
        let requests = vec![
            env("LANG"),
            pty_req(),
            ChannelRequest::new(msg::WINDOW_CHANGE, false, resize.encode()),
            exec("/probe?EXECGATE_USERNAME=mallory&tag=a&tag=b"),
        ];
        let (outcome, client) = serve(&gw, "alice", requests).await;
        assert_eq!(outcome, ChannelOutcome::Dispatched("/probe".to_string()));

        client
            .tx
            .send(ChannelRequest::new(msg::SIGNAL, false, Bytes::new()))
            .await
            .unwrap();
        drop(client.tx);

        let (params, kinds) = done_rx.await.unwrap();
        assert_eq!(kinds, ["env", "pty-req", "window-change", "signal"]);
        assert_eq!(params[USERNAME_PARAM], "alice");
        assert_eq!(params["tag"], "a,b");
    }

    #[tokio::test]
    async fn test_echo_route_end_to_end() {
        let gw = gateway(8).await;
        let (outcome, mut client) = serve(&gw, "alice", vec![pty_req(), exec("/echo")]).await;
        assert_eq!(outcome, ChannelOutcome::Dispatched("/echo".to_string()));

        let mut out = Vec::new();
        let _ = client.stream.read_to_end(&mut out).await;
        assert!(String::from_utf8_lossy(&out).contains("hello"));

        client.control.wait_closed().await;
        let events = client.control.events();
        assert!(events.contains(&Event::ExitStatus(0)));
        assert_eq!(events.last(), Some(&Event::Close));
    }
}
