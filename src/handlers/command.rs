//! Runs a configured command on a pseudo-terminal bridged to the channel.
//!
//! The handler waits for the client's `pty-req`, starts the process on a new
//! pty of the requested size, bridges the pty with the channel and reports
//! the exit status once the process is gone. `window-change` requests resize
//! the live pty.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{ByteStream, ChannelControl, Handler, Params, RequestStream, SessionChannel};
use crate::bridge::bridge;
use crate::msg::{self, Env, ExitSignal, ExitStatus, PtyRequest, Signal, WindowChange, WireMessage};

/// How long to keep copying pty output after the process exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Executable and static arguments of a command route.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub cmd: String,
    pub args: Vec<String>,
    /// Parsed from configuration but not enforced yet.
    pub timeout: Option<Duration>,
}

pub struct CommandHandler {
    spec: Arc<CommandSpec>,
    params: Params,
}

impl CommandHandler {
    pub fn new(spec: Arc<CommandSpec>) -> Self {
        Self {
            spec,
            params: Params::new(),
        }
    }

    /// Run the command until it exits or the channel goes away. Returns
    /// `None` when the process had to be killed after the channel closed.
    async fn run(
        &self,
        stream: Pin<Box<dyn ByteStream>>,
        pty_req: &PtyRequest,
        resizer: &OnceLock<PtyResizer>,
    ) -> Result<Option<std::process::ExitStatus>> {
        let pty = pty_process::Pty::new().context("Failed to allocate pty")?;
        let pts = pty.pts().context("Failed to open pty slave")?;

        let child = pty_process::Command::new(&self.spec.cmd)
            .args(&self.spec.args)
            .env_clear()
            .envs(build_env(&self.params, &pty_req.term))
            .spawn(&pts)
            .with_context(|| format!("Failed to start {}", self.spec.cmd))?;
        let mut child = ChildGuard(child);
        // The child holds the only slave handle now, so the master sees EOF when it exits.
        drop(pts);

        pty.resize(pty_size(pty_req.cols, pty_req.rows, pty_req.width, pty_req.height))
            .context("Failed to set pty size")?;
        info!(
            "Started {} (pid {:?}) on a {}x{} pty",
            self.spec.cmd,
            child.0.id(),
            pty_req.cols,
            pty_req.rows
        );

        let (pty, handle) = ResizablePty::new(pty);
        let _ = resizer.set(handle);
        let mut io_task = tokio::spawn(bridge(pty, stream));

        let exited = tokio::select! {
            status = child.0.wait() => Some(status),
            _ = &mut io_task => None,
        };

        let status = match exited {
            Some(status) => {
                let status = status.context("Failed to wait for process")?;
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut io_task)
                    .await
                    .is_err()
                {
                    debug!("Pty output still open after exit, closing bridge");
                    io_task.abort();
                }
                status
            }
            // A normal exit can also close the pty before the wait resolves.
            None => match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, child.0.wait()).await {
                Ok(status) => status.context("Failed to wait for process")?,
                Err(_) => {
                    warn!("Channel closed but {} is still running, killing it", self.spec.cmd);
                    child.kill().await;
                    return Ok(None);
                }
            },
        };
        debug!("{} exited with {}", self.spec.cmd, status);
        Ok(Some(status))
    }
}

/// Kills the process when dropped unless it has already been reaped.
struct ChildGuard(tokio::process::Child);

impl ChildGuard {
    async fn kill(&mut self) {
        if let Err(e) = self.0.start_kill() {
            debug!("Failed to signal process: {}", e);
        }
        if let Err(e) = self.0.wait().await {
            debug!("Failed to reap process: {}", e);
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Ok(None) = self.0.try_wait() {
            let _ = self.0.start_kill();
        }
    }
}

#[async_trait]
impl Handler for CommandHandler {
    fn inject_parameters(&mut self, params: Params) {
        self.params = params;
    }

    async fn handle(&mut self, channel: SessionChannel, requests: RequestStream) {
        let SessionChannel { stream, control } = channel;
        if let Some(timeout) = self.spec.timeout {
            debug!("Timeout of {:?} for {} is not enforced", timeout, self.spec.cmd);
        }

        let (pty_tx, pty_rx) = oneshot::channel();
        let resizer = Arc::new(OnceLock::new());
        let _requests = AbortOnDrop::new(tokio::spawn(drain_requests(
            requests,
            control.clone(),
            pty_tx,
            resizer.clone(),
        )));

        let Ok(pty_req) = pty_rx.await else {
            debug!("Channel closed before a pty was requested");
            control.close().await;
            return;
        };

        match self.run(stream, &pty_req, &resizer).await {
            Ok(Some(status)) => report_exit(control.as_ref(), status).await,
            Ok(None) => {}
            Err(e) => warn!("Command {} failed: {:#}", self.spec.cmd, e),
        }
        control.close().await;
    }
}

/// Serve control requests for the lifetime of the handler. The first valid
/// `pty-req` is forwarded through `pty_tx`; later ones are refused.
async fn drain_requests(
    mut requests: RequestStream,
    control: Arc<dyn ChannelControl>,
    pty_tx: oneshot::Sender<PtyRequest>,
    resizer: Arc<OnceLock<PtyResizer>>,
) {
    let mut pty_tx = Some(pty_tx);
    while let Some(req) = requests.next().await {
        let ok = match req.kind.as_str() {
            msg::PTY_REQ => on_pty_request(&req.payload, &mut pty_tx),
            msg::WINDOW_CHANGE => on_window_change(&req.payload, resizer.get()),
            msg::ENV => {
                match Env::decode(&req.payload) {
                    Ok(env) => debug!("[env] ignoring {}", env.name),
                    Err(e) => debug!("[env] failed to parse payload: {}", e),
                }
                false
            }
            msg::SIGNAL => {
                match Signal::decode(&req.payload) {
                    Ok(sig) => debug!("[signal] ignoring {}", sig.signal),
                    Err(e) => debug!("[signal] failed to parse payload: {}", e),
                }
                false
            }
            other => {
                debug!("[{}] request not supported by command handler", other);
                false
            }
        };
        req.reply(control.as_ref(), ok).await;
    }
}

fn on_pty_request(payload: &[u8], pty_tx: &mut Option<oneshot::Sender<PtyRequest>>) -> bool {
    if pty_tx.is_none() {
        info!("[pty-req] pty has already been requested");
        return false;
    }
    match PtyRequest::decode(payload) {
        Ok(req) => {
            info!(
                "[pty-req] term:'{}' cols:{} rows:{}",
                req.term, req.cols, req.rows
            );
            pty_tx.take().is_some_and(|tx| tx.send(req).is_ok())
        }
        Err(e) => {
            warn!("[pty-req] failed to parse payload: {}", e);
            false
        }
    }
}

fn on_window_change(payload: &[u8], resizer: Option<&PtyResizer>) -> bool {
    let msg = match WindowChange::decode(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("[window-change] failed to parse payload: {}", e);
            return false;
        }
    };
    let Some(resizer) = resizer else {
        debug!("[window-change] no pty yet");
        return false;
    };
    debug!("[window-change] cols:{} rows:{}", msg.cols, msg.rows);
    resizer.resize(&msg)
}

/// Environment of the started process: route parameters, then `PATH`,
/// `HOME` and `TERM`. Later entries win on duplicate names.
fn build_env(params: &Params, term: &str) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.push(("PATH".to_string(), std::env::var("PATH").unwrap_or_default()));
    if let Some(home) = dirs::home_dir() {
        env.push(("HOME".to_string(), home.display().to_string()));
    }
    env.push(("TERM".to_string(), term.to_string()));
    env
}

async fn report_exit(control: &dyn ChannelControl, status: std::process::ExitStatus) {
    if let Some(code) = status.code() {
        control.exit_status(ExitStatus { status: code as u32 }).await;
    } else if let Some(signal) = status.signal() {
        control
            .exit_signal(ExitSignal {
                signal: signal_name(signal),
                core_dumped: status.core_dumped(),
                error_message: String::new(),
                language_tag: String::new(),
            })
            .await;
    }
}

/// RFC 4254 signal name for the signal numbers shared by Linux and macOS.
fn signal_name(signal: i32) -> String {
    let name = match signal {
        1 => "HUP",
        2 => "INT",
        3 => "QUIT",
        4 => "ILL",
        6 => "ABRT",
        8 => "FPE",
        9 => "KILL",
        11 => "SEGV",
        13 => "PIPE",
        14 => "ALRM",
        15 => "TERM",
        other => return other.to_string(),
    };
    name.to_string()
}

fn pty_size(cols: u32, rows: u32, width: u32, height: u32) -> pty_process::Size {
    let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
    pty_process::Size::new_with_pixel(clamp(rows), clamp(cols), clamp(width), clamp(height))
}

/// Sends new sizes to a [`ResizablePty`] owned by the bridge.
pub struct PtyResizer {
    tx: mpsc::UnboundedSender<pty_process::Size>,
}

impl PtyResizer {
    fn resize(&self, msg: &WindowChange) -> bool {
        self.tx
            .send(pty_size(msg.cols, msg.rows, msg.width, msg.height))
            .is_ok()
    }
}

/// Pty master that applies queued resizes whenever it is polled for reading.
struct ResizablePty {
    pty: Pin<Box<pty_process::Pty>>,
    resizes: mpsc::UnboundedReceiver<pty_process::Size>,
}

impl ResizablePty {
    fn new(pty: pty_process::Pty) -> (Self, PtyResizer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pty: Box::pin(pty),
                resizes: rx,
            },
            PtyResizer { tx },
        )
    }

    fn apply_resizes(&mut self, cx: &mut Context<'_>) {
        while let Poll::Ready(Some(size)) = self.resizes.poll_recv(cx) {
            if let Err(e) = self.pty.resize(size) {
                warn!("[window-change] failed to set pty size: {}", e);
            }
        }
    }
}

impl AsyncRead for ResizablePty {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.apply_resizes(cx);
        self.pty.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for ResizablePty {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.pty.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.pty.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.pty.as_mut().poll_shutdown(cx)
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl AbortOnDrop {
    fn new<T>(task: tokio::task::JoinHandle<T>) -> Self {
        Self(task.abort_handle())
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
