//! Connection management and frame dispatch.
//!
//! A [`Connection`] owns one driver task running the connect loop: open the
//! WebSocket, register with the gateway, then shuttle frames until the
//! transport drops, back off five seconds, and start over. Callers never
//! touch the socket; they hand the driver a framed command together with a
//! sink for its acknowledgement, which keeps the acknowledgement queue
//! aligned with the order commands hit the wire.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::rad50;
use crate::request::{NodeSpec, Reply, ReplyStream, TaskAddress};
use crate::status::Status;
use crate::transport::{Transport, TransportError};
use crate::wire;

/// Delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Outgoing-command channel depth per session.
const LINK_CAPACITY: usize = 64;

/// The gateway-side timeout used when a caller has no better idea.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// The name and address of the local node.
const LOCAL_NODE: &str = "LOCAL";

/// Observable lifecycle state of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// What to do with the next command acknowledgement.
pub(crate) enum PendingCommand {
    /// Hand the inner ack frame to the caller.
    Ack(oneshot::Sender<Bytes>),
    /// Parse an accept-ack, install the reply sink under the granted
    /// request id, and report the outcome.
    Request {
        sink: ReplySink,
        done: oneshot::Sender<Result<u16, Status>>,
    },
    /// Discard the acknowledgement (cancel-request).
    Forget,
}

/// Where the replies of an accepted request go.
pub(crate) enum ReplySink {
    /// Resolves on the first reply and self-removes.
    OneShot(oneshot::Sender<Reply>),
    /// Forwards every reply; closed when the terminal reply arrives.
    Stream(mpsc::UnboundedSender<Reply>),
}

impl ReplySink {
    fn deliver(self, reply: Reply) {
        match self {
            ReplySink::OneShot(tx) => {
                let _ = tx.send(reply);
            }
            ReplySink::Stream(tx) => {
                let _ = tx.send(reply);
            }
        }
    }
}

#[derive(Default)]
struct DispatchState {
    cmd_queue: VecDeque<PendingCommand>,
    req_table: HashMap<u16, ReplySink>,
}

/// A command frame on its way to the driver, paired with the disposition
/// of its acknowledgement.
pub(crate) struct Outgoing {
    frame: Vec<u8>,
    pending: PendingCommand,
}

/// Handle and outgoing link of the current session. Absent while
/// disconnected; replaced wholesale on every reconnect.
#[derive(Clone)]
struct SessionContext {
    handle: u32,
    link: mpsc::Sender<Outgoing>,
}

/// Dispatcher state shared by the driver, the public API, and stream
/// cancellation guards. The lock is never held across an await.
pub(crate) struct Shared {
    state: Mutex<DispatchState>,
}

impl Shared {
    fn new() -> Shared {
        Shared {
            state: Mutex::new(DispatchState::default()),
        }
    }

    /// Route one frame from the gateway.
    fn dispatch(&self, pkt: Bytes) {
        if pkt.len() < 2 || pkt[0] != 0 {
            warn!(len = pkt.len(), "discarding garbled frame");
            return;
        }

        if pkt[1] == wire::FRAME_ACK {
            let pending = self.state.lock().cmd_queue.pop_front();
            match pending {
                Some(pending) => self.resolve_command(pending, pkt.slice(2..)),
                None => warn!("command ack with no pending command"),
            }
            return;
        }

        match wire::parse_reply(&pkt) {
            Some((header, payload)) => self.deliver_reply(header, payload),
            None => warn!(len = pkt.len(), "discarding short frame"),
        }
    }

    fn resolve_command(&self, pending: PendingCommand, inner: Bytes) {
        match pending {
            PendingCommand::Ack(tx) => {
                let _ = tx.send(inner);
            }
            PendingCommand::Forget => {}
            PendingCommand::Request { sink, done } => match wire::accept_ack_request_id(&inner) {
                Ok(request_id) => {
                    self.state.lock().req_table.insert(request_id, sink);
                    if done.send(Ok(request_id)).is_err() {
                        // The caller gave up before the accept-ack; the
                        // gateway times the request out on its own.
                        self.state.lock().req_table.remove(&request_id);
                        debug!(request_id, "request accepted after its caller left");
                    }
                }
                Err(status) => {
                    let _ = done.send(Err(status));
                }
            },
        }
    }

    fn deliver_reply(&self, header: wire::ReplyHeader, payload: Bytes) {
        if header.flags != wire::REPLY_LAST && header.flags != wire::REPLY_MORE {
            debug!(flags = header.flags, "reply with unexpected flags");
        }
        let reply = Reply {
            sender: header.sender,
            status: header.status,
            payload,
        };

        let mut state = self.state.lock();
        let Some(sink) = state.req_table.remove(&header.request_id) else {
            drop(state);
            debug!(request_id = header.request_id, "reply for unknown request, dropping");
            return;
        };

        // Streams stay in the table between replies; everything else is
        // removed before delivery so the table is already clean when the
        // reply lands.
        if let ReplySink::Stream(tx) = &sink {
            if !header.is_last() {
                state.req_table.insert(header.request_id, ReplySink::Stream(tx.clone()));
            }
        }
        drop(state);

        sink.deliver(reply);
    }

    /// Drop a request entry; true if it was still live.
    pub(crate) fn remove_request(&self, request_id: u16) -> bool {
        self.state.lock().req_table.remove(&request_id).is_some()
    }

    /// Transport is gone: every pending command gets the NACK sentinel and
    /// every accepted request one terminal disconnect reply.
    fn fail_pending(&self) {
        let (commands, requests) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.cmd_queue),
                std::mem::take(&mut state.req_table),
            )
        };

        for pending in commands {
            match pending {
                PendingCommand::Ack(tx) => {
                    let _ = tx.send(Bytes::from_static(&wire::NACK_DISCONNECT));
                }
                PendingCommand::Forget => {}
                PendingCommand::Request { done, .. } => {
                    let _ = done.send(Err(wire::NACK_DISCONNECT_STATUS));
                }
            }
        }

        for (_, sink) in requests {
            sink.deliver(Reply::synthetic(Status::DISCONNECTED));
        }
    }
}

/// Removes the request entry and tells the gateway when a [`ReplyStream`]
/// is dropped before its terminal reply.
pub(crate) struct CancelGuard {
    shared: Arc<Shared>,
    request_id: u16,
    frame: Vec<u8>,
    link: mpsc::Sender<Outgoing>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.shared.remove_request(self.request_id) {
            // Already gone: terminal reply or disconnect cleaned it up.
            return;
        }
        let out = Outgoing {
            frame: std::mem::take(&mut self.frame),
            pending: PendingCommand::Forget,
        };
        if self.link.try_send(out).is_err() {
            debug!(request_id = self.request_id, "connection gone, cancel not sent");
        }
    }
}

enum SessionError {
    Transport(TransportError),
    Handshake(Status),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transport(e) => write!(f, "{}", e),
            SessionError::Handshake(status) => write!(f, "connect rejected: {}", status),
        }
    }
}

/// A registered client of the gateway.
///
/// Construction spawns the driver task (a tokio runtime must be current)
/// and immediately starts connecting; dropping the `Connection` stops the
/// driver and abandons the session.
pub struct Connection {
    shared: Arc<Shared>,
    context_rx: watch::Receiver<Option<SessionContext>>,
    state_rx: watch::Receiver<ConnectionState>,
    driver: JoinHandle<()>,
}

impl Connection {
    /// Connect to the gateway at `url` (historically
    /// `wss://<host>:443/acnet-ws-test`).
    pub fn new(url: impl Into<String>) -> Connection {
        let shared = Arc::new(Shared::new());
        let (context_tx, context_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let driver = tokio::spawn(drive(shared.clone(), url.into(), context_tx, state_tx));

        Connection {
            shared,
            context_rx,
            state_rx,
            driver,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to lifecycle transitions. The receiver always reports the
    /// current state as its first value.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The handle the gateway assigned to this client, as its decoded
    /// RAD50 string. Waits for the connection if necessary.
    pub async fn handle(&self) -> Result<String, Status> {
        Ok(rad50::decode(self.context().await?.handle))
    }

    /// Trunk/node address of a node name. `LOCAL` maps to 0 without
    /// consulting the gateway.
    pub async fn get_node_address(&self, name: &str) -> Result<u16, Status> {
        if name.eq_ignore_ascii_case(LOCAL_NODE) {
            return Ok(0);
        }
        let name = rad50::encode(name);
        let inner = self.command(|handle| wire::node_address(handle, name)).await?;
        wire::ack_node_address(&inner)
    }

    /// Node name of a trunk/node address. 0 maps to `LOCAL` without
    /// consulting the gateway.
    pub async fn get_node_name(&self, address: u16) -> Result<String, Status> {
        if address == 0 {
            return Ok(LOCAL_NODE.into());
        }
        let inner = self.command(|handle| wire::node_name(handle, address)).await?;
        Ok(rad50::decode(wire::ack_node_name(&inner)?))
    }

    /// Name of the node the gateway itself runs on.
    pub async fn get_local_node(&self) -> Result<String, Status> {
        let inner = self.command(wire::local_node).await?;
        self.get_node_name(wire::ack_node_address(&inner)?).await
    }

    /// Send a single-reply request to `task` (a `TASK@NODE` pair) and wait
    /// for the answer.
    ///
    /// Never fails: anything that keeps the request from reaching the
    /// gateway comes back as a reply with sender 0, an empty payload, and
    /// the failure status. `timeout` travels to the gateway, which owns
    /// cleanup and answers with [`Status::UTIME`] on expiry; no local
    /// timer is layered on top.
    pub async fn request_reply(&self, task: &str, payload: &[u8], timeout: Duration) -> Reply {
        let (tx, rx) = oneshot::channel();
        match self
            .start_request(task, payload, timeout, false, ReplySink::OneShot(tx))
            .await
        {
            Ok(_) => rx
                .await
                .unwrap_or_else(|_| Reply::synthetic(Status::DISCONNECTED)),
            Err(status) => Reply::synthetic(status),
        }
    }

    /// Send a streaming request to `task` and return its replies as a
    /// [`ReplyStream`].
    ///
    /// The stream ends after the terminal reply. Dropping it earlier
    /// removes the request locally and sends a cancel-request to the
    /// gateway. Failures before dispatch surface as a one-reply stream,
    /// mirroring [`Connection::request_reply`].
    pub async fn request_stream(&self, task: &str, payload: &[u8], timeout: Duration) -> ReplyStream {
        let (tx, rx) = mpsc::unbounded_channel();
        match self
            .start_request(task, payload, timeout, true, ReplySink::Stream(tx))
            .await
        {
            Ok((request_id, context)) => ReplyStream::live(
                rx,
                CancelGuard {
                    shared: self.shared.clone(),
                    request_id,
                    frame: wire::cancel_request(context.handle, request_id),
                    link: context.link,
                },
            ),
            Err(status) => ReplyStream::failed(status),
        }
    }

    async fn context(&self) -> Result<SessionContext, Status> {
        let mut rx = self.context_rx.clone();
        loop {
            if let Some(context) = rx.borrow_and_update().clone() {
                return Ok(context);
            }
            rx.changed().await.map_err(|_| Status::DISCONNECTED)?;
        }
    }

    /// Issue one command and wait for its inner ack frame. A connection
    /// lost underneath the command yields the NACK sentinel, exactly as if
    /// the dispatcher had fanned it out.
    async fn command(&self, build: impl FnOnce(u32) -> Vec<u8>) -> Result<Bytes, Status> {
        let context = self.context().await?;
        let (tx, rx) = oneshot::channel();
        let out = Outgoing {
            frame: build(context.handle),
            pending: PendingCommand::Ack(tx),
        };
        if context.link.send(out).await.is_err() {
            return Ok(Bytes::from_static(&wire::NACK_DISCONNECT));
        }
        Ok(rx
            .await
            .unwrap_or_else(|_| Bytes::from_static(&wire::NACK_DISCONNECT)))
    }

    async fn start_request(
        &self,
        task: &str,
        payload: &[u8],
        timeout: Duration,
        multi: bool,
        sink: ReplySink,
    ) -> Result<(u16, SessionContext), Status> {
        let address = TaskAddress::parse(task)?;
        let node = match address.node {
            NodeSpec::Address(node) => node,
            NodeSpec::Name(name) => self.get_node_address(name).await?,
        };

        let context = self.context().await?;
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let frame = wire::send_request(
            context.handle,
            rad50::encode(address.task),
            node,
            multi,
            timeout_ms,
            payload,
        );

        let (done_tx, done_rx) = oneshot::channel();
        let out = Outgoing {
            frame,
            pending: PendingCommand::Request { sink, done: done_tx },
        };
        if context.link.send(out).await.is_err() {
            return Err(wire::NACK_DISCONNECT_STATUS);
        }

        let request_id = done_rx
            .await
            .map_err(|_| wire::NACK_DISCONNECT_STATUS)??;
        Ok((request_id, context))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// The connect loop: runs one session after another, five seconds apart.
async fn drive(
    shared: Arc<Shared>,
    url: String,
    context_tx: watch::Sender<Option<SessionContext>>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut delay = Duration::ZERO;
    loop {
        tokio::time::sleep(delay).await;
        delay = RECONNECT_DELAY;

        match run_session(&shared, &url, &context_tx, &state_tx).await {
            Ok(()) => info!(url = %url, "gateway closed the session"),
            Err(e) => warn!(url = %url, error = %e, "session ended"),
        }

        context_tx.send_replace(None);
        state_tx.send_replace(ConnectionState::Disconnected);
        shared.fail_pending();
    }
}

async fn run_session(
    shared: &Arc<Shared>,
    url: &str,
    context_tx: &watch::Sender<Option<SessionContext>>,
    state_tx: &watch::Sender<ConnectionState>,
) -> Result<(), SessionError> {
    let transport = Transport::connect(url).await.map_err(SessionError::Transport)?;
    let (mut sink, mut source) = transport.split();

    // Register with the gateway. The connect-ack flows through the command
    // queue like any other acknowledgement.
    let (ack_tx, mut ack_rx) = oneshot::channel();
    shared.state.lock().cmd_queue.push_back(PendingCommand::Ack(ack_tx));
    sink.send(wire::connect()).await.map_err(SessionError::Transport)?;

    let inner = loop {
        tokio::select! {
            ack = &mut ack_rx => match ack {
                Ok(inner) => break inner,
                Err(_) => return Err(SessionError::Handshake(Status::BUG)),
            },
            frame = source.next_frame() => match frame.map_err(SessionError::Transport)? {
                Some(pkt) => shared.dispatch(pkt),
                None => return Ok(()),
            },
        }
    };
    let handle = wire::connect_ack_handle(&inner).map_err(SessionError::Handshake)?;

    let (link_tx, mut link_rx) = mpsc::channel(LINK_CAPACITY);
    context_tx.send_replace(Some(SessionContext { handle, link: link_tx }));
    state_tx.send_replace(ConnectionState::Connected);
    info!(handle = %rad50::decode(handle), "connected to gateway");

    loop {
        tokio::select! {
            out = link_rx.recv() => {
                let Some(Outgoing { frame, pending }) = out else { return Ok(()) };
                shared.state.lock().cmd_queue.push_back(pending);
                sink.send(frame).await.map_err(SessionError::Transport)?;
            }
            frame = source.next_frame() => match frame.map_err(SessionError::Transport)? {
                Some(pkt) => shared.dispatch(pkt),
                None => return Ok(()),
            },
        }
    }
}
