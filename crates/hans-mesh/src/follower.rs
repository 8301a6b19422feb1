//! Follower endpoint
//!
//! A follower connects to its leader in the background, retrying until the
//! configured connect timeout, and registers under its name. Once registered
//! it is either a plain follower or the relay, which forwards its own view of
//! the session to the leader on every pass that changed it.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use hans_core::{AgentLink, Round, RoundError, RoundResult, StateSnapshot};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{MeshError, MeshResult, TransportErrorHook, report_transport_error};
use crate::frame::{Frame, ensure_fits, read_frame, write_frames};
use crate::message::{Envelope, SessionEvent};
use crate::name::FollowerName;
use crate::transport::{BoxedRead, connect};

/// Follower endpoint settings
#[derive(Clone)]
pub struct FollowerConfig {
    pub name: FollowerName,
    pub endpoint: Endpoint,
    /// How long to keep trying to reach and register with the leader
    pub connect_timeout: Duration,
    /// Pause between connection attempts
    pub retry_interval: Duration,
    pub on_transport_error: Option<TransportErrorHook>,
}

impl FollowerConfig {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(name: FollowerName) -> Self {
        Self {
            name,
            endpoint: Endpoint::default(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            retry_interval: Self::DEFAULT_RETRY_INTERVAL,
            on_transport_error: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Install a handler for a lost or unreachable leader
    pub fn on_transport_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MeshError) + Send + Sync + 'static,
    {
        self.on_transport_error = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for FollowerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FollowerConfig")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry_interval", &self.retry_interval)
            .field("on_transport_error", &self.on_transport_error.is_some())
            .finish()
    }
}

/// Registration state of a follower
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowerStatus {
    Connecting,
    /// Registered and forwarding session state
    Relay,
    /// Registered, forwards nothing
    Plain,
    /// The leader refused the name
    Rejected(String),
    /// The leader could not be reached or did not answer
    Failed(String),
    /// Registered once, then the connection dropped
    Disconnected,
}

impl FollowerStatus {
    pub fn is_registered(&self) -> bool {
        matches!(self, FollowerStatus::Relay | FollowerStatus::Plain)
    }

    fn describe(&self) -> String {
        match self {
            FollowerStatus::Connecting => "registration has not completed".to_string(),
            FollowerStatus::Relay | FollowerStatus::Plain => "registered".to_string(),
            FollowerStatus::Rejected(reason) => format!("rejected by leader: {reason}"),
            FollowerStatus::Failed(reason) => reason.clone(),
            FollowerStatus::Disconnected => "leader connection was lost".to_string(),
        }
    }
}

/// What a follower agent's `on_message` receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowerInbound {
    Message(String),
    Session(SessionEvent),
}

struct StatusCell {
    status: Mutex<FollowerStatus>,
    changed: Condvar,
}

impl StatusCell {
    fn get(&self) -> FollowerStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, status: FollowerStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        self.changed.notify_all();
    }

    /// Block while still connecting, at most `timeout`
    fn wait_settled(&self, timeout: Duration) -> FollowerStatus {
        let guard = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |status| *status == FollowerStatus::Connecting)
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }
}

struct Shared {
    name: FollowerName,
    endpoint: Endpoint,
    status: StatusCell,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound: mpsc::UnboundedSender<FollowerInbound>,
    on_transport_error: Option<TransportErrorHook>,
}

impl Shared {
    fn send_frame(&self, frame: Frame) -> MeshResult<()> {
        ensure_fits(&frame)?;
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| MeshError::NoLeader),
            None => Err(MeshError::NoLeader),
        }
    }

    fn is_relay(&self) -> bool {
        self.status.get() == FollowerStatus::Relay
    }

    fn fail(&self, status: FollowerStatus, err: MeshError) {
        self.status.set(status);
        report_transport_error(self.on_transport_error.as_ref(), &err);
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Message(envelope) => {
                let _ = self.inbound.send(FollowerInbound::Message(envelope.payload));
            }
            Frame::Session { event } => {
                let _ = self.inbound.send(FollowerInbound::Session(event));
            }
            Frame::Promoted => {
                info!(follower = %self.name, "Promoted to relay");
                self.status.set(FollowerStatus::Relay);
            }
            other => {
                warn!(follower = %self.name, kind = other.kind(), "Unexpected frame from leader");
            }
        }
    }
}

/// Follower side of the coordination bus
///
/// Connecting never blocks; use [`FollowerEndpoint::wait_registered`] to wait
/// for the outcome. Dropping the endpoint closes the connection.
pub struct FollowerEndpoint {
    runtime: Option<Runtime>,
    shared: Arc<Shared>,
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<FollowerInbound>>>,
    /// Registration has settled, one way or the other, by this instant
    connect_deadline: Instant,
    retry_interval: Duration,
}

impl FollowerEndpoint {
    /// Start connecting and registering in the background
    pub fn connect(config: FollowerConfig) -> MeshResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("hans-follower-io")
            .enable_all()
            .build()?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name: config.name,
            endpoint: config.endpoint,
            status: StatusCell {
                status: Mutex::new(FollowerStatus::Connecting),
                changed: Condvar::new(),
            },
            outbound: Mutex::new(None),
            inbound: inbound_tx,
            on_transport_error: config.on_transport_error,
        });

        let connect_deadline = Instant::now() + config.connect_timeout;
        runtime.spawn(run_session(
            Arc::clone(&shared),
            connect_deadline,
            config.retry_interval,
        ));

        Ok(Self {
            runtime: Some(runtime),
            shared,
            inbound: Arc::new(Mutex::new(inbound_rx)),
            connect_deadline,
            retry_interval: config.retry_interval,
        })
    }

    pub fn name(&self) -> &FollowerName {
        &self.shared.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn status(&self) -> FollowerStatus {
        self.shared.status.get()
    }

    pub fn is_registered(&self) -> bool {
        self.status().is_registered()
    }

    pub fn is_relay(&self) -> bool {
        self.shared.is_relay()
    }

    /// Block until registration settles; returns whether this follower is
    /// the relay
    pub fn wait_registered(&self, timeout: Duration) -> MeshResult<bool> {
        match self.shared.status.wait_settled(timeout) {
            FollowerStatus::Relay => Ok(true),
            FollowerStatus::Plain => Ok(false),
            FollowerStatus::Connecting => Err(MeshError::Timeout(timeout)),
            FollowerStatus::Rejected(reason) => Err(MeshError::RegistrationRejected {
                name: self.shared.name.clone(),
                reason,
            }),
            FollowerStatus::Failed(reason) => Err(MeshError::ConnectionFailed(reason)),
            FollowerStatus::Disconnected => Err(MeshError::NoLeader),
        }
    }

    /// Wait out the connect timeout counted from [`FollowerEndpoint::connect`]
    ///
    /// The session gives up at that deadline, so past it the result is final:
    /// registered, rejected or [`MeshError::ConnectionFailed`].
    pub fn wait_connected(&self) -> MeshResult<bool> {
        let remaining = self.connect_deadline.saturating_duration_since(Instant::now());
        self.wait_registered(remaining + self.retry_interval)
    }

    /// Send outside of a round
    pub fn send(&self, payload: impl Into<String>) -> MeshResult<()> {
        let envelope = Envelope::from_follower(self.shared.name.clone(), payload);
        self.shared.send_frame(Frame::Message(envelope))
    }

    /// Per-round binding for a follower agent
    pub fn link(&self) -> FollowerLink {
        FollowerLink {
            shared: Arc::clone(&self.shared),
            inbound: Arc::clone(&self.inbound),
            round: None,
            relaying: false,
            forwarded: None,
        }
    }
}

impl fmt::Debug for FollowerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FollowerEndpoint")
            .field("name", &self.shared.name)
            .field("endpoint", &self.shared.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for FollowerEndpoint {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        debug!(follower = %self.shared.name, "Follower closed");
    }
}

/// Follower side of an agent's coordination role
pub struct FollowerLink {
    shared: Arc<Shared>,
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<FollowerInbound>>>,
    round: Option<Round>,
    relaying: bool,
    forwarded: Option<u64>,
}

impl FollowerLink {
    /// Send a message to the leader
    pub fn send(&self, payload: impl Into<String>) -> MeshResult<()> {
        let envelope = Envelope::from_follower(self.shared.name.clone(), payload);
        self.shared.send_frame(Frame::Message(envelope))
    }

    pub fn name(&self) -> &FollowerName {
        &self.shared.name
    }

    pub fn is_relay(&self) -> bool {
        self.relaying
    }

    /// Pick up a promotion; a freshly promoted relay announces the running
    /// round so the leader can join it
    fn sync_role(&mut self) {
        let relay = self.shared.is_relay();
        if relay && !self.relaying {
            self.forwarded = None;
            if let Some(round) = &self.round {
                self.forward(Frame::RoundStarted {
                    round: round.clone(),
                });
            }
        }
        self.relaying = relay;
    }

    fn forward(&self, frame: Frame) {
        let kind = frame.kind();
        if let Err(err) = self.shared.send_frame(frame) {
            warn!(follower = %self.shared.name, kind, error = %err, "Relay could not forward");
        }
    }
}

impl AgentLink for FollowerLink {
    type Inbound = FollowerInbound;

    fn on_round_start(&mut self, round: &Round) -> RoundResult<()> {
        match self.shared.status.get() {
            FollowerStatus::Relay | FollowerStatus::Plain => {}
            // Registered once; the round runs and sends report `NoLeader`
            FollowerStatus::Disconnected => {
                warn!(follower = %self.shared.name, round = %round.id, "Starting round without a leader");
            }
            status => {
                return Err(RoundError::RegistrationFailed {
                    name: self.shared.name.to_string(),
                    reason: status.describe(),
                });
            }
        }
        self.round = Some(round.clone());
        self.relaying = false;
        self.sync_role();
        Ok(())
    }

    fn before_pass(&mut self) {
        self.sync_role();
    }

    fn drain_inbound(&mut self) -> Vec<FollowerInbound> {
        let mut rx = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn after_pass(&mut self, snapshot: &StateSnapshot) {
        if self.relaying && self.forwarded != Some(snapshot.sequence()) {
            self.forward(Frame::State {
                snapshot: snapshot.clone(),
            });
            self.forwarded = Some(snapshot.sequence());
        }
    }

    fn on_round_end(&mut self) {
        if self.relaying {
            self.forward(Frame::RoundEnded);
        }
        self.round = None;
        self.forwarded = None;
    }
}

impl fmt::Debug for FollowerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FollowerLink")
            .field("name", &self.shared.name)
            .field("relaying", &self.relaying)
            .finish()
    }
}

async fn run_session(shared: Arc<Shared>, deadline: Instant, retry_interval: Duration) {
    let started = Instant::now();
    let deadline = tokio::time::Instant::from_std(deadline);
    let (read, write) = loop {
        // A stalled attempt must not outlive the deadline
        let err = match tokio::time::timeout_at(deadline, connect(&shared.endpoint)).await {
            Ok(Ok(halves)) => break halves,
            Ok(Err(err)) => err.to_string(),
            Err(_) => "connection attempt stalled".to_string(),
        };
        let now = tokio::time::Instant::now();
        if now >= deadline {
            let waited = started.elapsed();
            let reason = format!(
                "leader at {} unreachable after {}ms: {err}",
                shared.endpoint,
                waited.as_millis()
            );
            shared.fail(FollowerStatus::Failed(reason), MeshError::Timeout(waited));
            return;
        }
        debug!(follower = %shared.name, error = %err, "Leader not reachable yet, retrying");
        tokio::time::sleep(retry_interval.min(deadline - now)).await;
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(write, rx));
    let mut lines = BufReader::new(read).lines();
    let _ = tx.send(Frame::Register {
        name: shared.name.clone(),
    });

    if !await_registration(&shared, &mut lines, tx, deadline).await {
        writer.abort();
        return;
    }

    let lost = loop {
        match read_frame(&mut lines).await {
            Ok(Some(frame)) => shared.handle_frame(frame),
            Ok(None) => break MeshError::Transport("leader closed the connection".to_string()),
            Err(err @ (MeshError::DeserializationFailed(_) | MeshError::MessageTooLarge { .. })) => {
                warn!(follower = %shared.name, error = %err, "Dropping malformed frame");
            }
            Err(err) => break MeshError::Transport(format!("leader connection lost: {err}")),
        }
    };

    shared
        .outbound
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    writer.abort();
    shared.fail(FollowerStatus::Disconnected, lost);
}

/// Wait for the leader's answer to `register`; true once registered
async fn await_registration(
    shared: &Shared,
    lines: &mut Lines<BufReader<BoxedRead>>,
    tx: mpsc::UnboundedSender<Frame>,
    deadline: tokio::time::Instant,
) -> bool {
    let reply = tokio::time::timeout_at(deadline, read_frame(lines)).await;
    let reason = match reply {
        Ok(Ok(Some(Frame::Registered { relay }))) => {
            // Outbound first, so a caller woken by the status can send at once
            *shared.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
            shared.status.set(if relay {
                FollowerStatus::Relay
            } else {
                FollowerStatus::Plain
            });
            info!(follower = %shared.name, endpoint = %shared.endpoint, relay, "Registered with leader");
            return true;
        }
        Ok(Ok(Some(Frame::Rejected { reason }))) => {
            let err = MeshError::RegistrationRejected {
                name: shared.name.clone(),
                reason: reason.clone(),
            };
            shared.fail(FollowerStatus::Rejected(reason), err);
            return false;
        }
        Ok(Ok(Some(other))) => format!("unexpected {} frame during registration", other.kind()),
        Ok(Ok(None)) => "leader closed the connection during registration".to_string(),
        Ok(Err(err)) => err.to_string(),
        Err(_) => "no registration reply before the connect timeout".to_string(),
    };
    shared.fail(
        FollowerStatus::Failed(reason.clone()),
        MeshError::ConnectionFailed(reason),
    );
    false
}
