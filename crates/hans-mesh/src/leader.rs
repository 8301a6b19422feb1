//! Leader endpoint
//!
//! The leader binds the rendezvous endpoint, accepts follower registrations
//! on its own I/O thread, and hands everything it receives to the tick thread
//! through queues. It is not a platform participant: its view of the session
//! is rebuilt from what the relay follower forwards.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use hans_core::{AgentLink, Round, RoundEvent, RoundResult, SnapshotCell, StateSnapshot};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{MeshError, MeshResult, TransportErrorHook, report_transport_error};
use crate::frame::{Frame, read_frame, write_frames};
use crate::message::{Recipients, SessionEvent};
use crate::name::FollowerName;
use crate::registry::{ConnId, FollowerRegistry, LeaderState, RegistrySnapshot, RelayPolicy};
use crate::transport::{BoundListener, BoxedRead, BoxedWrite, Listener};

/// Leader endpoint settings
#[derive(Clone, Default)]
pub struct LeaderConfig {
    pub endpoint: Endpoint,
    pub relay_policy: RelayPolicy,
    pub on_transport_error: Option<TransportErrorHook>,
}

impl LeaderConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    pub fn with_relay_policy(mut self, policy: RelayPolicy) -> Self {
        self.relay_policy = policy;
        self
    }

    /// Install a handler for lost follower connections
    pub fn on_transport_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MeshError) + Send + Sync + 'static,
    {
        self.on_transport_error = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for LeaderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderConfig")
            .field("endpoint", &self.endpoint)
            .field("relay_policy", &self.relay_policy)
            .field("on_transport_error", &self.on_transport_error.is_some())
            .finish()
    }
}

/// A follower message as the leader's agent sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInbound {
    pub sender: FollowerName,
    pub payload: String,
}

struct Shared {
    registry: FollowerRegistry,
    aggregate: SnapshotCell,
    inbound: mpsc::UnboundedSender<LeaderInbound>,
    events: mpsc::UnboundedSender<RoundEvent>,
    next_conn: AtomicU64,
    on_transport_error: Option<TransportErrorHook>,
}

impl Shared {
    fn emit(&self, event: RoundEvent) {
        debug!(event = event.name(), "Relayed round event");
        // Nobody listening is fine: the leader may run without a runtime
        let _ = self.events.send(event);
    }

    fn handle_frame(&self, conn: ConnId, sender: &FollowerName, frame: Frame) {
        match frame {
            Frame::Message(envelope) => {
                let _ = self.inbound.send(LeaderInbound {
                    sender: sender.clone(),
                    payload: envelope.payload,
                });
            }
            Frame::State { .. } | Frame::RoundStarted { .. } | Frame::RoundEnded
                if !self.registry.is_relay(conn) =>
            {
                debug!(follower = %sender, kind = frame.kind(), "Ignoring session frame from non-relay");
            }
            Frame::State { snapshot } => {
                self.aggregate.replace(snapshot.clone());
                self.emit(RoundEvent::Snapshot { snapshot });
            }
            Frame::RoundStarted { round } => {
                info!(round = %round.id, relay = %sender, "Relay reports round start");
                let snapshot = StateSnapshot::at_origin(round.participant_ids());
                self.aggregate.replace(snapshot.clone());
                self.emit(RoundEvent::Started { round, snapshot });
            }
            Frame::RoundEnded => {
                info!(relay = %sender, "Relay reports round end");
                self.emit(RoundEvent::Ended);
            }
            other => {
                warn!(follower = %sender, kind = other.kind(), "Unexpected frame from follower");
            }
        }
    }
}

/// Bound leader side of the coordination bus
///
/// Dropping the endpoint stops its I/O thread and removes the socket file of
/// an `ipc://` endpoint. Connected followers are not told; their sends start
/// failing once the connection drops.
pub struct LeaderEndpoint {
    runtime: Option<Runtime>,
    shared: Arc<Shared>,
    local: Endpoint,
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<LeaderInbound>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RoundEvent>>>,
}

impl LeaderEndpoint {
    /// Bind the endpoint and start accepting followers
    ///
    /// Binding happens before this returns, so an unusable address is an
    /// error here rather than on the I/O thread.
    pub fn bind(config: LeaderConfig) -> MeshResult<Self> {
        let bound = BoundListener::bind(&config.endpoint)?;
        let local = bound.local_endpoint()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("hans-leader-io")
            .enable_all()
            .build()?;
        let listener = {
            let _guard = runtime.enter();
            bound.into_listener()?
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: FollowerRegistry::new(config.relay_policy),
            aggregate: SnapshotCell::default(),
            inbound: inbound_tx,
            events: events_tx,
            next_conn: AtomicU64::new(1),
            on_transport_error: config.on_transport_error,
        });

        runtime.spawn(accept_loop(listener, Arc::clone(&shared)));
        info!(endpoint = %local, policy = ?config.relay_policy, "Leader listening");

        Ok(Self {
            runtime: Some(runtime),
            shared,
            local,
            inbound: Arc::new(Mutex::new(inbound_rx)),
            events: Mutex::new(Some(events_rx)),
        })
    }

    /// Where followers should connect; a TCP port of `0` is resolved here
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn state(&self) -> LeaderState {
        self.shared.registry.state()
    }

    pub fn followers(&self) -> Vec<FollowerName> {
        self.shared.registry.snapshot().names()
    }

    pub fn relay(&self) -> Option<FollowerName> {
        self.shared.registry.relay()
    }

    pub fn relay_policy(&self) -> RelayPolicy {
        self.shared.registry.policy()
    }

    /// Session view as last forwarded by the relay
    pub fn aggregate(&self) -> Arc<StateSnapshot> {
        self.shared.aggregate.current()
    }

    /// Send outside of a round
    pub fn send(&self, targets: impl Into<Recipients>, payload: impl Into<String>) -> MeshResult<usize> {
        send_logged(&self.shared.registry.snapshot(), targets.into(), payload.into())
    }

    pub fn broadcast(&self, payload: impl Into<String>) -> MeshResult<usize> {
        self.send(Recipients::All, payload)
    }

    pub fn broadcast_session_event(&self, event: SessionEvent) -> MeshResult<usize> {
        broadcast_event(&self.shared.registry.snapshot(), event)
    }

    /// Round lifecycle derived from the relay's forwarded frames
    ///
    /// Can be taken once; later calls return `None`.
    pub fn round_events(&self) -> Option<RoundEvents> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|rx| RoundEvents { rx })
    }

    /// Per-round binding for a leader agent
    pub fn link(&self) -> LeaderLink {
        LeaderLink {
            shared: Arc::clone(&self.shared),
            inbound: Arc::clone(&self.inbound),
            view: RegistrySnapshot::default(),
        }
    }
}

impl fmt::Debug for LeaderEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderEndpoint")
            .field("endpoint", &self.local)
            .field("registry", &self.shared.registry)
            .finish()
    }
}

impl Drop for LeaderEndpoint {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        if let Endpoint::Ipc(path) = &self.local {
            if let Err(err) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %err, "Socket file already gone");
            }
        }
        info!(endpoint = %self.local, "Leader closed");
    }
}

/// Blocking stream of relayed round events
///
/// Ends once the endpoint and every link taken from it are dropped. Must not
/// be iterated from inside an async runtime.
#[derive(Debug)]
pub struct RoundEvents {
    rx: mpsc::UnboundedReceiver<RoundEvent>,
}

impl RoundEvents {
    /// The next event if one is already queued
    pub fn try_next(&mut self) -> Option<RoundEvent> {
        self.rx.try_recv().ok()
    }
}

impl Iterator for RoundEvents {
    type Item = RoundEvent;

    fn next(&mut self) -> Option<RoundEvent> {
        self.rx.blocking_recv()
    }
}

/// Leader side of an agent's coordination role
///
/// The set of followers is captured at the start of every pass so all sends
/// within a pass see the same registry.
pub struct LeaderLink {
    shared: Arc<Shared>,
    inbound: Arc<Mutex<mpsc::UnboundedReceiver<LeaderInbound>>>,
    view: RegistrySnapshot,
}

impl LeaderLink {
    /// Send to one follower, a set of followers, or all of them
    ///
    /// Returns how many followers the message was queued for. Unknown names
    /// yield [`MeshError::UnknownTarget`]; the known ones are still served.
    pub fn send(&self, targets: impl Into<Recipients>, payload: impl Into<String>) -> MeshResult<usize> {
        send_logged(&self.view, targets.into(), payload.into())
    }

    pub fn broadcast(&self, payload: impl Into<String>) -> MeshResult<usize> {
        self.send(Recipients::All, payload)
    }

    pub fn broadcast_session_event(&self, event: SessionEvent) -> MeshResult<usize> {
        broadcast_event(&self.view, event)
    }

    /// Followers connected as of the start of this pass
    pub fn followers(&self) -> Vec<FollowerName> {
        self.view.names()
    }

    pub fn relay(&self) -> Option<&FollowerName> {
        self.view.relay()
    }

    /// Session view as last forwarded by the relay
    pub fn aggregate(&self) -> Arc<StateSnapshot> {
        self.shared.aggregate.current()
    }
}

impl AgentLink for LeaderLink {
    type Inbound = LeaderInbound;

    fn on_round_start(&mut self, round: &Round) -> RoundResult<()> {
        self.view = self.shared.registry.snapshot();
        debug!(round = %round.id, followers = self.view.len(), "Leader round started");
        Ok(())
    }

    fn before_pass(&mut self) {
        self.view = self.shared.registry.snapshot();
    }

    fn drain_inbound(&mut self) -> Vec<LeaderInbound> {
        let mut rx = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn on_round_end(&mut self) {
        self.view = RegistrySnapshot::default();
    }
}

impl fmt::Debug for LeaderLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderLink").field("view", &self.view).finish()
    }
}

fn send_logged(view: &RegistrySnapshot, recipients: Recipients, payload: String) -> MeshResult<usize> {
    let result = view.send(recipients, payload);
    if let Err(err) = &result {
        warn!(error = %err, "Send reached only some recipients");
    }
    result
}

fn broadcast_event(view: &RegistrySnapshot, event: SessionEvent) -> MeshResult<usize> {
    info!(event = ?event, followers = view.len(), "Broadcasting session event");
    view.deliver(&Recipients::All, &Frame::Session { event })
}

async fn accept_loop(listener: Listener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((read, write, peer)) => {
                let conn = ConnId(shared.next_conn.fetch_add(1, Ordering::Relaxed));
                debug!(peer = %peer, conn = conn.0, "Accepted connection");
                tokio::spawn(serve_connection(Arc::clone(&shared), conn, read, write));
            }
            Err(err) => {
                error!(error = %err, "Accept failed");
                report_transport_error(shared.on_transport_error.as_ref(), &MeshError::Io(err));
            }
        }
    }
}

async fn serve_connection(shared: Arc<Shared>, conn: ConnId, read: BoxedRead, write: BoxedWrite) {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(write, rx));
    let mut lines = BufReader::new(read).lines();

    let name = match read_frame(&mut lines).await {
        Ok(Some(Frame::Register { name })) => name,
        Ok(Some(other)) => {
            let reason = format!("expected register, got {}", other.kind());
            return reject(tx, writer, reason).await;
        }
        Ok(None) => {
            debug!(conn = conn.0, "Connection closed before registering");
            return;
        }
        Err(err) => return reject(tx, writer, err.to_string()).await,
    };

    if let Err(err) = shared.registry.register(name.clone(), conn, tx.clone()) {
        warn!(follower = %name, error = %err, "Registration refused");
        let reason = match err {
            MeshError::RegistrationRejected { reason, .. } => reason,
            other => other.to_string(),
        };
        return reject(tx, writer, reason).await;
    }
    drop(tx);

    let lost = loop {
        match read_frame(&mut lines).await {
            Ok(Some(frame)) => shared.handle_frame(conn, &name, frame),
            Ok(None) => break MeshError::Transport(format!("follower {name} disconnected")),
            Err(err @ (MeshError::DeserializationFailed(_) | MeshError::MessageTooLarge { .. })) => {
                warn!(follower = %name, error = %err, "Dropping malformed frame");
            }
            Err(err) => break MeshError::Transport(format!("follower {name} connection lost: {err}")),
        }
    };

    shared.registry.remove(conn);
    writer.abort();
    report_transport_error(shared.on_transport_error.as_ref(), &lost);
}

async fn reject(tx: mpsc::UnboundedSender<Frame>, writer: JoinHandle<MeshResult<()>>, reason: String) {
    warn!(reason = %reason, "Rejecting connection");
    let _ = tx.send(Frame::Rejected { reason });
    drop(tx);
    if let Ok(Err(err)) = writer.await {
        debug!(error = %err, "Rejection could not be delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Envelope;
    use crate::transport::connect;
    use std::time::Duration;
    use tokio::io::Lines;

    type Peer = (Lines<BufReader<BoxedRead>>, mpsc::UnboundedSender<Frame>);

    fn bind_loopback() -> LeaderEndpoint {
        LeaderEndpoint::bind(LeaderConfig::new(Endpoint::tcp("127.0.0.1:0"))).unwrap()
    }

    async fn raw_peer(endpoint: &Endpoint) -> Peer {
        let (read, write) = connect(endpoint).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_frames(write, rx));
        (BufReader::new(read).lines(), tx)
    }

    async fn register(endpoint: &Endpoint, name: &str) -> (Peer, Frame) {
        let (mut lines, tx) = raw_peer(endpoint).await;
        tx.send(Frame::Register {
            name: FollowerName::parse(name).unwrap(),
        })
        .unwrap();
        let reply = read_frame(&mut lines).await.unwrap().unwrap();
        ((lines, tx), reply)
    }

    async fn settle<F: FnMut() -> bool>(mut cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_first_registration_activates_leader() {
        let leader = bind_loopback();
        assert_eq!(leader.state(), LeaderState::AwaitingFirstFollower);

        let (_f1, reply1) = register(leader.local_endpoint(), "f1").await;
        let (_f2, reply2) = register(leader.local_endpoint(), "f2").await;

        assert_eq!(reply1, Frame::Registered { relay: true });
        assert_eq!(reply2, Frame::Registered { relay: false });
        assert_eq!(leader.state(), LeaderState::Active);
        assert_eq!(leader.relay(), Some(FollowerName::parse("f1").unwrap()));
    }

    #[tokio::test]
    async fn test_non_register_first_frame_is_rejected() {
        let leader = bind_loopback();
        let (mut lines, tx) = raw_peer(leader.local_endpoint()).await;
        tx.send(Frame::RoundEnded).unwrap();

        let reply = read_frame(&mut lines).await.unwrap();
        assert!(matches!(reply, Some(Frame::Rejected { .. })));
        assert!(leader.followers().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_gets_rejected_reply() {
        let leader = bind_loopback();
        let (_f1, _) = register(leader.local_endpoint(), "f1").await;
        let (_dup, reply) = register(leader.local_endpoint(), "f1").await;

        match reply {
            Frame::Rejected { reason } => assert!(reason.contains("f1")),
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(leader.followers().len(), 1);
    }

    #[tokio::test]
    async fn test_only_relay_frames_become_round_events() {
        let leader = bind_loopback();
        let mut events = leader.round_events().unwrap();
        assert!(leader.round_events().is_none());

        let ((_, relay_tx), _) = register(leader.local_endpoint(), "f1").await;
        let ((_, plain_tx), _) = register(leader.local_endpoint(), "f2").await;

        plain_tx.send(Frame::RoundEnded).unwrap();
        relay_tx
            .send(Frame::RoundStarted {
                round: Round::new(3, Duration::from_secs(10)),
            })
            .unwrap();

        let mut received = None;
        settle(|| {
            if received.is_none() {
                received = events.try_next();
            }
            received.is_some()
        })
        .await;

        match received {
            Some(RoundEvent::Started { round, .. }) => assert_eq!(round.id.0, 3),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_next().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_reports_and_unregisters() {
        let lost = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lost);
        let leader = LeaderEndpoint::bind(
            LeaderConfig::new(Endpoint::tcp("127.0.0.1:0"))
                .on_transport_error(move |err| sink.lock().unwrap().push(err.to_string())),
        )
        .unwrap();

        let (f1, _) = register(leader.local_endpoint(), "f1").await;
        let (_f2, _) = register(leader.local_endpoint(), "f2").await;
        drop(f1);

        settle(|| leader.followers().len() == 1).await;
        assert_eq!(leader.relay(), Some(FollowerName::parse("f2").unwrap()));
        settle(|| !lost.lock().unwrap().is_empty()).await;
        assert!(lost.lock().unwrap()[0].contains("f1"));
    }

    #[tokio::test]
    async fn test_link_drains_follower_messages() {
        let leader = bind_loopback();
        let mut link = leader.link();
        let ((_, tx), _) = register(leader.local_endpoint(), "f1").await;
        let name = FollowerName::parse("f1").unwrap();

        tx.send(Frame::Message(Envelope::from_follower(name.clone(), "ready")))
            .unwrap();

        let mut drained = Vec::new();
        settle(|| {
            drained.extend(link.drain_inbound());
            !drained.is_empty()
        })
        .await;
        assert_eq!(
            drained,
            vec![LeaderInbound {
                sender: name,
                payload: "ready".into()
            }]
        );
    }
}
