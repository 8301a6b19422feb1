//! Coordination Bus Integration Tests
//!
//! Real leader and follower endpoints talking over loopback TCP and Unix
//! domain sockets, first at the link level and then through full runtimes.

use hans::core::{AgentLink, Participant, RoundError};
use hans::mesh::{
    Endpoint, FollowerConfig, FollowerEndpoint, FollowerStatus, LeaderConfig, LeaderEndpoint,
};
use hans::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn name(raw: &str) -> FollowerName {
    FollowerName::parse(raw).expect("valid follower name")
}

fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn loopback_leader() -> LeaderEndpoint {
    LeaderEndpoint::bind(LeaderConfig::new(Endpoint::tcp("127.0.0.1:0"))).expect("leader binds")
}

fn join(leader: &LeaderEndpoint, follower: &str) -> FollowerEndpoint {
    let endpoint = FollowerEndpoint::connect(
        FollowerConfig::new(name(follower))
            .with_endpoint(leader.local_endpoint().clone())
            .with_connect_timeout(Duration::from_secs(5)),
    )
    .expect("follower starts connecting");
    endpoint.wait_connected().expect("follower registers");
    endpoint
}

/// Collect what a follower link receives within `window`
fn drain_for(link: &mut FollowerLink, window: Duration) -> Vec<String> {
    let deadline = Instant::now() + window;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        for message in link.drain_inbound() {
            seen.push(match message {
                FollowerInbound::Message(payload) => payload,
                FollowerInbound::Session(event) => format!("session:{event:?}"),
            });
        }
        thread::sleep(Duration::from_millis(5));
    }
    seen
}

fn snapshot_with(participant: u64, x: f64) -> StateSnapshot {
    let mut positions = BTreeMap::new();
    positions.insert(ParticipantId(participant), Position::new(x, 0.0));
    StateSnapshot::new(positions, 1)
}

#[cfg(test)]
mod bus_tests {
    use super::*;

    #[test]
    fn test_first_follower_relays_and_broadcast_reaches_everyone() {
        let leader = loopback_leader();
        let f1 = join(&leader, "F1");
        let f2 = join(&leader, "F2");

        assert!(f1.is_relay());
        assert!(!f2.is_relay());
        assert_eq!(leader.relay(), Some(name("F1")));
        assert_eq!(leader.followers(), vec![name("F1"), name("F2")]);

        let round = Round::new(1, Duration::from_secs(30));
        let mut l1 = f1.link();
        let mut l2 = f2.link();
        l1.on_round_start(&round).expect("relay joins round");
        l2.on_round_start(&round).expect("follower joins round");

        // Only the relay's view of the game becomes the leader's aggregate
        l2.after_pass(&snapshot_with(7, -3.0));
        l1.after_pass(&snapshot_with(7, 2.5));
        assert!(eventually(Duration::from_secs(2), || {
            leader.aggregate().position(ParticipantId(7)) == Some(Position::new(2.5, 0.0))
        }));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(
            leader.aggregate().position(ParticipantId(7)),
            Some(Position::new(2.5, 0.0))
        );

        assert_eq!(leader.broadcast("go").expect("broadcast"), 2);
        assert_eq!(drain_for(&mut l1, Duration::from_millis(200)), vec!["go"]);
        assert_eq!(drain_for(&mut l2, Duration::from_millis(200)), vec!["go"]);
    }

    #[test]
    fn test_unicast_reaches_only_its_target() {
        let leader = loopback_leader();
        let f1 = join(&leader, "F1");
        let f2 = join(&leader, "F2");
        let mut l1 = f1.link();
        let mut l2 = f2.link();

        assert_eq!(leader.send(name("F2"), "hint").expect("unicast"), 1);

        assert_eq!(drain_for(&mut l2, Duration::from_millis(200)), vec!["hint"]);
        assert!(drain_for(&mut l1, Duration::from_millis(100)).is_empty());
    }

    #[test]
    fn test_unknown_target_is_reported_and_known_targets_served() {
        let leader = loopback_leader();
        let f2 = join(&leader, "F2");
        let mut l2 = f2.link();

        let result = leader.send(Recipients::many([name("F2"), name("F9")]), "split");
        match result {
            Err(MeshError::UnknownTarget { names }) => assert_eq!(names, vec![name("F9")]),
            other => panic!("expected unknown target, got {other:?}"),
        }
        assert_eq!(drain_for(&mut l2, Duration::from_millis(200)), vec!["split"]);

        assert!(matches!(
            leader.send(name("F9"), "lost"),
            Err(MeshError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn test_follower_messages_carry_registered_name() {
        let leader = loopback_leader();
        let f2 = join(&leader, "F2");
        let mut leader_link = leader.link();

        f2.send("ready").expect("send to leader");
        let mut inbound = Vec::new();
        assert!(eventually(Duration::from_secs(2), || {
            inbound.extend(leader_link.drain_inbound());
            !inbound.is_empty()
        }));
        assert_eq!(inbound[0].sender, name("F2"));
        assert_eq!(inbound[0].payload, "ready");
    }

    #[test]
    fn test_relay_promotion_after_disconnect() {
        let leader = loopback_leader();
        let f1 = join(&leader, "F1");
        let f2 = join(&leader, "F2");
        assert!(f1.is_relay());

        drop(f1);
        assert!(eventually(Duration::from_secs(2), || f2.is_relay()));
        assert_eq!(leader.relay(), Some(name("F2")));
        assert_eq!(leader.followers(), vec![name("F2")]);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let leader = loopback_leader();
        let _first = join(&leader, "F1");

        let second = FollowerEndpoint::connect(
            FollowerConfig::new(name("F1")).with_endpoint(leader.local_endpoint().clone()),
        )
        .expect("follower starts connecting");
        assert!(matches!(
            second.wait_connected(),
            Err(MeshError::RegistrationRejected { .. })
        ));
        assert!(matches!(second.status(), FollowerStatus::Rejected(_)));
        assert_eq!(leader.followers().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_bus_over_unix_socket() {
        let dir = tempfile::tempdir().expect("temp dir");
        let socket = dir.path().join("leader.ipc");
        let leader = LeaderEndpoint::bind(LeaderConfig::new(Endpoint::ipc(&socket)))
            .expect("leader binds");
        assert!(socket.exists());

        let f1 = join(&leader, "F1");
        let f2 = join(&leader, "F2");
        assert!(f1.is_relay());
        assert!(!f2.is_relay());

        let mut l1 = f1.link();
        let mut l2 = f2.link();
        leader
            .broadcast_session_event(SessionEvent::Start)
            .expect("session broadcast");
        assert_eq!(drain_for(&mut l1, Duration::from_millis(200)), vec!["session:Start"]);
        assert_eq!(drain_for(&mut l2, Duration::from_millis(200)), vec!["session:Start"]);

        drop(f1);
        drop(f2);
        drop(leader);
        assert!(!socket.exists());
    }
}

#[cfg(test)]
mod runtime_tests {
    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn contains(log: &Log, entry: &str) -> bool {
        log.lock().expect("log lock").iter().any(|e| e == entry)
    }

    fn fast() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_fixed_step(Duration::from_millis(10))
            .with_frame_interval(Duration::from_millis(10))
    }

    struct Conductor {
        log: Log,
    }

    impl Agent for Conductor {
        type Link = LeaderLink;

        fn setup(&mut self, ctx: &mut Context<'_, Self>, _args: &SetupArgs) -> AgentResult<()> {
            ctx.link()
                .broadcast_session_event(SessionEvent::Start)
                .map_err(|e| AgentError::Messaging(e.to_string()))?;
            Ok(())
        }

        fn on_message(&mut self, _ctx: &mut Context<'_, Self>, message: LeaderInbound) -> AgentResult<()> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("{}:{}", message.sender, message.payload));
            Ok(())
        }
    }

    struct Scout {
        log: Log,
    }

    impl Agent for Scout {
        type Link = FollowerLink;

        fn setup(&mut self, ctx: &mut Context<'_, Self>, _args: &SetupArgs) -> AgentResult<()> {
            if let Err(err) = ctx.link().send("ready") {
                self.log.lock().expect("log lock").push(format!("unsent:{err}"));
            }
            Ok(())
        }

        fn on_message(&mut self, _ctx: &mut Context<'_, Self>, message: FollowerInbound) -> AgentResult<()> {
            let entry = match message {
                FollowerInbound::Session(SessionEvent::Start) => "start".to_string(),
                FollowerInbound::Session(SessionEvent::Stop) => "stop".to_string(),
                FollowerInbound::Message(payload) => payload,
            };
            self.log.lock().expect("log lock").push(entry);
            Ok(())
        }
    }

    fn follower_runtime(endpoint: &Endpoint, follower: &str, log: &Log) -> AgentRuntime<Scout> {
        let config = RuntimeConfig::default().with_scheduler(fast()).with_coordination(
            CoordinationConfig::follower(follower).with_endpoint(endpoint.to_string()),
        );
        let log = Arc::clone(log);
        let runtime = AgentRuntime::follower(config, move || Scout {
            log: Arc::clone(&log),
        })
        .expect("follower runtime");
        runtime
            .follower_endpoint()
            .expect("follower endpoint")
            .wait_connected()
            .expect("follower registers");
        runtime
    }

    #[test]
    fn test_relay_drives_leader_rounds() {
        let leader_log = Log::default();
        let config = RuntimeConfig::default().with_scheduler(fast()).with_coordination(
            CoordinationConfig::leader().with_endpoint("tcp://127.0.0.1:0"),
        );
        let conductor_log = Arc::clone(&leader_log);
        let mut leader = AgentRuntime::leader(config, move || Conductor {
            log: Arc::clone(&conductor_log),
        })
        .expect("leader runtime");
        let endpoint = leader
            .leader_endpoint()
            .expect("leader endpoint")
            .local_endpoint()
            .clone();
        let mut events = leader
            .leader_endpoint()
            .expect("leader endpoint")
            .round_events()
            .expect("events not yet taken");

        let log1 = Log::default();
        let log2 = Log::default();
        let mut f1 = follower_runtime(&endpoint, "f1", &log1);
        let mut f2 = follower_runtime(&endpoint, "f2", &log2);

        let round = Round::new(3, Duration::from_secs(30))
            .with_participants(vec![Participant::new(1u64, "p1")]);
        f1.start_round(round.clone(), StateSnapshot::at_origin(round.participant_ids()))
            .expect("relay round starts");
        f2.start_round(round.clone(), StateSnapshot::at_origin(round.participant_ids()))
            .expect("follower round starts");

        let mut pump = |leader: &mut AgentRuntime<Conductor>| {
            while let Some(event) = events.try_next() {
                leader.handle_event(event).expect("relayed event applies");
            }
        };

        assert!(eventually(Duration::from_secs(3), || {
            pump(&mut leader);
            leader.current_round() == Some(RoundId(3))
        }));
        assert!(eventually(Duration::from_secs(3), || {
            contains(&leader_log, "f1:ready") && contains(&leader_log, "f2:ready")
        }));
        assert!(eventually(Duration::from_secs(3), || {
            contains(&log1, "start") && contains(&log2, "start")
        }));

        f1.update_position(ParticipantId(1), Position::new(4.0, 2.0))
            .expect("relay round running");
        f2.update_position(ParticipantId(1), Position::new(-9.0, -9.0))
            .expect("follower round running");
        assert!(eventually(Duration::from_secs(3), || {
            pump(&mut leader);
            leader
                .snapshot()
                .and_then(|s| s.position(ParticipantId(1)))
                == Some(Position::new(4.0, 2.0))
        }));

        f2.end_round().expect("follower round ends");
        f1.end_round().expect("relay round ends");
        assert!(eventually(Duration::from_secs(3), || {
            pump(&mut leader);
            !leader.is_running()
        }));
    }

    #[test]
    fn test_follower_keeps_serving_rounds_after_leader_leaves() {
        let leader = loopback_leader();
        let endpoint = leader.local_endpoint().clone();
        let log = Log::default();
        let mut scout = follower_runtime(&endpoint, "f1", &log);

        let first = scout
            .run(vec![
                RoundEvent::started(Round::new(1, Duration::from_secs(5))),
                RoundEvent::Ended,
            ])
            .expect("round with a leader");
        assert_eq!(first.len(), 1);
        assert!(!log.lock().expect("log lock").iter().any(|e| e.starts_with("unsent")));

        drop(leader);
        let follower = scout.follower_endpoint().expect("follower endpoint");
        assert!(eventually(Duration::from_secs(3), || {
            follower.status() == FollowerStatus::Disconnected
        }));

        let second = scout
            .run(vec![
                RoundEvent::started(Round::new(2, Duration::from_secs(5))),
                RoundEvent::Ended,
            ])
            .expect("leaderless round still runs");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].round, RoundId(2));
        assert!(second[0].is_clean());
        assert!(log
            .lock()
            .expect("log lock")
            .iter()
            .any(|e| e.starts_with("unsent:") && e.contains("leader")));
    }

    #[test]
    fn test_unregistered_follower_cannot_start_a_round() {
        // Reserve a port, then free it so nothing is listening there
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .expect("free port")
            .port();
        let config = RuntimeConfig::default().with_coordination(
            CoordinationConfig::follower("f1")
                .with_endpoint(format!("tcp://127.0.0.1:{port}"))
                .with_connect_timeout(Duration::from_millis(300))
                .with_retry_interval(Duration::from_millis(20)),
        );
        let log = Log::default();
        let mut runtime = AgentRuntime::follower(config, move || Scout {
            log: Arc::clone(&log),
        })
        .expect("connecting happens in the background");

        let err = runtime
            .run(vec![RoundEvent::started(Round::new(1, Duration::from_secs(5)))])
            .expect_err("round must not start");
        assert!(matches!(
            err,
            RuntimeError::Round(RoundError::RegistrationFailed { .. })
        ));
        assert!(!err.is_recoverable());
        assert!(!runtime.is_running());

        // Once the connect timeout has passed the follower gives up for good
        let endpoint = runtime.follower_endpoint().expect("follower endpoint");
        assert!(matches!(
            endpoint.wait_connected(),
            Err(MeshError::ConnectionFailed(_))
        ));
    }
}
