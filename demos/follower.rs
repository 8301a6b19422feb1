//! Follower that reports in and reacts to its leader
//!
//! See the `leader` demo for how to start a group. The platform side is
//! simulated: a round starts every few seconds.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use hans::prelude::*;
use tracing::{info, warn};

#[derive(Default)]
struct Scout {
    heading: f64,
    x: f64,
    hints: Vec<String>,
    active: bool,
}

impl Agent for Scout {
    type Link = FollowerLink;

    fn setup(&mut self, ctx: &mut Context<'_, Self>, args: &SetupArgs) -> AgentResult<()> {
        self.heading = args.get_or("heading", 1.0)?;
        info!(name = %ctx.link().name(), relay = ctx.link().is_relay(), "Scout ready");
        ctx.link()
            .send("ready")
            .map_err(|e| AgentError::Messaging(e.to_string()))
    }

    fn fixed_update(
        &mut self,
        _ctx: &mut Context<'_, Self>,
        delta: Duration,
        _sync_ratio: f64,
    ) -> AgentResult<()> {
        if self.active {
            self.x += self.heading * delta.as_secs_f64() * 0.1;
        }
        Ok(())
    }

    fn update(&mut self, ctx: &mut Context<'_, Self>, _delta: Duration) -> AgentResult<()> {
        if ctx.client().is_some() {
            ctx.submit_position(Position::new(self.x, 0.0))?;
        }
        Ok(())
    }

    fn on_message(&mut self, ctx: &mut Context<'_, Self>, message: FollowerInbound) -> AgentResult<()> {
        match message {
            FollowerInbound::Session(SessionEvent::Start) => self.active = true,
            FollowerInbound::Session(SessionEvent::Stop) => self.active = false,
            FollowerInbound::Message(hint) => {
                self.heading = -self.heading;
                info!(hint = %hint, heading = self.heading, "Turning");
                self.hints.push(hint);
                if let Err(err) = ctx.link().send(format!("turned at {:.2}", self.x)) {
                    warn!(error = %err, "Reply not delivered");
                }
            }
        }
        Ok(())
    }

    fn close(&mut self, _ctx: &mut Context<'_, Self>) -> AgentResult<()> {
        info!(hints = self.hints.len(), x = self.x, "Scout done");
        Ok(())
    }
}

fn simulated_platform(events: mpsc::Sender<RoundEvent>) {
    for id in 1..=3 {
        let round = Round::new(id, Duration::from_secs(4))
            .with_participants(vec![hans::core::Participant::new(1u64, "scout")]);
        if events.send(RoundEvent::started(round)).is_err() {
            return;
        }
        for step in 0..8 {
            thread::sleep(Duration::from_millis(500));
            let event = RoundEvent::Position {
                participant: ParticipantId(1),
                position: Position::new(f64::from(step) * 0.05, 0.0),
            };
            if events.send(event).is_err() {
                return;
            }
        }
        if events.send(RoundEvent::Ended).is_err() {
            return;
        }
        thread::sleep(Duration::from_secs(1));
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();

    let mut config = RuntimeConfig::default().with_coordination(CoordinationConfig::follower("f1"));
    config.apply_process_env()?;

    let mut runtime = AgentRuntime::follower(config, Scout::default)?;
    if let Some(endpoint) = runtime.follower_endpoint() {
        let relay = endpoint.wait_connected()?;
        info!(name = %endpoint.name(), relay, "Registered");
    }

    let (tx, rx) = mpsc::channel();
    let platform = thread::spawn(move || simulated_platform(tx));
    runtime.run(rx)?;
    let _ = platform.join();
    Ok(())
}
