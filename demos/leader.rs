//! Leader that steers its followers
//!
//! Start it first, then one or more followers:
//!
//! ```sh
//! HANS_ENDPOINT=tcp://127.0.0.1:5555 cargo run --example leader
//! HANS_ENDPOINT=tcp://127.0.0.1:5555 HANS_FOLLOWER_NAME=f1 cargo run --example follower
//! HANS_ENDPOINT=tcp://127.0.0.1:5555 HANS_FOLLOWER_NAME=f2 cargo run --example follower
//! ```
//!
//! Rounds are driven by what the relay follower forwards.

use std::time::Duration;

use hans::prelude::*;
use tracing::{info, warn};

#[derive(Default)]
struct Conductor {
    ready: Vec<FollowerName>,
    hints: u32,
}

impl Agent for Conductor {
    type Link = LeaderLink;

    fn setup(&mut self, ctx: &mut Context<'_, Self>, _args: &SetupArgs) -> AgentResult<()> {
        let followers = ctx.link().followers();
        info!(round = %ctx.round().id, followers = followers.len(), "Conducting");
        ctx.link()
            .broadcast_session_event(SessionEvent::Start)
            .map_err(|e| AgentError::Messaging(e.to_string()))?;

        ctx.start_coroutine_after(
            from_fn(|agent: &mut Conductor, ctx: &mut Context<'_, Conductor>| {
                agent.hints += 1;
                // Alternate a private hint between the followers that checked in
                if let Some(target) = agent.ready.get(agent.hints as usize % agent.ready.len().max(1)) {
                    if let Err(err) = ctx.link().send(target, format!("hint {}", agent.hints)) {
                        warn!(error = %err, "Hint not delivered");
                    }
                }
                Ok(Step::sleep(Duration::from_secs(1)))
            }),
            Duration::from_millis(500),
        );
        Ok(())
    }

    fn update(&mut self, ctx: &mut Context<'_, Self>, _delta: Duration) -> AgentResult<()> {
        let aggregate = ctx.link().aggregate();
        if aggregate.sequence() % 20 == 1 {
            info!(participants = aggregate.len(), sequence = aggregate.sequence(), "Aggregate view");
        }
        Ok(())
    }

    fn on_message(&mut self, _ctx: &mut Context<'_, Self>, message: LeaderInbound) -> AgentResult<()> {
        info!(from = %message.sender, payload = %message.payload, "Follower says");
        if message.payload == "ready" && !self.ready.contains(&message.sender) {
            self.ready.push(message.sender);
        }
        Ok(())
    }

    fn close(&mut self, ctx: &mut Context<'_, Self>) -> AgentResult<()> {
        if let Err(err) = ctx.link().broadcast_session_event(SessionEvent::Stop) {
            warn!(error = %err, "Stop not delivered");
        }
        info!(hints = self.hints, "Round over");
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();

    let mut config = RuntimeConfig::default().with_coordination(CoordinationConfig::leader());
    config.apply_process_env()?;

    let mut runtime = AgentRuntime::leader(config, Conductor::default)?;
    let endpoint = runtime
        .leader_endpoint()
        .ok_or("leader runtime without an endpoint")?;
    info!(endpoint = %endpoint.local_endpoint(), "Waiting for followers");
    let events = endpoint
        .round_events()
        .ok_or("relayed round events already taken")?;

    runtime.run(events)?;
    Ok(())
}
