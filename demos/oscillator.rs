//! A plain agent circling the origin, fed by a simulated platform
//!
//! ```sh
//! RUST_LOG=debug cargo run --example oscillator
//! HANS_FIXED_STEP=10ms cargo run --example oscillator
//! ```

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use hans::core::RecordingSink;
use hans::prelude::*;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
struct Settings {
    #[serde(default = "default_speed")]
    speed: f64,
    #[serde(default = "default_radius")]
    radius: f64,
}

fn default_speed() -> f64 {
    1.5
}

fn default_radius() -> f64 {
    0.5
}

struct Oscillator {
    angle: f64,
    previous: f64,
    blend: f64,
    speed: f64,
    radius: f64,
}

impl Oscillator {
    fn new() -> Self {
        Self {
            angle: 0.0,
            previous: 0.0,
            blend: 0.0,
            speed: 0.0,
            radius: 0.0,
        }
    }
}

impl Agent for Oscillator {
    type Link = ();

    fn setup(&mut self, ctx: &mut Context<'_, Self>, args: &SetupArgs) -> AgentResult<()> {
        let settings: Settings = args.parse()?;
        self.speed = settings.speed;
        self.radius = settings.radius;
        info!(round = %ctx.round().id, speed = self.speed, "Oscillator ready");

        // Widen the circle every few seconds, forever
        ctx.start_coroutine(
            Sequence::new()
                .sleep(Duration::from_secs(2))
                .then(|agent: &mut Oscillator, _ctx: &mut Context<'_, Oscillator>| {
                    agent.radius = (agent.radius + 0.1).min(1.0);
                    info!(radius = agent.radius, "Widening");
                    Ok(())
                })
                .repeat(),
        );
        Ok(())
    }

    fn fixed_update(
        &mut self,
        _ctx: &mut Context<'_, Self>,
        delta: Duration,
        sync_ratio: f64,
    ) -> AgentResult<()> {
        self.previous = self.angle;
        self.angle += self.speed * delta.as_secs_f64();
        self.blend = sync_ratio;
        Ok(())
    }

    fn update(&mut self, ctx: &mut Context<'_, Self>, _delta: Duration) -> AgentResult<()> {
        // Extrapolate into the part of a step the accumulator still holds
        let angle = self.angle + (self.angle - self.previous) * self.blend;
        ctx.submit_position(Position::new(
            self.radius * angle.cos(),
            self.radius * angle.sin(),
        ))
    }

    fn close(&mut self, ctx: &mut Context<'_, Self>) -> AgentResult<()> {
        info!(round = %ctx.round().id, angle = self.angle, "Oscillator done");
        Ok(())
    }
}

/// Two short rounds with a moving neighbour
fn simulated_platform(events: mpsc::Sender<RoundEvent>) {
    for id in 1..=2 {
        let round = Round::new(id, Duration::from_secs(3));
        if events.send(RoundEvent::started(round)).is_err() {
            return;
        }
        for step in 0..10 {
            thread::sleep(Duration::from_millis(300));
            let event = RoundEvent::Position {
                participant: ParticipantId(2),
                position: Position::new(f64::from(step) * 0.1, 0.0),
            };
            if events.send(event).is_err() {
                return;
            }
        }
        if events.send(RoundEvent::Ended).is_err() {
            return;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();

    let mut config = RuntimeConfig::default()
        .with_agent_args(SetupArgs::new().with("speed", 2.0).with("radius", 0.4));
    config.apply_process_env()?;

    let sink = Arc::new(RecordingSink::new());
    let mut runtime = AgentRuntime::new(config, Oscillator::new)?.with_client(sink.clone());

    let (tx, rx) = mpsc::channel();
    let platform = thread::spawn(move || simulated_platform(tx));
    let outcomes = runtime.run(rx)?;
    let _ = platform.join();

    for outcome in &outcomes {
        info!(
            round = %outcome.round,
            passes = outcome.passes,
            fixed_steps = outcome.fixed_steps,
            "Round report"
        );
    }
    info!(submitted = sink.submitted().len(), last = ?sink.last(), "Positions sent");
    Ok(())
}
