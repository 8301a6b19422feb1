//! # Hans
//!
//! Client runtime for agents taking part in timed rounds on the Hans
//! platform, with optional leader/follower coordination between agents.
//!
//! ## Core Components
//!
//! - **[Agent]**: the hooks a round drives (`setup`, `fixed_update`,
//!   `update`, `on_message`, `close`)
//! - **[RoundScheduler](core::RoundScheduler)**: fixed simulation rate with a
//!   separate update rate and a catch-up cap
//! - **[CoroutineScheduler](core::CoroutineScheduler)**: cooperative tasks
//!   resumed on the tick thread
//! - **[LeaderEndpoint], [FollowerEndpoint]**: the coordination bus
//! - **[AgentRuntime]**: one fresh agent per round, in strict sequence
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use hans::prelude::*;
//!
//! struct Drifter {
//!     x: f64,
//! }
//!
//! impl Agent for Drifter {
//!     type Link = ();
//!
//!     fn fixed_update(
//!         &mut self,
//!         _ctx: &mut Context<'_, Self>,
//!         delta: Duration,
//!         _sync_ratio: f64,
//!     ) -> AgentResult<()> {
//!         self.x += delta.as_secs_f64();
//!         Ok(())
//!     }
//!
//!     fn update(&mut self, ctx: &mut Context<'_, Self>, _delta: Duration) -> AgentResult<()> {
//!         ctx.submit_position(Position::new(self.x, 0.0))
//!     }
//! }
//!
//! let config = RuntimeConfig::load_from_file("hans.toml")?;
//! let mut runtime = AgentRuntime::new(config, || Drifter { x: 0.0 })?;
//! # let events: Vec<RoundEvent> = Vec::new();
//! runtime.run(events)?;
//! # Ok::<(), hans::RuntimeError>(())
//! ```

pub use hans_core as core;
pub use hans_mesh as mesh;

pub mod config;
pub mod error;
pub mod prelude;
pub mod runtime;

pub use config::{ConfigError, CoordinationConfig, Role, RuntimeConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use hans_core::{Agent, AgentLink, Context, RoundEvent};
pub use hans_mesh::{FollowerEndpoint, LeaderEndpoint};
pub use runtime::{AgentRuntime, Coordination};
