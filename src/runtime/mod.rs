//! # Runtime Module
//!
//! [`AgentRuntime`] binds the round scheduler and, when configured, one side
//! of the coordination bus to the external round lifecycle.
//!
//! ## Responsibilities
//!
//! - **Round sequencing**: a fresh agent per round, started only after the
//!   previous round's `close` returned
//! - **State delivery**: platform (or relayed) snapshots go into the running
//!   round's snapshot cell
//! - **Coordination**: the leader or follower endpoint lives as long as the
//!   runtime, and every round gets a fresh link to it
//!
//! ## Usage Pattern
//!
//! ```no_run
//! use hans::prelude::*;
//!
//! struct Idle;
//! impl Agent for Idle {
//!     type Link = ();
//! }
//!
//! let mut runtime = AgentRuntime::new(RuntimeConfig::default(), || Idle)?;
//! runtime.run(vec![
//!     RoundEvent::started(Round::new(1, std::time::Duration::from_secs(30))),
//!     RoundEvent::Ended,
//! ])?;
//! # Ok::<(), hans::RuntimeError>(())
//! ```

pub mod agent_runtime;
pub mod role;

pub use agent_runtime::AgentRuntime;
pub use role::Coordination;
