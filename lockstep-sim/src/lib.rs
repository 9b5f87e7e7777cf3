//! Lockstep Simulation - deterministic simulated engines for testing.
//!
//! Provides stand-in engines that behave like real simulators without any
//! external process, so schedules, routing and transports can be exercised
//! under controlled, reproducible conditions.
//!
//! # Features
//!
//! - **Deterministic backends**: seeded noise, exact engine clocks
//! - **Fault injection**: per-command latency, step overshoot, hangs and
//!   scripted backend failures
//! - **Recording probes**: routing functions that log what they observed
//! - **Scenario library**: ready-made engine sets with their routing
//!
//! # Example
//!
//! ```rust,no_run
//! use lockstep_core::{SchedulerConfig, SimulationTime};
//! use lockstep_sim::Scenarios;
//!
//! # async fn run() -> lockstep_core::Result<()> {
//! let scenario = Scenarios::two_rates(42)?;
//! let mut run = scenario.in_process(SchedulerConfig::default())?;
//! run.simulation.launch_engines().await?;
//! run.simulation.init_loop().await?;
//! run.simulation.run_loop(SimulationTime::from_millis(100)).await?;
//! run.simulation.shutdown().await?;
//! println!("{:?}", run.step_counts());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod engine;
pub mod probe;
pub mod rng;
pub mod scenarios;

pub use backend::{EngineKind, SimulatedBackend, body_id, clock_id, voltmeter_id};
pub use engine::{SimulatedEngine, SimulatedEngineBuilder, SimulatedEngineClient};
pub use probe::{ProbeRecord, RecordingProbe};
pub use rng::DeterministicRng;
pub use scenarios::{Scenario, ScenarioRun, Scenarios};
