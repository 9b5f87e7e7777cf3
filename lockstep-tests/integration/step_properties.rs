//! Step counts of engines with arbitrary timesteps.

use lockstep_core::routing::NativeScriptRuntime;
use lockstep_core::{RoutingRegistry, SchedulerConfig, SimulationLoop};
use lockstep_sim::SimulatedEngine;
use proptest::prelude::*;

use crate::support::ms;

/// Runs the engines for `duration_ms`.
///
/// Per engine: steps the backend completed, backend time and the last
/// time the scheduler confirmed, both in milliseconds.
fn run(timesteps: &[i64], duration_ms: i64) -> Vec<(u64, i64, i64)> {
    let engines: Vec<SimulatedEngine> = timesteps
        .iter()
        .enumerate()
        .map(|(i, step)| SimulatedEngine::builder(format!("e{i}"), ms(*step)).build())
        .collect();
    let handles = engines.iter().map(SimulatedEngine::handle).collect();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let times = runtime.block_on(async {
        let mut sim = SimulationLoop::new(
            SchedulerConfig::default(),
            handles,
            RoutingRegistry::new(),
            Box::new(NativeScriptRuntime::new()),
        )
        .unwrap();
        sim.launch_engines().await.unwrap();
        sim.init_loop().await.unwrap();
        sim.run_loop(ms(duration_ms)).await.unwrap();
        sim.shutdown().await.unwrap();
        sim.engines()
            .iter()
            .map(|e| e.engine_time().as_millis())
            .collect::<Vec<_>>()
    });

    engines
        .iter()
        .zip(times)
        .map(|(engine, confirmed)| {
            let (steps, time) = engine.inspect(|b| (b.steps(), b.time())).unwrap();
            (steps, time.as_millis(), confirmed)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_each_engine_steps_once_per_timestep_started_in_window(
        timesteps in prop::collection::vec(1i64..40, 1..4),
        duration_ms in 1i64..150,
    ) {
        let results = run(&timesteps, duration_ms);
        for (step_ms, (steps, time_ms, confirmed_ms)) in timesteps.iter().zip(results) {
            // Steps start at 0, step_ms, ... while before the end of the window
            let expected = (duration_ms + step_ms - 1) / step_ms;
            prop_assert_eq!(steps as i64, expected);
            prop_assert_eq!(time_ms, expected * step_ms);
            // The last step is collected at shutdown, after the window
            prop_assert_eq!(confirmed_ms, (expected - 1) * step_ms);
        }
    }
}
