//! Engines with different timesteps stepping under one scheduler.

use lockstep_core::{RunOutcome, SchedulerConfig};
use lockstep_sim::{RecordingProbe, Scenarios};

use crate::support::{Transport, ms, serve};

/// Clock values at which `watch_a` saw both engines at the same time.
fn joint_batches(probe: &RecordingProbe) -> Vec<f64> {
    probe
        .calls_of("watch_a_fn")
        .iter()
        .filter_map(|r| Some((r.joint_position("a")?, r.joint_position("b")?)))
        .filter(|(a, b)| a == b)
        .map(|(a, _)| a)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_rates_over_every_transport() {
    for transport in Transport::ALL {
        let scenario = Scenarios::two_rates(11).unwrap();
        let served = serve(&scenario.engines, transport).await;
        let handles = served.handles(&scenario.engines);
        let mut run = scenario.with_handles(SchedulerConfig::default(), handles).unwrap();

        run.simulation.launch_engines().await.unwrap();
        run.simulation.init_loop().await.unwrap();
        run.simulation.run_loop(ms(100)).await.unwrap();
        run.simulation.shutdown().await.unwrap();

        let counts = run.step_counts();
        assert_eq!(counts.get("a"), Some(&10), "{transport:?}");
        assert_eq!(counts.get("b"), Some(&4), "{transport:?}");
        assert_eq!(run.simulation.sim_time(), ms(100), "{transport:?}");
        assert_eq!(joint_batches(&run.probe), vec![0.0, 50.0], "{transport:?}");
        served.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_brain_body_loop_over_wire_transports() {
    for transport in Transport::WIRE {
        let scenario = Scenarios::brain_body(3, ms(5), ms(20)).unwrap();
        let served = serve(&scenario.engines, transport).await;
        let handles = served.handles(&scenario.engines);
        let config = SchedulerConfig {
            simulation_timeout: Some(ms(100)),
            ..SchedulerConfig::default()
        };
        let mut run = scenario.managed(config, handles).unwrap();

        let outcome = run.simulation.run_to_completion().await.unwrap();

        assert_eq!(outcome, RunOutcome::TimedOut, "{transport:?}");
        let counts = run.step_counts();
        assert_eq!(counts.get("brain"), Some(&20), "{transport:?}");
        assert_eq!(counts.get("body"), Some(&5), "{transport:?}");
        let to_brain = run.engine("brain").unwrap().inspect(|b| b.received()).unwrap();
        let to_body = run.engine("body").unwrap().inspect(|b| b.received()).unwrap();
        assert!(to_brain > 0, "{transport:?}");
        assert!(to_body > 0, "{transport:?}");
        served.stop();
    }
}

#[tokio::test]
async fn test_repeated_runs_are_deterministic() {
    let mut noise = Vec::new();
    for _ in 0..2 {
        let scenario = Scenarios::brain_body(21, ms(5), ms(20)).unwrap();
        let mut run = scenario.in_process(SchedulerConfig::default()).unwrap();
        run.simulation.launch_engines().await.unwrap();
        run.simulation.init_loop().await.unwrap();
        run.simulation.run_loop(ms(60)).await.unwrap();
        run.simulation.shutdown().await.unwrap();

        let records = run.probe.calls_of("body_to_brain_fn");
        noise.push(records.iter().map(|r| r.produced.clone()).collect::<Vec<_>>());
    }
    assert!(!noise[0].is_empty());
    assert_eq!(noise[0], noise[1]);
}
