//! A routing function reading a device of an engine it is not bound to.

use lockstep_core::SchedulerConfig;
use lockstep_core::device::NestStatus;
use lockstep_sim::{Scenarios, voltmeter_id};

use crate::support::{Transport, ms, serve};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_foreign_device_is_requested_before_first_fetch() {
    for transport in Transport::ALL {
        let scenario = Scenarios::foreign_device(5).unwrap();
        let served = serve(&scenario.engines, transport).await;
        let handles = served.handles(&scenario.engines);
        let mut run = scenario.with_handles(SchedulerConfig::default(), handles).unwrap();

        run.simulation.launch_engines().await.unwrap();
        run.simulation.init_loop().await.unwrap();
        let requested = run.simulation.registry().requested_device_ids();
        assert!(requested.contains(&voltmeter_id("b")), "{transport:?}");

        run.simulation.run_loop(ms(10)).await.unwrap();
        run.simulation.shutdown().await.unwrap();

        let calls = run.probe.calls_of("relay_fn");
        assert!(!calls.is_empty(), "{transport:?}");
        let first = calls[0].devices["source"].as_ref().unwrap();
        assert_eq!(first.id(), &voltmeter_id("b"), "{transport:?}");
        assert!(first.payload::<NestStatus>().is_some(), "{transport:?}");

        let stimulus = run
            .engine("a")
            .unwrap()
            .inspect(|b| b.input("stimulus").cloned())
            .unwrap()
            .unwrap();
        assert_eq!(stimulus.id().engine_name, "a", "{transport:?}");
        assert!(stimulus.payload::<NestStatus>().is_some(), "{transport:?}");
        served.stop();
    }
}

#[tokio::test]
async fn test_inactive_binding_fetches_nothing_foreign() {
    let scenario = Scenarios::foreign_device(5).unwrap();
    let mut run = scenario.in_process(SchedulerConfig::default()).unwrap();
    run.simulation.registry_mut().set_active("relay", false).unwrap();

    run.simulation.launch_engines().await.unwrap();
    run.simulation.init_loop().await.unwrap();
    run.simulation.run_loop(ms(30)).await.unwrap();
    run.simulation.shutdown().await.unwrap();

    assert!(!run.simulation.registry().requested_device_ids().contains(&voltmeter_id("b")));
    assert!(run.probe.calls_of("relay_fn").is_empty());
}
