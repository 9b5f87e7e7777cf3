//! Runs abort on the first engine, launch or routing failure.

use std::sync::Arc;
use std::time::Duration;

use lockstep_core::engine::{BasicLauncher, InProcessLauncher};
use lockstep_core::routing::NativeScriptRuntime;
use lockstep_core::{
    EngineConfig, EngineError, EngineHandle, ErrorCategory, ErrorCode, LockstepConfig,
    LockstepError, RequestChain, RoutingBinding, RoutingRegistry, SchedulerConfig,
    SimulationLoop,
};
use lockstep_sim::{SimulatedEngine, clock_id};
use lockstep_transport::{JsonEngineClient, RpcEngineClient, TransportContext};

use crate::support::{Transport, ms, serve};

fn simulation(handles: Vec<EngineHandle>) -> SimulationLoop {
    SimulationLoop::new(
        SchedulerConfig::default(),
        handles,
        RoutingRegistry::new(),
        Box::new(NativeScriptRuntime::new()),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_step_times_out_over_wire_transports() {
    for transport in Transport::WIRE {
        let engines = [
            SimulatedEngine::builder("steady", ms(10)).build(),
            SimulatedEngine::builder("slow", ms(10))
                .step_cost(Duration::from_millis(400))
                .step_timeout(Duration::from_millis(50))
                .build(),
        ];
        let served = serve(&engines, transport).await;
        let mut sim = simulation(served.handles(&engines));
        sim.launch_engines().await.unwrap();
        sim.init_loop().await.unwrap();

        let err = sim.run_loop(ms(20)).await.unwrap_err();

        assert_eq!(err.category(), ErrorCategory::StepTimeout, "{transport:?}");
        assert_eq!(err.engine(), Some("slow"), "{transport:?}");
        served.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_step_before_initialize_is_out_of_order() {
    for transport in Transport::WIRE {
        let engines = [SimulatedEngine::builder("early", ms(10)).build()];
        let served = serve(&engines, transport).await;
        let client = &served.clients[0];
        client.launch(engines[0].config()).await.unwrap();

        let err = client.run_loop_step(ms(10)).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::OutOfOrder, "{transport:?}");
        assert_eq!(err.engine(), "early", "{transport:?}");
        assert_eq!(engines[0].inspect(|b| b.steps()).unwrap(), 0);
        served.stop();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backend_failure_names_engine() {
    for transport in Transport::ALL {
        let engines = [
            SimulatedEngine::builder("steady", ms(10)).build(),
            SimulatedEngine::builder("flaky", ms(10)).fail_at_step(3).build(),
        ];
        let served = serve(&engines, transport).await;
        let mut sim = simulation(served.handles(&engines));
        sim.launch_engines().await.unwrap();
        sim.init_loop().await.unwrap();

        let err = sim.run_loop(ms(100)).await.unwrap_err();

        assert_eq!(err.engine(), Some("flaky"), "{transport:?}");
        assert_eq!(err.category(), ErrorCategory::ProtocolViolation, "{transport:?}");
        assert!(sim.sim_time() < ms(100), "{transport:?}");
        served.stop();
    }
}

#[tokio::test]
async fn test_missing_launch_command_fails_launch() {
    let config = LockstepConfig::for_testing();
    let context =
        Arc::new(TransportContext::new(config.transport, Arc::new(BasicLauncher)).unwrap());
    let handle = EngineHandle::new(
        EngineConfig::new("ghost", ms(10)),
        JsonEngineClient::new("ghost", context),
    );
    let mut sim = simulation(vec![handle]);

    let err = sim.launch_engines().await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Launch);
    assert_eq!(err.engine(), Some("ghost"));
    assert!(matches!(
        err,
        LockstepError::Engine(EngineError::LaunchFailed { .. })
    ));
}

#[tokio::test]
async fn test_engine_that_never_registers_fails_launch() {
    let mut config = LockstepConfig::for_testing();
    config.transport.registration_retries = 3;
    config.transport.registration_interval = Duration::from_millis(10);
    let context = Arc::new(
        TransportContext::start(config.transport, Arc::new(InProcessLauncher))
            .await
            .unwrap(),
    );
    let handle = EngineHandle::new(
        EngineConfig::new("silent", ms(10)),
        RpcEngineClient::new("silent", context),
    );
    let mut sim = simulation(vec![handle]);

    let err = sim.launch_engines().await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Launch);
    assert_eq!(err.engine(), Some("silent"));
}

#[tokio::test]
async fn test_failing_routing_function_aborts_run() {
    let engine = SimulatedEngine::builder("a", ms(10)).build();
    let mut registry = RoutingRegistry::new();
    registry
        .load(RoutingBinding::new(
            "explode",
            "a",
            RequestChain::function("explode_fn").with_device("clock", clock_id("a")),
        ))
        .unwrap();
    let runtime = NativeScriptRuntime::new()
        .with("explode_fn", |_| Err("joint out of range".to_string()));
    let mut sim = SimulationLoop::new(
        SchedulerConfig::default(),
        vec![engine.handle()],
        registry,
        Box::new(runtime),
    )
    .unwrap();
    sim.launch_engines().await.unwrap();
    sim.init_loop().await.unwrap();

    let err = sim.run_loop(ms(50)).await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::RoutingFunction);
    assert!(err.user_message().contains("explode"));
}
