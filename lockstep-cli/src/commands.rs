//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Subcommand, ValueEnum};
use lockstep_core::engine::{BasicLauncher, InProcessLauncher, ProcessLauncher};
use lockstep_core::tracing_setup::CliLogLevel;
use lockstep_core::{
    EngineConfig, EngineHandle, EngineServerCore, EngineState, LockstepConfig, SchedulerConfig,
    SimulationTime,
};
use lockstep_sim::{EngineKind, Scenario, Scenarios, SimulatedBackend, SimulatedEngine};
use lockstep_transport::channel::channel_pair;
use lockstep_transport::{
    ChannelEngineClient, ChannelEngineServer, JsonEngineClient, JsonEngineServer,
    RpcEngineClient, RpcEngineServer, ServerHandle, ServerOptions, TransportContext,
};
use tracing::{error, info};

/// Routing bindings of the brain and body demo
const DEMO_BINDINGS: [&str; 2] = ["brain_to_body", "body_to_brain"];

/// Wire protocol between the orchestrator and an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// JSON over HTTP
    Json,
    /// Length-prefixed binary RPC over TCP
    Rpc,
    /// Message channel to an engine thread in this process
    Channel,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Json => "json",
            TransportKind::Rpc => "rpc",
            TransportKind::Channel => "channel",
        }
    }
}

/// Simulated engine flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Physics,
    Neuro,
}

impl From<KindArg> for EngineKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Physics => EngineKind::Physics,
            KindArg::Neuro => EngineKind::Neuro,
        }
    }
}

#[derive(Debug, Args)]
pub struct DemoArgs {
    /// Transport between orchestrator and engines
    #[arg(long, value_enum, default_value = "json")]
    pub transport: TransportKind,
    /// Simulated duration in milliseconds
    #[arg(long, default_value = "1000")]
    pub duration_ms: i64,
    /// Timestep of the neural engine in milliseconds
    #[arg(long, default_value = "5")]
    pub brain_step_ms: i64,
    /// Timestep of the physics engine in milliseconds
    #[arg(long, default_value = "20")]
    pub body_step_ms: i64,
    /// Seed of the engines' noise
    #[arg(long, default_value = "42")]
    pub seed: u64,
    /// Run each engine as a separate `engine-server` process
    #[arg(long)]
    pub spawn: bool,
}

#[derive(Debug, Args)]
pub struct EngineServerArgs {
    /// Transport to serve
    #[arg(long, value_enum)]
    pub transport: TransportKind,
    /// Address to listen on; the next free port is used when it is taken
    #[arg(long = "serverurl")]
    pub server_url: String,
    /// Engine name
    #[arg(long = "engine")]
    pub engine: String,
    /// Registration listener of the orchestrator
    #[arg(long = "regservurl")]
    pub registration_url: Option<String>,
    /// Devices the engine produces
    #[arg(long, value_enum, default_value = "physics")]
    pub kind: KindArg,
    /// Seed used until the orchestrator sends one with the init data
    #[arg(long, default_value = "0")]
    pub seed: u64,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a neural and a physics engine in closed loop
    Demo(DemoArgs),
    /// Host a simulated engine for an orchestrator
    EngineServer(EngineServerArgs),
}

impl Commands {
    /// Label of this process's debug log file.
    pub fn log_label(&self) -> &str {
        match self {
            Commands::Demo(_) => "orchestrator",
            Commands::EngineServer(args) => &args.engine,
        }
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that fails
pub async fn handle_command(
    command: Commands,
    log_level: CliLogLevel,
    logs_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    match command {
        Commands::Demo(args) => run_demo(args, log_level, logs_dir).await,
        Commands::EngineServer(args) => serve_engine(args).await,
    }
}

/// Serves `core` over a network transport.
async fn serve_core(
    core: Arc<EngineServerCore<SimulatedBackend>>,
    transport: TransportKind,
    options: &ServerOptions,
) -> anyhow::Result<ServerHandle> {
    let handle = match transport {
        TransportKind::Json => JsonEngineServer::new(core).start(options).await?,
        TransportKind::Rpc => RpcEngineServer::new(core).start(options).await?,
        TransportKind::Channel => bail!("the channel transport has no network server"),
    };
    Ok(handle)
}

fn network_handle(
    transport: TransportKind,
    config: EngineConfig,
    context: &Arc<TransportContext>,
) -> anyhow::Result<EngineHandle> {
    let name = config.name.clone();
    let handle = match transport {
        TransportKind::Json => {
            EngineHandle::new(config, JsonEngineClient::new(name, Arc::clone(context)))
        }
        TransportKind::Rpc => {
            EngineHandle::new(config, RpcEngineClient::new(name, Arc::clone(context)))
        }
        TransportKind::Channel => bail!("the channel transport has no network client"),
    };
    Ok(handle)
}

/// Arguments that make a spawned `lockstep` process host `engine`.
///
/// The launcher appends the server, engine and registration arguments.
fn engine_server_args(
    engine: &SimulatedEngine,
    transport: TransportKind,
    log_level: CliLogLevel,
    logs_dir: Option<&PathBuf>,
) -> anyhow::Result<Vec<String>> {
    let kind = engine.inspect(SimulatedBackend::kind)?;
    let mut args = vec!["--log-level".to_string(), log_level.to_string()];
    if let Some(dir) = logs_dir {
        args.push("--logs-dir".to_string());
        args.push(dir.display().to_string());
    }
    args.extend(
        ["engine-server", "--transport", transport.as_str(), "--kind", kind.as_str()]
            .map(String::from),
    );
    Ok(args)
}

fn channel_handles(
    scenario: &Scenario,
    config: &LockstepConfig,
) -> anyhow::Result<Vec<EngineHandle>> {
    scenario
        .engines
        .iter()
        .map(|engine| {
            let (parent, child) = channel_pair();
            ChannelEngineServer::new(Arc::clone(engine.core()))
                .spawn(child)
                .with_context(|| format!("spawning channel server for {}", engine.name()))?;
            let client = ChannelEngineClient::new(
                engine.name(),
                parent,
                config.transport.channel_handshake_timeout,
            );
            Ok(EngineHandle::new(engine.config().clone(), client))
        })
        .collect()
}

/// Builds handles for a network transport, standing up one server per
/// engine in this process or spawning `engine-server` processes.
async fn network_handles(
    scenario: &Scenario,
    config: &LockstepConfig,
    args: &DemoArgs,
    log_level: CliLogLevel,
    logs_dir: Option<&PathBuf>,
    servers: &mut Vec<ServerHandle>,
) -> anyhow::Result<Vec<EngineHandle>> {
    let launcher: Arc<dyn ProcessLauncher> = if args.spawn {
        Arc::new(BasicLauncher)
    } else {
        Arc::new(InProcessLauncher)
    };
    let context = Arc::new(TransportContext::start(config.transport.clone(), launcher).await?);
    let registration = context
        .registration_address()
        .context("registration listener is not running")?
        .to_string();

    let mut handles = Vec::with_capacity(scenario.engines.len());
    for engine in &scenario.engines {
        let engine_config = if args.spawn {
            let exe = std::env::current_exe().context("locating the lockstep binary")?;
            let spawn_args = engine_server_args(engine, args.transport, log_level, logs_dir)?;
            engine
                .config()
                .clone()
                .with_launch_command(exe.to_string_lossy(), spawn_args)
        } else {
            let options = ServerOptions::from_config("127.0.0.1:0", &config.transport)
                .with_registration(registration.clone());
            servers.push(serve_core(Arc::clone(engine.core()), args.transport, &options).await?);
            engine.config().clone()
        };
        handles.push(network_handle(args.transport, engine_config, &context)?);
    }
    Ok(handles)
}

/// Run the brain and body demo and print what each engine did
async fn run_demo(
    args: DemoArgs,
    log_level: CliLogLevel,
    logs_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    if args.duration_ms <= 0 {
        bail!("--duration-ms must be positive");
    }
    if args.spawn && args.transport == TransportKind::Channel {
        bail!("--spawn needs the json or rpc transport");
    }

    let config = LockstepConfig::from_env()?;
    let scenario = Scenarios::brain_body(
        args.seed,
        SimulationTime::from_millis(args.brain_step_ms),
        SimulationTime::from_millis(args.body_step_ms),
    )?;

    let mut servers = Vec::new();
    let handles = match args.transport {
        TransportKind::Channel => channel_handles(&scenario, &config)?,
        TransportKind::Json | TransportKind::Rpc => {
            network_handles(
                &scenario,
                &config,
                &args,
                log_level,
                logs_dir.as_ref(),
                &mut servers,
            )
            .await?
        }
    };

    let scheduler = SchedulerConfig {
        simulation_timeout: Some(SimulationTime::from_millis(args.duration_ms)),
        ..config.scheduler.clone()
    };
    let mut run = scenario.managed(scheduler, handles)?;

    let stop = run.simulation.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping simulation");
            stop.stop();
        }
    });

    info!(
        transport = args.transport.as_str(),
        spawn = args.spawn,
        duration_ms = args.duration_ms,
        "Starting demo"
    );
    let outcome = run.simulation.run_to_completion().await;
    for server in servers {
        server.stop();
    }
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = e.user_message();
            error!(category = ?e.category(), engine = e.engine(), error = %e, "Demo aborted");
            return Err(anyhow::Error::new(e).context(message));
        }
    };

    // Spawned engines run their own backends; only local ones can be counted
    let steps = if args.spawn {
        Default::default()
    } else {
        run.step_counts()
    };
    let simulation = run.simulation.simulation_loop();
    println!("Demo finished ({outcome:?}) at {}", simulation.sim_time());
    for engine in simulation.engines() {
        match steps.get(engine.name()) {
            Some(count) => println!(
                "  {:<6} {count:>6} steps, engine time {}",
                engine.name(),
                engine.engine_time()
            ),
            None => println!("  {:<6} engine time {}", engine.name(), engine.engine_time()),
        }
    }
    for binding in DEMO_BINDINGS {
        let calls = run.probe.calls_of(&format!("{binding}_fn")).len();
        println!("  {binding}: {calls} routing calls");
    }
    Ok(())
}

/// Host a simulated engine until the orchestrator shuts it down
async fn serve_engine(args: EngineServerArgs) -> anyhow::Result<()> {
    let config = LockstepConfig::from_env()?;
    let backend = SimulatedBackend::new(&args.engine, args.kind.into(), args.seed);
    let core = Arc::new(
        EngineServerCore::new(&args.engine, backend)
            .with_lock_timeout(config.transport.registry_lock_timeout),
    );

    let mut options = ServerOptions::from_config(&args.server_url, &config.transport);
    if let Some(registration) = &args.registration_url {
        options = options.with_registration(registration.as_str());
    }
    let server = serve_core(Arc::clone(&core), args.transport, &options).await?;
    info!(
        engine = %args.engine,
        address = %server.address(),
        transport = args.transport.as_str(),
        "Engine server ready"
    );

    wait_for_shutdown(&core).await;
    server.stop();
    Ok(())
}

/// Returns once the engine was shut down after serving, or on Ctrl-C.
async fn wait_for_shutdown(core: &EngineServerCore<SimulatedBackend>) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    let mut served = false;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!(engine = %core.name(), "Interrupted");
                return;
            }
            _ = poll.tick() => match core.state() {
                EngineState::Stopped if served => {
                    info!(engine = %core.name(), "Engine shut down by orchestrator");
                    return;
                }
                EngineState::Stopped => {}
                _ => served = true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use lockstep_core::engine::engine_process_args;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    fn parse(args: &[&str]) -> Commands {
        TestCli::try_parse_from(std::iter::once("lockstep").chain(args.iter().copied()))
            .unwrap()
            .command
    }

    #[test]
    fn test_engine_server_accepts_launch_arguments() {
        let mut args = vec!["engine-server".to_string(), "--transport".into(), "rpc".into()];
        args.extend(engine_process_args("brain", "localhost:9002", Some("127.0.0.1:9001")));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let Commands::EngineServer(parsed) = parse(&args) else {
            panic!("expected engine-server");
        };
        assert_eq!(parsed.transport, TransportKind::Rpc);
        assert_eq!(parsed.server_url, "localhost:9002");
        assert_eq!(parsed.engine, "brain");
        assert_eq!(parsed.registration_url.as_deref(), Some("127.0.0.1:9001"));
        assert_eq!(parsed.kind, KindArg::Physics);
    }

    #[test]
    fn test_demo_defaults() {
        let Commands::Demo(parsed) = parse(&["demo"]) else {
            panic!("expected demo");
        };
        assert_eq!(parsed.transport, TransportKind::Json);
        assert_eq!(parsed.duration_ms, 1000);
        assert!(!parsed.spawn);
        assert_eq!(Commands::Demo(parsed).log_label(), "orchestrator");
    }

    #[test]
    fn test_spawned_engine_arguments_match_its_kind() {
        let scenario = Scenarios::brain_body(
            1,
            SimulationTime::from_millis(5),
            SimulationTime::from_millis(20),
        )
        .unwrap();
        let brain = scenario.engine("brain").unwrap();

        let args =
            engine_server_args(brain, TransportKind::Json, CliLogLevel::Debug, None).unwrap();

        assert_eq!(
            args,
            ["--log-level", "debug", "engine-server", "--transport", "json", "--kind", "neuro"]
        );
    }

    #[tokio::test]
    async fn test_demo_over_channel() {
        let args = DemoArgs {
            transport: TransportKind::Channel,
            duration_ms: 40,
            brain_step_ms: 5,
            body_step_ms: 20,
            seed: 7,
            spawn: false,
        };
        run_demo(args, CliLogLevel::Info, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_over_channel_is_rejected() {
        let args = DemoArgs {
            transport: TransportKind::Channel,
            duration_ms: 40,
            brain_step_ms: 5,
            body_step_ms: 20,
            seed: 7,
            spawn: true,
        };
        assert!(run_demo(args, CliLogLevel::Info, None).await.is_err());
    }
}
