//! Simulated engines served over each transport.

use std::sync::Arc;

use lockstep_core::engine::InProcessLauncher;
use lockstep_core::{EngineClient, EngineHandle, LockstepConfig, SimulationTime};
use lockstep_sim::SimulatedEngine;
use lockstep_transport::channel::channel_pair;
use lockstep_transport::{
    ChannelEngineClient, ChannelEngineServer, JsonEngineClient, JsonEngineServer,
    RpcEngineClient, RpcEngineServer, ServerHandle, ServerOptions, TransportContext,
};

pub fn ms(value: i64) -> SimulationTime {
    SimulationTime::from_millis(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    InProcess,
    Json,
    Rpc,
    Channel,
}

impl Transport {
    pub const ALL: [Transport; 4] = [
        Transport::InProcess,
        Transport::Json,
        Transport::Rpc,
        Transport::Channel,
    ];

    /// Transports with a wire format.
    pub const WIRE: [Transport; 3] = [Transport::Json, Transport::Rpc, Transport::Channel];
}

/// Clients for a set of engines, with the servers fronting them.
pub struct Served {
    pub clients: Vec<Arc<dyn EngineClient>>,
    servers: Vec<ServerHandle>,
}

impl Served {
    /// One handle per engine, in order, sharing the served clients.
    pub fn handles(&self, engines: &[SimulatedEngine]) -> Vec<EngineHandle> {
        engines
            .iter()
            .zip(&self.clients)
            .map(|(engine, client)| EngineHandle::from_arc(engine.config().clone(), client.clone()))
            .collect()
    }

    pub fn stop(self) {
        for server in self.servers {
            server.stop();
        }
    }
}

/// Serves each engine's core over `transport`.
///
/// Network servers bind ephemeral ports and register with the context's
/// listener, so clients find them at launch.
pub async fn serve(engines: &[SimulatedEngine], transport: Transport) -> Served {
    let config = LockstepConfig::for_testing();
    let context = match transport {
        Transport::Json | Transport::Rpc => Some(Arc::new(
            TransportContext::start(config.transport.clone(), Arc::new(InProcessLauncher))
                .await
                .unwrap(),
        )),
        Transport::InProcess | Transport::Channel => None,
    };

    let mut served = Served {
        clients: Vec::new(),
        servers: Vec::new(),
    };
    for engine in engines {
        let core = Arc::clone(engine.core());
        let client: Arc<dyn EngineClient> = match (transport, &context) {
            (Transport::InProcess, _) => Arc::new(engine.client()),
            (Transport::Channel, _) => {
                let (parent, child) = channel_pair();
                ChannelEngineServer::new(core).spawn(child).unwrap();
                Arc::new(ChannelEngineClient::new(
                    engine.name(),
                    parent,
                    config.transport.channel_handshake_timeout,
                ))
            }
            (Transport::Json | Transport::Rpc, Some(context)) => {
                let registration = context.registration_address().unwrap().to_string();
                let options = ServerOptions::from_config("127.0.0.1:0", &config.transport)
                    .with_registration(registration);
                if transport == Transport::Json {
                    served
                        .servers
                        .push(JsonEngineServer::new(core).start(&options).await.unwrap());
                    Arc::new(JsonEngineClient::new(engine.name(), Arc::clone(context)))
                } else {
                    served
                        .servers
                        .push(RpcEngineServer::new(core).start(&options).await.unwrap());
                    Arc::new(RpcEngineClient::new(engine.name(), Arc::clone(context)))
                }
            }
            (Transport::Json | Transport::Rpc, None) => unreachable!("network context missing"),
        };
        served.clients.push(client);
    }
    served
}
