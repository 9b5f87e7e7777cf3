//! Device identifiers survive every wire format unchanged.

use lockstep_core::device::{ConversionAdapter, JointState, NestStatus};
use lockstep_core::{Device, DeviceIdentifier};
use lockstep_sim::{Scenarios, SimulatedEngine};
use lockstep_transport::{ChannelAdapter, JsonAdapter, RpcAdapter};
use serde_json::json;

use crate::support::{Transport, ms, serve};

fn voltmeter() -> Device {
    let id = Scenarios::voltmeter_identifier();
    Device::new(id.name, id.engine_name, NestStatus {
        data: json!({ "V_m": -65.0, "spikes": 3 }),
    })
}

/// Identifier read from the wire form, and identifier after decoding.
fn through<A: ConversionAdapter>(
    adapter: &A,
    device: &Device,
) -> (DeviceIdentifier, DeviceIdentifier) {
    let wire = adapter.serialize(device).unwrap();
    let extracted = adapter.extract_id(&wire).unwrap();
    let decoded = adapter.deserialize(&wire).unwrap();
    assert_eq!(decoded.data(), device.data());
    (extracted, decoded.id().clone())
}

#[test]
fn test_voltmeter_identifier_through_every_adapter() {
    let device = voltmeter();
    let expected = Scenarios::voltmeter_identifier();
    assert_eq!(device.id(), &expected);

    let results = [
        ("json", through(&JsonAdapter::new(), &device)),
        ("rpc", through(&RpcAdapter::new(), &device)),
        ("channel", through(&ChannelAdapter::new(), &device)),
    ];
    for (adapter, (extracted, decoded)) in results {
        assert_eq!(extracted, expected, "{adapter}");
        assert_eq!(decoded, expected, "{adapter}");
    }
}

#[test]
fn test_joint_identifier_through_every_adapter() {
    let device = Device::new("clock", "body", JointState {
        position: 12.5,
        velocity: -1.0,
        effort: 0.25,
    });

    for (extracted, decoded) in [
        through(&JsonAdapter::new(), &device),
        through(&RpcAdapter::new(), &device),
        through(&ChannelAdapter::new(), &device),
    ] {
        assert_eq!(&extracted, device.id());
        assert_eq!(&decoded, device.id());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_voltmeter_identifier_end_to_end() {
    let expected = Scenarios::voltmeter_identifier();
    for transport in Transport::WIRE {
        let engine = SimulatedEngine::builder(&expected.engine_name, ms(10)).neuro().build();
        let engines = [engine];
        let served = serve(&engines, transport).await;
        let client = &served.clients[0];

        client.launch(engines[0].config()).await.unwrap();
        client.initialize(&json!({ "seed": 4 })).await.unwrap();
        client.run_loop_step(ms(10)).await.unwrap();

        let fetched = client.get_devices(std::slice::from_ref(&expected)).await.unwrap();
        assert_eq!(fetched.len(), 1, "{transport:?}");
        assert_eq!(fetched[0].id(), &expected, "{transport:?}");

        client.set_devices(&[voltmeter()]).await.unwrap();
        let delivered = engines[0]
            .inspect(|b| b.input(&expected.name).map(|d| d.id().clone()))
            .unwrap();
        assert_eq!(delivered, Some(expected.clone()), "{transport:?}");

        client.shutdown(&serde_json::Value::Null).await.unwrap();
        served.stop();
    }
}
