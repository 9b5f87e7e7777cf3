//! Routing functions that record what they see.

use std::collections::BTreeMap;
use std::sync::Arc;

use lockstep_core::device::JointState;
use lockstep_core::routing::RoutingArgs;
use lockstep_core::{Device, DeviceIdentifier};
use parking_lot::Mutex;

/// One routing function call as observed by a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRecord {
    pub function: String,
    /// Injected devices by keyword; `None` when the keyword was missing
    pub devices: BTreeMap<String, Option<Device>>,
    /// Devices the call returned for delivery
    pub produced: Vec<Device>,
}

impl ProbeRecord {
    /// Joint position seen under `keyword`.
    pub fn joint_position(&self, keyword: &str) -> Option<f64> {
        self.devices
            .get(keyword)?
            .as_ref()?
            .payload::<JointState>()
            .map(|j| j.position)
    }
}

/// Shared log of routing function calls.
///
/// Clones share the same log, so a probe can be handed to closures
/// registered in a script runtime and read back after the run.
#[derive(Debug, Clone, Default)]
pub struct RecordingProbe {
    records: Arc<Mutex<Vec<ProbeRecord>>>,
}

impl RecordingProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProbeRecord> {
        self.records.lock().clone()
    }

    /// Calls of one function, in call order.
    pub fn calls_of(&self, function: &str) -> Vec<ProbeRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.function == function)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn record(
        &self,
        function: &str,
        keywords: &[String],
        args: &RoutingArgs,
        produced: &[Device],
    ) {
        let devices = keywords
            .iter()
            .map(|k| (k.clone(), args.get(k).cloned()))
            .collect();
        self.records.lock().push(ProbeRecord {
            function: function.to_string(),
            devices,
            produced: produced.to_vec(),
        });
    }

    /// Routing function body that records the devices under `keywords` and
    /// produces nothing.
    pub fn observer(
        &self,
        function: impl Into<String>,
        keywords: &[&str],
    ) -> impl FnMut(RoutingArgs) -> Result<Vec<Device>, String> + Send + 'static {
        let probe = self.clone();
        let function = function.into();
        let keywords: Vec<String> = keywords.iter().map(|k| (*k).to_string()).collect();
        move |args| {
            probe.record(&function, &keywords, &args, &[]);
            Ok(Vec::new())
        }
    }

    /// Routing function body that copies the device under `keyword` to
    /// `target`, keeping its payload, and records the call.
    ///
    /// Fails when the keyword is missing from the arguments.
    pub fn forwarder(
        &self,
        function: impl Into<String>,
        keyword: impl Into<String>,
        target: DeviceIdentifier,
    ) -> impl FnMut(RoutingArgs) -> Result<Vec<Device>, String> + Send + 'static {
        let probe = self.clone();
        let function = function.into();
        let keywords = vec![keyword.into()];
        move |args| {
            let keyword = &keywords[0];
            let source = args
                .get(keyword)
                .ok_or_else(|| format!("no device under '{keyword}'"))?;
            let id = DeviceIdentifier {
                device_type: source.id().device_type.clone(),
                ..target.clone()
            };
            let forwarded =
                Device::from_parts(id, source.data().clone()).map_err(|e| e.to_string())?;
            let produced = vec![forwarded];
            probe.record(&function, &keywords, &args, &produced);
            Ok(produced)
        }
    }
}

#[cfg(test)]
mod tests {
    use lockstep_core::device::NestStatus;

    use super::*;

    fn args_with(keyword: &str, device: Device) -> RoutingArgs {
        let mut args = RoutingArgs::new();
        args.named.insert(keyword.to_string(), device);
        args
    }

    #[test]
    fn test_observer_records_missing_keywords() {
        let probe = RecordingProbe::new();
        let mut observe = probe.observer("observe", &["a", "b"]);
        let joint = Device::new("clock", "a", JointState {
            position: 40.0,
            ..JointState::default()
        });

        observe(args_with("a", joint)).unwrap();

        let records = probe.calls_of("observe");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].joint_position("a"), Some(40.0));
        assert_eq!(records[0].devices.get("b"), Some(&None));
        assert!(records[0].produced.is_empty());
    }

    #[test]
    fn test_forwarder_retargets_device() {
        let probe = RecordingProbe::new();
        let target = DeviceIdentifier::new("stimulus", "body", "placeholder");
        let mut forward = probe.forwarder("relay", "voltmeter", target);
        let voltmeter = Device::new("voltmeter", "brain", NestStatus {
            data: serde_json::json!({ "spikes": 2 }),
        });

        let out = forward(args_with("voltmeter", voltmeter.clone())).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id(), &DeviceIdentifier::new("stimulus", "body", "nest_device"));
        assert_eq!(out[0].data(), voltmeter.data());
        assert_eq!(probe.len(), 1);
        assert!(forward(RoutingArgs::new()).is_err());
        assert_eq!(probe.len(), 1);
    }
}
