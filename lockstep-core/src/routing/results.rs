//! Routing output grouped by destination engine.

use std::collections::BTreeMap;

use crate::device::Device;

/// Devices produced by routing functions, keyed by owning engine name.
#[derive(Debug, Clone, Default)]
pub struct SortedResults {
    by_engine: BTreeMap<String, Vec<Device>>,
}

impl SortedResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Groups `devices` by their engine name, keeping production order.
    pub fn from_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let mut results = Self::new();
        results.extend(devices);
        results
    }

    pub fn extend(&mut self, devices: impl IntoIterator<Item = Device>) {
        for device in devices {
            self.by_engine
                .entry(device.engine_name().to_string())
                .or_default()
                .push(device);
        }
    }

    /// Removes and returns the devices for `engine`; empty when none.
    pub fn take(&mut self, engine: &str) -> Vec<Device> {
        self.by_engine.remove(engine).unwrap_or_default()
    }

    pub fn get(&self, engine: &str) -> &[Device] {
        self.by_engine.get(engine).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Engines that have devices waiting but are not in `known`.
    pub fn unknown_engines<'a>(&'a self, known: &'a [&str]) -> impl Iterator<Item = &'a str> + 'a {
        self.by_engine
            .keys()
            .map(String::as_str)
            .filter(move |engine| !known.contains(engine))
    }

    pub fn is_empty(&self) -> bool {
        self.by_engine.values().all(Vec::is_empty)
    }
}
