//! Loaded routing functions and their execution.

use tracing::{debug, trace};

use super::{DeviceBuffer, RequestChain, RoutingArgs, RoutingError, ScriptRuntime};
use crate::device::{Device, DeviceCache, DeviceIdentifiers};

/// A routing function bound to the engine that triggers it.
#[derive(Debug, Clone)]
pub struct RoutingBinding {
    name: String,
    trigger_engine: String,
    chain: RequestChain,
    active: bool,
    requested_ids: DeviceIdentifiers,
}

impl RoutingBinding {
    /// Creates an active binding; requested ids are computed on update.
    pub fn new(
        name: impl Into<String>,
        trigger_engine: impl Into<String>,
        chain: RequestChain,
    ) -> Self {
        Self {
            name: name.into(),
            trigger_engine: trigger_engine.into(),
            chain,
            active: true,
            requested_ids: DeviceIdentifiers::new(),
        }
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trigger_engine(&self) -> &str {
        &self.trigger_engine
    }

    pub fn chain(&self) -> &RequestChain {
        &self.chain
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Identifiers as of the last update.
    pub fn requested_ids(&self) -> &DeviceIdentifiers {
        &self.requested_ids
    }
}

/// Registry and runner of routing functions.
///
/// Bindings run in load order. The device buffer is written only through
/// [`set_engine_output`](Self::set_engine_output), between batches.
#[derive(Debug, Default)]
pub struct RoutingRegistry {
    bindings: Vec<RoutingBinding>,
    buffer: DeviceBuffer,
    requested_ids: DeviceIdentifiers,
}

impl RoutingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a binding.
    ///
    /// # Errors
    ///
    /// - `RoutingError::DuplicateName` - A binding with this name is loaded
    pub fn load(&mut self, binding: RoutingBinding) -> Result<(), RoutingError> {
        if self.position(&binding.name).is_some() {
            return Err(RoutingError::DuplicateName { name: binding.name });
        }
        debug!(
            function = %binding.name,
            trigger = %binding.trigger_engine,
            "Loaded routing function"
        );
        self.bindings.push(binding);
        Ok(())
    }

    /// Replaces the binding with the same name, keeping its position.
    ///
    /// # Errors
    ///
    /// - `RoutingError::UnknownFunction` - No binding with this name
    pub fn update(&mut self, binding: RoutingBinding) -> Result<(), RoutingError> {
        let index = self.index(&binding.name)?;
        debug!(function = %binding.name, "Updated routing function");
        self.bindings[index] = binding;
        Ok(())
    }

    /// Removes and returns a binding.
    ///
    /// # Errors
    ///
    /// - `RoutingError::UnknownFunction` - No binding with this name
    pub fn unload(&mut self, name: &str) -> Result<RoutingBinding, RoutingError> {
        let index = self.index(name)?;
        Ok(self.bindings.remove(index))
    }

    /// # Errors
    ///
    /// - `RoutingError::UnknownFunction` - No binding with this name
    pub fn set_active(&mut self, name: &str, active: bool) -> Result<(), RoutingError> {
        let index = self.index(name)?;
        self.bindings[index].active = active;
        Ok(())
    }

    /// # Errors
    ///
    /// - `RoutingError::UnknownFunction` - No binding with this name
    pub fn is_active(&self, name: &str) -> Result<bool, RoutingError> {
        Ok(self.bindings[self.index(name)?].active)
    }

    pub fn bindings(&self) -> &[RoutingBinding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Recomputes every binding's requested devices and returns the union
    /// over active bindings.
    pub fn update_requested_device_ids(&mut self) -> &DeviceIdentifiers {
        let mut all = DeviceIdentifiers::new();
        for binding in &mut self.bindings {
            binding.requested_ids = binding.chain.requested_ids();
            if binding.active {
                all.extend(binding.requested_ids.iter().cloned());
            }
        }
        trace!(count = all.len(), "Updated requested device ids");
        self.requested_ids = all;
        &self.requested_ids
    }

    /// Union computed by the last update.
    pub fn requested_device_ids(&self) -> &DeviceIdentifiers {
        &self.requested_ids
    }

    /// Publishes an engine's fetched outputs to routing functions.
    pub fn set_engine_output(&mut self, engine: &str, cache: &DeviceCache) {
        self.buffer.set_engine_output(engine, cache);
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    /// Runs every active binding triggered by `engine`, in load order.
    ///
    /// # Errors
    ///
    /// - `RoutingError::MissingDevice` - A requested device was never fetched
    /// - `RoutingError::FunctionFailed` - The function raised an error
    pub fn execute_active_linked(
        &self,
        engine: &str,
        runtime: &mut dyn ScriptRuntime,
    ) -> Result<Vec<Device>, RoutingError> {
        let mut produced = Vec::new();
        for binding in self
            .bindings
            .iter()
            .filter(|b| b.active && b.trigger_engine == engine)
        {
            let mut args = RoutingArgs::new();
            binding.chain.prepare_args(&self.buffer, &mut args)?;

            let devices = runtime
                .call(binding.chain.function_name(), args)
                .map_err(|source| RoutingError::FunctionFailed {
                    name: binding.name.clone(),
                    source,
                })?;
            trace!(function = %binding.name, produced = devices.len(), "Routing function ran");
            produced.extend(devices);
        }
        Ok(produced)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.bindings.iter().position(|b| b.name == name)
    }

    fn index(&self, name: &str) -> Result<usize, RoutingError> {
        self.position(name)
            .ok_or_else(|| RoutingError::UnknownFunction {
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceIdentifier, JointState};
    use crate::routing::NativeScriptRuntime;

    fn joint_id(name: &str, engine: &str) -> DeviceIdentifier {
        DeviceIdentifier::new(name, engine, "physics_joint")
    }

    fn forward_binding(name: &str) -> RoutingBinding {
        RoutingBinding::new(
            name,
            "brain",
            RequestChain::function("forward").with_device("input", joint_id("elbow", "physics")),
        )
    }

    fn forward_runtime() -> NativeScriptRuntime {
        NativeScriptRuntime::new().with("forward", |args| {
            let input = args.get("input").ok_or("missing input")?;
            let joint = input.payload::<JointState>().copied().unwrap_or_default();
            Ok(vec![Device::new("command", "brain", joint)])
        })
    }

    #[test]
    fn test_load_rejects_duplicates() {
        let mut registry = RoutingRegistry::new();
        registry.load(forward_binding("tf")).unwrap();

        let err = registry.load(forward_binding("tf")).unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateName { ref name } if name == "tf"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_update_and_activation() {
        let mut registry = RoutingRegistry::new();
        registry.load(forward_binding("tf")).unwrap();
        registry.load(forward_binding("other")).unwrap();

        registry
            .update(RoutingBinding::new("tf", "physics", RequestChain::function("noop")))
            .unwrap();
        assert_eq!(registry.bindings()[0].trigger_engine(), "physics");

        registry.set_active("tf", false).unwrap();
        assert!(!registry.is_active("tf").unwrap());
        assert!(registry.set_active("nope", true).is_err());
        assert!(registry.update(forward_binding("nope")).is_err());

        let removed = registry.unload("other").unwrap();
        assert_eq!(removed.name(), "other");
        assert!(registry.is_active("other").is_err());
    }

    #[test]
    fn test_requested_ids_only_from_active() {
        let mut registry = RoutingRegistry::new();
        registry.load(forward_binding("tf")).unwrap();
        registry
            .load(
                RoutingBinding::new(
                    "idle",
                    "brain",
                    RequestChain::function("noop").with_device("x", joint_id("wrist", "physics")),
                )
                .inactive(),
            )
            .unwrap();

        let ids = registry.update_requested_device_ids().clone();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&joint_id("elbow", "physics")));
        assert_eq!(registry.bindings()[1].requested_ids().len(), 1);
    }

    #[test]
    fn test_execute_reads_buffer() {
        let mut registry = RoutingRegistry::new();
        registry.load(forward_binding("tf")).unwrap();
        registry.update_requested_device_ids();

        let mut cache = DeviceCache::new();
        cache.merge(vec![Device::new(
            "elbow",
            "physics",
            JointState {
                position: 1.25,
                ..JointState::default()
            },
        )]);
        registry.set_engine_output("physics", &cache);

        let mut runtime = forward_runtime();
        assert!(registry.execute_active_linked("physics", &mut runtime).unwrap().is_empty());

        let out = registry.execute_active_linked("brain", &mut runtime).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload::<JointState>().map(|j| j.position), Some(1.25));
    }

    #[test]
    fn test_failure_is_wrapped_with_function_name() {
        let mut registry = RoutingRegistry::new();
        registry
            .load(RoutingBinding::new("explode", "brain", RequestChain::function("boom")))
            .unwrap();
        let mut runtime =
            NativeScriptRuntime::new().with("boom", |_args| Err("kaboom".to_string()));

        let err = registry
            .execute_active_linked("brain", &mut runtime)
            .unwrap_err();
        assert_eq!(err.function_name(), "explode");
        assert!(err.to_string().contains("explode"));
        assert!(err.to_string().contains("kaboom"));
    }
}
