//! Routing functions: user callables that move devices between engines.
//!
//! A [`RoutingBinding`] ties a callable to the engine whose step completion
//! triggers it, and declares the devices it reads through a
//! [`RequestChain`]. The [`RoutingRegistry`] recomputes requested devices,
//! buffers fetched engine outputs, and runs bindings through a
//! [`ScriptRuntime`], the only interface to whatever executes the user code.

pub mod chain;
pub mod registry;
pub mod results;
pub mod script;

use std::collections::{BTreeMap, HashMap};

pub use chain::{DeviceRequestProvider, RequestChain};
pub use registry::{RoutingBinding, RoutingRegistry};
pub use results::SortedResults;
pub use script::{NativeScriptRuntime, ScriptError, ScriptRuntime};

use crate::device::{Device, DeviceCache, DeviceIdentifier};

/// Positional and named device arguments handed to a routing function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingArgs {
    pub positional: Vec<Device>,
    pub named: BTreeMap<String, Device>,
}

impl RoutingArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Named argument by keyword.
    pub fn get(&self, keyword: &str) -> Option<&Device> {
        self.named.get(keyword)
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

/// Engine outputs visible to routing functions during one batch.
///
/// Filled from engine caches after devices are fetched and left untouched
/// while the batch's routing functions run.
#[derive(Debug, Clone, Default)]
pub struct DeviceBuffer {
    outputs: HashMap<String, DeviceCache>,
}

impl DeviceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot of one engine's outputs.
    pub fn set_engine_output(&mut self, engine: impl Into<String>, cache: &DeviceCache) {
        self.outputs.insert(engine.into(), cache.clone());
    }

    /// Looks a device up by owning engine and name.
    pub fn get(&self, id: &DeviceIdentifier) -> Option<&Device> {
        self.outputs
            .get(&id.engine_name)
            .and_then(|cache| cache.get(&id.name))
    }

    pub fn engine_output(&self, engine: &str) -> Option<&DeviceCache> {
        self.outputs.get(engine)
    }
}

/// Errors from loading or running routing functions.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Routing function '{name}' is already loaded")]
    DuplicateName { name: String },

    #[error("No routing function named '{name}'")]
    UnknownFunction { name: String },

    #[error("Routing function '{function}' couldn't find device with ID '{device}'")]
    MissingDevice {
        function: String,
        device: DeviceIdentifier,
    },

    #[error("Error occurred during execution of routing function '{name}': {source}")]
    FunctionFailed {
        name: String,
        #[source]
        source: ScriptError,
    },
}

impl RoutingError {
    /// Name of the routing function involved.
    pub fn function_name(&self) -> &str {
        match self {
            RoutingError::DuplicateName { name }
            | RoutingError::UnknownFunction { name }
            | RoutingError::FunctionFailed { name, .. } => name,
            RoutingError::MissingDevice { function, .. } => function,
        }
    }
}
