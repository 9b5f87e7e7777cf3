//! Boundary to whatever executes routing function bodies.

use std::collections::HashMap;
use std::fmt;

use super::RoutingArgs;
use crate::device::Device;

/// Errors raised inside a script runtime.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Function '{function}' is not defined in the script runtime")]
    FunctionNotFound { function: String },

    #[error("{message}")]
    Failed { message: String },
}

/// Runs routing function bodies.
///
/// All functions share the runtime's state, so calls are made one at a
/// time through `&mut self`.
pub trait ScriptRuntime: Send {
    /// Calls `function` with device arguments and returns the devices to deliver.
    ///
    /// # Errors
    ///
    /// - `ScriptError::FunctionNotFound` - No such function
    /// - `ScriptError::Failed` - The function raised an error
    fn call(&mut self, function: &str, args: RoutingArgs) -> Result<Vec<Device>, ScriptError>;

    /// Whether `function` can be called.
    fn has_function(&self, function: &str) -> bool;
}

type NativeFunction = Box<dyn FnMut(RoutingArgs) -> Result<Vec<Device>, String> + Send>;

/// Runtime whose functions are Rust closures registered by name.
#[derive(Default)]
pub struct NativeScriptRuntime {
    functions: HashMap<String, NativeFunction>,
}

impl NativeScriptRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `function` under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: FnMut(RoutingArgs) -> Result<Vec<Device>, String> + Send + 'static,
    {
        self.functions.insert(name.into(), Box::new(function));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: FnMut(RoutingArgs) -> Result<Vec<Device>, String> + Send + 'static,
    {
        self.register(name, function);
        self
    }
}

impl ScriptRuntime for NativeScriptRuntime {
    fn call(&mut self, function: &str, args: RoutingArgs) -> Result<Vec<Device>, ScriptError> {
        let body = self
            .functions
            .get_mut(function)
            .ok_or_else(|| ScriptError::FunctionNotFound {
                function: function.to_string(),
            })?;
        body(args).map_err(|message| ScriptError::Failed { message })
    }

    fn has_function(&self, function: &str) -> bool {
        self.functions.contains_key(function)
    }
}

impl fmt::Debug for NativeScriptRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("NativeScriptRuntime")
            .field("functions", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::JointState;

    #[test]
    fn test_registered_closure_keeps_state() {
        let mut calls = 0;
        let mut runtime = NativeScriptRuntime::new().with("count", move |_args| {
            calls += 1;
            Ok(vec![Device::new(
                "counter",
                "brain",
                JointState {
                    position: f64::from(calls),
                    ..JointState::default()
                },
            )])
        });

        runtime.call("count", RoutingArgs::new()).unwrap();
        let out = runtime.call("count", RoutingArgs::new()).unwrap();
        assert_eq!(out[0].payload::<JointState>().map(|j| j.position), Some(2.0));
    }

    #[test]
    fn test_unknown_and_failing_functions() {
        let mut runtime =
            NativeScriptRuntime::new().with("broken", |_args| Err("division by zero".to_string()));

        assert!(runtime.has_function("broken"));
        assert!(matches!(
            runtime.call("absent", RoutingArgs::new()),
            Err(ScriptError::FunctionNotFound { .. })
        ));
        let err = runtime.call("broken", RoutingArgs::new()).unwrap_err();
        assert_eq!(err.to_string(), "division by zero");
    }
}
