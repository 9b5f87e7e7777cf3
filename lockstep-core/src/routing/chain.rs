//! Device request chains.
//!
//! A chain is a linked list of request links ending in the function to
//! call. Each link contributes identifiers to the requested set and, at run
//! time, adds the matching devices to the call arguments before handing
//! over to the link it wraps.

use std::fmt;
use std::sync::Arc;

use super::{DeviceBuffer, RoutingArgs, RoutingError};
use crate::device::{DeviceIdentifier, DeviceIdentifiers};

/// Supplies identifiers that are only known at update time.
pub trait DeviceRequestProvider: Send + Sync {
    fn requested_ids(&self) -> DeviceIdentifiers;
}

impl<F> DeviceRequestProvider for F
where
    F: Fn() -> DeviceIdentifiers + Send + Sync,
{
    fn requested_ids(&self) -> DeviceIdentifiers {
        self()
    }
}

/// Link of a device request chain.
#[derive(Clone)]
pub enum RequestChain {
    /// Innermost link: the function run by the script runtime.
    Function { function: String },
    /// Injects one device as a named argument; missing devices are errors.
    Device {
        keyword: String,
        id: DeviceIdentifier,
        inner: Box<RequestChain>,
    },
    /// Appends whatever devices of a dynamic request are present as
    /// positional arguments.
    Dynamic {
        provider: Arc<dyn DeviceRequestProvider>,
        inner: Box<RequestChain>,
    },
}

impl RequestChain {
    /// Chain consisting only of the function.
    pub fn function(function: impl Into<String>) -> Self {
        RequestChain::Function {
            function: function.into(),
        }
    }

    /// Wraps the chain in a link injecting `id` as argument `keyword`.
    pub fn with_device(self, keyword: impl Into<String>, id: DeviceIdentifier) -> Self {
        RequestChain::Device {
            keyword: keyword.into(),
            id,
            inner: Box::new(self),
        }
    }

    /// Wraps the chain in a link whose identifiers are recomputed on update.
    pub fn with_dynamic(self, provider: impl DeviceRequestProvider + 'static) -> Self {
        RequestChain::Dynamic {
            provider: Arc::new(provider),
            inner: Box::new(self),
        }
    }

    /// Name of the function at the end of the chain.
    pub fn function_name(&self) -> &str {
        let mut link = self;
        loop {
            match link {
                RequestChain::Function { function } => return function,
                RequestChain::Device { inner, .. } | RequestChain::Dynamic { inner, .. } => {
                    link = inner;
                }
            }
        }
    }

    /// Union of the identifiers requested along the whole chain.
    pub fn requested_ids(&self) -> DeviceIdentifiers {
        let mut ids = DeviceIdentifiers::new();
        self.collect_ids(&mut ids);
        ids
    }

    fn collect_ids(&self, ids: &mut DeviceIdentifiers) {
        match self {
            RequestChain::Function { .. } => {}
            RequestChain::Device { id, inner, .. } => {
                ids.insert(id.clone());
                inner.collect_ids(ids);
            }
            RequestChain::Dynamic { provider, inner } => {
                ids.extend(provider.requested_ids());
                inner.collect_ids(ids);
            }
        }
    }

    /// Builds call arguments from the buffer, outermost link first.
    ///
    /// # Errors
    ///
    /// - `RoutingError::MissingDevice` - A named device is not in the buffer
    pub fn prepare_args(
        &self,
        buffer: &DeviceBuffer,
        args: &mut RoutingArgs,
    ) -> Result<(), RoutingError> {
        match self {
            RequestChain::Function { .. } => Ok(()),
            RequestChain::Device { keyword, id, inner } => {
                let device = buffer.get(id).ok_or_else(|| RoutingError::MissingDevice {
                    function: self.function_name().to_string(),
                    device: id.clone(),
                })?;
                args.named.insert(keyword.clone(), device.clone());
                inner.prepare_args(buffer, args)
            }
            RequestChain::Dynamic { provider, inner } => {
                args.positional.extend(
                    provider
                        .requested_ids()
                        .iter()
                        .filter_map(|id| buffer.get(id).cloned()),
                );
                inner.prepare_args(buffer, args)
            }
        }
    }
}

impl fmt::Debug for RequestChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestChain::Function { function } => {
                f.debug_struct("Function").field("function", function).finish()
            }
            RequestChain::Device { keyword, id, inner } => f
                .debug_struct("Device")
                .field("keyword", keyword)
                .field("id", id)
                .field("inner", inner)
                .finish(),
            RequestChain::Dynamic { inner, .. } => f
                .debug_struct("Dynamic")
                .field("inner", inner)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceCache, JointState};

    fn id(name: &str, engine: &str) -> DeviceIdentifier {
        DeviceIdentifier::new(name, engine, "physics_joint")
    }

    #[test]
    fn test_requested_ids_are_union_of_links() {
        let chain = RequestChain::function("forward")
            .with_device("a", id("a", "physics"))
            .with_device("b", id("b", "brain"))
            .with_device("a_again", id("a", "physics"))
            .with_dynamic(|| [id("c", "physics")].into_iter().collect::<DeviceIdentifiers>());

        let ids = chain.requested_ids();
        let names: Vec<_> = ids.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(chain.function_name(), "forward");
    }

    #[test]
    fn test_prepare_args_injects_named_and_dynamic() {
        let mut cache = DeviceCache::new();
        cache.merge(vec![
            Device::new("a", "physics", JointState::default()),
            Device::new("c", "physics", JointState::default()),
        ]);
        let mut buffer = DeviceBuffer::new();
        buffer.set_engine_output("physics", &cache);

        let chain = RequestChain::function("forward")
            .with_device("joint", id("a", "physics"))
            .with_dynamic(|| {
                [id("c", "physics"), id("gone", "physics")]
                    .into_iter()
                    .collect::<DeviceIdentifiers>()
            });

        let mut args = RoutingArgs::new();
        chain.prepare_args(&buffer, &mut args).unwrap();
        assert_eq!(args.get("joint").map(Device::name), Some("a"));
        assert_eq!(args.positional.len(), 1);
        assert_eq!(args.positional[0].name(), "c");
    }

    #[test]
    fn test_missing_named_device_names_function() {
        let chain = RequestChain::function("forward").with_device("joint", id("a", "physics"));

        let err = chain
            .prepare_args(&DeviceBuffer::new(), &mut RoutingArgs::new())
            .unwrap_err();
        assert!(
            matches!(err, RoutingError::MissingDevice { ref function, ref device }
                if function == "forward" && device.name == "a")
        );
    }
}
