//! Per-engine output cache kept sorted by device name.

use super::Device;

/// Output devices last fetched from one engine.
///
/// Sorted by name with at most one entry per name. New results are merged
/// in a single linear pass over the existing and incoming sequences.
#[derive(Debug, Clone, Default)]
pub struct DeviceCache {
    devices: Vec<Device>,
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges fetched devices into the cache.
    ///
    /// An incoming device replaces the cached entry of the same name,
    /// otherwise it is inserted in order. When `incoming` itself repeats a
    /// name, the later entry wins.
    pub fn merge(&mut self, mut incoming: Vec<Device>) {
        if incoming.is_empty() {
            return;
        }

        // Stable sort keeps arrival order among equal names.
        incoming.sort_by(|a, b| a.name().cmp(b.name()));
        let incoming = dedup_keep_last(incoming);

        let existing = std::mem::take(&mut self.devices);
        let mut merged = Vec::with_capacity(existing.len() + incoming.len());
        let mut old = existing.into_iter().peekable();
        let mut new = incoming.into_iter().peekable();

        loop {
            match (old.peek(), new.peek()) {
                (Some(o), Some(n)) => match o.name().cmp(n.name()) {
                    std::cmp::Ordering::Less => merged.extend(old.next()),
                    std::cmp::Ordering::Greater => merged.extend(new.next()),
                    std::cmp::Ordering::Equal => {
                        old.next();
                        merged.extend(new.next());
                    }
                },
                (Some(_), None) => {
                    merged.extend(old);
                    break;
                }
                (None, _) => {
                    merged.extend(new);
                    break;
                }
            }
        }

        self.devices = merged;
    }

    /// Looks up a cached device by name.
    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices
            .binary_search_by(|d| d.name().cmp(name))
            .ok()
            .map(|index| &self.devices[index])
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

fn dedup_keep_last(sorted: Vec<Device>) -> Vec<Device> {
    let mut out: Vec<Device> = Vec::with_capacity(sorted.len());
    for device in sorted {
        match out.last_mut() {
            Some(last) if last.name() == device.name() => *last = device,
            _ => out.push(device),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::device::JointState;

    fn joint(name: &str, position: f64) -> Device {
        Device::new(
            name,
            "physics",
            JointState {
                position,
                ..JointState::default()
            },
        )
    }

    fn position(cache: &DeviceCache, name: &str) -> Option<f64> {
        cache
            .get(name)
            .and_then(|d| d.payload::<JointState>())
            .map(|j| j.position)
    }

    #[test]
    fn test_merge_inserts_in_name_order() {
        let mut cache = DeviceCache::new();
        cache.merge(vec![joint("c", 1.0), joint("a", 2.0)]);
        cache.merge(vec![joint("b", 3.0), joint("d", 4.0)]);

        let names: Vec<_> = cache.devices().iter().map(Device::name).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_merge_replaces_equal_names() {
        let mut cache = DeviceCache::new();
        cache.merge(vec![joint("a", 1.0), joint("b", 1.0)]);
        cache.merge(vec![joint("b", 5.0)]);

        assert_eq!(cache.len(), 2);
        assert_eq!(position(&cache, "b"), Some(5.0));
        assert_eq!(position(&cache, "a"), Some(1.0));
    }

    #[test]
    fn test_duplicate_names_in_one_batch_last_wins() {
        let mut cache = DeviceCache::new();
        cache.merge(vec![joint("x", 1.0), joint("x", 2.0), joint("x", 3.0)]);

        assert_eq!(cache.len(), 1);
        assert_eq!(position(&cache, "x"), Some(3.0));
    }

    #[test]
    fn test_empty_merge_keeps_cache() {
        let mut cache = DeviceCache::new();
        cache.merge(vec![joint("a", 1.0)]);
        cache.merge(Vec::new());
        assert_eq!(cache.len(), 1);
        assert!(cache.get("missing").is_none());
    }

    proptest! {
        #[test]
        fn prop_cache_sorted_unique_last_write_wins(
            batches in prop::collection::vec(
                prop::collection::vec((0u8..12, -100i32..100), 0..10),
                0..8,
            )
        ) {
            let mut cache = DeviceCache::new();
            let mut expected = std::collections::BTreeMap::new();

            for batch in batches {
                let devices = batch
                    .iter()
                    .map(|(name, value)| joint(&format!("dev{name:02}"), f64::from(*value)))
                    .collect();
                for (name, value) in &batch {
                    expected.insert(format!("dev{name:02}"), f64::from(*value));
                }
                cache.merge(devices);

                let names: Vec<_> = cache.devices().iter().map(Device::name).collect();
                prop_assert!(names.windows(2).all(|w| w[0] < w[1]));
            }

            prop_assert_eq!(cache.len(), expected.len());
            for (name, value) in expected {
                prop_assert_eq!(position(&cache, &name), Some(value));
            }
        }
    }
}
