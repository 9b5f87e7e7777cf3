//! Time-ordered queue of engines awaiting their next completion.

use std::collections::BTreeMap;

use crate::time::SimulationTime;

/// Multimap from expected completion time to engine index.
///
/// Engines sharing a key keep their insertion order.
#[derive(Debug, Clone, Default)]
pub struct EngineQueue {
    entries: BTreeMap<SimulationTime, Vec<usize>>,
    len: usize,
}

impl EngineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue holding every engine index in `0..count` at time zero.
    pub fn with_all_at_zero(count: usize) -> Self {
        let mut queue = Self::new();
        for index in 0..count {
            queue.insert(SimulationTime::zero(), index);
        }
        queue
    }

    pub fn insert(&mut self, time: SimulationTime, engine: usize) {
        self.entries.entry(time).or_default().push(engine);
        self.len += 1;
    }

    /// Earliest expected completion time.
    pub fn peek_time(&self) -> Option<SimulationTime> {
        self.entries.keys().next().copied()
    }

    /// Pops every engine whose key lies within `tolerance` of the minimum.
    ///
    /// Returns the last key popped together with the engines, in key then
    /// insertion order. A zero tolerance pops exactly the minimum key.
    pub fn pop_batch(
        &mut self,
        tolerance: SimulationTime,
    ) -> Option<(SimulationTime, Vec<usize>)> {
        let first = self.peek_time()?;
        let limit = first + tolerance;

        let mut batch = Vec::new();
        let mut batch_time = first;
        while let Some(entry) = self.entries.first_entry() {
            if *entry.key() > limit {
                break;
            }
            batch_time = *entry.key();
            batch.extend(entry.remove());
        }

        self.len -= batch.len();
        Some((batch_time, batch))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `engine` is queued, and at which time.
    pub fn time_of(&self, engine: usize) -> Option<SimulationTime> {
        self.entries
            .iter()
            .find(|(_, engines)| engines.contains(&engine))
            .map(|(time, _)| *time)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }
}
