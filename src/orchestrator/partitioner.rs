//! Shard partitioning.
//!
//! The [`Partitioner`] groups test units into a fixed number of shards so
//! that the slowest shard (the makespan) is as short as possible, using the
//! Longest Processing Time heuristic:
//!
//! | Step | Rule |
//! |------|------|
//! | Order | Units sorted by estimate, longest first; equal estimates keep discovery order |
//! | Assign | Each unit goes to the shard with the smallest accumulated estimate |
//! | Ties | Fewer units first, then lowest shard id |
//!
//! LPT keeps the makespan within 4/3 of optimal. The output depends only on
//! the input order and estimates, never on timing.
//!
//! # Example
//!
//! ```
//! use shardsmith::discovery::TestUnit;
//! use shardsmith::orchestrator::Partitioner;
//!
//! let units: Vec<_> = [10.0, 8.0, 6.0, 4.0, 2.0]
//!     .iter()
//!     .enumerate()
//!     .map(|(i, d)| TestUnit::new(format!("t{}.test.js", i), *d))
//!     .collect();
//!
//! let shards = Partitioner::new(2).unwrap().partition(&units);
//! assert_eq!(shards[0].estimated_duration, 16.0);
//! assert_eq!(shards[1].estimated_duration, 14.0);
//! ```

use serde::Serialize;
use tracing::debug;

use crate::config::ConfigError;
use crate::discovery::TestUnit;

/// The set of units assigned to one shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardAssignment {
    /// 1-based shard id.
    pub id: usize,

    /// Unit paths in assignment order.
    pub units: Vec<String>,

    /// Sum of the assigned units' estimates.
    pub estimated_duration: f64,
}

impl ShardAssignment {
    fn new(id: usize) -> Self {
        Self {
            id,
            units: Vec::new(),
            estimated_duration: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Greedy LPT bin-packer for a fixed shard count.
#[derive(Debug, Clone)]
pub struct Partitioner {
    shard_count: usize,
}

impl Partitioner {
    /// # Errors
    ///
    /// [`ConfigError::InvalidConfiguration`] when `shard_count` is zero.
    pub fn new(shard_count: usize) -> Result<Self, ConfigError> {
        if shard_count == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "shard count must be at least 1".to_string(),
            ));
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Assigns every unit to exactly one shard.
    ///
    /// Always returns `shard_count` assignments with ids `1..=shard_count`;
    /// some are empty when there are fewer units than shards.
    pub fn partition(&self, units: &[TestUnit]) -> Vec<ShardAssignment> {
        let mut order: Vec<&TestUnit> = units.iter().collect();
        // Stable, so equal estimates keep discovery order.
        order.sort_by(|a, b| b.estimated_duration.total_cmp(&a.estimated_duration));

        let mut shards: Vec<ShardAssignment> =
            (1..=self.shard_count).map(ShardAssignment::new).collect();

        for unit in order {
            let target = Self::least_loaded(&shards);
            let shard = &mut shards[target];
            shard.units.push(unit.path.clone());
            shard.estimated_duration += unit.estimated_duration;
        }

        for shard in &shards {
            debug!(
                "Shard {}: {} units, estimated {:.2}s",
                shard.id,
                shard.units.len(),
                shard.estimated_duration
            );
        }

        shards
    }

    fn least_loaded(shards: &[ShardAssignment]) -> usize {
        let mut best = 0;
        for (i, shard) in shards.iter().enumerate().skip(1) {
            let current = &shards[best];
            let lighter = shard.estimated_duration < current.estimated_duration;
            let same_load = shard.estimated_duration == current.estimated_duration;
            if lighter || (same_load && shard.units.len() < current.units.len()) {
                best = i;
            }
        }
        best
    }
}

/// The largest estimated shard total.
pub fn estimated_makespan(shards: &[ShardAssignment]) -> f64 {
    shards
        .iter()
        .map(|s| s.estimated_duration)
        .fold(0.0, f64::max)
}
