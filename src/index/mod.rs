//! Shard list loading and work partitioning.

mod partition;
mod shard_list;

pub use partition::WorkAssignment;
pub use shard_list::{ShardDescriptor, ShardEntry, ShardList};
