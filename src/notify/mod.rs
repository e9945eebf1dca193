pub mod cluster;
pub mod effects;
pub mod engine;
pub mod error;
pub mod scratch;
pub mod wire;

#[cfg(test)]
pub(crate) mod testkit;

// The notification engine sits between the data store and the transport. A
// store mutation (a write that closes an item, a refcount that reaches zero)
// produces a NotifySet: close notifications for subscribed ranks, deferred
// reference-cell writes, and pending refcount deltas. Applying one effect can
// enqueue more of the others, so the set is drained as a fixed-point loop,
// never recursively.

// Servers own disjoint partitions of the item namespace and mediate all
// access; the last `servers` ranks of the communicator are servers and every
// worker maps deterministically to one of them. An effect whose target lives
// under this process is applied in place; everything else is packed into a
// deduplicating batch and shipped, either to the owning server or back to the
// requesting client when the engine is configured to hand off.

/// Stable integer id of an addressable item in the store.
pub type ItemId = i64;

/// Process rank within the cluster communicator.
pub type Rank = u32;

/// Longest subscript the wire encoding accepts. Anything larger is a bug in
/// the producer, not a runtime condition.
pub const MAX_SUBSCRIPT_LEN: usize = 1024;
