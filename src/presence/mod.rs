// Multi-connection presence: user -> set of live connections, mirrored into
// the cache so presence survives failover to another instance.

pub mod tracker;

pub use tracker::PresenceTracker;
