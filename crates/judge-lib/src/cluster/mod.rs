//! Cluster membership: heartbeats and the hash ring that shards PULL rules

pub mod heartbeat;
pub mod ring;

pub use heartbeat::{Heartbeat, HeartbeatConfig, InstanceRegistry, StaticRegistry};
pub use ring::{HashRing, RingHandle, DEFAULT_REPLICAS};
