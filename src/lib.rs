//! GUARD: multi-chain validator consensus and cross-chain bridge
//! orchestration.
//!
//! The workspace crates carry the components; this crate re-exports them
//! and holds the node runtime behind the `guard-node` binary.

pub mod node;

pub use guard_consensus as consensus;
pub use guard_core::{ClusterConfig, ClusterEvent, ConfigurationError, EventBus, EventSink};
pub use guard_interop as interop;
pub use guard_scheduler::{Cluster, ClusterError, ClusterHandle};
pub use guard_state as state;
pub use guard_telemetry as telemetry;
