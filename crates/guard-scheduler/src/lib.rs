//! GUARD cluster runtime.
//!
//! [`Cluster::bootstrap`] assembles every component from configuration and
//! persisted state; [`Cluster::spawn`] starts the periodic tasks and returns
//! a [`ClusterHandle`] whose `shutdown` stops them and writes a final
//! snapshot.

pub mod cluster;
pub mod tasks;

pub use cluster::{Cluster, ClusterError, SweepReport};
pub use tasks::ClusterHandle;
