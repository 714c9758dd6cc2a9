//! Cluster telemetry: rolling metrics, the passive cluster monitor and the
//! advisory autoscaler.

pub mod autoscaler;
pub mod metrics;
pub mod monitor;

pub use autoscaler::{Autoscaler, ScaleDecision};
pub use metrics::{ChainHealth, ClusterMetrics, CycleSample, RollingWindow};
pub use monitor::ClusterMonitor;
