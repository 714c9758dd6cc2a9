// ADVISORY AUTOSCALER
// Turns sustained metric pressure into scale-intent events. Provisioning is
// left to an external orchestrator listening on `cluster.scale_intent`.
//
// SAFETY INVARIANTS:
// 1. An intent requires `sustain_cycles` consecutive samples agreeing
// 2. Streaks restart after every emitted intent
// 3. Nothing is published while auto-scaling is disabled

use crate::metrics::ClusterMetrics;
use guard_core::{AutoscalerConfig, ClusterEvent, EventBus, ScaleDirection};
use log::{debug, info};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct ScaleDecision {
    pub direction: ScaleDirection,
    pub reason: String,
    /// Whether the intent went out on the bus
    pub published: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pressure {
    High,
    Comfortable,
    Neutral,
}

#[derive(Default)]
struct Streaks {
    high: usize,
    comfortable: usize,
}

pub struct Autoscaler {
    config: AutoscalerConfig,
    enabled: bool,
    streaks: Mutex<Streaks>,
    bus: EventBus,
}

impl Autoscaler {
    pub fn new(config: AutoscalerConfig, enabled: bool, bus: EventBus) -> Self {
        Autoscaler { config, enabled, streaks: Mutex::new(Streaks::default()), bus }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn classify(&self, metrics: &ClusterMetrics) -> (Pressure, String) {
        let c = &self.config;
        let (latency, throughput) = (metrics.avg_latency_ms, metrics.throughput);
        if latency > c.latency_high_watermark_ms {
            let reason =
                format!("latency {:.0}ms above {:.0}ms", latency, c.latency_high_watermark_ms);
            return (Pressure::High, reason);
        }
        if throughput < c.throughput_low_watermark {
            let reason =
                format!("throughput {:.2}/s below {:.2}/s", throughput, c.throughput_low_watermark);
            return (Pressure::High, reason);
        }
        let latency_ok = latency <= c.latency_high_watermark_ms * c.comfort_ratio;
        let throughput_ok = throughput >= c.throughput_low_watermark / c.comfort_ratio;
        if latency_ok && throughput_ok {
            let reason = format!(
                "latency {:.0}ms and throughput {:.2}/s within bounds",
                latency, throughput
            );
            return (Pressure::Comfortable, reason);
        }
        (Pressure::Neutral, String::new())
    }

    /// Feed one sample. Returns a decision once a condition has held for
    /// `sustain_cycles` consecutive samples.
    pub fn evaluate(&self, metrics: &ClusterMetrics) -> Option<ScaleDecision> {
        let (pressure, reason) = self.classify(metrics);
        let direction = {
            let mut streaks = self.streaks.lock();
            match pressure {
                Pressure::High => {
                    streaks.high += 1;
                    streaks.comfortable = 0;
                }
                Pressure::Comfortable => {
                    streaks.comfortable += 1;
                    streaks.high = 0;
                }
                Pressure::Neutral => *streaks = Streaks::default(),
            }

            let sustain = self.config.sustain_cycles.max(1);
            if streaks.high >= sustain {
                *streaks = Streaks::default();
                ScaleDirection::Up
            } else if streaks.comfortable >= sustain {
                *streaks = Streaks::default();
                ScaleDirection::Down
            } else {
                debug!("[Autoscaler] cycle {} pressure {:?}", metrics.cycle, pressure);
                return None;
            }
        };

        if self.enabled {
            info!("[Autoscaler] scale {:?}: {}", direction, reason);
            self.bus.publish(ClusterEvent::ScaleIntent { direction, reason: reason.clone() });
        } else {
            debug!(
                "[Autoscaler] auto-scaling disabled, suppressing scale {:?}: {}",
                direction, reason
            );
        }
        Some(ScaleDecision { direction, reason, published: self.enabled })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn metrics(latency: f64, throughput: f64) -> ClusterMetrics {
        ClusterMetrics {
            cycle: 1,
            sampled_at: Utc::now(),
            throughput,
            avg_latency_ms: latency,
            success_rate: 1.0,
            rounds: 1,
            chains: Vec::new(),
            excluded_chains: Vec::new(),
            transfers_completed: 0,
            transfers_failed: 0,
            validators_slashed: 0,
        }
    }

    fn config() -> AutoscalerConfig {
        AutoscalerConfig {
            latency_high_watermark_ms: 1_000.0,
            throughput_low_watermark: 2.0,
            sustain_cycles: 3,
            comfort_ratio: 0.5,
            window: 4,
        }
    }

    #[tokio::test]
    async fn test_sustained_latency_emits_scale_up() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let scaler = Autoscaler::new(config(), true, bus);

        assert!(scaler.evaluate(&metrics(2_000.0, 10.0)).is_none());
        assert!(scaler.evaluate(&metrics(2_000.0, 10.0)).is_none());
        let decision = scaler.evaluate(&metrics(2_000.0, 10.0)).unwrap();
        assert_eq!(decision.direction, ScaleDirection::Up);
        assert!(decision.published);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ClusterEvent::ScaleIntent { direction: ScaleDirection::Up, .. }
        ));
    }

    #[test]
    fn test_interrupted_pressure_resets_streak() {
        let scaler = Autoscaler::new(config(), true, EventBus::new());
        scaler.evaluate(&metrics(2_000.0, 10.0));
        scaler.evaluate(&metrics(2_000.0, 10.0));
        // neutral: latency between comfort and watermark
        assert!(scaler.evaluate(&metrics(800.0, 10.0)).is_none());
        assert!(scaler.evaluate(&metrics(2_000.0, 10.0)).is_none());
    }

    #[test]
    fn test_low_throughput_counts_as_pressure() {
        let scaler = Autoscaler::new(config(), true, EventBus::new());
        for _ in 0..2 {
            assert!(scaler.evaluate(&metrics(10.0, 0.5)).is_none());
        }
        assert_eq!(scaler.evaluate(&metrics(10.0, 0.5)).unwrap().direction, ScaleDirection::Up);
    }

    #[test]
    fn test_comfortable_window_scales_down() {
        let scaler = Autoscaler::new(config(), true, EventBus::new());
        scaler.evaluate(&metrics(100.0, 10.0));
        scaler.evaluate(&metrics(100.0, 10.0));
        assert_eq!(scaler.evaluate(&metrics(100.0, 10.0)).unwrap().direction, ScaleDirection::Down);
        // streak restarted
        assert!(scaler.evaluate(&metrics(100.0, 10.0)).is_none());
    }

    #[test]
    fn test_disabled_autoscaler_publishes_nothing() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let scaler = Autoscaler::new(config(), false, bus);
        for _ in 0..2 {
            scaler.evaluate(&metrics(2_000.0, 10.0));
        }
        let decision = scaler.evaluate(&metrics(2_000.0, 10.0)).unwrap();
        assert!(!decision.published);
        assert!(rx.try_recv().is_err());
    }
}
