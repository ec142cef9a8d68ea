//! Periodic instance probing and health classification.

use super::{HealthRegistry, HealthState, HealthStatus};
use crate::backend::{AlertSeverity, AlertSink, InstanceProbe, ProbeReading};
use crate::config::{DbAccessConfig, HealthSettings};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct MonitoredInstance {
    id: String,
    endpoint: String,
    is_primary: bool,
}

/// Runs one probe loop per instance. Loops are independent tasks with a
/// bounded per-probe timeout, so a hung instance cannot delay the others.
pub struct HealthMonitor {
    settings: HealthSettings,
    instances: Vec<MonitoredInstance>,
    probe: Arc<dyn InstanceProbe>,
    alerts: Arc<dyn AlertSink>,
    registry: Arc<HealthRegistry>,
}

impl HealthMonitor {
    pub fn new(
        config: &DbAccessConfig,
        probe: Arc<dyn InstanceProbe>,
        alerts: Arc<dyn AlertSink>,
        registry: Arc<HealthRegistry>,
    ) -> Self {
        let mut instances = vec![MonitoredInstance {
            id: config.instances.primary.id.clone(),
            endpoint: config.instances.primary.endpoint.clone(),
            is_primary: true,
        }];
        for replica in &config.instances.replicas {
            instances.push(MonitoredInstance {
                id: replica.id.clone(),
                endpoint: replica.endpoint.clone(),
                is_primary: false,
            });
        }
        Self {
            settings: config.health.clone(),
            instances,
            probe,
            alerts,
            registry,
        }
    }

    /// Spawn one probe loop per instance.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.instances
            .iter()
            .cloned()
            .map(|instance| {
                let monitor = Arc::clone(self);
                tokio::spawn(async move { monitor.run_instance(instance).await })
            })
            .collect()
    }

    async fn run_instance(&self, instance: MonitoredInstance) {
        let mut tick = tokio::time::interval(self.settings.probe_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_success: Option<Instant> = None;
        let mut response_baseline_ms = 0.0_f64;
        let mut failover_alerted = false;

        loop {
            tick.tick().await;

            let reading = match tokio::time::timeout(
                self.settings.probe_timeout(),
                self.probe.probe(&instance.id, &instance.endpoint),
            )
            .await
            {
                Ok(Ok(reading)) => reading,
                Ok(Err(e)) => {
                    warn!(instance = %instance.id, error = %e, "probe failed, retrying next tick");
                    ProbeReading::disconnected()
                }
                Err(_) => {
                    warn!(instance = %instance.id, "probe timed out, retrying next tick");
                    ProbeReading::disconnected()
                }
            };

            if reading.connected {
                last_success = Some(Instant::now());
                response_baseline_ms = if response_baseline_ms == 0.0 {
                    reading.response_time_ms
                } else {
                    // EWMA baseline for response-time degradation detection.
                    response_baseline_ms * 0.8 + reading.response_time_ms * 0.2
                };
            }
            let stale = last_success
                .map(|at| at.elapsed() >= self.settings.stale_after())
                .unwrap_or(false);

            let verdict = classify(&self.settings, &reading, stale);
            debug!(instance = %instance.id, ?verdict, connected = reading.connected,
                   lag = reading.replication_lag_secs, "probe completed");

            self.registry.publish(HealthStatus {
                instance_id: instance.id.clone(),
                checked_at: Utc::now(),
                connected: reading.connected,
                replication_lag_secs: reading.replication_lag_secs,
                cpu_percent: reading.cpu_percent,
                memory_percent: reading.memory_percent,
                disk_percent: reading.disk_percent,
                response_time_ms: reading.response_time_ms,
                verdict,
            });

            if instance.is_primary {
                if verdict == HealthState::Unhealthy {
                    if !failover_alerted {
                        failover_alerted = true;
                        self.alerts
                            .notify(
                                AlertSeverity::Critical,
                                &format!(
                                    "primary {} is unhealthy, initiate failover",
                                    instance.id
                                ),
                            )
                            .await;
                    }
                } else {
                    failover_alerted = false;
                }
            } else {
                let weight = derive_weight(
                    &self.settings,
                    reading.cpu_percent,
                    reading.response_time_ms,
                    response_baseline_ms,
                    reading.replication_lag_secs,
                );
                self.registry.update_replica(&instance.id, |replica| {
                    replica.cpu_percent = reading.cpu_percent;
                    replica.p95_response_ms = reading.response_time_ms;
                    replica.replication_lag_secs = reading.replication_lag_secs;
                    replica.health = verdict;
                    replica.weight = weight;
                });
            }
        }
    }
}

/// Classify a probe reading against the configured thresholds.
pub(crate) fn classify(
    settings: &HealthSettings,
    reading: &ProbeReading,
    stale: bool,
) -> HealthState {
    if !reading.connected
        || stale
        || reading.replication_lag_secs >= settings.unhealthy_lag_secs
        || reading.cpu_percent >= settings.unhealthy_cpu_percent
        || reading.memory_percent >= settings.unhealthy_memory_percent
        || reading.disk_percent >= settings.unhealthy_disk_percent
    {
        HealthState::Unhealthy
    } else if reading.cpu_percent >= settings.degraded_cpu_percent
        || reading.replication_lag_secs >= settings.degraded_lag_secs
    {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

/// Derive a balancing weight, monotone decreasing in CPU pressure,
/// response-time degradation over the rolling baseline, and lag over the
/// degraded threshold. Clamped to 0..=100.
pub(crate) fn derive_weight(
    settings: &HealthSettings,
    cpu_percent: f64,
    response_time_ms: f64,
    baseline_ms: f64,
    lag_secs: f64,
) -> u8 {
    let mut weight = 100.0_f64;
    if cpu_percent > settings.degraded_cpu_percent {
        weight -= 2.0 * (cpu_percent - settings.degraded_cpu_percent);
    }
    if baseline_ms > 0.0 && response_time_ms > baseline_ms {
        let degradation = (response_time_ms - baseline_ms) / baseline_ms;
        weight -= (degradation * 25.0).min(50.0);
    }
    if lag_secs > settings.degraded_lag_secs {
        weight -= 4.0 * (lag_secs - settings.degraded_lag_secs);
    }
    weight.clamp(0.0, 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{LogAlerts, StaticProbe};
    use crate::config::InstanceConfig;
    use proptest::prelude::*;
    use std::time::Duration;

    fn reading(cpu: f64, lag: f64) -> ProbeReading {
        ProbeReading {
            connected: true,
            replication_lag_secs: lag,
            cpu_percent: cpu,
            memory_percent: 30.0,
            disk_percent: 20.0,
            response_time_ms: 2.0,
        }
    }

    #[test]
    fn classification_thresholds() {
        let settings = HealthSettings::default();
        assert_eq!(
            classify(&settings, &reading(10.0, 0.0), false),
            HealthState::Healthy
        );
        assert_eq!(
            classify(&settings, &reading(85.0, 0.0), false),
            HealthState::Degraded
        );
        assert_eq!(
            classify(&settings, &reading(10.0, 6.0), false),
            HealthState::Degraded
        );
        assert_eq!(
            classify(&settings, &reading(96.0, 0.0), false),
            HealthState::Unhealthy
        );
        assert_eq!(
            classify(&settings, &reading(10.0, 31.0), false),
            HealthState::Unhealthy
        );
        assert_eq!(
            classify(&settings, &ProbeReading::disconnected(), false),
            HealthState::Unhealthy
        );
        // A nominally fine reading is unhealthy once probes have been stale too long.
        assert_eq!(
            classify(&settings, &reading(10.0, 0.0), true),
            HealthState::Unhealthy
        );
    }

    #[test]
    fn weight_decreases_with_cpu_and_lag() {
        let settings = HealthSettings::default();
        assert_eq!(derive_weight(&settings, 50.0, 2.0, 2.0, 0.0), 100);
        assert_eq!(derive_weight(&settings, 90.0, 2.0, 2.0, 0.0), 80);
        assert!(derive_weight(&settings, 90.0, 2.0, 2.0, 10.0) < 80);
        // Saturates at zero instead of wrapping.
        assert_eq!(derive_weight(&settings, 200.0, 2.0, 2.0, 100.0), 0);
    }

    proptest! {
        #[test]
        fn weight_monotone_in_cpu(cpu_a in 80.0_f64..130.0, delta in 0.5_f64..20.0) {
            let settings = HealthSettings::default();
            let lower = derive_weight(&settings, cpu_a + delta, 2.0, 2.0, 0.0);
            let higher = derive_weight(&settings, cpu_a, 2.0, 2.0, 0.0);
            prop_assert!(lower <= higher);
        }

        #[test]
        fn weight_always_in_range(cpu in 0.0_f64..300.0, rt in 0.0_f64..1000.0, lag in 0.0_f64..600.0) {
            let settings = HealthSettings::default();
            let weight = derive_weight(&settings, cpu, rt, 1.0, lag);
            prop_assert!(weight <= 100);
        }
    }

    fn fast_config() -> DbAccessConfig {
        let mut config = DbAccessConfig::default();
        config.health.probe_interval_ms = 20;
        config.health.probe_timeout_ms = 50;
        config.health.stale_after_ms = 200;
        config.instances.primary = InstanceConfig {
            id: "primary".into(),
            endpoint: "db://primary".into(),
        };
        config.instances.replicas.push(InstanceConfig {
            id: "r1".into(),
            endpoint: "db://r1".into(),
        });
        config
    }

    #[tokio::test]
    async fn monitor_publishes_and_updates_replica_weight() {
        let config = fast_config();
        let probe = Arc::new(StaticProbe::new());
        probe.set_reading("r1", reading(90.0, 0.0));
        let alerts = Arc::new(LogAlerts::new());
        let registry = Arc::new(HealthRegistry::new(&config));
        let monitor = Arc::new(HealthMonitor::new(
            &config,
            probe.clone() as Arc<dyn InstanceProbe>,
            alerts.clone() as Arc<dyn AlertSink>,
            Arc::clone(&registry),
        ));
        let tasks = monitor.spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let replica = registry.replica("r1").unwrap();
        assert_eq!(replica.health, HealthState::Degraded);
        assert_eq!(replica.weight, 80);
        assert!(registry.status("primary").is_some());

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn primary_failure_fires_one_failover_alert() {
        let config = fast_config();
        let probe = Arc::new(StaticProbe::new());
        probe.set_down("primary");
        let alerts = Arc::new(LogAlerts::new());
        let registry = Arc::new(HealthRegistry::new(&config));
        let monitor = Arc::new(HealthMonitor::new(
            &config,
            probe.clone() as Arc<dyn InstanceProbe>,
            alerts.clone() as Arc<dyn AlertSink>,
            Arc::clone(&registry),
        ));
        let tasks = monitor.spawn();

        // Three probe intervals elapse; the alert must fire on the first
        // failed probe and must not repeat while the episode lasts.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let messages = alerts.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, AlertSeverity::Critical);
        assert!(messages[0].1.contains("failover"));
        assert_eq!(
            registry.status("primary").unwrap().verdict,
            HealthState::Unhealthy
        );

        for task in tasks {
            task.abort();
        }
    }
}
