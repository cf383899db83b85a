//! Agent pool manager.
//!
//! Keeps every zone's idle capacity between `min_idle` and `max_idle` by
//! provisioning instances in batches and retiring surplus idle agents, and
//! deletes instances that are no longer needed. Runs on its own timer,
//! independent of scheduling.

use crate::agents::{AgentRegistry, ZoneStats};
use crate::config::PoolConfig;
use chrono::Utc;
use dashmap::DashMap;
use sluice_core::agent::{Agent, Assignment, Instance, InstanceStatus, Zone};
use sluice_core::events::*;
use sluice_core::ids::AgentId;
use sluice_core::ports::{EventBus, InstanceProvider};
use sluice_core::status::AgentStatus;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Instances requested per zone.
    pub requested: HashMap<String, usize>,
    /// Idle agents retired per zone.
    pub retired: HashMap<String, usize>,
}

pub struct PoolManager {
    registry: Arc<AgentRegistry>,
    provider: Arc<dyn InstanceProvider>,
    bus: Arc<dyn EventBus>,
    config: PoolConfig,
    in_flight: DashMap<String, Arc<AtomicUsize>>,
    cleanup: DashMap<String, Instance>,
    serial: AtomicU64,
    lost: Option<mpsc::UnboundedSender<(AgentId, Assignment)>>,
}

impl PoolManager {
    pub fn new(
        registry: Arc<AgentRegistry>,
        provider: Arc<dyn InstanceProvider>,
        bus: Arc<dyn EventBus>,
        config: PoolConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            bus,
            config,
            in_flight: DashMap::new(),
            cleanup: DashMap::new(),
            serial: AtomicU64::new(0),
            lost: None,
        }
    }

    /// Hand steps interrupted by a failed health check straight to the
    /// scheduler, see [`crate::JobScheduler::lost_agents`].
    pub fn with_lost_agents(mut self, lost: mpsc::UnboundedSender<(AgentId, Assignment)>) -> Self {
        self.lost = Some(lost);
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn zones(&self) -> &[Zone] {
        &self.config.zones
    }

    /// Provisioning calls started but not yet finished.
    pub fn in_flight(&self, zone: &str) -> usize {
        self.in_flight
            .get(zone)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Instances waiting to be deleted.
    pub fn pending_cleanup(&self) -> Vec<Instance> {
        self.cleanup.iter().map(|i| i.value().clone()).collect()
    }

    fn counter(&self, zone: &str) -> Arc<AtomicUsize> {
        self.in_flight
            .entry(zone.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    /// One reconciliation pass over every zone.
    ///
    /// Provisioning is fire-and-forget: requests run on their own tasks and
    /// register an agent when they succeed. Failures are retried on a later
    /// pass.
    pub async fn reconcile_once(self: &Arc<Self>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for zone in &self.config.zones {
            if !zone.is_available() {
                debug!(zone = %zone.name, "Zone has no image, skipping");
                continue;
            }

            let stats = self.registry.zone_stats(&zone.name);
            let in_flight = self.in_flight(&zone.name);

            if stats.idle + in_flight <= zone.min_idle {
                let requested = self.scale_up(zone, stats).await;
                if requested > 0 {
                    report.requested.insert(zone.name.clone(), requested);
                }
            } else if stats.idle > zone.max_idle {
                let retired = self.scale_down(zone, stats.idle - zone.max_idle).await;
                if retired > 0 {
                    report.retired.insert(zone.name.clone(), retired);
                }
            }
        }

        report
    }

    async fn scale_up(self: &Arc<Self>, zone: &Zone, stats: ZoneStats) -> usize {
        let known = match self.provider.list_instances(&zone.name).await {
            Ok(instances) => instances
                .iter()
                .filter(|i| i.status != InstanceStatus::Terminated)
                .count(),
            Err(e) => {
                warn!(zone = %zone.name, error = %e, "Failed to list instances, using agent count");
                stats.total()
            }
        };

        let counter = self.counter(&zone.name);
        let occupied = known + counter.load(Ordering::Acquire);
        let count = zone.batch_size.min(zone.max_instances.saturating_sub(occupied));
        if count == 0 {
            warn!(
                zone = %zone.name,
                max_instances = zone.max_instances,
                "Zone at instance limit, not provisioning"
            );
            return 0;
        }

        info!(
            zone = %zone.name,
            idle = stats.idle,
            count,
            "Idle capacity low, provisioning instances"
        );

        for _ in 0..count {
            counter.fetch_add(1, Ordering::AcqRel);
            let name = self.instance_name(&zone.name);
            let pool = self.clone();
            let zone = zone.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                pool.provision(&zone, name).await;
                counter.fetch_sub(1, Ordering::AcqRel);
            });
        }

        count
    }

    fn instance_name(&self, zone: &str) -> String {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        format!("sluice-{}-{}-{}", zone, Utc::now().format("%Y%m%d%H%M%S"), serial)
    }

    async fn provision(&self, zone: &Zone, name: String) {
        let timeout = Duration::from_secs(self.config.provision_timeout_secs);
        let result = tokio::time::timeout(timeout, self.provider.start_instance(zone, &name)).await;

        let error = match result {
            Ok(Ok(instance)) if instance.status == InstanceStatus::Running => {
                let agent = Agent::new(name.clone(), zone.name.clone())
                    .with_tags(zone.tags.iter().cloned())
                    .with_instance(instance.clone());
                match self.registry.register(agent).await {
                    Ok(slot) => {
                        info!(
                            zone = %zone.name,
                            instance_id = %instance.id,
                            agent_id = %slot.id(),
                            "Instance provisioned"
                        );
                        self.publish(Event::InstanceProvisioned(InstanceProvisionedPayload {
                            zone: zone.name.clone(),
                            instance_id: instance.id,
                            name,
                            timestamp: Utc::now(),
                        }))
                        .await;
                        return;
                    }
                    Err(e) => {
                        self.cleanup.insert(instance.id.clone(), instance);
                        e.to_string()
                    }
                }
            }
            Ok(Ok(instance)) => {
                let error = format!("instance {} not running: {:?}", instance.id, instance.status);
                self.cleanup.insert(instance.id.clone(), instance);
                error
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}s", timeout.as_secs()),
        };

        warn!(zone = %zone.name, instance = %name, error = %error, "Instance provisioning failed");
        self.publish(Event::InstanceProvisionFailed(InstanceProvisionFailedPayload {
            zone: zone.name.clone(),
            name,
            error,
            timestamp: Utc::now(),
        }))
        .await;
    }

    /// Retire up to `excess` idle agents, newest first. Agents reserved in
    /// the meantime are left alone.
    async fn scale_down(&self, zone: &Zone, excess: usize) -> usize {
        let mut retired = 0;
        let idle: Vec<_> = self
            .registry
            .zone_slots(&zone.name)
            .into_iter()
            .rev()
            .filter(|s| s.status() == AgentStatus::Idle)
            .collect();

        for slot in idle {
            if retired == excess {
                break;
            }
            if let Err(e) = self.registry.retire_idle(slot.id()).await {
                debug!(agent_id = %slot.id(), error = %e, "Agent not retired");
                continue;
            }
            if let Some(agent) = self.registry.remove(slot.id())
                && let Some(instance) = agent.instance
            {
                self.cleanup.insert(instance.id.clone(), instance);
            }
            retired += 1;
        }

        if retired > 0 {
            info!(zone = %zone.name, retired, "Retired surplus idle agents");
        }
        retired
    }

    /// Health check. Agents whose session expired go offline and the steps
    /// they were running are reported as lost. Agents that stayed offline
    /// past the grace period are removed and their instances queued for
    /// deletion. Returns the interrupted assignments.
    pub async fn sweep_sessions(&self) -> Vec<(AgentId, Assignment)> {
        let session_timeout = self.config.session_timeout();
        let lost: Vec<(AgentId, Assignment)> = self
            .registry
            .sweep_stale(session_timeout)
            .await
            .into_iter()
            .filter_map(|(id, assignment)| assignment.map(|a| (id, a)))
            .collect();

        if let Some(sender) = &self.lost {
            for item in &lost {
                if sender.send(item.clone()).is_err() {
                    warn!(agent_id = %item.0, "Scheduler gone, dropping lost agent");
                }
            }
        }

        let grace = Duration::from_secs(self.config.agent_offline_grace_secs);
        for agent in self.registry.remove_offline(session_timeout + grace) {
            if let Some(instance) = agent.instance {
                debug!(agent_id = %agent.id, instance_id = %instance.id, "Queueing instance of dead agent for cleanup");
                self.cleanup.insert(instance.id.clone(), instance);
            }
        }
        lost
    }

    /// Delete instances on the cleanup list, then stopped instances that
    /// outlived `instance_max_alive_secs`. Returns the number deleted.
    pub async fn cleanup_once(&self) -> usize {
        let mut deleted = 0;

        for instance in self.pending_cleanup() {
            if self.delete(&instance).await {
                self.cleanup.remove(&instance.id);
                deleted += 1;
            }
        }

        let max_alive = chrono::Duration::seconds(self.config.instance_max_alive_secs as i64);
        let now = Utc::now();
        for zone in &self.config.zones {
            let instances = match self.provider.list_instances(&zone.name).await {
                Ok(instances) => instances,
                Err(e) => {
                    warn!(zone = %zone.name, error = %e, "Failed to list instances for cleanup");
                    continue;
                }
            };
            for instance in instances {
                if instance.status == InstanceStatus::Stopped
                    && now - instance.created_at >= max_alive
                    && self.delete(&instance).await
                {
                    deleted += 1;
                }
            }
        }

        deleted
    }

    async fn delete(&self, instance: &Instance) -> bool {
        match self.provider.delete_instance(instance).await {
            Ok(()) => {
                info!(zone = %instance.zone, instance_id = %instance.id, "Instance deleted");
                self.publish(Event::InstanceDeleted(InstanceDeletedPayload {
                    zone: instance.zone.clone(),
                    instance_id: instance.id.clone(),
                    timestamp: Utc::now(),
                }))
                .await;
                true
            }
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Failed to delete instance");
                false
            }
        }
    }

    /// Run reconciliation, session sweeps and cleanup until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut reconcile = interval(self.config.reconcile_interval());
        let mut cleanup = interval(self.config.cleanup_interval());
        info!(
            zones = self.config.zones.len(),
            provider = %self.provider.name(),
            interval_secs = self.config.reconcile_interval_secs,
            "Starting pool manager"
        );

        loop {
            tokio::select! {
                _ = reconcile.tick() => {
                    self.sweep_sessions().await;
                    let report = self.reconcile_once().await;
                    debug!(?report, "Reconciliation pass finished");
                }
                _ = cleanup.tick() => {
                    let deleted = self.cleanup_once().await;
                    debug!(deleted, "Cleanup pass finished");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Pool manager shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "Failed to publish pool event");
        }
    }
}
