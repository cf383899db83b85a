//! Agent registry with atomic reservation.
//!
//! Agents live in per-zone lists of [`AgentSlot`]s. A slot's status is an
//! atomic; every status change runs through the agent state machine whose
//! action is a single compare-and-swap, so two callers can never both move
//! the same agent out of `Idle`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use sluice_core::agent::{Agent, AgentRequirement, Assignment};
use sluice_core::events::*;
use sluice_core::ids::AgentId;
use sluice_core::ports::EventBus;
use sluice_core::sm::{Action, Context, Outcome, StateMachine};
use sluice_core::status::AgentStatus;
use sluice_core::{Error, Result};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct AgentSlot {
    agent: Agent,
    status: AtomicU8,
    assignment: Mutex<Option<Assignment>>,
    last_heartbeat_ms: AtomicI64,
}

impl AgentSlot {
    fn new(agent: Agent) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            status: AtomicU8::new(AgentStatus::Idle.as_u8()),
            assignment: Mutex::new(None),
            last_heartbeat_ms: AtomicI64::new(now),
            agent,
        }
    }

    pub fn id(&self) -> AgentId {
        self.agent.id
    }

    pub fn zone(&self) -> &str {
        &self.agent.zone
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus::from_u8(self.status.load(Ordering::Acquire)).unwrap_or(AgentStatus::Offline)
    }

    pub fn assignment(&self) -> Option<Assignment> {
        self.assignment.lock().ok().and_then(|a| a.clone())
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.last_heartbeat_ms.load(Ordering::Relaxed))
            .single()
    }

    /// Current view with live status and assignment.
    pub fn snapshot(&self) -> Agent {
        let mut agent = self.agent.clone();
        agent.status = self.status();
        agent.assignment = self.assignment();
        agent.last_heartbeat_at = self.last_heartbeat();
        agent
    }
}

impl std::fmt::Debug for AgentSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSlot")
            .field("id", &self.agent.id)
            .field("zone", &self.agent.zone)
            .field("status", &self.status())
            .finish()
    }
}

/// Payload of an agent status transition.
struct AgentChange {
    slot: Arc<AgentSlot>,
    /// In: the assignment to bind when moving to `Busy`.
    /// Out: the assignment that was cleared when leaving `Busy`.
    assignment: Option<Assignment>,
}

struct SwapStatus;

#[async_trait]
impl Action<AgentStatus, AgentChange> for SwapStatus {
    async fn accept(&self, ctx: &mut Context<AgentStatus, AgentChange>) -> Result<()> {
        let (from, to) = (ctx.current(), ctx.to());
        let slot = ctx.payload.slot.clone();
        let mut assignment = slot
            .assignment
            .lock()
            .map_err(|_| Error::Internal("agent assignment lock poisoned".into()))?;

        slot.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| Error::StatusConflict {
                expected: from.to_string(),
                actual: AgentStatus::from_u8(actual)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| actual.to_string()),
            })?;

        let next = if to == AgentStatus::Busy {
            ctx.payload.assignment.take()
        } else {
            None
        };
        ctx.payload.assignment = std::mem::replace(&mut *assignment, next);
        Ok(())
    }
}

fn agent_machine() -> Result<StateMachine<AgentStatus, AgentChange>> {
    use AgentStatus::*;

    let swap: Arc<dyn Action<AgentStatus, AgentChange>> = Arc::new(SwapStatus);
    let mut sm = StateMachine::new("agent");
    sm.add_row(Idle, &[Busy, Offline], swap.clone())?;
    sm.add_row(Busy, &[Idle, Offline], swap.clone())?;
    sm.add_row(Offline, &[Idle], swap)?;
    Ok(sm)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneStats {
    pub idle: usize,
    pub busy: usize,
    pub offline: usize,
}

impl ZoneStats {
    pub fn total(&self) -> usize {
        self.idle + self.busy + self.offline
    }
}

pub struct AgentRegistry {
    slots: DashMap<AgentId, Arc<AgentSlot>>,
    zones: DashMap<String, Vec<Arc<AgentSlot>>>,
    machine: StateMachine<AgentStatus, AgentChange>,
    bus: Arc<dyn EventBus>,
}

impl AgentRegistry {
    pub fn new(bus: Arc<dyn EventBus>) -> Result<Self> {
        Ok(Self {
            slots: DashMap::new(),
            zones: DashMap::new(),
            machine: agent_machine()?,
            bus,
        })
    }

    /// Add an agent as idle. Registering a known id brings it back online.
    pub async fn register(&self, agent: Agent) -> Result<Arc<AgentSlot>> {
        if let Some(existing) = self.get(agent.id) {
            if existing.status() == AgentStatus::Offline {
                self.transition(&existing, AgentStatus::Offline, AgentStatus::Idle, None)
                    .await?;
            }
            existing.last_heartbeat_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            return Ok(existing);
        }

        let slot = Arc::new(AgentSlot::new(agent));
        self.slots.insert(slot.id(), slot.clone());
        self.zones
            .entry(slot.zone().to_string())
            .or_default()
            .push(slot.clone());

        info!(agent_id = %slot.id(), name = %slot.agent.name, zone = %slot.zone(), "Agent registered");
        self.publish(Event::AgentRegistered(AgentRegisteredPayload {
            agent_id: slot.id(),
            name: slot.agent.name.clone(),
            zone: slot.zone().to_string(),
            timestamp: Utc::now(),
        }))
        .await;

        Ok(slot)
    }

    pub fn get(&self, id: AgentId) -> Option<Arc<AgentSlot>> {
        self.slots.get(&id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots of a zone in registration order.
    pub fn zone_slots(&self, zone: &str) -> Vec<Arc<AgentSlot>> {
        self.zones.get(zone).map(|z| z.clone()).unwrap_or_default()
    }

    pub fn list(&self, zone: Option<&str>) -> Vec<Agent> {
        match zone {
            Some(zone) => self.zone_slots(zone).iter().map(|s| s.snapshot()).collect(),
            None => self.slots.iter().map(|s| s.snapshot()).collect(),
        }
    }

    pub fn zone_stats(&self, zone: &str) -> ZoneStats {
        let mut stats = ZoneStats::default();
        for slot in self.zone_slots(zone) {
            match slot.status() {
                AgentStatus::Idle => stats.idle += 1,
                AgentStatus::Busy => stats.busy += 1,
                AgentStatus::Offline => stats.offline += 1,
            }
        }
        stats
    }

    /// Reserve the first idle agent matching the requirement.
    ///
    /// Losing a race on one candidate moves on to the next; an empty result
    /// is `NoAgentAvailable`, which callers treat as "retry later".
    pub async fn reserve(&self, requirement: &AgentRequirement, assignment: Assignment) -> Result<Agent> {
        for slot in self.zone_slots(&requirement.zone) {
            if slot.status() != AgentStatus::Idle || !requirement.matches(&slot.agent) {
                continue;
            }
            match self
                .transition(&slot, AgentStatus::Idle, AgentStatus::Busy, Some(assignment.clone()))
                .await
            {
                Ok(_) => {
                    debug!(
                        agent_id = %slot.id(),
                        job_id = %assignment.job_id,
                        node = %assignment.node,
                        "Agent reserved"
                    );
                    return Ok(slot.snapshot());
                }
                Err(Error::StatusConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::NoAgentAvailable {
            zone: requirement.zone.clone(),
            tags: requirement.tags.iter().cloned().collect(),
        })
    }

    /// Busy -> Idle. Returns the assignment that was cleared. An agent that
    /// is not busy, e.g. one already taken offline, is left alone with
    /// `StatusConflict`.
    pub async fn release(&self, id: AgentId) -> Result<Option<Assignment>> {
        let slot = self
            .get(id)
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        let cleared = self
            .transition(&slot, AgentStatus::Busy, AgentStatus::Idle, None)
            .await?;
        debug!(agent_id = %id, "Agent released");
        Ok(cleared)
    }

    /// Take an agent offline. When it was busy, the interrupted assignment
    /// is returned and an `AgentLost` event is published.
    pub async fn mark_offline(&self, id: AgentId) -> Result<Option<Assignment>> {
        let slot = self
            .get(id)
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;

        let lost = loop {
            let from = slot.status();
            if from == AgentStatus::Offline {
                return Ok(None);
            }
            match self.transition(&slot, from, AgentStatus::Offline, None).await {
                Ok(cleared) => break cleared,
                Err(Error::StatusConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        };

        if let Some(assignment) = &lost {
            warn!(
                agent_id = %id,
                job_id = %assignment.job_id,
                node = %assignment.node,
                "Agent lost while running a step"
            );
            self.publish(Event::AgentLost(AgentLostPayload {
                agent_id: id,
                zone: slot.zone().to_string(),
                job_id: Some(assignment.job_id),
                node: Some(assignment.node.clone()),
                timestamp: Utc::now(),
            }))
            .await;
        }
        Ok(lost)
    }

    /// Offline -> Idle.
    pub async fn mark_online(&self, id: AgentId) -> Result<()> {
        let slot = self
            .get(id)
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        self.transition(&slot, AgentStatus::Offline, AgentStatus::Idle, None)
            .await?;
        slot.last_heartbeat_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        Ok(())
    }

    /// Idle -> Offline, for shrinking the pool. Fails if the agent was
    /// reserved in the meantime.
    pub async fn retire_idle(&self, id: AgentId) -> Result<()> {
        let slot = self
            .get(id)
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        self.transition(&slot, AgentStatus::Idle, AgentStatus::Offline, None)
            .await?;
        Ok(())
    }

    /// Drop an agent from the registry, e.g. after its instance is gone.
    pub fn remove(&self, id: AgentId) -> Option<Agent> {
        let (_, slot) = self.slots.remove(&id)?;
        if let Some(mut zone) = self.zones.get_mut(slot.zone()) {
            zone.retain(|s| s.id() != id);
        }
        info!(agent_id = %id, zone = %slot.zone(), "Agent removed");
        Some(slot.snapshot())
    }

    /// Remove offline agents that have been silent for longer than
    /// `silent_for`. Agents brought back online in the meantime stay.
    pub fn remove_offline(&self, silent_for: Duration) -> Vec<Agent> {
        let cutoff = Utc::now().timestamp_millis() - silent_for.as_millis() as i64;
        let candidates: Vec<AgentId> = self
            .slots
            .iter()
            .filter(|s| s.status() == AgentStatus::Offline)
            .map(|s| s.id())
            .collect();

        let mut removed = Vec::new();
        for id in candidates {
            let Some((_, slot)) = self.slots.remove_if(&id, |_, s| {
                s.status() == AgentStatus::Offline
                    && s.last_heartbeat_ms.load(Ordering::Relaxed) < cutoff
            }) else {
                continue;
            };
            if let Some(mut zone) = self.zones.get_mut(slot.zone()) {
                zone.retain(|s| s.id() != id);
            }
            info!(agent_id = %id, zone = %slot.zone(), "Offline agent removed");
            removed.push(slot.snapshot());
        }
        removed
    }

    pub fn heartbeat(&self, id: AgentId) -> Result<()> {
        let slot = self
            .get(id)
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        slot.last_heartbeat_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        Ok(())
    }

    /// Take offline every agent silent for longer than `timeout`.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<(AgentId, Option<Assignment>)> {
        let cutoff = Utc::now().timestamp_millis() - timeout.as_millis() as i64;
        let stale: Vec<AgentId> = self
            .slots
            .iter()
            .filter(|s| {
                s.status() != AgentStatus::Offline
                    && s.last_heartbeat_ms.load(Ordering::Relaxed) < cutoff
            })
            .map(|s| s.id())
            .collect();

        let mut out = Vec::with_capacity(stale.len());
        for id in stale {
            match self.mark_offline(id).await {
                Ok(lost) => out.push((id, lost)),
                Err(e) => warn!(agent_id = %id, error = %e, "Failed to take stale agent offline"),
            }
        }
        out
    }

    /// Move `slot` from `from` to `to`. The swap fails with `StatusConflict`
    /// unless the slot still holds `from`.
    async fn transition(
        &self,
        slot: &Arc<AgentSlot>,
        from: AgentStatus,
        to: AgentStatus,
        assignment: Option<Assignment>,
    ) -> Result<Option<Assignment>> {
        let mut ctx = Context::new(
            from,
            AgentChange {
                slot: slot.clone(),
                assignment,
            },
        );

        match self.machine.execute(&mut ctx, to).await? {
            Outcome::Applied => {
                self.publish(Event::AgentStatusChanged(AgentStatusChangedPayload {
                    agent_id: slot.id(),
                    zone: slot.zone().to_string(),
                    from,
                    to,
                    timestamp: Utc::now(),
                }))
                .await;
                Ok(ctx.into_payload().assignment)
            }
            Outcome::Skipped | Outcome::Failed => Err(ctx.take_error().unwrap_or(Error::StatusConflict {
                expected: from.to_string(),
                actual: slot.status().to_string(),
            })),
        }
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, "Failed to publish agent event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastEventBus;
    use sluice_core::ids::JobId;
    use sluice_core::node::NodePath;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(BroadcastEventBus::new(64))).unwrap()
    }

    fn assignment(node: &str) -> Assignment {
        Assignment {
            job_id: JobId::new(),
            node: NodePath::parse(node).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_reserve_first_idle_in_registration_order() {
        let registry = registry();
        let first = registry.register(Agent::new("a1", "eu")).await.unwrap();
        registry.register(Agent::new("a2", "eu")).await.unwrap();

        let agent = registry
            .reserve(&AgentRequirement::new("eu"), assignment("root/a"))
            .await
            .unwrap();
        assert_eq!(agent.id, first.id());
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(registry.zone_stats("eu"), ZoneStats { idle: 1, busy: 1, offline: 0 });
    }

    #[tokio::test]
    async fn test_reserve_respects_tags_and_zone() {
        let registry = registry();
        registry.register(Agent::new("plain", "eu")).await.unwrap();
        let tagged = registry
            .register(Agent::new("gpu", "eu").with_tags(["gpu"]))
            .await
            .unwrap();

        let mut req = AgentRequirement::new("eu");
        req.tags.insert("gpu".into());
        let agent = registry.reserve(&req, assignment("root/a")).await.unwrap();
        assert_eq!(agent.id, tagged.id());

        let err = registry.reserve(&req, assignment("root/b")).await.unwrap_err();
        assert!(matches!(err, Error::NoAgentAvailable { .. }));

        let err = registry
            .reserve(&AgentRequirement::new("us"), assignment("root/c"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_release_clears_assignment() {
        let registry = registry();
        let slot = registry.register(Agent::new("a1", "eu")).await.unwrap();
        let job = assignment("root/build");
        registry.reserve(&AgentRequirement::new("eu"), job.clone()).await.unwrap();
        assert_eq!(slot.assignment(), Some(job.clone()));

        let cleared = registry.release(slot.id()).await.unwrap();
        assert_eq!(cleared, Some(job));
        assert_eq!(slot.status(), AgentStatus::Idle);
        assert_eq!(slot.assignment(), None);
    }

    #[tokio::test]
    async fn test_release_requires_busy() {
        let registry = registry();
        let slot = registry.register(Agent::new("a1", "eu")).await.unwrap();
        let err = registry.release(slot.id()).await.unwrap_err();
        assert!(matches!(err, Error::StatusConflict { .. }));
        assert_eq!(slot.status(), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_release_leaves_offline_agent_offline() {
        let registry = registry();
        let slot = registry.register(Agent::new("a1", "eu")).await.unwrap();
        registry
            .reserve(&AgentRequirement::new("eu"), assignment("root/build"))
            .await
            .unwrap();
        registry.mark_offline(slot.id()).await.unwrap();

        let err = registry.release(slot.id()).await.unwrap_err();
        assert!(matches!(err, Error::StatusConflict { .. }));
        assert_eq!(slot.status(), AgentStatus::Offline);

        let err = registry
            .reserve(&AgentRequirement::new("eu"), assignment("root/test"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAgentAvailable { .. }));
    }

    #[tokio::test]
    async fn test_mark_offline_reports_lost_assignment() {
        let registry = registry();
        let slot = registry.register(Agent::new("a1", "eu")).await.unwrap();
        let job = assignment("root/deploy");
        registry.reserve(&AgentRequirement::new("eu"), job.clone()).await.unwrap();

        let lost = registry.mark_offline(slot.id()).await.unwrap();
        assert_eq!(lost, Some(job));
        assert_eq!(slot.status(), AgentStatus::Offline);

        assert_eq!(registry.mark_offline(slot.id()).await.unwrap(), None);

        registry.mark_online(slot.id()).await.unwrap();
        assert_eq!(slot.status(), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_sweep_stale() {
        let registry = registry();
        let slot = registry.register(Agent::new("a1", "eu")).await.unwrap();

        assert!(registry.sweep_stale(Duration::from_secs(60)).await.is_empty());

        slot.last_heartbeat_ms.store(0, Ordering::Relaxed);
        let swept = registry.sweep_stale(Duration::from_secs(60)).await;
        assert_eq!(swept, vec![(slot.id(), None)]);
        assert_eq!(slot.status(), AgentStatus::Offline);
    }

    #[tokio::test]
    async fn test_remove_offline_after_silence() {
        let registry = registry();
        let gone = registry.register(Agent::new("a1", "eu")).await.unwrap();
        let back = registry.register(Agent::new("a2", "eu")).await.unwrap();
        registry.register(Agent::new("a3", "eu")).await.unwrap();

        gone.last_heartbeat_ms.store(0, Ordering::Relaxed);
        back.last_heartbeat_ms.store(0, Ordering::Relaxed);
        registry.sweep_stale(Duration::from_secs(60)).await;
        registry.mark_online(back.id()).await.unwrap();

        let removed = registry.remove_offline(Duration::from_secs(60));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, gone.id());
        assert!(registry.get(gone.id()).is_none());
        assert_eq!(registry.zone_stats("eu"), ZoneStats { idle: 2, busy: 0, offline: 0 });
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = registry();
        let slot = registry.register(Agent::new("a1", "eu")).await.unwrap();
        assert!(registry.remove(slot.id()).is_some());
        assert!(registry.zone_slots("eu").is_empty());
        assert!(registry.is_empty());
    }
}
