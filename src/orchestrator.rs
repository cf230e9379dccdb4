//! Alert orchestration.
//!
//! Turns confirmed gestures into incidents and drives each incident through
//! evidence gathering and delivery:
//!
//! ```text
//! CONFIRMED -> EVIDENCE_GATHERED -> DISPATCHING -> DELIVERED | FAILED
//!     \-> SUPPRESSED (another incident active, or still cooling down)
//! ```
//!
//! The orchestrator is the only writer of incident state. Dispatch runs in
//! its own task so the frame pipeline never waits on the network; every
//! transition is appended to the evidence store, and the store is what the
//! orchestrator consults to decide whether a new confirmation is suppressed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::Confirmation;
use crate::clock::Clock;
use crate::evidence::{LocationProvider, SnapshotSink};
use crate::models::{
    Channel, DeliveryAttempt, DeliveryOutcome, Frame, Incident, IncidentRecord, IncidentState,
    Location,
};
use crate::retry::{ChannelRetry, RetryPolicy, RetryStep};
use crate::store::EvidenceStore;
use crate::transport::{MessageTransport, SendResult};

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub channels: Vec<Channel>,
    pub recipient: String,
    pub retry: RetryPolicy,
    /// Quiet period after an incident resolves before another may dispatch.
    pub cooldown: chrono::Duration,
    pub attempt_timeout: Duration,
    pub evidence_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            channels: vec![Channel::Sms, Channel::Whatsapp],
            recipient: String::new(),
            retry: RetryPolicy::default(),
            cooldown: chrono::Duration::seconds(30),
            attempt_timeout: Duration::from_secs(15),
            evidence_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(20),
        }
    }
}

/// Everything outside the orchestrator it talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn EvidenceStore>,
    pub transport: Arc<dyn MessageTransport>,
    pub location: Arc<dyn LocationProvider>,
    pub snapshots: Arc<dyn SnapshotSink>,
    pub clock: Arc<dyn Clock>,
}

/// A confirmation from the aggregator together with the frame that completed it.
#[derive(Debug, Clone)]
pub struct ConfirmedGesture {
    pub confirmation: Confirmation,
    pub frame: Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Dispatching(Uuid),
    Suppressed { incident: Uuid, by: Uuid },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorSummary {
    pub dispatched: usize,
    pub suppressed: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct Orchestrator {
    deps: Collaborators,
    settings: Arc<AlertSettings>,
    tasks: Vec<(Uuid, JoinHandle<Incident>)>,
    summary: OrchestratorSummary,
}

impl Orchestrator {
    pub fn new(deps: Collaborators, settings: AlertSettings) -> Self {
        Self {
            deps,
            settings: Arc::new(settings),
            tasks: Vec::new(),
            summary: OrchestratorSummary::default(),
        }
    }

    #[cfg(test)]
    pub fn summary(&self) -> OrchestratorSummary {
        self.summary
    }

    fn running(&self) -> Option<Uuid> {
        self.tasks
            .iter()
            .find(|(_, task)| !task.is_finished())
            .map(|(id, _)| *id)
    }

    /// The incident that keeps a new confirmation from dispatching, if any.
    async fn blocking_incident(&self, now: DateTime<Utc>) -> Option<Uuid> {
        if let Some(id) = self.running() {
            return Some(id);
        }

        let holder = match self.deps.store.latest_for_active_incident().await {
            Ok(holder) => holder?,
            Err(err) => {
                error!("active incident lookup failed: {err:#}");
                return None;
            }
        };

        if !holder.state.is_terminal() {
            return Some(holder.id);
        }
        let resolved_at = holder.resolved_at?;
        (now - resolved_at < self.settings.cooldown).then_some(holder.id)
    }

    /// Open an incident for a confirmed gesture, or suppress it.
    pub async fn handle(&mut self, event: ConfirmedGesture) -> anyhow::Result<Disposition> {
        let ConfirmedGesture {
            confirmation,
            frame,
        } = event;
        self.reap_finished().await;
        let now = self.deps.clock.now();
        let mut incident = Incident::confirmed(
            confirmation.label,
            confirmation.mean_confidence,
            confirmation.confirmed_at,
        );

        if let Some(by) = self.blocking_incident(now).await {
            incident.state = IncidentState::Suppressed;
            incident.suppressed_by = Some(by);
            incident.resolved_at = Some(now);
            self.summary.suppressed += 1;
            info!(
                incident = %incident.id,
                gesture = %incident.gesture,
                active = %by,
                "confirmation suppressed"
            );
            self.deps
                .store
                .record(&incident)
                .await
                .context("failed to record suppressed incident")?;
            return Ok(Disposition::Suppressed {
                incident: incident.id,
                by,
            });
        }

        info!(
            incident = %incident.id,
            gesture = %incident.gesture,
            confidence = incident.confidence,
            "incident confirmed"
        );
        if let Err(err) = self.deps.store.record(&incident).await {
            error!(incident = %incident.id, "failed to record confirmation: {err:#}");
        }

        let id = incident.id;
        self.spawn(incident, Some(frame), Vec::new());
        Ok(Disposition::Dispatching(id))
    }

    fn spawn(&mut self, incident: Incident, frame: Option<Frame>, prior: Vec<DeliveryAttempt>) {
        self.summary.dispatched += 1;
        let id = incident.id;
        let task = tokio::spawn(dispatch(
            self.deps.clone(),
            Arc::clone(&self.settings),
            incident,
            frame,
            prior,
        ));
        self.tasks.push((id, task));
    }

    /// Dispatch a recorded incident again. Terminal incidents are left alone.
    pub async fn redeliver(&mut self, id: Uuid) -> anyhow::Result<IncidentState> {
        let IncidentRecord { incident, attempts } = self
            .deps
            .store
            .incident(id)
            .await?
            .with_context(|| format!("no incident {id} in the evidence store"))?;

        if incident.state.is_terminal() {
            info!(incident = %id, state = %incident.state, "incident already resolved, not re-dispatching");
            return Ok(incident.state);
        }
        self.reap_finished().await;
        if self.tasks.iter().any(|(task_id, task)| *task_id == id && !task.is_finished()) {
            debug!(incident = %id, "incident already dispatching");
            return Ok(incident.state);
        }

        info!(incident = %id, state = %incident.state, prior_attempts = attempts.len(), "resuming dispatch");
        let state = incident.state;
        self.spawn(incident, None, attempts);
        Ok(state)
    }

    /// Pick up an incident a previous run left unresolved.
    pub async fn resume_interrupted(&mut self) -> anyhow::Result<Option<Uuid>> {
        match self.deps.store.latest_for_active_incident().await? {
            Some(incident) if !incident.state.is_terminal() => {
                warn!(incident = %incident.id, state = %incident.state, "found interrupted incident");
                self.redeliver(incident.id).await?;
                Ok(Some(incident.id))
            }
            _ => Ok(None),
        }
    }

    async fn settle(&mut self, id: Uuid, task: JoinHandle<Incident>) -> Option<Incident> {
        match task.await {
            Ok(incident) => {
                match incident.state {
                    IncidentState::Delivered => self.summary.delivered += 1,
                    IncidentState::Failed => self.summary.failed += 1,
                    _ => {}
                }
                Some(incident)
            }
            Err(err) => {
                error!(incident = %id, "dispatch task ended abnormally: {err}");
                None
            }
        }
    }

    /// Drop handles of dispatches that have already finished, counting their outcome.
    async fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|(_, task)| task.is_finished());
        self.tasks = running;
        for (id, task) in finished {
            self.settle(id, task).await;
        }
    }

    /// Wait for every dispatch task and return the resolved incidents.
    pub async fn wait_idle(&mut self) -> Vec<Incident> {
        let mut resolved = Vec::new();
        for (id, task) in std::mem::take(&mut self.tasks) {
            resolved.extend(self.settle(id, task).await);
        }
        resolved
    }

    /// Let in-flight deliveries finish within the grace period.
    pub async fn shutdown(mut self) -> OrchestratorSummary {
        let grace = self.settings.shutdown_grace;
        let pending: Vec<(Uuid, AbortHandle)> = self
            .tasks
            .iter()
            .map(|(id, task)| (*id, task.abort_handle()))
            .collect();
        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            for (id, handle) in pending.iter().filter(|(_, h)| !h.is_finished()) {
                warn!(incident = %id, "delivery still running after {grace:?}, aborted; it resumes on next start");
                handle.abort();
            }
        }
        self.summary
    }

    /// Consume confirmations until the pipeline hangs up.
    pub async fn run(
        mut self,
        mut confirmations: mpsc::UnboundedReceiver<ConfirmedGesture>,
    ) -> OrchestratorSummary {
        while let Some(event) = confirmations.recv().await {
            if let Err(err) = self.handle(event).await {
                error!("failed to handle confirmation: {err:#}");
            }
        }
        self.shutdown().await
    }
}

async fn persist(store: &dyn EvidenceStore, incident: &Incident) {
    debug!(incident = %incident.id, state = %incident.state, "incident transition");
    if let Err(err) = store.record(incident).await {
        error!(incident = %incident.id, state = %incident.state, "failed to record incident: {err:#}");
    }
}

pub fn compose_message(incident: &Incident) -> String {
    let location = match &incident.location {
        Some(loc) => {
            let place = loc.place.as_deref().unwrap_or("unknown place");
            format!(
                "{place} ({:.5}, {:.5}) Map: {}",
                loc.latitude,
                loc.longitude,
                loc.map_link()
            )
        }
        None => "unavailable".to_string(),
    };
    let snapshot = incident.snapshot.as_deref().unwrap_or("unavailable");

    format!(
        "\u{1F6A8} {} ({}) detected at {}. Location: {}. Snapshot: {}.",
        incident.gesture.headline(),
        incident.gesture,
        incident.confirmed_at.format("%Y-%m-%d %H:%M:%S UTC"),
        location,
        snapshot
    )
}

async fn gather_evidence(
    deps: &Collaborators,
    timeout: Duration,
    incident: &Incident,
    frame: Option<&Frame>,
) -> (Option<String>, Option<Location>) {
    let snapshot = async {
        let frame = frame?;
        match tokio::time::timeout(timeout, deps.snapshots.capture(incident, frame)).await {
            Ok(Ok(reference)) => Some(reference),
            Ok(Err(err)) => {
                warn!(incident = %incident.id, "snapshot: {err}");
                None
            }
            Err(_) => {
                warn!(incident = %incident.id, "snapshot timed out");
                None
            }
        }
    };
    let location = async {
        match tokio::time::timeout(timeout, deps.location.current_location()).await {
            Ok(Ok(location)) => Some(location),
            Ok(Err(err)) => {
                warn!(incident = %incident.id, "location: {err}");
                None
            }
            Err(_) => {
                warn!(incident = %incident.id, "location lookup timed out");
                None
            }
        }
    };

    tokio::join!(snapshot, location)
}

async fn dispatch(
    deps: Collaborators,
    settings: Arc<AlertSettings>,
    mut incident: Incident,
    frame: Option<Frame>,
    prior: Vec<DeliveryAttempt>,
) -> Incident {
    if incident.state == IncidentState::Confirmed {
        let (snapshot, location) =
            gather_evidence(&deps, settings.evidence_timeout, &incident, frame.as_ref()).await;
        incident.snapshot = snapshot;
        incident.location = location;
        incident.state = IncidentState::EvidenceGathered;
        persist(deps.store.as_ref(), &incident).await;
    }

    if incident.state == IncidentState::EvidenceGathered || incident.message.is_none() {
        incident.message = Some(compose_message(&incident));
        incident.state = IncidentState::Dispatching;
        persist(deps.store.as_ref(), &incident).await;
    }

    let body = incident.message.clone().unwrap_or_default();
    let mut deliveries = JoinSet::new();
    let mut delivered = false;

    for channel in settings.channels.iter().copied() {
        let history: Vec<&DeliveryAttempt> =
            prior.iter().filter(|a| a.channel == channel).collect();
        if history.iter().any(|a| a.outcome == DeliveryOutcome::Success) {
            debug!(incident = %incident.id, %channel, "channel already delivered");
            delivered = true;
            continue;
        }
        if history
            .iter()
            .any(|a| a.outcome == DeliveryOutcome::PermanentFailure)
        {
            continue;
        }
        let used = history.len() as u32;

        deliveries.spawn(deliver_channel(
            deps.clone(),
            Arc::clone(&settings),
            incident.id,
            channel,
            body.clone(),
            incident.snapshot.clone(),
            used,
        ));
    }

    while let Some(result) = deliveries.join_next().await {
        match result {
            Ok(channel_delivered) => delivered |= channel_delivered,
            Err(err) => error!(incident = %incident.id, "channel task ended abnormally: {err}"),
        }
    }

    incident.state = if delivered {
        IncidentState::Delivered
    } else {
        IncidentState::Failed
    };
    incident.resolved_at = Some(deps.clock.now());
    persist(deps.store.as_ref(), &incident).await;

    match incident.state {
        IncidentState::Delivered => info!(incident = %incident.id, "alert delivered"),
        _ => error!(incident = %incident.id, "alert could not be delivered on any channel"),
    }
    incident
}

async fn deliver_channel(
    deps: Collaborators,
    settings: Arc<AlertSettings>,
    incident_id: Uuid,
    channel: Channel,
    body: String,
    attachment: Option<String>,
    used: u32,
) -> bool {
    let mut retry = ChannelRetry::resume(settings.retry.clone(), used);

    while let Some(attempt) = retry.next_attempt() {
        let attempted_at = deps.clock.now();
        let send = deps
            .transport
            .send(channel, &settings.recipient, &body, attachment.as_deref());
        let result = match tokio::time::timeout(settings.attempt_timeout, send).await {
            Ok(result) => result,
            Err(_) => SendResult::transient(format!(
                "no answer within {:?}",
                settings.attempt_timeout
            )),
        };

        let record = DeliveryAttempt {
            incident_id,
            channel,
            attempt,
            attempted_at,
            outcome: result.outcome,
            detail: result.detail,
        };
        info!(
            incident = %incident_id,
            %channel,
            attempt,
            outcome = record.outcome.as_str(),
            detail = record.detail.as_deref().unwrap_or(""),
            "delivery attempt"
        );
        if let Err(err) = deps.store.append_attempt(&record).await {
            error!(incident = %incident_id, %channel, "failed to record attempt: {err:#}");
        }

        match retry.record(record.outcome) {
            RetryStep::Delivered => return true,
            RetryStep::Exhausted => {
                warn!(incident = %incident_id, %channel, attempts = retry.attempts(), "channel exhausted");
                return false;
            }
            RetryStep::RetryAfter(delay) => tokio::time::sleep(delay).await,
        }
    }

    false
}
