//! Appointment lifecycle orchestration: the scheduling service, the host and
//! visitor controllers, notification fan-out and the elapsed-visit sweeper.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, instrument, warn};
use vms_core::{
    plan_transition, Actor, AppointmentId, AppointmentRecord, AppointmentStatus, AvailabilitySlot,
    Clock, HostId, HostResponse, NewAppointment, OccupancyStats, ReportId, ResolvedSchedule,
    SchedulingError, SchedulingEvent, SlotId, SlotOffer, SystemClock, TimeWindow, Transition,
    VisitorId, VisitorReport,
};
use vms_storage::{
    connect_pool, run_migrations, AppointmentStore, InMemoryAppointmentStore, InMemorySlotStore,
    PgAppointmentStore, PgSlotStore, SlotStore, StoreError,
};

pub const CRATE_NAME: &str = "vms-scheduling";

pub type SchedulingResult<T> = Result<T, SchedulingError>;

const REPORT_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Unset means process-local stores.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub bind_host: String,
    pub web_port: u16,
    pub sweeper_enabled: bool,
    pub sweep_cron: String,
    /// How old a reservation must be before the sweeper may free it from a
    /// holder that no longer points at the slot.
    pub orphan_grace_minutes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,
            bind_host: "0.0.0.0".to_string(),
            web_port: 8000,
            sweeper_enabled: false,
            sweep_cron: "0 */5 * * * *".to_string(),
            orphan_grace_minutes: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            db_max_connections: std::env::var("VMS_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.db_max_connections),
            bind_host: std::env::var("VMS_BIND_HOST").unwrap_or(defaults.bind_host),
            web_port: std::env::var("VMS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
            sweeper_enabled: std::env::var("VMS_SWEEPER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.sweeper_enabled),
            sweep_cron: std::env::var("VMS_SWEEP_CRON").unwrap_or(defaults.sweep_cron),
            orphan_grace_minutes: std::env::var("VMS_ORPHAN_GRACE_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|minutes: &i64| *minutes >= 0)
                .unwrap_or(defaults.orphan_grace_minutes),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.web_port)
    }
}

/// Builds the service over PostgreSQL when a database is configured, in-memory otherwise.
pub async fn build_service(config: &SchedulerConfig) -> anyhow::Result<SchedulingService> {
    let service = match &config.database_url {
        Some(url) => {
            let pool = connect_pool(url, config.db_max_connections).await?;
            run_migrations(&pool).await?;
            info!(max_connections = config.db_max_connections, "using postgres stores");
            SchedulingService::new(
                Arc::new(PgSlotStore::new(pool.clone())),
                Arc::new(PgAppointmentStore::new(pool)),
            )
        }
        None => {
            info!("DATABASE_URL unset; using in-memory stores");
            SchedulingService::in_memory()
        }
    };
    Ok(service.with_orphan_grace(Duration::minutes(config.orphan_grace_minutes)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Requested,
    Accepted,
    OptionsOffered,
    Declined,
    SlotSelected,
    Confirmed,
    Rejected,
    Rescheduled,
    Canceled,
    Completed,
    VisitorReported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub appointment_id: AppointmentId,
    pub host_id: HostId,
    pub visitor_id: VisitorId,
    pub status: AppointmentStatus,
    pub window: Option<TimeWindow>,
    pub actor: Actor,
}

impl Notification {
    pub fn for_record(kind: NotificationKind, record: &AppointmentRecord, actor: Actor) -> Self {
        Self {
            kind,
            appointment_id: record.id,
            host_id: record.host_id,
            visitor_id: record.visitor_id,
            status: record.status,
            window: record.schedule.map(|schedule| schedule.window),
            actor,
        }
    }
}

/// Delivery of lifecycle notices (email, SMS, push). Runs after the transition
/// has committed; a failure here never undoes it.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn dispatch(&self, notification: Notification) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn dispatch(&self, notification: Notification) -> anyhow::Result<()> {
        info!(
            kind = ?notification.kind,
            appointment_id = %notification.appointment_id,
            host_id = %notification.host_id,
            visitor_id = %notification.visitor_id,
            status = %notification.status,
            "notification"
        );
        Ok(())
    }
}

/// Forwards notifications to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotifier {
    async fn dispatch(&self, notification: Notification) -> anyhow::Result<()> {
        self.tx
            .send(notification)
            .map_err(|_| anyhow::anyhow!("notification receiver dropped"))
    }
}

/// How a visitor points at one of the offered candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotChoice {
    Index(usize),
    Window(TimeWindow),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub released_orphans: usize,
}

fn require_host(actor: Actor, host_id: HostId) -> SchedulingResult<()> {
    if actor == Actor::Host(host_id) {
        Ok(())
    } else {
        Err(SchedulingError::Forbidden(format!(
            "{actor} may not manage availability of host {host_id}"
        )))
    }
}

fn non_empty(name: &str, value: &str) -> SchedulingResult<()> {
    if value.trim().is_empty() {
        return Err(SchedulingError::InvalidInput(format!("{name} must not be empty")));
    }
    Ok(())
}

/// The lifecycle state machine. Every operation is one logical transaction:
/// a slot reservation taken for a transition is handed back if the record
/// write fails, and a slot is only released after the record that let go of it
/// has been persisted.
pub struct SchedulingService {
    slots: Arc<dyn SlotStore>,
    appointments: Arc<dyn AppointmentStore>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    orphan_grace: Duration,
}

impl SchedulingService {
    pub fn new(slots: Arc<dyn SlotStore>, appointments: Arc<dyn AppointmentStore>) -> Self {
        Self {
            slots,
            appointments,
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
            orphan_grace: Duration::minutes(10),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemorySlotStore::new()),
            Arc::new(InMemoryAppointmentStore::new()),
        )
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    // ---- availability -------------------------------------------------

    #[instrument(skip(self))]
    pub async fn publish_slot(
        &self,
        actor: Actor,
        host_id: HostId,
        window: TimeWindow,
    ) -> SchedulingResult<AvailabilitySlot> {
        require_host(actor, host_id)?;
        window.validate()?;
        let slot = self.slots.publish(host_id, window, self.clock.now()).await?;
        info!(slot_id = %slot.id, %host_id, window = %slot.window, "slot published");
        Ok(slot)
    }

    #[instrument(skip(self))]
    pub async fn delete_slot(&self, actor: Actor, slot_id: SlotId) -> SchedulingResult<AvailabilitySlot> {
        let slot = self.slots.get(slot_id).await?;
        require_host(actor, slot.host_id)?;
        let removed = self.slots.delete(slot_id).await?;
        info!(%slot_id, host_id = %removed.host_id, "slot deleted");
        Ok(removed)
    }

    pub async fn list_slots(
        &self,
        host_id: HostId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SchedulingResult<Vec<AvailabilitySlot>> {
        if from > to {
            return Err(SchedulingError::InvalidRange(format!(
                "range start {from} is after range end {to}"
            )));
        }
        Ok(self.slots.list_by_host_and_range(host_id, from, to).await?)
    }

    pub async fn occupancy(&self, host_id: HostId) -> SchedulingResult<OccupancyStats> {
        Ok(self.slots.occupancy(host_id).await?)
    }

    pub async fn get_slot(&self, slot_id: SlotId) -> SchedulingResult<AvailabilitySlot> {
        Ok(self.slots.get(slot_id).await?)
    }

    // ---- records ------------------------------------------------------

    #[instrument(skip(self, request), fields(host_id = %request.host_id, visitor_id = %request.visitor_id))]
    pub async fn create_appointment(&self, request: NewAppointment) -> SchedulingResult<AppointmentRecord> {
        request.validate()?;
        let record = AppointmentRecord::from_request(request, self.clock.now());
        let saved = self.appointments.insert(record).await?;
        info!(appointment_id = %saved.id, "appointment requested");
        self.notify(NotificationKind::Requested, &saved, Actor::Visitor(saved.visitor_id));
        Ok(saved)
    }

    pub async fn get_appointment(&self, id: AppointmentId) -> SchedulingResult<AppointmentRecord> {
        Ok(self.appointments.get(id).await?)
    }

    pub async fn list_for_host(
        &self,
        host_id: HostId,
        status: Option<AppointmentStatus>,
    ) -> SchedulingResult<Vec<AppointmentRecord>> {
        let mut records = self.appointments.list_by_host(host_id).await?;
        if let Some(status) = status {
            records.retain(|r| r.status == status);
        }
        Ok(records)
    }

    pub async fn list_for_visitor(
        &self,
        visitor_id: VisitorId,
        status: Option<AppointmentStatus>,
    ) -> SchedulingResult<Vec<AppointmentRecord>> {
        let mut records = self.appointments.list_by_visitor(visitor_id).await?;
        if let Some(status) = status {
            records.retain(|r| r.status == status);
        }
        Ok(records)
    }

    /// Offered candidates whose slot can still be picked.
    pub async fn remaining_candidates(&self, id: AppointmentId) -> SchedulingResult<Vec<SlotOffer>> {
        let record = self.appointments.get(id).await?;
        let mut remaining = Vec::new();
        for offer in record.candidates() {
            match self.slots.get(offer.slot_id).await {
                Ok(slot) if slot.is_available() => remaining.push(*offer),
                Ok(_) | Err(StoreError::SlotNotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(remaining)
    }

    // ---- transitions --------------------------------------------------

    #[instrument(skip(self))]
    pub async fn accept_exact(
        &self,
        actor: Actor,
        id: AppointmentId,
        slot_id: SlotId,
    ) -> SchedulingResult<AppointmentRecord> {
        let (record, transition) = self.plan(actor, id, SchedulingEvent::AcceptExact).await?;
        let Transition::Advance(status) = transition else {
            return Ok(record);
        };
        let slot = self.slots.get(slot_id).await?;
        if slot.host_id != record.host_id {
            return Err(SchedulingError::SlotNotFound(format!(
                "slot {slot_id} is not published by host {}",
                record.host_id
            )));
        }
        let slot = self.reserve_for(slot_id, id).await?;

        let mut next = record.advanced(status, self.clock.now());
        next.response = Some(HostResponse::ExactSlot {
            slot_id,
            window: slot.window,
        });
        next.schedule = Some(ResolvedSchedule {
            window: slot.window,
            slot_id: Some(slot_id),
        });
        let saved = self.commit(&record, next, Some(slot_id)).await?;
        info!(appointment_id = %id, %slot_id, window = %slot.window, "accepted with exact slot");
        self.notify(NotificationKind::Accepted, &saved, actor);
        Ok(saved)
    }

    #[instrument(skip(self))]
    pub async fn accept_all_slots(
        &self,
        actor: Actor,
        id: AppointmentId,
        windows: Vec<TimeWindow>,
    ) -> SchedulingResult<AppointmentRecord> {
        let (record, transition) = self.plan(actor, id, SchedulingEvent::AcceptAllSlots).await?;
        let Transition::Advance(status) = transition else {
            return Ok(record);
        };
        if windows.is_empty() {
            return Err(SchedulingError::InvalidInput(
                "at least one candidate window is required".into(),
            ));
        }
        let mut seen = HashSet::new();
        let mut candidates = Vec::with_capacity(windows.len());
        for window in windows {
            window.validate()?;
            if !seen.insert(window) {
                return Err(SchedulingError::InvalidInput(format!("{window} is offered twice")));
            }
            let slot = self
                .slots
                .find_by_window(record.host_id, window)
                .await?
                .ok_or_else(|| SchedulingError::SlotNotFound(format!("no published slot for {window}")))?;
            if !slot.is_available() {
                return Err(SchedulingError::Conflict(format!("{window} is already booked")));
            }
            candidates.push(slot.offer());
        }

        let offered = candidates.len();
        let mut next = record.advanced(status, self.clock.now());
        next.response = Some(HostResponse::AllSlots {
            candidates,
            chosen: None,
        });
        next.schedule = None;
        let saved = self.commit(&record, next, None).await?;
        info!(appointment_id = %id, offered, "accepted with candidate slots");
        self.notify(NotificationKind::OptionsOffered, &saved, actor);
        Ok(saved)
    }

    #[instrument(skip(self))]
    pub async fn decline(&self, actor: Actor, id: AppointmentId) -> SchedulingResult<AppointmentRecord> {
        let (record, transition) = self.plan(actor, id, SchedulingEvent::Decline).await?;
        let Transition::Advance(status) = transition else {
            debug!(appointment_id = %id, "decline replayed");
            return Ok(record);
        };
        let next = record.advanced(status, self.clock.now());
        let saved = self.commit(&record, next, None).await?;
        info!(appointment_id = %id, "request declined");
        self.notify(NotificationKind::Declined, &saved, actor);
        Ok(saved)
    }

    #[instrument(skip(self))]
    pub async fn select_slot(
        &self,
        actor: Actor,
        id: AppointmentId,
        choice: SlotChoice,
    ) -> SchedulingResult<AppointmentRecord> {
        let (record, transition) = self.plan(actor, id, SchedulingEvent::SelectSlot).await?;
        let Transition::Advance(status) = transition else {
            return Ok(record);
        };
        let candidates = record.candidates().to_vec();
        let index = match choice {
            SlotChoice::Index(index) if index < candidates.len() => index,
            SlotChoice::Window(window) => candidates
                .iter()
                .position(|offer| offer.window == window)
                .ok_or_else(|| {
                    SchedulingError::InvalidInput(format!("{window} is not one of the offered windows"))
                })?,
            SlotChoice::Index(index) => {
                return Err(SchedulingError::InvalidInput(format!(
                    "candidate {index} out of range ({} offered)",
                    candidates.len()
                )))
            }
        };
        let offer = candidates[index];
        self.reserve_for(offer.slot_id, id).await?;

        let mut next = record.advanced(status, self.clock.now());
        next.response = Some(HostResponse::AllSlots {
            candidates,
            chosen: Some(index),
        });
        next.schedule = Some(ResolvedSchedule {
            window: offer.window,
            slot_id: Some(offer.slot_id),
        });
        let saved = self.commit(&record, next, Some(offer.slot_id)).await?;
        info!(appointment_id = %id, slot_id = %offer.slot_id, window = %offer.window, "candidate selected");
        self.notify(NotificationKind::SlotSelected, &saved, actor);
        Ok(saved)
    }

    #[instrument(skip(self))]
    pub async fn confirm(&self, actor: Actor, id: AppointmentId) -> SchedulingResult<AppointmentRecord> {
        let (record, transition) = self.plan(actor, id, SchedulingEvent::Confirm).await?;
        let Transition::Advance(status) = transition else {
            return Ok(record);
        };
        let next = record.advanced(status, self.clock.now());
        let saved = self.commit(&record, next, None).await?;
        info!(appointment_id = %id, "appointment confirmed");
        self.notify(NotificationKind::Confirmed, &saved, actor);
        Ok(saved)
    }

    #[instrument(skip(self))]
    pub async fn reject(&self, actor: Actor, id: AppointmentId) -> SchedulingResult<AppointmentRecord> {
        self.withdraw(actor, id, SchedulingEvent::Reject, NotificationKind::Rejected)
            .await
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, actor: Actor, id: AppointmentId) -> SchedulingResult<AppointmentRecord> {
        self.withdraw(actor, id, SchedulingEvent::Cancel, NotificationKind::Canceled)
            .await
    }

    #[instrument(skip(self))]
    pub async fn reschedule(
        &self,
        actor: Actor,
        id: AppointmentId,
        window: TimeWindow,
    ) -> SchedulingResult<AppointmentRecord> {
        let (record, transition) = self.plan(actor, id, SchedulingEvent::Reschedule).await?;
        let Transition::Advance(status) = transition else {
            return Ok(record);
        };
        window.validate()?;
        let now = self.clock.now();
        if window.is_in_past(now) {
            return Err(SchedulingError::InvalidRange(format!("{window} is in the past")));
        }

        let old_slot = record.held_slot();
        let mut reserved = None;
        let new_slot = match self.slots.find_by_window(record.host_id, window).await? {
            Some(slot) if slot.is_held_by(id) => Some(slot.id),
            Some(slot) if slot.is_available() => {
                self.reserve_for(slot.id, id).await?;
                reserved = Some(slot.id);
                Some(slot.id)
            }
            Some(_) => {
                return Err(SchedulingError::Conflict(format!(
                    "{window} is booked by another appointment"
                )))
            }
            None => None,
        };

        let mut next = record.advanced(status, now);
        next.schedule = Some(ResolvedSchedule {
            window,
            slot_id: new_slot,
        });
        let saved = self.commit(&record, next, reserved).await?;
        if let Some(old) = old_slot.filter(|old| Some(*old) != new_slot) {
            self.release_after_commit(&saved, old).await;
        }
        info!(appointment_id = %id, %window, bound = new_slot.is_some(), "appointment rescheduled");
        self.notify(NotificationKind::Rescheduled, &saved, actor);
        Ok(saved)
    }

    #[instrument(skip(self))]
    pub async fn mark_completed(&self, actor: Actor, id: AppointmentId) -> SchedulingResult<AppointmentRecord> {
        let (record, transition) = self.plan(actor, id, SchedulingEvent::VisitElapsed).await?;
        let Transition::Advance(status) = transition else {
            return Ok(record);
        };
        let schedule = record
            .schedule
            .ok_or(SchedulingError::UnresolvedSchedule(id))?;
        let now = self.clock.now();
        if !schedule.window.has_elapsed(now) {
            return Err(SchedulingError::VisitNotElapsed(schedule.window.ends_at()));
        }
        let next = record.advanced(status, now);
        let saved = self.commit(&record, next, None).await?;
        info!(appointment_id = %id, "visit completed");
        self.notify(NotificationKind::Completed, &saved, actor);
        Ok(saved)
    }

    /// Attaches a report to the record without touching its status.
    #[instrument(skip(self, reason))]
    pub async fn report_visitor(
        &self,
        actor: Actor,
        id: AppointmentId,
        category: String,
        reason: String,
    ) -> SchedulingResult<AppointmentRecord> {
        non_empty("category", &category)?;
        non_empty("reason", &reason)?;
        for attempt in 1..=REPORT_WRITE_ATTEMPTS {
            let record = self.appointments.get(id).await?;
            let Actor::Host(host_id) = actor else {
                return Err(SchedulingError::Forbidden(format!("{actor} may not report visitors")));
            };
            if host_id != record.host_id {
                return Err(SchedulingError::Forbidden(format!(
                    "{actor} is not the host of appointment {id}"
                )));
            }
            let now = self.clock.now();
            let mut next = record.clone();
            next.version += 1;
            next.updated_at = now;
            next.reports.push(VisitorReport {
                id: ReportId::new(),
                reported_by: host_id,
                category: category.clone(),
                reason: reason.clone(),
                created_at: now,
            });
            match self.appointments.update(next, record.version).await {
                Ok(saved) => {
                    info!(appointment_id = %id, category = %category, "visitor reported");
                    self.notify(NotificationKind::VisitorReported, &saved, actor);
                    return Ok(saved);
                }
                Err(StoreError::VersionMismatch { .. }) if attempt < REPORT_WRITE_ATTEMPTS => {
                    debug!(appointment_id = %id, attempt, "record moved underneath report; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(SchedulingError::Conflict(format!(
            "appointment {id} kept changing while attaching the report"
        )))
    }

    // ---- maintenance --------------------------------------------------

    /// Completes every confirmed appointment whose visit has ended.
    pub async fn complete_elapsed_visits(&self) -> SchedulingResult<SweepSummary> {
        let now = self.clock.now();
        let confirmed = self
            .appointments
            .list_by_status(AppointmentStatus::Confirmed)
            .await?;
        let mut summary = SweepSummary {
            examined: confirmed.len(),
            ..SweepSummary::default()
        };
        for record in confirmed {
            let elapsed = record
                .schedule
                .is_some_and(|schedule| schedule.window.has_elapsed(now));
            if !elapsed {
                continue;
            }
            match self.mark_completed(Actor::System, record.id).await {
                Ok(_) => summary.completed += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(appointment_id = %record.id, error = %err, "could not complete elapsed visit");
                }
            }
        }
        Ok(summary)
    }

    /// Frees slots still booked for appointments that no longer need them: the
    /// holder is gone, was rejected, declined or canceled, or has moved to a
    /// different slot. The last case only applies once the reservation is older
    /// than the orphan grace, so an accept, selection or reschedule that has
    /// reserved but not yet written its record is left alone.
    pub async fn release_orphaned_holds(&self) -> SchedulingResult<usize> {
        let now = self.clock.now();
        let mut released = 0;
        for slot in self.slots.list_booked().await? {
            let Some(holder) = slot.held_by else {
                continue;
            };
            let stale = slot
                .held_since
                .map_or(true, |since| now - since >= self.orphan_grace);
            let reason = match self.appointments.get(holder).await {
                Ok(record) if record.status.is_terminal() && record.status != AppointmentStatus::Completed => {
                    Some("holder withdrawn")
                }
                Ok(record) if stale && record.held_slot() != Some(slot.id) => {
                    Some("holder moved to another slot")
                }
                Ok(_) => None,
                Err(StoreError::AppointmentNotFound(_)) => Some("holder missing"),
                Err(err) => return Err(err.into()),
            };
            let Some(reason) = reason else {
                continue;
            };
            if self.slots.release(slot.id, holder).await? {
                released += 1;
                warn!(slot_id = %slot.id, appointment_id = %holder, reason, "released orphaned reservation");
            }
        }
        Ok(released)
    }

    // ---- internals ----------------------------------------------------

    async fn plan(
        &self,
        actor: Actor,
        id: AppointmentId,
        event: SchedulingEvent,
    ) -> SchedulingResult<(AppointmentRecord, Transition)> {
        let record = self.appointments.get(id).await?;
        event.authorize(actor, &record)?;
        let transition = plan_transition(&record, event)?;
        Ok((record, transition))
    }

    async fn withdraw(
        &self,
        actor: Actor,
        id: AppointmentId,
        event: SchedulingEvent,
        kind: NotificationKind,
    ) -> SchedulingResult<AppointmentRecord> {
        let (record, transition) = self.plan(actor, id, event).await?;
        let Transition::Advance(status) = transition else {
            // Retried withdrawal: make sure the slot really went back.
            if let Some(slot_id) = record.held_slot() {
                self.release_after_commit(&record, slot_id).await;
            }
            return Ok(record);
        };
        let next = record.advanced(status, self.clock.now());
        let saved = self.commit(&record, next, None).await?;
        if let Some(slot_id) = saved.held_slot() {
            self.release_after_commit(&saved, slot_id).await;
        }
        info!(appointment_id = %id, event = %event, status = %saved.status, "appointment withdrawn");
        self.notify(kind, &saved, actor);
        Ok(saved)
    }

    async fn reserve_for(&self, slot_id: SlotId, holder: AppointmentId) -> SchedulingResult<AvailabilitySlot> {
        self.slots
            .reserve(slot_id, holder, self.clock.now())
            .await
            .map_err(|err| match err {
                StoreError::SlotUnavailable(id) | StoreError::SlotNotFound(id) => {
                    SchedulingError::Conflict(format!(
                        "slot {id} was claimed or withdrawn; refresh the slot list and retry"
                    ))
                }
                other => other.into(),
            })
    }

    /// Persists `next` over `current`; hands back `reserved` if the write fails.
    async fn commit(
        &self,
        current: &AppointmentRecord,
        next: AppointmentRecord,
        reserved: Option<SlotId>,
    ) -> SchedulingResult<AppointmentRecord> {
        let outcome = match next.check_invariants() {
            Ok(()) => self
                .appointments
                .update(next, current.version)
                .await
                .map_err(SchedulingError::from),
            Err(err) => Err(err),
        };
        if outcome.is_err() {
            if let Some(slot_id) = reserved {
                self.roll_back_reservation(slot_id, current.id).await;
            }
        }
        outcome
    }

    async fn roll_back_reservation(&self, slot_id: SlotId, appointment_id: AppointmentId) {
        match self.slots.release(slot_id, appointment_id).await {
            Ok(_) => warn!(%slot_id, %appointment_id, "record write failed; reservation rolled back"),
            Err(err) => warn!(
                %slot_id,
                %appointment_id,
                error = %err,
                "reservation rollback failed; orphan sweep will free it"
            ),
        }
    }

    async fn release_after_commit(&self, record: &AppointmentRecord, slot_id: SlotId) {
        match self.slots.release(slot_id, record.id).await {
            Ok(true) => info!(%slot_id, appointment_id = %record.id, "slot released"),
            Ok(false) => debug!(%slot_id, appointment_id = %record.id, "slot not held; nothing to release"),
            Err(err) => warn!(
                %slot_id,
                appointment_id = %record.id,
                error = %err,
                "slot release failed; orphan sweep will free it"
            ),
        }
    }

    fn notify(&self, kind: NotificationKind, record: &AppointmentRecord, actor: Actor) {
        let notification = Notification::for_record(kind, record, actor);
        let sink = self.notifier.clone();
        tokio::spawn(async move {
            let appointment_id = notification.appointment_id;
            if let Err(err) = sink.dispatch(notification).await {
                warn!(%appointment_id, ?kind, error = %err, "notification dispatch failed");
            }
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub window: TimeWindow,
    pub slot: Option<AvailabilitySlot>,
    pub error: Option<String>,
}

/// Host-facing availability management.
#[derive(Clone)]
pub struct HostAvailabilityController {
    service: Arc<SchedulingService>,
}

impl HostAvailabilityController {
    pub fn new(service: Arc<SchedulingService>) -> Self {
        Self { service }
    }

    pub async fn publish(&self, host_id: HostId, window: TimeWindow) -> SchedulingResult<AvailabilitySlot> {
        self.service
            .publish_slot(Actor::Host(host_id), host_id, window)
            .await
    }

    /// Publishes each window independently; one failure does not stop the rest.
    pub async fn publish_batch(&self, host_id: HostId, windows: Vec<TimeWindow>) -> Vec<PublishOutcome> {
        let mut outcomes = Vec::with_capacity(windows.len());
        for window in windows {
            let outcome = match self.publish(host_id, window).await {
                Ok(slot) => PublishOutcome {
                    window,
                    slot: Some(slot),
                    error: None,
                },
                Err(err) => PublishOutcome {
                    window,
                    slot: None,
                    error: Some(err.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    pub async fn delete(&self, host_id: HostId, slot_id: SlotId) -> SchedulingResult<AvailabilitySlot> {
        self.service.delete_slot(Actor::Host(host_id), slot_id).await
    }

    pub async fn list(
        &self,
        host_id: HostId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SchedulingResult<Vec<AvailabilitySlot>> {
        self.service.list_slots(host_id, from, to).await
    }

    pub async fn stats(&self, host_id: HostId) -> SchedulingResult<OccupancyStats> {
        self.service.occupancy(host_id).await
    }
}

/// Host-facing review of pending requests.
#[derive(Clone)]
pub struct RequestReviewController {
    service: Arc<SchedulingService>,
}

impl RequestReviewController {
    pub fn new(service: Arc<SchedulingService>) -> Self {
        Self { service }
    }

    pub async fn pending(&self, host_id: HostId) -> SchedulingResult<Vec<AppointmentRecord>> {
        self.service
            .list_for_host(host_id, Some(AppointmentStatus::Pending))
            .await
    }

    pub async fn accept_exact(
        &self,
        host_id: HostId,
        id: AppointmentId,
        slot_id: SlotId,
    ) -> SchedulingResult<AppointmentRecord> {
        self.service.accept_exact(Actor::Host(host_id), id, slot_id).await
    }

    pub async fn accept_with_options(
        &self,
        host_id: HostId,
        id: AppointmentId,
        windows: Vec<TimeWindow>,
    ) -> SchedulingResult<AppointmentRecord> {
        self.service
            .accept_all_slots(Actor::Host(host_id), id, windows)
            .await
    }

    pub async fn decline(&self, host_id: HostId, id: AppointmentId) -> SchedulingResult<AppointmentRecord> {
        self.service.decline(Actor::Host(host_id), id).await
    }
}

/// Visitor-facing answers to an accepted request.
#[derive(Clone)]
pub struct VisitorResponseController {
    service: Arc<SchedulingService>,
}

impl VisitorResponseController {
    pub fn new(service: Arc<SchedulingService>) -> Self {
        Self { service }
    }

    pub async fn select_slot(
        &self,
        visitor_id: VisitorId,
        id: AppointmentId,
        choice: SlotChoice,
    ) -> SchedulingResult<AppointmentRecord> {
        self.service
            .select_slot(Actor::Visitor(visitor_id), id, choice)
            .await
    }

    /// Candidates still open, for re-display after a lost selection race.
    pub async fn remaining_candidates(
        &self,
        visitor_id: VisitorId,
        id: AppointmentId,
    ) -> SchedulingResult<Vec<SlotOffer>> {
        let record = self.service.get_appointment(id).await?;
        if record.visitor_id != visitor_id {
            return Err(SchedulingError::Forbidden(format!(
                "visitor {visitor_id} does not own appointment {id}"
            )));
        }
        self.service.remaining_candidates(id).await
    }

    pub async fn confirm(&self, visitor_id: VisitorId, id: AppointmentId) -> SchedulingResult<AppointmentRecord> {
        self.service.confirm(Actor::Visitor(visitor_id), id).await
    }

    pub async fn reject(&self, visitor_id: VisitorId, id: AppointmentId) -> SchedulingResult<AppointmentRecord> {
        self.service.reject(Actor::Visitor(visitor_id), id).await
    }
}

/// Operations on an appointment after it has been agreed.
#[derive(Clone)]
pub struct AppointmentMaintenanceController {
    service: Arc<SchedulingService>,
}

impl AppointmentMaintenanceController {
    pub fn new(service: Arc<SchedulingService>) -> Self {
        Self { service }
    }

    pub async fn reschedule(
        &self,
        host_id: HostId,
        id: AppointmentId,
        window: TimeWindow,
    ) -> SchedulingResult<AppointmentRecord> {
        self.service
            .reschedule(Actor::Host(host_id), id, window)
            .await
    }

    pub async fn cancel(&self, actor: Actor, id: AppointmentId) -> SchedulingResult<AppointmentRecord> {
        self.service.cancel(actor, id).await
    }

    pub async fn mark_completed(&self, actor: Actor, id: AppointmentId) -> SchedulingResult<AppointmentRecord> {
        self.service.mark_completed(actor, id).await
    }

    pub async fn report_visitor(
        &self,
        host_id: HostId,
        id: AppointmentId,
        category: String,
        reason: String,
    ) -> SchedulingResult<AppointmentRecord> {
        self.service
            .report_visitor(Actor::Host(host_id), id, category, reason)
            .await
    }
}

/// Periodic `visit-elapsed` driver plus orphaned-reservation repair.
#[derive(Clone)]
pub struct CompletionSweeper {
    service: Arc<SchedulingService>,
}

impl CompletionSweeper {
    pub fn new(service: Arc<SchedulingService>) -> Self {
        Self { service }
    }

    pub async fn run_once(&self) -> SchedulingResult<SweepSummary> {
        let mut summary = self.service.complete_elapsed_visits().await?;
        summary.released_orphans = self.service.release_orphaned_holds().await?;
        info!(
            examined = summary.examined,
            completed = summary.completed,
            failed = summary.failed,
            released_orphans = summary.released_orphans,
            "sweep finished"
        );
        Ok(summary)
    }

    pub async fn maybe_build_scheduler(&self, config: &SchedulerConfig) -> anyhow::Result<Option<JobScheduler>> {
        if !config.sweeper_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let sweeper = self.clone();
        let job = Job::new_async(&config.sweep_cron, move |_uuid, _l| {
            let sweeper = sweeper.clone();
            Box::pin(async move {
                if let Err(err) = sweeper.run_once().await {
                    warn!(error = %err, "scheduled sweep failed");
                }
            })
        })
        .with_context(|| format!("creating sweep job for cron {}", config.sweep_cron))?;
        sched.add(job).await.context("adding sweep job")?;
        Ok(Some(sched))
    }
}

/// All four controllers over one service.
#[derive(Clone)]
pub struct Controllers {
    pub availability: HostAvailabilityController,
    pub review: RequestReviewController,
    pub visitor: VisitorResponseController,
    pub maintenance: AppointmentMaintenanceController,
    pub service: Arc<SchedulingService>,
}

impl Controllers {
    pub fn new(service: Arc<SchedulingService>) -> Self {
        Self {
            availability: HostAvailabilityController::new(service.clone()),
            review: RequestReviewController::new(service.clone()),
            visitor: VisitorResponseController::new(service.clone()),
            maintenance: AppointmentMaintenanceController::new(service.clone()),
            service,
        }
    }
}
