//! Core domain model for the visitor appointment scheduler: identifiers, time
//! windows, availability slots, appointment records and the lifecycle
//! transition table.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "vms-core";

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Staff member who publishes availability and receives visit requests.
    HostId
);
id_type!(VisitorId);
id_type!(
    /// Published availability slot. Unique across hosts.
    SlotId
);
id_type!(AppointmentId);
id_type!(ReportId);

/// Wall-clock `HH:MM` encoding for window boundaries.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(raw.trim(), FORMAT).map_err(D::Error::custom)
    }
}

/// A `(date, start, end)` window in naive local time with minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Builds a window, dropping sub-minute precision. Fails when `start >= end`.
    pub fn new(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Result<Self, SchedulingError> {
        let start = truncate_to_minute(start);
        let end = truncate_to_minute(end);
        let window = Self { date, start, end };
        window.validate()?;
        Ok(window)
    }

    /// Parses `YYYY-MM-DD` plus two `HH:MM` strings.
    pub fn parse(date: &str, start: &str, end: &str) -> Result<Self, SchedulingError> {
        let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
            .map_err(|err| SchedulingError::InvalidRange(format!("date {date:?}: {err}")))?;
        let start = NaiveTime::parse_from_str(start.trim(), hhmm::FORMAT)
            .map_err(|err| SchedulingError::InvalidRange(format!("start {start:?}: {err}")))?;
        let end = NaiveTime::parse_from_str(end.trim(), hhmm::FORMAT)
            .map_err(|err| SchedulingError::InvalidRange(format!("end {end:?}: {err}")))?;
        Self::new(date, start, end)
    }

    /// Re-checks the range invariant; deserialized windows bypass `new`.
    pub fn validate(&self) -> Result<(), SchedulingError> {
        if self.start >= self.end {
            return Err(SchedulingError::InvalidRange(format!(
                "start {} must be before end {}",
                self.start.format(hhmm::FORMAT),
                self.end.format(hhmm::FORMAT)
            )));
        }
        Ok(())
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.start)
    }

    pub fn ends_at(&self) -> NaiveDateTime {
        self.date.and_time(self.end)
    }

    /// Half-open overlap: windows that merely touch do not overlap.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.date == other.date && self.start < other.end && other.start < self.end
    }

    pub fn is_in_past(&self, now: NaiveDateTime) -> bool {
        self.starts_at() < now
    }

    pub fn has_elapsed(&self, now: NaiveDateTime) -> bool {
        self.ends_at() <= now
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}-{}",
            self.date,
            self.start.format(hhmm::FORMAT),
            self.end.format(hhmm::FORMAT)
        )
    }
}

fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    Booked,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Booked => "booked",
        }
    }
}

impl FromStr for SlotStatus {
    type Err = SchedulingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(SlotStatus::Available),
            "booked" => Ok(SlotStatus::Booked),
            other => Err(SchedulingError::Storage(format!("unknown slot status {other:?}"))),
        }
    }
}

/// A bookable window published by a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub id: SlotId,
    pub host_id: HostId,
    pub window: TimeWindow,
    pub status: SlotStatus,
    /// Appointment currently holding the reservation; set iff `Booked`.
    pub held_by: Option<AppointmentId>,
    /// When the current reservation was taken.
    #[serde(default)]
    pub held_since: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl AvailabilitySlot {
    pub fn publish(host_id: HostId, window: TimeWindow, now: NaiveDateTime) -> Self {
        Self {
            id: SlotId::new(),
            host_id,
            window,
            status: SlotStatus::Available,
            held_by: None,
            held_since: None,
            created_at: now,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == SlotStatus::Available
    }

    pub fn is_held_by(&self, appointment_id: AppointmentId) -> bool {
        self.status == SlotStatus::Booked && self.held_by == Some(appointment_id)
    }

    pub fn offer(&self) -> SlotOffer {
        SlotOffer {
            slot_id: self.id,
            window: self.window,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyStats {
    pub total: usize,
    pub available: usize,
    pub booked: usize,
}

impl OccupancyStats {
    pub fn from_slots<'a>(slots: impl IntoIterator<Item = &'a AvailabilitySlot>) -> Self {
        slots.into_iter().fold(Self::default(), |mut stats, slot| {
            stats.total += 1;
            match slot.status {
                SlotStatus::Available => stats.available += 1,
                SlotStatus::Booked => stats.booked += 1,
            }
            stats
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppointmentStatus {
    Pending,
    Accepted,
    Confirmed,
    VisitorRejected,
    HostRejected,
    Canceled,
    Completed,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 7] = [
        AppointmentStatus::Pending,
        AppointmentStatus::Accepted,
        AppointmentStatus::Confirmed,
        AppointmentStatus::VisitorRejected,
        AppointmentStatus::HostRejected,
        AppointmentStatus::Canceled,
        AppointmentStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Accepted => "accepted",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::VisitorRejected => "visitorRejected",
            AppointmentStatus::HostRejected => "hostRejected",
            AppointmentStatus::Canceled => "canceled",
            AppointmentStatus::Completed => "completed",
        }
    }

    /// Statuses from which no further lifecycle event can progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::VisitorRejected
                | AppointmentStatus::HostRejected
                | AppointmentStatus::Canceled
                | AppointmentStatus::Completed
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = SchedulingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AppointmentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SchedulingError::InvalidInput(format!("unknown appointment status {s:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorInfo {
    pub firstname: String,
    pub lastname: String,
    pub contact: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleInfo {
    pub plate_number: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Payload of the appointment creation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub visitor_id: VisitorId,
    pub host_id: HostId,
    pub firstname: String,
    pub lastname: String,
    pub contact: String,
    #[serde(default)]
    pub email: Option<String>,
    pub category: String,
    pub reason: String,
    #[serde(default)]
    pub vehicle: Option<VehicleInfo>,
}

impl NewAppointment {
    pub fn validate(&self) -> Result<(), SchedulingError> {
        let required = [
            ("firstname", &self.firstname),
            ("lastname", &self.lastname),
            ("contact", &self.contact),
            ("category", &self.category),
            ("reason", &self.reason),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(SchedulingError::InvalidInput(format!("{name} must not be empty")));
            }
        }
        if let Some(email) = &self.email {
            if !email.trim().is_empty() && !email.contains('@') {
                return Err(SchedulingError::InvalidInput(format!("email {email:?} is malformed")));
            }
        }
        if let Some(vehicle) = &self.vehicle {
            if vehicle.plate_number.trim().is_empty() {
                return Err(SchedulingError::InvalidInput(
                    "vehicle plate_number must not be empty".into(),
                ));
            }
        }
        Ok(())
    }
}

/// A candidate window offered to the visitor, tied to the published slot it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotOffer {
    pub slot_id: SlotId,
    pub window: TimeWindow,
}

/// What the host answered when accepting a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HostResponse {
    #[serde(rename_all = "camelCase")]
    ExactSlot { slot_id: SlotId, window: TimeWindow },
    #[serde(rename_all = "camelCase")]
    AllSlots {
        candidates: Vec<SlotOffer>,
        chosen: Option<usize>,
    },
}

/// The single `(date, start, end)` an appointment is committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSchedule {
    pub window: TimeWindow,
    /// Published slot backing the schedule; `None` for ad-hoc reschedules.
    pub slot_id: Option<SlotId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorReport {
    pub id: ReportId,
    pub reported_by: HostId,
    pub category: String,
    pub reason: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentRecord {
    pub id: AppointmentId,
    pub visitor_id: VisitorId,
    pub host_id: HostId,
    pub visitor: VisitorInfo,
    pub category: String,
    pub reason: String,
    pub vehicle: Option<VehicleInfo>,
    pub status: AppointmentStatus,
    pub response: Option<HostResponse>,
    pub schedule: Option<ResolvedSchedule>,
    #[serde(default)]
    pub reports: Vec<VisitorReport>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    /// Bumped on every persisted mutation; stores compare-and-swap on it.
    pub version: u64,
}

impl AppointmentRecord {
    pub fn from_request(request: NewAppointment, now: NaiveDateTime) -> Self {
        Self {
            id: AppointmentId::new(),
            visitor_id: request.visitor_id,
            host_id: request.host_id,
            visitor: VisitorInfo {
                firstname: request.firstname,
                lastname: request.lastname,
                contact: request.contact,
                email: request.email,
            },
            category: request.category,
            reason: request.reason,
            vehicle: request.vehicle,
            status: AppointmentStatus::Pending,
            response: None,
            schedule: None,
            reports: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn held_slot(&self) -> Option<SlotId> {
        self.schedule.and_then(|schedule| schedule.slot_id)
    }

    pub fn is_resolved(&self) -> bool {
        self.schedule.is_some()
    }

    pub fn candidates(&self) -> &[SlotOffer] {
        match &self.response {
            Some(HostResponse::AllSlots { candidates, .. }) => candidates,
            _ => &[],
        }
    }

    /// Copy carrying `status` and a bumped version, ready for a compare-and-swap write.
    pub fn advanced(&self, status: AppointmentStatus, now: NaiveDateTime) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.updated_at = now;
        next.version = self.version + 1;
        next
    }

    /// Checks the resolved-schedule invariant for the current status.
    pub fn check_invariants(&self) -> Result<(), SchedulingError> {
        let needs_schedule = matches!(
            self.status,
            AppointmentStatus::Confirmed | AppointmentStatus::Completed
        );
        if needs_schedule && self.schedule.is_none() {
            return Err(SchedulingError::UnresolvedSchedule(self.id));
        }
        if let Some(HostResponse::AllSlots { candidates, chosen }) = &self.response {
            if candidates.is_empty() {
                return Err(SchedulingError::InvalidInput("allSlots response without candidates".into()));
            }
            if let Some(index) = chosen {
                if *index >= candidates.len() {
                    return Err(SchedulingError::InvalidInput(format!(
                        "chosen candidate {index} out of range"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Who is invoking an operation. Passed explicitly on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Host(HostId),
    Visitor(VisitorId),
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Host(id) => write!(f, "host {id}"),
            Actor::Visitor(id) => write!(f, "visitor {id}"),
            Actor::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingEvent {
    AcceptExact,
    AcceptAllSlots,
    Decline,
    SelectSlot,
    Confirm,
    Reject,
    Reschedule,
    Cancel,
    VisitElapsed,
}

impl SchedulingEvent {
    pub const ALL: [SchedulingEvent; 9] = [
        SchedulingEvent::AcceptExact,
        SchedulingEvent::AcceptAllSlots,
        SchedulingEvent::Decline,
        SchedulingEvent::SelectSlot,
        SchedulingEvent::Confirm,
        SchedulingEvent::Reject,
        SchedulingEvent::Reschedule,
        SchedulingEvent::Cancel,
        SchedulingEvent::VisitElapsed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingEvent::AcceptExact => "accept-exact",
            SchedulingEvent::AcceptAllSlots => "accept-allSlots",
            SchedulingEvent::Decline => "decline",
            SchedulingEvent::SelectSlot => "select-slot",
            SchedulingEvent::Confirm => "confirm",
            SchedulingEvent::Reject => "reject",
            SchedulingEvent::Reschedule => "reschedule",
            SchedulingEvent::Cancel => "cancel",
            SchedulingEvent::VisitElapsed => "visit-elapsed",
        }
    }

    /// Whether `actor` may raise this event on `record`.
    pub fn authorize(&self, actor: Actor, record: &AppointmentRecord) -> Result<(), SchedulingError> {
        let is_host = actor == Actor::Host(record.host_id);
        let is_visitor = actor == Actor::Visitor(record.visitor_id);
        let allowed = match self {
            SchedulingEvent::AcceptExact
            | SchedulingEvent::AcceptAllSlots
            | SchedulingEvent::Decline
            | SchedulingEvent::Reschedule => is_host,
            SchedulingEvent::SelectSlot | SchedulingEvent::Confirm | SchedulingEvent::Reject => is_visitor,
            SchedulingEvent::Cancel => is_host || is_visitor,
            SchedulingEvent::VisitElapsed => is_host || actor == Actor::System,
        };
        if allowed {
            Ok(())
        } else {
            Err(SchedulingError::Forbidden(format!(
                "{actor} may not {} appointment {}",
                self.as_str(),
                record.id
            )))
        }
    }
}

impl fmt::Display for SchedulingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance(AppointmentStatus),
    /// The event already took effect; retrying it changes nothing.
    Replay,
}

/// Looks `event` up in the lifecycle table for the record's current status and response.
///
/// Time-based preconditions (reschedule not in the past, visit elapsed) and slot
/// occupancy are checked by the caller; this covers everything decidable from
/// the record alone.
pub fn plan_transition(
    record: &AppointmentRecord,
    event: SchedulingEvent,
) -> Result<Transition, SchedulingError> {
    use AppointmentStatus as S;
    use SchedulingEvent as E;

    let invalid = || SchedulingError::InvalidTransition {
        from: record.status,
        event,
    };

    match (record.status, event) {
        (S::Pending, E::AcceptExact | E::AcceptAllSlots) => Ok(Transition::Advance(S::Accepted)),
        (S::Pending, E::Decline) => Ok(Transition::Advance(S::HostRejected)),

        (S::Accepted, E::SelectSlot) => match &record.response {
            Some(HostResponse::AllSlots { chosen: None, .. }) => Ok(Transition::Advance(S::Accepted)),
            _ => Err(invalid()),
        },
        (S::Accepted, E::Confirm) => {
            if record.is_resolved() {
                Ok(Transition::Advance(S::Confirmed))
            } else {
                Err(SchedulingError::UnresolvedSchedule(record.id))
            }
        }
        (S::Accepted, E::Reject) => Ok(Transition::Advance(S::VisitorRejected)),
        (S::Accepted, E::Cancel) => Ok(Transition::Advance(S::Canceled)),

        (S::Confirmed, E::Reschedule) => Ok(Transition::Advance(S::Confirmed)),
        (S::Confirmed, E::Cancel) => Ok(Transition::Advance(S::Canceled)),
        (S::Confirmed, E::VisitElapsed) => Ok(Transition::Advance(S::Completed)),

        (S::HostRejected, E::Decline)
        | (S::VisitorRejected, E::Reject)
        | (S::Canceled, E::Cancel)
        | (S::Completed, E::VisitElapsed) => Ok(Transition::Replay),

        _ => Err(invalid()),
    }
}

/// Failure taxonomy shared by every layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("invalid time window: {0}")]
    InvalidRange(String),
    #[error("window overlaps slot {existing}")]
    Overlap { existing: SlotId },
    #[error("slot {0} is not available")]
    SlotUnavailable(SlotId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("slot {0} is booked; cancel its appointment instead")]
    SlotBooked(SlotId),
    #[error("appointment {0} has no resolved schedule")]
    UnresolvedSchedule(AppointmentId),
    #[error("{event} is not legal for a {from} appointment")]
    InvalidTransition {
        from: AppointmentStatus,
        event: SchedulingEvent,
    },
    #[error("visit ends at {0}; it cannot be completed before then")]
    VisitNotElapsed(NaiveDateTime),
    #[error("slot not found: {0}")]
    SlotNotFound(String),
    #[error("appointment {0} not found")]
    AppointmentNotFound(AppointmentId),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl SchedulingError {
    /// Stable label for logs and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulingError::InvalidRange(_) => "invalid_range",
            SchedulingError::Overlap { .. } => "overlap",
            SchedulingError::SlotUnavailable(_) => "slot_unavailable",
            SchedulingError::Conflict(_) => "conflict",
            SchedulingError::SlotBooked(_) => "slot_booked",
            SchedulingError::UnresolvedSchedule(_) => "unresolved_schedule",
            SchedulingError::InvalidTransition { .. } => "invalid_transition",
            SchedulingError::VisitNotElapsed(_) => "visit_not_elapsed",
            SchedulingError::SlotNotFound(_) => "slot_not_found",
            SchedulingError::AppointmentNotFound(_) => "appointment_not_found",
            SchedulingError::Forbidden(_) => "forbidden",
            SchedulingError::InvalidInput(_) => "invalid_input",
            SchedulingError::Storage(_) => "storage",
        }
    }

    /// Lost reservation races are worth retrying against fresh data; nothing else is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulingError::Conflict(_) | SchedulingError::SlotUnavailable(_)
        )
    }
}

/// Source of "now" in naive local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Settable clock, second precision.
#[derive(Debug)]
pub struct FixedClock {
    epoch_secs: AtomicI64,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            epoch_secs: AtomicI64::new(now.and_utc().timestamp()),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        self.epoch_secs.store(now.and_utc().timestamp(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        DateTime::from_timestamp(self.epoch_secs.load(Ordering::SeqCst), 0)
            .map(|ts| ts.naive_utc())
            .unwrap_or(NaiveDateTime::MIN)
    }
}
