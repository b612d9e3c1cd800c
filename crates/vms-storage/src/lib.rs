//! Availability slot and appointment record stores (in-memory + PostgreSQL).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;
use vms_core::{
    AppointmentId, AppointmentRecord, AppointmentStatus, AvailabilitySlot, HostId, OccupancyStats,
    SchedulingError, SlotId, SlotStatus, TimeWindow, VisitorId,
};

pub const CRATE_NAME: &str = "vms-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("slot {0} not found")]
    SlotNotFound(SlotId),
    #[error("appointment {0} not found")]
    AppointmentNotFound(AppointmentId),
    #[error("appointment {0} already exists")]
    DuplicateAppointment(AppointmentId),
    #[error("window overlaps slot {0}")]
    Overlap(SlotId),
    #[error("slot {0} is not available")]
    SlotUnavailable(SlotId),
    #[error("slot {0} is booked")]
    SlotBooked(SlotId),
    #[error("appointment {id} no longer at version {expected}")]
    VersionMismatch { id: AppointmentId, expected: u64 },
    #[error("invalid time window: {0}")]
    InvalidRange(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<StoreError> for SchedulingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SlotNotFound(id) => SchedulingError::SlotNotFound(id.to_string()),
            StoreError::AppointmentNotFound(id) => SchedulingError::AppointmentNotFound(id),
            StoreError::DuplicateAppointment(id) => {
                SchedulingError::Conflict(format!("appointment {id} already exists"))
            }
            StoreError::Overlap(existing) => SchedulingError::Overlap { existing },
            StoreError::SlotUnavailable(id) => SchedulingError::SlotUnavailable(id),
            StoreError::SlotBooked(id) => SchedulingError::SlotBooked(id),
            StoreError::VersionMismatch { id, expected } => SchedulingError::Conflict(format!(
                "appointment {id} was modified concurrently (expected version {expected})"
            )),
            StoreError::InvalidRange(msg) => SchedulingError::InvalidRange(msg),
            StoreError::Database(err) => SchedulingError::Storage(err.to_string()),
            StoreError::Corrupt(msg) => SchedulingError::Storage(msg),
        }
    }
}

/// Published availability, per host.
///
/// `reserve` is the only path from `available` to `booked` and must be a
/// compare-and-swap: of any number of concurrent callers targeting one slot,
/// exactly one succeeds.
#[async_trait]
pub trait SlotStore: Send + Sync {
    async fn publish(
        &self,
        host_id: HostId,
        window: TimeWindow,
        now: NaiveDateTime,
    ) -> Result<AvailabilitySlot, StoreError>;

    async fn get(&self, slot_id: SlotId) -> Result<AvailabilitySlot, StoreError>;

    /// Removes an `available` slot. Booked slots are refused with `SlotBooked`.
    async fn delete(&self, slot_id: SlotId) -> Result<AvailabilitySlot, StoreError>;

    /// Books an `available` slot for `holder`, stamping `held_since = now`.
    async fn reserve(
        &self,
        slot_id: SlotId,
        holder: AppointmentId,
        now: NaiveDateTime,
    ) -> Result<AvailabilitySlot, StoreError>;

    /// Frees the slot if `holder` holds it. Returns whether anything changed;
    /// missing slots and slots held by someone else are a no-op.
    async fn release(&self, slot_id: SlotId, holder: AppointmentId) -> Result<bool, StoreError>;

    /// Slots dated within `from..=to`, ordered by `(date, start)`.
    async fn list_by_host_and_range(
        &self,
        host_id: HostId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AvailabilitySlot>, StoreError>;

    /// Slot with exactly this window, preferring an available one.
    async fn find_by_window(
        &self,
        host_id: HostId,
        window: TimeWindow,
    ) -> Result<Option<AvailabilitySlot>, StoreError>;

    async fn occupancy(&self, host_id: HostId) -> Result<OccupancyStats, StoreError>;

    /// Every booked slot, with its holder.
    async fn list_booked(&self) -> Result<Vec<AvailabilitySlot>, StoreError>;
}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn insert(&self, record: AppointmentRecord) -> Result<AppointmentRecord, StoreError>;

    async fn get(&self, id: AppointmentId) -> Result<AppointmentRecord, StoreError>;

    /// Writes `record` only if the stored copy is still at `expected_version`.
    async fn update(
        &self,
        record: AppointmentRecord,
        expected_version: u64,
    ) -> Result<AppointmentRecord, StoreError>;

    async fn list_by_host(&self, host_id: HostId) -> Result<Vec<AppointmentRecord>, StoreError>;

    async fn list_by_visitor(&self, visitor_id: VisitorId)
        -> Result<Vec<AppointmentRecord>, StoreError>;

    async fn list_by_status(
        &self,
        status: AppointmentStatus,
    ) -> Result<Vec<AppointmentRecord>, StoreError>;
}

fn validate_window(window: &TimeWindow) -> Result<(), StoreError> {
    window.validate().map_err(|err| match err {
        SchedulingError::InvalidRange(msg) => StoreError::InvalidRange(msg),
        other => StoreError::InvalidRange(other.to_string()),
    })
}

fn sort_slots(slots: &mut [AvailabilitySlot]) {
    slots.sort_by(|a, b| {
        (a.window.date, a.window.start, a.window.end, a.id)
            .cmp(&(b.window.date, b.window.start, b.window.end, b.id))
    });
}

fn sort_newest_first(records: &mut [AppointmentRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
}

#[derive(Debug, Default)]
struct HostSlots {
    slots: HashMap<SlotId, AvailabilitySlot>,
}

impl HostSlots {
    /// Any slot of this host whose window overlaps, booked or not. Booked
    /// windows count because a later release would make both bookable.
    fn overlapping(&self, window: &TimeWindow) -> Option<SlotId> {
        let mut clashes = self
            .slots
            .values()
            .filter(|slot| slot.window.overlaps(window))
            .map(|slot| slot.id)
            .collect::<Vec<_>>();
        clashes.sort();
        clashes.into_iter().next()
    }
}

/// Process-local slot store. Each host's slots sit behind their own lock, so
/// operations on different hosts never contend.
#[derive(Debug, Default)]
pub struct InMemorySlotStore {
    hosts: Mutex<HashMap<HostId, Arc<Mutex<HostSlots>>>>,
    index: Mutex<HashMap<SlotId, HostId>>,
}

impl InMemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn host_shard(&self, host_id: HostId) -> Arc<Mutex<HostSlots>> {
        let mut hosts = self.hosts.lock().await;
        hosts.entry(host_id).or_default().clone()
    }

    async fn shard_for_slot(&self, slot_id: SlotId) -> Option<Arc<Mutex<HostSlots>>> {
        let host_id = self.index.lock().await.get(&slot_id).copied()?;
        Some(self.host_shard(host_id).await)
    }
}

#[async_trait]
impl SlotStore for InMemorySlotStore {
    async fn publish(
        &self,
        host_id: HostId,
        window: TimeWindow,
        now: NaiveDateTime,
    ) -> Result<AvailabilitySlot, StoreError> {
        validate_window(&window)?;
        let shard = self.host_shard(host_id).await;
        let mut shard = shard.lock().await;
        if let Some(existing) = shard.overlapping(&window) {
            return Err(StoreError::Overlap(existing));
        }
        let slot = AvailabilitySlot::publish(host_id, window, now);
        shard.slots.insert(slot.id, slot.clone());
        self.index.lock().await.insert(slot.id, host_id);
        Ok(slot)
    }

    async fn get(&self, slot_id: SlotId) -> Result<AvailabilitySlot, StoreError> {
        let shard = self
            .shard_for_slot(slot_id)
            .await
            .ok_or(StoreError::SlotNotFound(slot_id))?;
        let shard = shard.lock().await;
        shard
            .slots
            .get(&slot_id)
            .cloned()
            .ok_or(StoreError::SlotNotFound(slot_id))
    }

    async fn delete(&self, slot_id: SlotId) -> Result<AvailabilitySlot, StoreError> {
        let shard = self
            .shard_for_slot(slot_id)
            .await
            .ok_or(StoreError::SlotNotFound(slot_id))?;
        let mut shard = shard.lock().await;
        match shard.slots.get(&slot_id) {
            None => return Err(StoreError::SlotNotFound(slot_id)),
            Some(slot) if !slot.is_available() => return Err(StoreError::SlotBooked(slot_id)),
            Some(_) => {}
        }
        let removed = shard
            .slots
            .remove(&slot_id)
            .ok_or(StoreError::SlotNotFound(slot_id))?;
        self.index.lock().await.remove(&slot_id);
        Ok(removed)
    }

    async fn reserve(
        &self,
        slot_id: SlotId,
        holder: AppointmentId,
        now: NaiveDateTime,
    ) -> Result<AvailabilitySlot, StoreError> {
        let shard = self
            .shard_for_slot(slot_id)
            .await
            .ok_or(StoreError::SlotNotFound(slot_id))?;
        let mut shard = shard.lock().await;
        let slot = shard
            .slots
            .get_mut(&slot_id)
            .ok_or(StoreError::SlotNotFound(slot_id))?;
        if !slot.is_available() {
            return Err(StoreError::SlotUnavailable(slot_id));
        }
        slot.status = SlotStatus::Booked;
        slot.held_by = Some(holder);
        slot.held_since = Some(now);
        Ok(slot.clone())
    }

    async fn release(&self, slot_id: SlotId, holder: AppointmentId) -> Result<bool, StoreError> {
        let Some(shard) = self.shard_for_slot(slot_id).await else {
            return Ok(false);
        };
        let mut shard = shard.lock().await;
        match shard.slots.get_mut(&slot_id) {
            Some(slot) if slot.is_held_by(holder) => {
                slot.status = SlotStatus::Available;
                slot.held_by = None;
                slot.held_since = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_host_and_range(
        &self,
        host_id: HostId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AvailabilitySlot>, StoreError> {
        let shard = self.host_shard(host_id).await;
        let shard = shard.lock().await;
        let mut slots = shard
            .slots
            .values()
            .filter(|slot| slot.window.date >= from && slot.window.date <= to)
            .cloned()
            .collect::<Vec<_>>();
        sort_slots(&mut slots);
        Ok(slots)
    }

    async fn find_by_window(
        &self,
        host_id: HostId,
        window: TimeWindow,
    ) -> Result<Option<AvailabilitySlot>, StoreError> {
        let shard = self.host_shard(host_id).await;
        let shard = shard.lock().await;
        let mut matches = shard
            .slots
            .values()
            .filter(|slot| slot.window == window)
            .cloned()
            .collect::<Vec<_>>();
        matches.sort_by_key(|slot| (!slot.is_available(), slot.id));
        Ok(matches.into_iter().next())
    }

    async fn occupancy(&self, host_id: HostId) -> Result<OccupancyStats, StoreError> {
        let shard = self.host_shard(host_id).await;
        let shard = shard.lock().await;
        Ok(OccupancyStats::from_slots(shard.slots.values()))
    }

    async fn list_booked(&self) -> Result<Vec<AvailabilitySlot>, StoreError> {
        let shards = self.hosts.lock().await.values().cloned().collect::<Vec<_>>();
        let mut booked = Vec::new();
        for shard in shards {
            let shard = shard.lock().await;
            booked.extend(shard.slots.values().filter(|slot| !slot.is_available()).cloned());
        }
        sort_slots(&mut booked);
        Ok(booked)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAppointmentStore {
    records: Mutex<BTreeMap<AppointmentId, AppointmentRecord>>,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn filtered(&self, keep: impl Fn(&AppointmentRecord) -> bool) -> Vec<AppointmentRecord> {
        let records = self.records.lock().await;
        let mut out = records.values().filter(|r| keep(r)).cloned().collect::<Vec<_>>();
        sort_newest_first(&mut out);
        out
    }
}

#[async_trait]
impl AppointmentStore for InMemoryAppointmentStore {
    async fn insert(&self, record: AppointmentRecord) -> Result<AppointmentRecord, StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::DuplicateAppointment(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: AppointmentId) -> Result<AppointmentRecord, StoreError> {
        self.records
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::AppointmentNotFound(id))
    }

    async fn update(
        &self,
        record: AppointmentRecord,
        expected_version: u64,
    ) -> Result<AppointmentRecord, StoreError> {
        let mut records = self.records.lock().await;
        let current = records
            .get_mut(&record.id)
            .ok_or(StoreError::AppointmentNotFound(record.id))?;
        if current.version != expected_version {
            return Err(StoreError::VersionMismatch {
                id: record.id,
                expected: expected_version,
            });
        }
        *current = record.clone();
        Ok(record)
    }

    async fn list_by_host(&self, host_id: HostId) -> Result<Vec<AppointmentRecord>, StoreError> {
        Ok(self.filtered(|r| r.host_id == host_id).await)
    }

    async fn list_by_visitor(
        &self,
        visitor_id: VisitorId,
    ) -> Result<Vec<AppointmentRecord>, StoreError> {
        Ok(self.filtered(|r| r.visitor_id == visitor_id).await)
    }

    async fn list_by_status(
        &self,
        status: AppointmentStatus,
    ) -> Result<Vec<AppointmentRecord>, StoreError> {
        Ok(self.filtered(|r| r.status == status).await)
    }
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying migrations")
}

const SLOT_COLUMNS: &str =
    "id, host_id, slot_date, start_time, end_time, status, held_by, held_since, created_at";

fn slot_from_row(row: &PgRow) -> Result<AvailabilitySlot, StoreError> {
    let status: String = row.try_get("status")?;
    let held_by: Option<Uuid> = row.try_get("held_by")?;
    let date: NaiveDate = row.try_get("slot_date")?;
    let start: NaiveTime = row.try_get("start_time")?;
    let end: NaiveTime = row.try_get("end_time")?;
    Ok(AvailabilitySlot {
        id: SlotId(row.try_get("id")?),
        host_id: HostId(row.try_get("host_id")?),
        window: TimeWindow::new(date, start, end)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?,
        status: status
            .parse::<SlotStatus>()
            .map_err(|err| StoreError::Corrupt(err.to_string()))?,
        held_by: held_by.map(AppointmentId),
        held_since: row.try_get("held_since")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Slot store over the `availability_slots` table.
#[derive(Debug, Clone)]
pub struct PgSlotStore {
    pool: PgPool,
}

impl PgSlotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SlotStore for PgSlotStore {
    async fn publish(
        &self,
        host_id: HostId,
        window: TimeWindow,
        now: NaiveDateTime,
    ) -> Result<AvailabilitySlot, StoreError> {
        validate_window(&window)?;
        let mut tx = self.pool.begin().await?;
        // Serialises publishes per host so the overlap check below cannot race.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))")
            .bind(host_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        let clash = sqlx::query(
            r#"
            SELECT id
              FROM availability_slots
             WHERE host_id = $1
               AND slot_date = $2
               AND start_time < $4
               AND $3 < end_time
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(host_id.as_uuid())
        .bind(window.date)
        .bind(window.start)
        .bind(window.end)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = clash {
            return Err(StoreError::Overlap(SlotId(row.try_get("id")?)));
        }

        let slot = AvailabilitySlot::publish(host_id, window, now);
        sqlx::query(
            r#"
            INSERT INTO availability_slots
                   (id, host_id, slot_date, start_time, end_time, status, held_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NULL, $7)
            "#,
        )
        .bind(slot.id.as_uuid())
        .bind(host_id.as_uuid())
        .bind(window.date)
        .bind(window.start)
        .bind(window.end)
        .bind(slot.status.as_str())
        .bind(slot.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(slot_id = %slot.id, %host_id, "slot row inserted");
        Ok(slot)
    }

    async fn get(&self, slot_id: SlotId) -> Result<AvailabilitySlot, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SLOT_COLUMNS} FROM availability_slots WHERE id = $1"
        ))
        .bind(slot_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::SlotNotFound(slot_id))?;
        slot_from_row(&row)
    }

    async fn delete(&self, slot_id: SlotId) -> Result<AvailabilitySlot, StoreError> {
        let row = sqlx::query(&format!(
            "DELETE FROM availability_slots WHERE id = $1 AND status = 'available' RETURNING {SLOT_COLUMNS}"
        ))
        .bind(slot_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => slot_from_row(&row),
            None => {
                // Either gone or booked; a fresh read tells which.
                self.get(slot_id).await?;
                Err(StoreError::SlotBooked(slot_id))
            }
        }
    }

    async fn reserve(
        &self,
        slot_id: SlotId,
        holder: AppointmentId,
        now: NaiveDateTime,
    ) -> Result<AvailabilitySlot, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE availability_slots
               SET status = 'booked',
                   held_by = $2,
                   held_since = $3
             WHERE id = $1
               AND status = 'available'
            RETURNING {SLOT_COLUMNS}
            "#
        ))
        .bind(slot_id.as_uuid())
        .bind(holder.as_uuid())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => slot_from_row(&row),
            None => {
                self.get(slot_id).await?;
                Err(StoreError::SlotUnavailable(slot_id))
            }
        }
    }

    async fn release(&self, slot_id: SlotId, holder: AppointmentId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE availability_slots
               SET status = 'available',
                   held_by = NULL,
                   held_since = NULL
             WHERE id = $1
               AND held_by = $2
            "#,
        )
        .bind(slot_id.as_uuid())
        .bind(holder.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_host_and_range(
        &self,
        host_id: HostId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AvailabilitySlot>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SLOT_COLUMNS}
              FROM availability_slots
             WHERE host_id = $1
               AND slot_date BETWEEN $2 AND $3
             ORDER BY slot_date, start_time, end_time, id
            "#
        ))
        .bind(host_id.as_uuid())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(slot_from_row).collect()
    }

    async fn find_by_window(
        &self,
        host_id: HostId,
        window: TimeWindow,
    ) -> Result<Option<AvailabilitySlot>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SLOT_COLUMNS}
              FROM availability_slots
             WHERE host_id = $1
               AND slot_date = $2
               AND start_time = $3
               AND end_time = $4
             ORDER BY (status = 'available') DESC, id
             LIMIT 1
            "#
        ))
        .bind(host_id.as_uuid())
        .bind(window.date)
        .bind(window.start)
        .bind(window.end)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(slot_from_row).transpose()
    }

    async fn occupancy(&self, host_id: HostId) -> Result<OccupancyStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'available') AS available,
                   COUNT(*) FILTER (WHERE status = 'booked') AS booked
              FROM availability_slots
             WHERE host_id = $1
            "#,
        )
        .bind(host_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        let count = |name: &str| -> Result<usize, StoreError> {
            let value: i64 = row.try_get(name)?;
            usize::try_from(value).map_err(|err| StoreError::Corrupt(err.to_string()))
        };
        Ok(OccupancyStats {
            total: count("total")?,
            available: count("available")?,
            booked: count("booked")?,
        })
    }

    async fn list_booked(&self) -> Result<Vec<AvailabilitySlot>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SLOT_COLUMNS} FROM availability_slots WHERE status = 'booked' ORDER BY slot_date, start_time, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(slot_from_row).collect()
    }
}

fn record_from_row(row: &PgRow) -> Result<AppointmentRecord, StoreError> {
    let data: serde_json::Value = row.try_get("data_json")?;
    serde_json::from_value(data).map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn version_param(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|err| StoreError::Corrupt(format!("version {version}: {err}")))
}

/// Appointment store keeping the full record as JSONB next to indexed columns.
#[derive(Debug, Clone)]
pub struct PgAppointmentStore {
    pool: PgPool,
}

impl PgAppointmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Records whose indexed `column` equals `value`, newest first.
    async fn list_where<V>(&self, column: &str, value: V) -> Result<Vec<AppointmentRecord>, StoreError>
    where
        V: for<'q> sqlx::Encode<'q, Postgres> + sqlx::Type<Postgres> + Send + 'static,
    {
        let rows = sqlx::query(&format!(
            "SELECT data_json FROM appointments WHERE {column} = $1 ORDER BY created_at DESC, id"
        ))
        .bind(value)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl AppointmentStore for PgAppointmentStore {
    async fn insert(&self, record: AppointmentRecord) -> Result<AppointmentRecord, StoreError> {
        let data = serde_json::to_value(&record).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO appointments
                   (id, host_id, visitor_id, status, version, data_json, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.host_id.as_uuid())
        .bind(record.visitor_id.as_uuid())
        .bind(record.status.as_str())
        .bind(version_param(record.version)?)
        .bind(data)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateAppointment(record.id));
        }
        Ok(record)
    }

    async fn get(&self, id: AppointmentId) -> Result<AppointmentRecord, StoreError> {
        let row = sqlx::query("SELECT data_json FROM appointments WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::AppointmentNotFound(id))?;
        record_from_row(&row)
    }

    async fn update(
        &self,
        record: AppointmentRecord,
        expected_version: u64,
    ) -> Result<AppointmentRecord, StoreError> {
        let data = serde_json::to_value(&record).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE appointments
               SET status = $3,
                   version = $4,
                   data_json = $5,
                   updated_at = $6
             WHERE id = $1
               AND version = $2
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(version_param(expected_version)?)
        .bind(record.status.as_str())
        .bind(version_param(record.version)?)
        .bind(data)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.get(record.id).await?;
            return Err(StoreError::VersionMismatch {
                id: record.id,
                expected: expected_version,
            });
        }
        Ok(record)
    }

    async fn list_by_host(&self, host_id: HostId) -> Result<Vec<AppointmentRecord>, StoreError> {
        self.list_where("host_id", host_id.as_uuid()).await
    }

    async fn list_by_visitor(
        &self,
        visitor_id: VisitorId,
    ) -> Result<Vec<AppointmentRecord>, StoreError> {
        self.list_where("visitor_id", visitor_id.as_uuid()).await
    }

    async fn list_by_status(
        &self,
        status: AppointmentStatus,
    ) -> Result<Vec<AppointmentRecord>, StoreError> {
        self.list_where("status", status.as_str().to_string()).await
    }
}
