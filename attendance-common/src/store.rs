//! Storage layer for the ingestion pipeline.
//!
//! The uniqueness constraints declared in the schema are the sole integrity
//! mechanism: duplicate suppression and the concurrent-ingest race are both
//! settled by the `dedupe_key` unique index, not by locks or advisory
//! checks in application code.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::model::{
    AttendanceLog, Device, DeviceCursor, Direction, Gateway, NewAttendanceLog, NewRawEvent,
    RawEvent, Tenant,
};
use crate::normalize::DeviceFields;

/// Errors from storage operations. Wraps sqlx errors to add the failing
/// command for context, as there is one variant per failure mode we react to.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("dedupe key {0} conflicted but the winning row was not visible yet")]
    DuplicateNotVisible(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of attempting to persist one event.
#[derive(Debug)]
pub enum PersistOutcome {
    /// The insert won: fresh rows were written, atomically.
    Created {
        raw_event: RawEvent,
        attendance: Option<AttendanceLog>,
    },
    /// The dedupe key was already present: the rows written by the earlier
    /// (or concurrent) ingestion of the same physical event.
    Duplicate {
        raw_event: RawEvent,
        attendance: Option<AttendanceLog>,
    },
}

/// Seam between the pipeline and the database, so that the pipeline,
/// classifier, and reconciler can be exercised against an in-memory
/// implementation in tests.
#[async_trait]
pub trait AccessStore: Send + Sync {
    async fn tenant_by_code(&self, code: &str) -> StoreResult<Option<Tenant>>;

    /// Device matching `dev_index` whose status says it is connected,
    /// scoped by tenant when one is known. The pick is deterministic
    /// (lowest id) when a tenant-less lookup is ambiguous.
    async fn connected_device(
        &self,
        dev_index: &str,
        tenant_id: Option<i64>,
    ) -> StoreResult<Option<Device>>;

    /// Same lookup restricted to one gateway, used between per-gateway
    /// directory refreshes.
    async fn connected_device_on_gateway(
        &self,
        gateway_id: i64,
        dev_index: &str,
    ) -> StoreResult<Option<Device>>;

    /// Any device matching `dev_index` regardless of status. Last-resort
    /// fallback because vendor status metadata lags reality.
    async fn any_device(&self, dev_index: &str, tenant_id: Option<i64>)
        -> StoreResult<Option<Device>>;

    async fn gateways(&self, tenant_id: Option<i64>) -> StoreResult<Vec<Gateway>>;

    async fn gateway_by_id(&self, gateway_id: i64) -> StoreResult<Option<Gateway>>;

    /// Upsert a device keyed on (tenant, dev_index). Populated columns are
    /// only overwritten by non-empty normalized values; a refresh never
    /// blanks a field the vendor stopped reporting.
    async fn upsert_device(
        &self,
        gateway: &Gateway,
        fields: &DeviceFields,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn reader_default(
        &self,
        device_id: i64,
        door_no: i32,
        card_reader_no: i32,
    ) -> StoreResult<Option<Direction>>;

    /// Insert the raw event and (when classification produced one) its
    /// attendance log in a single transaction. A dedupe-key conflict is not
    /// an error: the previously written rows are read back instead.
    async fn persist_event(
        &self,
        raw: NewRawEvent,
        attendance: Option<NewAttendanceLog>,
    ) -> StoreResult<PersistOutcome>;

    async fn devices(&self) -> StoreResult<Vec<Device>>;

    async fn cursor_for(&self, device: &Device) -> StoreResult<DeviceCursor>;

    async fn save_cursor(&self, cursor: &DeviceCursor) -> StoreResult<()>;
}

/// Status values the vendor uses for a reachable device. Matched
/// case-insensitively; anything else is treated as disconnected.
pub const CONNECTED_STATUSES: [&str; 3] = ["online", "active", "connected"];

/// Production store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgAccessStore {
    pool: PgPool,
}

impl PgAccessStore {
    pub fn new(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .connect_lazy(database_url)
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn raw_event_by_dedupe_key(&self, dedupe_key: &str) -> StoreResult<Option<RawEvent>> {
        sqlx::query_as::<_, RawEvent>("SELECT * FROM raw_event WHERE dedupe_key = $1")
            .bind(dedupe_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT raw_event".to_owned(),
                error,
            })
    }

    async fn attendance_for(&self, raw_event_id: i64) -> StoreResult<Option<AttendanceLog>> {
        sqlx::query_as::<_, AttendanceLog>("SELECT * FROM attendance_log WHERE raw_event_id = $1")
            .bind(raw_event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT attendance_log".to_owned(),
                error,
            })
    }
}

#[async_trait]
impl AccessStore for PgAccessStore {
    async fn tenant_by_code(&self, code: &str) -> StoreResult<Option<Tenant>> {
        sqlx::query_as::<_, Tenant>("SELECT * FROM tenant WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT tenant".to_owned(),
                error,
            })
    }

    async fn connected_device(
        &self,
        dev_index: &str,
        tenant_id: Option<i64>,
    ) -> StoreResult<Option<Device>> {
        sqlx::query_as::<_, Device>(
            r#"
SELECT * FROM device
WHERE dev_index = $1
  AND LOWER(status) = ANY($2)
  AND ($3::BIGINT IS NULL OR tenant_id = $3)
ORDER BY id
LIMIT 1
            "#,
        )
        .bind(dev_index)
        .bind(&CONNECTED_STATUSES[..])
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT device".to_owned(),
            error,
        })
    }

    async fn connected_device_on_gateway(
        &self,
        gateway_id: i64,
        dev_index: &str,
    ) -> StoreResult<Option<Device>> {
        sqlx::query_as::<_, Device>(
            r#"
SELECT * FROM device
WHERE gateway_id = $1
  AND dev_index = $2
  AND LOWER(status) = ANY($3)
ORDER BY id
LIMIT 1
            "#,
        )
        .bind(gateway_id)
        .bind(dev_index)
        .bind(&CONNECTED_STATUSES[..])
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT device".to_owned(),
            error,
        })
    }

    async fn any_device(
        &self,
        dev_index: &str,
        tenant_id: Option<i64>,
    ) -> StoreResult<Option<Device>> {
        sqlx::query_as::<_, Device>(
            r#"
SELECT * FROM device
WHERE dev_index = $1
  AND ($2::BIGINT IS NULL OR tenant_id = $2)
ORDER BY id
LIMIT 1
            "#,
        )
        .bind(dev_index)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT device".to_owned(),
            error,
        })
    }

    async fn gateways(&self, tenant_id: Option<i64>) -> StoreResult<Vec<Gateway>> {
        sqlx::query_as::<_, Gateway>(
            "SELECT * FROM gateway WHERE ($1::BIGINT IS NULL OR tenant_id = $1) ORDER BY id",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT gateway".to_owned(),
            error,
        })
    }

    async fn gateway_by_id(&self, gateway_id: i64) -> StoreResult<Option<Gateway>> {
        sqlx::query_as::<_, Gateway>("SELECT * FROM gateway WHERE id = $1")
            .bind(gateway_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT gateway".to_owned(),
                error,
            })
    }

    async fn upsert_device(
        &self,
        gateway: &Gateway,
        fields: &DeviceFields,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO device
    (gateway_id, tenant_id, serial_number, dev_index, device_id, device_name,
     protocol_type, device_type, status, offline_hint, last_seen_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT (tenant_id, dev_index) DO UPDATE SET
    gateway_id = EXCLUDED.gateway_id,
    serial_number = COALESCE(NULLIF(EXCLUDED.serial_number, ''), device.serial_number),
    device_id = COALESCE(NULLIF(EXCLUDED.device_id, ''), device.device_id),
    device_name = COALESCE(NULLIF(EXCLUDED.device_name, ''), device.device_name),
    protocol_type = COALESCE(NULLIF(EXCLUDED.protocol_type, ''), device.protocol_type),
    device_type = COALESCE(NULLIF(EXCLUDED.device_type, ''), device.device_type),
    status = COALESCE(NULLIF(EXCLUDED.status, ''), device.status),
    offline_hint = COALESCE(NULLIF(EXCLUDED.offline_hint, ''), device.offline_hint),
    last_seen_at = COALESCE(EXCLUDED.last_seen_at, device.last_seen_at),
    updated_at = NOW()
            "#,
        )
        .bind(gateway.id)
        .bind(gateway.tenant_id)
        .bind(&fields.serial_number)
        .bind(&fields.dev_index)
        .bind("")
        .bind(&fields.device_name)
        .bind(&fields.protocol_type)
        .bind(&fields.device_type)
        .bind(&fields.status)
        .bind(&fields.offline_hint)
        .bind(last_seen_at)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPSERT device".to_owned(),
            error,
        })?;

        Ok(())
    }

    async fn reader_default(
        &self,
        device_id: i64,
        door_no: i32,
        card_reader_no: i32,
    ) -> StoreResult<Option<Direction>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
SELECT direction_default FROM device_reader_config
WHERE device_id = $1 AND door_no = $2 AND card_reader_no = $3
            "#,
        )
        .bind(device_id)
        .bind(door_no)
        .bind(card_reader_no)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT device_reader_config".to_owned(),
            error,
        })?;

        Ok(row.and_then(|(value,)| Direction::from_str(&value).ok()))
    }

    async fn persist_event(
        &self,
        raw: NewRawEvent,
        attendance: Option<NewAttendanceLog>,
    ) -> StoreResult<PersistOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let inserted: Option<RawEvent> = sqlx::query_as(
            r#"
INSERT INTO raw_event
    (tenant_id, device_id, dev_index, event_type, event_datetime,
     major_event_type, sub_event_type, serial_no, front_serial_no,
     employee_no, employee_no_string, card_no, card_reader_no, door_no,
     attendance_status, dedupe_key, payload)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
ON CONFLICT (dedupe_key) DO NOTHING
RETURNING *
            "#,
        )
        .bind(raw.tenant_id)
        .bind(raw.device_id)
        .bind(&raw.dev_index)
        .bind(&raw.event_type)
        .bind(raw.event_datetime)
        .bind(raw.major_event_type)
        .bind(raw.sub_event_type)
        .bind(raw.serial_no)
        .bind(raw.front_serial_no)
        .bind(&raw.employee_no)
        .bind(&raw.employee_no_string)
        .bind(&raw.card_no)
        .bind(raw.card_reader_no)
        .bind(raw.door_no)
        .bind(&raw.attendance_status)
        .bind(&raw.dedupe_key)
        .bind(sqlx::types::Json(&raw.payload))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT raw_event".to_owned(),
            error,
        })?;

        let Some(raw_event) = inserted else {
            // Lost the dedupe-key race (or the event was delivered twice).
            // Roll the empty transaction back and read the winner's rows.
            tx.rollback().await.ok();

            let existing = self
                .raw_event_by_dedupe_key(&raw.dedupe_key)
                .await?
                .ok_or_else(|| StoreError::DuplicateNotVisible(raw.dedupe_key.clone()))?;
            let attendance = self.attendance_for(existing.id).await?;

            return Ok(PersistOutcome::Duplicate {
                raw_event: existing,
                attendance,
            });
        };

        let attendance_row = match attendance {
            Some(new_log) => {
                let row: AttendanceLog = sqlx::query_as(
                    r#"
INSERT INTO attendance_log
    (tenant_id, person_id, device_id, timestamp, attendance_type,
     attendance_status, direction, source, raw_event_id)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9)
RETURNING *
                    "#,
                )
                .bind(new_log.tenant_id)
                .bind(&new_log.person_id)
                .bind(new_log.device_id)
                .bind(new_log.timestamp)
                .bind(&new_log.attendance_type)
                .bind(&new_log.attendance_status)
                .bind(new_log.direction.as_str())
                .bind(new_log.source.as_str())
                .bind(raw_event.id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "INSERT attendance_log".to_owned(),
                    error,
                })?;

                Some(row)
            }
            None => None,
        };

        tx.commit().await.map_err(|error| StoreError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(PersistOutcome::Created {
            raw_event,
            attendance: attendance_row,
        })
    }

    async fn devices(&self) -> StoreResult<Vec<Device>> {
        sqlx::query_as::<_, Device>("SELECT * FROM device ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT device".to_owned(),
                error,
            })
    }

    async fn cursor_for(&self, device: &Device) -> StoreResult<DeviceCursor> {
        sqlx::query_as::<_, DeviceCursor>(
            r#"
INSERT INTO device_cursor (tenant_id, device_id)
VALUES ($1, $2)
ON CONFLICT (device_id) DO UPDATE SET device_id = EXCLUDED.device_id
RETURNING tenant_id, device_id, last_event_time, last_search_id, last_result_position
            "#,
        )
        .bind(device.tenant_id)
        .bind(device.id)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPSERT device_cursor".to_owned(),
            error,
        })
    }

    async fn save_cursor(&self, cursor: &DeviceCursor) -> StoreResult<()> {
        sqlx::query(
            r#"
UPDATE device_cursor
SET last_event_time = $2,
    last_search_id = $3,
    last_result_position = $4,
    updated_at = NOW()
WHERE device_id = $1
            "#,
        )
        .bind(cursor.device_id)
        .bind(cursor.last_event_time)
        .bind(&cursor.last_search_id)
        .bind(cursor.last_result_position)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE device_cursor".to_owned(),
            error,
        })?;

        Ok(())
    }
}
