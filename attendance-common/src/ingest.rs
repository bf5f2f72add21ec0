//! The event ingestion pipeline.
//!
//! Push-delivered and catch-up-polled events both land here, so there is a
//! single dedup/classification code path regardless of origin. Ingestion is
//! idempotent: the dedupe-key unique index settles duplicate deliveries and
//! concurrent races, and the loser of a race reads back the winner's rows.

use chrono::Utc;
use metrics::counter;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use crate::classify::{attendance_status_value, resolve_direction};
use crate::directory::{resolve_device, DirectoryError};
use crate::model::{
    AttendanceLog, Device, Direction, EventSource, NewAttendanceLog, NewRawEvent, RawEvent,
};
use crate::normalize::{event_root, int_of, string_of};
use crate::store::{AccessStore, PersistOutcome, StoreError};
use crate::time::parse_vendor_timestamp;
use crate::vendor::VendorClient;

/// The only vendor event type this pipeline ingests.
pub const ACCESS_CONTROLLER_EVENT: &str = "AccessControllerEvent";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Why an event was skipped without any row being written. None of these
/// are errors: irrelevant or unattributable pushes are routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not the supported access-control event type.
    IrrelevantEventType,
    /// The envelope carried no raw device identifier.
    MissingDeviceIndex,
    /// No device matched, even after a directory refresh. The event is
    /// dropped without an audit row: with no device there is no tenant to
    /// attribute the row to.
    UnresolvedDevice,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::IrrelevantEventType => "irrelevant_event_type",
            SkipReason::MissingDeviceIndex => "missing_device_index",
            SkipReason::UnresolvedDevice => "unresolved_device",
        }
    }
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// Nothing persisted; see the reason. Transport-level success.
    Skipped(SkipReason),
    /// The event is in the ledger. `deduplicated` is true when this call
    /// observed an already-ingested event and returned the existing rows.
    Ingested {
        raw_event: RawEvent,
        attendance: Option<AttendanceLog>,
        deduplicated: bool,
    },
}

/// Deterministic fingerprint of an event's identifying fields. The raw
/// timestamp string is hashed as received, not normalized: two spellings of
/// the same instant coming from the same device do not happen in practice,
/// and normalizing would make the key sensitive to parser changes.
pub fn dedupe_key(
    dev_index: &str,
    raw_timestamp: &str,
    person_hint: &str,
    serial_no: &str,
) -> String {
    let joined = [dev_index, raw_timestamp, person_hint, serial_no].join("|");
    let digest = Sha256::digest(joined.as_bytes());
    format!("{digest:x}")
}

/// Best available person identifier on the event.
fn person_hint(access_event: &Value) -> String {
    for key in ["employeeNoString", "employeeNo", "cardNo"] {
        let value = string_of(access_event.get(key));
        if !value.is_empty() {
            return value;
        }
    }
    String::new()
}

/// Re-wrap a bare event from the search API into the push envelope, so the
/// catch-up path funnels through the same pipeline as realtime pushes.
pub fn wrap_acs_event(device: &Device, acs_event: &Value) -> Value {
    let date_time = acs_event
        .get("dateTime")
        .or_else(|| acs_event.get("time"))
        .cloned()
        .unwrap_or(Value::Null);

    json!({
        "EventNotificationAlert": {
            "eventType": ACCESS_CONTROLLER_EVENT,
            "devIndex": device.dev_index,
            "dateTime": date_time,
            "AccessControllerEvent": acs_event,
        }
    })
}

/// Ingest one event payload.
///
/// Persists exactly 0, 1, or 2 rows: none when skipped or duplicated, the
/// raw event alone when classification says Ignore, and the raw event plus
/// its attendance log otherwise, atomically. A directory refresh may run as
/// a side effect of device resolution.
pub async fn ingest<S, V>(
    store: &S,
    vendor: &V,
    payload: &Value,
    source: EventSource,
    tenant_id: Option<i64>,
) -> Result<IngestOutcome, IngestError>
where
    S: AccessStore + ?Sized,
    V: VendorClient + ?Sized,
{
    let root = event_root(payload);
    if string_of(root.get("eventType")) != ACCESS_CONTROLLER_EVENT {
        return Ok(skipped(SkipReason::IrrelevantEventType, source));
    }

    let empty = Value::Object(Default::default());
    let access_event = root.get(ACCESS_CONTROLLER_EVENT).unwrap_or(&empty);

    let dev_index = string_of(root.get("devIndex"));
    if dev_index.is_empty() {
        return Ok(skipped(SkipReason::MissingDeviceIndex, source));
    }

    let Some(device) = resolve_device(store, vendor, &dev_index, tenant_id).await? else {
        warn!(dev_index = %dev_index, "dropping event for unresolvable device");
        return Ok(skipped(SkipReason::UnresolvedDevice, source));
    };

    let raw_timestamp = {
        let from_root = string_of(root.get("dateTime"));
        if from_root.is_empty() {
            string_of(access_event.get("time"))
        } else {
            from_root
        }
    };
    let event_datetime = parse_vendor_timestamp(&raw_timestamp).unwrap_or_else(Utc::now);

    let person = person_hint(access_event);
    let serial_no_raw = {
        let from_access = string_of(access_event.get("serialNo"));
        if from_access.is_empty() {
            string_of(root.get("serialNo"))
        } else {
            from_access
        }
    };
    let key = dedupe_key(&dev_index, &raw_timestamp, &person, &serial_no_raw);

    let attendance_status = attendance_status_value(access_event);
    let classification = resolve_direction(store, &device, access_event).await?;

    let raw = NewRawEvent {
        tenant_id: device.tenant_id,
        device_id: Some(device.id),
        dev_index: dev_index.clone(),
        event_type: ACCESS_CONTROLLER_EVENT.to_owned(),
        event_datetime,
        major_event_type: int_of(access_event.get("majorEventType")),
        sub_event_type: int_of(access_event.get("subEventType")),
        serial_no: int_of(access_event.get("serialNo")).or_else(|| int_of(root.get("serialNo"))),
        front_serial_no: int_of(access_event.get("frontSerialNo"))
            .or_else(|| int_of(root.get("frontSerialNo"))),
        employee_no: string_of(access_event.get("employeeNo")),
        employee_no_string: string_of(access_event.get("employeeNoString")),
        card_no: string_of(access_event.get("cardNo")),
        card_reader_no: int_of(access_event.get("cardReaderNo")),
        door_no: int_of(access_event.get("doorNo")),
        attendance_status: attendance_status.clone(),
        dedupe_key: key,
        payload: payload.clone(),
    };

    let attendance = (classification.direction != Direction::Ignore).then(|| NewAttendanceLog {
        tenant_id: device.tenant_id,
        person_id: person,
        device_id: device.id,
        timestamp: event_datetime,
        attendance_type: if attendance_status.is_empty() {
            if classification.authoritative {
                "unknown".to_owned()
            } else {
                "fallback".to_owned()
            }
        } else {
            attendance_status.clone()
        },
        attendance_status,
        direction: classification.direction,
        source,
    });

    match store.persist_event(raw, attendance).await? {
        PersistOutcome::Created {
            raw_event,
            attendance,
        } => {
            counter!("events_ingested_total", &[("source", source.as_str())]).increment(1);
            Ok(IngestOutcome::Ingested {
                raw_event,
                attendance,
                deduplicated: false,
            })
        }
        PersistOutcome::Duplicate {
            raw_event,
            attendance,
        } => {
            counter!("events_deduplicated_total", &[("source", source.as_str())]).increment(1);
            Ok(IngestOutcome::Ingested {
                raw_event,
                attendance,
                deduplicated: true,
            })
        }
    }
}

fn skipped(reason: SkipReason, source: EventSource) -> IngestOutcome {
    counter!(
        "events_skipped_total",
        &[("reason", reason.as_str()), ("source", source.as_str())]
    )
    .increment(1);
    IngestOutcome::Skipped(reason)
}
