use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classified attendance direction for an access event.
///
/// `Ignore` marks events that are not attendance signals at all (tamper,
/// duress, administrative codes). It is distinct from `Unknown`, which is an
/// attendance signal we could not classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    Unknown,
    Ignore,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
            Direction::Unknown => "UNKNOWN",
            Direction::Ignore => "IGNORE",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseDirectionError(pub String);

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN" => Ok(Direction::In),
            "OUT" => Ok(Direction::Out),
            "UNKNOWN" => Ok(Direction::Unknown),
            "IGNORE" => Ok(Direction::Ignore),
            invalid => Err(ParseDirectionError(invalid.to_owned())),
        }
    }
}

/// Origin of an ingested event: delivered by the push channel or recovered
/// by the catch-up reconciler. Both funnel through the same pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Realtime,
    Catchup,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Realtime => "realtime",
            EventSource::Catchup => "catchup",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Isolation boundary. Owned by the provisioning surface; read-only here.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub code: String,
}

/// One vendor API endpoint plus credentials, owned by exactly one tenant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Gateway {
    pub id: i64,
    pub tenant_id: i64,
    pub base_url: String,
    pub username: String,
    pub password: String,
}

/// A physical access device.
///
/// `dev_index` is only unique within a tenant: two tenants sharing a vendor
/// backend can be handed the same raw identifier, so every lookup has to be
/// tenant-scoped wherever a tenant is known.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub gateway_id: i64,
    pub tenant_id: i64,
    pub serial_number: String,
    pub dev_index: String,
    pub device_id: String,
    pub device_name: String,
    pub protocol_type: String,
    pub device_type: String,
    pub status: String,
    pub offline_hint: String,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Immutable audit record of one ingested vendor event.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawEvent {
    pub id: i64,
    pub tenant_id: i64,
    pub device_id: Option<i64>,
    pub dev_index: String,
    pub event_type: String,
    pub event_datetime: DateTime<Utc>,
    pub major_event_type: Option<i32>,
    pub sub_event_type: Option<i32>,
    pub serial_no: Option<i32>,
    pub front_serial_no: Option<i32>,
    pub employee_no: String,
    pub employee_no_string: String,
    pub card_no: String,
    pub card_reader_no: Option<i32>,
    pub door_no: Option<i32>,
    pub attendance_status: String,
    pub dedupe_key: String,
    pub payload: sqlx::types::Json<serde_json::Value>,
}

/// Field values for a raw event row, before it is persisted.
#[derive(Debug, Clone)]
pub struct NewRawEvent {
    pub tenant_id: i64,
    pub device_id: Option<i64>,
    pub dev_index: String,
    pub event_type: String,
    pub event_datetime: DateTime<Utc>,
    pub major_event_type: Option<i32>,
    pub sub_event_type: Option<i32>,
    pub serial_no: Option<i32>,
    pub front_serial_no: Option<i32>,
    pub employee_no: String,
    pub employee_no_string: String,
    pub card_no: String,
    pub card_reader_no: Option<i32>,
    pub door_no: Option<i32>,
    pub attendance_status: String,
    pub dedupe_key: String,
    pub payload: serde_json::Value,
}

/// Derived attendance interpretation of a raw event, 1:1 with it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttendanceLog {
    pub id: i64,
    pub tenant_id: i64,
    pub person_id: String,
    pub device_id: i64,
    pub timestamp: DateTime<Utc>,
    pub attendance_type: String,
    pub attendance_status: String,
    pub direction: String,
    pub source: String,
    pub raw_event_id: i64,
}

#[derive(Debug, Clone)]
pub struct NewAttendanceLog {
    pub tenant_id: i64,
    pub person_id: String,
    pub device_id: i64,
    pub timestamp: DateTime<Utc>,
    pub attendance_type: String,
    pub attendance_status: String,
    pub direction: Direction,
    pub source: EventSource,
}

/// Per-device catch-up watermark. `last_event_time` only advances to event
/// times the reconciler actually confirmed, never to "now".
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceCursor {
    pub tenant_id: i64,
    pub device_id: i64,
    pub last_event_time: Option<DateTime<Utc>>,
    pub last_search_id: String,
    pub last_result_position: i32,
}

/// Static per-(device, door, reader) default direction, used as a
/// classification fallback for bare authentication-success events.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceReaderConfig {
    pub device_id: i64,
    pub door_no: i32,
    pub card_reader_no: i32,
    pub direction_default: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_round_trips_through_strings() {
        for direction in [
            Direction::In,
            Direction::Out,
            Direction::Unknown,
            Direction::Ignore,
        ] {
            assert_eq!(Direction::from_str(direction.as_str()), Ok(direction));
        }
        assert!(Direction::from_str("sideways").is_err());
    }

    #[test]
    fn source_labels_match_storage_values() {
        assert_eq!(EventSource::Realtime.as_str(), "realtime");
        assert_eq!(EventSource::Catchup.as_str(), "catchup");
    }
}
