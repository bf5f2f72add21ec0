//! Attendance-direction classification for access-control events.
//!
//! An explicit attendance-status string reported by the device terminal is
//! trusted over every heuristic below it. Only when the terminal reports
//! nothing do we fall back to interpreting the vendor sub-event-type code,
//! and then to any per-reader configured default.

use serde_json::Value;

use crate::model::{Device, Direction};
use crate::normalize::{int_of, string_of};
use crate::store::{AccessStore, StoreResult};

/// Vendor sub-event-type codes for a successful authentication at a reader.
const AUTH_SUCCESS_SUB_TYPES: [i32; 8] = [1, 2, 15, 16, 38, 40, 43, 46];

/// Duress, tamper, and administrative codes that are not attendance signals.
const IGNORED_SUB_TYPES: [i32; 6] = [3, 6, 25, 26, 27, 28];

/// Door opened with the exit button: always an OUT.
const EXIT_BUTTON_SUB_TYPE: i32 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub direction: Direction,
    /// True when the direction came from an explicit attendance-status
    /// string rather than a sub-event-type heuristic.
    pub authoritative: bool,
}

/// The explicit attendance-status string, trimmed. Empty when absent.
pub fn attendance_status_value(access_event: &Value) -> String {
    string_of(access_event.get("attendanceStatus"))
        .trim()
        .to_owned()
}

/// Fixed lexicon for explicit attendance-status strings. Recognized but
/// unmapped statuses are attendance signals we cannot direct: Unknown.
fn map_attendance_status(normalized: &str) -> Direction {
    match normalized {
        "checkin" | "breakin" | "overtimein" => Direction::In,
        "checkout" | "breakout" | "overtimeout" => Direction::Out,
        _ => Direction::Unknown,
    }
}

/// Classify one access event for `device`.
///
/// The reader-config lookup only happens on the authentication-success
/// branch, for events carrying both a door and a reader number.
pub async fn resolve_direction<S: AccessStore + ?Sized>(
    store: &S,
    device: &Device,
    access_event: &Value,
) -> StoreResult<Classification> {
    let status = attendance_status_value(access_event);
    let normalized = status.to_lowercase();
    if !normalized.is_empty() && normalized != "undefined" {
        return Ok(Classification {
            direction: map_attendance_status(&normalized),
            authoritative: true,
        });
    }

    let sub_event_type = int_of(access_event.get("subEventType"));

    if let Some(code) = sub_event_type {
        if IGNORED_SUB_TYPES.contains(&code) {
            return Ok(Classification {
                direction: Direction::Ignore,
                authoritative: false,
            });
        }
        if code == EXIT_BUTTON_SUB_TYPE {
            return Ok(Classification {
                direction: Direction::Out,
                authoritative: false,
            });
        }
        if AUTH_SUCCESS_SUB_TYPES.contains(&code) {
            let door_no = int_of(access_event.get("doorNo"));
            let card_reader_no = int_of(access_event.get("cardReaderNo"));
            if let (Some(door_no), Some(card_reader_no)) = (door_no, card_reader_no) {
                if let Some(configured) =
                    store.reader_default(device.id, door_no, card_reader_no).await?
                {
                    return Ok(Classification {
                        direction: configured,
                        authoritative: false,
                    });
                }
            }
            return Ok(Classification {
                direction: Direction::In,
                authoritative: false,
            });
        }
    }

    Ok(Classification {
        direction: Direction::Unknown,
        authoritative: false,
    })
}
