//! Tolerant extraction of device lists and event fields from the vendor's
//! JSON payloads.
//!
//! The gateway has been observed to nest the same data under several
//! different shapes depending on firmware and API version. Every function
//! here treats every field as optional: extraction tries each known shape in
//! a fixed priority order and takes the first non-empty result, and absent
//! fields default to empty strings. Nothing in this module errors.

use serde_json::Value;

/// Canonical field set for one device entry, whatever shape it arrived in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFields {
    pub serial_number: String,
    pub dev_index: String,
    pub device_name: String,
    pub status: String,
    pub protocol_type: String,
    pub device_type: String,
    pub offline_hint: String,
    pub last_seen_raw: String,
}

/// Unwrap the event envelope: pushes arrive wrapped in
/// `EventNotificationAlert`, catch-up results do not.
pub fn event_root(payload: &Value) -> &Value {
    payload.get("EventNotificationAlert").unwrap_or(payload)
}

/// First present value among alternate spellings of the same field.
fn first_of<'v>(entry: &'v Value, keys: &[&str]) -> Option<&'v Value> {
    keys.iter().find_map(|key| {
        entry
            .get(key)
            .filter(|value| !value.is_null())
    })
}

/// Coerce a JSON scalar to a string the way the vendor intends: strings
/// pass through, numbers are rendered in decimal, everything else is empty.
pub fn string_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Read a field that may carry an integer or a decimal string.
pub fn int_of(value: Option<&Value>) -> Option<i32> {
    match value {
        Some(Value::Number(n)) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Some(Value::String(s)) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse().ok()
        }
        _ => None,
    }
}

/// A singular object where a list was expected is coerced into a
/// one-element list.
fn as_entry_list(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.iter().filter(|v| v.is_object()).cloned().collect(),
        Some(Value::Object(_)) => vec![value.cloned().unwrap_or(Value::Null)],
        _ => Vec::new(),
    }
}

/// Extract device entries from a device-list response, trying each known
/// nesting in priority order and returning the first non-empty result:
/// `DeviceList.Device`, `DeviceList.devices`, a bare `Device` key, then the
/// search-result wrapper `SearchResult.MatchList[].Device`.
pub fn extract_device_list(payload: &Value) -> Vec<Value> {
    let from_match_list: Vec<Value> = as_entry_list(
        payload
            .get("SearchResult")
            .and_then(|sr| sr.get("MatchList")),
    )
    .iter()
    .filter_map(|item| item.get("Device").filter(|d| d.is_object()).cloned())
    .collect();

    let candidates = [
        as_entry_list(payload.get("DeviceList").and_then(|dl| dl.get("Device"))),
        as_entry_list(payload.get("DeviceList").and_then(|dl| dl.get("devices"))),
        as_entry_list(payload.get("Device")),
        from_match_list,
    ];

    candidates
        .into_iter()
        .find(|candidate| !candidate.is_empty())
        .unwrap_or_default()
}

/// Map one device entry onto the canonical field set, across every observed
/// alternate spelling. Missing fields become empty strings.
pub fn normalize_device(entry: &Value) -> DeviceFields {
    let ehome_id = entry
        .get("EhomeParams")
        .and_then(|params| params.get("EhomeID"));

    DeviceFields {
        serial_number: string_of(
            first_of(entry, &["serialNumber", "deviceSerialNo"]).or(ehome_id),
        ),
        dev_index: string_of(first_of(entry, &["devIndex", "devIndexCode", "devMode"])),
        device_name: string_of(first_of(entry, &["deviceName", "devName"])),
        status: string_of(first_of(entry, &["status", "devStatus"])),
        protocol_type: string_of(first_of(entry, &["protocolType", "protocolTypeName"])),
        device_type: string_of(first_of(entry, &["deviceType", "devType"])),
        offline_hint: string_of(entry.get("offlineReason")),
        last_seen_raw: string_of(entry.get("lastOnlineTime")),
    }
}

/// Extract access-control events from an event-search response.
///
/// Returns the event entries plus the page's reported match count, which
/// the vendor puts in `totalMatches` and which falls back to the entry
/// count when absent. The `InfoList` may sit under `AcsEventTotalNum` or at
/// the root, and may itself be a dict wrapping `AcsEventInfo`.
pub fn extract_acs_events(payload: &Value) -> (Vec<Value>, usize) {
    let info = payload.get("AcsEventTotalNum").unwrap_or(payload);

    let events = match info.get("InfoList") {
        Some(Value::Object(map)) => as_entry_list(map.get("AcsEventInfo")),
        other => as_entry_list(other),
    };

    let total = int_of(info.get("totalMatches"))
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(events.len());

    (events, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_root_unwraps_notification_envelope() {
        let wrapped = json!({"EventNotificationAlert": {"eventType": "AccessControllerEvent"}});
        assert_eq!(
            event_root(&wrapped).get("eventType"),
            Some(&json!("AccessControllerEvent"))
        );

        let bare = json!({"eventType": "AccessControllerEvent"});
        assert_eq!(event_root(&bare), &bare);
    }

    #[test]
    fn extracts_flat_device_list() {
        let payload = json!({"DeviceList": {"Device": [{"devIndex": "a"}, {"devIndex": "b"}]}});
        assert_eq!(extract_device_list(&payload).len(), 2);
    }

    #[test]
    fn coerces_singular_device_into_list() {
        let payload = json!({"DeviceList": {"Device": {"devIndex": "only"}}});
        let devices = extract_device_list(&payload);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].get("devIndex"), Some(&json!("only")));
    }

    #[test]
    fn falls_back_to_match_list_wrapper() {
        let payload = json!({
            "SearchResult": {
                "MatchList": [
                    {"Device": {"devIndex": "IDX-1", "devName": "Reader A"}},
                    {"notADevice": true},
                ]
            }
        });
        let devices = extract_device_list(&payload);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].get("devName"), Some(&json!("Reader A")));
    }

    #[test]
    fn empty_shapes_yield_empty_list() {
        assert!(extract_device_list(&json!({})).is_empty());
        assert!(extract_device_list(&json!({"DeviceList": {"Device": []}})).is_empty());
        assert!(extract_device_list(&json!("not an object")).is_empty());
    }

    #[test]
    fn normalize_maps_alternate_spellings() {
        let entry = json!({
            "EhomeParams": {"EhomeID": "FN2090414"},
            "devIndexCode": "IDX-UI-1",
            "devName": "Access Controller",
            "devStatus": "online",
            "protocolTypeName": "ehomeV5",
            "devType": "AccessControl",
        });
        let fields = normalize_device(&entry);
        assert_eq!(fields.serial_number, "FN2090414");
        assert_eq!(fields.dev_index, "IDX-UI-1");
        assert_eq!(fields.device_name, "Access Controller");
        assert_eq!(fields.status, "online");
        assert_eq!(fields.protocol_type, "ehomeV5");
        assert_eq!(fields.device_type, "AccessControl");
    }

    #[test]
    fn normalize_prefers_primary_spelling_and_defaults_to_empty() {
        let entry = json!({"serialNumber": "SN-1", "deviceSerialNo": "SN-IGNORED"});
        let fields = normalize_device(&entry);
        assert_eq!(fields.serial_number, "SN-1");
        assert_eq!(fields.dev_index, "");
        assert_eq!(fields.device_name, "");
    }

    #[test]
    fn acs_events_under_total_num_wrapper() {
        let payload = json!({
            "AcsEventTotalNum": {
                "totalMatches": 2,
                "InfoList": [{"serialNo": 1}, {"serialNo": 2}],
            }
        });
        let (events, total) = extract_acs_events(&payload);
        assert_eq!(events.len(), 2);
        assert_eq!(total, 2);
    }

    #[test]
    fn acs_events_dict_info_list_is_unwrapped() {
        let payload = json!({
            "InfoList": {"AcsEventInfo": [{"serialNo": 7}]},
        });
        let (events, total) = extract_acs_events(&payload);
        assert_eq!(events.len(), 1);
        assert_eq!(total, 1);
        assert_eq!(events[0].get("serialNo"), Some(&json!(7)));
    }

    #[test]
    fn int_of_accepts_numbers_and_digit_strings() {
        assert_eq!(int_of(Some(&json!(23))), Some(23));
        assert_eq!(int_of(Some(&json!("23"))), Some(23));
        assert_eq!(int_of(Some(&json!("not a number"))), None);
        assert_eq!(int_of(Some(&json!(""))), None);
        assert_eq!(int_of(None), None);
    }

    #[test]
    fn string_of_renders_numbers() {
        assert_eq!(string_of(Some(&json!("E1001"))), "E1001");
        assert_eq!(string_of(Some(&json!(100))), "100");
        assert_eq!(string_of(Some(&json!(null))), "");
        assert_eq!(string_of(None), "");
    }
}
