//! In-memory implementations of the store and vendor seams, so the
//! pipeline, directory, classifier, and reconciler can be tested without a
//! database or a live gateway.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::model::{
    AttendanceLog, Device, DeviceCursor, DeviceReaderConfig, Direction, Gateway,
    NewAttendanceLog, NewRawEvent, RawEvent, Tenant,
};
use crate::normalize::DeviceFields;
use crate::store::{AccessStore, PersistOutcome, StoreResult, CONNECTED_STATUSES};
use crate::vendor::{VendorClient, VendorError, VendorResult};

#[derive(Default)]
struct MemoryState {
    tenants: Vec<Tenant>,
    gateways: Vec<Gateway>,
    devices: Vec<Device>,
    raw_events: Vec<RawEvent>,
    attendance: Vec<AttendanceLog>,
    cursors: Vec<DeviceCursor>,
    reader_configs: Vec<DeviceReaderConfig>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn tenant_id_for(&mut self, code: &str) -> i64 {
        if let Some(tenant) = self.tenants.iter().find(|t| t.code == code) {
            return tenant.id;
        }
        let id = self.next_id();
        self.tenants.push(Tenant {
            id,
            name: code.to_owned(),
            code: code.to_owned(),
        });
        id
    }

    fn gateway_for(&mut self, tenant_id: i64, base_url: &str) -> Gateway {
        if let Some(gateway) = self
            .gateways
            .iter()
            .find(|g| g.tenant_id == tenant_id && g.base_url == base_url)
        {
            return gateway.clone();
        }
        let id = self.next_id();
        let gateway = Gateway {
            id,
            tenant_id,
            base_url: base_url.to_owned(),
            username: "admin".to_owned(),
            password: "pass".to_owned(),
        };
        self.gateways.push(gateway.clone());
        gateway
    }
}

fn is_connected(status: &str) -> bool {
    let lowered = status.to_lowercase();
    CONNECTED_STATUSES.contains(&lowered.as_str())
}

/// In-memory `AccessStore` mirroring the Postgres implementation's
/// semantics, including the dedupe-key uniqueness contract.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tenant_id(&self, code: &str) -> i64 {
        self.state.lock().unwrap().tenant_id_for(code)
    }

    pub async fn add_gateway(&self, tenant_code: &str, base_url: &str) -> Gateway {
        let mut state = self.state.lock().unwrap();
        let tenant_id = state.tenant_id_for(tenant_code);
        state.gateway_for(tenant_id, base_url)
    }

    pub async fn add_device(
        &self,
        tenant_code: &str,
        gateway_url: &str,
        serial_number: &str,
        dev_index: &str,
        status: &str,
    ) -> Device {
        let mut state = self.state.lock().unwrap();
        let tenant_id = state.tenant_id_for(tenant_code);
        let gateway = state.gateway_for(tenant_id, gateway_url);
        let id = state.next_id();
        let device = Device {
            id,
            gateway_id: gateway.id,
            tenant_id,
            serial_number: serial_number.to_owned(),
            dev_index: dev_index.to_owned(),
            device_id: String::new(),
            device_name: String::new(),
            protocol_type: String::new(),
            device_type: String::new(),
            status: status.to_owned(),
            offline_hint: String::new(),
            last_seen_at: None,
        };
        state.devices.push(device.clone());
        device
    }

    pub async fn add_reader_config(
        &self,
        device_id: i64,
        door_no: i32,
        card_reader_no: i32,
        direction: Direction,
    ) {
        self.state.lock().unwrap().reader_configs.push(DeviceReaderConfig {
            device_id,
            door_no,
            card_reader_no,
            direction_default: direction.as_str().to_owned(),
        });
    }

    pub async fn raw_event_count(&self) -> usize {
        self.state.lock().unwrap().raw_events.len()
    }

    pub async fn attendance_count(&self) -> usize {
        self.state.lock().unwrap().attendance.len()
    }
}

#[async_trait]
impl AccessStore for MemoryStore {
    async fn tenant_by_code(&self, code: &str) -> StoreResult<Option<Tenant>> {
        let state = self.state.lock().unwrap();
        Ok(state.tenants.iter().find(|t| t.code == code).cloned())
    }

    async fn connected_device(
        &self,
        dev_index: &str,
        tenant_id: Option<i64>,
    ) -> StoreResult<Option<Device>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .iter()
            .filter(|d| d.dev_index == dev_index && is_connected(&d.status))
            .filter(|d| tenant_id.map_or(true, |t| d.tenant_id == t))
            .min_by_key(|d| d.id)
            .cloned())
    }

    async fn connected_device_on_gateway(
        &self,
        gateway_id: i64,
        dev_index: &str,
    ) -> StoreResult<Option<Device>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .iter()
            .filter(|d| {
                d.gateway_id == gateway_id && d.dev_index == dev_index && is_connected(&d.status)
            })
            .min_by_key(|d| d.id)
            .cloned())
    }

    async fn any_device(
        &self,
        dev_index: &str,
        tenant_id: Option<i64>,
    ) -> StoreResult<Option<Device>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .iter()
            .filter(|d| d.dev_index == dev_index)
            .filter(|d| tenant_id.map_or(true, |t| d.tenant_id == t))
            .min_by_key(|d| d.id)
            .cloned())
    }

    async fn gateways(&self, tenant_id: Option<i64>) -> StoreResult<Vec<Gateway>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .gateways
            .iter()
            .filter(|g| tenant_id.map_or(true, |t| g.tenant_id == t))
            .cloned()
            .collect())
    }

    async fn gateway_by_id(&self, gateway_id: i64) -> StoreResult<Option<Gateway>> {
        let state = self.state.lock().unwrap();
        Ok(state.gateways.iter().find(|g| g.id == gateway_id).cloned())
    }

    async fn upsert_device(
        &self,
        gateway: &Gateway,
        fields: &DeviceFields,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();

        let merge = |current: &mut String, incoming: &str| {
            if !incoming.is_empty() {
                *current = incoming.to_owned();
            }
        };

        if let Some(device) = state
            .devices
            .iter_mut()
            .find(|d| d.tenant_id == gateway.tenant_id && d.dev_index == fields.dev_index)
        {
            device.gateway_id = gateway.id;
            merge(&mut device.serial_number, &fields.serial_number);
            merge(&mut device.device_name, &fields.device_name);
            merge(&mut device.protocol_type, &fields.protocol_type);
            merge(&mut device.device_type, &fields.device_type);
            merge(&mut device.status, &fields.status);
            merge(&mut device.offline_hint, &fields.offline_hint);
            if last_seen_at.is_some() {
                device.last_seen_at = last_seen_at;
            }
            return Ok(());
        }

        let id = state.next_id();
        state.devices.push(Device {
            id,
            gateway_id: gateway.id,
            tenant_id: gateway.tenant_id,
            serial_number: fields.serial_number.clone(),
            dev_index: fields.dev_index.clone(),
            device_id: String::new(),
            device_name: fields.device_name.clone(),
            protocol_type: fields.protocol_type.clone(),
            device_type: fields.device_type.clone(),
            status: fields.status.clone(),
            offline_hint: fields.offline_hint.clone(),
            last_seen_at,
        });
        Ok(())
    }

    async fn reader_default(
        &self,
        device_id: i64,
        door_no: i32,
        card_reader_no: i32,
    ) -> StoreResult<Option<Direction>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .reader_configs
            .iter()
            .find(|c| {
                c.device_id == device_id
                    && c.door_no == door_no
                    && c.card_reader_no == card_reader_no
            })
            .and_then(|c| c.direction_default.parse().ok()))
    }

    async fn persist_event(
        &self,
        raw: NewRawEvent,
        attendance: Option<NewAttendanceLog>,
    ) -> StoreResult<PersistOutcome> {
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state
            .raw_events
            .iter()
            .find(|e| e.dedupe_key == raw.dedupe_key)
            .cloned()
        {
            let attendance = state
                .attendance
                .iter()
                .find(|a| a.raw_event_id == existing.id)
                .cloned();
            return Ok(PersistOutcome::Duplicate {
                raw_event: existing,
                attendance,
            });
        }

        let raw_id = state.next_id();
        let raw_event = RawEvent {
            id: raw_id,
            tenant_id: raw.tenant_id,
            device_id: raw.device_id,
            dev_index: raw.dev_index,
            event_type: raw.event_type,
            event_datetime: raw.event_datetime,
            major_event_type: raw.major_event_type,
            sub_event_type: raw.sub_event_type,
            serial_no: raw.serial_no,
            front_serial_no: raw.front_serial_no,
            employee_no: raw.employee_no,
            employee_no_string: raw.employee_no_string,
            card_no: raw.card_no,
            card_reader_no: raw.card_reader_no,
            door_no: raw.door_no,
            attendance_status: raw.attendance_status,
            dedupe_key: raw.dedupe_key,
            payload: sqlx::types::Json(raw.payload),
        };
        state.raw_events.push(raw_event.clone());

        let attendance_row = attendance.map(|new_log| {
            let id = state.next_id();
            let row = AttendanceLog {
                id,
                tenant_id: new_log.tenant_id,
                person_id: new_log.person_id,
                device_id: new_log.device_id,
                timestamp: new_log.timestamp,
                attendance_type: new_log.attendance_type,
                attendance_status: new_log.attendance_status,
                direction: new_log.direction.as_str().to_owned(),
                source: new_log.source.as_str().to_owned(),
                raw_event_id: raw_event.id,
            };
            state.attendance.push(row.clone());
            row
        });

        Ok(PersistOutcome::Created {
            raw_event,
            attendance: attendance_row,
        })
    }

    async fn devices(&self) -> StoreResult<Vec<Device>> {
        let state = self.state.lock().unwrap();
        let mut devices = state.devices.clone();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn cursor_for(&self, device: &Device) -> StoreResult<DeviceCursor> {
        let mut state = self.state.lock().unwrap();
        if let Some(cursor) = state.cursors.iter().find(|c| c.device_id == device.id) {
            return Ok(cursor.clone());
        }
        let cursor = DeviceCursor {
            tenant_id: device.tenant_id,
            device_id: device.id,
            last_event_time: None,
            last_search_id: String::new(),
            last_result_position: 0,
        };
        state.cursors.push(cursor.clone());
        Ok(cursor)
    }

    async fn save_cursor(&self, cursor: &DeviceCursor) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        match state
            .cursors
            .iter_mut()
            .find(|c| c.device_id == cursor.device_id)
        {
            Some(existing) => *existing = cursor.clone(),
            None => state.cursors.push(cursor.clone()),
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockVendorState {
    device_list: Option<Value>,
    device_list_calls: usize,
    search_pages: VecDeque<Result<Value, String>>,
    search_calls: usize,
    search_positions: Vec<u32>,
    notified_dev_indexes: Vec<String>,
}

/// Scripted `VendorClient`: canned device-list response and a FIFO queue of
/// event-search pages (or failures). An exhausted queue returns empty pages.
#[derive(Default)]
pub struct MockVendor {
    state: Mutex<MockVendorState>,
}

impl MockVendor {
    pub fn set_device_list(&self, payload: Value) {
        self.state.lock().unwrap().device_list = Some(payload);
    }

    pub fn device_list_calls(&self) -> usize {
        self.state.lock().unwrap().device_list_calls
    }

    pub fn push_search_page(&self, payload: Value) {
        self.state.lock().unwrap().search_pages.push_back(Ok(payload));
    }

    pub fn push_search_failure(&self) {
        self.state
            .lock()
            .unwrap()
            .search_pages
            .push_back(Err("scripted failure".to_owned()));
    }

    pub fn search_calls(&self) -> usize {
        self.state.lock().unwrap().search_calls
    }

    pub fn search_positions(&self) -> Vec<u32> {
        self.state.lock().unwrap().search_positions.clone()
    }

    pub fn notified_dev_indexes(&self) -> Vec<String> {
        self.state.lock().unwrap().notified_dev_indexes.clone()
    }
}

#[async_trait]
impl VendorClient for MockVendor {
    async fn device_list(&self, _gateway: &Gateway) -> VendorResult<Value> {
        let mut state = self.state.lock().unwrap();
        state.device_list_calls += 1;
        Ok(state.device_list.clone().unwrap_or_else(|| json!({})))
    }

    async fn search_events(
        &self,
        _gateway: &Gateway,
        _dev_index: &str,
        condition: &Value,
    ) -> VendorResult<Value> {
        let mut state = self.state.lock().unwrap();
        state.search_calls += 1;
        if let Some(position) = condition["AcsEventCond"]["searchResultPosition"].as_u64() {
            state.search_positions.push(position as u32);
        }
        match state.search_pages.pop_front() {
            Some(Ok(page)) => Ok(page),
            Some(Err(message)) => Err(VendorError::UnusableResponse(message)),
            None => Ok(json!({})),
        }
    }

    async fn register_notification_host(
        &self,
        _gateway: &Gateway,
        dev_index: &str,
        _host: &Value,
    ) -> VendorResult<Value> {
        let mut state = self.state.lock().unwrap();
        state.notified_dev_indexes.push(dev_index.to_owned());
        Ok(Value::Null)
    }
}
