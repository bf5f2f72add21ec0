//! Catch-up reconciliation against the vendor's searchable event history.
//!
//! The push channel silently drops deliveries across network blips and
//! restart windows. Each device carries a cursor; a reconciliation run
//! re-reads the recent window from the event-search API and feeds every
//! result through the normal ingestion pipeline, where the dedupe key makes
//! the overlap with already-pushed events harmless.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use crate::ingest::{ingest, wrap_acs_event, IngestError, IngestOutcome};
use crate::model::{Device, DeviceCursor, EventSource};
use crate::normalize::extract_acs_events;
use crate::store::{AccessStore, StoreError};
use crate::vendor::{acs_event_condition, VendorClient, VendorError};

/// How far back a run looks when a device has no confirmed watermark.
const LOOKBACK_MINUTES: i64 = 30;

/// Backward pad absorbing clock skew and events that landed exactly on the
/// previous window edge.
const WINDOW_PAD_MINUTES: i64 = 2;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vendor(#[from] VendorError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("device {0} has no gateway row")]
    MissingGateway(i64),
}

/// Search window for one run: `max(watermark, now − lookback) − pad`.
/// Clamping to the lookback floor keeps a long-idle device from triggering
/// an unbounded history scan.
fn window_start(last_event_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = now - Duration::minutes(LOOKBACK_MINUTES);
    let base = match last_event_time {
        Some(watermark) if watermark > floor => watermark,
        _ => floor,
    };
    base - Duration::minutes(WINDOW_PAD_MINUTES)
}

/// Run one catch-up pass for `device`, returning how many events produced
/// an attendance log.
///
/// The cursor is checkpointed after every fully processed page, so a page
/// fetch that times out aborts the run without losing the pages already
/// confirmed. `last_event_time` only ever advances to attendance timestamps
/// this run actually observed; a run that confirms nothing leaves the
/// watermark untouched.
pub async fn catchup_device<S, V>(
    store: &S,
    vendor: &V,
    device: &Device,
    page_size: u32,
) -> Result<usize, ReconcileError>
where
    S: AccessStore + ?Sized,
    V: VendorClient + ?Sized,
{
    let gateway = store
        .gateway_by_id(device.gateway_id)
        .await?
        .ok_or(ReconcileError::MissingGateway(device.id))?;

    let cursor = store.cursor_for(device).await?;

    let now = Utc::now();
    let start_time = window_start(cursor.last_event_time, now);
    let end_time = now;

    let search_id = if cursor.last_search_id.is_empty() {
        format!("{}-{}", device.tenant_id, device.dev_index)
    } else {
        cursor.last_search_id.clone()
    };

    let mut position: u32 = 0;
    let mut processed = 0;
    let mut max_processed_time = cursor.last_event_time;

    loop {
        let condition =
            acs_event_condition(&search_id, position, page_size, start_time, end_time);
        let response = match vendor
            .search_events(&gateway, &device.dev_index, &condition)
            .await
        {
            Ok(response) => response,
            Err(error) => {
                // Abort this device's run; the cursor already reflects the
                // pages confirmed before the failure.
                counter!("catchup_page_failures_total").increment(1);
                save_cursor(store, &cursor, max_processed_time, &search_id, position).await?;
                return Err(error.into());
            }
        };

        let (events, returned) = extract_acs_events(&response);
        if events.is_empty() {
            break;
        }

        for acs_event in &events {
            let wrapped = wrap_acs_event(device, acs_event);
            let outcome = ingest(
                store,
                vendor,
                &wrapped,
                EventSource::Catchup,
                Some(device.tenant_id),
            )
            .await?;

            if let IngestOutcome::Ingested {
                attendance: Some(attendance),
                ..
            } = outcome
            {
                processed += 1;
                if max_processed_time.map_or(true, |max| attendance.timestamp > max) {
                    max_processed_time = Some(attendance.timestamp);
                }
            }
        }

        position += u32::try_from(returned).unwrap_or(events.len() as u32);
        save_cursor(store, &cursor, max_processed_time, &search_id, position).await?;

        if returned < page_size as usize {
            break;
        }
    }

    save_cursor(store, &cursor, max_processed_time, &search_id, position).await?;
    counter!("catchup_events_processed_total").increment(processed as u64);
    Ok(processed)
}

async fn save_cursor<S: AccessStore + ?Sized>(
    store: &S,
    cursor: &DeviceCursor,
    last_event_time: Option<DateTime<Utc>>,
    search_id: &str,
    position: u32,
) -> Result<(), StoreError> {
    store
        .save_cursor(&DeviceCursor {
            tenant_id: cursor.tenant_id,
            device_id: cursor.device_id,
            last_event_time: last_event_time.or(cursor.last_event_time),
            last_search_id: search_id.to_owned(),
            last_result_position: i32::try_from(position).unwrap_or(i32::MAX),
        })
        .await
}

/// Run catch-up for every known device. One device failing must not abort
/// the others; failures are logged and the sweep continues.
pub async fn catchup_all_devices<S, V>(
    store: &S,
    vendor: &V,
    page_size: u32,
) -> Result<usize, ReconcileError>
where
    S: AccessStore + ?Sized,
    V: VendorClient + ?Sized,
{
    let mut total = 0;
    for device in store.devices().await? {
        match catchup_device(store, vendor, &device, page_size).await {
            Ok(processed) => total += processed,
            Err(error) => {
                counter!("catchup_device_failures_total").increment(1);
                warn!(
                    device_id = device.id,
                    dev_index = %device.dev_index,
                    "catch-up failed: {}", error
                );
            }
        }
    }
    info!(processed = total, "catch-up sweep finished");
    Ok(total)
}
