//! Tenant-scoped device directory with refresh-on-miss.
//!
//! Vendor device status lags reality, so resolution never gives up on the
//! first miss: a connected-device lookup is followed by a directory refresh
//! against every gateway in scope, and finally by a status-blind fallback.
//! Refusing to ingest just because status metadata is stale would silently
//! drop legitimate events.

use metrics::counter;
use thiserror::Error;
use tracing::warn;

use crate::model::{Device, Gateway};
use crate::normalize::{extract_device_list, normalize_device};
use crate::store::{AccessStore, StoreError};
use crate::time::parse_vendor_timestamp;
use crate::vendor::{VendorClient, VendorError};

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vendor(#[from] VendorError),
}

/// Refresh the directory from one gateway's device-list API.
///
/// Entries are upserted keyed on (tenant, dev_index); entries missing
/// either a dev_index or a serial number are skipped. Returns the number
/// of devices written.
pub async fn sync_gateway_devices<S, V>(
    store: &S,
    vendor: &V,
    gateway: &Gateway,
) -> Result<usize, DirectoryError>
where
    S: AccessStore + ?Sized,
    V: VendorClient + ?Sized,
{
    let response = vendor.device_list(gateway).await?;

    let mut synced = 0;
    for entry in extract_device_list(&response) {
        let fields = normalize_device(&entry);
        if fields.dev_index.is_empty() || fields.serial_number.is_empty() {
            continue;
        }

        let last_seen = parse_vendor_timestamp(&fields.last_seen_raw);
        store.upsert_device(gateway, &fields, last_seen).await?;
        synced += 1;
    }

    counter!("directory_devices_synced_total").increment(synced as u64);
    Ok(synced)
}

/// Refresh every gateway. One gateway failing (offline, bad credentials)
/// must not stop the others, so failures are logged and counted but the
/// sweep continues.
pub async fn sync_all_gateways<S, V>(store: &S, vendor: &V) -> Result<usize, DirectoryError>
where
    S: AccessStore + ?Sized,
    V: VendorClient + ?Sized,
{
    let mut total = 0;
    for gateway in store.gateways(None).await? {
        match sync_gateway_devices(store, vendor, &gateway).await {
            Ok(synced) => total += synced,
            Err(error) => {
                counter!("directory_sync_failures_total").increment(1);
                warn!(gateway_id = gateway.id, "device sync failed: {}", error);
            }
        }
    }
    Ok(total)
}

/// Point every known device's push notifications at this service.
///
/// Devices forget their HTTP host configuration across reboots and factory
/// resets, so the registration is re-applied on a schedule rather than
/// once at provisioning time. Failures follow the sweep rule: log, count,
/// continue. Returns the number of devices registered.
pub async fn register_notification_hosts<S, V>(
    store: &S,
    vendor: &V,
    host: &serde_json::Value,
) -> Result<usize, DirectoryError>
where
    S: AccessStore + ?Sized,
    V: VendorClient + ?Sized,
{
    let mut registered = 0;
    for device in store.devices().await? {
        let Some(gateway) = store.gateway_by_id(device.gateway_id).await? else {
            warn!(device_id = device.id, "device has no gateway, skipping");
            continue;
        };
        match vendor
            .register_notification_host(&gateway, &device.dev_index, host)
            .await
        {
            Ok(_) => registered += 1,
            Err(error) => {
                counter!("notification_host_failures_total").increment(1);
                warn!(
                    device_id = device.id,
                    "notification host registration failed: {}", error
                );
            }
        }
    }

    counter!("notification_hosts_registered_total").increment(registered as u64);
    Ok(registered)
}

/// Resolve a raw device identifier to a device, scoped by tenant when one
/// is known.
///
/// Three steps: a connected-device lookup; on miss, a refresh of each
/// in-scope gateway with a retry after each; finally any device matching
/// the identifier regardless of status. A tenant-less lookup over a
/// dev_index shared by several tenants is inherently ambiguous; the pick
/// is deterministic but best-effort, and is logged as such.
pub async fn resolve_device<S, V>(
    store: &S,
    vendor: &V,
    dev_index: &str,
    tenant_id: Option<i64>,
) -> Result<Option<Device>, DirectoryError>
where
    S: AccessStore + ?Sized,
    V: VendorClient + ?Sized,
{
    if let Some(device) = store.connected_device(dev_index, tenant_id).await? {
        return Ok(Some(device));
    }

    for gateway in store.gateways(tenant_id).await? {
        if let Err(error) = sync_gateway_devices(store, vendor, &gateway).await {
            warn!(
                gateway_id = gateway.id,
                "directory refresh failed during resolution: {}", error
            );
            continue;
        }
        if let Some(device) = store
            .connected_device_on_gateway(gateway.id, dev_index)
            .await?
        {
            return Ok(Some(device));
        }
    }

    let fallback = store.any_device(dev_index, tenant_id).await?;
    if let Some(device) = &fallback {
        if tenant_id.is_none() {
            warn!(
                dev_index = dev_index,
                device_id = device.id,
                "tenant-less resolution picked a device by raw identifier only"
            );
        }
    }
    Ok(fallback)
}
