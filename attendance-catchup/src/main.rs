//! Periodic sweeps: event catch-up against the vendor search API, and
//! device directory refresh with push-host registration.
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use tokio::sync::Semaphore;

use attendance_common::directory::{register_notification_hosts, sync_all_gateways};
use attendance_common::health::{HealthHandle, HealthRegistry};
use attendance_common::metrics;
use attendance_common::reconcile::catchup_all_devices;
use attendance_common::store::PgAccessStore;
use attendance_common::vendor::{http_host_notification, GatewayClient};

use config::Config;

mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn catchup_loop(
    store: Arc<PgAccessStore>,
    vendor: Arc<GatewayClient>,
    interval_secs: u64,
    page_size: u32,
    liveness: HealthHandle,
) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;
        match catchup_all_devices(store.as_ref(), vendor.as_ref(), page_size).await {
            Ok(processed) => {
                tracing::info!("catch-up sweep recovered {} attendance events", processed)
            }
            Err(error) => tracing::error!("catch-up sweep failed: {}", error),
        }
        liveness.report_healthy().await;
        drop(_permit);
    }
}

async fn sync_loop(
    store: Arc<PgAccessStore>,
    vendor: Arc<GatewayClient>,
    config: Config,
    liveness: HealthHandle,
) {
    let notification_host = config.notification_host_ip.as_ref().map(|ip| {
        http_host_notification(
            ip,
            config.notification_host_port,
            &config.notification_host_path,
        )
    });

    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(config.sync_interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;
        match sync_all_gateways(store.as_ref(), vendor.as_ref()).await {
            Ok(synced) => tracing::info!("device sync refreshed {} devices", synced),
            Err(error) => tracing::error!("device sync failed: {}", error),
        }
        if let Some(host) = &notification_host {
            match register_notification_hosts(store.as_ref(), vendor.as_ref(), host).await {
                Ok(registered) => {
                    tracing::info!("registered push host on {} devices", registered)
                }
                Err(error) => tracing::error!("push host registration failed: {}", error),
            }
        }
        liveness.report_healthy().await;
        drop(_permit);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = Arc::new(
        PgAccessStore::new(&config.database_url).expect("failed to create access store"),
    );
    let vendor = Arc::new(
        GatewayClient::new(Duration::from_millis(config.vendor_request_timeout_ms))
            .expect("failed to create gateway client"),
    );

    let liveness = HealthRegistry::new("liveness");
    let catchup_health = liveness
        .register(
            "catchup".to_owned(),
            time::Duration::seconds(config.catchup_interval_secs as i64 * 3),
        )
        .await;
    let sync_health = liveness
        .register(
            "device_sync".to_owned(),
            time::Duration::seconds(config.sync_interval_secs as i64 * 3),
        )
        .await;

    let catchup = Box::pin(catchup_loop(
        store.clone(),
        vendor.clone(),
        config.catchup_interval_secs,
        config.page_size,
        catchup_health,
    ));
    let sync = Box::pin(sync_loop(store, vendor, config.clone(), sync_health));
    let sweeps = Box::pin(async move {
        select(catchup, sync).await;
    });

    let recorder_handle = metrics::setup_metrics_recorder();
    let app = handlers::app(liveness, Some(recorder_handle));
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, sweeps).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start attendance-catchup http server, {}", e),
        },
        Either::Right((_, _)) => {
            tracing::error!("attendance-catchup sweep task exited")
        }
    };
}
