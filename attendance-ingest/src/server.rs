use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use eyre::Result;
use tokio::net::TcpListener;

use attendance_common::store::PgAccessStore;
use attendance_common::vendor::GatewayClient;

use crate::config::Config;
use crate::router;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = Arc::new(PgAccessStore::new(&config.database_url)?);
    let vendor = Arc::new(GatewayClient::new(config.vendor_request_timeout.0)?);

    let app = router::router(store, vendor, config);

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
