use std::net::IpAddr;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use axum_client_ip::InsecureClientIp;
use bytes::Bytes;
use metrics::counter;
use serde_json::Value;
use tracing::instrument;

use attendance_common::ingest::{ingest, IngestOutcome};
use attendance_common::model::EventSource;
use attendance_common::normalize::{event_root, string_of};
use attendance_common::store::AccessStore;

use crate::api::{WebhookError, WebhookResponse};
use crate::config::Config;
use crate::router;

#[instrument(skip_all, fields(client_ip, tenant_code))]
pub async fn receive_event(
    State(state): State<router::State>,
    InsecureClientIp(ip): InsecureClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), WebhookError> {
    tracing::Span::current().record("client_ip", ip.to_string());

    authorize(&state.config, ip, &headers)?;

    let payload: Value = serde_json::from_slice(&body)?;

    let tenant_id = resolve_tenant(state.store.as_ref(), &headers, &payload).await?;

    let outcome = ingest(
        state.store.as_ref(),
        state.vendor.as_ref(),
        &payload,
        EventSource::Realtime,
        tenant_id,
    )
    .await?;

    Ok(match outcome {
        // The skip reason stays internal (it is already counted per reason);
        // devices only need to hear that the push landed and was set aside.
        IngestOutcome::Skipped(_) => (
            StatusCode::ACCEPTED,
            Json(WebhookResponse {
                status: "ignored".to_owned(),
                raw_event_id: None,
                attendance_log_id: None,
            }),
        ),
        IngestOutcome::Ingested {
            raw_event,
            attendance,
            deduplicated,
        } => {
            let (code, status) = if deduplicated {
                (StatusCode::OK, "duplicate")
            } else {
                (StatusCode::CREATED, "created")
            };
            (
                code,
                Json(WebhookResponse {
                    status: status.to_owned(),
                    raw_event_id: Some(raw_event.id),
                    attendance_log_id: attendance.map(|log| log.id),
                }),
            )
        }
    })
}

/// Source filtering and the shared-secret check. Devices cannot do real
/// authentication, so this is an allow-list plus a static token they are
/// configured to send on every push.
pub(crate) fn authorize(
    config: &Config,
    ip: IpAddr,
    headers: &HeaderMap,
) -> Result<(), WebhookError> {
    if !config.allowed_ips.permits(ip) {
        counter!("webhook_rejected_total", "reason" => "source_ip").increment(1);
        return Err(WebhookError::ForbiddenSource);
    }

    if let Some(expected) = &config.webhook_token {
        let presented = headers.get("x-hik-token").and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            counter!("webhook_rejected_total", "reason" => "token").increment(1);
            return Err(WebhookError::InvalidToken);
        }
    }

    Ok(())
}

/// Tenant scoping for the incoming push.
///
/// An explicit `X-Tenant-Code` header is binding: an unknown code there is
/// a misconfigured device and gets a 400 instead of falling through to an
/// ambiguous lookup. A `tenantCode` in the payload is best effort, looked
/// for inside the event envelope first and then at the top level, and an
/// unknown value degrades to the tenant-less resolution path.
pub(crate) async fn resolve_tenant(
    store: &dyn AccessStore,
    headers: &HeaderMap,
    payload: &Value,
) -> Result<Option<i64>, WebhookError> {
    let header_code = headers
        .get("x-tenant-code")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|code| !code.is_empty());

    if let Some(code) = header_code {
        tracing::Span::current().record("tenant_code", code);
        return match store.tenant_by_code(code).await? {
            Some(tenant) => Ok(Some(tenant.id)),
            None => Err(WebhookError::UnknownTenant(code.to_owned())),
        };
    }

    let payload_code = {
        let from_envelope = string_of(event_root(payload).get("tenantCode"));
        if from_envelope.is_empty() {
            string_of(payload.get("tenantCode"))
        } else {
            from_envelope
        }
    };
    if !payload_code.is_empty() {
        tracing::Span::current().record("tenant_code", payload_code.as_str());
        if let Some(tenant) = store.tenant_by_code(&payload_code).await? {
            return Ok(Some(tenant.id));
        }
    }

    Ok(None)
}
