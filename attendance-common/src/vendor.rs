//! Outbound calls to the vendor gateway API.
//!
//! The transport itself is deliberately thin: every call carries a bounded
//! timeout, and callers only consume the JSON response shapes through the
//! normalizer. The gateway's digest-auth handshake is handled upstream of
//! this service; the client sends standard basic credentials at the seam.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use thiserror::Error;

use crate::model::Gateway;

#[derive(Error, Debug)]
pub enum VendorError {
    #[error("invalid gateway base url: {0}")]
    ParseUrlError(#[from] url::ParseError),
    #[error("gateway request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("gateway response was not usable: {0}")]
    UnusableResponse(String),
}

pub type VendorResult<T> = std::result::Result<T, VendorError>;

/// Seam for the vendor API, so the directory and the reconciler can be
/// exercised against canned responses in tests.
#[async_trait]
pub trait VendorClient: Send + Sync {
    /// Device-list search for one gateway.
    async fn device_list(&self, gateway: &Gateway) -> VendorResult<Value>;

    /// Access-control event search for one device, with an `AcsEventCond`
    /// pagination condition.
    async fn search_events(
        &self,
        gateway: &Gateway,
        dev_index: &str,
        condition: &Value,
    ) -> VendorResult<Value>;

    /// Register this service as a push notification target on one device.
    async fn register_notification_host(
        &self,
        gateway: &Gateway,
        dev_index: &str,
        host: &Value,
    ) -> VendorResult<Value>;
}

/// The deviceList `SearchDescription` request body.
pub fn device_search_payload(position: u32, max_result: u32) -> Value {
    json!({
        "SearchDescription": {
            "position": position,
            "maxResult": max_result,
            "Filter": {
                "key": "",
                "devType": "",
                "protocolType": ["ehomeV5"],
                "devStatus": ["online", "offline"],
            },
        }
    })
}

/// The `AcsEventCond` request body for one event-search page.
pub fn acs_event_condition(
    search_id: &str,
    position: u32,
    max_results: u32,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> Value {
    json!({
        "AcsEventCond": {
            "searchID": search_id,
            "searchResultPosition": position,
            "maxResults": max_results,
            "startTime": start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
            "endTime": end_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    })
}

/// The `HttpHostNotificationList` body registering a push target.
pub fn http_host_notification(ip_address: &str, port: u16, url_path: &str) -> Value {
    json!({
        "HttpHostNotificationList": [
            {
                "HttpHostNotification": {
                    "id": "1",
                    "url": url_path,
                    "protocolType": "HTTP",
                    "parameterFormatType": "JSON",
                    "addressingFormatType": "ipaddress",
                    "ipAddress": ip_address,
                    "portNo": port,
                    "httpAuthenticationMethod": "none",
                }
            }
        ]
    })
}

/// Production client over reqwest, one instance shared across gateways.
pub struct GatewayClient {
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(request_timeout: std::time::Duration) -> VendorResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent("attendance-gateway-client")
            .timeout(request_timeout)
            .build()?;

        Ok(Self { client })
    }

    fn endpoint(gateway: &Gateway, path: &str) -> VendorResult<url::Url> {
        let mut base = gateway.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(url::Url::parse(&base)?.join(path.trim_start_matches('/'))?)
    }

    async fn post_json(
        &self,
        gateway: &Gateway,
        path: &str,
        query: &[(&str, &str)],
        body: &Value,
    ) -> VendorResult<Value> {
        let url = Self::endpoint(gateway, path)?;
        let response = self
            .client
            .post(url)
            .query(query)
            .basic_auth(&gateway.username, Some(&gateway.password))
            .json(body)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}

#[async_trait]
impl VendorClient for GatewayClient {
    async fn device_list(&self, gateway: &Gateway) -> VendorResult<Value> {
        self.post_json(
            gateway,
            "/ISAPI/ContentMgmt/DeviceMgmt/deviceList",
            &[("format", "json")],
            &device_search_payload(0, 100),
        )
        .await
    }

    async fn search_events(
        &self,
        gateway: &Gateway,
        dev_index: &str,
        condition: &Value,
    ) -> VendorResult<Value> {
        self.post_json(
            gateway,
            "/ISAPI/AccessControl/AcsEvent",
            &[("format", "json"), ("devIndex", dev_index)],
            condition,
        )
        .await
    }

    async fn register_notification_host(
        &self,
        gateway: &Gateway,
        dev_index: &str,
        host: &Value,
    ) -> VendorResult<Value> {
        let url = Self::endpoint(gateway, "/ISAPI/Event/notification/httpHosts")?;
        let response = self
            .client
            .put(url)
            .query(&[("format", "json"), ("devIndex", dev_index)])
            .basic_auth(&gateway.username, Some(&gateway.password))
            .json(host)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await.unwrap_or(Value::Null))
    }
}
