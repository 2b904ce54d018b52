//! HTTP forwarding effect handler.
//!
//! POSTs each event as JSON to a target endpoint. The event id travels in the
//! `Idempotency-Key` header so the receiver can deduplicate redeliveries.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::{EffectHandler, HandlerError};
use crate::event::DecodedEvent;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const EVENT_NAME_HEADER: &str = "X-Event-Name";

/// Default request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Forwards events to an HTTP endpoint.
pub struct HttpEffectHandler {
    client: Client,
    url: String,
}

impl HttpEffectHandler {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Map a non-success response status to a failure category.
///
/// Statuses that will fail the same way on every retry are business failures;
/// everything else (5xx, 429, 408, unexpected codes) is transient.
pub fn classify_status(status: StatusCode, detail: &str) -> Result<(), HandlerError> {
    if status.is_success() {
        return Ok(());
    }
    let reason = format!("HTTP {} - {}", status, detail);
    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::NOT_FOUND
        | StatusCode::CONFLICT
        | StatusCode::GONE
        | StatusCode::UNPROCESSABLE_ENTITY => Err(HandlerError::business(reason)),
        _ => Err(HandlerError::transient(reason)),
    }
}

#[async_trait]
impl EffectHandler for HttpEffectHandler {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        let response = self
            .client
            .post(&self.url)
            .header(IDEMPOTENCY_KEY_HEADER, &event.event_id)
            .header(EVENT_NAME_HEADER, &event.event_name)
            .json(event)
            .send()
            .await
            .map_err(|e| HandlerError::transient(format!("request to {} failed: {}", self.url, e)))?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %self.url, event_id = %event.event_id, status = %status, "Event forwarded");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let detail: String = body.chars().take(200).collect();
        warn!(
            url = %self.url,
            event_id = %event.event_id,
            status = %status,
            body = %detail,
            "Event forward rejected"
        );
        classify_status(status, &detail)
    }
}
