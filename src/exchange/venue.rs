//! Signed REST client for the order venue.

use super::traits::OrderVenue;
use super::types::*;
use crate::config::VenueConfig;
use crate::error::VenueError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// REST order venue authenticated with HMAC-SHA256 request signatures.
///
/// Every request carries `POLY_API_KEY`, `POLY_TIMESTAMP`, `POLY_PASSPHRASE`
/// and `POLY_SIGNATURE`, where the signature is the hex HMAC of
/// `timestamp + METHOD + path + body`.
pub struct RestVenueClient {
    http: Client,
    base_url: String,
    api_key: String,
    secret_key: String,
    passphrase: String,
}

impl RestVenueClient {
    /// Create a new venue client from configuration.
    pub fn new(config: &VenueConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            passphrase: config.passphrase.clone(),
        })
    }

    /// Generate HMAC-SHA256 signature for a request.
    fn sign(&self, timestamp: i64, method: &Method, path: &str, body: &str) -> Result<String, VenueError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| VenueError::Protocol(format!("invalid signing key: {e}")))?;
        mac.update(format!("{timestamp}{}{path}{body}", method.as_str()).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Send a signed request and return the status and raw body.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<(StatusCode, String), VenueError> {
        let timestamp = Utc::now().timestamp_millis();
        let payload = body.unwrap_or_default();
        let signature = self.sign(timestamp, &method, path, &payload)?;

        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("POLY_API_KEY", &self.api_key)
            .header("POLY_TIMESTAMP", timestamp.to_string())
            .header("POLY_PASSPHRASE", &self.passphrase)
            .header("POLY_SIGNATURE", signature);

        if !payload.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(payload);
        }

        let response = request
            .send()
            .await
            .map_err(|e| VenueError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| VenueError::Transport(e.to_string()))?;

        Ok((status, text))
    }

    fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, VenueError> {
        serde_json::from_str(body).map_err(|e| VenueError::Protocol(e.to_string()))
    }

    /// Map non-success responses onto the venue error taxonomy.
    fn classify(status: StatusCode, body: String) -> VenueError {
        match status {
            StatusCode::NOT_FOUND => VenueError::NotFound(body),
            StatusCode::CONFLICT => VenueError::AlreadyFilled(body),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                VenueError::Transport(format!("http {}: {body}", s.as_u16()))
            }
            _ => VenueError::Rejected(body),
        }
    }
}

#[async_trait]
impl OrderVenue for RestVenueClient {
    #[instrument(skip(self, request), fields(client_order_id = %request.client_order_id, market = %request.market_id))]
    async fn submit(&self, request: &OrderRequest) -> Result<VenueOrder, VenueError> {
        let body = serde_json::to_string(request).map_err(|e| VenueError::Protocol(e.to_string()))?;
        let (status, text) = self.send(Method::POST, "/orders", Some(body)).await?;

        if !status.is_success() {
            let err = Self::classify(status, text);
            warn!(error = %err, "Order submission not accepted");
            return Err(err);
        }

        let order: VenueOrder = Self::decode(&text)?;
        debug!(order_id = %order.order_id, status = ?order.status, "Order acknowledged");
        Ok(order)
    }

    #[instrument(skip(self))]
    async fn cancel(&self, order_id: &str) -> Result<VenueOrder, VenueError> {
        let path = format!("/orders/{}", urlencoding::encode(order_id));
        let (status, text) = self.send(Method::DELETE, &path, None).await?;

        if !status.is_success() {
            return Err(Self::classify(status, text));
        }
        Self::decode(&text)
    }

    #[instrument(skip(self))]
    async fn query(&self, order_id: &str) -> Result<VenueOrder, VenueError> {
        let path = format!("/orders/{}", urlencoding::encode(order_id));
        let (status, text) = self.send(Method::GET, &path, None).await?;

        if !status.is_success() {
            return Err(Self::classify(status, text));
        }
        Self::decode(&text)
    }

    #[instrument(skip(self))]
    async fn find_by_client_id(
        &self,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<VenueOrder>, VenueError> {
        let path = format!(
            "/orders?clientOrderId={}",
            urlencoding::encode(client_order_id.as_str())
        );
        let (status, text) = self.send(Method::GET, &path, None).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            // A lookup that fails leaves the submission state unknown.
            return Err(VenueError::Transport(format!(
                "lookup failed with http {}: {text}",
                status.as_u16()
            )));
        }

        let orders: Vec<VenueOrder> = Self::decode(&text)?;
        Ok(orders.into_iter().next())
    }
}
