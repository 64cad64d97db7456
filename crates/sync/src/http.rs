//! HTTP implementations of the remote API client and the reachability probe.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::action::{ActionKind, PendingAction};
use crate::connectivity::ReachabilityProbe;
use crate::transport::{ApiError, RemoteApi};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// `reqwest`-backed client for the marketplace mutation API.
pub struct HttpRemoteApi {
    api_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemoteApi {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_token(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: Some(token.into()),
            client: reqwest::Client::new(),
        }
    }

    /// Map an action to its mutation endpoint.
    fn endpoint(action: &PendingAction) -> String {
        match &action.kind {
            ActionKind::CreateOrder => "/orders".to_string(),
            ActionKind::UpdateOrder => format!("/orders/{}", action.entity.raw_id()),
            ActionKind::BulkOperation => "/orders/bulk".to_string(),
            ActionKind::AcceptQuote => format!("/quotes/{}/accept", action.entity.raw_id()),
            ActionKind::Custom(kind) => format!("/mutations/{kind}"),
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn submit(&self, action: &PendingAction) -> Result<Option<Value>, ApiError> {
        let url = format!("{}{}", self.api_url, Self::endpoint(action));

        let mut req = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&action.payload);

        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            // Endpoints may return an empty body; the entity state is optional.
            Ok(resp.json::<Value>().await.ok())
        } else {
            let message = resp.text().await.unwrap_or_default();
            Err(ApiError::from_status(status.as_u16(), message))
        }
    }
}

/// Probe that distinguishes "device reports online" from "API reachable".
pub struct HttpProbe {
    health_url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            health_url: format!("{}/health", api_url.into()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn reachable(&self) -> bool {
        self.client
            .get(&self.health_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::EntityKey;
    use fablink_core::{OrderId, QuoteId};
    use serde_json::json;

    #[test]
    fn routes_each_kind_to_its_endpoint() {
        let order = OrderId::new();
        let quote = QuoteId::new();

        let create = PendingAction::new(
            ActionKind::CreateOrder,
            EntityKey::order(order),
            json!({}),
        );
        assert_eq!(HttpRemoteApi::endpoint(&create), "/orders");

        let update = PendingAction::new(
            ActionKind::UpdateOrder,
            EntityKey::order(order),
            json!({}),
        );
        assert_eq!(
            HttpRemoteApi::endpoint(&update),
            format!("/orders/{order}")
        );

        let bulk = PendingAction::new(
            ActionKind::BulkOperation,
            EntityKey::custom("orders", "bulk"),
            json!({}),
        );
        assert_eq!(HttpRemoteApi::endpoint(&bulk), "/orders/bulk");

        let accept = PendingAction::new(
            ActionKind::AcceptQuote,
            EntityKey::quote(quote),
            json!({}),
        );
        assert_eq!(
            HttpRemoteApi::endpoint(&accept),
            format!("/quotes/{quote}/accept")
        );

        let custom = PendingAction::new(
            ActionKind::Custom("archive_order".to_string()),
            EntityKey::order(order),
            json!({}),
        );
        assert_eq!(HttpRemoteApi::endpoint(&custom), "/mutations/archive_order");
    }
}
