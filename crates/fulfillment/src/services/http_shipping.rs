//! HTTP client for the external shipment provider.
//!
//! The provider authenticates with a bearer token obtained from a login
//! call. The token is cached and fetched again when a call answers 401.

use std::time::Duration;

use async_trait::async_trait;
use domain::ShipmentLinkage;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::services::shipping::{ShipmentProvider, ShipmentRequest, TrackingEvent, TrackingInfo};

/// Connection settings for [`HttpShipmentProvider`].
#[derive(Debug, Clone)]
pub struct HttpShipmentConfig {
    /// Base URL without a trailing slash, e.g. `https://api.provider.example/v1/external`.
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub timeout: Duration,
}

impl HttpShipmentConfig {
    pub fn new(
        base_url: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            email: email.into(),
            password: password.into(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Serialize)]
struct IdsRequest<'a> {
    ids: &'a [String],
}

/// Providers return ids as either JSON numbers or strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProviderId {
    Number(u64),
    Text(String),
}

impl ProviderId {
    fn into_string(self) -> String {
        match self {
            ProviderId::Number(n) => n.to_string(),
            ProviderId::Text(s) => s,
        }
    }
}

#[derive(Deserialize)]
struct CreateOrderResponse {
    order_id: ProviderId,
    shipment_id: ProviderId,
    #[serde(default)]
    awb_code: Option<String>,
}

#[derive(Deserialize)]
struct TrackingResponse {
    tracking_data: TrackingData,
}

#[derive(Deserialize)]
struct TrackingData {
    #[serde(default)]
    shipment_track: Vec<ShipmentTrack>,
    #[serde(default)]
    shipment_track_activities: Vec<TrackActivity>,
}

#[derive(Deserialize)]
struct ShipmentTrack {
    #[serde(default)]
    awb_code: Option<String>,
    current_status: String,
}

#[derive(Deserialize)]
struct TrackActivity {
    date: String,
    activity: String,
    #[serde(default)]
    location: Option<String>,
}

impl TryFrom<TrackingResponse> for TrackingInfo {
    type Error = ServiceError;

    fn try_from(response: TrackingResponse) -> Result<Self, Self::Error> {
        let data = response.tracking_data;
        let track = data
            .shipment_track
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::InvalidResponse("tracking data is empty".to_string()))?;
        Ok(TrackingInfo {
            current_status: track.current_status,
            awb_code: track.awb_code.filter(|code| !code.is_empty()),
            events: data
                .shipment_track_activities
                .into_iter()
                .map(|activity| TrackingEvent {
                    status: activity.activity,
                    location: activity.location,
                    timestamp: activity.date,
                })
                .collect(),
        })
    }
}

/// Shipment provider reached over HTTP.
pub struct HttpShipmentProvider {
    client: Client,
    config: HttpShipmentConfig,
    token: RwLock<Option<String>>,
}

impl HttpShipmentProvider {
    pub fn new(config: HttpShipmentConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path)
    }

    async fn bearer(&self) -> Result<String, ServiceError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    async fn login(&self) -> Result<String, ServiceError> {
        let response = self
            .client
            .post(self.url("auth/login"))
            .json(&LoginRequest {
                email: &self.config.email,
                password: &self.config.password,
            })
            .send()
            .await?;
        let body: LoginResponse = check_status(response).await?.json().await?;
        *self.token.write().await = Some(body.token.clone());
        debug!("Obtained shipment provider token");
        Ok(body.token)
    }

    /// Sends an authenticated request, logging in again once on 401.
    async fn send<F>(&self, build: F) -> Result<Response, ServiceError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.bearer().await?;
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        debug!("Shipment provider token rejected, logging in again");
        *self.token.write().await = None;
        let token = self.login().await?;
        check_status(build(&token).send().await?).await
    }
}

async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), body = %body, "Shipment provider returned an error");
    Err(ServiceError::from_status(status.as_u16(), body))
}

#[async_trait]
impl ShipmentProvider for HttpShipmentProvider {
    #[tracing::instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_order(
        &self,
        request: &ShipmentRequest,
    ) -> Result<ShipmentLinkage, ServiceError> {
        let url = self.url("orders/create/adhoc");
        let response = self
            .send(|token| self.client.post(&url).bearer_auth(token).json(request))
            .await?;
        let body: CreateOrderResponse = response.json().await?;
        Ok(ShipmentLinkage {
            shipment_order_id: body.order_id.into_string(),
            shipment_id: body.shipment_id.into_string(),
            awb_code: body.awb_code.filter(|code| !code.is_empty()),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_order(&self, provider_order_ids: &[String]) -> Result<(), ServiceError> {
        let url = self.url("orders/cancel");
        let body = IdsRequest {
            ids: provider_order_ids,
        };
        self.send(|token| self.client.post(&url).bearer_auth(token).json(&body))
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn track_by_order_id(
        &self,
        provider_order_id: &str,
    ) -> Result<TrackingInfo, ServiceError> {
        let url = self.url("courier/track");
        let response = self
            .send(|token| {
                self.client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("order_id", provider_order_id)])
            })
            .await?;
        let body: TrackingResponse = response.json().await?;
        body.try_into()
    }

    #[tracing::instrument(skip(self))]
    async fn track_by_shipment_id(&self, shipment_id: &str) -> Result<TrackingInfo, ServiceError> {
        let url = self.url(&format!("courier/track/shipment/{shipment_id}"));
        let response = self
            .send(|token| self.client.get(&url).bearer_auth(token))
            .await?;
        let body: TrackingResponse = response.json().await?;
        body.try_into()
    }

    #[tracing::instrument(skip(self))]
    async fn print_invoice(&self, provider_order_ids: &[String]) -> Result<Vec<u8>, ServiceError> {
        let url = self.url("orders/print/invoice");
        let body = IdsRequest {
            ids: provider_order_ids,
        };
        let response = self
            .send(|token| self.client.post(&url).bearer_auth(token).json(&body))
            .await?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use common::{AddressId, OrderId, UserId};
    use domain::{Money, PaymentMethod};
    use serde_json::{Value, json};

    use super::*;
    use crate::services::shipping::ShipmentLine;

    #[derive(Default)]
    struct Fake {
        logins: AtomicU32,
        reject_next_token: AtomicU32,
    }

    fn authorized(fake: &Fake, headers: &HeaderMap) -> bool {
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let expected = format!("Bearer token-{}", fake.logins.load(Ordering::SeqCst));
        let stale = fake
            .reject_next_token
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        !stale && presented == expected
    }

    async fn login(State(fake): State<Arc<Fake>>, Json(body): Json<Value>) -> impl IntoResponse {
        if body["password"] != "secret" {
            return (AxumStatus::UNAUTHORIZED, Json(json!({"message": "bad credentials"})));
        }
        let n = fake.logins.fetch_add(1, Ordering::SeqCst) + 1;
        (AxumStatus::OK, Json(json!({"token": format!("token-{n}")})))
    }

    async fn create(
        State(fake): State<Arc<Fake>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        if !authorized(&fake, &headers) {
            return (AxumStatus::UNAUTHORIZED, Json(json!({"message": "expired"})));
        }
        if body["items"].as_array().is_none_or(|items| items.is_empty()) {
            return (AxumStatus::UNPROCESSABLE_ENTITY, Json(json!({"message": "no items"})));
        }
        (
            AxumStatus::OK,
            Json(json!({"order_id": 91001, "shipment_id": 77001, "awb_code": ""})),
        )
    }

    async fn track(State(fake): State<Arc<Fake>>, headers: HeaderMap) -> impl IntoResponse {
        if !authorized(&fake, &headers) {
            return (AxumStatus::UNAUTHORIZED, Json(json!({})));
        }
        (
            AxumStatus::OK,
            Json(json!({
                "tracking_data": {
                    "shipment_track": [{"awb_code": "AWB123", "current_status": "IN TRANSIT"}],
                    "shipment_track_activities": [
                        {"date": "2026-10-01 10:00:00", "activity": "Picked up", "location": "Pune"}
                    ]
                }
            })),
        )
    }

    async fn cancel() -> impl IntoResponse {
        (AxumStatus::SERVICE_UNAVAILABLE, "maintenance")
    }

    async fn invoice() -> impl IntoResponse {
        (
            [(axum::http::header::CONTENT_TYPE, "application/pdf")],
            b"%PDF-1.4 fake".to_vec(),
        )
    }

    async fn spawn_provider(fake: Arc<Fake>) -> String {
        let app = Router::new()
            .route("/auth/login", post(login))
            .route("/orders/create/adhoc", post(create))
            .route("/orders/cancel", post(cancel))
            .route("/orders/print/invoice", post(invoice))
            .route("/courier/track", get(track))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request() -> ShipmentRequest {
        ShipmentRequest {
            order_id: OrderId::new(),
            user_id: UserId::new(),
            shipping_address_id: AddressId::new(),
            payment_method: PaymentMethod::Cod,
            sub_total: Money::from_cents(1500),
            items: vec![ShipmentLine {
                name: "Wool socks".to_string(),
                sku: "socks-1".to_string(),
                units: 3,
                selling_price: Money::from_cents(500),
            }],
        }
    }

    fn provider(base_url: &str, password: &str) -> HttpShipmentProvider {
        HttpShipmentProvider::new(HttpShipmentConfig::new(base_url, "ops@shop.test", password))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_order_logs_in_once_and_reuses_token() {
        let fake = Arc::new(Fake::default());
        let base = spawn_provider(fake.clone()).await;
        let provider = provider(&base, "secret");

        let linkage = provider.create_order(&request()).await.unwrap();
        assert_eq!(linkage.shipment_order_id, "91001");
        assert_eq!(linkage.shipment_id, "77001");
        assert_eq!(linkage.awb_code, None);

        let tracking = provider.track_by_order_id("91001").await.unwrap();
        assert_eq!(tracking.current_status, "IN TRANSIT");
        assert_eq!(tracking.awb_code.as_deref(), Some("AWB123"));
        assert_eq!(tracking.events.len(), 1);
        assert_eq!(fake.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_token_triggers_relogin() {
        let fake = Arc::new(Fake::default());
        let base = spawn_provider(fake.clone()).await;
        let provider = provider(&base, "secret");

        provider.create_order(&request()).await.unwrap();
        fake.reject_next_token.store(1, Ordering::SeqCst);
        provider.create_order(&request()).await.unwrap();
        assert_eq!(fake.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_status_classification() {
        let fake = Arc::new(Fake::default());
        let base = spawn_provider(fake.clone()).await;

        let bad_login = provider(&base, "wrong").create_order(&request()).await;
        assert!(matches!(
            bad_login,
            Err(ServiceError::Rejected { status: 401, .. })
        ));

        let provider = provider(&base, "secret");
        let mut empty = request();
        empty.items.clear();
        assert!(matches!(
            provider.create_order(&empty).await,
            Err(ServiceError::Rejected { status: 422, .. })
        ));
        assert!(matches!(
            provider.cancel_order(&["91001".to_string()]).await,
            Err(ServiceError::Upstream { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_print_invoice_returns_bytes() {
        let fake = Arc::new(Fake::default());
        let base = spawn_provider(fake).await;
        let document = provider(&base, "secret")
            .print_invoice(&["91001".to_string()])
            .await
            .unwrap();
        assert!(document.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_retryable() {
        use resilience::Retryable;

        let provider = HttpShipmentProvider::new(
            HttpShipmentConfig::new("http://127.0.0.1:1", "a", "b")
                .with_timeout(Duration::from_millis(500)),
        )
        .unwrap();
        let err = provider.create_order(&request()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
