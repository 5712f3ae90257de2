#![deny(unsafe_code)]

pub mod auth;
pub mod worker;

use auth::{AuthKeys, AuthenticatedCaller, MaybeCaller};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use swiftcause_adapters::{MockGateway, StripeGateway};
use swiftcause_core::outbox::{OutboxEntry, OutboxError};
use swiftcause_core::{
    AccessPolicy, AccountStatusReply, Action, BackendConfig, CampaignLookup, CampaignSummary,
    Caller, ConnectionTokenReply, CreatePaymentIntentRequest, CreatePaymentIntentResponse,
    DonationBackend, DonationRecorder, DonationStore, EventBus, MailSettings, OnboardingLinkReply,
    OrganizationBody, Outbox, PaymentGateway, Resource, RetryPolicy, SetupIntentBody,
    SetupIntentReply, SideEffectDispatcher, StoreConfig, SuccessReply, SwiftCauseError,
    UpdatePaymentMethodBody, WebhookReply, WebhookVerifier,
};
use thiserror::Error;
use tower_http::trace::TraceLayer;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Clone)]
pub enum GatewayConfig {
    Stripe { secret_key: String },
    /// Deterministic in-process gateway for local runs.
    Mock,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store: StoreConfig,
    /// `None` keeps the outbox in memory only.
    pub outbox_path: Option<PathBuf>,
    pub retry_policy: RetryPolicy,
    pub gateway: GatewayConfig,
    pub webhook_secret: String,
    pub jwt_secret: String,
    pub mail: MailSettings,
    pub mail_api_key: Option<String>,
    pub backend: BackendConfig,
}

impl ServiceConfig {
    pub fn new(
        gateway: GatewayConfig,
        webhook_secret: impl Into<String>,
        jwt_secret: impl Into<String>,
        mail_from: impl Into<String>,
    ) -> Self {
        Self {
            store: StoreConfig::Memory,
            outbox_path: None,
            retry_policy: RetryPolicy::default(),
            gateway,
            webhook_secret: webhook_secret.into(),
            jwt_secret: jwt_secret.into(),
            mail: MailSettings {
                from: mail_from.into(),
            },
            mail_api_key: None,
            backend: BackendConfig::default(),
        }
    }

    fn validate(&self) -> Result<(), ServiceError> {
        if let GatewayConfig::Stripe { secret_key } = &self.gateway {
            if secret_key.trim().is_empty() {
                return Err(ServiceError::Config(
                    "payment provider secret key is required".to_string(),
                ));
            }
        }
        let required = [
            ("webhook signing secret", &self.webhook_secret),
            ("identity token secret", &self.jwt_secret),
            ("mail sender address", &self.mail.from),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ServiceError::Config(format!("{name} is required")));
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub backend: Arc<DonationBackend>,
    pub campaigns: CampaignLookup,
    pub store: Arc<dyn DonationStore>,
    pub events: EventBus,
    pub outbox: Arc<Outbox>,
    pub dispatcher: SideEffectDispatcher,
    pub auth: AuthKeys,
    store_backend: &'static str,
    gateway_provider: &'static str,
    mail_transport_configured: bool,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let ServiceConfig {
            store,
            outbox_path,
            retry_policy,
            gateway,
            webhook_secret,
            jwt_secret,
            mail,
            mail_api_key,
            backend,
        } = config;

        let store_backend = store.label();
        let store = store.open().await?;
        let gateway: Arc<dyn PaymentGateway> = match gateway {
            GatewayConfig::Stripe { secret_key } => Arc::new(StripeGateway::new(secret_key)),
            GatewayConfig::Mock => {
                tracing::warn!("using mock payment gateway; no real charges are made");
                Arc::new(MockGateway::new())
            }
        };
        let gateway_provider = gateway.provider();

        let outbox = match outbox_path {
            Some(path) => Outbox::load(path, retry_policy)?,
            None => Outbox::in_memory(retry_policy),
        };

        let events = EventBus::new();
        let recorder = DonationRecorder::new(store.clone(), events.clone());
        let backend = DonationBackend::new(
            gateway,
            recorder,
            WebhookVerifier::new(&webhook_secret),
            backend,
        );

        Ok(Self {
            backend: Arc::new(backend),
            campaigns: CampaignLookup::new(store.clone()),
            dispatcher: SideEffectDispatcher::new(store.clone(), mail),
            store,
            events,
            outbox: Arc::new(outbox),
            auth: AuthKeys::new(&jwt_secret),
            store_backend,
            gateway_provider,
            mail_transport_configured: mail_api_key.is_some_and(|key| !key.trim().is_empty()),
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/payment-intents", post(create_payment_intent))
        .route("/v1/setup-intents", post(create_setup_intent))
        .route("/v1/subscriptions/payment-method", post(update_payment_method))
        .route("/v1/organizations/onboarding-link", post(create_onboarding_link))
        .route("/v1/organizations/account-status", post(update_account_status))
        .route("/v1/terminal/connection-token", post(connection_token))
        .route("/v1/webhooks/stripe", post(stripe_webhook))
        .route("/v1/campaigns/:campaign_id", get(get_campaign))
        .route("/v1/outbox", get(list_outbox))
        .route("/v1/outbox/:entry_id/requeue", post(requeue_outbox_entry))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("core engine error: {0}")]
    Core(#[from] SwiftCauseError),
    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] SwiftCauseError),
}

impl ApiError {
    pub(crate) fn unauthorized(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

fn core_status(err: &SwiftCauseError) -> StatusCode {
    match err {
        SwiftCauseError::Validation(_) | SwiftCauseError::InvalidSignature(_) => {
            StatusCode::BAD_REQUEST
        }
        SwiftCauseError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        SwiftCauseError::Forbidden(_) => StatusCode::FORBIDDEN,
        SwiftCauseError::NotFound(_) => StatusCode::NOT_FOUND,
        SwiftCauseError::Provider { .. } => StatusCode::BAD_GATEWAY,
        SwiftCauseError::InvariantViolation(_)
        | SwiftCauseError::Storage(_)
        | SwiftCauseError::Outbox(_)
        | SwiftCauseError::Serialization(_)
        | SwiftCauseError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Http { status, message } => (status, message),
            ApiError::Core(err) => {
                let status = core_status(&err);
                if status.is_server_error() {
                    tracing::error!(status = status.as_u16(), error = %err, "request failed");
                }
                let message = match (&err, status) {
                    (SwiftCauseError::Provider { message, .. }, _) => message.clone(),
                    (_, StatusCode::INTERNAL_SERVER_ERROR) => "internal server error".to_string(),
                    _ => err.to_string(),
                };
                (status, message)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    store_backend: &'static str,
    gateway: &'static str,
    mail_transport_configured: bool,
    outbox_pending: usize,
    outbox_dead_letter: usize,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "swiftcause-service",
        store_backend: state.store_backend,
        gateway: state.gateway_provider,
        mail_transport_configured: state.mail_transport_configured,
        outbox_pending: state.outbox.pending_count().await,
        outbox_dead_letter: state.outbox.dead_letter_count().await,
    })
}

/// Callable contract: validation problems come back as `success: false`, not as an HTTP error.
async fn create_payment_intent(
    State(state): State<ServiceState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(request): Json<CreatePaymentIntentRequest>,
) -> Json<CreatePaymentIntentResponse> {
    Json(
        state
            .backend
            .create_payment_intent(Some(&caller), request)
            .await,
    )
}

async fn create_setup_intent(
    State(state): State<ServiceState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(body): Json<SetupIntentBody>,
) -> Result<Json<SetupIntentReply>, ApiError> {
    Ok(Json(state.backend.create_setup_intent(&caller, body).await?))
}

async fn update_payment_method(
    State(state): State<ServiceState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(body): Json<UpdatePaymentMethodBody>,
) -> Result<Json<SuccessReply>, ApiError> {
    Ok(Json(state.backend.update_payment_method(&caller, body).await?))
}

async fn create_onboarding_link(
    State(state): State<ServiceState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(body): Json<OrganizationBody>,
) -> Result<Json<OnboardingLinkReply>, ApiError> {
    Ok(Json(state.backend.create_onboarding_link(&caller, body).await?))
}

async fn update_account_status(
    State(state): State<ServiceState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Json(body): Json<OrganizationBody>,
) -> Result<Json<AccountStatusReply>, ApiError> {
    Ok(Json(state.backend.update_account_status(&caller, body).await?))
}

async fn connection_token(
    State(state): State<ServiceState>,
    MaybeCaller(caller): MaybeCaller,
) -> Result<Json<ConnectionTokenReply>, ApiError> {
    Ok(Json(state.backend.connection_token(caller.as_ref()).await?))
}

async fn stripe_webhook(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookReply>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    Ok(Json(state.backend.handle_webhook(&body, signature).await?))
}

async fn get_campaign(
    State(state): State<ServiceState>,
    Path(campaign_id): Path<String>,
) -> Result<Json<CampaignSummary>, ApiError> {
    Ok(Json(state.campaigns.summary(&campaign_id).await?))
}

fn require_operations_role(caller: &Caller) -> Result<(), ApiError> {
    let allowed = caller
        .role
        .is_some_and(|role| AccessPolicy::is_allowed(role, Resource::Donations, Action::Update));
    if allowed {
        Ok(())
    } else {
        Err(ApiError::Core(SwiftCauseError::Forbidden(
            "outbox access requires an administrator role".to_string(),
        )))
    }
}

#[derive(Debug, Clone, Serialize)]
struct OutboxListing {
    pending: usize,
    dead_letter: usize,
    entries: Vec<OutboxEntry>,
}

async fn list_outbox(
    State(state): State<ServiceState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
) -> Result<Json<OutboxListing>, ApiError> {
    require_operations_role(&caller)?;
    Ok(Json(OutboxListing {
        pending: state.outbox.pending_count().await,
        dead_letter: state.outbox.dead_letter_count().await,
        entries: state.outbox.list().await,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct RequeueOutcome {
    entry_id: String,
    status: &'static str,
}

async fn requeue_outbox_entry(
    State(state): State<ServiceState>,
    AuthenticatedCaller(caller): AuthenticatedCaller,
    Path(entry_id): Path<String>,
) -> Result<Json<RequeueOutcome>, ApiError> {
    require_operations_role(&caller)?;
    let requeued = state
        .outbox
        .requeue(&entry_id)
        .await
        .map_err(SwiftCauseError::from)?;
    if !requeued {
        return Err(ApiError::not_found(format!(
            "dead-lettered outbox entry '{}' not found",
            entry_id
        )));
    }
    tracing::info!(entry_id = %entry_id, uid = %caller.uid, "outbox entry requeued");
    Ok(Json(RequeueOutcome {
        entry_id,
        status: "pending",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth::Claims;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use swiftcause_core::{Campaign, Organization};
    use tower::ServiceExt;
    use uuid::Uuid;

    const WEBHOOK_SECRET: &str = "whsec_service";
    const JWT_SECRET: &str = "jwt-service";

    async fn state() -> ServiceState {
        let state = ServiceState::bootstrap(ServiceConfig::new(
            GatewayConfig::Mock,
            WEBHOOK_SECRET,
            JWT_SECRET,
            "receipts@swiftcause.org",
        ))
        .await
        .unwrap();
        state
            .store
            .upsert_campaign(
                &Campaign::new("camp-1", "Food Bank", "usd", 500_000).with_organization("org-1"),
            )
            .await
            .unwrap();
        state
            .store
            .upsert_organization(&Organization {
                id: "org-1".to_string(),
                name: "Food Bank Trust".to_string(),
                stripe: None,
            })
            .await
            .unwrap();
        state
    }

    fn token(state: &ServiceState, org_id: &str, role: &str) -> String {
        state
            .auth
            .issue(&Claims {
                sub: format!("uid-{}", Uuid::new_v4()),
                email: Some("admin@example.org".to_string()),
                org_id: Some(org_id.to_string()),
                role: Some(role.to_string()),
                exp: (Utc::now().timestamp() + 600) as usize,
            })
            .unwrap()
    }

    fn post_json(uri: &str, bearer: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn bootstrap_rejects_missing_secrets() {
        let result = ServiceState::bootstrap(ServiceConfig::new(
            GatewayConfig::Stripe {
                secret_key: " ".to_string(),
            },
            WEBHOOK_SECRET,
            JWT_SECRET,
            "receipts@swiftcause.org",
        ))
        .await;
        assert!(matches!(result, Err(ServiceError::Config(_))));

        let result = ServiceState::bootstrap(ServiceConfig::new(
            GatewayConfig::Mock,
            "",
            JWT_SECRET,
            "receipts@swiftcause.org",
        ))
        .await;
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[tokio::test]
    async fn payment_intent_requires_token_and_validates_amount() {
        let state = state().await;
        let bearer = token(&state, "org-1", "kiosk");
        let app = build_router(state);

        let body = serde_json::json!({ "amount": 5000, "currency": "usd", "campaignId": "camp-1" });
        let response = app
            .clone()
            .oneshot(post_json("/v1/payment-intents", None, body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(post_json("/v1/payment-intents", Some(&bearer), body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        assert!(json["clientSecret"].as_str().unwrap().contains("_secret_"));

        let response = app
            .oneshot(post_json(
                "/v1/payment-intents",
                Some(&bearer),
                serde_json::json!({ "amount": -1, "currency": "usd", "campaignId": "camp-1" }),
            ))
            .await
            .unwrap();
        let json = json_body(response).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].is_string());
        assert!(json.get("clientSecret").is_none());
    }

    #[tokio::test]
    async fn webhook_with_bad_signature_is_400_and_writes_nothing() {
        let state = state().await;
        let store = state.store.clone();
        let app = build_router(state);

        let payload = serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": { "object": {
                "id": "pi_forged",
                "amount": 5000,
                "currency": "usd",
                "metadata": { "campaignId": "camp-1" }
            }}
        })
        .to_string();
        let forged = WebhookVerifier::new("whsec_attacker").sign(payload.as_bytes(), Utc::now().timestamp());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/webhooks/stripe")
                    .header(SIGNATURE_HEADER, forged)
                    .body(Body::from(payload.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());
        assert!(store.list_donations("camp-1").await.unwrap().is_empty());
        assert_eq!(
            store.get_campaign("camp-1").await.unwrap().unwrap().collected_amount,
            0
        );

        let signed = WebhookVerifier::new(WEBHOOK_SECRET).sign(payload.as_bytes(), Utc::now().timestamp());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/webhooks/stripe")
                    .header(SIGNATURE_HEADER, signed)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.list_donations("camp-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn onboarding_link_enforces_organization_ownership() {
        let state = state().await;
        let outsider = token(&state, "org-2", "admin");
        let member = token(&state, "org-1", "admin");
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/organizations/onboarding-link",
                Some(&outsider),
                serde_json::json!({ "orgId": "org-1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(post_json(
                "/v1/organizations/onboarding-link",
                Some(&member),
                serde_json::json!({ "orgId": "org-1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["url"]
            .as_str()
            .unwrap()
            .starts_with("https://"));
    }

    #[tokio::test]
    async fn connection_token_is_open_by_default_and_campaigns_are_public() {
        let state = state().await;
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(post_json("/v1/terminal/connection-token", None, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["secret"].is_string());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/v1/campaigns/camp-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["title"], "Food Bank");

        let response = app
            .oneshot(Request::builder().uri("/v1/campaigns/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn outbox_endpoints_require_admin_role() {
        let state = state().await;
        let viewer = token(&state, "org-1", "viewer");
        let admin = token(&state, "org-1", "admin");
        let app = build_router(state);

        let get = |bearer: &str| {
            Request::builder()
                .uri("/v1/outbox")
                .header("authorization", format!("Bearer {bearer}"))
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(get(&viewer)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app.clone().oneshot(get(&admin)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["pending"], 0);

        let response = app
            .oneshot(post_json("/v1/outbox/missing/requeue", Some(&admin), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_backends() {
        let app = build_router(state().await);
        let response = app
            .oneshot(Request::builder().uri("/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["store_backend"], "memory");
        assert_eq!(json["gateway"], "mock");
    }
}
