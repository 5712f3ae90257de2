//! Payment provider adapters for SwiftCause.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use swiftcause_core::gateway::{
    payment_intent_id_from_client_secret, AccountLink, AccountLinkRequest, ConfirmedPayment,
    CreatePaymentIntentRequest, CreatePaymentIntentResponse, CustomerRequest, IntentBackend,
    PaymentConfirmer, PaymentGateway, PaymentIntent, PaymentIntentRequest, PaymentMethodInput,
    ProviderError, SetupIntent, SetupIntentRequest, Subscription, SubscriptionRequest,
};
use swiftcause_core::orchestrator::GENERIC_PAYMENT_ERROR;
use swiftcause_core::types::StripeAccountState;

pub const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripeSetupIntent {
    id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripeAccountLink {
    url: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeAccount {
    id: String,
    #[serde(default)]
    charges_enabled: bool,
    #[serde(default)]
    payouts_enabled: bool,
    #[serde(default)]
    details_submitted: bool,
}

#[derive(Debug, Deserialize)]
struct StripeConnectionToken {
    secret: String,
}

/// Form-encoded parameters with Stripe's bracketed nesting (`metadata[key]`).
#[derive(Debug, Default)]
struct FormParams(Vec<(String, String)>);

impl FormParams {
    fn push(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.0.push((key.into(), value.to_string()));
        self
    }

    fn push_opt(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            self.push(key, value);
        }
        self
    }

    fn metadata(&mut self, prefix: &str, metadata: &BTreeMap<String, String>) -> &mut Self {
        for (key, value) in metadata {
            self.push(format!("{prefix}[{key}]"), value);
        }
        self
    }
}

async fn decode_response<T: DeserializeOwned>(
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<T, ProviderError> {
    let response =
        response.map_err(|e| ProviderError::new(format!("provider unreachable: {e}")).with_code("transport"))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| ProviderError::new(format!("provider response unreadable: {e}")).with_code("transport"))?;

    if status.is_success() {
        return serde_json::from_slice(&body)
            .map_err(|e| ProviderError::new(format!("unexpected provider response: {e}")));
    }

    match serde_json::from_slice::<StripeErrorEnvelope>(&body) {
        Ok(StripeErrorEnvelope { error }) => Err(ProviderError {
            code: error.code,
            decline_code: error.decline_code,
            message: error
                .message
                .unwrap_or_else(|| format!("provider returned HTTP {}", status.as_u16())),
        }),
        Err(_) => Err(ProviderError::new(format!(
            "provider returned HTTP {}",
            status.as_u16()
        ))),
    }
}

fn http_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Stripe REST gateway authenticated with the platform secret key.
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    secret_key: String,
    api_base: String,
}

impl std::fmt::Debug for StripeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeGateway")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl StripeGateway {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            secret_key: secret_key.into(),
            api_base: STRIPE_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn request(&self, method: Method, path: &str, idempotency_key: Option<&str>) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.secret_key);
        if let Some(key) = idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }
        builder
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &FormParams,
        idempotency_key: Option<&str>,
    ) -> Result<T, ProviderError> {
        tracing::debug!(path, "stripe request");
        decode_response(
            self.request(Method::POST, path, idempotency_key)
                .form(&params.0)
                .send()
                .await,
        )
        .await
    }

    async fn create_product(&self, name: &str, idempotency_key: Option<&str>) -> Result<String, ProviderError> {
        let mut params = FormParams::default();
        params.push("name", name);
        let key = idempotency_key.map(|k| format!("{k}-product"));
        let product: IdObject = self.post("/products", &params, key.as_deref()).await?;
        Ok(product.id)
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> &'static str {
        "stripe"
    }

    async fn create_customer(&self, request: &CustomerRequest) -> Result<String, ProviderError> {
        let mut params = FormParams::default();
        params
            .push_opt("email", request.email.as_deref())
            .push_opt("name", request.name.as_deref())
            .metadata("metadata", &request.metadata);
        let customer: IdObject = self
            .post("/customers", &params, request.idempotency_key.as_deref())
            .await?;
        Ok(customer.id)
    }

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, ProviderError> {
        let mut params = FormParams::default();
        params
            .push("amount", request.amount)
            .push("currency", &request.currency)
            .push("automatic_payment_methods[enabled]", true)
            .push_opt("customer", request.customer_id.as_deref())
            .push_opt("description", request.description.as_deref())
            .metadata("metadata", &request.metadata);
        if request.setup_future_usage {
            params.push("setup_future_usage", "off_session");
        }
        let intent: StripePaymentIntent = self
            .post("/payment_intents", &params, request.idempotency_key.as_deref())
            .await?;
        let client_secret = intent
            .client_secret
            .ok_or_else(|| ProviderError::new("payment intent returned without a client secret"))?;
        Ok(PaymentIntent {
            id: intent.id,
            client_secret,
            status: intent.status,
        })
    }

    async fn create_setup_intent(
        &self,
        request: &SetupIntentRequest,
    ) -> Result<SetupIntent, ProviderError> {
        let mut params = FormParams::default();
        params
            .push("customer", &request.customer_id)
            .push("usage", "off_session")
            .metadata("metadata", &request.metadata);
        let intent: StripeSetupIntent = self.post("/setup_intents", &params, None).await?;
        Ok(SetupIntent {
            id: intent.id,
            client_secret: intent.client_secret,
        })
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<Subscription, ProviderError> {
        let product_id = self
            .create_product(&request.product_name, request.idempotency_key.as_deref())
            .await?;
        let (unit, count) = request.interval.billing_cadence();

        let mut params = FormParams::default();
        params
            .push("customer", &request.customer_id)
            .push("items[0][price_data][currency]", &request.currency)
            .push("items[0][price_data][product]", &product_id)
            .push("items[0][price_data][unit_amount]", request.amount)
            .push("items[0][price_data][recurring][interval]", unit)
            .push("items[0][price_data][recurring][interval_count]", count)
            .push_opt("default_payment_method", request.payment_method_id.as_deref())
            .metadata("metadata", &request.metadata);
        if let Some(first_charge_at) = request.first_charge_at {
            params
                .push("trial_end", first_charge_at.timestamp())
                .push("proration_behavior", "none");
        }
        let subscription: StripeSubscription = self
            .post("/subscriptions", &params, request.idempotency_key.as_deref())
            .await?;
        Ok(Subscription {
            id: subscription.id,
            status: subscription.status,
        })
    }

    async fn update_subscription_payment_method(
        &self,
        subscription_id: &str,
        payment_method_id: &str,
    ) -> Result<(), ProviderError> {
        let mut params = FormParams::default();
        params.push("default_payment_method", payment_method_id);
        let _: IdObject = self
            .post(&format!("/subscriptions/{subscription_id}"), &params, None)
            .await?;
        Ok(())
    }

    async fn create_connected_account(
        &self,
        email: Option<&str>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, ProviderError> {
        let mut params = FormParams::default();
        params
            .push("type", "express")
            .push("capabilities[card_payments][requested]", true)
            .push("capabilities[transfers][requested]", true)
            .push_opt("email", email)
            .metadata("metadata", metadata);
        let account: IdObject = self.post("/accounts", &params, None).await?;
        Ok(account.id)
    }

    async fn create_account_link(
        &self,
        request: &AccountLinkRequest,
    ) -> Result<AccountLink, ProviderError> {
        let mut params = FormParams::default();
        params
            .push("account", &request.account_id)
            .push("refresh_url", &request.refresh_url)
            .push("return_url", &request.return_url)
            .push("type", "account_onboarding");
        let link: StripeAccountLink = self.post("/account_links", &params, None).await?;
        Ok(AccountLink {
            url: link.url,
            expires_at: link.expires_at,
        })
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<StripeAccountState, ProviderError> {
        let account: StripeAccount = decode_response(
            self.request(Method::GET, &format!("/accounts/{account_id}"), None)
                .send()
                .await,
        )
        .await?;
        Ok(StripeAccountState {
            account_id: account.id,
            charges_enabled: account.charges_enabled,
            payouts_enabled: account.payouts_enabled,
            details_submitted: account.details_submitted,
        })
    }

    async fn create_connection_token(&self) -> Result<String, ProviderError> {
        let token: StripeConnectionToken = self
            .post("/terminal/connection_tokens", &FormParams::default(), None)
            .await?;
        Ok(token.secret)
    }
}

/// Client-side confirmation with the publishable key and a client secret.
#[derive(Clone)]
pub struct StripeConfirmer {
    client: Client,
    publishable_key: String,
    api_base: String,
}

impl StripeConfirmer {
    pub fn new(publishable_key: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            publishable_key: publishable_key.into(),
            api_base: STRIPE_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl PaymentConfirmer for StripeConfirmer {
    async fn confirm_payment(
        &self,
        client_secret: &str,
        payment_method: &PaymentMethodInput,
    ) -> Result<ConfirmedPayment, ProviderError> {
        let intent_id = payment_intent_id_from_client_secret(client_secret)
            .ok_or_else(|| ProviderError::new("malformed client secret"))?;
        let mut params = FormParams::default();
        params
            .push("client_secret", client_secret)
            .push("payment_method", &payment_method.payment_method_id);
        let intent: StripePaymentIntent = decode_response(
            self.client
                .post(format!("{}/payment_intents/{}/confirm", self.api_base, intent_id))
                .bearer_auth(&self.publishable_key)
                .form(&params.0)
                .send()
                .await,
        )
        .await?;
        Ok(ConfirmedPayment {
            payment_intent_id: intent.id,
            status: intent.status,
        })
    }
}

/// Calls a remote SwiftCause service to mint payment intents.
#[derive(Clone)]
pub struct HttpIntentBackend {
    client: Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpIntentBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            endpoint: format!("{}/v1/payment-intents", base_url.into().trim_end_matches('/')),
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[async_trait]
impl IntentBackend for HttpIntentBackend {
    async fn request_payment_intent(
        &self,
        request: CreatePaymentIntentRequest,
    ) -> CreatePaymentIntentResponse {
        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(endpoint = %self.endpoint, error = %err, "payment intent request failed");
                return CreatePaymentIntentResponse::rejected(GENERIC_PAYMENT_ERROR);
            }
        };
        let status = response.status();
        match response.json::<CreatePaymentIntentResponse>().await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    status = status.as_u16(),
                    error = %err,
                    "payment intent response unreadable"
                );
                CreatePaymentIntentResponse::rejected(GENERIC_PAYMENT_ERROR)
            }
        }
    }
}

/// Deterministic in-process gateway for local runs and tests.
#[derive(Debug, Default)]
pub struct MockGateway {
    calls: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next(&self) -> usize {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn provider(&self) -> &'static str {
        "mock"
    }

    async fn create_customer(&self, _request: &CustomerRequest) -> Result<String, ProviderError> {
        Ok(format!("cus_mock_{}", self.next()))
    }

    async fn create_payment_intent(
        &self,
        _request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, ProviderError> {
        let n = self.next();
        Ok(PaymentIntent {
            id: format!("pi_mock_{n}"),
            client_secret: format!("pi_mock_{n}_secret_{}", Utc::now().timestamp()),
            status: "requires_payment_method".to_string(),
        })
    }

    async fn create_setup_intent(
        &self,
        _request: &SetupIntentRequest,
    ) -> Result<SetupIntent, ProviderError> {
        let n = self.next();
        Ok(SetupIntent {
            id: format!("seti_mock_{n}"),
            client_secret: format!("seti_mock_{n}_secret_mock"),
        })
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<Subscription, ProviderError> {
        let n = self.next();
        let status = if request.first_charge_at.is_some() {
            "trialing"
        } else {
            "active"
        };
        Ok(Subscription {
            id: format!("sub_mock_{n}"),
            status: status.to_string(),
        })
    }

    async fn update_subscription_payment_method(
        &self,
        _subscription_id: &str,
        _payment_method_id: &str,
    ) -> Result<(), ProviderError> {
        self.next();
        Ok(())
    }

    async fn create_connected_account(
        &self,
        _email: Option<&str>,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<String, ProviderError> {
        Ok(format!("acct_mock_{}", self.next()))
    }

    async fn create_account_link(
        &self,
        request: &AccountLinkRequest,
    ) -> Result<AccountLink, ProviderError> {
        self.next();
        Ok(AccountLink {
            url: format!("https://connect.stripe.test/setup/{}", request.account_id),
            expires_at: Some(Utc::now().timestamp() + 300),
        })
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<StripeAccountState, ProviderError> {
        self.next();
        Ok(StripeAccountState {
            account_id: account_id.to_string(),
            charges_enabled: true,
            payouts_enabled: true,
            details_submitted: true,
        })
    }

    async fn create_connection_token(&self) -> Result<String, ProviderError> {
        Ok(format!("pst_mock_{}", self.next()))
    }
}

/// Test-mode payment method tokens that decline at confirmation.
pub const DECLINING_PAYMENT_METHODS: [&str; 3] = [
    "pm_card_chargeDeclined",
    "pm_card_visa_chargeDeclined",
    "pm_card_chargeDeclinedInsufficientFunds",
];

/// Confirms every payment except the well-known declining test tokens.
#[derive(Debug, Clone, Default)]
pub struct MockConfirmer;

#[async_trait]
impl PaymentConfirmer for MockConfirmer {
    async fn confirm_payment(
        &self,
        client_secret: &str,
        payment_method: &PaymentMethodInput,
    ) -> Result<ConfirmedPayment, ProviderError> {
        let intent_id = payment_intent_id_from_client_secret(client_secret)
            .ok_or_else(|| ProviderError::new("malformed client secret"))?;
        if payment_method.payment_method_id == "pm_card_chargeDeclinedInsufficientFunds" {
            return Err(ProviderError::declined(
                "Your card has insufficient funds.",
                "insufficient_funds",
            ));
        }
        if DECLINING_PAYMENT_METHODS.contains(&payment_method.payment_method_id.as_str()) {
            return Err(ProviderError::declined(
                "Your card was declined.",
                "generic_decline",
            ));
        }
        Ok(ConfirmedPayment {
            payment_intent_id: intent_id.to_string(),
            status: "succeeded".to_string(),
        })
    }
}

/// Gateway whose every call fails; useful for failure-path testing.
#[derive(Debug, Clone)]
pub struct DecliningGateway {
    reason: String,
}

impl DecliningGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn fail<T>(&self) -> Result<T, ProviderError> {
        Err(ProviderError::new(self.reason.clone()).with_code("api_error"))
    }
}

#[async_trait]
impl PaymentGateway for DecliningGateway {
    fn provider(&self) -> &'static str {
        "declining"
    }

    async fn create_customer(&self, _request: &CustomerRequest) -> Result<String, ProviderError> {
        self.fail()
    }

    async fn create_payment_intent(
        &self,
        _request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, ProviderError> {
        self.fail()
    }

    async fn create_setup_intent(
        &self,
        _request: &SetupIntentRequest,
    ) -> Result<SetupIntent, ProviderError> {
        self.fail()
    }

    async fn create_subscription(
        &self,
        _request: &SubscriptionRequest,
    ) -> Result<Subscription, ProviderError> {
        self.fail()
    }

    async fn update_subscription_payment_method(
        &self,
        _subscription_id: &str,
        _payment_method_id: &str,
    ) -> Result<(), ProviderError> {
        self.fail()
    }

    async fn create_connected_account(
        &self,
        _email: Option<&str>,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<String, ProviderError> {
        self.fail()
    }

    async fn create_account_link(
        &self,
        _request: &AccountLinkRequest,
    ) -> Result<AccountLink, ProviderError> {
        self.fail()
    }

    async fn retrieve_account(&self, _account_id: &str) -> Result<StripeAccountState, ProviderError> {
        self.fail()
    }

    async fn create_connection_token(&self) -> Result<String, ProviderError> {
        self.fail()
    }
}
