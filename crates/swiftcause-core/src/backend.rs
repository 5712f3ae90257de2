//! Server-side payment handlers.
//!
//! Each handler is an isolated request: it validates input, talks to the
//! provider, and writes to the store. No state is kept between calls.

use crate::error::SwiftCauseError;
use crate::gateway::{
    AccountLinkRequest, CreatePaymentIntentRequest, CreatePaymentIntentResponse, CustomerRequest,
    IntentBackend, PaymentGateway, PaymentIntentRequest, SetupIntentRequest, SubscriptionRequest,
};
use crate::recorder::DonationRecorder;
use crate::session::Caller;
use crate::store::DonationStore;
use crate::types::{Donation, DonationData, RecurringInterval, StripeAccountState};
use crate::webhook::WebhookVerifier;
use async_trait::async_trait;
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub supported_currencies: Vec<String>,
    pub onboarding_return_url: String,
    pub onboarding_refresh_url: String,
    pub require_auth_for_connection_token: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            supported_currencies: vec!["gbp".to_string(), "usd".to_string(), "eur".to_string()],
            onboarding_return_url: "http://localhost:3000/admin/onboarding/complete".to_string(),
            onboarding_refresh_url: "http://localhost:3000/admin/onboarding/refresh".to_string(),
            require_auth_for_connection_token: false,
        }
    }
}

impl BackendConfig {
    pub fn supports_currency(&self, currency: &str) -> bool {
        self.supported_currencies
            .iter()
            .any(|c| c.eq_ignore_ascii_case(currency))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetupIntentBody {
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetupIntentReply {
    pub client_secret: String,
    pub customer_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePaymentMethodBody {
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub payment_method_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuccessReply {
    pub success: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationBody {
    #[serde(default)]
    pub org_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnboardingLinkReply {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatusReply {
    pub success: bool,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionTokenReply {
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReply {
    pub received: bool,
    pub event_type: String,
    pub handled: bool,
}

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: ProviderEventData,
}

#[derive(Debug, Deserialize)]
struct ProviderEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
    amount: u64,
    currency: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    customer: serde_json::Value,
    #[serde(default)]
    payment_method: serde_json::Value,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    last_payment_error: Option<ProviderErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorObject {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    billing_reason: Option<String>,
    #[serde(default)]
    amount_paid: u64,
    currency: String,
    #[serde(default)]
    payment_intent: serde_json::Value,
    #[serde(default)]
    subscription: serde_json::Value,
    #[serde(default)]
    subscription_details: Option<SubscriptionDetails>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionDetails {
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AccountObject {
    id: String,
    #[serde(default)]
    charges_enabled: bool,
    #[serde(default)]
    payouts_enabled: bool,
    #[serde(default)]
    details_submitted: bool,
}

/// Provider references arrive either as an id string or as an expanded object.
fn object_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
        serde_json::Value::Object(map) => map.get("id").and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

fn event_time(created: Option<i64>) -> DateTime<Utc> {
    created
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

/// Positive integer minor units. Strings, fractions, and negatives are rejected.
pub fn parse_amount(value: &serde_json::Value) -> Result<u64, String> {
    value
        .as_u64()
        .filter(|amount| *amount > 0)
        .ok_or_else(|| "amount must be a positive integer in minor currency units".to_string())
}

fn ensure_org_member(caller: &Caller, org_id: &str) -> Result<(), SwiftCauseError> {
    if org_id.trim().is_empty() {
        return Err(SwiftCauseError::validation("orgId is required"));
    }
    if caller.organization_id.as_deref() != Some(org_id) {
        return Err(SwiftCauseError::Forbidden(format!(
            "caller is not a member of organization '{}'",
            org_id
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct DonationBackend {
    store: Arc<dyn DonationStore>,
    gateway: Arc<dyn PaymentGateway>,
    recorder: DonationRecorder,
    verifier: WebhookVerifier,
    config: BackendConfig,
}

impl DonationBackend {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        recorder: DonationRecorder,
        verifier: WebhookVerifier,
        config: BackendConfig,
    ) -> Self {
        Self {
            store: recorder.store().clone(),
            gateway,
            recorder,
            verifier,
            config,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DonationStore> {
        &self.store
    }

    fn provider_error(&self, err: crate::gateway::ProviderError) -> SwiftCauseError {
        err.into_error(self.gateway.provider())
    }

    /// Reuse `users/{uid}.stripeCustomerId` or create and remember a new customer.
    async fn customer_for(
        &self,
        caller: &Caller,
        name: Option<&str>,
    ) -> Result<String, SwiftCauseError> {
        if let Some(user) = self.store.get_user(&caller.uid).await? {
            if let Some(customer_id) = user.stripe_customer_id.filter(|id| !id.is_empty()) {
                return Ok(customer_id);
            }
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("uid".to_string(), caller.uid.clone());
        let customer_id = self
            .gateway
            .create_customer(&CustomerRequest {
                email: caller.email.clone(),
                name: name.map(str::to_string),
                metadata,
                idempotency_key: None,
            })
            .await
            .map_err(|e| self.provider_error(e))?;
        self.store
            .set_stripe_customer_id(&caller.uid, &customer_id)
            .await?;
        tracing::info!(uid = %caller.uid, customer_id = %customer_id, "provider customer created");
        Ok(customer_id)
    }

    async fn recurring_customer(
        &self,
        caller: Option<&Caller>,
        data: &DonationData,
        idempotency_key: Option<&str>,
    ) -> Result<String, SwiftCauseError> {
        match caller {
            Some(caller) => self.customer_for(caller, data.donor_name.as_deref()).await,
            None => {
                let mut metadata = BTreeMap::new();
                if let Some(kiosk_id) = &data.kiosk_id {
                    metadata.insert("kioskId".to_string(), kiosk_id.clone());
                }
                self.gateway
                    .create_customer(&CustomerRequest {
                        email: data.donor_email.clone(),
                        name: data.donor_name.clone(),
                        metadata,
                        // A retried attempt must not leave a second anonymous customer behind.
                        idempotency_key: idempotency_key.map(|key| format!("customer-{key}")),
                    })
                    .await
                    .map_err(|e| self.provider_error(e))
            }
        }
    }

    /// Validation problems come back as `success: false`; the provider is only
    /// called for requests that pass every check.
    pub async fn create_payment_intent(
        &self,
        caller: Option<&Caller>,
        request: CreatePaymentIntentRequest,
    ) -> CreatePaymentIntentResponse {
        let amount = match parse_amount(&request.amount) {
            Ok(amount) => amount,
            Err(error) => return CreatePaymentIntentResponse::rejected(error),
        };
        let currency = request.currency.trim().to_ascii_lowercase();
        if currency.is_empty() {
            return CreatePaymentIntentResponse::rejected("currency is required");
        }
        if !self.config.supports_currency(&currency) {
            return CreatePaymentIntentResponse::rejected(format!(
                "currency '{}' is not supported",
                currency
            ));
        }
        let campaign_id = request.campaign_id.trim().to_string();
        if campaign_id.is_empty() {
            return CreatePaymentIntentResponse::rejected("campaignId is required");
        }
        let data = request.donation_data.unwrap_or_default();
        if let Err(err) = data.validate() {
            return CreatePaymentIntentResponse::rejected(err.to_string());
        }

        let campaign = match self.store.get_campaign(&campaign_id).await {
            Ok(Some(campaign)) => campaign,
            Ok(None) => {
                return CreatePaymentIntentResponse::rejected(format!(
                    "campaign '{}' not found",
                    campaign_id
                ))
            }
            Err(err) => {
                tracing::error!(campaign_id = %campaign_id, error = %err, "campaign lookup failed");
                return CreatePaymentIntentResponse::rejected("could not load campaign");
            }
        };
        if !campaign.is_active {
            return CreatePaymentIntentResponse::rejected(format!(
                "campaign '{}' is not accepting donations",
                campaign_id
            ));
        }

        let customer_id = if data.is_recurring {
            let key = request
                .idempotency_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty());
            match self.recurring_customer(caller, &data, key).await {
                Ok(customer_id) => Some(customer_id),
                Err(err) => {
                    tracing::warn!(campaign_id = %campaign_id, error = %err, "customer setup failed");
                    return CreatePaymentIntentResponse::rejected(provider_message(&err));
                }
            }
        } else {
            None
        };

        let mut metadata = data.to_metadata(&campaign_id);
        if let Some(caller) = caller {
            metadata.insert("uid".to_string(), caller.uid.clone());
        }
        let intent_request = PaymentIntentRequest {
            amount,
            currency,
            customer_id,
            setup_future_usage: data.is_recurring,
            description: Some(format!("Donation to {}", campaign.title)),
            metadata,
            idempotency_key: request.idempotency_key.filter(|k| !k.trim().is_empty()),
        };

        match self.gateway.create_payment_intent(&intent_request).await {
            Ok(intent) => {
                tracing::info!(
                    payment_intent_id = %intent.id,
                    campaign_id = %campaign_id,
                    amount,
                    recurring = data.is_recurring,
                    "payment intent created"
                );
                CreatePaymentIntentResponse::created(intent)
            }
            Err(err) => {
                tracing::warn!(
                    campaign_id = %campaign_id,
                    code = err.code.as_deref().unwrap_or("<none>"),
                    error = %err.message,
                    "payment intent creation failed"
                );
                CreatePaymentIntentResponse::rejected(err.message)
            }
        }
    }

    pub async fn create_setup_intent(
        &self,
        caller: &Caller,
        body: SetupIntentBody,
    ) -> Result<SetupIntentReply, SwiftCauseError> {
        let interval = body
            .interval
            .as_deref()
            .filter(|i| !i.trim().is_empty())
            .map(RecurringInterval::parse)
            .transpose()?;

        let customer_id = self.customer_for(caller, None).await?;
        let mut metadata = BTreeMap::new();
        metadata.insert("uid".to_string(), caller.uid.clone());
        if let Some(campaign_id) = body.campaign_id.filter(|c| !c.trim().is_empty()) {
            metadata.insert("campaignId".to_string(), campaign_id);
        }
        if let Some(interval) = interval {
            metadata.insert("interval".to_string(), interval.as_str().to_string());
        }

        let intent = self
            .gateway
            .create_setup_intent(&SetupIntentRequest {
                customer_id: customer_id.clone(),
                metadata,
            })
            .await
            .map_err(|e| self.provider_error(e))?;
        tracing::info!(uid = %caller.uid, setup_intent_id = %intent.id, "setup intent created");
        Ok(SetupIntentReply {
            client_secret: intent.client_secret,
            customer_id,
        })
    }

    pub async fn update_payment_method(
        &self,
        caller: &Caller,
        body: UpdatePaymentMethodBody,
    ) -> Result<SuccessReply, SwiftCauseError> {
        if body.subscription_id.trim().is_empty() {
            return Err(SwiftCauseError::validation("subscriptionId is required"));
        }
        if body.payment_method_id.trim().is_empty() {
            return Err(SwiftCauseError::validation("paymentMethodId is required"));
        }
        self.gateway
            .update_subscription_payment_method(&body.subscription_id, &body.payment_method_id)
            .await
            .map_err(|e| self.provider_error(e))?;
        tracing::info!(
            uid = %caller.uid,
            subscription_id = %body.subscription_id,
            "subscription payment method updated"
        );
        Ok(SuccessReply { success: true })
    }

    pub async fn create_onboarding_link(
        &self,
        caller: &Caller,
        body: OrganizationBody,
    ) -> Result<OnboardingLinkReply, SwiftCauseError> {
        ensure_org_member(caller, &body.org_id)?;
        let organization = self
            .store
            .get_organization(&body.org_id)
            .await?
            .ok_or_else(|| SwiftCauseError::not_found(format!("organization '{}'", body.org_id)))?;

        let account_id = match organization
            .stripe
            .map(|s| s.account_id)
            .filter(|id| !id.is_empty())
        {
            Some(account_id) => account_id,
            None => {
                let mut metadata = BTreeMap::new();
                metadata.insert("organizationId".to_string(), body.org_id.clone());
                let account_id = self
                    .gateway
                    .create_connected_account(caller.email.as_deref(), &metadata)
                    .await
                    .map_err(|e| self.provider_error(e))?;
                self.store
                    .update_stripe_account(
                        &body.org_id,
                        &StripeAccountState {
                            account_id: account_id.clone(),
                            ..StripeAccountState::default()
                        },
                    )
                    .await?;
                tracing::info!(org_id = %body.org_id, account_id = %account_id, "connected account created");
                account_id
            }
        };

        let link = self
            .gateway
            .create_account_link(&AccountLinkRequest {
                account_id,
                refresh_url: self.config.onboarding_refresh_url.clone(),
                return_url: self.config.onboarding_return_url.clone(),
            })
            .await
            .map_err(|e| self.provider_error(e))?;
        Ok(OnboardingLinkReply { url: link.url })
    }

    pub async fn update_account_status(
        &self,
        caller: &Caller,
        body: OrganizationBody,
    ) -> Result<AccountStatusReply, SwiftCauseError> {
        ensure_org_member(caller, &body.org_id)?;
        let organization = self
            .store
            .get_organization(&body.org_id)
            .await?
            .ok_or_else(|| SwiftCauseError::not_found(format!("organization '{}'", body.org_id)))?;
        let account_id = organization
            .stripe
            .map(|s| s.account_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                SwiftCauseError::validation(format!(
                    "organization '{}' has no connected account",
                    body.org_id
                ))
            })?;

        let state = self
            .gateway
            .retrieve_account(&account_id)
            .await
            .map_err(|e| self.provider_error(e))?;
        self.store.update_stripe_account(&body.org_id, &state).await?;
        Ok(AccountStatusReply {
            success: true,
            charges_enabled: state.charges_enabled,
            payouts_enabled: state.payouts_enabled,
            details_submitted: state.details_submitted,
        })
    }

    pub async fn connection_token(
        &self,
        caller: Option<&Caller>,
    ) -> Result<ConnectionTokenReply, SwiftCauseError> {
        if self.config.require_auth_for_connection_token && caller.is_none() {
            return Err(SwiftCauseError::Unauthorized(
                "connection tokens require a bearer identity".to_string(),
            ));
        }
        let secret = self
            .gateway
            .create_connection_token()
            .await
            .map_err(|e| self.provider_error(e))?;
        Ok(ConnectionTokenReply { secret })
    }

    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookReply, SwiftCauseError> {
        self.handle_webhook_at(payload, signature, Utc::now()).await
    }

    /// Signature verification happens before the payload is even parsed.
    pub async fn handle_webhook_at(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookReply, SwiftCauseError> {
        if let Err(err) = self.verifier.verify(payload, signature, now) {
            tracing::warn!(error = %err, "webhook rejected");
            return Err(err);
        }

        let event: ProviderEvent = serde_json::from_slice(payload)
            .map_err(|e| SwiftCauseError::validation(format!("malformed webhook event: {e}")))?;
        tracing::debug!(event_id = %event.id, event_type = %event.event_type, "webhook verified");

        let object = event.data.object;
        let handled = match event.event_type.as_str() {
            "payment_intent.succeeded" => self.on_payment_succeeded(decode(object)?).await?,
            "payment_intent.payment_failed" => {
                let intent: PaymentIntentObject = decode(object)?;
                let error = intent.last_payment_error.as_ref();
                tracing::warn!(
                    payment_intent_id = %intent.id,
                    decline_code = error.and_then(|e| e.decline_code.as_deref()).unwrap_or("<none>"),
                    error = error.and_then(|e| e.message.as_deref()).unwrap_or("<none>"),
                    "payment failed; no donation recorded"
                );
                true
            }
            "invoice.payment_succeeded" => self.on_invoice_paid(decode(object)?).await?,
            "account.updated" => self.on_account_updated(decode(object)?).await?,
            other => {
                tracing::debug!(event_type = other, "webhook event ignored");
                false
            }
        };

        Ok(WebhookReply {
            received: true,
            event_type: event.event_type,
            handled,
        })
    }

    async fn on_payment_succeeded(
        &self,
        intent: PaymentIntentObject,
    ) -> Result<bool, SwiftCauseError> {
        let (campaign_id, data) = match DonationData::from_metadata(&intent.metadata) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(
                    payment_intent_id = %intent.id,
                    error = %err,
                    "payment intent carries no donation metadata"
                );
                return Ok(false);
            }
        };

        let donation = Donation::from_provider(
            intent.id.clone(),
            campaign_id.clone(),
            intent.amount,
            intent.currency.clone(),
            &data,
            event_time(intent.created),
        )?;
        self.recorder.record(donation).await?;

        if let Some(interval) = data.recurring_interval.filter(|_| data.is_recurring) {
            self.start_subscription(&intent, &campaign_id, interval).await;
        }
        Ok(true)
    }

    /// The initial charge covers the first period; billing starts one period later.
    async fn start_subscription(
        &self,
        intent: &PaymentIntentObject,
        campaign_id: &str,
        interval: RecurringInterval,
    ) {
        let (Some(customer_id), Some(payment_method_id)) =
            (object_id(&intent.customer), object_id(&intent.payment_method))
        else {
            tracing::warn!(
                payment_intent_id = %intent.id,
                "recurring payment has no customer or payment method; subscription not created"
            );
            return;
        };

        let title = match self.store.get_campaign(campaign_id).await {
            Ok(Some(campaign)) => campaign.title,
            _ => crate::notify::FALLBACK_CAMPAIGN_TITLE.to_string(),
        };
        let mut metadata = intent.metadata.clone();
        metadata.insert("initialTransactionId".to_string(), intent.id.clone());

        let request = SubscriptionRequest {
            customer_id,
            payment_method_id: Some(payment_method_id),
            amount: intent.amount,
            currency: intent.currency.to_ascii_lowercase(),
            interval,
            product_name: format!("{} ({} donation)", title, interval.as_str()),
            first_charge_at: Utc::now().checked_add_months(Months::new(interval.months())),
            metadata,
            idempotency_key: Some(format!("subscription-{}", intent.id)),
        };
        match self.gateway.create_subscription(&request).await {
            Ok(subscription) => tracing::info!(
                payment_intent_id = %intent.id,
                subscription_id = %subscription.id,
                interval = interval.as_str(),
                "recurring donation subscription created"
            ),
            Err(err) => tracing::error!(
                payment_intent_id = %intent.id,
                error = %err.message,
                "subscription creation failed; initial donation is still recorded"
            ),
        }
    }

    async fn on_invoice_paid(&self, invoice: InvoiceObject) -> Result<bool, SwiftCauseError> {
        if invoice.billing_reason.as_deref() == Some("subscription_create") || invoice.amount_paid == 0 {
            return Ok(false);
        }
        let metadata = invoice
            .subscription_details
            .map(|d| d.metadata)
            .filter(|m| !m.is_empty())
            .unwrap_or(invoice.metadata);
        let (campaign_id, data) = match DonationData::from_metadata(&metadata) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(invoice_id = %invoice.id, error = %err, "invoice carries no donation metadata");
                return Ok(false);
            }
        };

        let transaction_id = object_id(&invoice.payment_intent).unwrap_or_else(|| invoice.id.clone());
        let donation = Donation::from_provider(
            transaction_id,
            campaign_id,
            invoice.amount_paid,
            invoice.currency,
            &data,
            event_time(invoice.created),
        )?;
        tracing::debug!(
            invoice_id = %invoice.id,
            subscription_id = object_id(&invoice.subscription).as_deref().unwrap_or("<none>"),
            "recording subscription cycle"
        );
        self.recorder.record(donation).await?;
        Ok(true)
    }

    async fn on_account_updated(&self, account: AccountObject) -> Result<bool, SwiftCauseError> {
        let Some(organization) = self.store.find_organization_by_account(&account.id).await? else {
            tracing::warn!(account_id = %account.id, "account update for unknown organization");
            return Ok(false);
        };
        self.store
            .update_stripe_account(
                &organization.id,
                &StripeAccountState {
                    account_id: account.id,
                    charges_enabled: account.charges_enabled,
                    payouts_enabled: account.payouts_enabled,
                    details_submitted: account.details_submitted,
                },
            )
            .await?;
        Ok(true)
    }
}

fn decode<T: serde::de::DeserializeOwned>(object: serde_json::Value) -> Result<T, SwiftCauseError> {
    serde_json::from_value(object)
        .map_err(|e| SwiftCauseError::validation(format!("malformed webhook object: {e}")))
}

fn provider_message(err: &SwiftCauseError) -> String {
    match err {
        SwiftCauseError::Provider { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// In-process [`IntentBackend`] bound to one caller identity.
#[derive(Clone)]
pub struct LocalIntentBackend {
    backend: Arc<DonationBackend>,
    caller: Option<Caller>,
}

impl LocalIntentBackend {
    pub fn new(backend: Arc<DonationBackend>, caller: Option<Caller>) -> Self {
        Self { backend, caller }
    }
}

#[async_trait]
impl IntentBackend for LocalIntentBackend {
    async fn request_payment_intent(
        &self,
        request: CreatePaymentIntentRequest,
    ) -> CreatePaymentIntentResponse {
        self.backend
            .create_payment_intent(self.caller.as_ref(), request)
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::gateway::{
        AccountLink, AccountLinkRequest, CustomerRequest, PaymentGateway, PaymentIntent,
        PaymentIntentRequest, ProviderError, SetupIntent, SetupIntentRequest, Subscription,
        SubscriptionRequest,
    };
    use crate::types::StripeAccountState;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records every provider call by name.
    #[derive(Default)]
    pub struct RecordingGateway {
        pub calls: Mutex<Vec<String>>,
        pub intents: Mutex<Vec<PaymentIntentRequest>>,
        pub subscriptions: Mutex<Vec<SubscriptionRequest>>,
        pub customers: Mutex<Vec<CustomerRequest>>,
    }

    impl RecordingGateway {
        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn note(&self, name: &str) -> usize {
            let mut calls = self.calls.lock().unwrap();
            calls.push(name.to_string());
            calls.len()
        }
    }

    #[async_trait]
    impl PaymentGateway for RecordingGateway {
        fn provider(&self) -> &'static str {
            "recording"
        }

        async fn create_customer(&self, request: &CustomerRequest) -> Result<String, ProviderError> {
            let n = self.note("create_customer");
            self.customers.lock().unwrap().push(request.clone());
            Ok(format!("cus_{n}"))
        }

        async fn create_payment_intent(
            &self,
            request: &PaymentIntentRequest,
        ) -> Result<PaymentIntent, ProviderError> {
            let n = self.note("create_payment_intent");
            self.intents.lock().unwrap().push(request.clone());
            Ok(PaymentIntent {
                id: format!("pi_{n}"),
                client_secret: format!("pi_{n}_secret_test"),
                status: "requires_payment_method".to_string(),
            })
        }

        async fn create_setup_intent(
            &self,
            _request: &SetupIntentRequest,
        ) -> Result<SetupIntent, ProviderError> {
            let n = self.note("create_setup_intent");
            Ok(SetupIntent {
                id: format!("seti_{n}"),
                client_secret: format!("seti_{n}_secret_test"),
            })
        }

        async fn create_subscription(
            &self,
            request: &SubscriptionRequest,
        ) -> Result<Subscription, ProviderError> {
            let n = self.note("create_subscription");
            self.subscriptions.lock().unwrap().push(request.clone());
            Ok(Subscription {
                id: format!("sub_{n}"),
                status: "trialing".to_string(),
            })
        }

        async fn update_subscription_payment_method(
            &self,
            _subscription_id: &str,
            _payment_method_id: &str,
        ) -> Result<(), ProviderError> {
            self.note("update_subscription_payment_method");
            Ok(())
        }

        async fn create_connected_account(
            &self,
            _email: Option<&str>,
            _metadata: &BTreeMap<String, String>,
        ) -> Result<String, ProviderError> {
            Ok(format!("acct_{}", self.note("create_connected_account")))
        }

        async fn create_account_link(
            &self,
            request: &AccountLinkRequest,
        ) -> Result<AccountLink, ProviderError> {
            self.note("create_account_link");
            Ok(AccountLink {
                url: format!("https://connect.example/setup/{}", request.account_id),
                expires_at: None,
            })
        }

        async fn retrieve_account(
            &self,
            account_id: &str,
        ) -> Result<StripeAccountState, ProviderError> {
            self.note("retrieve_account");
            Ok(StripeAccountState {
                account_id: account_id.to_string(),
                charges_enabled: true,
                payouts_enabled: true,
                details_submitted: true,
            })
        }

        async fn create_connection_token(&self) -> Result<String, ProviderError> {
            Ok(format!("pst_{}", self.note("create_connection_token")))
        }
    }
}
