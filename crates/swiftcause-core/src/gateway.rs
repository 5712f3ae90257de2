use crate::error::SwiftCauseError;
use crate::types::{DonationData, RecurringInterval, StripeAccountState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Failure reported by the payment provider or the transport in front of it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    pub code: Option<String>,
    pub decline_code: Option<String>,
    pub message: String,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            decline_code: None,
            message: message.into(),
        }
    }

    pub fn declined(message: impl Into<String>, decline_code: impl Into<String>) -> Self {
        Self {
            code: Some("card_declined".to_string()),
            decline_code: Some(decline_code.into()),
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn into_error(self, provider: &str) -> SwiftCauseError {
        SwiftCauseError::Provider {
            provider: provider.to_string(),
            message: self.message,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerRequest {
    pub email: Option<String>,
    pub name: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentRequest {
    pub amount: u64,
    pub currency: String,
    pub customer_id: Option<String>,
    /// Ask the provider to keep the payment method for later off-session charges.
    pub setup_future_usage: bool,
    pub description: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupIntentRequest {
    pub customer_id: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub customer_id: String,
    pub payment_method_id: Option<String>,
    pub amount: u64,
    pub currency: String,
    pub interval: RecurringInterval,
    pub product_name: String,
    /// First recurring charge happens at this instant; the initial payment covers the
    /// current period.
    pub first_charge_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLinkRequest {
    pub account_id: String,
    pub refresh_url: String,
    pub return_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLink {
    pub url: String,
    pub expires_at: Option<i64>,
}

/// Server-side payment provider operations (secret-key scope).
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn create_customer(&self, request: &CustomerRequest) -> Result<String, ProviderError>;

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<PaymentIntent, ProviderError>;

    async fn create_setup_intent(
        &self,
        request: &SetupIntentRequest,
    ) -> Result<SetupIntent, ProviderError>;

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<Subscription, ProviderError>;

    async fn update_subscription_payment_method(
        &self,
        subscription_id: &str,
        payment_method_id: &str,
    ) -> Result<(), ProviderError>;

    async fn create_connected_account(
        &self,
        email: Option<&str>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, ProviderError>;

    async fn create_account_link(
        &self,
        request: &AccountLinkRequest,
    ) -> Result<AccountLink, ProviderError>;

    async fn retrieve_account(&self, account_id: &str)
        -> Result<StripeAccountState, ProviderError>;

    async fn create_connection_token(&self) -> Result<String, ProviderError>;
}

/// Tokenized payment method collected by the provider's card element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethodInput {
    pub payment_method_id: String,
}

impl PaymentMethodInput {
    pub fn new(payment_method_id: impl Into<String>) -> Self {
        Self {
            payment_method_id: payment_method_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedPayment {
    pub payment_intent_id: String,
    pub status: String,
}

impl ConfirmedPayment {
    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }
}

/// Client-side confirmation (publishable-key scope).
#[async_trait]
pub trait PaymentConfirmer: Send + Sync {
    async fn confirm_payment(
        &self,
        client_secret: &str,
        payment_method: &PaymentMethodInput,
    ) -> Result<ConfirmedPayment, ProviderError>;
}

/// Body of the create-payment-intent call.
///
/// `amount` stays an untyped JSON value so strings, fractions, and negatives can be
/// answered with `success: false` instead of a deserialization rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntentRequest {
    #[serde(default)]
    pub amount: serde_json::Value,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub campaign_id: String,
    #[serde(default)]
    pub donation_data: Option<DonationData>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntentResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CreatePaymentIntentResponse {
    pub fn created(intent: PaymentIntent) -> Self {
        Self {
            success: true,
            client_secret: Some(intent.client_secret),
            payment_intent_id: Some(intent.id),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            client_secret: None,
            payment_intent_id: None,
            error: Some(error.into()),
        }
    }
}

/// Trusted endpoint that mints client secrets. Pricing never happens client-side.
#[async_trait]
pub trait IntentBackend: Send + Sync {
    async fn request_payment_intent(
        &self,
        request: CreatePaymentIntentRequest,
    ) -> CreatePaymentIntentResponse;
}

/// Payment intent ids are the prefix of the client secret (`pi_x_secret_y`).
pub fn payment_intent_id_from_client_secret(client_secret: &str) -> Option<&str> {
    client_secret
        .split_once("_secret_")
        .map(|(id, _)| id)
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_id_is_extracted_from_client_secret() {
        assert_eq!(
            payment_intent_id_from_client_secret("pi_123_secret_abc"),
            Some("pi_123")
        );
        assert_eq!(payment_intent_id_from_client_secret("garbage"), None);
        assert_eq!(payment_intent_id_from_client_secret("_secret_x"), None);
    }

    #[test]
    fn response_omits_absent_fields() {
        let json = serde_json::to_value(CreatePaymentIntentResponse::rejected("bad amount")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "success": false, "error": "bad amount" })
        );
    }

    #[test]
    fn request_tolerates_missing_fields() {
        let request: CreatePaymentIntentRequest = serde_json::from_str("{}").unwrap();
        assert!(request.amount.is_null());
        assert!(request.campaign_id.is_empty());
    }
}
