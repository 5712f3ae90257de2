use crate::error::SwiftCauseError;
use crate::session::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Billing cadence for recurring donations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RecurringInterval {
    Monthly,
    Quarterly,
    Yearly,
}

impl RecurringInterval {
    pub const ALL: [RecurringInterval; 3] = [Self::Monthly, Self::Quarterly, Self::Yearly];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SwiftCauseError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "yearly" => Ok(Self::Yearly),
            other => Err(SwiftCauseError::validation(format!(
                "invalid recurring interval '{}'; expected one of: monthly, quarterly, yearly",
                other
            ))),
        }
    }

    /// Provider billing cadence as `(interval unit, interval count)`.
    pub fn billing_cadence(self) -> (&'static str, u32) {
        match self {
            Self::Monthly => ("month", 1),
            Self::Quarterly => ("month", 3),
            Self::Yearly => ("year", 1),
        }
    }

    pub fn months(self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::Yearly => 12,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

/// Optional donor contact fields entered at the kiosk or on the web.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DonorDetails {
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub message: Option<String>,
}

/// Donor identity required for a UK Gift Aid declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GiftAidDetails {
    pub first_name: String,
    pub surname: String,
    pub house_name_or_number: String,
    pub address_line: Option<String>,
    pub postcode: String,
    /// Donor confirmed they pay enough UK income or capital gains tax.
    pub uk_taxpayer: bool,
}

impl GiftAidDetails {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.surname.trim())
    }
}

/// Unpersisted, session-scoped donation-in-progress.
///
/// Only `DonationDraftBuilder` constructs drafts, so every draft satisfies the
/// amount and recurrence invariants. Recurrence is an `Option` so an interval
/// cannot exist without the recurring flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DonationDraft {
    pub(crate) draft_id: String,
    pub(crate) campaign_id: String,
    pub(crate) amount: u64,
    pub(crate) currency: String,
    pub(crate) donor: DonorDetails,
    pub(crate) is_anonymous: bool,
    pub(crate) recurrence: Option<RecurringInterval>,
    pub(crate) gift_aid: Option<GiftAidDetails>,
    pub(crate) kiosk_id: Option<String>,
    pub(crate) organization_id: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
}

impl DonationDraft {
    pub fn draft_id(&self) -> &str {
        &self.draft_id
    }

    pub fn campaign_id(&self) -> &str {
        &self.campaign_id
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn donor(&self) -> &DonorDetails {
        &self.donor
    }

    pub fn is_anonymous(&self) -> bool {
        self.is_anonymous
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    pub fn recurrence(&self) -> Option<RecurringInterval> {
        self.recurrence
    }

    pub fn is_gift_aid(&self) -> bool {
        self.gift_aid.is_some()
    }

    pub fn gift_aid(&self) -> Option<&GiftAidDetails> {
        self.gift_aid.as_ref()
    }

    pub fn kiosk_id(&self) -> Option<&str> {
        self.kiosk_id.as_deref()
    }

    pub fn organization_id(&self) -> Option<&str> {
        self.organization_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn donation_data(&self) -> DonationData {
        DonationData {
            donor_email: self.donor.email.clone(),
            donor_name: self.donor.name.clone(),
            donor_phone: self.donor.phone.clone(),
            donor_message: self.donor.message.clone(),
            is_anonymous: self.is_anonymous,
            is_recurring: self.is_recurring(),
            recurring_interval: self.recurrence,
            is_gift_aid: self.is_gift_aid(),
            kiosk_id: self.kiosk_id.clone(),
            organization_id: self.organization_id.clone(),
        }
    }
}

/// Donation fields sent with an intent request and carried through provider metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DonationData {
    pub donor_email: Option<String>,
    pub donor_name: Option<String>,
    pub donor_phone: Option<String>,
    pub donor_message: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub is_recurring: bool,
    pub recurring_interval: Option<RecurringInterval>,
    #[serde(default)]
    pub is_gift_aid: bool,
    pub kiosk_id: Option<String>,
    pub organization_id: Option<String>,
}

impl DonationData {
    pub fn validate(&self) -> Result<(), SwiftCauseError> {
        match (self.is_recurring, self.recurring_interval) {
            (true, None) => Err(SwiftCauseError::validation(
                "recurring donations require a recurringInterval",
            )),
            (false, Some(_)) => Err(SwiftCauseError::validation(
                "recurringInterval is only allowed for recurring donations",
            )),
            _ => Ok(()),
        }
    }

    /// Flatten into provider metadata (string key/value pairs).
    pub fn to_metadata(&self, campaign_id: &str) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("campaignId".to_string(), campaign_id.to_string());
        let optional = [
            ("donorEmail", &self.donor_email),
            ("donorName", &self.donor_name),
            ("donorPhone", &self.donor_phone),
            ("donorMessage", &self.donor_message),
            ("kioskId", &self.kiosk_id),
            ("organizationId", &self.organization_id),
        ];
        for (key, value) in optional {
            if let Some(value) = value.as_ref().filter(|v| !v.trim().is_empty()) {
                metadata.insert(key.to_string(), value.clone());
            }
        }
        metadata.insert("isAnonymous".to_string(), self.is_anonymous.to_string());
        metadata.insert("isRecurring".to_string(), self.is_recurring.to_string());
        if let Some(interval) = self.recurring_interval {
            metadata.insert(
                "recurringInterval".to_string(),
                interval.as_str().to_string(),
            );
        }
        metadata.insert("isGiftAid".to_string(), self.is_gift_aid.to_string());
        metadata
    }

    /// Rebuild donation fields from provider metadata. Returns the campaign id as well.
    pub fn from_metadata(
        metadata: &BTreeMap<String, String>,
    ) -> Result<(String, DonationData), SwiftCauseError> {
        let campaign_id = metadata
            .get("campaignId")
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| SwiftCauseError::validation("metadata missing campaignId"))?;

        let flag = |key: &str| {
            metadata
                .get(key)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };

        let is_recurring = flag("isRecurring");
        let recurring_interval = if is_recurring {
            Some(RecurringInterval::parse(
                metadata
                    .get("recurringInterval")
                    .map(String::as_str)
                    .unwrap_or_default(),
            )?)
        } else {
            None
        };

        let data = DonationData {
            donor_email: metadata.get("donorEmail").cloned(),
            donor_name: metadata.get("donorName").cloned(),
            donor_phone: metadata.get("donorPhone").cloned(),
            donor_message: metadata.get("donorMessage").cloned(),
            is_anonymous: flag("isAnonymous"),
            is_recurring,
            recurring_interval,
            is_gift_aid: flag("isGiftAid"),
            kiosk_id: metadata.get("kioskId").cloned(),
            organization_id: metadata.get("organizationId").cloned(),
        };
        Ok((campaign_id, data))
    }
}

/// Durable record of one successful contribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub id: String,
    pub campaign_id: String,
    pub amount: u64,
    pub currency: String,
    pub donor_email: Option<String>,
    pub donor_name: Option<String>,
    pub donor_phone: Option<String>,
    pub donor_message: Option<String>,
    pub is_anonymous: bool,
    pub is_recurring: bool,
    pub recurring_interval: Option<RecurringInterval>,
    pub is_gift_aid: bool,
    pub kiosk_id: Option<String>,
    pub organization_id: Option<String>,
    pub transaction_id: String,
    pub payment_status: PaymentStatus,
    pub timestamp: DateTime<Utc>,
}

impl Donation {
    /// Materialize a donation from a draft once the provider confirmed payment.
    pub fn from_draft(draft: &DonationDraft, transaction_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            campaign_id: draft.campaign_id.clone(),
            amount: draft.amount,
            currency: draft.currency.clone(),
            donor_email: draft.donor.email.clone(),
            donor_name: draft.donor.name.clone(),
            donor_phone: draft.donor.phone.clone(),
            donor_message: draft.donor.message.clone(),
            is_anonymous: draft.is_anonymous,
            is_recurring: draft.is_recurring(),
            recurring_interval: draft.recurrence,
            is_gift_aid: draft.is_gift_aid(),
            kiosk_id: draft.kiosk_id.clone(),
            organization_id: draft.organization_id.clone(),
            transaction_id: transaction_id.into(),
            payment_status: PaymentStatus::Success,
            timestamp: Utc::now(),
        }
    }

    /// Materialize a donation from a verified provider event.
    pub fn from_provider(
        transaction_id: impl Into<String>,
        campaign_id: impl Into<String>,
        amount: u64,
        currency: impl Into<String>,
        data: &DonationData,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, SwiftCauseError> {
        if amount == 0 {
            return Err(SwiftCauseError::validation("donation amount must be positive"));
        }
        data.validate()?;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            amount,
            currency: currency.into().to_ascii_lowercase(),
            donor_email: data.donor_email.clone(),
            donor_name: data.donor_name.clone(),
            donor_phone: data.donor_phone.clone(),
            donor_message: data.donor_message.clone(),
            is_anonymous: data.is_anonymous,
            is_recurring: data.is_recurring,
            recurring_interval: data.recurring_interval,
            is_gift_aid: data.is_gift_aid,
            kiosk_id: data.kiosk_id.clone(),
            organization_id: data.organization_id.clone(),
            transaction_id: transaction_id.into(),
            payment_status: PaymentStatus::Success,
            timestamp,
        })
    }

    pub fn has_donor_email(&self) -> bool {
        self.donor_email
            .as_deref()
            .map(|email| !email.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Tax-relief declaration stored independently from the donation it references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GiftAidDeclaration {
    pub id: String,
    pub donor: GiftAidDetails,
    pub donation_amount: u64,
    /// Value the charity can reclaim, in the same minor units as `donation_amount`.
    pub gift_aid_amount: u64,
    pub currency: String,
    pub campaign_id: String,
    pub campaign_title: String,
    pub transaction_id: String,
    pub submitted_at: DateTime<Utc>,
}

impl GiftAidDeclaration {
    /// Basic-rate reclaim: 25p for every pound donated.
    pub fn reclaim_value(amount: u64) -> u64 {
        amount / 4
    }
}

/// Ephemeral outcome of one confirmation attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    pub success: bool,
    pub transaction_id: Option<String>,
    pub error: Option<String>,
    pub campaign_title: Option<String>,
}

impl PaymentResult {
    pub fn succeeded(transaction_id: impl Into<String>, campaign_title: Option<String>) -> Self {
        Self {
            success: true,
            transaction_id: Some(transaction_id.into()),
            error: None,
            campaign_title,
        }
    }

    pub fn failed(error: impl Into<String>, campaign_title: Option<String>) -> Self {
        Self {
            success: false,
            transaction_id: None,
            error: Some(error.into()),
            campaign_title,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub title: String,
    pub organization_id: Option<String>,
    pub currency: String,
    pub goal_amount: u64,
    #[serde(default)]
    pub collected_amount: u64,
    #[serde(default)]
    pub donation_count: u64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl Campaign {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        currency: impl Into<String>,
        goal_amount: u64,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            organization_id: None,
            currency: currency.into().to_ascii_lowercase(),
            goal_amount,
            collected_amount: 0,
            donation_count: 0,
            is_active: true,
        }
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }
}

/// Connected payout account state for an organization.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StripeAccountState {
    pub account_id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub stripe: Option<StripeAccountState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub email: Option<String>,
    pub organization_id: Option<String>,
    pub role: Option<Role>,
    pub stripe_customer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MailContent {
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Outbound email queue document, consumed by an external mail sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MailMessage {
    pub id: String,
    pub to: String,
    pub from: String,
    pub message: MailContent,
    pub donation_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recurring_interval_parse_is_case_insensitive() {
        assert_eq!(
            RecurringInterval::parse(" Monthly ").unwrap(),
            RecurringInterval::Monthly
        );
        assert!(RecurringInterval::parse("weekly").is_err());
        assert_eq!(RecurringInterval::Quarterly.billing_cadence(), ("month", 3));
    }

    #[test]
    fn metadata_restores_recurring_donation_fields() {
        let data = DonationData {
            donor_email: Some("ada@example.org".to_string()),
            is_recurring: true,
            recurring_interval: Some(RecurringInterval::Yearly),
            is_gift_aid: true,
            ..DonationData::default()
        };

        let metadata = data.to_metadata("camp-1");
        let (campaign_id, restored) = DonationData::from_metadata(&metadata).unwrap();
        assert_eq!(campaign_id, "camp-1");
        assert_eq!(restored.recurring_interval, Some(RecurringInterval::Yearly));
        assert!(restored.is_gift_aid);
        assert_eq!(restored.donor_email.as_deref(), Some("ada@example.org"));
    }

    #[test]
    fn metadata_ignores_interval_on_one_time_donation() {
        let mut metadata = BTreeMap::new();
        metadata.insert("campaignId".to_string(), "camp-1".to_string());
        metadata.insert("isRecurring".to_string(), "false".to_string());
        metadata.insert("recurringInterval".to_string(), "monthly".to_string());

        let (_, data) = DonationData::from_metadata(&metadata).unwrap();
        assert!(!data.is_recurring);
        assert_eq!(data.recurring_interval, None);
    }

    #[test]
    fn provider_donation_rejects_zero_amount_and_dangling_interval() {
        let data = DonationData::default();
        assert!(Donation::from_provider("pi_1", "camp", 0, "gbp", &data, Utc::now()).is_err());

        let dangling = DonationData {
            recurring_interval: Some(RecurringInterval::Monthly),
            ..DonationData::default()
        };
        assert!(
            Donation::from_provider("pi_1", "camp", 500, "gbp", &dangling, Utc::now()).is_err()
        );
    }

    #[test]
    fn gift_aid_reclaims_a_quarter() {
        assert_eq!(GiftAidDeclaration::reclaim_value(10_000), 2_500);
        assert_eq!(GiftAidDeclaration::reclaim_value(3), 0);
    }
}
