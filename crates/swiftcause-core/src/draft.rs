use crate::error::SwiftCauseError;
use crate::types::{DonationDraft, DonorDetails, GiftAidDetails, RecurringInterval};
use chrono::Utc;
use uuid::Uuid;

/// Assembles user input into an immutable [`DonationDraft`].
///
/// The builder accepts raw values as the kiosk collects them and performs all
/// validation in [`DonationDraftBuilder::build`].
#[derive(Debug, Clone)]
pub struct DonationDraftBuilder {
    campaign_id: String,
    currency: String,
    amount: Option<i64>,
    amount_error: Option<String>,
    recurring: bool,
    interval: Option<String>,
    donor: DonorDetails,
    is_anonymous: bool,
    gift_aid: Option<GiftAidDetails>,
    kiosk_id: Option<String>,
    organization_id: Option<String>,
}

impl DonationDraftBuilder {
    pub fn new(campaign_id: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            currency: currency.into(),
            amount: None,
            amount_error: None,
            recurring: false,
            interval: None,
            donor: DonorDetails::default(),
            is_anonymous: false,
            gift_aid: None,
            kiosk_id: None,
            organization_id: None,
        }
    }

    /// Amount in minor currency units (pence, cents).
    pub fn amount_minor(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self.amount_error = None;
        self
    }

    /// Amount in major units as typed on the keypad, rounded to the nearest minor unit.
    pub fn amount_major(mut self, amount: f64) -> Self {
        if !amount.is_finite() {
            self.amount = None;
            self.amount_error = Some("amount must be a finite number".to_string());
            return self;
        }
        let minor = (amount * 100.0).round();
        if minor > i64::MAX as f64 {
            self.amount = None;
            self.amount_error = Some("amount is too large".to_string());
            return self;
        }
        self.amount = Some(minor as i64);
        self.amount_error = None;
        self
    }

    pub fn one_time(mut self) -> Self {
        self.recurring = false;
        self
    }

    pub fn recurring(mut self, interval: RecurringInterval) -> Self {
        self.recurring = true;
        self.interval = Some(interval.as_str().to_string());
        self
    }

    /// Recurrence exactly as the form submitted it.
    pub fn recurrence_input(mut self, is_recurring: bool, interval: Option<String>) -> Self {
        self.recurring = is_recurring;
        self.interval = interval;
        self
    }

    pub fn donor(mut self, donor: DonorDetails) -> Self {
        self.donor = donor;
        self
    }

    pub fn donor_email(mut self, email: impl Into<String>) -> Self {
        self.donor.email = Some(email.into());
        self
    }

    pub fn donor_name(mut self, name: impl Into<String>) -> Self {
        self.donor.name = Some(name.into());
        self
    }

    pub fn anonymous(mut self, is_anonymous: bool) -> Self {
        self.is_anonymous = is_anonymous;
        self
    }

    pub fn gift_aid(mut self, details: GiftAidDetails) -> Self {
        self.gift_aid = Some(details);
        self
    }

    pub fn kiosk(mut self, kiosk_id: impl Into<String>) -> Self {
        self.kiosk_id = Some(kiosk_id.into());
        self
    }

    pub fn organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn campaign_id(&self) -> &str {
        &self.campaign_id
    }

    pub fn build(self) -> Result<DonationDraft, SwiftCauseError> {
        if self.campaign_id.trim().is_empty() {
            return Err(SwiftCauseError::validation("campaignId is required"));
        }

        let currency = self.currency.trim().to_ascii_lowercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(SwiftCauseError::validation(format!(
                "currency '{}' is not an ISO 4217 code",
                self.currency
            )));
        }

        if let Some(message) = self.amount_error {
            return Err(SwiftCauseError::Validation(message));
        }
        let amount = match self.amount {
            Some(amount) if amount > 0 => amount as u64,
            Some(_) => return Err(SwiftCauseError::validation("amount must be positive")),
            None => return Err(SwiftCauseError::validation("amount is required")),
        };

        let recurrence = if self.recurring {
            let raw = self.interval.as_deref().ok_or_else(|| {
                SwiftCauseError::validation("recurring donations require an interval")
            })?;
            Some(RecurringInterval::parse(raw)?)
        } else {
            // A one-time draft never keeps whatever interval the form left behind.
            None
        };

        if let Some(details) = &self.gift_aid {
            validate_gift_aid(details)?;
        }

        let donor = DonorDetails {
            email: normalize(self.donor.email),
            name: normalize(self.donor.name),
            phone: normalize(self.donor.phone),
            message: normalize(self.donor.message),
        };

        Ok(DonationDraft {
            draft_id: Uuid::new_v4().to_string(),
            campaign_id: self.campaign_id,
            amount,
            currency,
            donor,
            is_anonymous: self.is_anonymous,
            recurrence,
            gift_aid: self.gift_aid,
            kiosk_id: self.kiosk_id,
            organization_id: self.organization_id,
            created_at: Utc::now(),
        })
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn validate_gift_aid(details: &GiftAidDetails) -> Result<(), SwiftCauseError> {
    let required = [
        ("firstName", &details.first_name),
        ("surname", &details.surname),
        ("houseNameOrNumber", &details.house_name_or_number),
        ("postcode", &details.postcode),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(SwiftCauseError::validation(format!(
                "gift aid declaration requires {}",
                field
            )));
        }
    }
    if !details.uk_taxpayer {
        return Err(SwiftCauseError::validation(
            "gift aid requires the donor to confirm they are a UK taxpayer",
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_gift_aid() -> GiftAidDetails {
    GiftAidDetails {
        first_name: "Ada".to_string(),
        surname: "Lovelace".to_string(),
        house_name_or_number: "12".to_string(),
        address_line: Some("St James's Square".to_string()),
        postcode: "SW1Y 4JH".to_string(),
        uk_taxpayer: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fifty_pound_one_time_draft() {
        let draft = DonationDraftBuilder::new("camp-1", "GBP")
            .amount_major(50.0)
            .one_time()
            .build()
            .unwrap();

        assert_eq!(draft.amount(), 5_000);
        assert_eq!(draft.currency(), "gbp");
        assert!(!draft.is_recurring());
        assert!(!draft.is_gift_aid());
    }

    #[test]
    fn rejects_non_positive_and_non_finite_amounts() {
        for builder in [
            DonationDraftBuilder::new("c", "gbp").amount_minor(0),
            DonationDraftBuilder::new("c", "gbp").amount_minor(-5),
            DonationDraftBuilder::new("c", "gbp").amount_major(f64::NAN),
            DonationDraftBuilder::new("c", "gbp").amount_major(0.004),
            DonationDraftBuilder::new("c", "gbp"),
        ] {
            assert!(matches!(builder.build(), Err(SwiftCauseError::Validation(_))));
        }
    }

    #[test]
    fn recurring_without_interval_is_rejected() {
        let err = DonationDraftBuilder::new("c", "usd")
            .amount_minor(10_000)
            .recurrence_input(true, None)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("require an interval"));

        let err = DonationDraftBuilder::new("c", "usd")
            .amount_minor(10_000)
            .recurrence_input(true, Some("fortnightly".to_string()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("invalid recurring interval"));
    }

    #[test]
    fn gift_aid_requires_taxpayer_confirmation() {
        let mut details = sample_gift_aid();
        details.uk_taxpayer = false;
        let err = DonationDraftBuilder::new("c", "gbp")
            .amount_minor(1_000)
            .gift_aid(details)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("UK taxpayer"));

        let mut details = sample_gift_aid();
        details.postcode = "  ".to_string();
        assert!(DonationDraftBuilder::new("c", "gbp")
            .amount_minor(1_000)
            .gift_aid(details)
            .build()
            .is_err());
    }

    #[test]
    fn blank_donor_fields_are_dropped() {
        let draft = DonationDraftBuilder::new("c", "gbp")
            .amount_minor(1_000)
            .donor_email("   ")
            .donor_name(" Grace ")
            .build()
            .unwrap();
        assert_eq!(draft.donor().email, None);
        assert_eq!(draft.donor().name.as_deref(), Some("Grace"));
    }

    proptest! {
        #[test]
        fn one_time_drafts_never_carry_an_interval(
            amount in 1_i64..10_000_000,
            interval in proptest::option::of("[a-z]{0,10}"),
        ) {
            let draft = DonationDraftBuilder::new("camp", "gbp")
                .amount_minor(amount)
                .recurrence_input(false, interval)
                .build()
                .unwrap();
            prop_assert!(draft.recurrence().is_none());
            prop_assert!(draft.donation_data().recurring_interval.is_none());
        }

        #[test]
        fn recurring_drafts_always_carry_an_allowed_interval(
            amount in 1_i64..10_000_000,
            interval in "[a-zA-Z]{0,10}",
        ) {
            let result = DonationDraftBuilder::new("camp", "gbp")
                .amount_minor(amount)
                .recurrence_input(true, Some(interval))
                .build();
            if let Ok(draft) = result {
                let recurrence = draft.recurrence();
                prop_assert!(recurrence.is_some());
                prop_assert!(RecurringInterval::ALL.contains(&recurrence.unwrap()));
            }
        }

        #[test]
        fn built_amounts_are_positive(amount in i64::MIN..i64::MAX) {
            let result = DonationDraftBuilder::new("camp", "gbp").amount_minor(amount).build();
            match result {
                Ok(draft) => prop_assert!(draft.amount() > 0),
                Err(_) => prop_assert!(amount <= 0),
            }
        }
    }
}
