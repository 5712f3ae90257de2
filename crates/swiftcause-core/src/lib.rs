//! SwiftCause donation engine core.
//!
//! Kiosk and admin sessions drive a staged donation flow: a validated draft is
//! confirmed through the payment provider, successful payments are recorded once
//! per transaction, and side effects (Gift Aid declarations, receipts) go through
//! a durable outbox. Provider webhooks are verified before anything is written.

#![deny(unsafe_code)]

pub mod backend;
pub mod campaign;
pub mod checkout;
pub mod draft;
pub mod error;
pub mod events;
pub mod flow;
pub mod gateway;
pub mod giftaid;
pub mod notify;
pub mod orchestrator;
pub mod outbox;
pub mod policy;
pub mod recorder;
pub mod resolver;
pub mod session;
pub mod store;
pub mod types;
pub mod webhook;

pub use backend::{
    AccountStatusReply, BackendConfig, ConnectionTokenReply, DonationBackend, LocalIntentBackend,
    OnboardingLinkReply, OrganizationBody, SetupIntentBody, SetupIntentReply, SuccessReply,
    UpdatePaymentMethodBody, WebhookReply,
};
pub use campaign::{CampaignLookup, CampaignSummary};
pub use checkout::{CheckoutServices, DonationCheckout};
pub use draft::DonationDraftBuilder;
pub use error::SwiftCauseError;
pub use events::{DonationEvent, EventBus};
pub use flow::{DonationFlow, DonationStage};
pub use gateway::{
    ConfirmedPayment, CreatePaymentIntentRequest, CreatePaymentIntentResponse, IntentBackend,
    PaymentConfirmer, PaymentGateway, PaymentMethodInput, ProviderError,
};
pub use giftaid::GiftAidRecorder;
pub use notify::{MailSettings, SideEffectDispatcher};
pub use orchestrator::PaymentOrchestrator;
pub use outbox::{DrainReport, Outbox, OutboxDispatcher, OutboxTask, RetryPolicy};
pub use policy::{AccessPolicy, Action, Resource};
pub use recorder::DonationRecorder;
pub use resolver::{Outcome, OutcomeAction};
pub use session::{Caller, Role, Session, SessionStore};
pub use store::{DonationStore, InMemoryStore, RecordOutcome, StoreConfig};
pub use types::{
    Campaign, Donation, DonationData, DonationDraft, DonorDetails, GiftAidDeclaration,
    GiftAidDetails, MailContent, MailMessage, Organization, PaymentResult, PaymentStatus,
    RecurringInterval, StripeAccountState, UserRecord,
};
pub use webhook::WebhookVerifier;
