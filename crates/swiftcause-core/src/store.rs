use crate::error::SwiftCauseError;
use crate::types::{
    Campaign, Donation, GiftAidDeclaration, MailMessage, Organization, StripeAccountState,
    UserRecord,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistence backend selection.
#[derive(Debug, Clone, Default)]
pub enum StoreConfig {
    /// Process memory only. Everything is lost on restart.
    #[default]
    Memory,
    /// One JSONB document table in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }

    pub async fn open(self) -> Result<Arc<dyn DonationStore>, SwiftCauseError> {
        match self {
            Self::Memory => Ok(Arc::new(InMemoryStore::new())),
            Self::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                Ok(Arc::new(store))
            }
        }
    }
}

/// Result of an idempotent donation insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted(Donation),
    /// A donation with the same transaction id already existed; it is returned unchanged.
    Duplicate(Donation),
}

impl RecordOutcome {
    pub fn donation(&self) -> &Donation {
        match self {
            Self::Inserted(donation) | Self::Duplicate(donation) => donation,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Document persistence for donations and the records around them.
///
/// Implementations must make `record_donation` idempotent per transaction id and
/// apply the campaign increment exactly once, in the same unit of work as the insert.
#[async_trait]
pub trait DonationStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>, SwiftCauseError>;

    async fn upsert_campaign(&self, campaign: &Campaign) -> Result<(), SwiftCauseError>;

    async fn record_donation(&self, donation: &Donation) -> Result<RecordOutcome, SwiftCauseError>;

    async fn get_donation(&self, donation_id: &str) -> Result<Option<Donation>, SwiftCauseError>;

    async fn find_donation_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Donation>, SwiftCauseError>;

    async fn list_donations(&self, campaign_id: &str) -> Result<Vec<Donation>, SwiftCauseError>;

    /// Set the donor email on a donation that has none. Returns `(before, after)`.
    async fn attach_donor_email(
        &self,
        donation_id: &str,
        email: &str,
    ) -> Result<(Donation, Donation), SwiftCauseError>;

    /// Returns `false` when a declaration for the same transaction already exists.
    async fn insert_gift_aid(
        &self,
        declaration: &GiftAidDeclaration,
    ) -> Result<bool, SwiftCauseError>;

    async fn list_gift_aid(&self) -> Result<Vec<GiftAidDeclaration>, SwiftCauseError>;

    async fn get_user(&self, uid: &str) -> Result<Option<UserRecord>, SwiftCauseError>;

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), SwiftCauseError>;

    async fn set_stripe_customer_id(
        &self,
        uid: &str,
        customer_id: &str,
    ) -> Result<(), SwiftCauseError>;

    async fn get_organization(&self, org_id: &str)
        -> Result<Option<Organization>, SwiftCauseError>;

    async fn upsert_organization(&self, organization: &Organization)
        -> Result<(), SwiftCauseError>;

    async fn update_stripe_account(
        &self,
        org_id: &str,
        state: &StripeAccountState,
    ) -> Result<(), SwiftCauseError>;

    async fn find_organization_by_account(
        &self,
        account_id: &str,
    ) -> Result<Option<Organization>, SwiftCauseError>;

    /// Returns `false` when a message with the same id is already queued.
    async fn enqueue_mail(&self, mail: &MailMessage) -> Result<bool, SwiftCauseError>;

    async fn list_mail(&self) -> Result<Vec<MailMessage>, SwiftCauseError>;
}

#[derive(Debug, Default)]
struct Collections {
    campaigns: HashMap<String, Campaign>,
    donations: HashMap<String, Donation>,
    donations_by_transaction: HashMap<String, String>,
    gift_aid: Vec<GiftAidDeclaration>,
    users: HashMap<String, UserRecord>,
    organizations: HashMap<String, Organization>,
    mail: Vec<MailMessage>,
}

/// Development and test store. One lock guards every collection so a donation
/// insert and its campaign increment are observed together.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Collections>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DonationStore for InMemoryStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>, SwiftCauseError> {
        Ok(self.inner.read().await.campaigns.get(campaign_id).cloned())
    }

    async fn upsert_campaign(&self, campaign: &Campaign) -> Result<(), SwiftCauseError> {
        self.inner
            .write()
            .await
            .campaigns
            .insert(campaign.id.clone(), campaign.clone());
        Ok(())
    }

    async fn record_donation(&self, donation: &Donation) -> Result<RecordOutcome, SwiftCauseError> {
        let mut inner = self.inner.write().await;
        if let Some(existing_id) = inner.donations_by_transaction.get(&donation.transaction_id) {
            if let Some(existing) = inner.donations.get(existing_id) {
                return Ok(RecordOutcome::Duplicate(existing.clone()));
            }
        }

        inner
            .donations_by_transaction
            .insert(donation.transaction_id.clone(), donation.id.clone());
        inner
            .donations
            .insert(donation.id.clone(), donation.clone());

        match inner.campaigns.get_mut(&donation.campaign_id) {
            Some(campaign) => {
                campaign.collected_amount = campaign.collected_amount.saturating_add(donation.amount);
                campaign.donation_count = campaign.donation_count.saturating_add(1);
            }
            None => tracing::warn!(
                campaign_id = %donation.campaign_id,
                donation_id = %donation.id,
                "donation recorded for unknown campaign; totals not updated"
            ),
        }

        Ok(RecordOutcome::Inserted(donation.clone()))
    }

    async fn get_donation(&self, donation_id: &str) -> Result<Option<Donation>, SwiftCauseError> {
        Ok(self.inner.read().await.donations.get(donation_id).cloned())
    }

    async fn find_donation_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Donation>, SwiftCauseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .donations_by_transaction
            .get(transaction_id)
            .and_then(|id| inner.donations.get(id))
            .cloned())
    }

    async fn list_donations(&self, campaign_id: &str) -> Result<Vec<Donation>, SwiftCauseError> {
        let inner = self.inner.read().await;
        let mut donations: Vec<Donation> = inner
            .donations
            .values()
            .filter(|d| d.campaign_id == campaign_id)
            .cloned()
            .collect();
        donations.sort_by_key(|d| d.timestamp);
        Ok(donations)
    }

    async fn attach_donor_email(
        &self,
        donation_id: &str,
        email: &str,
    ) -> Result<(Donation, Donation), SwiftCauseError> {
        let mut inner = self.inner.write().await;
        let donation = inner
            .donations
            .get_mut(donation_id)
            .ok_or_else(|| SwiftCauseError::not_found(format!("donation '{}'", donation_id)))?;
        if donation.has_donor_email() {
            return Err(SwiftCauseError::InvariantViolation(format!(
                "donation '{}' already has a donor email",
                donation_id
            )));
        }
        let before = donation.clone();
        donation.donor_email = Some(email.to_string());
        Ok((before, donation.clone()))
    }

    async fn insert_gift_aid(
        &self,
        declaration: &GiftAidDeclaration,
    ) -> Result<bool, SwiftCauseError> {
        let mut inner = self.inner.write().await;
        if inner
            .gift_aid
            .iter()
            .any(|d| d.transaction_id == declaration.transaction_id)
        {
            return Ok(false);
        }
        inner.gift_aid.push(declaration.clone());
        Ok(true)
    }

    async fn list_gift_aid(&self) -> Result<Vec<GiftAidDeclaration>, SwiftCauseError> {
        Ok(self.inner.read().await.gift_aid.clone())
    }

    async fn get_user(&self, uid: &str) -> Result<Option<UserRecord>, SwiftCauseError> {
        Ok(self.inner.read().await.users.get(uid).cloned())
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), SwiftCauseError> {
        self.inner
            .write()
            .await
            .users
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn set_stripe_customer_id(
        &self,
        uid: &str,
        customer_id: &str,
    ) -> Result<(), SwiftCauseError> {
        let mut inner = self.inner.write().await;
        let user = inner.users.entry(uid.to_string()).or_insert_with(|| UserRecord {
            id: uid.to_string(),
            ..UserRecord::default()
        });
        user.stripe_customer_id = Some(customer_id.to_string());
        Ok(())
    }

    async fn get_organization(
        &self,
        org_id: &str,
    ) -> Result<Option<Organization>, SwiftCauseError> {
        Ok(self.inner.read().await.organizations.get(org_id).cloned())
    }

    async fn upsert_organization(
        &self,
        organization: &Organization,
    ) -> Result<(), SwiftCauseError> {
        self.inner
            .write()
            .await
            .organizations
            .insert(organization.id.clone(), organization.clone());
        Ok(())
    }

    async fn update_stripe_account(
        &self,
        org_id: &str,
        state: &StripeAccountState,
    ) -> Result<(), SwiftCauseError> {
        let mut inner = self.inner.write().await;
        let organization = inner
            .organizations
            .get_mut(org_id)
            .ok_or_else(|| SwiftCauseError::not_found(format!("organization '{}'", org_id)))?;
        organization.stripe = Some(state.clone());
        Ok(())
    }

    async fn find_organization_by_account(
        &self,
        account_id: &str,
    ) -> Result<Option<Organization>, SwiftCauseError> {
        Ok(self
            .inner
            .read()
            .await
            .organizations
            .values()
            .find(|org| {
                org.stripe
                    .as_ref()
                    .map(|s| s.account_id == account_id)
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn enqueue_mail(&self, mail: &MailMessage) -> Result<bool, SwiftCauseError> {
        let mut inner = self.inner.write().await;
        if inner.mail.iter().any(|m| m.id == mail.id) {
            return Ok(false);
        }
        inner.mail.push(mail.clone());
        Ok(true)
    }

    async fn list_mail(&self) -> Result<Vec<MailMessage>, SwiftCauseError> {
        Ok(self.inner.read().await.mail.clone())
    }
}

const CAMPAIGNS: &str = "campaigns";
const DONATIONS: &str = "donations";
const GIFT_AID: &str = "giftAidDeclarations";
const USERS: &str = "users";
const ORGANIZATIONS: &str = "organizations";
const MAIL: &str = "mail";

/// PostgreSQL document store: `(collection, id) -> body JSONB`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

fn pg(operation: &'static str) -> impl Fn(sqlx::Error) -> SwiftCauseError {
    move |e| SwiftCauseError::Storage(format!("postgres {operation} failed: {e}"))
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, SwiftCauseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(pg("connect"))?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), SwiftCauseError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swiftcause_documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(pg("schema create"))?;

        // One donation and one declaration per provider transaction.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_swiftcause_donation_tx
            ON swiftcause_documents ((body->>'transactionId'))
            WHERE collection = 'donations'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(pg("index create"))?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_swiftcause_gift_aid_tx
            ON swiftcause_documents ((body->>'transactionId'))
            WHERE collection = 'giftAidDeclarations'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(pg("index create"))?;

        Ok(())
    }

    async fn get_doc<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>, SwiftCauseError> {
        let row = sqlx::query("SELECT body FROM swiftcause_documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(pg("select"))?;
        row.map(|row| decode_body(&row)).transpose()
    }

    async fn put_doc<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        doc: &T,
    ) -> Result<(), SwiftCauseError> {
        let body = serde_json::to_value(doc)?;
        sqlx::query(
            r#"
            INSERT INTO swiftcause_documents (collection, id, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id) DO UPDATE SET body = EXCLUDED.body
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(pg("upsert"))?;
        Ok(())
    }

    /// Insert unless any unique constraint already covers the document.
    async fn insert_doc_once<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        doc: &T,
    ) -> Result<bool, SwiftCauseError> {
        let body = serde_json::to_value(doc)?;
        let result = sqlx::query(
            "INSERT INTO swiftcause_documents (collection, id, body) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(collection)
        .bind(id)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(pg("insert"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_docs<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>, SwiftCauseError> {
        let rows = sqlx::query(
            "SELECT body FROM swiftcause_documents WHERE collection = $1 ORDER BY created_at ASC",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(pg("list"))?;
        rows.iter().map(decode_body).collect()
    }
}

fn decode_body<T: DeserializeOwned>(row: &sqlx::postgres::PgRow) -> Result<T, SwiftCauseError> {
    let body: serde_json::Value = row.try_get("body").map_err(pg("decode body"))?;
    Ok(serde_json::from_value(body)?)
}

#[async_trait]
impl DonationStore for PostgresStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>, SwiftCauseError> {
        self.get_doc(CAMPAIGNS, campaign_id).await
    }

    async fn upsert_campaign(&self, campaign: &Campaign) -> Result<(), SwiftCauseError> {
        self.put_doc(CAMPAIGNS, &campaign.id, campaign).await
    }

    async fn record_donation(&self, donation: &Donation) -> Result<RecordOutcome, SwiftCauseError> {
        let amount: i64 = donation
            .amount
            .try_into()
            .map_err(|_| SwiftCauseError::Storage("donation amount exceeds BIGINT".to_string()))?;
        let body = serde_json::to_value(donation)?;

        let mut tx = self.pool.begin().await.map_err(pg("begin"))?;
        let inserted = sqlx::query(
            "INSERT INTO swiftcause_documents (collection, id, body) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(DONATIONS)
        .bind(&donation.id)
        .bind(body)
        .execute(&mut *tx)
        .await
        .map_err(pg("donation insert"))?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await.map_err(pg("rollback"))?;
            return self
                .find_donation_by_transaction(&donation.transaction_id)
                .await?
                .map(RecordOutcome::Duplicate)
                .ok_or_else(|| {
                    SwiftCauseError::Storage(format!(
                        "donation '{}' conflicted but no record exists for transaction '{}'",
                        donation.id, donation.transaction_id
                    ))
                });
        }

        // Arithmetic happens in the UPDATE so concurrent donations never lose an increment.
        let updated = sqlx::query(
            r#"
            UPDATE swiftcause_documents
            SET body = jsonb_set(
                jsonb_set(
                    body,
                    '{collectedAmount}',
                    to_jsonb(COALESCE((body->>'collectedAmount')::bigint, 0) + $2)
                ),
                '{donationCount}',
                to_jsonb(COALESCE((body->>'donationCount')::bigint, 0) + 1)
            )
            WHERE collection = 'campaigns' AND id = $1
            "#,
        )
        .bind(&donation.campaign_id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(pg("campaign increment"))?
        .rows_affected();

        tx.commit().await.map_err(pg("commit"))?;

        if updated == 0 {
            tracing::warn!(
                campaign_id = %donation.campaign_id,
                donation_id = %donation.id,
                "donation recorded for unknown campaign; totals not updated"
            );
        }
        Ok(RecordOutcome::Inserted(donation.clone()))
    }

    async fn get_donation(&self, donation_id: &str) -> Result<Option<Donation>, SwiftCauseError> {
        self.get_doc(DONATIONS, donation_id).await
    }

    async fn find_donation_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Donation>, SwiftCauseError> {
        let row = sqlx::query(
            "SELECT body FROM swiftcause_documents WHERE collection = 'donations' AND body->>'transactionId' = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg("select by transaction"))?;
        row.map(|row| decode_body(&row)).transpose()
    }

    async fn list_donations(&self, campaign_id: &str) -> Result<Vec<Donation>, SwiftCauseError> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM swiftcause_documents
            WHERE collection = 'donations' AND body->>'campaignId' = $1
            ORDER BY body->>'timestamp' ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg("list donations"))?;
        rows.iter().map(decode_body).collect()
    }

    async fn attach_donor_email(
        &self,
        donation_id: &str,
        email: &str,
    ) -> Result<(Donation, Donation), SwiftCauseError> {
        let row = sqlx::query(
            r#"
            UPDATE swiftcause_documents
            SET body = jsonb_set(body, '{donorEmail}', to_jsonb($2::text))
            WHERE collection = 'donations'
              AND id = $1
              AND COALESCE(btrim(body->>'donorEmail'), '') = ''
            RETURNING body
            "#,
        )
        .bind(donation_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg("attach email"))?;

        match row {
            Some(row) => {
                let after: Donation = decode_body(&row)?;
                let mut before = after.clone();
                before.donor_email = None;
                Ok((before, after))
            }
            None => match self.get_donation(donation_id).await? {
                Some(_) => Err(SwiftCauseError::InvariantViolation(format!(
                    "donation '{}' already has a donor email",
                    donation_id
                ))),
                None => Err(SwiftCauseError::not_found(format!("donation '{}'", donation_id))),
            },
        }
    }

    async fn insert_gift_aid(
        &self,
        declaration: &GiftAidDeclaration,
    ) -> Result<bool, SwiftCauseError> {
        self.insert_doc_once(GIFT_AID, &declaration.id, declaration)
            .await
    }

    async fn list_gift_aid(&self) -> Result<Vec<GiftAidDeclaration>, SwiftCauseError> {
        self.list_docs(GIFT_AID).await
    }

    async fn get_user(&self, uid: &str) -> Result<Option<UserRecord>, SwiftCauseError> {
        self.get_doc(USERS, uid).await
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), SwiftCauseError> {
        self.put_doc(USERS, &user.id, user).await
    }

    async fn set_stripe_customer_id(
        &self,
        uid: &str,
        customer_id: &str,
    ) -> Result<(), SwiftCauseError> {
        sqlx::query(
            r#"
            INSERT INTO swiftcause_documents (collection, id, body)
            VALUES ('users', $1, jsonb_build_object('id', $1::text, 'stripeCustomerId', $2::text))
            ON CONFLICT (collection, id) DO UPDATE
            SET body = swiftcause_documents.body || jsonb_build_object('stripeCustomerId', $2::text)
            "#,
        )
        .bind(uid)
        .bind(customer_id)
        .execute(&self.pool)
        .await
        .map_err(pg("customer upsert"))?;
        Ok(())
    }

    async fn get_organization(
        &self,
        org_id: &str,
    ) -> Result<Option<Organization>, SwiftCauseError> {
        self.get_doc(ORGANIZATIONS, org_id).await
    }

    async fn upsert_organization(
        &self,
        organization: &Organization,
    ) -> Result<(), SwiftCauseError> {
        self.put_doc(ORGANIZATIONS, &organization.id, organization)
            .await
    }

    async fn update_stripe_account(
        &self,
        org_id: &str,
        state: &StripeAccountState,
    ) -> Result<(), SwiftCauseError> {
        let stripe = serde_json::to_value(state)?;
        let updated = sqlx::query(
            r#"
            UPDATE swiftcause_documents
            SET body = jsonb_set(body, '{stripe}', $2)
            WHERE collection = 'organizations' AND id = $1
            "#,
        )
        .bind(org_id)
        .bind(stripe)
        .execute(&self.pool)
        .await
        .map_err(pg("stripe account update"))?
        .rows_affected();

        if updated == 0 {
            return Err(SwiftCauseError::not_found(format!("organization '{}'", org_id)));
        }
        Ok(())
    }

    async fn find_organization_by_account(
        &self,
        account_id: &str,
    ) -> Result<Option<Organization>, SwiftCauseError> {
        let row = sqlx::query(
            r#"
            SELECT body FROM swiftcause_documents
            WHERE collection = 'organizations' AND body->'stripe'->>'accountId' = $1
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg("select by account"))?;
        row.map(|row| decode_body(&row)).transpose()
    }

    async fn enqueue_mail(&self, mail: &MailMessage) -> Result<bool, SwiftCauseError> {
        self.insert_doc_once(MAIL, &mail.id, mail).await
    }

    async fn list_mail(&self) -> Result<Vec<MailMessage>, SwiftCauseError> {
        self.list_docs(MAIL).await
    }
}
