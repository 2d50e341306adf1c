//! PostgreSQL store
//!
//! Transactions run at READ COMMITTED; every balance check and every transfer
//! state change reads its row with `SELECT ... FOR UPDATE` first, so writers
//! touching the same account or transfer are serialized by Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

use super::{LedgerStore, LedgerTx};
use crate::account::{Account, Entry};
use crate::condition::{Condition, Fulfillment};
use crate::error::{LedgerError, Result};
use crate::notify::Notification;
use crate::subscription::Subscription;
use crate::transfer::{
    ConditionRole, Credit, Debit, FulfillmentRecord, RejectionReason, Timeline, Transfer,
    TransferState,
};

/// Reference DDL for development databases
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts_tb (
    name                    TEXT PRIMARY KEY,
    balance                 NUMERIC NOT NULL DEFAULT 0,
    minimum_allowed_balance NUMERIC,
    is_disabled             BOOLEAN NOT NULL DEFAULT FALSE,
    is_admin                BOOLEAN NOT NULL DEFAULT FALSE,
    public_key              TEXT,
    connector               TEXT
);

CREATE TABLE IF NOT EXISTS entries_tb (
    id            UUID PRIMARY KEY,
    transfer_id   UUID,
    account       TEXT NOT NULL REFERENCES accounts_tb(name),
    delta         NUMERIC NOT NULL,
    balance_after NUMERIC NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS entries_account_idx ON entries_tb(account);

CREATE TABLE IF NOT EXISTS transfers_tb (
    id                     UUID PRIMARY KEY,
    ledger                 TEXT NOT NULL,
    debits                 JSONB NOT NULL,
    credits                JSONB NOT NULL,
    state                  SMALLINT NOT NULL,
    rejection_reason       TEXT,
    execution_condition    TEXT,
    cancellation_condition TEXT,
    expires_at             TIMESTAMPTZ,
    proposed_at            TIMESTAMPTZ,
    prepared_at            TIMESTAMPTZ,
    executed_at            TIMESTAMPTZ,
    rejected_at            TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS transfers_expiring_idx ON transfers_tb(expires_at)
    WHERE state IN (0, 10) AND expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS fulfillments_tb (
    transfer_id UUID PRIMARY KEY REFERENCES transfers_tb(id),
    role        TEXT NOT NULL,
    fulfillment JSONB NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions_tb (
    id         UUID PRIMARY KEY,
    owner      TEXT NOT NULL,
    event      TEXT NOT NULL,
    subject    TEXT NOT NULL,
    target     TEXT NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS subscriptions_subject_idx ON subscriptions_tb(subject);

CREATE TABLE IF NOT EXISTS notifications_tb (
    id              UUID PRIMARY KEY,
    subscription_id UUID NOT NULL,
    transfer_id     UUID NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    retry_at        TIMESTAMPTZ,
    UNIQUE (subscription_id, transfer_id)
);
"#;

const TRANSFER_COLUMNS: &str = "id, ledger, debits, credits, state, rejection_reason, \
     execution_condition, cancellation_condition, expires_at, \
     proposed_at, prepared_at, executed_at, rejected_at";

const ACCOUNT_COLUMNS: &str =
    "name, balance, minimum_allowed_balance, is_disabled, is_admin, public_key, connector";

/// PostgreSQL-backed [`LedgerStore`]
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a new database connection pool
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply [`SCHEMA`]
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn row_to_account(row: &PgRow) -> Result<Account> {
    Ok(Account {
        name: row.try_get("name")?,
        balance: row.try_get("balance")?,
        minimum_allowed_balance: row.try_get("minimum_allowed_balance")?,
        is_disabled: row.try_get("is_disabled")?,
        is_admin: row.try_get("is_admin")?,
        public_key: row.try_get("public_key")?,
        connector: row.try_get("connector")?,
    })
}

fn parse_condition(raw: Option<String>) -> Result<Option<Condition>> {
    raw.map(|s| {
        s.parse::<Condition>()
            .map_err(|e| LedgerError::Internal(format!("stored condition: {}", e)))
    })
    .transpose()
}

fn row_to_transfer(row: &PgRow) -> Result<Transfer> {
    let state_id: i16 = row.try_get("state")?;
    let state = TransferState::from_id(state_id)
        .ok_or_else(|| LedgerError::Internal(format!("unknown state id {}", state_id)))?;

    let rejection_reason = row
        .try_get::<Option<String>, _>("rejection_reason")?
        .map(|s| s.parse::<RejectionReason>().map_err(LedgerError::Internal))
        .transpose()?;

    let Json(debits): Json<Vec<Debit>> = row.try_get("debits")?;
    let Json(credits): Json<Vec<Credit>> = row.try_get("credits")?;

    Ok(Transfer {
        id: row.try_get("id")?,
        ledger: row.try_get("ledger")?,
        debits,
        credits,
        state,
        rejection_reason,
        execution_condition: parse_condition(row.try_get("execution_condition")?)?,
        cancellation_condition: parse_condition(row.try_get("cancellation_condition")?)?,
        expires_at: row.try_get("expires_at")?,
        timeline: Timeline {
            proposed_at: row.try_get("proposed_at")?,
            prepared_at: row.try_get("prepared_at")?,
            executed_at: row.try_get("executed_at")?,
            rejected_at: row.try_get("rejected_at")?,
        },
    })
}

fn row_to_subscription(row: &PgRow) -> Result<Subscription> {
    Ok(Subscription {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        event: row.try_get("event")?,
        subject: row.try_get("subject")?,
        target: row.try_get("target")?,
        is_deleted: row.try_get("is_deleted")?,
    })
}

fn row_to_notification(row: &PgRow) -> Result<Notification> {
    Ok(Notification {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        transfer_id: row.try_get("transfer_id")?,
        retry_count: row.try_get("retry_count")?,
        retry_at: row.try_get("retry_at")?,
    })
}

impl PgTx {
    async fn fetch_account(&mut self, name: &str, for_update: bool) -> Result<Option<Account>> {
        let sql = format!(
            "SELECT {} FROM accounts_tb WHERE name = $1{}",
            ACCOUNT_COLUMNS,
            if for_update { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(row_to_account).transpose()
    }

    async fn fetch_transfer(&mut self, id: Uuid, for_update: bool) -> Result<Option<Transfer>> {
        let sql = format!(
            "SELECT {} FROM transfers_tb WHERE id = $1{}",
            TRANSFER_COLUMNS,
            if for_update { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(row_to_transfer).transpose()
    }
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn get_account(&mut self, name: &str) -> Result<Option<Account>> {
        self.fetch_account(name, false).await
    }

    async fn lock_account(&mut self, name: &str) -> Result<Option<Account>> {
        self.fetch_account(name, true).await
    }

    async fn upsert_account(&mut self, account: &Account) -> Result<bool> {
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO accounts_tb
                (name, balance, minimum_allowed_balance, is_disabled, is_admin, public_key, connector)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO UPDATE SET
                balance = EXCLUDED.balance,
                minimum_allowed_balance = EXCLUDED.minimum_allowed_balance,
                is_disabled = EXCLUDED.is_disabled,
                is_admin = EXCLUDED.is_admin,
                public_key = EXCLUDED.public_key,
                connector = EXCLUDED.connector
            RETURNING (xmax = 0)
            "#,
        )
        .bind(&account.name)
        .bind(account.balance)
        .bind(account.minimum_allowed_balance)
        .bind(account.is_disabled)
        .bind(account.is_admin)
        .bind(&account.public_key)
        .bind(&account.connector)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(!inserted)
    }

    async fn ensure_account(&mut self, account: &Account) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts_tb
                (name, balance, minimum_allowed_balance, is_disabled, is_admin, public_key, connector)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&account.name)
        .bind(account.balance)
        .bind(account.minimum_allowed_balance)
        .bind(account.is_disabled)
        .bind(account.is_admin)
        .bind(&account.public_key)
        .bind(&account.connector)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_balance(&mut self, name: &str, balance: Decimal) -> Result<()> {
        sqlx::query("UPDATE accounts_tb SET balance = $1 WHERE name = $2")
            .bind(balance)
            .bind(name)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_entry(&mut self, entry: &Entry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entries_tb (id, transfer_id, account, delta, balance_after, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.transfer_id)
        .bind(&entry.account)
        .bind(entry.delta)
        .bind(entry.balance_after)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn entries_for_account(&mut self, name: &str) -> Result<Vec<Entry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, transfer_id, account, delta, balance_after, created_at
            FROM entries_tb WHERE account = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(name)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Entry {
                    id: row.try_get("id")?,
                    transfer_id: row.try_get("transfer_id")?,
                    account: row.try_get("account")?,
                    delta: row.try_get("delta")?,
                    balance_after: row.try_get("balance_after")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn total_balance(&mut self) -> Result<Decimal> {
        let total: Decimal = sqlx::query_scalar("SELECT COALESCE(SUM(balance), 0) FROM accounts_tb")
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(total)
    }

    async fn get_transfer(&mut self, id: Uuid) -> Result<Option<Transfer>> {
        self.fetch_transfer(id, false).await
    }

    async fn lock_transfer(&mut self, id: Uuid) -> Result<Option<Transfer>> {
        self.fetch_transfer(id, true).await
    }

    async fn upsert_transfer(&mut self, transfer: &Transfer) -> Result<bool> {
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO transfers_tb
                (id, ledger, debits, credits, state, rejection_reason,
                 execution_condition, cancellation_condition, expires_at,
                 proposed_at, prepared_at, executed_at, rejected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                ledger = EXCLUDED.ledger,
                debits = EXCLUDED.debits,
                credits = EXCLUDED.credits,
                state = EXCLUDED.state,
                rejection_reason = EXCLUDED.rejection_reason,
                execution_condition = EXCLUDED.execution_condition,
                cancellation_condition = EXCLUDED.cancellation_condition,
                expires_at = EXCLUDED.expires_at,
                proposed_at = EXCLUDED.proposed_at,
                prepared_at = EXCLUDED.prepared_at,
                executed_at = EXCLUDED.executed_at,
                rejected_at = EXCLUDED.rejected_at
            RETURNING (xmax = 0)
            "#,
        )
        .bind(transfer.id)
        .bind(&transfer.ledger)
        .bind(Json(&transfer.debits))
        .bind(Json(&transfer.credits))
        .bind(transfer.state.id())
        .bind(transfer.rejection_reason.map(|r| r.as_str()))
        .bind(transfer.execution_condition.as_ref().map(Condition::to_uri))
        .bind(transfer.cancellation_condition.as_ref().map(Condition::to_uri))
        .bind(transfer.expires_at)
        .bind(transfer.timeline.proposed_at)
        .bind(transfer.timeline.prepared_at)
        .bind(transfer.timeline.executed_at)
        .bind(transfer.timeline.rejected_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(!inserted)
    }

    async fn expiring_transfers(&mut self) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, expires_at FROM transfers_tb
            WHERE state IN ($1, $2) AND expires_at IS NOT NULL
            "#,
        )
        .bind(TransferState::Proposed.id())
        .bind(TransferState::Prepared.id())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("id")?, row.try_get("expires_at")?)))
            .collect()
    }

    async fn get_fulfillment(&mut self, transfer_id: Uuid) -> Result<Option<FulfillmentRecord>> {
        let row = sqlx::query(
            "SELECT transfer_id, role, fulfillment, created_at FROM fulfillments_tb WHERE transfer_id = $1",
        )
        .bind(transfer_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let role: String = row.try_get("role")?;
        let role = match role.as_str() {
            "execution" => ConditionRole::Execution,
            "cancellation" => ConditionRole::Cancellation,
            other => {
                return Err(LedgerError::Internal(format!(
                    "unknown fulfillment role {}",
                    other
                )));
            }
        };
        let Json(fulfillment): Json<Fulfillment> = row.try_get("fulfillment")?;

        Ok(Some(FulfillmentRecord {
            transfer_id: row.try_get("transfer_id")?,
            role,
            fulfillment,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn insert_fulfillment(&mut self, record: &FulfillmentRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fulfillments_tb (transfer_id, role, fulfillment, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (transfer_id) DO NOTHING
            "#,
        )
        .bind(record.transfer_id)
        .bind(record.role.as_str())
        .bind(Json(&record.fulfillment))
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_subscription(&mut self, id: Uuid) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            "SELECT id, owner, event, subject, target, is_deleted FROM subscriptions_tb WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(row_to_subscription).transpose()
    }

    async fn upsert_subscription(&mut self, subscription: &Subscription) -> Result<bool> {
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO subscriptions_tb (id, owner, event, subject, target, is_deleted)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                owner = EXCLUDED.owner,
                event = EXCLUDED.event,
                subject = EXCLUDED.subject,
                target = EXCLUDED.target,
                is_deleted = EXCLUDED.is_deleted
            RETURNING (xmax = 0)
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.owner)
        .bind(&subscription.event)
        .bind(&subscription.subject)
        .bind(&subscription.target)
        .bind(subscription.is_deleted)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(!inserted)
    }

    async fn subscriptions_for_subjects(
        &mut self,
        subjects: &[String],
    ) -> Result<Vec<Subscription>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner, event, subject, target, is_deleted FROM subscriptions_tb
            WHERE subject = ANY($1) AND NOT is_deleted
            ORDER BY id
            "#,
        )
        .bind(subjects)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(row_to_subscription).collect()
    }

    async fn upsert_notification(&mut self, notification: &Notification) -> Result<bool> {
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO notifications_tb (id, subscription_id, transfer_id, retry_count, retry_at)
            VALUES ($1, $2, $3, 0, NULL)
            ON CONFLICT (subscription_id, transfer_id) DO UPDATE SET
                retry_count = 0,
                retry_at = NULL
            RETURNING (xmax = 0)
            "#,
        )
        .bind(notification.id)
        .bind(notification.subscription_id)
        .bind(notification.transfer_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(!inserted)
    }

    async fn due_notifications(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
            SELECT id, subscription_id, transfer_id, retry_count, retry_at
            FROM notifications_tb
            WHERE retry_at IS NULL OR retry_at <= $1
            ORDER BY retry_at NULLS FIRST, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(row_to_notification).collect()
    }

    async fn reschedule_notification(
        &mut self,
        id: Uuid,
        retry_count: i32,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE notifications_tb SET retry_count = $1, retry_at = $2 WHERE id = $3")
            .bind(retry_count)
            .bind(retry_at)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_notification(&mut self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM notifications_tb WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
