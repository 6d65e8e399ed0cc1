//! PostgreSQL store built on diesel raw SQL.

use async_trait::async_trait;
use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Bool, Date, Double, Text, Uuid as SqlUuid};
use uuid::Uuid;

use crate::persistence::database::Database;
use crate::persistence::{
    DebtStore, DocumentRecord, DocumentStore, NewDebt, NewUser, NotificationClaim, PersistenceError,
    UpsertBatch, UpsertSummary,
};

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    government_id VARCHAR(20) NOT NULL UNIQUE,
    email VARCHAR(255) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS debts (
    id BIGSERIAL PRIMARY KEY,
    debt_id UUID NOT NULL UNIQUE,
    government_id VARCHAR(20) NOT NULL REFERENCES users (government_id) ON DELETE CASCADE,
    file_id UUID NOT NULL,
    debt_amount NUMERIC(12, 2) NOT NULL,
    debt_due_date DATE NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_debts_file_id ON debts (file_id);

CREATE TABLE IF NOT EXISTS documents (
    id UUID PRIMARY KEY,
    debt_id UUID NOT NULL UNIQUE REFERENCES debts (debt_id) ON DELETE CASCADE,
    government_id VARCHAR(20) NOT NULL,
    status VARCHAR(20) NOT NULL DEFAULT 'PENDING',
    generated_at TIMESTAMPTZ,
    notified_at TIMESTAMPTZ
);
"#;

#[derive(QueryableByName)]
struct DocumentIdRow {
    #[diesel(sql_type = SqlUuid)]
    id: Uuid,
}

#[derive(QueryableByName)]
struct DocumentStateRow {
    #[diesel(sql_type = SqlUuid)]
    id: Uuid,
    #[diesel(sql_type = Bool)]
    notified: bool,
}

#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create users, debts and documents tables when missing
    pub async fn ensure_tables(&self) -> Result<(), PersistenceError> {
        self.db
            .run(|conn| {
                conn.batch_execute(CREATE_TABLES)?;
                Ok(())
            })
            .await?;
        tracing::info!("Database tables ready");
        Ok(())
    }
}

fn upsert_users(conn: &mut PgConnection, users: &[NewUser]) -> Result<usize, diesel::result::Error> {
    let mut inserted = 0;
    for user in users {
        inserted += diesel::sql_query(
            "INSERT INTO users (name, government_id, email) VALUES ($1, $2, $3) \
             ON CONFLICT (government_id) DO NOTHING",
        )
        .bind::<Text, _>(&user.name)
        .bind::<Text, _>(&user.government_id)
        .bind::<Text, _>(&user.email)
        .execute(conn)?;
    }
    Ok(inserted)
}

fn upsert_debts(conn: &mut PgConnection, debts: &[NewDebt]) -> Result<usize, diesel::result::Error> {
    let mut inserted = 0;
    for debt in debts {
        inserted += diesel::sql_query(
            "INSERT INTO debts (debt_id, government_id, file_id, debt_amount, debt_due_date) \
             VALUES ($1, $2, $3, CAST($4 AS NUMERIC(12, 2)), $5) \
             ON CONFLICT (debt_id) DO NOTHING",
        )
        .bind::<SqlUuid, _>(debt.debt_id)
        .bind::<Text, _>(&debt.government_id)
        .bind::<SqlUuid, _>(debt.file_id)
        .bind::<Double, _>(debt.amount)
        .bind::<Date, _>(debt.due_date)
        .execute(conn)?;
    }
    Ok(inserted)
}

#[async_trait]
impl DebtStore for PgStore {
    async fn upsert_batch(&self, batch: &UpsertBatch) -> Result<UpsertSummary, PersistenceError> {
        if batch.is_empty() {
            return Ok(UpsertSummary::default());
        }
        let batch = batch.clone();
        self.db
            .run(move |conn| {
                // Rolled back on any error; the connection returns to the pool either way
                let summary = conn.transaction::<_, diesel::result::Error, _>(|conn| {
                    let users_inserted = upsert_users(conn, &batch.users)?;
                    let debts_inserted = upsert_debts(conn, &batch.debts)?;
                    Ok(UpsertSummary {
                        users_inserted,
                        debts_inserted,
                    })
                })?;
                Ok(summary)
            })
            .await
    }

    async fn ping(&self) -> Result<(), PersistenceError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.test_connection()).await?
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn insert_document(&self, government_id: &str, debt_id: Uuid) -> Result<DocumentRecord, PersistenceError> {
        let government_id = government_id.to_string();
        self.db
            .run(move |conn| {
                let (inserted, row) = conn.transaction::<_, diesel::result::Error, _>(|conn| {
                    let inserted = diesel::sql_query(
                        "INSERT INTO documents (id, debt_id, government_id, status, generated_at) \
                         VALUES ($1, $2, $3, 'GENERATED', NOW()) \
                         ON CONFLICT (debt_id) DO NOTHING",
                    )
                    .bind::<SqlUuid, _>(Uuid::new_v4())
                    .bind::<SqlUuid, _>(debt_id)
                    .bind::<Text, _>(&government_id)
                    .execute(conn)?;

                    let row = diesel::sql_query(
                        "SELECT id, notified_at IS NOT NULL AS notified FROM documents WHERE debt_id = $1",
                    )
                    .bind::<SqlUuid, _>(debt_id)
                    .get_result::<DocumentStateRow>(conn)?;
                    Ok((inserted, row))
                })?;
                Ok(DocumentRecord {
                    id: row.id,
                    created: inserted > 0,
                    notified: row.notified,
                })
            })
            .await
    }

    async fn mark_notified(&self, document_id: Uuid) -> Result<NotificationClaim, PersistenceError> {
        self.db
            .run(move |conn| {
                // Conditional update: concurrent redeliveries race here and only one wins
                let claimed = diesel::sql_query(
                    "UPDATE documents SET status = 'NOTIFIED', notified_at = NOW() \
                     WHERE id = $1 AND notified_at IS NULL",
                )
                .bind::<SqlUuid, _>(document_id)
                .execute(conn)?;
                if claimed > 0 {
                    return Ok(NotificationClaim::Claimed);
                }

                let existing = diesel::sql_query("SELECT id FROM documents WHERE id = $1")
                    .bind::<SqlUuid, _>(document_id)
                    .get_result::<DocumentIdRow>(conn)
                    .optional()?;
                Ok(match existing {
                    Some(_) => NotificationClaim::AlreadyNotified,
                    None => NotificationClaim::UnknownDocument,
                })
            })
            .await
    }
}
