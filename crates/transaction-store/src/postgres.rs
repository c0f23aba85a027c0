use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::TransactionId;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow};

use crate::store::{SaveOptions, TransactionStorage, TransactionTimeoutHandler};
use crate::sweeper::{SweepReport, TimeoutSweeper};
use crate::{
    Result, StorageConfig, StorageError, TransactionCheckpoint, TransactionQuery,
    TransactionState, Version,
};

const SELECT_COLUMNS: &str =
    "SELECT workflow_id, transaction_id, version, flow, context, errors FROM workflow_transactions";

/// PostgreSQL-backed transaction storage.
///
/// Shares transaction state between orchestrator processes. Every save is a
/// compare-and-set on the `version` column.
#[derive(Clone)]
pub struct PostgresTransactionStorage {
    pool: PgPool,
    config: StorageConfig,
    sweeper: TimeoutSweeper,
}

impl PostgresTransactionStorage {
    /// Creates a new PostgreSQL transaction storage.
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, StorageConfig::default())
    }

    /// Creates a new PostgreSQL transaction storage with the given configuration.
    pub fn with_config(pool: PgPool, config: StorageConfig) -> Self {
        Self {
            pool,
            config,
            sweeper: TimeoutSweeper::new(),
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    /// Runs one sweep pass immediately.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.sweeper.sweep(self, &self.config).await
    }

    async fn current_version(
        &self,
        workflow_id: &str,
        transaction_id: &TransactionId,
    ) -> Result<Version> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM workflow_transactions WHERE workflow_id = $1 AND transaction_id = $2",
        )
        .bind(workflow_id)
        .bind(transaction_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(Version::new(version.unwrap_or(0)))
    }

    fn row_to_checkpoint(row: PgRow) -> Result<TransactionCheckpoint> {
        let workflow_id: String = row.try_get("workflow_id")?;
        let transaction_id: String = row.try_get("transaction_id")?;
        let corrupt = |reason: serde_json::Error| StorageError::CorruptRecord {
            workflow_id: workflow_id.clone(),
            transaction_id: transaction_id.clone(),
            reason: reason.to_string(),
        };

        Ok(TransactionCheckpoint {
            flow: serde_json::from_value(row.try_get("flow")?).map_err(corrupt)?,
            context: serde_json::from_value(row.try_get("context")?).map_err(corrupt)?,
            errors: serde_json::from_value(row.try_get("errors")?).map_err(corrupt)?,
            version: Version::new(row.try_get("version")?),
        })
    }
}

fn finished_state_names() -> Vec<String> {
    TransactionState::finished()
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

#[async_trait]
impl TransactionStorage for PostgresTransactionStorage {
    async fn get(
        &self,
        workflow_id: &str,
        transaction_id: &TransactionId,
    ) -> Result<Option<TransactionCheckpoint>> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE workflow_id = $1 AND transaction_id = $2"
        ))
        .bind(workflow_id)
        .bind(transaction_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_checkpoint).transpose()
    }

    async fn save(
        &self,
        checkpoint: &TransactionCheckpoint,
        options: SaveOptions,
    ) -> Result<Version> {
        let now = Utc::now();
        let mut flow = checkpoint.flow.clone();
        flow.updated_at = now;

        let workflow_id = flow.workflow_id.clone();
        let transaction_id = flow.transaction_id.clone();
        let state = flow.state.as_str();
        let timeout_at = flow.timeout_at;
        let created_at = flow.created_at;
        let flow_json = serde_json::to_value(&flow)?;
        let context_json = serde_json::to_value(&checkpoint.context)?;
        let errors_json = serde_json::to_value(&checkpoint.errors)?;

        let saved: Option<i64> = match options.expected_version {
            Some(expected) if expected == Version::initial() => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO workflow_transactions
                        (workflow_id, transaction_id, state, version, flow, context, errors, timeout_at, created_at, updated_at)
                    VALUES ($1, $2, $3, 1, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (workflow_id, transaction_id) DO NOTHING
                    RETURNING version
                    "#,
                )
                .bind(&workflow_id)
                .bind(transaction_id.as_str())
                .bind(state)
                .bind(&flow_json)
                .bind(&context_json)
                .bind(&errors_json)
                .bind(timeout_at)
                .bind(created_at)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query_scalar(
                    r#"
                    UPDATE workflow_transactions
                    SET state = $3, version = version + 1, flow = $4, context = $5, errors = $6,
                        timeout_at = $7, updated_at = $8
                    WHERE workflow_id = $1 AND transaction_id = $2 AND version = $9
                    RETURNING version
                    "#,
                )
                .bind(&workflow_id)
                .bind(transaction_id.as_str())
                .bind(state)
                .bind(&flow_json)
                .bind(&context_json)
                .bind(&errors_json)
                .bind(timeout_at)
                .bind(now)
                .bind(expected.as_i64())
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO workflow_transactions
                        (workflow_id, transaction_id, state, version, flow, context, errors, timeout_at, created_at, updated_at)
                    VALUES ($1, $2, $3, 1, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (workflow_id, transaction_id) DO UPDATE
                    SET state = EXCLUDED.state,
                        version = workflow_transactions.version + 1,
                        flow = EXCLUDED.flow,
                        context = EXCLUDED.context,
                        errors = EXCLUDED.errors,
                        timeout_at = EXCLUDED.timeout_at,
                        updated_at = EXCLUDED.updated_at
                    RETURNING version
                    "#,
                )
                .bind(&workflow_id)
                .bind(transaction_id.as_str())
                .bind(state)
                .bind(&flow_json)
                .bind(&context_json)
                .bind(&errors_json)
                .bind(timeout_at)
                .bind(created_at)
                .bind(now)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match saved {
            Some(version) => {
                metrics::counter!("transaction_store_saves_total").increment(1);
                Ok(Version::new(version))
            }
            None => {
                let actual = self.current_version(&workflow_id, &transaction_id).await?;
                Err(StorageError::ConcurrencyConflict {
                    workflow_id,
                    transaction_id,
                    expected: options.expected_version.unwrap_or(Version::initial()),
                    actual,
                })
            }
        }
    }

    async fn list(&self, query: TransactionQuery) -> Result<Vec<TransactionCheckpoint>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_COLUMNS);
        builder.push(" WHERE 1=1");

        if let Some(workflow_id) = query.workflow_id {
            builder.push(" AND workflow_id = ").push_bind(workflow_id);
        }
        if let Some(states) = query.states {
            let names: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
            builder.push(" AND state = ANY(").push_bind(names).push(")");
        }
        if query.unfinished_only {
            builder
                .push(" AND NOT (state = ANY(")
                .push_bind(finished_state_names())
                .push("))");
        }
        if let Some(before) = query.timeout_before {
            builder
                .push(" AND timeout_at IS NOT NULL AND timeout_at <= ")
                .push_bind(before);
        }

        builder.push(" ORDER BY created_at ASC, transaction_id ASC");

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            builder.push(" OFFSET ").push_bind(offset as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_checkpoint).collect()
    }

    async fn delete(&self, workflow_id: &str, transaction_id: &TransactionId) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM workflow_transactions WHERE workflow_id = $1 AND transaction_id = $2",
        )
        .bind(workflow_id)
        .bind(transaction_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_finished(&self, updated_before: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM workflow_transactions WHERE state = ANY($1) AND updated_at < $2",
        )
        .bind(finished_state_names())
        .bind(updated_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn register_timeout_handler(&self, handler: Weak<dyn TransactionTimeoutHandler>) {
        self.sweeper.set_handler(handler).await;
    }

    async fn on_application_start(&self) -> Result<()> {
        self.sweeper
            .start(Arc::new(self.clone()), self.config.clone())
            .await;
        Ok(())
    }

    async fn on_application_shutdown(&self) -> Result<()> {
        self.sweeper.stop().await;
        Ok(())
    }
}
