use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::environment::Environment;
use crate::error::{PreflightError, PreflightResult};
use crate::persistence::{PreflightScript, PreflightStore};

const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL-backed store
#[derive(Debug, Clone)]
pub struct PgPreflightStore {
    pool: PgPool,
}

impl PgPreflightStore {
    /// Connect, and run migrations when `auto_migrate` is set
    pub async fn connect(config: &DatabaseConfig) -> PreflightResult<Self> {
        if config.url.is_empty() {
            return Err(PreflightError::Config {
                message: "Database connection string is required".to_string(),
            });
        }

        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await
            .map_err(|e| PreflightError::persistence(format!("Failed to connect to database: {}", e)))?;
        info!("Database connection established");

        let store = Self::from_pool(pool);
        if config.auto_migrate {
            store.migrate().await?;
        } else {
            warn!("Auto-migration is disabled. Run migrations manually with: sqlx migrate run");
        }
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> PreflightResult<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PreflightError::persistence(format!("Failed to run migrations: {}", e)))?;
        info!("Database migrations completed successfully");
        Ok(())
    }
}

fn map_sqlx_error(target_id: &str, operation: &str, e: sqlx::Error) -> PreflightError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            warn!(target_id, operation, "Concurrent preflight save collided");
            PreflightError::PersistenceConflict {
                target_id: target_id.to_string(),
            }
        }
        _ => {
            error!(target_id, operation, "Database error: {}", e);
            PreflightError::persistence(format!("Failed to {}: {}", operation, e))
        }
    }
}

fn script_from_row(row: &PgRow) -> PreflightResult<PreflightScript> {
    let invalid = |e: sqlx::Error| PreflightError::persistence(format!("Invalid script row: {}", e));
    Ok(PreflightScript {
        id: row.try_get("id").map_err(invalid)?,
        source_code: row.try_get("source_code").map_err(invalid)?,
        target_id: row.try_get("target_id").map_err(invalid)?,
        created_by_user_id: row.try_get("created_by_user_id").map_err(invalid)?,
        created_at: row.try_get("created_at").map_err(invalid)?,
        updated_at: row.try_get("updated_at").map_err(invalid)?,
    })
}

#[async_trait]
impl PreflightStore for PgPreflightStore {
    async fn load_script(&self, target_id: &str) -> PreflightResult<Option<PreflightScript>> {
        let row = sqlx::query(
            r#"
            SELECT id, source_code, target_id, created_by_user_id, created_at, updated_at
            FROM document_preflight_scripts
            WHERE target_id = $1
            "#,
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(target_id, "load preflight script", e))?;

        row.as_ref().map(script_from_row).transpose()
    }

    async fn upsert_script(
        &self,
        target_id: &str,
        source_code: &str,
        actor_id: Option<&str>,
    ) -> PreflightResult<PreflightScript> {
        let row = sqlx::query(
            r#"
            INSERT INTO document_preflight_scripts (id, source_code, target_id, created_by_user_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (target_id)
            DO UPDATE
                SET source_code = EXCLUDED.source_code,
                    updated_at = NOW()
            RETURNING id, source_code, target_id, created_by_user_id, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(source_code)
        .bind(target_id)
        .bind(actor_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(target_id, "save preflight script", e))?;

        script_from_row(&row)
    }

    async fn load_environment(&self, target_id: &str) -> PreflightResult<Environment> {
        // `json` keeps key order; read it back as text to preserve it
        let row = sqlx::query(
            r#"
            SELECT environment::text AS environment
            FROM document_preflight_environments
            WHERE target_id = $1
            "#,
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(target_id, "load preflight environment", e))?;

        match row {
            Some(row) => {
                let text: String = row.try_get("environment").map_err(|e| {
                    PreflightError::persistence(format!("Invalid environment row: {}", e))
                })?;
                Environment::from_json_str(&text)
            }
            None => Ok(Environment::new()),
        }
    }

    async fn save_environment(
        &self,
        target_id: &str,
        environment: &Environment,
    ) -> PreflightResult<()> {
        let text = serde_json::to_string(environment)
            .map_err(|e| PreflightError::persistence(format!("Failed to encode environment: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO document_preflight_environments (target_id, environment)
            VALUES ($1, $2::text::json)
            ON CONFLICT (target_id)
            DO UPDATE
                SET environment = EXCLUDED.environment,
                    updated_at = NOW()
            "#,
        )
        .bind(target_id)
        .bind(text)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(target_id, "save preflight environment", e))?;

        Ok(())
    }

    async fn delete_target(&self, target_id: &str) -> PreflightResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(target_id, "start transaction", e))?;

        sqlx::query("DELETE FROM document_preflight_scripts WHERE target_id = $1")
            .bind(target_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(target_id, "delete preflight script", e))?;
        sqlx::query("DELETE FROM document_preflight_environments WHERE target_id = $1")
            .bind(target_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(target_id, "delete preflight environment", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(target_id, "commit transaction", e))?;
        info!(target_id, "Deleted preflight data for target");
        Ok(())
    }
}
