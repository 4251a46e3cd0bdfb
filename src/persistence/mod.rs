//! Storage boundary for preflight scripts and their environments.
//!
//! One script and one environment per target. Implementations are
//! last-writer-wins; the orchestrator only writes after a run finishes.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::environment::Environment;
use crate::error::PreflightResult;

pub use memory::MemoryStore;
pub use postgres::PgPreflightStore;

/// A stored preflight script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightScript {
    pub id: Uuid,
    pub source_code: String,
    pub target_id: String,
    pub created_by_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait PreflightStore: Send + Sync {
    async fn load_script(&self, target_id: &str) -> PreflightResult<Option<PreflightScript>>;

    /// Insert or replace the target's script. The creator is only recorded
    /// on first insert.
    async fn upsert_script(
        &self,
        target_id: &str,
        source_code: &str,
        actor_id: Option<&str>,
    ) -> PreflightResult<PreflightScript>;

    /// The committed environment; empty when none was saved
    async fn load_environment(&self, target_id: &str) -> PreflightResult<Environment>;

    async fn save_environment(
        &self,
        target_id: &str,
        environment: &Environment,
    ) -> PreflightResult<()>;

    /// Remove the script and environment of a deleted target
    async fn delete_target(&self, target_id: &str) -> PreflightResult<()>;
}
