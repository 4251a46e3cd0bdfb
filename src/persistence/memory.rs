use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::environment::Environment;
use crate::error::{PreflightError, PreflightResult};
use crate::persistence::{PreflightScript, PreflightStore};

#[derive(Debug, Default)]
struct StoredTarget {
    script: Option<PreflightScript>,
    environment: Option<Environment>,
}

/// In-process store used by the CLI and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    targets: RwLock<HashMap<String, StoredTarget>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_count(&self) -> PreflightResult<usize> {
        let targets = self.targets.read().map_err(lock_poisoned)?;
        Ok(targets
            .values()
            .filter(|target| target.script.is_some() || target.environment.is_some())
            .count())
    }
}

fn lock_poisoned<T>(e: std::sync::PoisonError<T>) -> PreflightError {
    PreflightError::persistence(format!("Memory store lock poisoned: {}", e))
}

#[async_trait]
impl PreflightStore for MemoryStore {
    async fn load_script(&self, target_id: &str) -> PreflightResult<Option<PreflightScript>> {
        let targets = self.targets.read().map_err(lock_poisoned)?;
        Ok(targets
            .get(target_id)
            .and_then(|target| target.script.clone()))
    }

    async fn upsert_script(
        &self,
        target_id: &str,
        source_code: &str,
        actor_id: Option<&str>,
    ) -> PreflightResult<PreflightScript> {
        let mut targets = self.targets.write().map_err(lock_poisoned)?;
        let target = targets.entry(target_id.to_string()).or_default();
        let now = Utc::now();

        let script = match target.script.take() {
            Some(existing) => PreflightScript {
                source_code: source_code.to_string(),
                updated_at: now,
                ..existing
            },
            None => PreflightScript {
                id: Uuid::new_v4(),
                source_code: source_code.to_string(),
                target_id: target_id.to_string(),
                created_by_user_id: actor_id.map(str::to_string),
                created_at: now,
                updated_at: now,
            },
        };
        debug!(target_id, script_id = %script.id, "Stored preflight script");
        target.script = Some(script.clone());
        Ok(script)
    }

    async fn load_environment(&self, target_id: &str) -> PreflightResult<Environment> {
        let targets = self.targets.read().map_err(lock_poisoned)?;
        Ok(targets
            .get(target_id)
            .and_then(|target| target.environment.clone())
            .unwrap_or_default())
    }

    async fn save_environment(
        &self,
        target_id: &str,
        environment: &Environment,
    ) -> PreflightResult<()> {
        let mut targets = self.targets.write().map_err(lock_poisoned)?;
        targets
            .entry(target_id.to_string())
            .or_default()
            .environment = Some(environment.clone());
        Ok(())
    }

    async fn delete_target(&self, target_id: &str) -> PreflightResult<()> {
        let mut targets = self.targets.write().map_err(lock_poisoned)?;
        targets.remove(target_id);
        Ok(())
    }
}
