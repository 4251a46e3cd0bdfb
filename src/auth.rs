//! Authorization boundary for script edits.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::error::{PreflightError, PreflightResult};

/// Action checked before every script or environment write
pub const MODIFY_PREFLIGHT_SCRIPT: &str = "laboratory:modifyPreflightScript";

#[cfg_attr(test, mockall::automock)]
pub trait ScriptAuthorizer: Send + Sync {
    /// `Ok` if `actor_id` may change the preflight script of `target_id`
    fn assert_can_modify_script(&self, actor_id: &str, target_id: &str) -> PreflightResult<()>;
}

/// Which targets a grant covers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetScope {
    Target(String),
    All,
}

/// Capabilities of one actor
#[derive(Debug, Clone, Default)]
pub struct ActorContext {
    pub actor_id: String,
    pub scopes: HashSet<TargetScope>,
}

impl ActorContext {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            scopes: HashSet::new(),
        }
    }

    /// An actor allowed to modify every target
    pub fn admin(actor_id: impl Into<String>) -> Self {
        Self::new(actor_id).with_scope(TargetScope::All)
    }

    pub fn with_scope(mut self, scope: TargetScope) -> Self {
        self.scopes.insert(scope);
        self
    }

    pub fn can_modify(&self, target_id: &str) -> bool {
        self.scopes.contains(&TargetScope::All)
            || self
                .scopes
                .contains(&TargetScope::Target(target_id.to_string()))
    }

    pub fn require_modify(&self, target_id: &str) -> PreflightResult<()> {
        if self.can_modify(target_id) {
            Ok(())
        } else {
            Err(PreflightError::Unauthorized {
                actor_id: self.actor_id.clone(),
                target_id: target_id.to_string(),
            })
        }
    }
}

/// Grant table kept in memory; unknown actors may modify nothing
#[derive(Debug, Default)]
pub struct GrantAuthorizer {
    actors: RwLock<HashMap<String, ActorContext>>,
}

impl GrantAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, actor: ActorContext) -> PreflightResult<()> {
        let mut actors = self.actors.write().map_err(|e| {
            PreflightError::persistence(format!("Grant table lock poisoned: {}", e))
        })?;
        actors
            .entry(actor.actor_id.clone())
            .and_modify(|existing| existing.scopes.extend(actor.scopes.iter().cloned()))
            .or_insert(actor);
        Ok(())
    }

    pub fn revoke(&self, actor_id: &str) -> PreflightResult<()> {
        let mut actors = self.actors.write().map_err(|e| {
            PreflightError::persistence(format!("Grant table lock poisoned: {}", e))
        })?;
        actors.remove(actor_id);
        Ok(())
    }
}

impl ScriptAuthorizer for GrantAuthorizer {
    fn assert_can_modify_script(&self, actor_id: &str, target_id: &str) -> PreflightResult<()> {
        let actors = self.actors.read().map_err(|e| {
            PreflightError::persistence(format!("Grant table lock poisoned: {}", e))
        })?;
        match actors.get(actor_id) {
            Some(actor) => actor.require_modify(target_id),
            None => Err(PreflightError::Unauthorized {
                actor_id: actor_id.to_string(),
                target_id: target_id.to_string(),
            }),
        }
    }
}
