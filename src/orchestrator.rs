//! Coordinates validation, execution, commit, substitution and dispatch of
//! preflight scripts, one target at a time.

use indexmap::IndexSet;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::analyzer::StaticAnalyzer;
use crate::auth::ScriptAuthorizer;
use crate::config::AppConfig;
use crate::dispatcher::{DispatchResponse, OutgoingRequest, RequestDispatcher};
use crate::environment::{Environment, EnvironmentSnapshot, EnvironmentStore};
use crate::error::{Diagnostic, PreflightError, PreflightResult};
use crate::persistence::{PreflightScript, PreflightStore};
use crate::sandbox::{AbortSignal, ExecutionReport, LogEntry, RequestContext, SandboxRuntime};
use crate::template::TemplateEngine;

/// Where a target currently is in its run cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    Validating,
    Running,
    Committing,
    /// The last save or run was refused by validation
    Rejected,
}

/// What happened to the script during a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptRun {
    /// No script stored for the target, or the script is disabled
    Skipped,
    /// The stored script failed validation and was not executed
    Rejected { message: String },
    /// The script completed and its environment became the new baseline
    Committed,
    /// The script threw or timed out; its changes were thrown away
    Discarded,
}

/// Result of [`ExecutionOrchestrator::run_before_request`]
#[derive(Debug, Clone)]
pub struct PreflightOutcome {
    pub run: ScriptRun,
    pub logs: Vec<LogEntry>,
    /// Runtime failure of the script, if any
    pub error: Option<Diagnostic>,
    /// Environment the request was substituted with
    pub environment: Environment,
    /// The request as dispatched
    pub request: OutgoingRequest,
    /// Placeholders left literal because their key was missing
    pub unresolved: IndexSet<String>,
    pub response: DispatchResponse,
}

#[derive(Debug)]
struct TargetSession {
    enabled: bool,
    /// Committed environment, loaded from the store on first use
    baseline: Option<EnvironmentSnapshot>,
}

#[derive(Debug)]
struct TargetEntry {
    /// Held for a whole validate/run/commit cycle, so runs on one target
    /// never overlap
    session: tokio::sync::Mutex<TargetSession>,
    phase: Mutex<RunPhase>,
}

impl TargetEntry {
    fn new() -> Self {
        Self {
            session: tokio::sync::Mutex::new(TargetSession {
                enabled: true,
                baseline: None,
            }),
            phase: Mutex::new(RunPhase::Idle),
        }
    }

    fn set_phase(&self, phase: RunPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    fn phase(&self) -> RunPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Returns the target to `Idle` when a cycle ends, including when the
/// awaiting future is dropped. `Rejected` is kept until the next cycle.
struct PhaseGuard<'a> {
    entry: &'a TargetEntry,
}

impl<'a> PhaseGuard<'a> {
    fn enter(entry: &'a TargetEntry, phase: RunPhase) -> Self {
        entry.set_phase(phase);
        Self { entry }
    }

    fn advance(&self, phase: RunPhase) {
        self.entry.set_phase(phase);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if self.entry.phase() != RunPhase::Rejected {
            self.entry.set_phase(RunPhase::Idle);
        }
    }
}

pub struct ExecutionOrchestrator {
    analyzer: StaticAnalyzer,
    sandbox: SandboxRuntime,
    templates: TemplateEngine,
    store: Arc<dyn PreflightStore>,
    authorizer: Arc<dyn ScriptAuthorizer>,
    dispatcher: Arc<dyn RequestDispatcher>,
    targets: Mutex<HashMap<String, Arc<TargetEntry>>>,
}

impl ExecutionOrchestrator {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn PreflightStore>,
        authorizer: Arc<dyn ScriptAuthorizer>,
        dispatcher: Arc<dyn RequestDispatcher>,
    ) -> Self {
        Self {
            analyzer: StaticAnalyzer::new(config.sandbox.max_source_len),
            sandbox: SandboxRuntime::new(config),
            templates: TemplateEngine::new(config.substitution.null_rendering),
            store,
            authorizer,
            dispatcher,
            targets: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, target_id: &str) -> PreflightResult<Arc<TargetEntry>> {
        let mut targets = self.targets.lock().map_err(|e| {
            PreflightError::persistence(format!("Target registry lock poisoned: {}", e))
        })?;
        Ok(Arc::clone(
            targets
                .entry(target_id.to_string())
                .or_insert_with(|| Arc::new(TargetEntry::new())),
        ))
    }

    /// Entry of a target that has been written to or run, without creating one
    fn existing(&self, target_id: &str) -> PreflightResult<Option<Arc<TargetEntry>>> {
        let targets = self.targets.lock().map_err(|e| {
            PreflightError::persistence(format!("Target registry lock poisoned: {}", e))
        })?;
        Ok(targets.get(target_id).cloned())
    }

    async fn baseline(
        &self,
        session: &mut TargetSession,
        target_id: &str,
    ) -> PreflightResult<EnvironmentSnapshot> {
        if let Some(baseline) = &session.baseline {
            return Ok(baseline.clone());
        }
        let baseline: EnvironmentSnapshot = self.store.load_environment(target_id).await?.into();
        session.baseline = Some(baseline.clone());
        Ok(baseline)
    }

    /// Current phase of `target_id`
    pub fn phase(&self, target_id: &str) -> PreflightResult<RunPhase> {
        Ok(self
            .existing(target_id)?
            .map(|entry| entry.phase())
            .unwrap_or_default())
    }

    /// Validate and store a script. Never executes it.
    pub async fn save(
        &self,
        actor_id: &str,
        target_id: &str,
        source: &str,
    ) -> PreflightResult<PreflightScript> {
        let entry = self.entry(target_id)?;
        let _session = entry.session.lock().await;
        let phase = PhaseGuard::enter(&entry, RunPhase::Validating);

        if let Err(e) = self.analyzer.validate(source) {
            phase.advance(RunPhase::Rejected);
            warn!(target_id, actor_id, code = e.code(), "Rejected preflight script: {}", e);
            return Err(e);
        }
        self.authorizer
            .assert_can_modify_script(actor_id, target_id)?;

        let script = self
            .store
            .upsert_script(target_id, source, Some(actor_id))
            .await?;
        info!(target_id, actor_id, script_id = %script.id, "Saved preflight script");
        Ok(script)
    }

    /// Replace the committed environment of a target (the environment editor)
    pub async fn save_environment(
        &self,
        actor_id: &str,
        target_id: &str,
        environment: Environment,
    ) -> PreflightResult<()> {
        self.authorizer
            .assert_can_modify_script(actor_id, target_id)?;

        let entry = self.entry(target_id)?;
        let mut session = entry.session.lock().await;
        self.store.save_environment(target_id, &environment).await?;
        session.baseline = Some(environment.into());
        info!(target_id, actor_id, "Saved preflight environment");
        Ok(())
    }

    /// Stored script and committed environment of a target
    pub async fn load(
        &self,
        target_id: &str,
    ) -> PreflightResult<(Option<PreflightScript>, Environment)> {
        let Some(entry) = self.existing(target_id)? else {
            let script = self.store.load_script(target_id).await?;
            let environment = self.store.load_environment(target_id).await?;
            return Ok((script, environment));
        };
        let mut session = entry.session.lock().await;
        let script = self.store.load_script(target_id).await?;
        let baseline = self.baseline(&mut session, target_id).await?;
        Ok((script, baseline.as_environment().clone()))
    }

    /// Turn the script on or off for later requests; stored data is kept
    pub async fn set_enabled(&self, target_id: &str, enabled: bool) -> PreflightResult<()> {
        let entry = self.entry(target_id)?;
        entry.session.lock().await.enabled = enabled;
        debug!(target_id, enabled, "Preflight script toggled");
        Ok(())
    }

    pub async fn is_enabled(&self, target_id: &str) -> PreflightResult<bool> {
        match self.existing(target_id)? {
            Some(entry) => Ok(entry.session.lock().await.enabled),
            None => Ok(true),
        }
    }

    /// Remove everything stored for a deleted target.
    ///
    /// The entry itself stays registered so callers already queued on its
    /// lock keep serializing with later runs; it is reset to a fresh state.
    pub async fn delete_target(&self, actor_id: &str, target_id: &str) -> PreflightResult<()> {
        self.authorizer
            .assert_can_modify_script(actor_id, target_id)?;

        let entry = self.entry(target_id)?;
        let mut session = entry.session.lock().await;
        self.store.delete_target(target_id).await?;
        session.baseline = None;
        session.enabled = true;
        entry.set_phase(RunPhase::Idle);
        info!(target_id, actor_id, "Deleted preflight target");
        Ok(())
    }

    /// Validate and run `source` against `environment` without committing
    /// anything or dispatching a request
    pub async fn preview(
        &self,
        source: &str,
        environment: Environment,
    ) -> PreflightResult<ExecutionReport> {
        self.analyzer.validate(source)?;
        self.sandbox
            .execute(
                source,
                EnvironmentStore::new(environment),
                RequestContext::default(),
                None,
            )
            .await
    }

    /// Run the target's script (when present and enabled), commit its
    /// environment on success, substitute the request headers and dispatch.
    ///
    /// Script failures do not fail the request: it is dispatched with the
    /// pre-run environment. Cancellation (dropping the future, or `abort`)
    /// commits nothing and dispatches nothing.
    pub async fn run_before_request(
        &self,
        target_id: &str,
        request: OutgoingRequest,
        abort: Option<AbortSignal>,
    ) -> PreflightResult<PreflightOutcome> {
        let entry = self.entry(target_id)?;
        let mut session = entry.session.lock().await;
        let baseline = self.baseline(&mut session, target_id).await?;

        let script = if session.enabled {
            self.store.load_script(target_id).await?
        } else {
            None
        };
        let Some(script) = script else {
            drop(session);
            return self
                .finish(request, baseline, ScriptRun::Skipped, Vec::new(), None)
                .await;
        };

        let phase = PhaseGuard::enter(&entry, RunPhase::Validating);
        if let Err(e) = self.analyzer.validate(&script.source_code) {
            phase.advance(RunPhase::Rejected);
            warn!(target_id, code = e.code(), "Stored preflight script failed validation: {}", e);
            drop(phase);
            drop(session);
            let run = ScriptRun::Rejected {
                message: e.to_string(),
            };
            return self.finish(request, baseline, run, Vec::new(), None).await;
        }

        phase.advance(RunPhase::Running);
        let context = RequestContext {
            target_id: Some(target_id.to_string()),
            url: Some(request.url.clone()),
        };
        let report = self
            .sandbox
            .execute(
                &script.source_code,
                EnvironmentStore::new(baseline.clone()),
                context,
                abort,
            )
            .await?;

        let (environment, run) = if report.is_success() {
            phase.advance(RunPhase::Committing);
            let dirty = report.environment_after.is_dirty();
            let committed: EnvironmentSnapshot = report.environment_after.get().into();
            if dirty {
                self.store
                    .save_environment(target_id, committed.as_environment())
                    .await?;
                session.baseline = Some(committed.clone());
            }
            info!(
                target_id,
                changed = dirty,
                duration_ms = report.duration_ms,
                "Committed preflight environment"
            );
            (committed, ScriptRun::Committed)
        } else {
            warn!(
                target_id,
                error = ?report.error,
                "Preflight script failed, using the previous environment"
            );
            (baseline, ScriptRun::Discarded)
        };
        drop(phase);
        drop(session);

        self.finish(request, environment, run, report.logs, report.error)
            .await
    }

    async fn finish(
        &self,
        request: OutgoingRequest,
        environment: EnvironmentSnapshot,
        run: ScriptRun,
        logs: Vec<LogEntry>,
        error: Option<Diagnostic>,
    ) -> PreflightResult<PreflightOutcome> {
        let mut unresolved = IndexSet::new();
        let headers = request
            .headers
            .iter()
            .map(|(name, value)| {
                let result = self.templates.substitute(value, &environment);
                unresolved.extend(result.unresolved);
                (name.clone(), result.value)
            })
            .collect();
        let substituted = OutgoingRequest { headers, ..request };

        let response = self.dispatcher.dispatch(substituted.clone()).await?;
        Ok(PreflightOutcome {
            run,
            logs,
            error,
            environment: environment.as_environment().clone(),
            request: substituted,
            unresolved,
            response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MockScriptAuthorizer;
    use crate::dispatcher::MockRequestDispatcher;
    use crate::persistence::MemoryStore;
    use serde_json::json;

    fn ok_response() -> DispatchResponse {
        DispatchResponse {
            status: 200,
            body: "{}".to_string(),
        }
    }

    fn allow_all() -> MockScriptAuthorizer {
        let mut authorizer = MockScriptAuthorizer::new();
        authorizer
            .expect_assert_can_modify_script()
            .returning(|_, _| Ok(()));
        authorizer
    }

    fn orchestrator(
        store: Arc<MemoryStore>,
        authorizer: MockScriptAuthorizer,
        dispatcher: MockRequestDispatcher,
    ) -> ExecutionOrchestrator {
        ExecutionOrchestrator::new(
            &AppConfig::test_config(),
            store,
            Arc::new(authorizer),
            Arc::new(dispatcher),
        )
    }

    #[tokio::test]
    async fn test_save_rejects_before_authorizing() {
        let mut authorizer = MockScriptAuthorizer::new();
        authorizer.expect_assert_can_modify_script().never();
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone(), authorizer, MockRequestDispatcher::new());

        let result = orchestrator.save("alice", "t1", "eval('1')").await;
        assert!(matches!(result, Err(PreflightError::SecurityViolation(_))));
        assert_eq!(orchestrator.phase("t1").unwrap(), RunPhase::Rejected);
        assert!(store.load_script("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unauthorized_save_stores_nothing() {
        let mut authorizer = MockScriptAuthorizer::new();
        authorizer
            .expect_assert_can_modify_script()
            .times(1)
            .returning(|actor, target| {
                Err(PreflightError::Unauthorized {
                    actor_id: actor.to_string(),
                    target_id: target.to_string(),
                })
            });
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone(), authorizer, MockRequestDispatcher::new());

        let result = orchestrator.save("mallory", "t1", "console.log(1)").await;
        assert!(matches!(result, Err(PreflightError::Unauthorized { .. })));
        assert!(store.load_script("t1").await.unwrap().is_none());
        assert_eq!(orchestrator.phase("t1").unwrap(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_dispatcher_receives_substituted_headers() {
        let mut dispatcher = MockRequestDispatcher::new();
        dispatcher
            .expect_dispatch()
            .times(1)
            .withf(|request| request.headers.get("x-foo").map(String::as_str) == Some("92"))
            .returning(|_| Ok(ok_response()));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone(), allow_all(), dispatcher);

        orchestrator
            .save_environment("alice", "t1", Environment::from_json(json!({"foo": 10})).unwrap())
            .await
            .unwrap();
        orchestrator
            .save("alice", "t1", "lab.environment.set('foo', 92)")
            .await
            .unwrap();

        let request = OutgoingRequest::new("http://localhost/graphql").with_header("x-foo", "{{foo}}");
        let outcome = orchestrator.run_before_request("t1", request, None).await.unwrap();

        assert_eq!(outcome.run, ScriptRun::Committed);
        assert_eq!(
            store.load_environment("t1").await.unwrap().get("foo"),
            Some(&json!(92))
        );
        assert_eq!(orchestrator.phase("t1").unwrap(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_read_only_accessors_do_not_register_targets() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store, allow_all(), MockRequestDispatcher::new());

        for i in 0..10 {
            let target_id = format!("unknown-{}", i);
            assert_eq!(orchestrator.phase(&target_id).unwrap(), RunPhase::Idle);
            assert!(orchestrator.is_enabled(&target_id).await.unwrap());
            let (script, environment) = orchestrator.load(&target_id).await.unwrap();
            assert!(script.is_none());
            assert!(environment.is_empty());
        }
        assert!(orchestrator.targets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_resets_cached_session() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store, allow_all(), MockRequestDispatcher::new());

        orchestrator
            .save_environment("alice", "t1", Environment::from_json(json!({"foo": 10})).unwrap())
            .await
            .unwrap();
        orchestrator.set_enabled("t1", false).await.unwrap();
        orchestrator.delete_target("alice", "t1").await.unwrap();

        let entry = orchestrator.existing("t1").unwrap().expect("entry is kept");
        let session = entry.session.lock().await;
        assert!(session.enabled);
        assert!(session.baseline.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_error_is_propagated() {
        let mut dispatcher = MockRequestDispatcher::new();
        dispatcher.expect_dispatch().returning(|_| {
            Err(PreflightError::Dispatch {
                message: "connection refused".to_string(),
            })
        });
        let orchestrator = orchestrator(Arc::new(MemoryStore::new()), allow_all(), dispatcher);

        let result = orchestrator
            .run_before_request("t1", OutgoingRequest::new("http://localhost"), None)
            .await;
        assert!(matches!(result, Err(PreflightError::Dispatch { .. })));
    }
}
