//! QuickJS-backed execution of preflight scripts.
//!
//! Each run gets a fresh `Runtime` and `Context` on a blocking thread. The
//! prelude (`prelude.js`) wraps the host functions from [`lab`] into the
//! script-visible `console`, `lab`, `fetch`, `setTimeout`, `btoa` and `atob`,
//! seals every route to a code-generating constructor and deletes all global
//! names outside [`globals::ALLOWED_GLOBALS`].

pub mod console;
pub mod globals;
pub mod lab;

use rquickjs::context::EvalOptions;
use rquickjs::{Context, Ctx, Function, Object, Runtime, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::analyzer::console_call_sites;
use crate::config::{AppConfig, FetchConfig, SandboxConfig};
use crate::environment::EnvironmentStore;
use crate::error::{Diagnostic, PreflightError, PreflightResult};

pub use console::{LogCollector, LogEntry, LogLevel};
use lab::HostState;

const PRELUDE: &str = include_str!("prelude.js");

/// Longest sleep between checks while waiting for a timer
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Extra time the async side waits for the engine thread after the budget
const ENGINE_GRACE: Duration = Duration::from_secs(1);

/// Cooperative cancellation flag shared with the engine thread
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancels the run when the awaiting future is dropped before completion
struct AbortOnDrop {
    signal: AbortSignal,
    armed: bool,
}

impl AbortOnDrop {
    fn new(signal: AbortSignal) -> Self {
        Self {
            signal,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            debug!("Preflight run abandoned, signalling engine thread");
            self.signal.cancel();
        }
    }
}

/// What the run is for; used for tracing only
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub target_id: Option<String>,
    pub url: Option<String>,
}

/// Result of one script run
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub logs: Vec<LogEntry>,
    /// Set when the script threw or ran out of time
    pub error: Option<Diagnostic>,
    /// Baseline plus every mutation the script made, committed or not
    pub environment_after: EnvironmentStore,
    pub duration_ms: u64,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Runs scripts against a restricted global scope
#[derive(Debug, Clone)]
pub struct SandboxRuntime {
    limits: SandboxConfig,
    fetch: FetchConfig,
}

impl SandboxRuntime {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            limits: config.sandbox.clone(),
            fetch: config.fetch.clone(),
        }
    }

    pub fn limits(&self) -> &SandboxConfig {
        &self.limits
    }

    /// Execute `source` against `environment`.
    ///
    /// Thrown values and timeouts are reported in [`ExecutionReport::error`];
    /// only engine failures and cancellation are `Err`. The source is
    /// expected to have passed the analyzer already.
    pub async fn execute(
        &self,
        source: &str,
        environment: EnvironmentStore,
        request: RequestContext,
        abort: Option<AbortSignal>,
    ) -> PreflightResult<ExecutionReport> {
        let run_signal = AbortSignal::new();
        let guard = AbortOnDrop::new(run_signal.clone());

        let mut signals = vec![run_signal.clone()];
        signals.extend(abort);
        let job = EngineJob {
            source: source.to_string(),
            environment: environment.clone(),
            limits: self.limits.clone(),
            fetch: self.fetch.clone(),
            signals,
        };

        debug!(
            target_id = ?request.target_id,
            url = ?request.url,
            timeout_ms = self.limits.timeout_ms,
            "Starting preflight script"
        );

        let handle = tokio::task::spawn_blocking(move || job.run());
        let result = match timeout(self.limits.timeout() + ENGINE_GRACE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!("Preflight script task failed: {}", e);
                Err(PreflightError::engine(format!("Task execution error: {}", e)))
            }
            Err(_) => {
                warn!(
                    target_id = ?request.target_id,
                    timeout_ms = self.limits.timeout_ms,
                    "Engine thread did not stop within its budget"
                );
                run_signal.cancel();
                Ok(ExecutionReport {
                    logs: Vec::new(),
                    error: Some(Diagnostic::timeout(self.limits.timeout_ms)),
                    environment_after: environment,
                    duration_ms: (self.limits.timeout() + ENGINE_GRACE).as_millis() as u64,
                })
            }
        };

        guard.disarm();
        if let Ok(report) = &result {
            debug!(
                target_id = ?request.target_id,
                duration_ms = report.duration_ms,
                log_entries = report.logs.len(),
                success = report.is_success(),
                "Preflight script finished"
            );
        }
        result
    }
}

/// Deadline and cancellation flags, checked by the interrupt handler and the
/// event loop
#[derive(Debug, Clone)]
struct RunLimits {
    deadline: Instant,
    signals: Vec<AbortSignal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Cancelled,
    Timeout,
}

impl RunLimits {
    fn should_interrupt(&self) -> bool {
        self.check().is_err()
    }

    fn check(&self) -> Result<(), Stop> {
        if self.signals.iter().any(AbortSignal::is_cancelled) {
            Err(Stop::Cancelled)
        } else if Instant::now() >= self.deadline {
            Err(Stop::Timeout)
        } else {
            Ok(())
        }
    }

    /// Sleep until `due`, waking up to notice cancellation and the deadline
    fn wait_until(&self, due: Instant) -> Result<(), Stop> {
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= due {
                return Ok(());
            }
            let nap = (due - now)
                .min(self.deadline.saturating_duration_since(now))
                .min(POLL_INTERVAL);
            std::thread::sleep(nap);
        }
    }
}

/// How the script's top level ended
enum Finish {
    Completed,
    Threw {
        name: String,
        message: String,
        stack: String,
    },
    Stopped(Stop),
}

/// Everything the engine thread needs, moved into `spawn_blocking`
struct EngineJob {
    source: String,
    environment: EnvironmentStore,
    limits: SandboxConfig,
    fetch: FetchConfig,
    signals: Vec<AbortSignal>,
}

impl EngineJob {
    fn run(self) -> PreflightResult<ExecutionReport> {
        let started = Instant::now();
        let run_limits = RunLimits {
            deadline: started + self.limits.timeout(),
            signals: self.signals,
        };

        let runtime = Runtime::new()
            .map_err(|e| PreflightError::engine(format!("Runtime creation error: {}", e)))?;
        runtime.set_memory_limit(self.limits.memory_limit_mb * 1024 * 1024);
        runtime.set_max_stack_size(self.limits.max_stack_kb * 1024);
        let interrupt_limits = run_limits.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || {
            interrupt_limits.should_interrupt()
        })));

        let context = Context::full(&runtime)
            .map_err(|e| PreflightError::engine(format!("Context creation error: {}", e)))?;

        let state = Rc::new(RefCell::new(HostState::new(
            self.environment,
            LogCollector::new(self.limits.max_log_entries),
            run_limits.deadline,
            self.limits.non_primitive_values,
            self.fetch,
        )));

        let finish = match context.with(|ctx| drive(&ctx, &self.source, &state, &run_limits)) {
            Ok(finish) => finish,
            // Interrupted before the script itself started
            Err(e) => match run_limits.check() {
                Err(stop) => Finish::Stopped(stop),
                Ok(()) => {
                    error!("Preflight sandbox failure: {}", e);
                    return Err(e);
                }
            },
        };

        let (environment_after, mut logs) = {
            let mut state = state.borrow_mut();
            state.clear_timers();
            (
                std::mem::take(&mut state.environment),
                std::mem::take(&mut state.logs),
            )
        };

        let error = match finish {
            Finish::Completed => None,
            Finish::Threw {
                name,
                message,
                stack,
            } => {
                let location = console::script_location(&stack);
                debug!(name = %name, message = %message, "Preflight script threw");
                let diagnostic = Diagnostic::runtime_throw(
                    format!("{}: {}", name, message),
                    location.map(|(line, _)| line),
                    location.and_then(|(_, column)| column),
                );
                logs.push(LogEntry::thrown(name, message).with_location(location));
                Some(diagnostic)
            }
            Finish::Stopped(Stop::Timeout) => {
                warn!(
                    timeout_ms = self.limits.timeout_ms,
                    "Preflight script timed out"
                );
                Some(Diagnostic::timeout(self.limits.timeout_ms))
            }
            Finish::Stopped(Stop::Cancelled) => return Err(PreflightError::Cancelled),
        };

        let call_sites = console_call_sites(&self.source);
        let logs = logs
            .into_entries()
            .into_iter()
            .map(|mut entry| {
                if entry.level != LogLevel::Thrown
                    && let Some(line) = entry.line
                {
                    let (line, column) = console::anchor_to_call((line, entry.column), &call_sites);
                    entry.line = Some(line);
                    entry.column = column;
                }
                entry
            })
            .collect();

        Ok(ExecutionReport {
            logs,
            error,
            environment_after,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Install the sandbox, evaluate the script and run its jobs and timers until
/// the top level settles
fn drive<'js>(
    ctx: &Ctx<'js>,
    source: &str,
    state: &Rc<RefCell<HostState>>,
    limits: &RunLimits,
) -> PreflightResult<Finish> {
    let install: Function = ctx
        .eval(PRELUDE)
        .map_err(|e| engine_failure(ctx, "prelude evaluation", e))?;
    let host = lab::host_object(ctx, state).map_err(|e| engine_failure(ctx, "host setup", e))?;
    let hooks: Object = install
        .call((globals::visible_globals(), host))
        .map_err(|e| engine_failure(ctx, "sandbox installation", e))?;
    let run_timer: Function = hooks
        .get("runTimer")
        .map_err(|e| engine_failure(ctx, "sandbox installation", e))?;
    let describe: Function = hooks
        .get("describe")
        .map_err(|e| engine_failure(ctx, "sandbox installation", e))?;
    let watch: Function = hooks
        .get("watch")
        .map_err(|e| engine_failure(ctx, "sandbox installation", e))?;

    let mut options = EvalOptions::default();
    options.promise = true;
    options.strict = true;
    let completion: Value = match ctx.eval_with_options(source, options) {
        Ok(completion) => completion,
        Err(rquickjs::Error::Exception) => return Ok(thrown(ctx, &describe, ctx.catch(), limits)),
        Err(e) => return Err(engine_failure(ctx, "script evaluation", e)),
    };
    let status: Object = match watch.call((completion,)) {
        Ok(status) => status,
        Err(rquickjs::Error::Exception) => return Ok(thrown(ctx, &describe, ctx.catch(), limits)),
        Err(e) => return Err(engine_failure(ctx, "script evaluation", e)),
    };

    loop {
        if let Err(stop) = limits.check() {
            return Ok(Finish::Stopped(stop));
        }
        if ctx.execute_pending_job() {
            continue;
        }

        let done: bool = status.get("done").unwrap_or(false);
        if done {
            if status.get("failed").unwrap_or(false) {
                let reason: Value = status
                    .get("reason")
                    .unwrap_or_else(|_| Value::new_undefined(ctx.clone()));
                return Ok(thrown(ctx, &describe, reason, limits));
            }
            // Timers still pending when the top level completes are dropped
            return Ok(Finish::Completed);
        }

        let next_timer = state.borrow_mut().pop_timer();
        let Some(timer) = next_timer else {
            // Nothing left that could settle the script
            debug!("Preflight script is waiting on a promise that can never settle");
            return Ok(Finish::Stopped(Stop::Timeout));
        };
        if let Err(stop) = limits.wait_until(timer.due) {
            return Ok(Finish::Stopped(stop));
        }
        match run_timer.call::<_, ()>((timer.id,)) {
            Ok(()) => {}
            Err(rquickjs::Error::Exception) => {
                return Ok(thrown(ctx, &describe, ctx.catch(), limits));
            }
            Err(e) => return Err(engine_failure(ctx, "timer callback", e)),
        }
    }
}

/// Turn an uncaught value into a [`Finish`], unless the run was interrupted
fn thrown<'js>(
    ctx: &Ctx<'js>,
    describe: &Function<'js>,
    reason: Value<'js>,
    limits: &RunLimits,
) -> Finish {
    if let Err(stop) = limits.check() {
        return Finish::Stopped(stop);
    }
    match describe.call::<_, Vec<String>>((reason,)) {
        Ok(parts) => {
            let mut parts = parts.into_iter();
            Finish::Threw {
                name: parts.next().unwrap_or_else(|| "Error".to_string()),
                message: parts.next().unwrap_or_default(),
                stack: parts.next().unwrap_or_default(),
            }
        }
        Err(_) => {
            // The value's own getters threw while being described
            let _ = ctx.catch();
            Finish::Threw {
                name: "Uncaught".to_string(),
                message: "(value could not be displayed)".to_string(),
                stack: String::new(),
            }
        }
    }
}

fn engine_failure(ctx: &Ctx<'_>, stage: &str, err: rquickjs::Error) -> PreflightError {
    let detail = match err {
        rquickjs::Error::Exception => ctx
            .catch()
            .as_exception()
            .and_then(|exception| exception.message())
            .unwrap_or_else(|| "unknown exception".to_string()),
        other => other.to_string(),
    };
    PreflightError::engine(format!("{} failed: {}", stage, detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use serde_json::json;

    fn runtime() -> SandboxRuntime {
        SandboxRuntime::new(&AppConfig::test_config())
    }

    async fn run(source: &str) -> ExecutionReport {
        runtime()
            .execute(
                source,
                EnvironmentStore::default(),
                RequestContext::default(),
                None,
            )
            .await
            .expect("run should not fail")
    }

    #[test]
    fn test_run_limits_report_cancellation_first() {
        let signal = AbortSignal::new();
        let limits = RunLimits {
            deadline: Instant::now(),
            signals: vec![signal.clone()],
        };
        assert_eq!(limits.check(), Err(Stop::Timeout));
        signal.cancel();
        assert_eq!(limits.check(), Err(Stop::Cancelled));
    }

    #[test]
    fn test_abort_on_drop_only_when_armed() {
        let signal = AbortSignal::new();
        AbortOnDrop::new(signal.clone()).disarm();
        assert!(!signal.is_cancelled());

        drop(AbortOnDrop::new(signal.clone()));
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_hello_world() {
        let report = run("console.log('Hello_world')").await;
        assert!(report.is_success());
        assert_eq!(report.logs.len(), 1);
        assert_eq!(report.logs[0].to_string(), "Log: Hello_world");
        assert_eq!(report.logs[0].line, Some(1));
    }

    #[tokio::test]
    async fn test_thrown_value_ends_run() {
        let report = run("console.info(1);\nthrow new TypeError('Test');\nconsole.log('never');").await;
        let rendered: Vec<String> = report.logs.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["Info: 1", "TypeError: Test"]);
        assert_eq!(report.logs[1].line, Some(2));
        let error = report.error.expect("throw is reported");
        assert_eq!(error.message, "TypeError: Test");
    }

    #[tokio::test]
    async fn test_environment_changes_are_returned() {
        let baseline = Environment::from_json(json!({"foo": 10})).unwrap();
        let report = runtime()
            .execute(
                "lab.environment.set('foo', lab.environment.get('foo') + 82)",
                EnvironmentStore::new(baseline),
                RequestContext::default(),
                None,
            )
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.environment_after.get_value("foo"), Some(&json!(92)));
        assert_eq!(
            report.environment_after.baseline().get("foo"),
            Some(&json!(10))
        );
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let mut config = AppConfig::test_config();
        config.sandbox.timeout_ms = 200;
        let report = SandboxRuntime::new(&config)
            .execute(
                "console.log('before'); while (true) {}",
                EnvironmentStore::default(),
                RequestContext::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.logs.len(), 1);
        let error = report.error.expect("timeout is reported");
        assert_eq!(error.kind, crate::error::DiagnosticKind::Timeout);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_is_cancelled() {
        let signal = AbortSignal::new();
        signal.cancel();
        let result = runtime()
            .execute(
                "console.log('x')",
                EnvironmentStore::default(),
                RequestContext::default(),
                Some(signal),
            )
            .await;
        assert!(matches!(result, Err(PreflightError::Cancelled)));
    }
}
