//! Preflight scripts for GraphQL console requests.
//!
//! A preflight script is a short piece of JavaScript that runs before each
//! request of a target. It may read and write a per-target environment of
//! scalars and fetch remote values; the committed environment is then
//! substituted into `{{key}}` placeholders of the outgoing request headers.
//!
//! The pieces, bottom-up:
//! - [`analyzer`] rejects unparsable sources and dangerous constructs
//! - [`environment`] holds committed environments and run-local overlays
//! - [`sandbox`] runs a script in a locked-down QuickJS context
//! - [`template`] substitutes placeholders
//! - [`persistence`], [`auth`] and [`dispatcher`] are the outer boundaries
//! - [`orchestrator`] ties a run to its commit and dispatch

pub mod analyzer;
pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod environment;
pub mod error;
pub mod http_client;
pub mod orchestrator;
pub mod persistence;
pub mod sandbox;
pub mod template;

pub use analyzer::StaticAnalyzer;
pub use auth::{ActorContext, GrantAuthorizer, ScriptAuthorizer, TargetScope};
pub use config::AppConfig;
pub use dispatcher::{DispatchResponse, HttpDispatcher, OutgoingRequest, RequestDispatcher};
pub use environment::{Environment, EnvironmentSnapshot, EnvironmentStore};
pub use error::{Diagnostic, DiagnosticKind, PreflightError, PreflightResult};
pub use orchestrator::{ExecutionOrchestrator, PreflightOutcome, RunPhase, ScriptRun};
pub use persistence::{MemoryStore, PgPreflightStore, PreflightScript, PreflightStore};
pub use sandbox::{
    AbortSignal, ExecutionReport, LogEntry, LogLevel, RequestContext, SandboxRuntime,
};
pub use template::{TemplateEngine, substitute};
