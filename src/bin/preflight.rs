use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use preflight_sandbox::{
    ActorContext, AppConfig, Environment, ExecutionOrchestrator, GrantAuthorizer, HttpDispatcher,
    MemoryStore, OutgoingRequest, StaticAnalyzer, TemplateEngine,
};

const CLI_ACTOR: &str = "cli";
const CLI_TARGET: &str = "cli";

#[derive(Parser, Debug)]
#[command(name = "preflight", version, about = "Validate and run preflight scripts")]
struct Cli {
    /// TOML configuration file; `PREFLIGHT_*` variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report syntax errors and blocked constructs
    Check {
        script: PathBuf,
    },
    /// Run a script and print its console output and resulting environment
    Run {
        script: PathBuf,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Run a script, then POST the substituted request to `url`
    Send {
        script: PathBuf,
        url: String,
        /// Request body
        #[arg(long)]
        body: Option<String>,
        #[command(flatten)]
        request: RequestArgs,
    },
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// Environment as a JSON object, or a path to a file containing one
    #[arg(long)]
    env: Option<String>,
    /// Header template as `name:value`; may be repeated
    #[arg(long = "header", short = 'H')]
    headers: Vec<String>,
}

impl RequestArgs {
    fn environment(&self) -> Result<Environment> {
        let Some(env) = &self.env else {
            return Ok(Environment::new());
        };
        let path = Path::new(env);
        let text = if path.is_file() {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read environment file {}", path.display()))?
        } else {
            env.clone()
        };
        Ok(Environment::from_json_str(&text)?)
    }

    fn request(&self, url: &str) -> Result<OutgoingRequest> {
        let mut request = OutgoingRequest::new(url);
        for header in &self.headers {
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| anyhow!("Header '{}' is not in name:value form", header))?;
            request = request.with_header(name.trim(), value.trim_start());
        }
        Ok(request)
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))
}

fn check(config: &AppConfig, script: &Path) -> Result<bool> {
    let source = read_script(script)?;
    let analyzer = StaticAnalyzer::new(config.sandbox.max_source_len);
    if let Err(e) = analyzer.validate(&source) {
        if !e.is_validation() {
            return Err(e.into());
        }
        // Report every diagnostic, not just the first
        let diagnostics = analyzer.analyze(&source);
        if diagnostics.is_empty() {
            println!("{}", e);
        }
        for diagnostic in diagnostics {
            println!("{}:{}", script.display(), diagnostic);
        }
        return Ok(false);
    }
    println!("{}: ok", script.display());
    Ok(true)
}

async fn run(config: &AppConfig, script: &Path, args: &RequestArgs) -> Result<bool> {
    let source = read_script(script)?;
    let environment = args.environment()?;
    let orchestrator = ExecutionOrchestrator::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(GrantAuthorizer::new()),
        Arc::new(HttpDispatcher::new(&config.fetch)?),
    );

    let report = orchestrator.preview(&source, environment.clone()).await?;
    for entry in &report.logs {
        println!("{}", entry.display_with_location());
    }
    let success = report.is_success();
    let effective = if success {
        report.environment_after.get()
    } else {
        environment
    };
    if let Some(error) = &report.error {
        eprintln!("{}", error);
    }
    println!("{}", serde_json::to_string_pretty(&effective)?);

    let templates = TemplateEngine::new(config.substitution.null_rendering);
    let request = args.request("")?;
    let headers = templates.substitute_headers(&request.headers, &effective.into());
    for (name, value) in headers {
        println!("{}: {}", name, value);
    }
    Ok(success)
}

async fn send(
    config: &AppConfig,
    script: &Path,
    url: &str,
    body: Option<String>,
    args: &RequestArgs,
) -> Result<bool> {
    let source = read_script(script)?;
    let authorizer = GrantAuthorizer::new();
    authorizer.grant(ActorContext::admin(CLI_ACTOR))?;
    let orchestrator = ExecutionOrchestrator::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(authorizer),
        Arc::new(HttpDispatcher::new(&config.fetch)?),
    );

    orchestrator
        .save_environment(CLI_ACTOR, CLI_TARGET, args.environment()?)
        .await?;
    orchestrator.save(CLI_ACTOR, CLI_TARGET, &source).await?;

    let mut request = args.request(url)?;
    if let Some(body) = body {
        request = request.with_body(body);
    }
    let outcome = orchestrator
        .run_before_request(CLI_TARGET, request, None)
        .await?;

    for entry in &outcome.logs {
        eprintln!("{}", entry.display_with_location());
    }
    if let Some(error) = &outcome.error {
        eprintln!("{}", error);
    }
    for key in &outcome.unresolved {
        eprintln!("warning: no environment value for '{{{{{}}}}}'", key);
    }
    info!(status = outcome.response.status, run = ?outcome.run, "Request sent");
    println!("{}", outcome.response.body);
    Ok((200..300).contains(&outcome.response.status))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config);

    let ok = match &cli.command {
        Command::Check { script } => check(&config, script)?,
        Command::Run { script, request } => run(&config, script, request).await?,
        Command::Send {
            script,
            url,
            body,
            request,
        } => send(&config, script, url, body.clone(), request).await?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
