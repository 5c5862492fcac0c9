use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vaultgate::audit::AuditLog;
use vaultgate::catalog::{Catalog, InMemoryCatalog, Renderer, ResourceEntry};
use vaultgate::config::Config;
use vaultgate::error::RenderError;
use vaultgate::{FetchOutcome, Gateway, ManualClock, Purpose, RequestContext};

#[derive(Parser)]
#[command(
    name = "vaultgate",
    about = "Session and capability-token access control for protected media"
)]
pub struct Args {
    #[arg(long, help = "Config file path")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "VAULTGATE_TOKEN_TTL_MINUTES", help = "Override token lifetime")]
    pub token_ttl_minutes: Option<u64>,

    #[arg(
        long,
        env = "VAULTGATE_MAX_REQUESTS_PER_MINUTE",
        help = "Override per-identity rate limit"
    )]
    pub max_requests_per_minute: Option<usize>,

    #[arg(long, help = "Tolerate identity changes instead of evicting the session")]
    pub lenient_binding: bool,

    #[arg(long, env = "VAULTGATE_AUDIT", help = "Append decisions to this JSONL file")]
    pub audit: Option<PathBuf>,

    #[arg(long, help = "Verbose output (log every decision)")]
    pub verbose: bool,

    #[arg(long, help = "Debug output")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the effective configuration, or every validation error
    CheckConfig,
    /// Walk one client through session, listing, fetch and token expiry
    Demo {
        #[arg(long, default_value = "203.0.113.5")]
        identity: String,
        #[arg(long, default_value = "42")]
        resource: String,
        #[arg(long, help = "TOML catalog manifest ([[resource]] tables)")]
        catalog: Option<PathBuf>,
    },
}

/// Stands in for the watermark/thumbnail pipeline
struct PlaceholderRenderer;

impl Renderer for PlaceholderRenderer {
    fn render(&self, resource_id: &str, purpose: Purpose) -> Result<Vec<u8>, RenderError> {
        Ok(format!("[{}] {}", purpose, resource_id).into_bytes())
    }
}

fn init_logging(args: &Args) {
    let default = if args.debug {
        "vaultgate=debug"
    } else if args.verbose {
        "vaultgate=info"
    } else {
        "vaultgate=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<Config> {
    let mut cfg = if let Some(path) = &args.config {
        Config::load_from(path)?
    } else {
        Config::load()?
    };

    // Apply CLI overrides
    if let Some(ttl) = args.token_ttl_minutes {
        cfg.token.ttl_minutes = ttl;
    }
    if let Some(limit) = args.max_requests_per_minute {
        cfg.rate_limit.max_requests_per_minute = limit;
    }
    if args.lenient_binding {
        cfg.session.strict_identity_binding = false;
    }
    if args.audit.is_some() {
        cfg.audit.path = args.audit.clone();
    }

    if let Err(errors) = cfg.validate() {
        for e in &errors {
            eprintln!("Config error {}", e);
        }
        return Err(anyhow!("{} configuration error(s)", errors.len()));
    }
    Ok(cfg)
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(&args);

    let cfg = load_config(&args)?;

    match &args.command {
        Command::CheckConfig => {
            print!("{}", toml::to_string_pretty(&cfg)?);
            Ok(())
        }
        Command::Demo {
            identity,
            resource,
            catalog,
        } => run_demo(&cfg, identity, resource, catalog.as_ref()),
    }
}

fn print_step(step: &str, outcome: serde_json::Value) {
    println!("{}", json!({ "step": step, "outcome": outcome }));
}

fn describe(outcome: &FetchOutcome) -> serde_json::Value {
    match outcome {
        FetchOutcome::Rendered {
            resource_id,
            purpose,
            bytes,
        } => json!({ "granted": resource_id, "purpose": purpose, "bytes": bytes.len() }),
        FetchOutcome::Fallback {
            resource_id,
            message,
            ..
        } => json!({ "granted": resource_id, "fallback": message }),
        FetchOutcome::Denied(reason) => {
            json!({ "denied": reason, "status": reason.status_code() })
        }
    }
}

fn run_demo(
    cfg: &Config,
    identity: &str,
    resource: &str,
    catalog_path: Option<&PathBuf>,
) -> Result<()> {
    let catalog: Arc<dyn Catalog> = match catalog_path {
        Some(path) => Arc::new(InMemoryCatalog::load_from(path)?),
        None => Arc::new(InMemoryCatalog::new(vec![ResourceEntry::new(
            resource,
            "Demo resource",
        )])),
    };

    let mut gateway = Gateway::new(cfg, catalog, Arc::new(PlaceholderRenderer))
        .context("generating signing key")?;
    if let Some(path) = &cfg.audit.path {
        gateway = gateway.with_audit(AuditLog::open(path)?);
    }

    let clock = Arc::new(ManualClock::new(Utc::now()));
    let _sweeper = gateway.start_sweeper(clock.clone());

    let ticket = gateway
        .create_session(&RequestContext::new(identity, clock.as_ref()))
        .map_err(|reason| anyhow!("session refused: {}", reason))?;
    print_step("create_session", json!(ticket));

    let listing = gateway.list_resources(
        &RequestContext::new(identity, clock.as_ref()).with_session(ticket.session_id.clone()),
    );
    print_step(
        "list",
        json!({ "session_id": listing.session_id, "resources": listing.resources.len() }),
    );

    let Some(entry) = listing.resources.iter().find(|r| r.entry.id == resource) else {
        return Err(anyhow!("resource {} is not in the catalog", resource));
    };
    let token_of = |url: &str| url.split_once("?token=").map(|(_, t)| t.to_string());
    let view_token = token_of(&entry.url).context("listing url without token")?;
    let thumb_token = token_of(&entry.thumbnail_url).context("listing url without token")?;

    let fetch = |token: &str, purpose| {
        gateway.fetch(
            &RequestContext::new(identity, clock.as_ref()).with_token(token),
            resource,
            purpose,
        )
    };

    print_step("fetch_view", describe(&fetch(&view_token, Purpose::View)));
    print_step(
        "fetch_view_with_thumbnail_token",
        describe(&fetch(&thumb_token, Purpose::View)),
    );

    clock.advance(cfg.token.ttl() + Duration::seconds(1));
    print_step(
        "fetch_view_after_expiry",
        describe(&fetch(&view_token, Purpose::View)),
    );

    print_step("stats", json!(gateway.stats()));
    Ok(())
}
