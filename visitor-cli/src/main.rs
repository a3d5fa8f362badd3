//! visitor-id - inspect and drive the visitor identity from a terminal.
//!
//! Every command initializes the process-wide manager from a TOML config,
//! which acquires an identity when none is persisted, then acts on it.

use std::path::PathBuf;
use std::sync::mpsc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use visitor_core::config::CONFIG_PATH_ENV;
use visitor_core::{AuthState, IdentityRecord, VisitorConfig, VisitorError, VisitorResult};
use visitor_engine::{ConsumerFacade, IdentityManager, LinkCallback};

const DEFAULT_STORAGE_PATH: &str = "visitor-id.json";
const DEFAULT_LOG_FILTER: &str = "visitor_engine=info,visitor_client=info,warn";

#[derive(Parser)]
#[command(name = "visitor-id")]
#[command(about = "Visitor identity acquisition and decoration", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current identity without waiting
    Show,

    /// Wait for an identity and print it
    Resolve,

    /// Append the identity parameter to a URL
    Decorate { url: String },

    /// Link a known identifier to the current identity
    Link {
        known_id: String,
        data_provider_id: i64,
        /// unknown, authenticated or logged-out
        auth_state: Option<AuthState>,
    },

    /// Forget the identity and its persisted copy
    Reset,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

fn print_record(record: Option<&IdentityRecord>) -> VisitorResult<()> {
    match record {
        Some(record) => {
            let json = serde_json::to_string_pretty(record).map_err(|e| VisitorError::Runtime {
                reason: format!("Failed to render record: {}", e),
            })?;
            println!("{}", json);
        }
        None => println!("no visitor identity"),
    }
    Ok(())
}

fn link(
    manager: &IdentityManager,
    known_id: String,
    data_provider_id: i64,
    auth_state: Option<AuthState>,
) -> VisitorResult<()> {
    let (tx, rx) = mpsc::channel();
    let callback: LinkCallback = Box::new(move |result| {
        let _ = tx.send(result.clone());
    });
    if !manager.link_to_known_identifier(known_id, data_provider_id, auth_state, Some(callback)) {
        println!("no visitor identity to link");
        return Ok(());
    }

    match rx.recv_timeout(manager.config().consumer_wait()) {
        Ok(Ok(record)) => print_record(Some(&record)),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(VisitorError::Runtime {
            reason: "link request did not complete in time".to_string(),
        }),
    }
}

fn main() -> VisitorResult<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = VisitorConfig::load(cli.config.as_deref())?;
    config
        .storage_path
        .get_or_insert_with(|| PathBuf::from(DEFAULT_STORAGE_PATH));

    let manager = IdentityManager::builder(config).initialize()?;
    tracing::debug!(org_id = manager.org_id(), "Visitor identity manager ready");

    match cli.command {
        Commands::Show => print_record(manager.current_record().as_ref()),
        Commands::Resolve => {
            let record = manager.resolve_record(manager.config().consumer_wait());
            print_record(record.as_ref())
        }
        Commands::Decorate { url } => {
            println!("{}", ConsumerFacade::new(manager.clone()).decorate_url(&url));
            Ok(())
        }
        Commands::Link {
            known_id,
            data_provider_id,
            auth_state,
        } => link(manager, known_id, data_provider_id, auth_state),
        Commands::Reset => {
            manager.reset();
            println!("visitor identity cleared");
            Ok(())
        }
    }
}
