//! # pushctl
//!
//! Command-line interface for the Push Secret Controller.
//!
//! Talks to the controller's HTTP endpoint for status, retraction and manual
//! triggers, and runs rules file validation and generators locally.
//!
//! ## Usage
//!
//! ```bash
//! # Show the sync status of every destination
//! pushctl status
//!
//! # Show the sync status of one secret
//! pushctl status payments/db-credentials
//!
//! # Show store health
//! pushctl stores
//!
//! # Push a destination now
//! pushctl trigger payments/db-credentials --rule payments/db-push --store vault-r1
//!
//! # Delete the remote entries of a destination (requires ADMIN_TOKEN)
//! pushctl retract payments/db-credentials --rule payments/db-push --store vault-r1
//!
//! # Validate a rules file
//! pushctl validate rules.yaml
//!
//! # Generate a value locally
//! pushctl generate password --length 32 --digits 4
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod admin;
mod generate;
mod status;
mod validate;

/// Push Secret Controller CLI
#[derive(Parser)]
#[command(name = "pushctl")]
#[command(
    about = "Push Secret Controller CLI",
    long_about = None,
    after_help = "\
Secrets and rules are written as <namespace>/<name>; a bare name uses --namespace.

Examples:
  pushctl status payments/db-credentials
  pushctl retract db-credentials --rule db-push --store vault-r1 -n payments
  pushctl validate rules.yaml
"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Namespace for bare secret and rule names
    #[arg(short, long, global = true, default_value = "default")]
    namespace: String,

    /// Controller HTTP endpoint
    #[arg(long, global = true, env = "PUSHCTL_URL", default_value = "http://localhost:5000")]
    url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show per-destination sync status
    Status {
        /// Secret to show; every destination when omitted
        #[arg(value_name = "SECRET")]
        secret: Option<String>,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },
    /// Show the last health check of every store
    Stores,
    /// Push one destination now, bypassing backoff
    Trigger {
        #[arg(value_name = "SECRET")]
        secret: String,

        /// PushSecret rule owning the destination
        #[arg(long)]
        rule: String,

        /// Destination store name
        #[arg(long)]
        store: String,

        /// Admin bearer token
        #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Delete the remote entries of one destination
    /// Nothing is ever deleted remotely without this command
    Retract {
        #[arg(value_name = "SECRET")]
        secret: String,

        /// PushSecret rule owning the destination
        #[arg(long)]
        rule: String,

        /// Destination store name
        #[arg(long)]
        store: String,

        /// Admin bearer token
        #[arg(long, env = "ADMIN_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Validate a rules file without contacting any store
    Validate {
        #[arg(value_name = "FILE")]
        file: std::path::PathBuf,
    },
    /// Run a generator locally and print the value
    Generate {
        #[command(subcommand)]
        generator: generate::GeneratorCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must happen before any client that uses rustls is built
    rustls::crypto::ring::default_provider()
        .install_default()
        .unwrap_or_else(|_| panic!("Failed to install rustls crypto provider"));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pushctl=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;
    let url = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Status { secret, json } => {
            let secret = secret
                .map(|s| parse_ref(&s, &cli.namespace))
                .transpose()?;
            status::status_command(&http, &url, secret, json).await
        }
        Commands::Stores => status::stores_command(&http, &url).await,
        Commands::Trigger {
            secret,
            rule,
            store,
            token,
        } => {
            let request = admin::destination(&secret, &rule, store, &cli.namespace)?;
            admin::trigger_command(&http, &url, request, token).await
        }
        Commands::Retract {
            secret,
            rule,
            store,
            token,
        } => {
            let request = admin::destination(&secret, &rule, store, &cli.namespace)?;
            admin::retract_command(&http, &url, request, token).await
        }
        Commands::Validate { file } => validate::validate_command(&file),
        Commands::Generate { generator } => generate::generate_command(generator).await,
    }
}

/// Split `<namespace>/<name>`; a bare name takes `default_namespace`
fn parse_ref(value: &str, default_namespace: &str) -> Result<(String, String)> {
    let (namespace, name) = match value.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => (default_namespace, value),
    };
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        anyhow::bail!("'{value}' is not of the form <namespace>/<name>");
    }
    Ok((namespace.to_string(), name.to_string()))
}
