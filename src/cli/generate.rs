//! # Generate Command
//!
//! Runs a generator locally. Values go to stdout and nothing is pushed.

use anyhow::{Context, Result};
use clap::Subcommand;
use push_secret_controller::controller::generator::{Generator, GeneratorEngine};
use push_secret_controller::crd::{
    AwsStsTokenSpec, GcpTokenSpec, GeneratorSpec, PasswordSpec, ProviderTokenSpec, UuidSpec,
};

#[derive(Subcommand)]
pub enum GeneratorCommand {
    /// Random password
    Password {
        #[arg(long, default_value_t = 24)]
        length: usize,

        /// Number of digits
        #[arg(long, default_value_t = 0)]
        digits: usize,

        /// Number of symbols
        #[arg(long, default_value_t = 0)]
        symbols: usize,

        /// Lowercase letters only
        #[arg(long)]
        no_upper: bool,

        /// Never repeat a character
        #[arg(long)]
        no_repeat: bool,

        /// Number of passwords to print
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Version-4 UUID
    Uuid {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// GCP access token from the metadata server
    GcpToken {
        /// Comma separated OAuth2 scopes
        #[arg(long)]
        scopes: Option<String>,
    },
    /// AWS STS session credentials
    AwsSts {
        #[arg(long)]
        region: String,

        #[arg(long, default_value_t = 3600)]
        duration_seconds: i32,
    },
}

pub async fn generate_command(command: GeneratorCommand) -> Result<()> {
    let (spec, count) = match command {
        GeneratorCommand::Password {
            length,
            digits,
            symbols,
            no_upper,
            no_repeat,
            count,
        } => (
            GeneratorSpec {
                password: Some(PasswordSpec {
                    length,
                    digits,
                    symbols,
                    no_upper,
                    allow_repeat: !no_repeat,
                }),
                ..GeneratorSpec::default()
            },
            count,
        ),
        GeneratorCommand::Uuid { count } => (
            GeneratorSpec {
                uuid: Some(UuidSpec {}),
                ..GeneratorSpec::default()
            },
            count,
        ),
        GeneratorCommand::GcpToken { scopes } => (
            GeneratorSpec {
                provider_token: Some(ProviderTokenSpec {
                    gcp: Some(GcpTokenSpec { scopes }),
                    aws_sts: None,
                }),
                ..GeneratorSpec::default()
            },
            1,
        ),
        GeneratorCommand::AwsSts {
            region,
            duration_seconds,
        } => (
            GeneratorSpec {
                provider_token: Some(ProviderTokenSpec {
                    gcp: None,
                    aws_sts: Some(AwsStsTokenSpec {
                        region,
                        duration_seconds,
                    }),
                }),
                ..GeneratorSpec::default()
            },
            1,
        ),
    };

    let generator = Generator::from_spec(&spec).context("Invalid generator parameters")?;
    let engine = GeneratorEngine::new();
    for _ in 0..count {
        let generated = engine
            .generate(&generator)
            .await
            .with_context(|| format!("{} generator failed", generator.kind()))?;
        let value = generated
            .value
            .as_str()
            .context("Generated value is not valid UTF-8")?;
        println!("{value}");
        if let Some(expires_at) = generated.expires_at {
            eprintln!("expires at {}", expires_at.to_rfc3339());
        }
    }
    Ok(())
}
