//! # Admin Commands
//!
//! Manual trigger and explicit retraction of one destination.

use anyhow::{Context, Result};
use push_secret_controller::controller::rules::RuleId;
use push_secret_controller::runtime::server::{DestinationRequest, ErrorBody, RetractResponse};
use push_secret_controller::secret::SecretId;

use crate::parse_ref;

/// Build the request body from command line references
pub fn destination(secret: &str, rule: &str, store: String, namespace: &str) -> Result<DestinationRequest> {
    let (secret_namespace, secret_name) = parse_ref(secret, namespace)?;
    let (rule_namespace, rule_name) = parse_ref(rule, namespace)?;
    Ok(DestinationRequest {
        secret: SecretId::new(secret_namespace, secret_name),
        rule: RuleId::new(rule_namespace, rule_name),
        store,
    })
}

pub async fn trigger_command(
    http: &reqwest::Client,
    url: &str,
    request: DestinationRequest,
    token: Option<String>,
) -> Result<()> {
    let endpoint = format!("{url}/trigger");
    post(http, &endpoint, &request, token.as_deref()).await?;
    println!(
        "Triggered push of {} to {} (rule {})",
        request.secret, request.store, request.rule
    );
    Ok(())
}

pub async fn retract_command(
    http: &reqwest::Client,
    url: &str,
    request: DestinationRequest,
    token: Option<String>,
) -> Result<()> {
    let endpoint = format!("{url}/retract");
    let response = post(http, &endpoint, &request, token.as_deref()).await?;
    let body: RetractResponse = response
        .json()
        .await
        .with_context(|| format!("Invalid response from {endpoint}"))?;
    println!(
        "Retracted {} remote entr{} of {} from {}",
        body.removed,
        if body.removed == 1 { "y" } else { "ies" },
        request.secret,
        request.store
    );
    Ok(())
}

async fn post(
    http: &reqwest::Client,
    endpoint: &str,
    request: &DestinationRequest,
    token: Option<&str>,
) -> Result<reqwest::Response> {
    let mut builder = http.post(endpoint).json(request);
    if let Some(token) = token {
        builder = builder.bearer_auth(token);
    }
    let response = builder
        .send()
        .await
        .with_context(|| format!("Failed to reach controller at {endpoint}"))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.json::<ErrorBody>().await.map(|b| b.error).unwrap_or_default();
    match status {
        reqwest::StatusCode::FORBIDDEN => {
            anyhow::bail!("Admin operations are disabled on the controller: {body}")
        }
        reqwest::StatusCode::UNAUTHORIZED => {
            anyhow::bail!("Admin token rejected; pass --token or set ADMIN_TOKEN")
        }
        _ => anyhow::bail!("{endpoint} returned {status}: {body}"),
    }
}
