//! # Status Commands
//!
//! Show destination sync status and store health from the controller.

use anyhow::{Context, Result};
use push_secret_controller::controller::reconciler::StoreHealth;
use push_secret_controller::runtime::server::{DestinationStatus, ErrorBody};

/// Show the sync status of every destination, or of one secret
pub async fn status_command(
    http: &reqwest::Client,
    url: &str,
    secret: Option<(String, String)>,
    json: bool,
) -> Result<()> {
    let endpoint = match &secret {
        Some((namespace, name)) => format!("{url}/status/{namespace}/{name}"),
        None => format!("{url}/status"),
    };
    let statuses: Vec<DestinationStatus> = get_json(http, &endpoint).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("No destinations");
        return Ok(());
    }

    println!(
        "{:<32} {:<28} {:<16} {:<8} {:>8} {:>7}  LAST SYNC",
        "SECRET", "RULE", "STORE", "PHASE", "VERSION", "RETRIES"
    );
    for status in &statuses {
        println!(
            "{:<32} {:<28} {:<16} {:<8} {:>8} {:>7}  {}",
            status.secret.to_string(),
            status.rule.to_string(),
            status.store,
            status.phase.as_str(),
            status
                .synced_version
                .map_or_else(|| "-".to_string(), |v| v.to_string()),
            status.retry_count,
            status
                .last_sync_time
                .map_or_else(|| "never".to_string(), |t| t.to_rfc3339()),
        );
        if let (Some(reason), Some(message)) = (&status.failure_reason, &status.failure_message) {
            println!("    {}: {}", reason.as_str(), message);
        }
    }
    Ok(())
}

/// Show the last health check of every store
pub async fn stores_command(http: &reqwest::Client, url: &str) -> Result<()> {
    let stores: Vec<StoreHealth> = get_json(http, &format!("{url}/stores")).await?;
    if stores.is_empty() {
        println!("No stores loaded");
        return Ok(());
    }

    for store in &stores {
        let state = if store.healthy { "healthy" } else { "unhealthy" };
        let checked = store
            .checked_at
            .map_or_else(|| "not checked yet".to_string(), |t| t.to_rfc3339());
        println!("{} ({}): {} at {}", store.store, store.kind, state, checked);
        if let Some(message) = &store.message {
            println!("    {message}");
        }
    }
    Ok(())
}

async fn get_json<T: serde::de::DeserializeOwned>(http: &reqwest::Client, endpoint: &str) -> Result<T> {
    let response = http
        .get(endpoint)
        .send()
        .await
        .with_context(|| format!("Failed to reach controller at {endpoint}"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.json::<ErrorBody>().await.map(|b| b.error).unwrap_or_default();
        anyhow::bail!("{endpoint} returned {status}: {body}");
    }
    response
        .json()
        .await
        .with_context(|| format!("Invalid response from {endpoint}"))
}
