//! # Push Secret Controller
//!
//! Watches Kubernetes `Secret`s, `PushSecret` and `ClusterSecretStore`
//! resources and pushes secret material to the configured stores.
//!
//! See [`push_secret_controller::config`] for the environment variables.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    push_secret_controller::runtime::run().await
}
