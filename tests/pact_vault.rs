//! Pact contract tests for the Vault KV v2 API
//!
//! These tests define the contract between the push secret controller and
//! Vault. The real `VaultKvClient` runs against a Pact mock server.

mod common;

use common::{base_url, client_options, init_rustls};
use pact_consumer::prelude::*;
use push_secret_controller::crd::{
    EnvSecretRef, VaultAuthSpec, VaultKubernetesAuthSpec, VaultProviderSpec, VaultTokenAuthSpec,
};
use push_secret_controller::provider::vault::VaultKvClient;
use push_secret_controller::provider::{RemoteRef, SecretStore, StoreErrorKind};
use push_secret_controller::secret::SecretValue;
use serde_json::json;
use std::io::Write;
use tempfile::NamedTempFile;

const CONSUMER: &str = "Push-Secret-Controller";
const PROVIDER: &str = "Vault-KV-v2";
const TOKEN: &str = "s.test-token";

fn credential_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(file, "{content}").expect("write temp file");
    file
}

fn token_client(server: &str, token_file: &NamedTempFile) -> VaultKvClient {
    let spec = VaultProviderSpec {
        server: server.to_string(),
        mount_path: None,
        namespace: None,
        auth: VaultAuthSpec {
            token: Some(VaultTokenAuthSpec {
                token_ref: EnvSecretRef {
                    env: None,
                    file: Some(token_file.path().display().to_string()),
                },
            }),
            ..VaultAuthSpec::default()
        },
    };
    VaultKvClient::new(&spec, &client_options()).expect("vault client")
}

fn password_ref() -> RemoteRef {
    RemoteRef::new("payments/db", Some("password".to_string()))
}

#[tokio::test]
async fn test_vault_write_new_path_contract() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder
        .interaction("read a KV path that does not exist", "", |mut i| {
            i.given("no secret exists at payments/db");
            i.request
                .method("GET")
                .path("/v1/secret/data/payments/db")
                .header("X-Vault-Token", TOKEN);
            i.response
                .status(404)
                .header("content-type", "application/json")
                .json_body(json!({ "errors": [] }));
            i
        })
        .interaction("create a KV path with check-and-set 0", "", |mut i| {
            i.given("no secret exists at payments/db");
            i.request
                .method("POST")
                .path("/v1/secret/data/payments/db")
                .header("X-Vault-Token", TOKEN)
                .json_body(json!({
                    "options": { "cas": 0 },
                    "data": { "password": "s3cr3t" }
                }));
            i.response
                .status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "data": {
                        "created_time": "2024-01-01T00:00:00Z",
                        "deletion_time": "",
                        "destroyed": false,
                        "version": 1
                    }
                }));
            i
        });

    let mock_server = pact_builder.start_mock_server(None, None);
    let token_file = credential_file(TOKEN);
    let client = token_client(&base_url(mock_server.url()), &token_file);

    let version = client
        .write(&password_ref(), &SecretValue::from("s3cr3t"), None)
        .await
        .expect("write succeeds");
    assert_eq!(version, "1");
}

#[tokio::test]
async fn test_vault_write_over_soft_deleted_path_contract() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder
        .interaction("read a KV path whose latest version is deleted", "", |mut i| {
            i.given("payments/db version 2 was soft-deleted");
            i.request
                .method("GET")
                .path("/v1/secret/data/payments/db")
                .header("X-Vault-Token", TOKEN);
            i.response
                .status(404)
                .header("content-type", "application/json")
                .json_body(json!({
                    "data": {
                        "data": null,
                        "metadata": {
                            "created_time": "2024-01-01T00:00:00Z",
                            "deletion_time": "2024-01-02T00:00:00Z",
                            "destroyed": false,
                            "version": 2
                        }
                    }
                }));
            i
        })
        .interaction("write over a deleted version with check-and-set 2", "", |mut i| {
            i.given("payments/db version 2 was soft-deleted");
            i.request
                .method("POST")
                .path("/v1/secret/data/payments/db")
                .header("X-Vault-Token", TOKEN)
                .json_body(json!({
                    "options": { "cas": 2 },
                    "data": { "password": "s3cr3t" }
                }));
            i.response
                .status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "data": {
                        "created_time": "2024-01-03T00:00:00Z",
                        "deletion_time": "",
                        "destroyed": false,
                        "version": 3
                    }
                }));
            i
        });

    let mock_server = pact_builder.start_mock_server(None, None);
    let token_file = credential_file(TOKEN);
    let client = token_client(&base_url(mock_server.url()), &token_file);

    let version = client
        .write(&password_ref(), &SecretValue::from("s3cr3t"), None)
        .await
        .expect("write after delete succeeds");
    assert_eq!(version, "3");
}

#[tokio::test]
async fn test_vault_write_keeps_other_fields_contract() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder
        .interaction("read a KV path holding a username", "", |mut i| {
            i.given("payments/db holds username at version 3");
            i.request
                .method("GET")
                .path("/v1/secret/data/payments/db")
                .header("X-Vault-Token", TOKEN);
            i.response
                .status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "data": {
                        "data": { "username": "app" },
                        "metadata": {
                            "created_time": "2024-01-01T00:00:00Z",
                            "deletion_time": "",
                            "destroyed": false,
                            "version": 3
                        }
                    }
                }));
            i
        })
        .interaction("update a KV path with check-and-set 3", "", |mut i| {
            i.given("payments/db holds username at version 3");
            i.request
                .method("POST")
                .path("/v1/secret/data/payments/db")
                .header("X-Vault-Token", TOKEN)
                .json_body(json!({
                    "options": { "cas": 3 },
                    "data": { "username": "app", "password": "s3cr3t" }
                }));
            i.response
                .status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "data": {
                        "created_time": "2024-01-02T00:00:00Z",
                        "deletion_time": "",
                        "destroyed": false,
                        "version": 4
                    }
                }));
            i
        });

    let mock_server = pact_builder.start_mock_server(None, None);
    let token_file = credential_file(TOKEN);
    let client = token_client(&base_url(mock_server.url()), &token_file);

    let version = client
        .write(&password_ref(), &SecretValue::from("s3cr3t"), None)
        .await
        .expect("write succeeds");
    assert_eq!(version, "4");
}

#[tokio::test]
async fn test_vault_check_and_set_mismatch_is_conflict_contract() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder
        .interaction("read a KV path at version 3", "", |mut i| {
            i.given("payments/db is at version 3 and is being updated concurrently");
            i.request
                .method("GET")
                .path("/v1/secret/data/payments/db")
                .header("X-Vault-Token", TOKEN);
            i.response
                .status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "data": {
                        "data": { "password": "old" },
                        "metadata": { "version": 3 }
                    }
                }));
            i
        })
        .interaction("write with a stale check-and-set version", "", |mut i| {
            i.given("payments/db is at version 3 and is being updated concurrently");
            i.request
                .method("POST")
                .path("/v1/secret/data/payments/db")
                .header("X-Vault-Token", TOKEN)
                .json_body(json!({
                    "options": { "cas": 3 },
                    "data": { "password": "s3cr3t" }
                }));
            i.response
                .status(400)
                .header("content-type", "application/json")
                .json_body(json!({
                    "errors": ["check-and-set parameter did not match the current version"]
                }));
            i
        });

    let mock_server = pact_builder.start_mock_server(None, None);
    let token_file = credential_file(TOKEN);
    let client = token_client(&base_url(mock_server.url()), &token_file);

    let err = client
        .write(&password_ref(), &SecretValue::from("s3cr3t"), None)
        .await
        .expect_err("stale cas must fail");
    assert_eq!(err.kind, StoreErrorKind::Conflict);
    assert!(!err.message.contains("s3cr3t"));
}

#[tokio::test]
async fn test_vault_kubernetes_login_then_read_contract() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder
        .interaction("log in with a service account token", "", |mut i| {
            i.given("the kubernetes auth role push-secret exists");
            i.request
                .method("POST")
                .path("/v1/auth/kubernetes/login")
                .json_body(json!({ "role": "push-secret", "jwt": "header.payload.signature" }));
            i.response
                .status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "auth": {
                        "client_token": "s.k8s-token",
                        "lease_duration": 3600,
                        "renewable": true
                    }
                }));
            i
        })
        .interaction("read a KV field with the issued token", "", |mut i| {
            i.given("payments/db holds a password at version 2");
            i.request
                .method("GET")
                .path("/v1/secret/data/payments/db")
                .header("X-Vault-Token", "s.k8s-token");
            i.response
                .status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "data": {
                        "data": { "password": "s3cr3t" },
                        "metadata": { "version": 2 }
                    }
                }));
            i
        });

    let mock_server = pact_builder.start_mock_server(None, None);
    let jwt_file = credential_file("header.payload.signature");
    let spec = VaultProviderSpec {
        server: base_url(mock_server.url()),
        mount_path: None,
        namespace: None,
        auth: VaultAuthSpec {
            kubernetes: Some(VaultKubernetesAuthSpec {
                role: "push-secret".to_string(),
                mount_path: None,
                service_account_token_path: Some(jwt_file.path().display().to_string()),
            }),
            ..VaultAuthSpec::default()
        },
    };
    let client = VaultKvClient::new(&spec, &client_options()).expect("vault client");

    let value = client
        .read(&password_ref())
        .await
        .expect("read succeeds")
        .expect("value exists");
    assert_eq!(value.value.as_str(), Some("s3cr3t"));
    assert_eq!(value.version.as_deref(), Some("2"));
}

#[tokio::test]
async fn test_vault_permission_denied_is_unauthenticated_contract() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("read a KV path with a revoked token", "", |mut i| {
        i.given("the token has been revoked");
        i.request
            .method("GET")
            .path("/v1/secret/data/payments/db")
            .header("X-Vault-Token", TOKEN);
        i.response
            .status(403)
            .header("content-type", "application/json")
            .json_body(json!({ "errors": ["permission denied"] }));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let token_file = credential_file(TOKEN);
    let client = token_client(&base_url(mock_server.url()), &token_file);

    let err = client.read(&password_ref()).await.expect_err("revoked token");
    assert_eq!(err.kind, StoreErrorKind::Unauthenticated);
}

#[tokio::test]
async fn test_vault_health_sealed_contract() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("health check of a sealed vault", "", |mut i| {
        i.given("vault is sealed");
        i.request.method("GET").path("/v1/sys/health");
        i.response
            .status(503)
            .header("content-type", "application/json")
            .json_body(json!({ "initialized": true, "sealed": true, "standby": true }));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let token_file = credential_file(TOKEN);
    let client = token_client(&base_url(mock_server.url()), &token_file);

    let err = client.health_check().await.expect_err("sealed vault is unhealthy");
    assert_eq!(err.kind, StoreErrorKind::Unavailable);
}
