//! Pact contract tests for the Infisical API
//!
//! These tests define the contract between the push secret controller and
//! Infisical (universal auth and raw secrets). The real `InfisicalClient`
//! runs against a Pact mock server.

mod common;

use common::{base_url, client_options, init_rustls};
use pact_consumer::prelude::*;
use push_secret_controller::crd::{EnvSecretRef, InfisicalAuthSpec, InfisicalProviderSpec, UniversalAuthSpec};
use push_secret_controller::provider::infisical::InfisicalClient;
use push_secret_controller::provider::{RemoteRef, SecretStore, StoreErrorKind};
use push_secret_controller::secret::SecretValue;
use serde_json::json;
use std::io::Write;
use tempfile::NamedTempFile;

const CONSUMER: &str = "Push-Secret-Controller";
const PROVIDER: &str = "Infisical";
const SECRET_PATH: &str = "/api/v3/secrets/raw/DB_PASSWORD";

struct Credentials {
    client_id: NamedTempFile,
    client_secret: NamedTempFile,
}

fn credentials(client_secret: &str) -> Credentials {
    let write = |content: &str| {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "{content}").expect("write temp file");
        file
    };
    Credentials {
        client_id: write("machine-identity-1"),
        client_secret: write(client_secret),
    }
}

fn client(host: String, credentials: &Credentials) -> InfisicalClient {
    let file_ref = |file: &NamedTempFile| EnvSecretRef {
        env: None,
        file: Some(file.path().display().to_string()),
    };
    let spec = InfisicalProviderSpec {
        host_api: Some(host),
        project_id: "proj-1".to_string(),
        environment: "prod".to_string(),
        secret_path: None,
        auth: InfisicalAuthSpec {
            universal_auth: UniversalAuthSpec {
                client_id_ref: file_ref(&credentials.client_id),
                client_secret_ref: file_ref(&credentials.client_secret),
            },
        },
    };
    InfisicalClient::new(&spec, &client_options()).expect("infisical client")
}

fn login_interaction(pact_builder: &mut PactBuilder) {
    pact_builder.interaction("log in with universal auth", "", |mut i| {
        i.given("machine identity machine-identity-1 exists");
        i.request
            .method("POST")
            .path("/api/v1/auth/universal-auth/login")
            .json_body(json!({
                "clientId": "machine-identity-1",
                "clientSecret": "client-secret-1"
            }));
        i.response
            .status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "accessToken": "inf-token",
                "expiresIn": 7200,
                "accessTokenMaxTTL": 43200,
                "tokenType": "Bearer"
            }));
        i
    });
}

#[tokio::test]
async fn test_infisical_create_secret_contract() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);
    login_interaction(&mut pact_builder);

    pact_builder
        .interaction("read a secret that does not exist", "", |mut i| {
            i.given("DB_PASSWORD does not exist in proj-1/prod");
            i.request
                .method("GET")
                .path(SECRET_PATH)
                .query_param("workspaceId", "proj-1")
                .query_param("environment", "prod")
                .query_param("secretPath", "/")
                .header("Authorization", "Bearer inf-token");
            i.response
                .status(404)
                .header("content-type", "application/json")
                .json_body(json!({ "message": "Secret not found" }));
            i
        })
        .interaction("create a shared secret", "", |mut i| {
            i.given("DB_PASSWORD does not exist in proj-1/prod");
            i.request
                .method("POST")
                .path(SECRET_PATH)
                .header("Authorization", "Bearer inf-token")
                .json_body(json!({
                    "workspaceId": "proj-1",
                    "environment": "prod",
                    "secretPath": "/",
                    "secretValue": "s3cr3t",
                    "type": "shared"
                }));
            i.response
                .status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "secret": {
                        "secretKey": "DB_PASSWORD",
                        "secretValue": "s3cr3t",
                        "version": 1,
                        "type": "shared"
                    }
                }));
            i
        });

    let mock_server = pact_builder.start_mock_server(None, None);
    let credentials = credentials("client-secret-1");
    let client = client(base_url(mock_server.url()), &credentials);

    let version = client
        .write(&RemoteRef::new("DB_PASSWORD", None), &SecretValue::from("s3cr3t"), None)
        .await
        .expect("create succeeds");
    assert_eq!(version, "1");
}

#[tokio::test]
async fn test_infisical_update_secret_contract() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);
    login_interaction(&mut pact_builder);

    pact_builder
        .interaction("read an existing secret", "", |mut i| {
            i.given("DB_PASSWORD exists in proj-1/prod at version 4");
            i.request
                .method("GET")
                .path(SECRET_PATH)
                .query_param("workspaceId", "proj-1")
                .query_param("environment", "prod")
                .query_param("secretPath", "/")
                .header("Authorization", "Bearer inf-token");
            i.response
                .status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "secret": {
                        "secretKey": "DB_PASSWORD",
                        "secretValue": "old",
                        "version": 4,
                        "type": "shared"
                    }
                }));
            i
        })
        .interaction("update a shared secret", "", |mut i| {
            i.given("DB_PASSWORD exists in proj-1/prod at version 4");
            i.request
                .method("PATCH")
                .path(SECRET_PATH)
                .header("Authorization", "Bearer inf-token")
                .json_body(json!({
                    "workspaceId": "proj-1",
                    "environment": "prod",
                    "secretPath": "/",
                    "secretValue": "s3cr3t",
                    "type": "shared"
                }));
            i.response
                .status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "secret": {
                        "secretKey": "DB_PASSWORD",
                        "secretValue": "s3cr3t",
                        "version": 5,
                        "type": "shared"
                    }
                }));
            i
        });

    let mock_server = pact_builder.start_mock_server(None, None);
    let credentials = credentials("client-secret-1");
    let client = client(base_url(mock_server.url()), &credentials);

    let version = client
        .write(&RemoteRef::new("DB_PASSWORD", None), &SecretValue::from("s3cr3t"), None)
        .await
        .expect("update succeeds");
    assert_eq!(version, "5");
}

#[tokio::test]
async fn test_infisical_rejected_login_is_unauthenticated_contract() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("log in with a revoked client secret", "", |mut i| {
        i.given("the client secret of machine-identity-1 was revoked");
        i.request
            .method("POST")
            .path("/api/v1/auth/universal-auth/login")
            .json_body(json!({
                "clientId": "machine-identity-1",
                "clientSecret": "revoked"
            }));
        i.response
            .status(401)
            .header("content-type", "application/json")
            .json_body(json!({ "message": "Invalid credentials" }));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let credentials = credentials("revoked");
    let client = client(base_url(mock_server.url()), &credentials);

    let err = client
        .read(&RemoteRef::new("DB_PASSWORD", None))
        .await
        .expect_err("login must fail");
    assert_eq!(err.kind, StoreErrorKind::Unauthenticated);
}
