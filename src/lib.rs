//! Push Secret Controller Library
//!
//! Pushes Kubernetes and generated secrets to external secret stores
//! (Vault KV v2, Infisical, AWS Secrets Manager, GCP Secret Manager) and
//! keeps a durable per-destination sync record.
//!
//! The [`controller::reconciler::Reconciler`] is usable without a cluster:
//! feed it secrets, rules and store clients directly and call
//! [`controller::reconciler::Reconciler::start`]. The [`runtime`] module wires
//! it to Kubernetes watchers and the HTTP server.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod provider;
pub mod runtime;
pub mod secret;
