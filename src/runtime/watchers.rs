//! # Watchers
//!
//! Feed Kubernetes `Secret`, `PushSecret` and `ClusterSecretStore` events
//! into the reconciler. Ingestion never contacts a destination store.
//!
//! Each watcher relists on start and after a broken watch; objects missing
//! from a relist are treated as deleted.

use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::Secret as KubeSecret;
use kube::{Api, Client, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::ControllerConfig;
use crate::controller::locks::lock;
use crate::controller::reconciler::Reconciler;
use crate::controller::rules::{PushRule, RuleId};
use crate::controller::source::from_kube_secret;
use crate::crd::{ClusterSecretStore, PushSecret};
use crate::provider::{ClientOptions, SecretStore, StoreClient};
use crate::runtime::status_writer::{invalid_spec_status, patch_status};
use crate::secret::SecretId;

/// Rules and stores loaded from resources, as opposed to the rules file
#[derive(Debug, Clone, Default)]
pub struct ResourceIndex {
    pub rules: Arc<Mutex<HashSet<RuleId>>>,
    pub stores: Arc<Mutex<HashSet<String>>>,
}

impl ResourceIndex {
    #[must_use]
    pub fn contains_rule(&self, id: &RuleId) -> bool {
        lock(&self.rules).contains(id)
    }

    #[must_use]
    pub fn contains_store(&self, name: &str) -> bool {
        lock(&self.stores).contains(name)
    }
}

/// Spawn the three watchers
pub fn spawn_watchers(
    client: Client,
    reconciler: Arc<Reconciler>,
    config: &ControllerConfig,
    index: ResourceIndex,
) -> Vec<tokio::task::JoinHandle<()>> {
    let options = ClientOptions {
        request_timeout: config.backend_timeout,
        refresh_margin: config.token_refresh_margin,
    };
    vec![
        tokio::spawn(
            watch_stores(client.clone(), Arc::clone(&reconciler), options, index.clone())
                .instrument(info_span!("watch", kind = "ClusterSecretStore")),
        ),
        tokio::spawn(
            watch_push_secrets(
                client.clone(),
                Arc::clone(&reconciler),
                config.watch_namespace.clone(),
                config.default_max_retries,
                index,
            )
            .instrument(info_span!("watch", kind = "PushSecret")),
        ),
        tokio::spawn(
            watch_secrets(
                client,
                reconciler,
                config.watch_namespace.clone(),
                config.secret_label_selector.clone(),
            )
            .instrument(info_span!("watch", kind = "Secret")),
        ),
    ]
}

fn namespaced_or_all<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

async fn watch_secrets(
    client: Client,
    reconciler: Arc<Reconciler>,
    namespace: Option<String>,
    label_selector: Option<String>,
) {
    let api: Api<KubeSecret> = namespaced_or_all(client, namespace.as_deref());
    let mut config = watcher::Config::default();
    if let Some(selector) = &label_selector {
        config = config.labels(selector);
    }

    let stream = watcher(api, config).default_backoff();
    pin_mut!(stream);
    let mut relisted: HashSet<SecretId> = HashSet::new();

    info!("Watching Secrets");
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) => relisted.clear(),
            Ok(watcher::Event::InitApply(secret)) => {
                if let Some(id) = apply_kube_secret(&reconciler, &secret) {
                    relisted.insert(id);
                }
            }
            Ok(watcher::Event::InitDone) => {
                reconciler.retain_secrets(|id| relisted.contains(id));
                info!("Secret relist complete: {} secret(s)", relisted.len());
                relisted.clear();
            }
            Ok(watcher::Event::Apply(secret)) => {
                apply_kube_secret(&reconciler, &secret);
            }
            Ok(watcher::Event::Delete(secret)) => {
                if let Some((id, _, _)) = from_kube_secret(&secret) {
                    reconciler.remove_secret(&id);
                }
            }
            Err(e) => warn!("Secret watch error: {}", e),
        }
    }
    error!("Secret watch stream ended");
}

fn apply_kube_secret(reconciler: &Reconciler, secret: &KubeSecret) -> Option<SecretId> {
    let (id, data, labels) = from_kube_secret(secret)?;
    reconciler.apply_secret(id.clone(), data, labels);
    Some(id)
}

async fn watch_push_secrets(
    client: Client,
    reconciler: Arc<Reconciler>,
    namespace: Option<String>,
    default_max_retries: u32,
    index: ResourceIndex,
) {
    let api: Api<PushSecret> = namespaced_or_all(client.clone(), namespace.as_deref());
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    pin_mut!(stream);
    let mut relisted: HashSet<RuleId> = HashSet::new();

    info!("Watching PushSecrets");
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) => relisted.clear(),
            Ok(watcher::Event::InitApply(push_secret)) => {
                let id = apply_push_secret(&client, &reconciler, &push_secret, default_max_retries, &index).await;
                relisted.insert(id);
            }
            Ok(watcher::Event::InitDone) => {
                let stale: Vec<RuleId> = lock(&index.rules)
                    .iter()
                    .filter(|id| !relisted.contains(*id))
                    .cloned()
                    .collect();
                for id in stale {
                    lock(&index.rules).remove(&id);
                    reconciler.remove_rule(&id);
                }
                info!("PushSecret relist complete: {} rule(s)", relisted.len());
                relisted.clear();
            }
            Ok(watcher::Event::Apply(push_secret)) => {
                apply_push_secret(&client, &reconciler, &push_secret, default_max_retries, &index).await;
            }
            Ok(watcher::Event::Delete(push_secret)) => {
                let id = rule_id(&push_secret);
                lock(&index.rules).remove(&id);
                reconciler.remove_rule(&id);
            }
            Err(e) => warn!("PushSecret watch error: {}", e),
        }
    }
    error!("PushSecret watch stream ended");
}

fn rule_id(push_secret: &PushSecret) -> RuleId {
    RuleId::new(
        push_secret.namespace().unwrap_or_else(|| "default".to_string()),
        push_secret.name_any(),
    )
}

/// Load a `PushSecret`; an invalid spec keeps the previously loaded rule
async fn apply_push_secret(
    client: &Client,
    reconciler: &Reconciler,
    push_secret: &PushSecret,
    default_max_retries: u32,
    index: &ResourceIndex,
) -> RuleId {
    let id = rule_id(push_secret);
    match PushRule::from_spec(id.clone(), &push_secret.spec, default_max_retries) {
        Ok(rule) => {
            lock(&index.rules).insert(id.clone());
            reconciler.apply_rule(rule);
        }
        Err(e) => {
            error!("PushSecret {} is invalid: {}", id, e);
            let previous = push_secret.status.as_ref();
            if let Err(e) = patch_status(client, &id, &invalid_spec_status(previous, &e.to_string())).await {
                warn!("Failed to report invalid spec on {}: {}", id, e);
            }
        }
    }
    id
}

async fn watch_stores(
    client: Client,
    reconciler: Arc<Reconciler>,
    options: ClientOptions,
    index: ResourceIndex,
) {
    let api: Api<ClusterSecretStore> = Api::all(client);
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    pin_mut!(stream);
    let mut relisted: HashSet<String> = HashSet::new();

    info!("Watching ClusterSecretStores");
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Init) => relisted.clear(),
            Ok(watcher::Event::InitApply(store)) => {
                relisted.insert(store.name_any());
                apply_store(&reconciler, &store, &options, &index).await;
            }
            Ok(watcher::Event::InitDone) => {
                let stale: Vec<String> = lock(&index.stores)
                    .iter()
                    .filter(|name| !relisted.contains(*name))
                    .cloned()
                    .collect();
                for name in stale {
                    lock(&index.stores).remove(&name);
                    reconciler.remove_store(&name);
                }
                relisted.clear();
            }
            Ok(watcher::Event::Apply(store)) => apply_store(&reconciler, &store, &options, &index).await,
            Ok(watcher::Event::Delete(store)) => {
                let name = store.name_any();
                lock(&index.stores).remove(&name);
                reconciler.remove_store(&name);
            }
            Err(e) => warn!("ClusterSecretStore watch error: {}", e),
        }
    }
    error!("ClusterSecretStore watch stream ended");
}

async fn apply_store(
    reconciler: &Reconciler,
    store: &ClusterSecretStore,
    options: &ClientOptions,
    index: &ResourceIndex,
) {
    let name = store.name_any();
    match StoreClient::from_spec(&store.spec, options).await {
        Ok(client) => {
            debug!("Built {} client for store {}", client.kind().as_str(), name);
            lock(&index.stores).insert(name.clone());
            let timeout = store.spec.timeout_seconds.map(std::time::Duration::from_secs);
            reconciler.apply_store(&name, Arc::new(client), timeout);
        }
        Err(e) => error!("ClusterSecretStore {} is invalid: {}", name, e),
    }
}
