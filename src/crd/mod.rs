//! # Custom Resource Definitions
//!
//! CRD types for the push secret controller.
//!
//! ## Module Structure
//!
//! - `push_secret.rs` - `PushSecret`: which secrets go where, and how often
//! - `secret_store.rs` - `ClusterSecretStore`: destination backend, endpoint and auth
//! - `generator.rs` - generator parameters used by `PushSecret` sources
//! - `status.rs` - status types patched back onto `PushSecret`

mod generator;
mod push_secret;
mod secret_store;
mod status;

pub use generator::{
    AwsStsTokenSpec, GcpTokenSpec, GeneratorSpec, PasswordSpec, ProviderTokenSpec, UuidSpec,
};
pub use push_secret::{
    default_refresh_interval, DestinationSpec, KeyMappingSpec, PushSecret, PushSecretSpec,
    RemoteRefSpec, SecretSelectorSpec, SourceSpec, StoreRefSpec, ValueEncoding,
};
pub use secret_store::{
    AwsProviderSpec, ClusterSecretStore, ClusterSecretStoreSpec, EnvSecretRef, GcpProviderSpec,
    InfisicalAuthSpec, InfisicalProviderSpec, MemoryProviderSpec, StoreProviderSpec,
    UniversalAuthSpec, VaultAppRoleAuthSpec, VaultAuthSpec, VaultKubernetesAuthSpec,
    VaultProviderSpec, VaultTokenAuthSpec,
};
pub use status::{Condition, DestinationSyncStatus, PushSecretStatus};
