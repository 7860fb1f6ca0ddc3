//! # CRD Generator
//!
//! Prints the `PushSecret` and `ClusterSecretStore` CustomResourceDefinitions
//! as a multi-document YAML stream.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/crds.yaml
//!
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::core::CustomResourceExt;
use push_secret_controller::crd::{ClusterSecretStore, PushSecret};

fn main() {
    let crds = [PushSecret::crd(), ClusterSecretStore::crd()];

    for crd in &crds {
        match serde_yaml::to_string(crd) {
            Ok(yaml) => {
                println!("---");
                print!("{yaml}");
            }
            Err(e) => {
                eprintln!("Failed to serialize CRD to YAML: {e}");
                std::process::exit(1);
            }
        }
    }
}
