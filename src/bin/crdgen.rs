//! # CRD Generator
//!
//! Generates the Kubernetes CustomResourceDefinition YAML for `Tenant` and
//! `NamespaceManagement` from the Rust type definitions.
//!
//! ## Usage
//!
//! ```bash
//! # Generate CRD YAML
//! cargo run --bin crdgen > config/crd/tenancy.yaml
//!
//! # Generate and apply directly
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::core::CustomResourceExt;
use tenant_controller::crd::{NamespaceManagement, Tenant};

fn main() {
    let crds = [Tenant::crd(), NamespaceManagement::crd()];

    println!("# This file is auto-generated by crdgen");
    println!("# DO NOT EDIT THIS FILE MANUALLY");
    println!("# Change the types in src/crd and regenerate");
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
