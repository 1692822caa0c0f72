//! Controller for etcd member certificates
//!
//! Watches member Pods and their certificate secrets, and fills unpopulated
//! secrets with key material signed by the etcd CA.

mod signer;

pub use signer::{
    error_policy, pod_for_secret, reconcile, Context, ContextBuilder, SecretStore,
    SecretStoreImpl, ERROR_REQUEUE_INTERVAL,
};

#[cfg(test)]
pub use signer::MockSecretStore;
