//! etcd member discovery
//!
//! A Pod is an etcd member iff it carries the member label with the exact
//! member value (`k8s-app=etcd` by default). Nothing else about the Pod is
//! consulted.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::{Error, SignerConfig};

/// Identity of one etcd member as seen by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberIdentity {
    /// Pod name, stable for the lifetime of the member
    pub name: String,
    /// Namespace holding the Pod and its certificate secrets
    pub namespace: String,
    /// Pod labels
    pub labels: BTreeMap<String, String>,
}

impl MemberIdentity {
    /// Build the member identity from a watched Pod
    ///
    /// Pods are namespaced, so a Pod without a namespace means the object was
    /// not read from the API server.
    pub fn from_pod(pod: &Pod) -> Result<Self, Error> {
        let name = pod.name_any();
        let namespace = pod
            .namespace()
            .ok_or_else(|| Error::validation(format!("pod {} has no namespace", name)))?;

        Ok(Self {
            name,
            namespace,
            labels: pod.labels().clone(),
        })
    }

    /// Whether this member is in scope for certificate issuance
    pub fn is_cluster_member(&self, config: &SignerConfig) -> bool {
        is_cluster_member(&self.labels, config)
    }
}

/// Check whether a label set marks an etcd member
///
/// Exact, case-sensitive comparison of the configured label value; no prefix
/// or wildcard matching.
pub fn is_cluster_member(labels: &BTreeMap<String, String>, config: &SignerConfig) -> bool {
    labels
        .get(&config.member_label_key)
        .is_some_and(|value| *value == config.member_label_value)
}
