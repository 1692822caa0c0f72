//! Member Pod reconciliation
//!
//! For every etcd member Pod the reconciler checks the member's peer and server
//! secrets. A secret without a certificate gets one signed by the etcd CA; a
//! populated secret is left alone. Each kind is handled independently so a
//! broken peer secret never blocks the server certificate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::identity::{self, CertKind};
use crate::member::MemberIdentity;
use crate::pki::{self, IssueOptions};
use crate::{Error, SignerConfig, CONTROLLER_NAME, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};

/// Delay before retrying a member whose reconciliation failed transiently
pub const ERROR_REQUEUE_INTERVAL: Duration = Duration::from_secs(10);

/// Trait abstracting secret reads and writes
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret, `None` if it does not exist
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Replace a secret with the given object
    ///
    /// The object's resource version is sent along, so a concurrent writer
    /// makes this fail with a conflict instead of being overwritten.
    async fn replace_secret(&self, secret: &Secret) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct SecretStoreImpl {
    client: Client,
}

impl SecretStoreImpl {
    /// Create a new SecretStoreImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for SecretStoreImpl {
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<(), Error> {
        let name = secret.name_any();
        let namespace = secret
            .namespace()
            .ok_or_else(|| Error::validation(format!("secret {} has no namespace", name)))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(CONTROLLER_NAME.to_string()),
            ..Default::default()
        };
        api.replace(&name, &params, secret).await?;
        Ok(())
    }
}

/// Controller context shared by all reconciliations
pub struct Context {
    /// Secret access (trait object for testability)
    pub secrets: Arc<dyn SecretStore>,
    /// Signer configuration
    pub config: SignerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with a mock secret store
    #[cfg(test)]
    pub fn for_testing(secrets: Arc<dyn SecretStore>, config: SignerConfig) -> Self {
        Self { secrets, config }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(SignerConfig::default())
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    secrets: Option<Arc<dyn SecretStore>>,
    config: SignerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            secrets: None,
            config: SignerConfig::default(),
        }
    }

    /// Set the signer configuration
    pub fn config(mut self, config: SignerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the secret store (primarily for testing)
    pub fn secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            secrets: self
                .secrets
                .unwrap_or_else(|| Arc::new(SecretStoreImpl::new(self.client.clone()))),
            config: self.config,
        }
    }
}

/// Reconcile an etcd member Pod
///
/// Non-members are ignored. Members need the CA first: a missing or
/// incomplete CA fails the whole reconciliation before any target secret is
/// read. After that each issued kind is handled on its own and the failures
/// are reported together.
#[instrument(skip(pod, ctx), fields(pod = %pod.name_any()))]
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    let member = MemberIdentity::from_pod(&pod)?;
    if !member.is_cluster_member(&ctx.config) {
        debug!("not an etcd member, skipping");
        return Ok(Action::await_change());
    }

    let ca_secret = ctx
        .secrets
        .get_secret(&ctx.config.ca_secret_name, &ctx.config.ca_secret_namespace)
        .await?
        .ok_or_else(|| Error::CaMissing {
            name: ctx.config.ca_secret_name.clone(),
            namespace: ctx.config.ca_secret_namespace.clone(),
        })?;
    identity::validate_ca(&ca_secret)?;

    let mut issued = 0;
    let mut failures = Vec::new();
    for kind in CertKind::ISSUED {
        match ensure_certificate(&member, kind, &ca_secret, &ctx).await {
            Ok(true) => issued += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(%kind, error = %e, "failed to ensure member certificate");
                failures.push(e);
            }
        }
    }

    match Error::aggregate(failures) {
        Some(e) => Err(e),
        None => {
            if issued > 0 {
                info!(issued, "member certificates issued");
            }
            Ok(Action::await_change())
        }
    }
}

/// Populate one member secret if it has no certificate yet
///
/// Returns whether a certificate was written.
async fn ensure_certificate(
    member: &MemberIdentity,
    kind: CertKind,
    ca_secret: &Secret,
    ctx: &Context,
) -> Result<bool, Error> {
    let name = identity::target_secret_name(&member.name, kind);
    let target = ctx
        .secrets
        .get_secret(&name, &member.namespace)
        .await?
        .ok_or_else(|| Error::SecretNotFound {
            name: name.clone(),
            namespace: member.namespace.clone(),
        })?;

    if identity::has_certificate(&target) {
        debug!(secret = %name, %kind, "certificate already present");
        return Ok(false);
    }

    // key generation is CPU bound, keep it off the reactor
    let options = IssueOptions::from(&ctx.config);
    let (ca, unsigned) = (ca_secret.clone(), target.clone());
    let issued = tokio::task::spawn_blocking(move || {
        pki::issue_for_target(&ca, &unsigned, kind, &options)
    })
    .await
    .map_err(|e| Error::signing(format!("issuance task for {} failed: {}", name, e)))??;

    let annotations = issued.annotations()?;
    let not_after = issued.not_after;

    let mut updated = target;
    let data = updated.data.get_or_insert_with(BTreeMap::new);
    data.insert(
        TLS_CERT_KEY.to_string(),
        ByteString(issued.cert_pem.into_bytes()),
    );
    data.insert(
        TLS_PRIVATE_KEY_KEY.to_string(),
        ByteString(issued.key_pem.into_bytes()),
    );
    updated
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .extend(annotations);

    ctx.secrets.replace_secret(&updated).await?;
    info!(secret = %name, %kind, %not_after, "issued member certificate");
    Ok(true)
}

/// Error policy for the controller
///
/// Transient failures are retried after [`ERROR_REQUEUE_INTERVAL`]. Failures
/// that need an edit to the Pod or its secrets wait for that change.
pub fn error_policy(pod: Arc<Pod>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(
            %error,
            pod = %pod.name_any(),
            "reconciliation failed, will retry"
        );
        Action::requeue(ERROR_REQUEUE_INTERVAL)
    } else {
        error!(
            %error,
            pod = %pod.name_any(),
            "reconciliation failed, waiting for a change"
        );
        Action::await_change()
    }
}

/// Map a changed member secret back to the Pod that owns it
pub fn pod_for_secret(secret: Secret) -> Option<ObjectRef<Pod>> {
    let namespace = secret.namespace()?;
    let name = secret.name_any();
    let (member, _) = identity::member_for_secret(&name)?;
    Some(ObjectRef::new(member).within(&namespace))
}
