//! Certificate identities for etcd members
//!
//! Each member owns one secret per certificate kind, named after the Pod:
//!
//! | kind    | secret name         | subject O        | signer               |
//! |---------|---------------------|------------------|----------------------|
//! | peer    | `<member>-peer`     | `system:peers`   | `etcd-signer`        |
//! | server  | `<member>-server`   | `system:servers` | `etcd-signer`        |
//! | metrics | `<member>-metrics`  | (not issued)     | `etcd-metric-signer` |
//!
//! The installer pre-creates these secrets with the SAN list and subject CN as
//! annotations. [`TargetAnnotations`] gives typed access to them so required
//! and optional fields are explicit.

use std::fmt;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use crate::member::MemberIdentity;
use crate::{
    Error, CERTIFICATE_ETCD_IDENTITY_ANNOTATION, CERTIFICATE_HOSTNAMES_ANNOTATION,
    CERTIFICATE_ISSUER_ANNOTATION, CERTIFICATE_NOT_AFTER_ANNOTATION,
    CERTIFICATE_NOT_BEFORE_ANNOTATION, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
};

/// Common name of the signer for peer and server certificates
pub const ETCD_SIGNER_CN: &str = "etcd-signer";

/// Common name of the signer for metrics certificates
pub const ETCD_METRIC_SIGNER_CN: &str = "etcd-metric-signer";

/// Organizational unit placed in the issuer name of every certificate
pub const SIGNER_ORGANIZATIONAL_UNIT: &str = "openshift";

/// The certificate kinds a member can own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertKind {
    /// Member-to-member mTLS certificate
    Peer,
    /// Client-to-member TLS certificate
    Server,
    /// Metrics endpoint certificate (reserved, never issued)
    Metrics,
}

impl CertKind {
    /// Kinds the controller issues for every member, in reconciliation order
    pub const ISSUED: [CertKind; 2] = [CertKind::Peer, CertKind::Server];

    /// Suffix appended to the member name to form the secret name
    pub fn secret_suffix(&self) -> &'static str {
        match self {
            CertKind::Peer => "-peer",
            CertKind::Server => "-server",
            CertKind::Metrics => "-metrics",
        }
    }

    /// Subject organization for certificates of this kind
    ///
    /// `None` for kinds the controller does not issue.
    pub fn organization(&self) -> Option<&'static str> {
        match self {
            CertKind::Peer => Some("system:peers"),
            CertKind::Server => Some("system:servers"),
            CertKind::Metrics => None,
        }
    }

    /// Short lowercase name for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            CertKind::Peer => "peer",
            CertKind::Server => "server",
            CertKind::Metrics => "metrics",
        }
    }
}

impl fmt::Display for CertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the secret holding a member's certificate of the given kind
pub fn target_secret_name(member_name: &str, kind: CertKind) -> String {
    format!("{}{}", member_name, kind.secret_suffix())
}

/// Name of the member's peer certificate secret
pub fn peer_secret_name(member: &MemberIdentity) -> String {
    target_secret_name(&member.name, CertKind::Peer)
}

/// Name of the member's server certificate secret
pub fn server_secret_name(member: &MemberIdentity) -> String {
    target_secret_name(&member.name, CertKind::Server)
}

/// Name of the member's metrics certificate secret (reserved)
pub fn metrics_secret_name(member: &MemberIdentity) -> String {
    target_secret_name(&member.name, CertKind::Metrics)
}

/// Map a secret name back to the member that owns it
///
/// Only issued kinds are considered; returns `None` for unrelated secrets or
/// a bare suffix with no member name.
pub fn member_for_secret(secret_name: &str) -> Option<(&str, CertKind)> {
    CertKind::ISSUED.into_iter().find_map(|kind| {
        secret_name
            .strip_suffix(kind.secret_suffix())
            .filter(|member| !member.is_empty())
            .map(|member| (member, kind))
    })
}

/// Resolve the signer common name from the target secret's own name
///
/// Substring match in order: `peer` or `server` select the etcd signer,
/// `metric` the metrics signer.
pub fn signer_common_name(secret_name: &str) -> Result<&'static str, Error> {
    if secret_name.contains("peer") || secret_name.contains("server") {
        return Ok(ETCD_SIGNER_CN);
    }
    if secret_name.contains("metric") {
        return Ok(ETCD_METRIC_SIGNER_CN);
    }
    Err(Error::UnrecognizedTargetName(secret_name.to_string()))
}

/// Whether the secret already carries a certificate
///
/// An absent or empty `tls.crt` counts as unpopulated. Nothing else about the
/// stored certificate (expiry, issuer, SANs) is examined.
pub fn has_certificate(secret: &Secret) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(TLS_CERT_KEY))
        .is_some_and(|cert| !cert.0.is_empty())
}

/// Typed view over the issuance annotations of a target secret
pub struct TargetAnnotations<'a> {
    secret: &'a Secret,
}

impl<'a> TargetAnnotations<'a> {
    /// Wrap a target secret
    pub fn new(secret: &'a Secret) -> Self {
        Self { secret }
    }

    fn secret_name(&self) -> String {
        self.secret.name_any()
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    fn require(&self, key: &'static str) -> Result<&'a str, Error> {
        self.get(key)
            .ok_or_else(|| Error::missing_annotation(self.secret_name(), key))
    }

    /// SAN entries for the certificate (required)
    ///
    /// The annotation is split on `,` as-is: tokens are not trimmed and
    /// empty tokens are kept, so `"a, b"` yields `"a"` and `" b"`.
    pub fn hostnames(&self) -> Result<Vec<String>, Error> {
        let raw = self.require(CERTIFICATE_HOSTNAMES_ANNOTATION)?;
        Ok(raw.split(',').map(str::to_string).collect())
    }

    /// Subject common name for the member certificate (required)
    pub fn etcd_identity(&self) -> Result<&'a str, Error> {
        self.require(CERTIFICATE_ETCD_IDENTITY_ANNOTATION)
    }

    /// Signer CN recorded by a previous issuance
    pub fn issuer(&self) -> Option<&'a str> {
        self.get(CERTIFICATE_ISSUER_ANNOTATION)
    }

    /// Validity start recorded by a previous issuance
    pub fn not_before(&self) -> Option<&'a str> {
        self.get(CERTIFICATE_NOT_BEFORE_ANNOTATION)
    }

    /// Expiry recorded by a previous issuance
    pub fn not_after(&self) -> Option<&'a str> {
        self.get(CERTIFICATE_NOT_AFTER_ANNOTATION)
    }
}

/// Everything needed to sign one member certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    /// Kind of certificate
    pub kind: CertKind,
    /// Secret that will receive the certificate
    pub target_name: String,
    /// Namespace of the target secret
    pub target_namespace: String,
    /// SAN entries, DNS names or IP literals
    pub hostnames: Vec<String>,
    /// Subject common name
    pub subject_identity: String,
    /// Subject organization
    pub organization: &'static str,
    /// Issuer common name
    pub signer_common_name: &'static str,
}

impl CertificateRequest {
    /// Derive the request from the kind's own target secret
    ///
    /// Hostnames and identity always come from `target`, never from a sibling
    /// secret of another kind.
    pub fn from_target(target: &Secret, kind: CertKind) -> Result<Self, Error> {
        let target_name = target.name_any();
        let organization = kind.organization().ok_or_else(|| {
            Error::validation(format!(
                "{} certificates are not issued (secret {})",
                kind, target_name
            ))
        })?;

        let annotations = TargetAnnotations::new(target);
        let hostnames = annotations.hostnames()?;
        let subject_identity = annotations.etcd_identity()?.to_string();
        let signer_common_name = signer_common_name(&target_name)?;

        Ok(Self {
            kind,
            target_namespace: target.namespace().unwrap_or_default(),
            target_name,
            hostnames,
            subject_identity,
            organization,
            signer_common_name,
        })
    }
}

/// CA certificate and key as read from the CA secret
#[derive(Clone)]
pub struct CaMaterial {
    /// PEM-encoded CA certificate
    pub cert_pem: String,
    /// PEM-encoded CA private key
    pub key_pem: String,
}

impl fmt::Debug for CaMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaMaterial")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Check the CA secret carries both halves of the key pair
///
/// Fails with [`Error::InvalidCa`] when either `tls.crt` or `tls.key` is
/// absent, empty, or not UTF-8 text.
pub fn validate_ca(secret: &Secret) -> Result<CaMaterial, Error> {
    let name = secret.name_any();
    let field = |key: &str, what: &str| -> Result<String, Error> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .filter(|value| !value.0.is_empty())
            .ok_or_else(|| Error::invalid_ca(format!("{} not found in secret {}", what, name)))?;
        String::from_utf8(bytes.0.clone())
            .map_err(|_| Error::invalid_ca(format!("{} in secret {} is not PEM text", what, name)))
    };

    Ok(CaMaterial {
        cert_pem: field(TLS_CERT_KEY, "CA certificate")?,
        key_pem: field(TLS_PRIVATE_KEY_KEY, "CA private key")?,
    })
}
