//! etcd-cert-signer - issues etcd member certificates from a cluster CA
//!
//! Every etcd member runs as a Pod labelled `k8s-app=etcd`. For each member the
//! controller guarantees that two TLS secrets carry key material signed by the
//! shared etcd CA:
//!
//! - `<member>-peer`: member-to-member mTLS (`O=system:peers`)
//! - `<member>-server`: client-to-member TLS (`O=system:servers`)
//!
//! The target secrets are created ahead of time by the installer with two
//! annotations describing the certificate to issue (SAN list and subject CN).
//! The controller fills in `tls.crt`/`tls.key` once and never touches a
//! populated secret again.
//!
//! # Modules
//!
//! - [`member`] - decides which Pods are etcd members
//! - [`identity`] - secret naming and typed access to the issuance annotations
//! - [`pki`] - certificate issuance against the etcd CA
//! - [`controller`] - reconciliation of member Pods against their secrets
//! - [`config`] - runtime configuration
//! - [`error`] - error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod member;
pub mod pki;

pub use config::{KeyAlgorithm, SignerConfig};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Secret and annotation contract
// =============================================================================
// These keys are shared with the installer that pre-creates the target secrets
// and with etcd itself, which mounts the resulting TLS secrets.

/// Secret data key holding the PEM-encoded certificate
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Secret data key holding the PEM-encoded private key
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Annotation recording when the issued certificate becomes valid (RFC 3339)
pub const CERTIFICATE_NOT_BEFORE_ANNOTATION: &str = "auth.openshift.io/certificate-not-before";

/// Annotation recording when the issued certificate expires (RFC 3339)
pub const CERTIFICATE_NOT_AFTER_ANNOTATION: &str = "auth.openshift.io/certificate-not-after";

/// Annotation recording the common name of the signer that issued the certificate
pub const CERTIFICATE_ISSUER_ANNOTATION: &str = "auth.openshift.io/certificate-issuer";

/// Annotation listing the SANs for the certificate, comma separated
pub const CERTIFICATE_HOSTNAMES_ANNOTATION: &str = "auth.openshift.io/certificate-hostnames";

/// Annotation holding the subject common name of the etcd member identity
pub const CERTIFICATE_ETCD_IDENTITY_ANNOTATION: &str =
    "auth.openshift.io/certificate-etcd-identity";

/// Field manager recorded on secret writes
pub const CONTROLLER_NAME: &str = "etcd-cert-signer";
