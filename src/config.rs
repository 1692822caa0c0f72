//! Runtime configuration for the certificate signer
//!
//! Everything that used to be a process-wide constant (CA location, validity,
//! key algorithm, member selector) lives in [`SignerConfig`] and is handed to
//! the controller [`Context`](crate::controller::Context) at construction.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;

/// Default name of the secret holding the etcd CA
pub const DEFAULT_CA_SECRET_NAME: &str = "etcd-ca";

/// Default namespace of the secret holding the etcd CA
pub const DEFAULT_CA_SECRET_NAMESPACE: &str = "openshift-etcd";

/// Default validity of issued certificates: three 365-day years
pub const DEFAULT_CERT_VALIDITY: Duration = Duration::from_secs(3 * 365 * 24 * 60 * 60);

/// Label key identifying etcd member Pods
pub const DEFAULT_MEMBER_LABEL_KEY: &str = "k8s-app";

/// Label value identifying etcd member Pods
pub const DEFAULT_MEMBER_LABEL_VALUE: &str = "etcd";

/// Algorithm used for freshly generated member keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyAlgorithm {
    /// RSA with a 2048-bit modulus
    #[default]
    Rsa2048,
    /// RSA with a 3072-bit modulus
    Rsa3072,
    /// RSA with a 4096-bit modulus
    Rsa4096,
    /// ECDSA on P-256 with SHA-256
    EcdsaP256,
    /// ECDSA on P-384 with SHA-384
    EcdsaP384,
}

impl KeyAlgorithm {
    /// Every supported algorithm, in the order shown by `--help`
    pub const ALL: [KeyAlgorithm; 5] = [
        KeyAlgorithm::Rsa2048,
        KeyAlgorithm::Rsa3072,
        KeyAlgorithm::Rsa4096,
        KeyAlgorithm::EcdsaP256,
        KeyAlgorithm::EcdsaP384,
    ];

    /// Stable name used on the command line and in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa2048 => "rsa-2048",
            KeyAlgorithm::Rsa3072 => "rsa-3072",
            KeyAlgorithm::Rsa4096 => "rsa-4096",
            KeyAlgorithm::EcdsaP256 => "ecdsa-p256",
            KeyAlgorithm::EcdsaP384 => "ecdsa-p384",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyAlgorithm::ALL
            .into_iter()
            .find(|alg| alg.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                Error::validation(format!(
                    "unknown key algorithm '{}', expected one of: {}",
                    s,
                    KeyAlgorithm::ALL.map(|a| a.as_str()).join(", ")
                ))
            })
    }
}

/// Configuration shared by every reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerConfig {
    /// Name of the secret holding the CA certificate and key
    pub ca_secret_name: String,
    /// Namespace of the CA secret
    pub ca_secret_namespace: String,
    /// Lifetime of issued certificates
    pub cert_validity: Duration,
    /// Algorithm for newly generated member keys
    pub key_algorithm: KeyAlgorithm,
    /// Label key that marks a Pod as an etcd member
    pub member_label_key: String,
    /// Label value that marks a Pod as an etcd member
    pub member_label_value: String,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            ca_secret_name: DEFAULT_CA_SECRET_NAME.to_string(),
            ca_secret_namespace: DEFAULT_CA_SECRET_NAMESPACE.to_string(),
            cert_validity: DEFAULT_CERT_VALIDITY,
            key_algorithm: KeyAlgorithm::default(),
            member_label_key: DEFAULT_MEMBER_LABEL_KEY.to_string(),
            member_label_value: DEFAULT_MEMBER_LABEL_VALUE.to_string(),
        }
    }
}

impl SignerConfig {
    /// Check the configuration is usable before the controller starts
    pub fn validate(&self) -> Result<(), Error> {
        if self.ca_secret_name.is_empty() {
            return Err(Error::validation("CA secret name must not be empty"));
        }
        if self.ca_secret_namespace.is_empty() {
            return Err(Error::validation("CA secret namespace must not be empty"));
        }
        if self.cert_validity.is_zero() {
            return Err(Error::validation("certificate validity must be positive"));
        }
        if self.member_label_key.is_empty() {
            return Err(Error::validation("member label key must not be empty"));
        }
        Ok(())
    }
}
