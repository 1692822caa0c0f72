//! Certificate issuance for etcd members
//!
//! The etcd CA lives in a single secret. For every issuance the CA key pair is
//! loaded from PEM, used to sign one freshly generated member key, and dropped.
//! Nothing about the CA is cached between reconciliations.
//!
//! # Issued certificates
//!
//! - Subject: `CN=<etcd identity>, O=system:peers|system:servers`
//! - Issuer: `OU=openshift, CN=etcd-signer`, copied from the CA subject
//! - SANs: one entry per hostname token, IP literals as IP SANs
//! - Key usage: digital signature and key encipherment
//! - Extended key usage: server and client auth
//! - Validity: now until now plus the configured lifetime
//! - Serial: 159 random bits, unique per certificate

mod info;

pub use info::{parse_pem, CertificateInfo};

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use rand::RngCore;
use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, RsaKeySize, SanType,
    SerialNumber, PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384, PKCS_RSA_SHA256,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::config::KeyAlgorithm;
use crate::identity::{self, CertKind, CertificateRequest, SIGNER_ORGANIZATIONAL_UNIT};
use crate::{
    Error, Result, SignerConfig, CERTIFICATE_ISSUER_ANNOTATION, CERTIFICATE_NOT_AFTER_ANNOTATION,
    CERTIFICATE_NOT_BEFORE_ANNOTATION,
};

/// Length of generated serial numbers in bytes
const SERIAL_LEN: usize = 20;

/// Lifetime and key type for issued certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueOptions {
    /// How long issued certificates stay valid
    pub validity: Duration,
    /// Algorithm for the member key
    pub key_algorithm: KeyAlgorithm,
}

impl From<&SignerConfig> for IssueOptions {
    fn from(config: &SignerConfig) -> Self {
        Self {
            validity: config.cert_validity,
            key_algorithm: config.key_algorithm,
        }
    }
}

impl Default for IssueOptions {
    fn default() -> Self {
        Self::from(&SignerConfig::default())
    }
}

/// A freshly signed member certificate and its private key
pub struct IssuedCertificate {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 private key
    pub key_pem: String,
    /// Common name of the signer, recorded on the target secret
    pub issuer_common_name: String,
    /// Start of validity
    pub not_before: OffsetDateTime,
    /// End of validity
    pub not_after: OffsetDateTime,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("issuer_common_name", &self.issuer_common_name)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl IssuedCertificate {
    /// Issuance annotations to merge into the target secret
    pub fn annotations(&self) -> Result<BTreeMap<String, String>> {
        let format = |t: OffsetDateTime| {
            t.format(&Rfc3339)
                .map_err(|e| Error::signing(format!("failed to format timestamp: {}", e)))
        };

        Ok(BTreeMap::from([
            (
                CERTIFICATE_NOT_BEFORE_ANNOTATION.to_string(),
                format(self.not_before)?,
            ),
            (
                CERTIFICATE_NOT_AFTER_ANNOTATION.to_string(),
                format(self.not_after)?,
            ),
            (
                CERTIFICATE_ISSUER_ANNOTATION.to_string(),
                self.issuer_common_name.clone(),
            ),
        ]))
    }
}

/// The etcd CA loaded for the duration of one issuance
pub struct CertificateAuthority {
    /// CA signing key
    ca_key: KeyPair,
    /// PEM-encoded CA certificate
    ca_cert_pem: String,
    /// Full subject name of the CA certificate
    subject: String,
}

impl CertificateAuthority {
    /// Load the CA from its PEM certificate and key
    ///
    /// Both halves are parsed up front so a corrupt CA surfaces as
    /// [`Error::InvalidCa`] before any member key is generated.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::invalid_ca(format!("failed to parse CA key: {}", e)))?;

        let info = CertificateInfo::from_pem(cert_pem)
            .map_err(|e| Error::invalid_ca(format!("failed to parse CA certificate: {}", e)))?;

        Ok(Self {
            ca_key,
            ca_cert_pem: cert_pem.to_string(),
            subject: info.subject,
        })
    }

    /// Build the issuer for `signer_common_name` from the CA certificate
    ///
    /// Issued certificates copy the CA subject as their issuer name, so the CA
    /// must be named exactly `OU=openshift, CN=<signer>`. Any other subject
    /// would produce certificates that never chain, and is rejected.
    fn issuer(&self, signer_common_name: &str) -> Result<Issuer<'static, &KeyPair>> {
        let expected = expected_issuer_name(signer_common_name);
        if self.subject != expected {
            return Err(Error::invalid_ca(format!(
                "CA subject {:?} does not match signer name {:?}",
                self.subject, expected
            )));
        }

        Issuer::from_ca_cert_pem(&self.ca_cert_pem, &self.ca_key)
            .map_err(|e| Error::invalid_ca(format!("failed to create issuer: {}", e)))
    }

    /// Sign a member certificate for the request
    ///
    /// Generates a new key pair for every call; keys are never reused.
    pub fn issue(
        &self,
        request: &CertificateRequest,
        options: &IssueOptions,
    ) -> Result<IssuedCertificate> {
        let issuer = self.issuer(request.signer_common_name)?;

        let not_before = now()?;
        let not_after = not_before
            .checked_add(to_time_duration(options.validity)?)
            .ok_or_else(|| Error::validation("certificate validity overflows"))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&[
            (DnType::OrganizationName, request.organization),
            (DnType::CommonName, request.subject_identity.as_str()),
        ]);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.subject_alt_names = subject_alt_names(&request.hostnames)?;
        params.serial_number = Some(random_serial());
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = generate_key(options.key_algorithm)?;
        let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
            Error::signing(format!(
                "failed to sign certificate for {}: {}",
                request.target_name, e
            ))
        })?;

        debug!(
            secret = %request.target_name,
            kind = %request.kind,
            subject = %request.subject_identity,
            sans = request.hostnames.len(),
            "signed member certificate"
        );

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            issuer_common_name: request.signer_common_name.to_string(),
            not_before,
            not_after,
        })
    }
}

/// Issue a certificate for one target secret
///
/// Runs every gate in order and stops at the first failure: CA completeness,
/// hostnames, identity, signer name, key generation, signing. Nothing is
/// produced unless all of them pass.
pub fn issue_for_target(
    ca_secret: &Secret,
    target: &Secret,
    kind: CertKind,
    options: &IssueOptions,
) -> Result<IssuedCertificate> {
    let material = identity::validate_ca(ca_secret)?;
    let request = CertificateRequest::from_target(target, kind)?;
    let ca = CertificateAuthority::from_pem(&material.cert_pem, &material.key_pem)?;
    ca.issue(&request, options)
}

/// Issuer name every member certificate must carry, as printed by x509-parser
fn expected_issuer_name(signer_common_name: &str) -> String {
    format!("OU={}, CN={}", SIGNER_ORGANIZATIONAL_UNIT, signer_common_name)
}

/// Generate a member key pair with the configured algorithm
pub fn generate_key(algorithm: KeyAlgorithm) -> Result<KeyPair> {
    let generated = match algorithm {
        KeyAlgorithm::Rsa2048 => KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048),
        KeyAlgorithm::Rsa3072 => KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_3072),
        KeyAlgorithm::Rsa4096 => KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_4096),
        KeyAlgorithm::EcdsaP256 => KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256),
        KeyAlgorithm::EcdsaP384 => KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384),
    };
    generated.map_err(|e| Error::signing(format!("failed to generate {} key: {}", algorithm, e)))
}

/// Classify each hostname token as an IP or DNS SAN
///
/// Tokens that parse as IPv4 or IPv6 literals become IP SANs, everything else
/// is kept verbatim as a DNS SAN (wildcards included).
pub fn subject_alt_names(hostnames: &[String]) -> Result<Vec<SanType>> {
    hostnames
        .iter()
        .map(|host| match host.parse::<IpAddr>() {
            Ok(ip) => Ok(SanType::IpAddress(ip)),
            Err(_) => Ia5String::try_from(host.as_str())
                .map(SanType::DnsName)
                .map_err(|e| Error::validation(format!("invalid DNS name {:?}: {}", host, e))),
        })
        .collect()
}

fn distinguished_name(entries: &[(DnType, &str)]) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    for (ty, value) in entries {
        dn.push(ty.clone(), DnValue::Utf8String(value.to_string()));
    }
    dn
}

/// Random positive serial number
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; SERIAL_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    // keep the DER integer positive
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

/// Current time truncated to whole seconds, the precision of X.509 validity
fn now() -> Result<OffsetDateTime> {
    OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .map_err(|e| Error::signing(format!("failed to read clock: {}", e)))
}

fn to_time_duration(validity: Duration) -> Result<time::Duration> {
    time::Duration::try_from(validity)
        .map_err(|e| Error::validation(format!("invalid certificate validity: {}", e)))
}
