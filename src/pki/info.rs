//! Read-only inspection of issued certificates

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ::time::OffsetDateTime;
use x509_parser::prelude::*;

use crate::{Error, Result};

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| Error::validation(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Fields of a certificate the controller cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Raw serial number bytes
    pub serial: Vec<u8>,
    /// Full subject name, e.g. `OU=openshift, CN=etcd-signer`
    pub subject: String,
    /// Full issuer name
    pub issuer: String,
    /// Subject CN
    pub subject_common_name: Option<String>,
    /// Subject O
    pub subject_organization: Option<String>,
    /// Issuer CN
    pub issuer_common_name: Option<String>,
    /// Issuer OU
    pub issuer_organizational_unit: Option<String>,
    /// Start of validity
    pub not_before: OffsetDateTime,
    /// End of validity
    pub not_after: OffsetDateTime,
    /// DNS SANs in certificate order
    pub dns_names: Vec<String>,
    /// IP SANs in certificate order
    pub ip_addresses: Vec<IpAddr>,
    /// Basic constraints CA flag
    pub is_ca: bool,
    /// Key usage: digital signature
    pub digital_signature: bool,
    /// Key usage: key encipherment
    pub key_encipherment: bool,
    /// Extended key usage: TLS server
    pub server_auth: bool,
    /// Extended key usage: TLS client
    pub client_auth: bool,
    der: Vec<u8>,
}

fn first_attr<'a, 'b: 'a>(
    mut attrs: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
) -> Option<String> {
    attrs
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes)
            .ok()
            .map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

impl CertificateInfo {
    /// Inspect a PEM-encoded certificate
    pub fn from_pem(cert_pem: &str) -> Result<Self> {
        let der = parse_pem(cert_pem)?;
        Self::from_der(&der)
    }

    /// Inspect a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::validation(format!("failed to parse certificate: {}", e)))?;

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let (digital_signature, key_encipherment) = match cert.key_usage() {
            Ok(Some(ku)) => (ku.value.digital_signature(), ku.value.key_encipherment()),
            _ => (false, false),
        };
        let (server_auth, client_auth) = match cert.extended_key_usage() {
            Ok(Some(eku)) => (eku.value.server_auth, eku.value.client_auth),
            _ => (false, false),
        };

        Ok(Self {
            serial: cert.raw_serial().to_vec(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            subject_common_name: first_attr(cert.subject().iter_common_name()),
            subject_organization: first_attr(cert.subject().iter_organization()),
            issuer_common_name: first_attr(cert.issuer().iter_common_name()),
            issuer_organizational_unit: first_attr(cert.issuer().iter_organizational_unit()),
            not_before: cert.validity().not_before.to_datetime(),
            not_after: cert.validity().not_after.to_datetime(),
            dns_names,
            ip_addresses,
            is_ca: cert.is_ca(),
            digital_signature,
            key_encipherment,
            server_auth,
            client_auth,
            der: der.to_vec(),
        })
    }

    /// Check the certificate signature against a CA certificate
    ///
    /// `Ok(false)` means the certificate was not signed by that CA.
    pub fn verify_signed_by(&self, ca_cert_pem: &str) -> Result<bool> {
        let ca_der = parse_pem(ca_cert_pem)?;
        let (_, ca_cert) = X509Certificate::from_der(&ca_der)
            .map_err(|e| Error::validation(format!("failed to parse CA cert: {}", e)))?;
        let (_, cert) = X509Certificate::from_der(&self.der)
            .map_err(|e| Error::validation(format!("failed to parse certificate: {}", e)))?;

        Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
    }

    /// Whether the certificate is valid at `at`
    pub fn is_valid_at(&self, at: OffsetDateTime) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}
