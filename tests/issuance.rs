//! Integration tests for member certificate issuance
//!
//! These tests drive the public API the way the controller binary does: an
//! in-memory secret store stands in for the API server, and every issued
//! certificate is parsed back and checked against the CA.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, DnValue, IsCa, KeyPair, KeyUsagePurpose,
};

use etcd_cert_signer::controller::{reconcile, Context, SecretStore};
use etcd_cert_signer::identity::{CertKind, CertificateRequest};
use etcd_cert_signer::pki::{issue_for_target, CertificateAuthority, CertificateInfo, IssueOptions};
use etcd_cert_signer::{
    Error, KeyAlgorithm, SignerConfig, CERTIFICATE_ETCD_IDENTITY_ANNOTATION,
    CERTIFICATE_HOSTNAMES_ANNOTATION, CERTIFICATE_ISSUER_ANNOTATION, TLS_CERT_KEY,
    TLS_PRIVATE_KEY_KEY,
};

// =============================================================================
// Test Fixtures
// =============================================================================

const NAMESPACE: &str = "openshift-etcd";
const HOSTNAMES: &str = "localhost,etcd-0.etcd.test,*.etcd.test,10.10.10.10";

/// Self-signed CA shaped like the one the installer creates
fn etcd_ca() -> (String, String) {
    ca_named(&[
        (DnType::OrganizationalUnitName, "openshift"),
        (DnType::CommonName, "etcd-signer"),
    ])
}

fn ca_named(subject: &[(DnType, &str)]) -> (String, String) {
    let mut params = CertificateParams::default();
    for (ty, value) in subject {
        params
            .distinguished_name
            .push(ty.clone(), DnValue::Utf8String(value.to_string()));
    }
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let key = KeyPair::generate().expect("CA key");
    let cert = params.self_signed(&key).expect("CA certificate");
    (cert.pem(), key.serialize_pem())
}

fn secret(name: &str, data: &[(&str, &str)], annotations: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn ca_secret(cert: &str, key: &str) -> Secret {
    secret("etcd-ca", &[(TLS_CERT_KEY, cert), (TLS_PRIVATE_KEY_KEY, key)], &[])
}

fn target(name: &str, identity: &str) -> Secret {
    secret(
        name,
        &[],
        &[
            (CERTIFICATE_HOSTNAMES_ANNOTATION, HOSTNAMES),
            (CERTIFICATE_ETCD_IDENTITY_ANNOTATION, identity),
        ],
    )
}

fn member_pod(name: &str) -> Arc<Pod> {
    Arc::new(Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([("k8s-app".to_string(), "etcd".to_string())])),
            ..Default::default()
        },
        ..Default::default()
    })
}

fn fast_options() -> IssueOptions {
    IssueOptions {
        key_algorithm: KeyAlgorithm::EcdsaP256,
        ..Default::default()
    }
}

/// Secret store backed by a map, standing in for the API server
#[derive(Default)]
struct InMemoryStore {
    secrets: Mutex<BTreeMap<String, Secret>>,
    writes: Mutex<usize>,
}

impl InMemoryStore {
    fn with(secrets: Vec<Secret>) -> Arc<Self> {
        Arc::new(Self {
            secrets: Mutex::new(secrets.into_iter().map(|s| (s.name_any(), s)).collect()),
            writes: Mutex::new(0),
        })
    }

    fn get(&self, name: &str) -> Secret {
        self.secrets.lock().unwrap()[name].clone()
    }

    fn writes(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

#[async_trait]
impl SecretStore for InMemoryStore {
    async fn get_secret(&self, name: &str, _namespace: &str) -> Result<Option<Secret>, Error> {
        Ok(self.secrets.lock().unwrap().get(name).cloned())
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<(), Error> {
        *self.writes.lock().unwrap() += 1;
        self.secrets
            .lock()
            .unwrap()
            .insert(secret.name_any(), secret.clone());
        Ok(())
    }
}

fn context(store: Arc<InMemoryStore>) -> Arc<Context> {
    Arc::new(Context {
        secrets: store,
        config: SignerConfig {
            key_algorithm: KeyAlgorithm::EcdsaP256,
            ..Default::default()
        },
    })
}

fn cert_of(secret: &Secret) -> CertificateInfo {
    let bytes = &secret.data.as_ref().expect("data")[TLS_CERT_KEY].0;
    CertificateInfo::from_pem(std::str::from_utf8(bytes).expect("PEM text")).expect("certificate")
}

// =============================================================================
// Issuance API
// =============================================================================

/// Story: issuing a peer certificate against the installer's CA
///
/// The certificate carries the requested identity and every hostname, and
/// verifies against the CA certificate.
#[test]
fn story_peer_certificate_matches_request() {
    let (ca_cert, ca_key) = etcd_ca();
    let issued = issue_for_target(
        &ca_secret(&ca_cert, &ca_key),
        &target("etcd-0-peer", "system:peer:etcd-0.etcd.test"),
        CertKind::Peer,
        &fast_options(),
    )
    .expect("issuance succeeds");

    let info = CertificateInfo::from_pem(&issued.cert_pem).expect("parse");
    assert!(info.verify_signed_by(&ca_cert).expect("verify"));
    assert_eq!(
        info.subject_common_name.as_deref(),
        Some("system:peer:etcd-0.etcd.test")
    );
    assert_eq!(info.subject_organization.as_deref(), Some("system:peers"));
    assert_eq!(info.issuer_common_name.as_deref(), Some("etcd-signer"));
    assert_eq!(info.dns_names.len(), 3);
    assert_eq!(
        info.ip_addresses,
        vec![IpAddr::V4(Ipv4Addr::new(10, 10, 10, 10))]
    );
    assert_eq!(
        info.not_after - info.not_before,
        time::Duration::hours(3 * 365 * 24)
    );
}

#[test]
fn loaded_ca_issues_repeatedly_with_distinct_serials() {
    let (ca_cert, ca_key) = etcd_ca();
    let ca = CertificateAuthority::from_pem(&ca_cert, &ca_key).expect("CA loads");
    let request = CertificateRequest::from_target(
        &target("etcd-1-server", "system:server:etcd-1.etcd.test"),
        CertKind::Server,
    )
    .expect("request");

    let first = ca.issue(&request, &fast_options()).expect("first");
    let second = ca.issue(&request, &fast_options()).expect("second");

    let (a, b) = (
        CertificateInfo::from_pem(&first.cert_pem).unwrap(),
        CertificateInfo::from_pem(&second.cert_pem).unwrap(),
    );
    assert_ne!(a.serial, b.serial);
    assert_ne!(first.key_pem, second.key_pem);
    assert_eq!(a.subject_organization.as_deref(), Some("system:servers"));
}

#[test]
fn default_options_issue_rsa_certificates() {
    let (ca_cert, ca_key) = etcd_ca();
    let issued = issue_for_target(
        &ca_secret(&ca_cert, &ca_key),
        &target("etcd-2-peer", "system:peer:etcd-2.etcd.test"),
        CertKind::Peer,
        &IssueOptions::default(),
    )
    .expect("RSA issuance succeeds");

    let info = CertificateInfo::from_pem(&issued.cert_pem).expect("parse");
    assert!(info.verify_signed_by(&ca_cert).expect("verify"));
    assert_eq!(info.serial.len(), 20);
    assert_eq!(info.issuer, CertificateInfo::from_pem(&ca_cert).unwrap().subject);
}

#[test]
fn incomplete_ca_is_rejected() {
    let (ca_cert, _) = etcd_ca();
    let result = issue_for_target(
        &secret("etcd-ca", &[(TLS_CERT_KEY, ca_cert.as_str())], &[]),
        &target("etcd-0-peer", "system:peer:etcd-0.etcd.test"),
        CertKind::Peer,
        &fast_options(),
    );
    assert!(matches!(result, Err(Error::InvalidCa(_))));
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Story: a three-member cluster is installed
///
/// Every member gets both certificates on its first reconciliation, and a
/// second pass over the same members writes nothing.
#[tokio::test]
async fn story_cluster_bootstrap_then_steady_state() {
    let (ca_cert, ca_key) = etcd_ca();
    let mut secrets = vec![ca_secret(&ca_cert, &ca_key)];
    for i in 0..3 {
        secrets.push(target(
            &format!("etcd-{i}-peer"),
            &format!("system:peer:etcd-{i}.etcd.test"),
        ));
        secrets.push(target(
            &format!("etcd-{i}-server"),
            &format!("system:server:etcd-{i}.etcd.test"),
        ));
    }
    let store = InMemoryStore::with(secrets);
    let ctx = context(store.clone());

    for i in 0..3 {
        let action = reconcile(member_pod(&format!("etcd-{i}")), ctx.clone())
            .await
            .expect("first reconcile succeeds");
        assert_eq!(action, Action::await_change());
    }
    assert_eq!(store.writes(), 6);

    for i in 0..3 {
        for kind in ["peer", "server"] {
            let written = store.get(&format!("etcd-{i}-{kind}"));
            assert!(cert_of(&written).verify_signed_by(&ca_cert).unwrap());
            assert_eq!(
                written.annotations()[CERTIFICATE_ISSUER_ANNOTATION],
                "etcd-signer"
            );
        }
    }

    let before = store.get("etcd-0-peer");
    for i in 0..3 {
        reconcile(member_pod(&format!("etcd-{i}")), ctx.clone())
            .await
            .expect("steady state reconcile succeeds");
    }
    assert_eq!(store.writes(), 6);
    assert_eq!(store.get("etcd-0-peer"), before);
}

/// Story: the operator fixes a broken secret after the first attempt failed
#[tokio::test]
async fn story_fixed_annotation_is_picked_up() {
    let (ca_cert, ca_key) = etcd_ca();
    let broken = secret(
        "etcd-0-peer",
        &[],
        &[(CERTIFICATE_ETCD_IDENTITY_ANNOTATION, "system:peer:etcd-0.etcd.test")],
    );
    let store = InMemoryStore::with(vec![
        ca_secret(&ca_cert, &ca_key),
        broken,
        target("etcd-0-server", "system:server:etcd-0.etcd.test"),
    ]);
    let ctx = context(store.clone());

    let err = reconcile(member_pod("etcd-0"), ctx.clone())
        .await
        .expect_err("peer secret is incomplete");
    assert!(!err.is_retryable());
    assert_eq!(store.writes(), 1);

    store.secrets.lock().unwrap().insert(
        "etcd-0-peer".to_string(),
        target("etcd-0-peer", "system:peer:etcd-0.etcd.test"),
    );
    reconcile(member_pod("etcd-0"), ctx)
        .await
        .expect("fixed secret reconciles");
    assert_eq!(store.writes(), 2);
    assert_eq!(
        cert_of(&store.get("etcd-0-peer")).dns_names,
        vec!["localhost", "etcd-0.etcd.test", "*.etcd.test"]
    );
}

/// Story: the CA secret holds a CA whose name lacks the signer OU
///
/// Nothing is written, so the slots stay empty and get filled once the CA is
/// replaced with a correctly named one.
#[tokio::test]
async fn story_misnamed_ca_leaves_slots_empty() {
    let (bad_cert, bad_key) = ca_named(&[(DnType::CommonName, "etcd-signer")]);
    let store = InMemoryStore::with(vec![
        ca_secret(&bad_cert, &bad_key),
        target("etcd-0-peer", "system:peer:etcd-0.etcd.test"),
        target("etcd-0-server", "system:server:etcd-0.etcd.test"),
    ]);
    let ctx = context(store.clone());

    let err = reconcile(member_pod("etcd-0"), ctx.clone())
        .await
        .expect_err("misnamed CA is refused");
    assert!(err.is_retryable());
    assert_eq!(store.writes(), 0);

    let (ca_cert, ca_key) = etcd_ca();
    store
        .secrets
        .lock()
        .unwrap()
        .insert("etcd-ca".to_string(), ca_secret(&ca_cert, &ca_key));
    reconcile(member_pod("etcd-0"), ctx)
        .await
        .expect("replaced CA reconciles");
    assert_eq!(store.writes(), 2);
    assert!(cert_of(&store.get("etcd-0-server"))
        .verify_signed_by(&ca_cert)
        .unwrap());
}
