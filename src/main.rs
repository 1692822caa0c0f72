//! etcd-cert-signer - issues etcd member certificates from the cluster CA

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use etcd_cert_signer::config::{
    DEFAULT_CA_SECRET_NAME, DEFAULT_CA_SECRET_NAMESPACE, DEFAULT_MEMBER_LABEL_KEY,
    DEFAULT_MEMBER_LABEL_VALUE,
};
use etcd_cert_signer::controller::{error_policy, pod_for_secret, reconcile, Context};
use etcd_cert_signer::identity::TargetAnnotations;
use etcd_cert_signer::pki::CertificateInfo;
use etcd_cert_signer::{Error, KeyAlgorithm, SignerConfig, TLS_CERT_KEY};

/// etcd-cert-signer - fills etcd peer and server secrets with CA-signed certificates
#[derive(Parser, Debug)]
#[command(name = "etcd-cert-signer", version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, env = "LOG_FORMAT", default_value_t = LogFormat::Plain, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormat {
    /// Human readable lines
    Plain,
    /// One JSON object per line
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches etcd member Pods and their certificate secrets and issues
    /// certificates for any member secret that has none yet.
    Controller(ControllerArgs),

    /// Print the certificate held in a member secret
    Inspect(InspectArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Name of the secret holding the etcd CA
    #[arg(long, env = "ETCD_CA_SECRET_NAME", default_value = DEFAULT_CA_SECRET_NAME)]
    ca_secret_name: String,

    /// Namespace of the etcd CA secret
    #[arg(long, env = "ETCD_CA_SECRET_NAMESPACE", default_value = DEFAULT_CA_SECRET_NAMESPACE)]
    ca_secret_namespace: String,

    /// Lifetime of issued certificates in hours
    #[arg(long, env = "ETCD_CERT_VALIDITY_HOURS", default_value_t = 3 * 365 * 24)]
    cert_validity_hours: u64,

    /// Key algorithm for member keys (rsa-2048, rsa-3072, rsa-4096, ecdsa-p256, ecdsa-p384)
    #[arg(long, env = "ETCD_CERT_KEY_ALGORITHM", default_value = "rsa-2048")]
    key_algorithm: KeyAlgorithm,

    /// Label key marking etcd member Pods
    #[arg(long, env = "ETCD_MEMBER_LABEL_KEY", default_value = DEFAULT_MEMBER_LABEL_KEY)]
    member_label_key: String,

    /// Label value marking etcd member Pods
    #[arg(long, env = "ETCD_MEMBER_LABEL_VALUE", default_value = DEFAULT_MEMBER_LABEL_VALUE)]
    member_label_value: String,

    /// Only watch Pods and secrets in this namespace (all namespaces if unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        // parse from nothing so environment overrides still apply
        Self::parse_from(["controller"])
    }
}

impl ControllerArgs {
    fn signer_config(&self) -> Result<SignerConfig, Error> {
        let validity_secs = self.cert_validity_hours.checked_mul(60 * 60).ok_or_else(|| {
            Error::validation(format!(
                "certificate validity of {} hours is out of range",
                self.cert_validity_hours
            ))
        })?;

        Ok(SignerConfig {
            ca_secret_name: self.ca_secret_name.clone(),
            ca_secret_namespace: self.ca_secret_namespace.clone(),
            cert_validity: Duration::from_secs(validity_secs),
            key_algorithm: self.key_algorithm,
            member_label_key: self.member_label_key.clone(),
            member_label_value: self.member_label_value.clone(),
        })
    }
}

/// Inspect mode arguments
#[derive(Parser, Debug)]
struct InspectArgs {
    /// Name of the secret to inspect
    secret: String,

    /// Namespace of the secret
    #[arg(short, long, default_value = DEFAULT_CA_SECRET_NAMESPACE)]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube and rcgen both link aws-lc-rs; pick it explicitly for TLS
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Some(Commands::Inspect(args)) => run_inspect(args).await,
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Plain => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

/// Run the controller until a shutdown signal arrives
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let config = args
        .signer_config()
        .and_then(|config| config.validate().map(|()| config))
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let (pods, secrets): (Api<Pod>, Api<Secret>) = match &args.watch_namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    let member_selector = format!("{}={}", config.member_label_key, config.member_label_value);

    tracing::info!(
        ca = %format!("{}/{}", config.ca_secret_namespace, config.ca_secret_name),
        validity_hours = args.cert_validity_hours,
        key_algorithm = %config.key_algorithm,
        selector = %member_selector,
        namespace = args.watch_namespace.as_deref().unwrap_or("<all>"),
        "Starting etcd certificate signer"
    );

    let ctx = Arc::new(Context::builder(client).config(config).build());

    Controller::new(pods, WatcherConfig::default().labels(&member_selector))
        .watches(secrets, WatcherConfig::default(), pod_for_secret)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((pod, action)) => {
                    tracing::debug!(pod = %pod.name, ?action, "Member reconciliation completed");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Member reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("etcd certificate signer shutting down");
    Ok(())
}

/// Print the certificate and issuance annotations of one secret
async fn run_inspect(args: InspectArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let api: Api<Secret> = Api::namespaced(client, &args.namespace);
    let secret = api.get(&args.secret).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to read secret {}/{}: {}",
            args.namespace,
            args.secret,
            e
        )
    })?;

    let annotations = TargetAnnotations::new(&secret);
    println!("Secret: {}/{}", args.namespace, args.secret);
    if let Ok(identity) = annotations.etcd_identity() {
        println!("Requested identity: {}", identity);
    }
    if let Ok(hostnames) = annotations.hostnames() {
        println!("Requested hostnames: {}", hostnames.join(","));
    }
    if let Some(issuer) = annotations.issuer() {
        println!("Recorded issuer: {}", issuer);
    }

    let cert = secret
        .data
        .as_ref()
        .and_then(|data| data.get(TLS_CERT_KEY))
        .filter(|cert| !cert.0.is_empty());
    let Some(cert) = cert else {
        println!("No certificate issued yet");
        return Ok(());
    };

    let pem = std::str::from_utf8(&cert.0)
        .map_err(|e| anyhow::anyhow!("{} is not PEM text: {}", TLS_CERT_KEY, e))?;
    let info = CertificateInfo::from_pem(pem)?;

    println!("Subject CN: {}", info.subject_common_name.as_deref().unwrap_or("-"));
    println!("Subject O: {}", info.subject_organization.as_deref().unwrap_or("-"));
    println!("Issuer CN: {}", info.issuer_common_name.as_deref().unwrap_or("-"));
    println!("Not before: {}", info.not_before);
    println!("Not after: {}", info.not_after);
    println!(
        "Currently valid: {}",
        info.is_valid_at(time::OffsetDateTime::now_utc())
    );
    println!("DNS SANs: {}", info.dns_names.join(","));
    println!(
        "IP SANs: {}",
        info.ip_addresses
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );
    Ok(())
}
