use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::placement::{PlacementConfig, DEFAULT_POLICY_ANNOTATION};

#[derive(Debug, Parser)]
#[command(version, about = "Spreads Deployment replicas across node classes by weight")]
pub struct Args {
    /// Log filter used when RUST_LOG is unset (e.g. "info", "debug", "trace").
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the mutating admission webhook over HTTPS.
    Webhook(WebhookArgs),
    /// Evict pods from over-provisioned node selectors.
    Reconciler(ReconcilerArgs),
    /// Print the MutatingWebhookConfiguration for this webhook.
    Manifest(ManifestArgs),
}

#[derive(Debug, Clone, clap::Args)]
pub struct PlacementArgs {
    /// Namespaces whose pods are never mutated.
    #[arg(
        long,
        env = "BLOCKLISTED_NAMESPACE_LIST",
        value_delimiter = ',',
        default_value = "kube-system,kube-public"
    )]
    pub blocklisted_namespaces: Vec<String>,

    /// Deployment annotation holding the distribution policy.
    #[arg(long, env = "POLICY_ANNOTATION", default_value = DEFAULT_POLICY_ANNOTATION)]
    pub policy_annotation: String,

    /// Pause before listing pods, giving concurrent admissions time to land.
    #[arg(long, env = "SETTLE_DELAY_MS", default_value_t = 500)]
    pub settle_delay_ms: u64,
}

impl PlacementArgs {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn config(&self) -> PlacementConfig {
        PlacementConfig::new(
            self.policy_annotation.clone(),
            self.blocklisted_namespaces.iter().map(|namespace| namespace.trim()),
        )
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct WebhookArgs {
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 8443)]
    pub port: u16,

    /// File containing the x509 certificate for HTTPS.
    #[arg(long, env = "TLS_CERT_FILE", default_value = "/etc/webhook/certs/cert.pem")]
    pub tls_cert_file: PathBuf,

    /// File containing the x509 private key matching --tls-cert-file.
    #[arg(long, env = "TLS_KEY_FILE", default_value = "/etc/webhook/certs/key.pem")]
    pub tls_key_file: PathBuf,

    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    #[command(flatten)]
    pub placement: PlacementArgs,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ReconcilerArgs {
    /// Seconds between reconciliation passes of an unchanged Deployment.
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 60)]
    pub interval_secs: u64,

    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    #[command(flatten)]
    pub placement: PlacementArgs,
}

impl ReconcilerArgs {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct ManifestArgs {
    #[arg(long, default_value = "weighted-placement.scheduling.io")]
    pub webhook_name: String,

    #[arg(long, default_value = "weighted-placement-webhook")]
    pub service_name: String,

    #[arg(long, default_value = "default")]
    pub service_namespace: String,

    #[arg(long, default_value_t = 443)]
    pub service_port: i32,

    /// PEM bundle of the CA that signed the webhook certificate.
    #[arg(long)]
    pub ca_bundle_file: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    pub timeout_seconds: i32,

    #[command(flatten)]
    pub placement: PlacementArgs,
}
