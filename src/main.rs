use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warp::Filter;

mod args;
mod cluster;
mod error;
mod manifest;
mod metrics;
mod patch;
mod placement;
mod policy;
mod reconciler;
mod webhook;

use args::{Args, Command, PlacementArgs, ReconcilerArgs, WebhookArgs};
use cluster::{ClusterState, KubeClusterState, StateQuery};
use metrics::{health_handler, metrics_handler, ready_handler, MetricsCollector};
use placement::PlacementDecider;
use webhook::WebhookState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(args.log_level.to_ascii_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Webhook(args) => run_webhook(args).await,
        Command::Reconciler(args) => run_reconciler(args).await,
        Command::Manifest(args) => {
            print!("{}", manifest::render(&args)?);
            Ok(())
        }
    }
}

fn decider(client: Client, placement: &PlacementArgs) -> PlacementDecider {
    let cluster: Arc<dyn ClusterState> = Arc::new(KubeClusterState::new(client));
    PlacementDecider::new(
        StateQuery::new(cluster, placement.settle_delay()),
        placement.config(),
    )
}

fn spawn_metrics_server(port: u16, collector: MetricsCollector) {
    let routes = metrics_handler()
        .or(health_handler(collector))
        .or(ready_handler());

    tokio::spawn(async move {
        info!(port, "starting metrics server");
        warp::serve(routes).run(([0, 0, 0, 0], port)).await;
    });
}

async fn run_webhook(args: WebhookArgs) -> anyhow::Result<()> {
    // Refuse to start without a usable TLS identity.
    let (cert, key) = webhook::load_tls_identity(&args.tls_cert_file, &args.tls_key_file)
        .await
        .context("failed to load TLS key pair")?;

    let client = Client::try_default().await?;
    let metrics = MetricsCollector::new();
    let placement = args.placement.config();
    info!(
        port = args.port,
        annotation = %placement.policy_annotation,
        blocklisted = ?placement.blocklisted_namespaces,
        settle_delay_ms = args.placement.settle_delay_ms,
        "starting placement webhook"
    );

    spawn_metrics_server(args.metrics_port, metrics.clone());

    let state = Arc::new(WebhookState::new(decider(client, &args.placement), metrics));
    let (addr, server) = warp::serve(webhook::routes(state))
        .tls()
        .cert(cert)
        .key(key)
        .bind_with_graceful_shutdown(([0, 0, 0, 0], args.port), shutdown_signal());

    info!(%addr, "webhook server listening");
    server.await;
    info!("webhook server stopped");
    Ok(())
}

async fn run_reconciler(args: ReconcilerArgs) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let metrics = MetricsCollector::new();
    spawn_metrics_server(args.metrics_port, metrics.clone());

    let ctx = Arc::new(reconciler::Context {
        decider: decider(client.clone(), &args.placement),
        metrics,
        interval: args.interval(),
    });
    reconciler::run(client, ctx).await;
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
    info!("got shutdown signal, shutting down webhook server gracefully");
}
