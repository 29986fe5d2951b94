// Reconciliation controller
// Watches Deployments and evicts pods that overshoot their selector's target.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metrics::MetricsCollector;
use crate::placement::PlacementDecider;

const ERROR_REQUEUE: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Placement error: {0}")]
    PlacementError(#[from] crate::error::Error),

    #[error("Deployment {0} has no namespace")]
    MissingNamespace(String),
}

pub struct Context {
    pub decider: PlacementDecider,
    pub metrics: MetricsCollector,
    pub interval: Duration,
}

pub async fn reconcile(deployment: Arc<Deployment>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let name = deployment.name_any();
    let ns = deployment
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;

    if !ctx.decider.manages(&deployment) {
        debug!(namespace = %ns, deployment = %name, "deployment is not managed");
        return Ok(Action::await_change());
    }

    let timer = ctx.metrics.start_reconcile(&ns, &name);
    match ctx.decider.reconcile(&ns, &name).await {
        Ok(report) => {
            if !report.evicted.is_empty() {
                info!(namespace = %ns, deployment = %name, evicted = ?report.evicted, "restored placement");
                ctx.metrics.record_evictions(&ns, &name, report.evicted.len());
            }
            timer.success();
            Ok(Action::requeue(ctx.interval))
        }
        Err(error) => {
            timer.error("placement_error");
            Err(error.into())
        }
    }
}

pub fn error_policy(deployment: Arc<Deployment>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    warn!(
        namespace = ?deployment.namespace(),
        deployment = %deployment.name_any(),
        %error,
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Runs the controller until a termination signal arrives.
pub async fn run(client: Client, ctx: Arc<Context>) {
    let deployments = Api::<Deployment>::all(client);

    info!(interval_secs = ctx.interval.as_secs(), "starting placement reconciler");
    Controller::new(deployments, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((object, _)) => debug!(deployment = %object.name, "reconciled"),
                Err(error) => warn!(%error, "reconcile error"),
            }
        })
        .await;
    info!("placement reconciler stopped");
}
