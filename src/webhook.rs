// Admission webhook module
// Serves the mutating webhook that pins new pods to a node selector.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::ResourceExt;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::PrivateKeyDer;
use rustls_pemfile::Item;
use tracing::{debug, error, info, warn};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::{Filter, Rejection, Reply};

use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::patch;
use crate::placement::{Decision, PlacementDecider};

const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";
const MAX_BODY_BYTES: u64 = 4 * 1024 * 1024;
const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";

pub struct WebhookState {
    decider: PlacementDecider,
    metrics: MetricsCollector,
    correlation: AtomicU64,
}

impl WebhookState {
    pub fn new(decider: PlacementDecider, metrics: MetricsCollector) -> Self {
        Self {
            decider,
            metrics,
            correlation: AtomicU64::new(1),
        }
    }

    /// Number attached to every log line of one request.
    fn next_correlation(&self) -> u64 {
        self.correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// Decides the response for one admission request.
    ///
    /// Always allows the pod; a placement failure only means it is admitted
    /// without a patch.
    pub async fn mutate(&self, req: &AdmissionRequest<Pod>, correlation: u64) -> AdmissionResponse {
        info!(
            correlation,
            kind = %req.kind.kind,
            name = %req.name,
            namespace = ?req.namespace,
            uid = %req.uid,
            operation = ?req.operation,
            "admission review"
        );

        if !matches!(req.operation, Operation::Create) {
            return AdmissionResponse::from(req);
        }
        let Some(pod) = &req.object else {
            warn!(correlation, uid = %req.uid, "admission request carries no pod");
            return AdmissionResponse::from(req);
        };

        let namespace = req
            .namespace
            .clone()
            .or_else(|| pod.namespace())
            .unwrap_or_else(|| "default".to_string());
        let Some(deployment) = owning_deployment(pod) else {
            debug!(correlation, namespace = %namespace, "pod is not owned by a deployment");
            self.metrics.record_decision("unowned");
            return AdmissionResponse::from(req);
        };

        let selector = match self.decider.decide(&namespace, &deployment, correlation).await {
            Decision::Place(selector) => selector,
            Decision::Skip(reason) => {
                info!(
                    correlation,
                    namespace = %namespace,
                    deployment = %deployment,
                    reason = reason.as_str(),
                    "skipping mutation"
                );
                self.metrics.record_decision(reason.as_str());
                return AdmissionResponse::from(req);
            }
        };

        let existing = pod.spec.as_ref().and_then(|spec| spec.node_selector.as_ref());
        let operations = match patch::build(&selector, existing) {
            Ok(operations) if operations.is_empty() => {
                self.metrics.record_decision("already_placed");
                return AdmissionResponse::from(req);
            }
            Ok(operations) => operations,
            Err(error) => {
                warn!(correlation, namespace = %namespace, deployment = %deployment, %error, "failed to build patch");
                self.metrics.record_error("patch_error", &namespace);
                return AdmissionResponse::from(req);
            }
        };

        debug!(correlation, patch = ?operations, "admission response patch");
        match AdmissionResponse::from(req).with_patch(json_patch::Patch(operations)) {
            Ok(response) => {
                self.metrics.record_decision("placed");
                response
            }
            Err(error) => {
                warn!(correlation, namespace = %namespace, deployment = %deployment, %error, "failed to serialize patch");
                self.metrics.record_error("patch_error", &namespace);
                AdmissionResponse::from(req)
            }
        }
    }
}

/// Recovers the Deployment name from a ReplicaSet-managed pod.
///
/// ReplicaSets created by a Deployment are named `<deployment>-<hash>` and
/// their pods `<deployment>-<hash>-<suffix>`, with `<hash>` repeated in the
/// `pod-template-hash` label.
pub fn owning_deployment(pod: &Pod) -> Option<String> {
    let hash = pod.labels().get(POD_TEMPLATE_HASH_LABEL)?;

    let from_owner = pod
        .owner_references()
        .iter()
        .find(|owner| owner.kind == "ReplicaSet")
        .and_then(|owner| owner.name.strip_suffix(hash.as_str()))
        .map(|prefix| prefix.trim_end_matches('-'));

    let name = from_owner.or_else(|| {
        let generated = pod
            .metadata
            .generate_name
            .as_deref()
            .or(pod.metadata.name.as_deref())?;
        let (prefix, _) = generated.split_once(hash.as_str())?;
        Some(prefix.trim_matches('-'))
    })?;

    (!name.is_empty()).then(|| name.to_string())
}

pub fn routes(
    state: Arc<WebhookState>,
) -> impl Filter<Extract = (warp::reply::Response,), Error = Rejection> + Clone {
    warp::post()
        .and(warp::path("mutate"))
        .and(warp::path::end())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(warp::any().map(move || state.clone()))
        .and_then(mutate_handler)
}

async fn mutate_handler(
    content_type: Option<String>,
    body: Bytes,
    state: Arc<WebhookState>,
) -> Result<warp::reply::Response, Rejection> {
    let correlation = state.next_correlation();
    let timer = state.metrics.start_webhook("mutate");

    if body.is_empty() {
        error!(correlation, "empty body");
        timer.finish("rejected");
        return Ok(warp::reply::with_status("empty body", StatusCode::BAD_REQUEST).into_response());
    }

    let is_json = content_type
        .as_deref()
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"));
    if !is_json {
        error!(correlation, content_type = ?content_type, "expected application/json");
        timer.finish("rejected");
        return Ok(warp::reply::with_status(
            "invalid Content-Type, expect `application/json`",
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
        )
        .into_response());
    }

    let review: AdmissionReview<Pod> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(error) => {
            error!(correlation, %error, "can't decode body");
            state.metrics.record_error("decode_error", "");
            timer.finish("invalid");
            return Ok(invalid(format!("Invalid request: {error}")));
        }
    };
    let req: AdmissionRequest<Pod> = match review.try_into() {
        Ok(req) => req,
        Err(error) => {
            error!(correlation, %error, "invalid admission review");
            state.metrics.record_error("decode_error", "");
            timer.finish("invalid");
            return Ok(invalid(format!("Invalid request: {error}")));
        }
    };

    let response = state.mutate(&req, correlation).await;
    timer.finish("allowed");
    Ok(warp::reply::json(&response.into_review()).into_response())
}

/// Answers a review that could not be read. The pod is still allowed so an
/// unreadable request never blocks workload creation.
fn invalid(message: String) -> warp::reply::Response {
    let mut response = AdmissionResponse::invalid(message);
    response.allowed = true;
    response.types.api_version = ADMISSION_API_VERSION.to_string();
    warp::reply::json(&response.into_review()).into_response()
}

/// Reads the serving certificate and key and parses them the way the TLS
/// listener will, so broken material is reported before binding.
pub async fn load_tls_identity(cert_file: &Path, key_file: &Path) -> Result<(Vec<u8>, Vec<u8>)> {
    let cert = read_file(cert_file).await?;
    let key = read_file(key_file).await?;
    validate_identity(&cert, &key)?;
    Ok((cert, key))
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|error| Error::TlsError(format!("failed to read {}: {error}", path.display())))
}

fn validate_identity(cert: &[u8], key: &[u8]) -> Result<()> {
    let certs = rustls_pemfile::certs(&mut &cert[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|error| Error::TlsError(format!("invalid certificate PEM: {error}")))?;
    if certs.is_empty() {
        return Err(Error::TlsError("no PEM CERTIFICATE block found".to_string()));
    }

    let mut private_key: Option<PrivateKeyDer<'static>> = None;
    for item in rustls_pemfile::read_all(&mut &key[..]) {
        let item = item.map_err(|error| Error::TlsError(format!("invalid key PEM: {error}")))?;
        private_key = Some(match item {
            Item::Pkcs1Key(der) => der.into(),
            Item::Pkcs8Key(der) => der.into(),
            Item::Sec1Key(der) => der.into(),
            _ => return Err(Error::TlsError("key file holds a non-key PEM block".to_string())),
        });
    }
    let private_key =
        private_key.ok_or_else(|| Error::TlsError("no PEM PRIVATE KEY block found".to_string()))?;

    any_supported_type(&private_key)
        .map_err(|error| Error::TlsError(format!("unusable private key: {error}")))?;
    Ok(())
}
