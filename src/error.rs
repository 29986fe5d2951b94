use thiserror::Error;

use crate::policy::PolicyError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Cluster state unavailable: {0}")]
    ClusterUnavailable(String),

    #[error("Placement policy error: {0}")]
    PolicyError(#[from] PolicyError),

    #[error("Patch error: {0}")]
    PatchError(String),

    #[error("TLS configuration error: {0}")]
    TlsError(String),

    #[error("Manifest error: {0}")]
    ManifestError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
