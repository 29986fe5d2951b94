// Placement decision module
// Picks the node selector for an incoming pod and corrects over-provisioned
// selectors out of band.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::cluster::StateQuery;
use crate::error::{Error, Result};
use crate::policy::{AllocationPlan, NodeSelector, Policy, PolicyError};

pub const DEFAULT_POLICY_ANNOTATION: &str = "custom-pod-schedule-strategy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Pin the pod to this selector.
    Place(NodeSelector),
    /// Admit the pod unmodified.
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    ExemptNamespace,
    DeploymentNotFound,
    NoPolicy,
    PolicyMalformed(PolicyError),
    ClusterRead,
    Satisfied,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ExemptNamespace => "exempt_namespace",
            SkipReason::DeploymentNotFound => "deployment_not_found",
            SkipReason::NoPolicy => "no_policy",
            SkipReason::PolicyMalformed(_) => "policy_malformed",
            SkipReason::ClusterRead => "cluster_read_error",
            SkipReason::Satisfied => "satisfied",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlacementConfig {
    pub policy_annotation: String,
    pub blocklisted_namespaces: BTreeSet<String>,
}

impl PlacementConfig {
    pub fn new<I, S>(policy_annotation: impl Into<String>, blocklisted_namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            policy_annotation: policy_annotation.into(),
            blocklisted_namespaces: blocklisted_namespaces
                .into_iter()
                .map(Into::into)
                .filter(|namespace: &String| !namespace.is_empty())
                .collect(),
        }
    }
}

/// Pods evicted by one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub evicted: Vec<String>,
}

enum PlanLookup {
    Missing,
    NoPolicy,
    Plan(AllocationPlan),
}

#[derive(Clone)]
pub struct PlacementDecider {
    query: StateQuery,
    config: Arc<PlacementConfig>,
}

impl PlacementDecider {
    pub fn new(query: StateQuery, config: PlacementConfig) -> Self {
        Self {
            query,
            config: Arc::new(config),
        }
    }

    pub fn is_exempt(&self, namespace: &str) -> bool {
        self.config.blocklisted_namespaces.contains(namespace)
    }

    fn policy<'a>(&self, deployment: &'a Deployment) -> Option<&'a str> {
        deployment
            .annotations()
            .get(&self.config.policy_annotation)
            .map(String::as_str)
            .filter(|policy| !policy.trim().is_empty())
    }

    /// True when `deployment` carries a policy and lives outside the blocklist.
    pub fn manages(&self, deployment: &Deployment) -> bool {
        let exempt = deployment
            .namespace()
            .is_some_and(|namespace| self.is_exempt(&namespace));
        !exempt && self.policy(deployment).is_some()
    }

    async fn plan(&self, namespace: &str, deployment: &str) -> Result<PlanLookup> {
        let Some(found) = self.query.cluster().deployment(namespace, deployment).await? else {
            return Ok(PlanLookup::Missing);
        };
        let Some(policy) = self.policy(&found) else {
            return Ok(PlanLookup::NoPolicy);
        };

        let replicas = found
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1)
            .max(0) as u32;
        let parsed = Policy::parse(policy, replicas)?;
        debug!(
            namespace,
            deployment,
            policy,
            replicas,
            rules = parsed.rules().len(),
            remaining = parsed.remaining(),
            total_weight = parsed.total_weight(),
            "parsed placement policy"
        );

        let plan = parsed.allocate();
        debug!(namespace, deployment, assigned = plan.total_targets(), rules = ?plan.rules, "allocated replicas");
        if plan.unassigned > 0 {
            warn!(
                namespace,
                deployment,
                unassigned = plan.unassigned,
                "no rule carries a weight, remaining replicas are left unplaced"
            );
        }
        Ok(PlanLookup::Plan(plan))
    }

    /// Chooses the node selector for one pod of `deployment`.
    ///
    /// Rules are walked in declaration order and the first one whose live pod
    /// count is below its target wins. Rules whose pods cannot be listed are
    /// passed over.
    pub async fn decide(&self, namespace: &str, deployment: &str, correlation: u64) -> Decision {
        if self.is_exempt(namespace) {
            info!(correlation, namespace, deployment, "namespace is exempt from placement");
            return Decision::Skip(SkipReason::ExemptNamespace);
        }

        let plan = match self.plan(namespace, deployment).await {
            Ok(PlanLookup::Plan(plan)) => plan,
            Ok(PlanLookup::Missing) => {
                info!(correlation, namespace, deployment, "deployment not found");
                return Decision::Skip(SkipReason::DeploymentNotFound);
            }
            Ok(PlanLookup::NoPolicy) => {
                debug!(correlation, namespace, deployment, "deployment has no placement policy");
                return Decision::Skip(SkipReason::NoPolicy);
            }
            Err(Error::PolicyError(error)) => {
                warn!(correlation, namespace, deployment, %error, "ignoring malformed placement policy");
                return Decision::Skip(SkipReason::PolicyMalformed(error));
            }
            Err(error) => {
                warn!(correlation, namespace, deployment, %error, "failed to read deployment");
                return Decision::Skip(SkipReason::ClusterRead);
            }
        };

        let mut evaluated = 0;
        for rule in &plan.rules {
            let selector = &rule.selector;
            let observed = match self.query.observe(namespace, deployment, selector).await {
                Ok(observed) => observed,
                Err(error) => {
                    warn!(correlation, namespace, deployment, %selector, %error, "failed to count pods, skipping rule");
                    continue;
                }
            };
            evaluated += 1;

            let current = observed.current_count();
            let target = rule.target_replicas;
            match current.cmp(&target) {
                Ordering::Less => {
                    info!(correlation, namespace, deployment, %selector, current, target, "placing pod");
                    return Decision::Place(selector.clone());
                }
                Ordering::Equal => {
                    debug!(correlation, namespace, deployment, %selector, current, "rule satisfied");
                }
                Ordering::Greater => {
                    info!(correlation, namespace, deployment, %selector, current, target, "rule over-provisioned, left for reconciliation");
                }
            }
        }

        if evaluated == 0 {
            Decision::Skip(SkipReason::ClusterRead)
        } else {
            Decision::Skip(SkipReason::Satisfied)
        }
    }

    /// Evicts the oldest pods of every over-provisioned rule of `deployment`.
    pub async fn reconcile(&self, namespace: &str, deployment: &str) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if self.is_exempt(namespace) {
            return Ok(report);
        }

        let plan = match self.plan(namespace, deployment).await {
            Ok(PlanLookup::Plan(plan)) => plan,
            Ok(PlanLookup::Missing | PlanLookup::NoPolicy) => return Ok(report),
            Err(Error::PolicyError(error)) => {
                warn!(namespace, deployment, %error, "ignoring malformed placement policy");
                return Ok(report);
            }
            Err(error) => return Err(error),
        };

        for rule in &plan.rules {
            let observed = self
                .query
                .observe(namespace, deployment, &rule.selector)
                .await?;
            let current = observed.current_count();
            if current <= rule.target_replicas {
                continue;
            }

            let excess = (current - rule.target_replicas) as usize;
            info!(
                namespace,
                deployment,
                selector = %rule.selector,
                current,
                target = rule.target_replicas,
                excess,
                "evicting excess pods"
            );
            for pod in observed.pods.into_iter().take(excess) {
                self.query.cluster().delete_pod(namespace, &pod).await?;
                info!(namespace, pod = %pod, "evicted pod");
                report.evicted.push(pod);
            }
        }

        Ok(report)
    }
}
