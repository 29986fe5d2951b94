// Webhook registration manifest

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::ByteString;

use crate::args::ManifestArgs;
use crate::error::{Error, Result};

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Registers the webhook for pod creation, failing open so that an outage
/// never blocks workloads.
pub fn webhook_configuration(
    args: &ManifestArgs,
    ca_bundle: Option<Vec<u8>>,
) -> MutatingWebhookConfiguration {
    let exempt: Vec<String> = args.placement.config().blocklisted_namespaces.into_iter().collect();
    let namespace_selector = (!exempt.is_empty()).then(|| LabelSelector {
        match_expressions: Some(vec![LabelSelectorRequirement {
            key: NAMESPACE_NAME_LABEL.to_string(),
            operator: "NotIn".to_string(),
            values: Some(exempt),
        }]),
        ..Default::default()
    });

    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(args.service_name.clone()),
            ..Default::default()
        },
        webhooks: Some(vec![MutatingWebhook {
            name: args.webhook_name.clone(),
            admission_review_versions: vec!["v1".to_string()],
            client_config: WebhookClientConfig {
                ca_bundle: ca_bundle.map(ByteString),
                service: Some(ServiceReference {
                    name: args.service_name.clone(),
                    namespace: args.service_namespace.clone(),
                    path: Some("/mutate".to_string()),
                    port: Some(args.service_port),
                }),
                url: None,
            },
            rules: Some(vec![RuleWithOperations {
                api_groups: Some(vec![String::new()]),
                api_versions: Some(vec!["v1".to_string()]),
                operations: Some(vec!["CREATE".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                scope: Some("Namespaced".to_string()),
            }]),
            failure_policy: Some("Ignore".to_string()),
            side_effects: "None".to_string(),
            timeout_seconds: Some(args.timeout_seconds),
            namespace_selector,
            ..Default::default()
        }]),
    }
}

pub fn render(args: &ManifestArgs) -> Result<String> {
    let ca_bundle = args
        .ca_bundle_file
        .as_ref()
        .map(|path| {
            std::fs::read(path).map_err(|error| {
                Error::TlsError(format!("failed to read {}: {error}", path.display()))
            })
        })
        .transpose()?;

    let configuration = webhook_configuration(args, ca_bundle);
    serde_yaml::to_string(&configuration)
        .map_err(|error| Error::ManifestError(error.to_string()))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::args::{Args, Command};

    fn manifest_args(extra: &[&str]) -> ManifestArgs {
        let argv = ["weighted-placement-webhook", "manifest"]
            .into_iter()
            .chain(extra.iter().copied());
        match Args::parse_from(argv).command {
            Command::Manifest(args) => args,
            _ => panic!("expected manifest command"),
        }
    }

    #[test]
    fn test_webhook_fails_open_on_pod_creation() {
        let args = manifest_args(&["--service-namespace", "placement"]);
        let configuration = webhook_configuration(&args, Some(b"pem".to_vec()));

        let webhook = &configuration.webhooks.as_ref().unwrap()[0];
        assert_eq!(webhook.failure_policy.as_deref(), Some("Ignore"));
        assert_eq!(webhook.side_effects, "None");
        assert_eq!(webhook.client_config.ca_bundle, Some(ByteString(b"pem".to_vec())));

        let service = webhook.client_config.service.as_ref().unwrap();
        assert_eq!(service.namespace, "placement");
        assert_eq!(service.path.as_deref(), Some("/mutate"));

        let rule = &webhook.rules.as_ref().unwrap()[0];
        assert_eq!(rule.operations, Some(vec!["CREATE".to_string()]));
        assert_eq!(rule.resources, Some(vec!["pods".to_string()]));
    }

    #[test]
    fn test_blocklisted_namespaces_are_excluded() {
        let args = manifest_args(&["--blocklisted-namespaces", "kube-system,monitoring"]);
        let configuration = webhook_configuration(&args, None);

        let selector = configuration.webhooks.unwrap()[0].namespace_selector.clone().unwrap();
        let requirement = &selector.match_expressions.unwrap()[0];
        assert_eq!(requirement.key, NAMESPACE_NAME_LABEL);
        assert_eq!(requirement.operator, "NotIn");
        assert_eq!(
            requirement.values,
            Some(vec!["kube-system".to_string(), "monitoring".to_string()])
        );
    }

    #[test]
    fn test_render_yaml() {
        let yaml = render(&manifest_args(&[])).unwrap();
        assert!(yaml.contains("failurePolicy: Ignore"));
        assert!(yaml.contains("path: /mutate"));
    }
}
