//! Deployment configuration generation: namespace, domains, strategy, replicas.

use std::collections::BTreeMap;

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::domain::{
    Complexity, DeploymentConfig, DeploymentStrategy, ResourceBundle, ServiceType,
    TargetEnvironment, ValidationError,
};

/// Kubernetes namespace length limit.
pub const MAX_NAMESPACE_LEN: usize = 63;

/// Lowercase DNS-label slug: runs of non-alphanumerics collapse to `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// `{project_slug}-{environment}`, with the slug truncated to fit 63 chars.
pub fn namespace_for(
    project_name: &str,
    env: TargetEnvironment,
) -> Result<String, ValidationError> {
    let slug = slugify(project_name);
    if slug.is_empty() {
        return Err(ValidationError::EmptyField {
            field: "project_name",
        });
    }
    let suffix = env.as_str();
    let budget = MAX_NAMESPACE_LEN - suffix.len() - 1;
    let head: String = slug.chars().take(budget).collect();
    Ok(format!("{}-{}", head.trim_end_matches('-'), suffix))
}

pub fn select_strategy(env: TargetEnvironment, complexity: Option<Complexity>) -> DeploymentStrategy {
    match env {
        TargetEnvironment::Development => DeploymentStrategy::Recreate,
        TargetEnvironment::Staging => DeploymentStrategy::RollingUpdate,
        TargetEnvironment::Production if complexity == Some(Complexity::Critical) => {
            DeploymentStrategy::Canary
        }
        TargetEnvironment::Production => DeploymentStrategy::BlueGreen,
    }
}

/// Build the configuration of a planned request.
///
/// Domains are generated for every service with a positive channel count.
pub fn generate_config(
    project_name: &str,
    env: TargetEnvironment,
    bundle: &ResourceBundle,
    complexity: Option<Complexity>,
    config: &EngineConfig,
) -> Result<DeploymentConfig, ValidationError> {
    let cluster = config.cluster_for(env)?.to_string();
    let namespace = namespace_for(project_name, env)?;

    let domains = bundle
        .per_service
        .iter()
        .filter(|d| d.channel_count > 0)
        .map(|d| {
            (
                d.service_type,
                format!("{}.{}.{}", d.service_type.as_str(), env.as_str(), config.base_domain),
            )
        })
        .collect::<BTreeMap<_, _>>();

    let replicas = bundle
        .servers
        .iter()
        .map(|s| (s.role.clone(), s.instance_count))
        .collect::<BTreeMap<_, _>>();

    let strategy = select_strategy(env, complexity);
    let digest = config_digest(&cluster, &namespace, &domains, strategy, &replicas);

    Ok(DeploymentConfig {
        cluster,
        namespace,
        domains,
        strategy,
        replicas,
        digest,
    })
}

fn config_digest(
    cluster: &str,
    namespace: &str,
    domains: &BTreeMap<ServiceType, String>,
    strategy: DeploymentStrategy,
    replicas: &BTreeMap<String, u32>,
) -> String {
    let canonical = json!({
        "cluster": cluster,
        "namespace": namespace,
        "domains": domains,
        "strategy": strategy,
        "replicas": replicas,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ResourcePlanner;
    use crate::domain::{ChannelRequirements, Preset};

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Voice Assist (v2)"), "voice-assist-v2");
        assert_eq!(slugify("--Hello__World--"), "hello-world");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_namespace_convention() {
        assert_eq!(
            namespace_for("Voice Assist", TargetEnvironment::Staging).unwrap(),
            "voice-assist-staging"
        );
        assert!(namespace_for("???", TargetEnvironment::Staging).is_err());
    }

    #[test]
    fn test_namespace_truncated_to_63() {
        let long = "a".repeat(120);
        let ns = namespace_for(&long, TargetEnvironment::Production).unwrap();
        assert_eq!(ns.len(), MAX_NAMESPACE_LEN);
        assert!(ns.ends_with("-production"));
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            select_strategy(TargetEnvironment::Development, None),
            DeploymentStrategy::Recreate
        );
        assert_eq!(
            select_strategy(TargetEnvironment::Staging, Some(Complexity::Critical)),
            DeploymentStrategy::RollingUpdate
        );
        assert_eq!(
            select_strategy(TargetEnvironment::Production, Some(Complexity::High)),
            DeploymentStrategy::BlueGreen
        );
        assert_eq!(
            select_strategy(TargetEnvironment::Production, Some(Complexity::Critical)),
            DeploymentStrategy::Canary
        );
    }

    #[test]
    fn test_generate_config_domains_and_digest() {
        let reqs = ChannelRequirements::new()
            .with(ServiceType::Tts, 10)
            .with(ServiceType::Stt, 0);
        let bundle = ResourcePlanner::default().bundle_for(&reqs).unwrap();
        let cfg = EngineConfig::default();
        let generated =
            generate_config("Voice", TargetEnvironment::Staging, &bundle, None, &cfg).unwrap();

        assert_eq!(generated.cluster, "stg-cluster");
        assert_eq!(generated.domains.len(), 1);
        assert_eq!(
            generated.domains[&ServiceType::Tts],
            "tts.staging.example.internal"
        );
        assert_eq!(generated.replicas["tts"], 1);
        assert_eq!(generated.digest.len(), 64);

        let again =
            generate_config("Voice", TargetEnvironment::Staging, &bundle, None, &cfg).unwrap();
        assert_eq!(generated.digest, again.digest);

        let prod = generate_config(
            "Voice",
            TargetEnvironment::Production,
            &bundle,
            None,
            &cfg,
        )
        .unwrap();
        assert_ne!(generated.digest, prod.digest);
    }

    #[test]
    fn test_standard_preset_replicas() {
        let bundle = ResourcePlanner::default()
            .bundle_for(&Preset::Standard.requirements())
            .unwrap();
        let generated = generate_config(
            "Contact Center",
            TargetEnvironment::Production,
            &bundle,
            Some(Complexity::Medium),
            &EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(generated.replicas.values().sum::<u32>(), 12);
        assert_eq!(generated.domains.len(), 7);
        assert_eq!(generated.namespace, "contact-center-production");
    }
}
