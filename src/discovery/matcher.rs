use std::collections::BTreeMap;

use super::rules::{CompiledRule, MatchError, WatchContainerSpec};
use super::Container;

/// Label (checked first) and environment variable naming a container's
/// domain.
pub const DEFAULT_DOMAIN_KEY: &str = "DASH_DOMAIN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub domain: String,
    pub service: String,
}

impl Classification {
    /// Key of the service in the tracker.
    pub fn key(&self) -> String {
        service_key(&self.domain, &self.service)
    }
}

/// Qualified `domain/service` name. Services are tracked under this key so
/// equally named services of different domains never share state.
pub fn service_key(domain: &str, service: &str) -> String {
    format!("{domain}/{service}")
}

/// Classifies containers into (domain, service) pairs.
///
/// Rules are evaluated in registration order within a domain and domains in
/// name order; the first match wins. Overlapping rules are not detected.
#[derive(Debug)]
pub struct DiscoveryContainerMatcher {
    domain_label: String,
    domain_env: String,
    rules: BTreeMap<String, Vec<(String, CompiledRule)>>,
}

impl Default for DiscoveryContainerMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN_KEY, DEFAULT_DOMAIN_KEY)
    }
}

impl DiscoveryContainerMatcher {
    pub fn new(domain_label: impl Into<String>, domain_env: impl Into<String>) -> Self {
        Self {
            domain_label: domain_label.into(),
            domain_env: domain_env.into(),
            rules: BTreeMap::new(),
        }
    }

    pub fn add_rule(
        &mut self,
        domain: &str,
        service: &str,
        spec: &WatchContainerSpec,
    ) -> Result<(), MatchError> {
        let compiled = CompiledRule::new(spec)?;
        let rules = self.rules.entry(domain.to_string()).or_default();
        if rules.iter().any(|(s, _)| s == service) {
            return Err(MatchError::Duplicate {
                domain: domain.to_string(),
                service: service.to_string(),
            });
        }
        rules.push((service.to_string(), compiled));
        Ok(())
    }

    /// Domain a container declares for itself, if any.
    pub fn domain_of<'a>(&self, container: &'a Container) -> Option<&'a str> {
        container
            .labels
            .get(&self.domain_label)
            .map(String::as_str)
            .or_else(|| container.env_value(&self.domain_env))
            .filter(|domain| !domain.is_empty())
    }

    pub fn match_container(&self, container: &Container) -> Option<Classification> {
        match self.domain_of(container) {
            Some(domain) => {
                let rules = self.rules.get(domain)?;
                Self::first_match(domain, rules, container)
            }
            None => self
                .rules
                .iter()
                .find_map(|(domain, rules)| Self::first_match(domain, rules, container)),
        }
    }

    fn first_match(
        domain: &str,
        rules: &[(String, CompiledRule)],
        container: &Container,
    ) -> Option<Classification> {
        rules
            .iter()
            .find(|(_, rule)| rule.matches(container))
            .map(|(service, _)| Classification {
                domain: domain.to_string(),
                service: service.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::rules::{ImageSpec, MatchContainerRule, RuleUnion};
    use std::collections::HashMap;

    fn spec(repository: &str, service_label: Option<&str>) -> WatchContainerSpec {
        WatchContainerSpec {
            qualify_tag: None,
            rule: MatchContainerRule {
                image: ImageSpec {
                    repository: repository.to_string(),
                    tag: None,
                },
                port: None,
                match_all: service_label
                    .map(|s| {
                        vec![RuleUnion {
                            labels: HashMap::from([(
                                "DASH_SERVICE".to_string(),
                                s.to_string(),
                            )]),
                            ..Default::default()
                        }]
                    })
                    .unwrap_or_default(),
                match_first: vec![],
            },
        }
    }

    fn matcher() -> DiscoveryContainerMatcher {
        let mut matcher = DiscoveryContainerMatcher::default();
        matcher
            .add_rule("ops", "infradash", &spec("infradash/infradash", Some("infradash")))
            .unwrap();
        matcher
            .add_rule("ops", "proxy", &spec("infradash/proxy", None))
            .unwrap();
        matcher
            .add_rule("prod", "infradash", &spec("infradash/infradash", None))
            .unwrap();
        matcher
    }

    fn container(image: &str, labels: &[(&str, &str)], env: &[&str]) -> Container {
        Container {
            id: "110".to_string(),
            image: image.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            env: env.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_domain_from_label_wins_over_env() {
        let matcher = matcher();
        let c = container(
            "infradash/infradash:develop-1.1",
            &[("DASH_DOMAIN", "prod")],
            &["DASH_DOMAIN=ops"],
        );
        assert_eq!(matcher.domain_of(&c), Some("prod"));
        assert_eq!(
            matcher.match_container(&c),
            Some(Classification {
                domain: "prod".to_string(),
                service: "infradash".to_string()
            })
        );
    }

    #[test]
    fn test_domain_from_env() {
        let matcher = matcher();
        let c = container("infradash/proxy:1.0", &[], &["DASH_DOMAIN=ops"]);
        assert_eq!(
            matcher.match_container(&c).map(|c| c.service),
            Some("proxy".to_string())
        );
    }

    #[test]
    fn test_declared_domain_restricts_rules() {
        let matcher = matcher();
        let c = container("infradash/proxy:1.0", &[("DASH_DOMAIN", "prod")], &[]);
        assert_eq!(matcher.match_container(&c), None);

        let unknown = container("infradash/proxy:1.0", &[("DASH_DOMAIN", "qa")], &[]);
        assert_eq!(matcher.match_container(&unknown), None);
    }

    #[test]
    fn test_without_domain_all_rules_are_scanned() {
        let matcher = matcher();
        let labelled = container(
            "infradash/infradash:develop-1.1",
            &[("DASH_SERVICE", "infradash")],
            &[],
        );
        // "ops" sorts before "prod"
        assert_eq!(
            matcher.match_container(&labelled).map(|c| c.domain),
            Some("ops".to_string())
        );

        let bare = container("infradash/infradash:develop-1.1", &[], &[]);
        assert_eq!(
            matcher.match_container(&bare).map(|c| c.domain),
            Some("prod".to_string())
        );

        let stranger = container("nginx:latest", &[], &[]);
        assert_eq!(matcher.match_container(&stranger), None);
    }

    #[test]
    fn test_duplicate_rule_is_rejected() {
        let mut matcher = matcher();
        let err = matcher
            .add_rule("ops", "proxy", &spec("infradash/proxy", None))
            .unwrap_err();
        assert!(matches!(err, MatchError::Duplicate { .. }));
    }
}
