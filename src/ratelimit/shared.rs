//! Shared limit groups.
//!
//! A group pools one quota across several endpoints. Every request to a
//! member endpoint consumes from the group's bucket, whichever key sent it
//! and whichever listener received it.

use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use super::bucket::LimitSpec;
use super::domain::Endpoint;
use super::route::PathTemplate;
use super::rules::LimitRules;
use crate::error::{DynLimitsError, Result};

/// A group member: a path template, optionally bound to one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMatcher {
    pub port: Option<u16>,
    pub template: PathTemplate,
}

impl EndpointMatcher {
    pub fn new(port: Option<u16>, template: PathTemplate) -> Self {
        Self { port, template }
    }

    pub fn matches(&self, endpoint: &Endpoint) -> bool {
        self.port.map_or(true, |p| p == endpoint.port) && self.template.matches(&endpoint.path)
    }

    /// Whether some request could match both members.
    pub fn overlaps(&self, other: &EndpointMatcher) -> bool {
        let ports_meet = match (self.port, other.port) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        ports_meet && self.template.overlaps(&other.template)
    }
}

impl fmt::Display for EndpointMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, ":{}{}", port, self.template),
            None => write!(f, "{}", self.template),
        }
    }
}

/// Endpoint to group mapping, validated so each endpoint has at most one
/// group.
#[derive(Debug, Clone, Default)]
pub struct SharedPolicy {
    members: Vec<(EndpointMatcher, String)>,
    limits: HashMap<String, LimitSpec>,
}

impl SharedPolicy {
    /// Build the policy from the rules' groups.
    ///
    /// Fails with [`DynLimitsError::GroupOverlap`] when an endpoint could be
    /// claimed by two different groups.
    pub fn from_rules(rules: &LimitRules) -> Result<Self> {
        let mut members: Vec<(EndpointMatcher, String)> = Vec::new();
        let mut limits = HashMap::with_capacity(rules.groups.len());

        for (name, group) in &rules.groups {
            for member in &group.endpoints {
                let matcher =
                    EndpointMatcher::new(member.port(), PathTemplate::parse(member.path())?);

                if let Some((existing, owner)) = members
                    .iter()
                    .find(|(m, owner)| owner != name && m.overlaps(&matcher))
                {
                    return Err(DynLimitsError::GroupOverlap {
                        endpoint: format!("{} / {}", existing, matcher),
                        first: owner.clone(),
                        second: name.clone(),
                    });
                }

                members.push((matcher, name.clone()));
            }
            limits.insert(name.clone(), rules.limits_for_group(name));
        }

        debug!(
            groups = limits.len(),
            members = members.len(),
            "Built shared group table"
        );

        Ok(Self { members, limits })
    }

    /// The group an endpoint belongs to, if any.
    pub fn group_for(&self, endpoint: &Endpoint) -> Option<&str> {
        self.members
            .iter()
            .find(|(matcher, _)| matcher.matches(endpoint))
            .map(|(_, group)| group.as_str())
    }

    /// The limits of a group.
    pub fn limits(&self, group: &str) -> Option<LimitSpec> {
        self.limits.get(group).copied()
    }

    pub fn group_count(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(yaml: &str) -> Result<SharedPolicy> {
        let rules: LimitRules = serde_yaml::from_str(yaml).unwrap();
        SharedPolicy::from_rules(&rules)
    }

    #[test]
    fn test_group_lookup() {
        let policy = policy(
            r#"
groups:
  shared_foo:
    capacity: 10
    refill_rate: 0
    endpoints:
      - /foo
      - { path: /bar, port: 7902 }
"#,
        )
        .unwrap();

        assert_eq!(policy.group_for(&Endpoint::new(7901, "/foo")), Some("shared_foo"));
        assert_eq!(policy.group_for(&Endpoint::new(7902, "/foo")), Some("shared_foo"));
        assert_eq!(policy.group_for(&Endpoint::new(7902, "/bar")), Some("shared_foo"));
        assert_eq!(policy.group_for(&Endpoint::new(7901, "/bar")), None);
        assert_eq!(policy.group_for(&Endpoint::new(7901, "/baz")), None);

        let limits = policy.limits("shared_foo").unwrap();
        assert_eq!((limits.capacity, limits.refill_rate), (10.0, 0.0));
        assert_eq!(policy.group_count(), 1);
    }

    #[test]
    fn test_overlap_is_rejected() {
        let err = policy(
            r#"
groups:
  a:
    capacity: 1
    refill_rate: 1
    endpoints: [ /foo ]
  b:
    capacity: 1
    refill_rate: 1
    endpoints: [ "/*" ]
"#,
        )
        .unwrap_err();

        match err {
            DynLimitsError::GroupOverlap { first, second, .. } => {
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_port_scoped_members_do_not_overlap() {
        let policy = policy(
            r#"
groups:
  a:
    capacity: 1
    refill_rate: 1
    endpoints: [ { path: /foo, port: 7901 } ]
  b:
    capacity: 1
    refill_rate: 1
    endpoints: [ { path: /foo, port: 7902 } ]
"#,
        )
        .unwrap();

        assert_eq!(policy.group_for(&Endpoint::new(7901, "/foo")), Some("a"));
        assert_eq!(policy.group_for(&Endpoint::new(7902, "/foo")), Some("b"));
    }

    #[test]
    fn test_portless_member_overlaps_port_scoped_one() {
        let result = policy(
            r#"
groups:
  a:
    capacity: 1
    refill_rate: 1
    endpoints: [ /foo ]
  b:
    capacity: 1
    refill_rate: 1
    endpoints: [ { path: /foo, port: 7902 } ]
"#,
        );
        assert!(matches!(result, Err(DynLimitsError::GroupOverlap { .. })));
    }

    #[test]
    fn test_repeat_within_one_group_is_allowed() {
        let result = policy(
            r#"
groups:
  a:
    capacity: 1
    refill_rate: 1
    endpoints: [ /foo, "/foo", "/{any}" ]
"#,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_param_templates_in_groups() {
        let policy = policy(
            r#"
groups:
  items:
    capacity: 5
    refill_rate: 1
    endpoints: [ "/items/{id}" ]
"#,
        )
        .unwrap();
        assert_eq!(policy.group_for(&Endpoint::new(80, "/items/42")), Some("items"));
        assert_eq!(policy.group_for(&Endpoint::new(80, "/items")), None);
    }
}
