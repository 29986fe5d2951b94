// Placement policy module
// Parses the distribution annotation carried by a Deployment and splits its
// replicas across node selectors.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

const RULE_DELIMITER: char = ':';
const FIELD_DELIMITER: char = ',';
const VALUE_DELIMITER: char = '=';

const BASE_KEY: &str = "base";
const WEIGHT_KEY: &str = "weight";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy declares no rules")]
    Empty,

    #[error("rule {rule} declares base, but only one rule may declare it")]
    DuplicateBase { rule: usize },

    #[error("rule {rule} has an invalid {field} value {value:?}")]
    InvalidNumber {
        rule: usize,
        field: &'static str,
        value: String,
    },

    #[error("rule {rule} has no node selector")]
    MissingSelector { rule: usize },

    #[error("rule {rule} declares more than one node selector")]
    DuplicateSelector { rule: usize },

    #[error("malformed node selector {0:?}, expected key=value")]
    MalformedSelector(String),
}

/// A single `key=value` node selector label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeSelector {
    pub key: String,
    pub value: String,
}

impl NodeSelector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn parse(expression: &str) -> Result<Self, PolicyError> {
        match expression.split_once(VALUE_DELIMITER) {
            Some((key, value)) if !key.trim().is_empty() => Ok(Self::new(key.trim(), value.trim())),
            _ => Err(PolicyError::MalformedSelector(expression.to_string())),
        }
    }

    /// True when `selectors` holds exactly this key with exactly this value.
    pub fn matches(&self, selectors: Option<&BTreeMap<String, String>>) -> bool {
        selectors
            .and_then(|selectors| selectors.get(&self.key))
            .is_some_and(|value| *value == self.value)
    }
}

impl fmt::Display for NodeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRule {
    pub selector: NodeSelector,
    /// Guaranteed replicas, already capped at the Deployment's replica count.
    pub base: Option<u32>,
    pub weight: u32,
    /// Filled in by [`Policy::allocate`].
    pub target_replicas: u32,
}

/// A parsed distribution policy, rules kept in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    rules: Vec<PlacementRule>,
    base_index: Option<usize>,
    remaining: u32,
    total_weight: u32,
}

/// Rules with their target replica counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    pub rules: Vec<PlacementRule>,
    /// Replicas left over when nothing remains to weigh them by.
    pub unassigned: u32,
}

impl AllocationPlan {
    pub fn total_targets(&self) -> u32 {
        self.rules.iter().map(|rule| rule.target_replicas).sum()
    }
}

impl Policy {
    /// Parses a policy such as `base=2,nodeType=ondemand:weight=8,nodeType=spot`.
    ///
    /// Rules are separated by `:`, fields by `,`. The `base` and `weight`
    /// fields take non-negative integers and any other field is the rule's
    /// node selector.
    pub fn parse(policy: &str, total_replicas: u32) -> Result<Self, PolicyError> {
        let mut rules = Vec::new();
        let mut base_index = None;
        let mut remaining = total_replicas;
        let mut total_weight: u32 = 0;

        let declared = policy
            .split(RULE_DELIMITER)
            .map(str::trim)
            .filter(|rule| !rule.is_empty());

        for (index, rule) in declared.enumerate() {
            let mut selector = None;
            let mut base = None;
            let mut weight: u32 = 0;

            for field in rule
                .split(FIELD_DELIMITER)
                .map(str::trim)
                .filter(|field| !field.is_empty())
            {
                let (key, value) = field
                    .split_once(VALUE_DELIMITER)
                    .map(|(key, value)| (key.trim(), value.trim()))
                    .unwrap_or((field, ""));

                match key {
                    BASE_KEY => {
                        if base_index.is_some() {
                            return Err(PolicyError::DuplicateBase { rule: index });
                        }
                        let capped = parse_count(index, BASE_KEY, value)?.min(total_replicas);
                        remaining -= capped;
                        base = Some(capped);
                        base_index = Some(index);
                    }
                    WEIGHT_KEY => {
                        let parsed = parse_count(index, WEIGHT_KEY, value)?;
                        let overflow = || PolicyError::InvalidNumber {
                            rule: index,
                            field: WEIGHT_KEY,
                            value: value.to_string(),
                        };
                        weight = weight.checked_add(parsed).ok_or_else(overflow)?;
                        total_weight = total_weight.checked_add(parsed).ok_or_else(overflow)?;
                    }
                    _ => {
                        if selector.is_some() {
                            return Err(PolicyError::DuplicateSelector { rule: index });
                        }
                        selector = Some(NodeSelector::parse(field)?);
                    }
                }
            }

            let selector = selector.ok_or(PolicyError::MissingSelector { rule: index })?;
            rules.push(PlacementRule {
                selector,
                base,
                weight,
                target_replicas: 0,
            });
        }

        if rules.is_empty() {
            return Err(PolicyError::Empty);
        }

        Ok(Self {
            rules,
            base_index,
            remaining,
            total_weight,
        })
    }

    pub fn rules(&self) -> &[PlacementRule] {
        &self.rules
    }

    /// Replicas left after the base rule took its share.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn total_weight(&self) -> u32 {
        self.total_weight
    }

    /// Computes the target replica count of every rule.
    ///
    /// The base rule starts from its base and every rule receives
    /// `floor(remaining * weight / total_weight)`. The last rule other than the
    /// base rule takes whatever the floors left behind instead of its own
    /// share, so the targets add up to the replica count exactly.
    pub fn allocate(self) -> AllocationPlan {
        let Self {
            mut rules,
            base_index,
            remaining,
            total_weight,
        } = self;

        if let Some(index) = base_index {
            rules[index].target_replicas = rules[index].base.unwrap_or_default();
        }

        if remaining == 0 {
            return AllocationPlan {
                rules,
                unassigned: 0,
            };
        }
        if total_weight == 0 {
            return AllocationPlan {
                rules,
                unassigned: remaining,
            };
        }

        let share = |weight: u32| {
            (u64::from(remaining) * u64::from(weight) / u64::from(total_weight)) as u32
        };

        let mut assigned = 0;
        if let Some(index) = base_index {
            let weighted = share(rules[index].weight);
            rules[index].target_replicas += weighted;
            assigned += weighted;
        }

        let absorber = (0..rules.len()).rev().find(|index| Some(*index) != base_index);
        for (index, rule) in rules.iter_mut().enumerate() {
            if Some(index) == base_index {
                continue;
            }
            let weighted = if Some(index) == absorber {
                remaining - assigned
            } else {
                share(rule.weight)
            };
            rule.target_replicas += weighted;
            assigned += weighted;
        }

        AllocationPlan {
            rules,
            unassigned: 0,
        }
    }
}

fn parse_count(rule: usize, field: &'static str, value: &str) -> Result<u32, PolicyError> {
    value.parse().map_err(|_| PolicyError::InvalidNumber {
        rule,
        field,
        value: value.to_string(),
    })
}
