//! Eligibility Rule Engine
//!
//! Rules are pure predicates over a [`RuleContext`]. A [`RuleSet`] is an
//! immutable, ordered list of rules passed explicitly into every evaluation;
//! the first rule that denies decides the outcome.

use crate::model::{attr, Attributes, Consumer, ConsumerType, Entitlement, PoolDefinition, Product};
use sase_common::{EntitlementError, EntitlementResult, RuleCode};
use std::sync::Arc;

/// Rule failure codes
pub mod codes {
    /// Virtualization entitlements are reserved for physical systems
    pub const VIRT_ONLY: &str = "rulefailed.virt.ents.only.for.physical.systems";
    /// Consumer type does not match the pool's required type
    pub const CONSUMER_TYPE_MISMATCH: &str = "rulefailed.consumer.type.mismatch";
    /// Consumer already holds an entitlement from a single-entitlement pool
    pub const ALREADY_HAS_PRODUCT: &str = "rulefailed.consumer.already.has.product";
}

/// Outcome of a rule evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Every rule passed
    Allow,
    /// First failing rule's code
    Deny(RuleCode),
}

impl Verdict {
    /// Whether the bind may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Convert a denial into [`EntitlementError::RuleViolation`]
    pub fn into_result(self) -> EntitlementResult<()> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(code) => Err(EntitlementError::RuleViolation(code)),
        }
    }
}

/// Everything a rule may look at
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    /// Consumer requesting the bind
    pub consumer: &'a Consumer,
    /// Pool being bound
    pub pool: &'a PoolDefinition,
    /// Product the pool grants
    pub product: &'a Product,
    /// Product attributes overlaid by pool attributes
    pub attributes: &'a Attributes,
    /// Entitlements the consumer already holds
    pub existing: &'a [Entitlement],
}

/// Eligibility predicate
pub trait Rule: Send + Sync {
    /// Stable rule name used in configuration
    fn name(&self) -> &'static str;

    /// Evaluate the rule. Must not have side effects.
    fn evaluate(&self, ctx: &RuleContext<'_>) -> Verdict;
}

/// Pools flagged `virt_only` may not be bound by virtual systems
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtOnlyRule;

impl Rule for VirtOnlyRule {
    fn name(&self) -> &'static str {
        "virt_only"
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Verdict {
        if ctx.attributes.is_true(attr::VIRT_ONLY) && ctx.consumer.consumer_type == ConsumerType::VirtSystem {
            return Verdict::Deny(RuleCode::from_static(codes::VIRT_ONLY));
        }
        Verdict::Allow
    }
}

/// Pools with `requires_consumer_type` only accept that consumer type
#[derive(Debug, Default, Clone, Copy)]
pub struct RequiresConsumerTypeRule;

impl Rule for RequiresConsumerTypeRule {
    fn name(&self) -> &'static str {
        "requires_consumer_type"
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Verdict {
        // An unrecognised type name matches no consumer
        match ctx.attributes.get(attr::REQUIRES_CONSUMER_TYPE) {
            Some(required) if required.trim().parse::<ConsumerType>().ok() != Some(ctx.consumer.consumer_type) => {
                Verdict::Deny(RuleCode::from_static(codes::CONSUMER_TYPE_MISMATCH))
            }
            _ => Verdict::Allow,
        }
    }
}

/// One entitlement per pool per consumer unless the pool is multi-entitlement
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiEntitlementRule;

impl Rule for MultiEntitlementRule {
    fn name(&self) -> &'static str {
        "multi_entitlement"
    }

    fn evaluate(&self, ctx: &RuleContext<'_>) -> Verdict {
        if ctx.attributes.is_true(attr::MULTI_ENTITLEMENT) {
            return Verdict::Allow;
        }
        if ctx.existing.iter().any(|e| e.pool_id == ctx.pool.id) {
            return Verdict::Deny(RuleCode::from_static(codes::ALREADY_HAS_PRODUCT));
        }
        Verdict::Allow
    }
}

/// Immutable ordered rule set
#[derive(Clone)]
pub struct RuleSet {
    rules: Arc<[Arc<dyn Rule>]>,
}

impl RuleSet {
    /// Rule set that allows everything
    pub fn empty() -> Self {
        Self::from_rules(Vec::new())
    }

    /// Built-in rules in evaluation order
    pub fn standard() -> Self {
        let rules: Vec<Arc<dyn Rule>> = vec![
            Arc::new(VirtOnlyRule),
            Arc::new(RequiresConsumerTypeRule),
            Arc::new(MultiEntitlementRule),
        ];
        Self::from_rules(rules)
    }

    /// Build from rules in evaluation order
    pub fn from_rules(rules: Vec<Arc<dyn Rule>>) -> Self {
        Self { rules: rules.into() }
    }

    /// Build from configured rule names, keeping their order
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> EntitlementResult<Self> {
        let rules = names
            .iter()
            .map(|name| Self::builtin(name.as_ref()))
            .collect::<EntitlementResult<Vec<_>>>()?;
        Ok(Self::from_rules(rules))
    }

    fn builtin(name: &str) -> EntitlementResult<Arc<dyn Rule>> {
        match name {
            "virt_only" => Ok(Arc::new(VirtOnlyRule)),
            "requires_consumer_type" => Ok(Arc::new(RequiresConsumerTypeRule)),
            "multi_entitlement" => Ok(Arc::new(MultiEntitlementRule)),
            other => Err(EntitlementError::Config(format!("unknown rule: {other}"))),
        }
    }

    /// New rule set with `rule` appended
    pub fn with(&self, rule: Arc<dyn Rule>) -> Self {
        let mut rules: Vec<_> = self.rules.iter().cloned().collect();
        rules.push(rule);
        Self::from_rules(rules)
    }

    /// Rule names in evaluation order
    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rule is configured
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self { Self::standard() }
}

impl std::fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSet").field("rules", &self.names()).finish()
    }
}

/// Stateless evaluator
pub struct RuleEngine;

impl RuleEngine {
    /// Evaluate `rules` in order; the first denial wins
    pub fn evaluate(rules: &RuleSet, ctx: &RuleContext<'_>) -> Verdict {
        for rule in rules.rules.iter() {
            if let Verdict::Deny(code) = rule.evaluate(ctx) {
                tracing::debug!(rule = rule.name(), code = %code, pool = %ctx.pool.id, "Rule denied");
                return Verdict::Deny(code);
            }
        }
        Verdict::Allow
    }
}
