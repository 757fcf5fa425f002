//! Rollout creation requests and grouping strategies.

use fleetgrid_core::TargetFilter;
use fleetgrid_state::{ActionType, DistributionId, ErrorAction, GroupConditions, Threshold};
use serde::{Deserialize, Serialize};

use crate::error::{RolloutError, RolloutResult};
use crate::threshold::validate_threshold;

/// How to split a rollout's targets into groups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupingSpec {
    /// `groups` groups of (nearly) equal size, all using the default conditions.
    Equal { groups: u32 },
    /// Explicit, ordered group definitions.
    Explicit { groups: Vec<GroupDefinition> },
}

/// One explicitly defined group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Refinement on top of the rollout filter.
    #[serde(default)]
    pub target_filter: Option<String>,
    /// Share of the matching, still unassigned targets. Defaults to 100.
    #[serde(default)]
    pub target_percentage: Option<f64>,
    #[serde(default)]
    pub success: Option<Threshold>,
    #[serde(default)]
    pub error: Option<Threshold>,
    #[serde(default)]
    pub error_action: Option<ErrorAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateRolloutRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub distribution_id: DistributionId,
    pub target_filter: String,
    #[serde(default)]
    pub action_type: ActionType,
    #[serde(default)]
    pub forced_time: Option<u64>,
    pub grouping: GroupingSpec,
    #[serde(default)]
    pub default_conditions: GroupConditions,
}

/// A group definition after defaults have been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedGroup {
    pub name: String,
    pub description: Option<String>,
    pub target_filter: Option<String>,
    pub target_percentage: f64,
    pub conditions: GroupConditions,
}

impl ResolvedGroup {
    /// Filter selecting this group's candidates: the rollout filter refined by
    /// the group's own filter.
    pub fn effective_filter(&self, base: &TargetFilter) -> RolloutResult<TargetFilter> {
        match &self.target_filter {
            Some(refinement) => Ok(base.and(&TargetFilter::parse(refinement)?)),
            None => Ok(base.clone()),
        }
    }
}

impl GroupingSpec {
    /// Validate the spec and expand it into ordered group definitions.
    pub fn resolve(
        &self,
        defaults: &GroupConditions,
        max_groups: u32,
    ) -> RolloutResult<Vec<ResolvedGroup>> {
        let groups = match self {
            GroupingSpec::Equal { groups } => {
                let n = *groups;
                check_group_count(n as usize, max_groups)?;
                (0..n)
                    .map(|i| ResolvedGroup {
                        name: format!("group-{}", i + 1),
                        description: None,
                        target_filter: None,
                        // each group takes 1/(remaining groups) of what is left
                        target_percentage: 100.0 / f64::from(n - i),
                        conditions: *defaults,
                    })
                    .collect::<Vec<_>>()
            }
            GroupingSpec::Explicit { groups } => {
                check_group_count(groups.len(), max_groups)?;
                let mut resolved = Vec::with_capacity(groups.len());
                for def in groups {
                    if def.name.trim().is_empty() {
                        return Err(RolloutError::InvalidConfig("group name is empty".into()));
                    }
                    let pct = def.target_percentage.unwrap_or(100.0);
                    if !(pct > 0.0 && pct <= 100.0) {
                        return Err(RolloutError::InvalidConfig(format!(
                            "group {}: target percentage {pct} is outside (0, 100]",
                            def.name
                        )));
                    }
                    if let Some(f) = &def.target_filter {
                        TargetFilter::parse(f)?;
                    }
                    resolved.push(ResolvedGroup {
                        name: def.name.clone(),
                        description: def.description.clone(),
                        target_filter: def.target_filter.clone(),
                        target_percentage: pct,
                        conditions: GroupConditions {
                            success: def.success.unwrap_or(defaults.success),
                            error: def.error.or(defaults.error),
                            error_action: def.error_action.unwrap_or(defaults.error_action),
                        },
                    });
                }
                resolved
            }
        };

        for g in &groups {
            validate_conditions(&g.conditions)
                .map_err(|e| RolloutError::InvalidConfig(format!("group {}: {e}", g.name)))?;
        }
        Ok(groups)
    }
}

fn check_group_count(n: usize, max_groups: u32) -> RolloutResult<()> {
    if n == 0 || n > max_groups as usize {
        return Err(RolloutError::InvalidConfig(format!(
            "group count {n} is outside 1..={max_groups}"
        )));
    }
    Ok(())
}

pub fn validate_conditions(conditions: &GroupConditions) -> Result<(), String> {
    validate_threshold(&conditions.success)?;
    if let Some(error) = &conditions.error {
        validate_threshold(error)?;
    }
    Ok(())
}
