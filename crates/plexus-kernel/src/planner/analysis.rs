//! Shared plan analysis — parallelism partitioning, complexity estimation,
//! optimization suggestions.
//!
//! These are the default implementations behind the
//! [`PlanStrategy`](super::strategy::PlanStrategy) analysis methods. They
//! work from plan topology alone, so every strategy gets sensible analysis
//! for free and only overrides when its topology encodes extra knowledge.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::extract::derive_tool_name;
use crate::plan::{Complexity, Plan, PlanStep};

use super::strategy::{
    ComplexityEstimate, OptimizationKind, OptimizationSuggestion, ParallelismAnalysis,
    PlanningContext, RiskLevel,
};

// ---------------------------------------------------------------------------
// Tool categorization
// ---------------------------------------------------------------------------

/// How a tool name's lexical shape constrains scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    /// Read-like: safe to run alongside anything.
    Parallelizable,
    /// Write-like: must not share a tick.
    Sequential,
    /// Analysis-like: parallel only within its own dependency level.
    Conditional,
}

const READ_HINTS: &[&str] = &["read", "get", "fetch", "list", "search", "query", "load"];
const WRITE_HINTS: &[&str] = &["write", "create", "update", "delete", "post", "put", "insert"];
const ANALYZE_HINTS: &[&str] = &["analyze", "analyse", "evaluate", "assess"];

/// Categorize a tool by lexical hints in its name.
pub fn categorize_tool(tool_name: &str) -> ToolCategory {
    let name = tool_name.to_ascii_lowercase();
    if WRITE_HINTS.iter().any(|h| name.starts_with(h)) {
        ToolCategory::Sequential
    } else if READ_HINTS.iter().any(|h| name.starts_with(h)) {
        ToolCategory::Parallelizable
    } else if ANALYZE_HINTS.iter().any(|h| name.starts_with(h)) {
        ToolCategory::Conditional
    } else {
        ToolCategory::Conditional
    }
}

// ---------------------------------------------------------------------------
// Parallelism
// ---------------------------------------------------------------------------

/// Partition a plan's steps into parallel groups and a sequential tail.
///
/// Steps are grouped by dependency depth (all steps at the same depth are
/// mutually independent in a valid DAG). A depth group becomes a parallel
/// group when it has at least two members and every member allows parallel
/// execution; write-like tools and `can_run_in_parallel = false` steps are
/// pulled out into the sequential list.
pub fn analyze_parallelism(plan: &Plan) -> ParallelismAnalysis {
    let mut analysis = ParallelismAnalysis::default();
    let Ok(order) = plan.topological_order() else {
        // Cyclic plans cannot be partitioned; everything is sequential.
        analysis.sequential = plan.steps.iter().map(|s| s.id.clone()).collect();
        return analysis;
    };

    // Depth = 1 + max(depth of dependencies).
    let mut depth: HashMap<&str, usize> = HashMap::new();
    for id in &order {
        let step = plan.step(id).expect("ordered id exists");
        let d = step
            .dependencies
            .iter()
            .filter_map(|dep| depth.get(dep.as_str()))
            .copied()
            .max()
            .map_or(0, |d| d + 1);
        depth.insert(step.id.as_str(), d);
    }

    let mut levels: BTreeMap<usize, Vec<&PlanStep>> = BTreeMap::new();
    for step in &plan.steps {
        levels.entry(depth[step.id.as_str()]).or_default().push(step);
    }

    for (_, steps) in levels {
        let (eligible, solo): (Vec<&PlanStep>, Vec<&PlanStep>) =
            steps.into_iter().partition(|s| {
                s.can_run_in_parallel
                    && categorize_tool(&derive_tool_name(s)) != ToolCategory::Sequential
            });

        analysis
            .sequential
            .extend(solo.iter().map(|s| s.id.clone()));

        if eligible.len() > 1 {
            analysis
                .parallelizable
                .push(eligible.iter().map(|s| s.id.clone()).collect());
        } else {
            analysis
                .sequential
                .extend(eligible.iter().map(|s| s.id.clone()));
        }
    }

    analysis
}

// ---------------------------------------------------------------------------
// Complexity
// ---------------------------------------------------------------------------

/// Estimate total duration, risk, and confidence for a plan.
pub fn estimate_complexity(plan: &Plan, ctx: &PlanningContext) -> ComplexityEstimate {
    let multiplier = if ctx.time_multiplier > 0.0 {
        ctx.time_multiplier
    } else {
        1.0
    };

    let total_ms: u64 = plan
        .steps
        .iter()
        .map(PlanStep::effective_duration_ms)
        .sum();
    let estimated_duration_ms = (total_ms as f64 * multiplier) as u64;
    let critical_path_ms = (plan.critical_path_ms() as f64 * multiplier) as u64;

    let step_count = plan.steps.len();
    let risk = if step_count == 0 {
        RiskLevel::Low
    } else {
        let critical_fraction = plan.steps.iter().filter(|s| s.critical).count() as f64
            / step_count as f64;
        let avg_weight = plan
            .steps
            .iter()
            .map(|s| match s.complexity {
                Complexity::Low => 1.0,
                Complexity::Medium => 2.0,
                Complexity::High => 3.0,
            })
            .sum::<f64>()
            / step_count as f64;
        if critical_fraction > 0.5 || avg_weight > 2.5 {
            RiskLevel::High
        } else if critical_fraction > 0.2 || avg_weight > 1.5 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    };

    // Confidence shrinks with plan size and unknown durations, grows when
    // historical data backs the estimate.
    let mut confidence = 1.0 - 0.04 * step_count as f64;
    let unknown = plan
        .steps
        .iter()
        .filter(|s| s.estimated_duration_ms == 0)
        .count();
    if unknown > 0 {
        confidence -= 0.1 * (unknown as f64 / step_count.max(1) as f64);
    }
    if ctx.has_historical_data {
        confidence += 0.1;
    }

    ComplexityEstimate {
        estimated_duration_ms,
        critical_path_ms,
        risk,
        confidence: confidence.clamp(0.1, 1.0),
        step_count,
    }
}

// ---------------------------------------------------------------------------
// Optimizations
// ---------------------------------------------------------------------------

/// Duration above which a step is worth caching.
const CACHE_WORTHY_MS: u64 = 5_000;

/// Plan size above which batching is suggested.
const BATCH_THRESHOLD: usize = 10;

/// Detect optimization opportunities in a plan.
pub fn suggest_optimizations(plan: &Plan) -> Vec<OptimizationSuggestion> {
    let mut suggestions = Vec::new();
    let total_ms: u64 = plan
        .steps
        .iter()
        .map(PlanStep::effective_duration_ms)
        .sum::<u64>()
        .max(1);

    // Independent clusters → parallelize.
    let parallelism = analyze_parallelism(plan);
    for group in &parallelism.parallelizable {
        let group_ms: u64 = group
            .iter()
            .filter_map(|id| plan.step(id))
            .map(PlanStep::effective_duration_ms)
            .sum();
        let longest: u64 = group
            .iter()
            .filter_map(|id| plan.step(id))
            .map(PlanStep::effective_duration_ms)
            .max()
            .unwrap_or(0);
        let savings = (group_ms - longest) as f64 / total_ms as f64;
        if savings > 0.0 {
            suggestions.push(OptimizationSuggestion {
                kind: OptimizationKind::Parallelize,
                description: format!("{} independent steps can run concurrently", group.len()),
                affected_steps: group.clone(),
                potential_savings: savings,
                tradeoffs: "Higher peak resource usage while the group runs".into(),
            });
        }
    }

    // Duplicate descriptions → merge.
    let mut by_description: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &plan.steps {
        by_description
            .entry(step.description.as_str())
            .or_default()
            .push(step.id.as_str());
    }
    let mut duplicate_groups: Vec<(&str, Vec<&str>)> = by_description
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .collect();
    duplicate_groups.sort_by_key(|(desc, _)| *desc);
    for (description, ids) in duplicate_groups {
        let duplicated_ms: u64 = ids
            .iter()
            .skip(1)
            .filter_map(|id| plan.step(id))
            .map(PlanStep::effective_duration_ms)
            .sum();
        suggestions.push(OptimizationSuggestion {
            kind: OptimizationKind::Merge,
            description: format!("{} steps share the description '{}'", ids.len(), description),
            affected_steps: ids.iter().map(|s| s.to_string()).collect(),
            potential_savings: duplicated_ms as f64 / total_ms as f64,
            tradeoffs: "Merged steps lose independent retry budgets".into(),
        });
    }

    // Long steps → cache.
    for step in &plan.steps {
        if step.effective_duration_ms() >= CACHE_WORTHY_MS {
            suggestions.push(OptimizationSuggestion {
                kind: OptimizationKind::Cache,
                description: format!(
                    "Step '{}' runs for ~{}ms; cache its result for repeat goals",
                    step.id,
                    step.effective_duration_ms()
                ),
                affected_steps: vec![step.id.clone()],
                potential_savings: step.effective_duration_ms() as f64 / total_ms as f64,
                tradeoffs: "Stale results until the cache entry expires".into(),
            });
        }
    }

    // Large plans → batch.
    if plan.steps.len() > BATCH_THRESHOLD {
        suggestions.push(OptimizationSuggestion {
            kind: OptimizationKind::Batch,
            description: format!(
                "Plan has {} steps; execute in batches to bound resource usage",
                plan.steps.len()
            ),
            affected_steps: plan.steps.iter().map(|s| s.id.clone()).collect(),
            potential_savings: 0.0,
            tradeoffs: "Later batches start only after earlier ones finish".into(),
        });
    }

    suggestions
}

/// Collect the set of step IDs appearing in any suggestion (for reporting).
pub fn affected_step_ids(suggestions: &[OptimizationSuggestion]) -> HashSet<String> {
    suggestions
        .iter()
        .flat_map(|s| s.affected_steps.iter().cloned())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
