//! Dependency extractor — flattens a [`Plan`] into a tool-call DAG.
//!
//! The extractor selects the steps that represent concrete tool invocations,
//! derives a sanitized tool name for each, and rebuilds the plan's
//! dependency edges as [`ToolDependency`] records the scheduler understands.
//!
//! Extraction never fails: structural oddities (edges into filtered-out
//! steps, unknown IDs, cycles) become warnings. The scheduler remains the
//! authority on whether a plan is actually runnable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::event::EventMetadata;
use crate::ids;
use crate::plan::{Plan, PlanStep};

// ---------------------------------------------------------------------------
// Flattened types
// ---------------------------------------------------------------------------

/// A single tool invocation derived from a plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID. Maps back to exactly one step via
    /// [`ExtractionResult::step_map`].
    pub call_id: String,
    /// Sanitized tool name (`[a-z0-9_]`).
    pub tool_name: String,
    /// Arguments forwarded to the tool runner.
    pub arguments: serde_json::Map<String, serde_json::Value>,
    /// Correlation ID shared by the whole extraction.
    pub correlation_id: String,
    /// Correlation metadata propagated onto emitted events.
    pub metadata: EventMetadata,
}

/// Whether a dependency must succeed for the dependent to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    #[default]
    Required,
    Optional,
}

/// What the scheduler does when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    /// Fail the execution and cancel descendants.
    #[default]
    Stop,
    /// Record the failure and let dependents proceed.
    Continue,
    /// Re-enqueue with backoff while attempts remain.
    Retry,
    /// Swap in the fallback tool and try once more.
    Fallback,
}

/// One dependency edge in the flattened tool-call DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDependency {
    /// Call that must wait.
    pub call_id: String,
    /// Call being waited on.
    pub depends_on: String,
    /// Tool name of the dependency (for diagnostics).
    pub tool_name: String,
    /// Required or optional.
    pub kind: DependencyKind,
    /// Optional guard expression, evaluated by the host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Failure policy of the dependency.
    pub failure_action: FailureAction,
    /// Cheaper substitute tool tried when the primary repeatedly fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_tool: Option<String>,
}

/// Output of [`extract_dependencies`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub tool_calls: Vec<ToolCall>,
    pub dependencies: Vec<ToolDependency>,
    pub warnings: Vec<String>,
    /// `call_id → step_id`, one entry per tool call.
    pub step_map: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Options controlling extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExtractorConfig {
    /// Drop steps not marked critical.
    pub exclude_non_critical: bool,
    /// Run DFS cycle detection and emit warnings for back edges.
    pub validate_circular: bool,
    /// Failure action for required dependencies without a retry budget.
    pub default_failure_action: FailureAction,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            exclude_non_critical: false,
            validate_circular: true,
            default_failure_action: FailureAction::Stop,
        }
    }
}

// ---------------------------------------------------------------------------
// Step filtering
// ---------------------------------------------------------------------------

/// Leading verbs that make an unbound step description look like a tool call.
const TOOL_VERBS: &[&str] = &[
    "call", "invoke", "execute", "run", "get", "post", "put", "delete", "build", "test", "deploy",
    "fetch", "process", "analyze", "generate",
];

/// Returns `true` if the step should appear in the flattened call graph.
pub fn is_tool_like(step: &PlanStep) -> bool {
    if step.tool_id.is_some() {
        return true;
    }
    let description = step.description.trim();
    if description.is_empty() {
        return false;
    }
    let first_word = description
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches(|c: char| !c.is_alphanumeric());
    if TOOL_VERBS.iter().any(|v| first_word.eq_ignore_ascii_case(v)) {
        return true;
    }
    // Function-call syntax: an identifier immediately followed by '('.
    looks_like_function_call(description)
}

fn looks_like_function_call(description: &str) -> bool {
    let Some(open) = description.find('(') else {
        return false;
    };
    if !description[open..].contains(')') {
        return false;
    }
    let head = &description[..open];
    let ident = head.split_whitespace().last().unwrap_or_default();
    !ident.is_empty() && ident.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Derive a tool name from a step: the bound tool, or the first word of the
/// description, sanitized to `[a-z0-9_]`.
pub fn derive_tool_name(step: &PlanStep) -> String {
    let raw = step
        .tool_id
        .clone()
        .unwrap_or_else(|| {
            step.description
                .split_whitespace()
                .next()
                .unwrap_or("tool")
                .to_string()
        });
    sanitize_tool_name(&raw)
}

/// Lowercase and replace every character outside `[a-z0-9_]`, collapsing
/// runs of replacements.
pub fn sanitize_tool_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for c in raw.chars() {
        let mapped = if c.is_ascii_alphanumeric() {
            last_underscore = false;
            c.to_ascii_lowercase()
        } else if last_underscore {
            continue;
        } else {
            last_underscore = true;
            '_'
        };
        out.push(mapped);
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "tool".to_string()
    } else {
        trimmed.to_string()
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Flatten a plan into tool calls and dependency edges.
pub fn extract_dependencies(plan: &Plan, config: &ExtractorConfig) -> ExtractionResult {
    let mut result = ExtractionResult::default();
    let correlation_id = plan
        .metadata
        .get("correlation_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(ids::correlation_id);

    // Pass 1: select steps and mint call IDs.
    let mut call_by_step: HashMap<&str, usize> = HashMap::new();
    for step in &plan.steps {
        if config.exclude_non_critical && !step.critical {
            continue;
        }
        if !is_tool_like(step) {
            continue;
        }
        let call = ToolCall {
            call_id: ids::call_id(),
            tool_name: derive_tool_name(step),
            arguments: step.params.clone(),
            correlation_id: correlation_id.clone(),
            metadata: EventMetadata::correlated(correlation_id.clone()),
        };
        result
            .step_map
            .insert(call.call_id.clone(), step.id.clone());
        call_by_step.insert(step.id.as_str(), result.tool_calls.len());
        result.tool_calls.push(call);
    }

    // Pass 2: rebuild dependency edges between selected steps.
    for step in &plan.steps {
        let Some(&call_idx) = call_by_step.get(step.id.as_str()) else {
            continue;
        };
        let call_id = result.tool_calls[call_idx].call_id.clone();

        for dep in &step.dependencies {
            let Some(dep_step) = plan.step(dep) else {
                result.warnings.push(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ));
                continue;
            };
            let Some(&dep_idx) = call_by_step.get(dep.as_str()) else {
                result.warnings.push(format!(
                    "step '{}' depends on '{}', which was filtered out of the call graph",
                    step.id, dep
                ));
                continue;
            };

            let kind = if dep_step.critical {
                DependencyKind::Required
            } else {
                DependencyKind::Optional
            };
            let failure_action = match kind {
                DependencyKind::Optional => FailureAction::Continue,
                DependencyKind::Required if dep_step.retry_limit > 0 => FailureAction::Retry,
                DependencyKind::Required => config.default_failure_action,
            };
            let dep_tool = result.tool_calls[dep_idx].tool_name.clone();
            let fallback_tool =
                (dep_step.retry_limit > 1).then(|| format!("{dep_tool}_lite"));

            result.dependencies.push(ToolDependency {
                call_id: call_id.clone(),
                depends_on: result.tool_calls[dep_idx].call_id.clone(),
                tool_name: dep_tool,
                kind,
                condition: None,
                failure_action,
                fallback_tool,
            });
        }
    }

    if config.validate_circular {
        detect_cycles(plan, &call_by_step, &mut result);
    }

    result
}

// DFS three-coloring over the selected steps; a back edge to a gray node is
// a cycle, reported as a warning naming the offending tool.
fn detect_cycles<'a>(
    plan: &'a Plan,
    call_by_step: &HashMap<&'a str, usize>,
    result: &mut ExtractionResult,
) {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit<'a>(
        node: &'a str,
        plan: &'a Plan,
        call_by_step: &HashMap<&'a str, usize>,
        colors: &mut HashMap<&'a str, Color>,
        warnings: &mut Vec<String>,
        tool_calls: &[ToolCall],
    ) {
        colors.insert(node, Color::Gray);
        if let Some(step) = plan.step(node) {
            for dep in &step.dependencies {
                let Some(&idx) = call_by_step.get(dep.as_str()) else {
                    continue;
                };
                let dep_key = plan
                    .step(dep)
                    .map(|s| s.id.as_str())
                    .unwrap_or_default();
                match colors.get(dep_key).copied() {
                    Some(Color::Gray) => warnings.push(format!(
                        "circular dependency detected through tool '{}'",
                        tool_calls[idx].tool_name
                    )),
                    Some(Color::White) => {
                        visit(dep_key, plan, call_by_step, colors, warnings, tool_calls);
                    }
                    _ => {}
                }
            }
        }
        colors.insert(node, Color::Black);
    }

    let mut colors: HashMap<&'a str, Color> =
        call_by_step.keys().map(|&id| (id, Color::White)).collect();
    let roots: Vec<&'a str> = call_by_step.keys().copied().collect();
    for root in roots {
        if colors.get(root) == Some(&Color::White) {
            visit(
                root,
                plan,
                call_by_step,
                &mut colors,
                &mut result.warnings,
                &result.tool_calls,
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanStep, StrategyKind};
    use std::collections::HashSet;

    fn plan_with(steps: Vec<PlanStep>) -> Plan {
        let mut plan = Plan::new("goal", StrategyKind::Linear);
        plan.steps = steps;
        plan
    }

    #[test]
    fn bound_tool_is_always_included() {
        let step = PlanStep::new("s1", "Think about the problem").with_tool("scratchpad");
        assert!(is_tool_like(&step));
    }

    #[test]
    fn verb_prefixed_descriptions_are_tool_like() {
        for desc in [
            "fetch the latest report",
            "GET /api/users",
            "Analyze the search results",
            "deploy to staging",
        ] {
            assert!(is_tool_like(&PlanStep::new("s", desc)), "{desc}");
        }
        assert!(!is_tool_like(&PlanStep::new("s", "think about life")));
    }

    #[test]
    fn function_call_syntax_is_tool_like() {
        assert!(is_tool_like(&PlanStep::new("s", "summarize(report)")));
        assert!(is_tool_like(&PlanStep::new(
            "s",
            "use search_index(query, 10)"
        )));
        assert!(!is_tool_like(&PlanStep::new("s", "think (carefully)")));
    }

    #[test]
    fn tool_name_sanitization() {
        assert_eq!(sanitize_tool_name("Web Search!"), "web_search");
        assert_eq!(sanitize_tool_name("GET"), "get");
        assert_eq!(sanitize_tool_name("__weird--name__"), "weird_name");
        assert_eq!(sanitize_tool_name("###"), "tool");
    }

    #[test]
    fn extraction_rebuilds_declared_edges() {
        let plan = plan_with(vec![
            PlanStep::new("a", "fetch data").critical(),
            PlanStep::new("b", "process data").depends_on("a").critical(),
            PlanStep::new("c", "generate summary")
                .depends_on("a")
                .depends_on("b"),
        ]);
        let result = extract_dependencies(&plan, &ExtractorConfig::default());

        assert_eq!(result.tool_calls.len(), 3);
        assert_eq!(result.dependencies.len(), 3);
        assert!(result.warnings.is_empty());

        // Round-trip law: the edge set matches what the plan declares.
        let step_of = |call_id: &str| result.step_map[call_id].clone();
        let edges: HashSet<(String, String)> = result
            .dependencies
            .iter()
            .map(|d| (step_of(&d.call_id), step_of(&d.depends_on)))
            .collect();
        let declared: HashSet<(String, String)> = plan
            .steps
            .iter()
            .flat_map(|s| {
                s.dependencies
                    .iter()
                    .map(move |d| (s.id.clone(), d.clone()))
            })
            .collect();
        assert_eq!(edges, declared);
    }

    #[test]
    fn call_ids_map_to_exactly_one_step() {
        let plan = plan_with(vec![
            PlanStep::new("a", "fetch data"),
            PlanStep::new("b", "process data").depends_on("a"),
        ]);
        let result = extract_dependencies(&plan, &ExtractorConfig::default());
        assert_eq!(result.step_map.len(), result.tool_calls.len());
        let steps: HashSet<&String> = result.step_map.values().collect();
        assert_eq!(steps.len(), result.tool_calls.len());
    }

    #[test]
    fn optional_dependency_continues_required_stops() {
        let plan = plan_with(vec![
            PlanStep::new("opt", "fetch extras"),
            PlanStep::new("req", "fetch essentials").critical(),
            PlanStep::new("use", "process everything")
                .depends_on("opt")
                .depends_on("req"),
        ]);
        let result = extract_dependencies(&plan, &ExtractorConfig::default());

        let by_tool = |name: &str| {
            result
                .dependencies
                .iter()
                .find(|d| d.tool_name == name)
                .unwrap()
        };
        let optional = by_tool("fetch");
        // Both tools sanitize to "fetch"; disambiguate via kind instead.
        let kinds: Vec<DependencyKind> = result.dependencies.iter().map(|d| d.kind).collect();
        assert!(kinds.contains(&DependencyKind::Optional));
        assert!(kinds.contains(&DependencyKind::Required));
        let _ = optional;

        for dep in &result.dependencies {
            match dep.kind {
                DependencyKind::Optional => {
                    assert_eq!(dep.failure_action, FailureAction::Continue)
                }
                DependencyKind::Required => assert_eq!(dep.failure_action, FailureAction::Stop),
            }
        }
    }

    #[test]
    fn retry_budget_sets_retry_and_fallback() {
        let plan = plan_with(vec![
            PlanStep::new("flaky", "fetch remote data")
                .critical()
                .with_retry_limit(3),
            PlanStep::new("use", "process data").depends_on("flaky"),
        ]);
        let result = extract_dependencies(&plan, &ExtractorConfig::default());
        let dep = &result.dependencies[0];
        assert_eq!(dep.failure_action, FailureAction::Retry);
        assert_eq!(dep.fallback_tool.as_deref(), Some("fetch_lite"));
    }

    #[test]
    fn filtered_out_dependency_warns() {
        let plan = plan_with(vec![
            PlanStep::new("muse", "ponder deeply"), // not tool-like
            PlanStep::new("act", "execute the idea").depends_on("muse"),
        ]);
        let result = extract_dependencies(&plan, &ExtractorConfig::default());
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.dependencies.len(), 0);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("filtered out"));
    }

    #[test]
    fn unknown_dependency_warns() {
        let plan = plan_with(vec![
            PlanStep::new("act", "execute the idea").depends_on("ghost"),
        ]);
        let result = extract_dependencies(&plan, &ExtractorConfig::default());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("unknown step 'ghost'"));
    }

    #[test]
    fn cycles_warn_but_do_not_fail() {
        let plan = plan_with(vec![
            PlanStep::new("a", "fetch a").depends_on("b"),
            PlanStep::new("b", "fetch b").depends_on("a"),
        ]);
        let result = extract_dependencies(&plan, &ExtractorConfig::default());
        assert!(
            result
                .warnings
                .iter()
                .any(|w| w.contains("circular dependency")),
            "warnings: {:?}",
            result.warnings
        );
        // Extraction still produced the calls and edges.
        assert_eq!(result.tool_calls.len(), 2);
        assert_eq!(result.dependencies.len(), 2);
    }

    #[test]
    fn exclude_non_critical_filters() {
        let plan = plan_with(vec![
            PlanStep::new("a", "fetch a").critical(),
            PlanStep::new("b", "fetch b"),
        ]);
        let config = ExtractorConfig {
            exclude_non_critical: true,
            ..Default::default()
        };
        let result = extract_dependencies(&plan, &config);
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.step_map.values().next().unwrap(), "a");
    }
}
