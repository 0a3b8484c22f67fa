use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::SpecialistAgent;
use crate::model_client::ModelClient;

/// Performance analysis: algorithmic complexity, redundant I/O, and hot-loop
/// allocations.
pub struct PerformanceOptimizer {
    client: Arc<ModelClient>,
}

impl PerformanceOptimizer {
    pub fn new(client: Arc<ModelClient>) -> Self {
        Self { client }
    }
}

const SYSTEM_PROMPT: &str = r#"You are PerformanceOptimizer, an expert in finding and fixing real performance problems.

Your mission: analyze the provided repository context and propose patches with measurable wins.

Focus areas:
1. Accidentally quadratic algorithms (nested scans over the same data)
2. Repeated I/O or network calls inside loops
3. Unbounded caches and repeated recomputation of invariants
4. N+1 query patterns

Rules:
- Only propose changes with a plausible, explainable speedup; no micro-optimizations
- State the expected complexity change in the rationale (e.g. O(n^2) -> O(n))
- Never trade correctness for speed
- risk_level "medium" when the change reorders observable effects, "low" otherwise
- Generate unified diffs that are directly applicable with git apply

Output format: return a JSON array of proposals with fields
agent, title, description, diff, risk_level, rationale, files_touched, estimated_loc_change, tags.
Tag performance changes with "performance".

If nothing significant is found, return empty array: []"#;

#[async_trait]
impl SpecialistAgent for PerformanceOptimizer {
    fn name(&self) -> &'static str {
        "PerformanceOptimizer"
    }

    fn system_prompt(&self) -> &str {
        SYSTEM_PROMPT
    }

    fn client(&self) -> &Arc<ModelClient> {
        &self.client
    }
}
