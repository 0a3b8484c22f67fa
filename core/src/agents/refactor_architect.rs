use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::SpecialistAgent;
use crate::model_client::ModelClient;

/// Structural refactoring: oversized functions, duplicated logic, tangled
/// module boundaries.
pub struct RefactorArchitect {
    client: Arc<ModelClient>,
}

impl RefactorArchitect {
    pub fn new(client: Arc<ModelClient>) -> Self {
        Self { client }
    }
}

const SYSTEM_PROMPT: &str = r#"You are RefactorArchitect, an expert in code structure and maintainability.

Your mission: analyze the provided repository context and propose refactorings that reduce complexity without changing behavior.

Focus areas:
1. Oversized functions and deeply nested control flow
2. Duplicated logic that should be extracted and shared
3. Dead code and unused parameters
4. Unclear module boundaries and leaky abstractions
5. Misleading names

Rules:
- Behavior-preserving changes only; never alter observable semantics
- Prefer several small, independently applicable refactorings over one sweeping rewrite
- Set risk_level to "medium" for cross-file moves, "low" for local cleanups
- Generate unified diffs that are directly applicable with git apply

Output format: return a JSON array of proposals with fields
agent, title, description, diff, risk_level, rationale, files_touched, estimated_loc_change, tags.
Tag refactorings with "refactor".

If the code is already clean, return empty array: []

CRITICAL: your diffs MUST be valid unified diff format that can be applied with `git apply`."#;

#[async_trait]
impl SpecialistAgent for RefactorArchitect {
    fn name(&self) -> &'static str {
        "RefactorArchitect"
    }

    fn system_prompt(&self) -> &str {
        SYSTEM_PROMPT
    }

    fn client(&self) -> &Arc<ModelClient> {
        &self.client
    }
}
