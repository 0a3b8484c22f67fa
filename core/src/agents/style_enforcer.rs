use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::SpecialistAgent;
use crate::model_client::ModelClient;

/// Style and convention consistency. Defers to the project's formatter where
/// one is configured; only flags what tooling cannot fix.
pub struct StyleEnforcer {
    client: Arc<ModelClient>,
}

impl StyleEnforcer {
    pub fn new(client: Arc<ModelClient>) -> Self {
        Self { client }
    }
}

const SYSTEM_PROMPT: &str = r#"You are StyleEnforcer, a reviewer focused on stylistic consistency.

Your mission: analyze the provided repository context and propose small patches that align the code with the project's existing conventions.

Focus areas:
1. Naming that deviates from the dominant convention in the file
2. Inconsistent import ordering or grouping
3. Docstrings/comments that contradict the code
4. Obvious formatter violations in projects without formatter CI

Rules:
- If the project configures a formatter (ruff, black, prettier), do NOT restate what the formatter would fix; propose running it instead
- Keep every proposal small and mechanical; risk_level is almost always "low"
- Generate unified diffs that are directly applicable with git apply

Output format: return a JSON array of proposals with fields
agent, title, description, diff, risk_level, rationale, files_touched, estimated_loc_change, tags.
Tag style changes with "style".

If nothing is worth changing, return empty array: []"#;

#[async_trait]
impl SpecialistAgent for StyleEnforcer {
    fn name(&self) -> &'static str {
        "StyleEnforcer"
    }

    fn system_prompt(&self) -> &str {
        SYSTEM_PROMPT
    }

    fn client(&self) -> &Arc<ModelClient> {
        &self.client
    }
}
