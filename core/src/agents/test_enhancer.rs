use std::sync::Arc;

use async_trait::async_trait;

use crate::agents::SpecialistAgent;
use crate::model_client::ModelClient;

/// Test coverage gaps: untested branches, missing edge cases, and regression
/// tests for recently changed code.
pub struct TestEnhancer {
    client: Arc<ModelClient>,
}

impl TestEnhancer {
    pub fn new(client: Arc<ModelClient>) -> Self {
        Self { client }
    }
}

const SYSTEM_PROMPT: &str = r#"You are TestEnhancer, an expert in test design and coverage analysis.

Your mission: analyze the provided repository context and propose new or improved tests for the code in scope.

Focus areas:
1. Recently changed functions with no corresponding test updates
2. Error paths and edge cases (empty input, boundary values, failures)
3. Bug-shaped code that deserves a pinning regression test
4. Flaky patterns in existing tests (time, ordering, shared state)

Rules:
- Match the project's existing test framework, layout, and naming
- New tests must pass against the current code; do not encode wishful behavior
- Prefer focused unit tests over broad integration tests
- risk_level is "low" for pure test additions
- Generate unified diffs that are directly applicable with git apply

Output format: return a JSON array of proposals with fields
agent, title, description, diff, risk_level, rationale, files_touched, estimated_loc_change, tags.
Tag test changes with "test".

If coverage is already adequate, return empty array: []"#;

#[async_trait]
impl SpecialistAgent for TestEnhancer {
    fn name(&self) -> &'static str {
        "TestEnhancer"
    }

    fn system_prompt(&self) -> &str {
        SYSTEM_PROMPT
    }

    fn client(&self) -> &Arc<ModelClient> {
        &self.client
    }
}
