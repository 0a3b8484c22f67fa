//! Specialist agents.
//!
//! Every agent is polymorphic over two operations: `propose` turns a repo
//! context into proposals, `refine` lets an agent adjust after seeing the
//! whole swarm's output. Prompt assembly and response parsing are shared;
//! only the system prompt differs per specialist.

mod performance_optimizer;
mod refactor_architect;
mod security_guardian;
mod style_enforcer;
mod test_enhancer;

pub use performance_optimizer::PerformanceOptimizer;
pub use refactor_architect::RefactorArchitect;
pub use security_guardian::SecurityGuardian;
pub use style_enforcer::StyleEnforcer;
pub use test_enhancer::TestEnhancer;

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex_lite::Regex;
use tracing::warn;

use crate::error::Result;
use crate::model_client::ChatMessage;
use crate::model_client::ModelClient;
use crate::protocol::Proposal;
use crate::protocol::RepoContext;

const PROPOSAL_TEMPERATURE: f32 = 0.2;

#[async_trait]
pub trait SpecialistAgent: Send + Sync {
    /// The agent's registry name; also the `agent` field stamped onto every
    /// proposal it emits.
    fn name(&self) -> &'static str;

    fn system_prompt(&self) -> &str;

    fn client(&self) -> &Arc<ModelClient>;

    /// Analyze the repo context and propose improvements. May be empty.
    async fn propose(&self, context: &RepoContext) -> Result<Vec<Proposal>> {
        let prompt = format_context_prompt(context);
        let content = self
            .client()
            .chat_completion(
                &[
                    ChatMessage::system(self.system_prompt()),
                    ChatMessage::user(prompt),
                ],
                Some(PROPOSAL_TEMPERATURE),
            )
            .await?;
        Ok(parse_proposals(&content, self.name()))
    }

    /// Refine after seeing every agent's proposals. The default keeps only
    /// the proposals whose `agent` field matches this agent's name, so a
    /// variant that rewrites that field elides its own output.
    async fn refine(
        &self,
        all_proposals: &[Proposal],
        _context: &RepoContext,
    ) -> Result<Vec<Proposal>> {
        Ok(all_proposals
            .iter()
            .filter(|p| p.agent == self.name())
            .cloned()
            .collect())
    }
}

/// Instantiate the enabled agents in configuration order, sharing one model
/// client. Unknown names are logged and skipped.
pub fn build_agents(
    enabled: &[String],
    client: &Arc<ModelClient>,
) -> Vec<Box<dyn SpecialistAgent>> {
    let mut agents: Vec<Box<dyn SpecialistAgent>> = Vec::new();
    for name in enabled {
        match name.as_str() {
            "SecurityGuardian" => agents.push(Box::new(SecurityGuardian::new(Arc::clone(client)))),
            "RefactorArchitect" => {
                agents.push(Box::new(RefactorArchitect::new(Arc::clone(client))))
            }
            "StyleEnforcer" => agents.push(Box::new(StyleEnforcer::new(Arc::clone(client)))),
            "PerformanceOptimizer" => {
                agents.push(Box::new(PerformanceOptimizer::new(Arc::clone(client))))
            }
            "TestEnhancer" => agents.push(Box::new(TestEnhancer::new(Arc::clone(client)))),
            other => warn!("unknown agent in configuration: {other}"),
        }
    }
    agents
}

const MAX_TREE_ENTRIES: usize = 200;
const MAX_CONFIG_PREVIEW: usize = 1000;
const MAX_SOURCE_PREVIEW: usize = 4000;
const MAX_DIFF_PREVIEW: usize = 2000;
const MAX_HOT_PATHS: usize = 20;

/// Assemble the user prompt from a repo context. Sections with nothing to
/// say are omitted entirely.
pub fn format_context_prompt(context: &RepoContext) -> String {
    let mut out = String::new();

    let goal = context.task["goal"].as_str().unwrap_or("Code quality analysis");
    let _ = writeln!(out, "# Task\nGoal: {goal}\n");

    let _ = writeln!(out, "# Repository Structure");
    let _ = writeln!(out, "Total files: {}", context.tree.total_files);
    let _ = writeln!(out, "Files:");
    for file in context.tree.files.iter().take(MAX_TREE_ENTRIES) {
        let _ = writeln!(out, "  - {file}");
    }
    if context.tree.files.len() > MAX_TREE_ENTRIES {
        let _ = writeln!(
            out,
            "  ... and {} more files",
            context.tree.files.len() - MAX_TREE_ENTRIES
        );
    }
    out.push('\n');

    if !context.important_files.is_empty() {
        let _ = writeln!(out, "# Important Configuration Files");
        for (name, contents) in &context.important_files {
            let _ = writeln!(out, "\n## {name}");
            let _ = writeln!(out, "```\n{}\n```", preview(contents, MAX_CONFIG_PREVIEW));
        }
        out.push('\n');
    }

    if !context.impact_sources.is_empty() {
        let _ = writeln!(out, "# Source Files In Scope");
        for (name, contents) in &context.impact_sources {
            let _ = writeln!(out, "\n## {name}");
            let _ = writeln!(out, "```\n{}\n```", preview(contents, MAX_SOURCE_PREVIEW));
        }
        out.push('\n');
    }

    if !context.current_diff.is_empty() {
        let _ = writeln!(out, "# Current Uncommitted Changes");
        let _ = writeln!(
            out,
            "```diff\n{}\n```\n",
            preview(&context.current_diff, MAX_DIFF_PREVIEW)
        );
    }

    if !context.failing_logs.is_empty() {
        let _ = writeln!(out, "# Failing Logs / Errors");
        let _ = writeln!(
            out,
            "```\n{}\n```\n",
            preview(&context.failing_logs, MAX_DIFF_PREVIEW)
        );
    }

    if !context.hot_paths.is_empty() {
        let _ = writeln!(out, "# Hot Paths (Files In The Impact Radius)");
        for path in context.hot_paths.iter().take(MAX_HOT_PATHS) {
            let _ = writeln!(out, "  - {path}");
        }
        out.push('\n');
    }

    let _ = writeln!(out, "# Instructions");
    let _ = writeln!(
        out,
        "Analyze the repository and generate proposals following the JSON format specified in your system prompt."
    );
    let _ = writeln!(
        out,
        "Return a JSON array of proposals. If no issues found, return empty array: []"
    );

    out
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max).collect();
    format!("{head}\n... (truncated)")
}

static FENCED_ARRAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?s)```(?:json)?\s*(\[.*?\])\s*```").expect("static regex")
});

/// Parse a JSON proposal array out of a model response.
///
/// Tolerant on purpose: the array may be fenced in Markdown or surrounded by
/// prose, and malformed items are dropped silently rather than failing the
/// agent. Items missing an `agent` field are stamped with `default_agent`.
pub fn parse_proposals(content: &str, default_agent: &str) -> Vec<Proposal> {
    let candidate = FENCED_ARRAY_RE
        .captures(content)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| content.to_string());

    let parsed: Option<serde_json::Value> = serde_json::from_str(&candidate)
        .ok()
        .or_else(|| extract_bracketed(&candidate).and_then(|s| serde_json::from_str(&s).ok()));

    let Some(serde_json::Value::Array(items)) = parsed else {
        return Vec::new();
    };

    let mut proposals = Vec::new();
    for mut item in items {
        let Some(obj) = item.as_object_mut() else {
            continue;
        };
        if !obj.contains_key("agent") {
            obj.insert(
                "agent".to_string(),
                serde_json::Value::String(default_agent.to_string()),
            );
        }
        match serde_json::from_value::<Proposal>(item) {
            Ok(proposal) => proposals.push(proposal),
            Err(_) => continue,
        }
    }
    proposals
}

fn extract_bracketed(content: &str) -> Option<String> {
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    (end > start).then(|| content[start..=end].to_string())
}
