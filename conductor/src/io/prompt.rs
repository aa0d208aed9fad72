//! Prompt rendering for agent roles.
//!
//! Templates are minijinja files with `<!-- section:KEY required|droppable -->`
//! markers. After rendering, droppable sections are removed in a fixed order
//! until the prompt fits the byte budget; as a last resort the final section is
//! truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::classifier::MAX_PROPOSED_ACTIONS;
use crate::core::remediation::RemediationAction;
use crate::core::types::{Comment, FailureClass, Task};

const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");
const CHECK_TEMPLATE: &str = include_str!("prompts/check.md");
const CLASSIFY_TEMPLATE: &str = include_str!("prompts/classify.md");

/// Sections dropped first when over budget.
const DROP_ORDER: [&str; 5] = ["epic", "answers", "review", "validation", "diff"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid section regex")
});

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    for (name, source) in [
        ("implement", IMPLEMENT_TEMPLATE),
        ("repair", REPAIR_TEMPLATE),
        ("review", REVIEW_TEMPLATE),
        ("check", CHECK_TEMPLATE),
        ("classify", CLASSIFY_TEMPLATE),
    ] {
        env.add_template(name, source)
            .expect("bundled prompt template should be valid");
    }
    env
});

#[derive(Debug, Clone, Serialize)]
struct TaskContext<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
}

impl<'a> TaskContext<'a> {
    fn from_task(task: &'a Task) -> Self {
        Self {
            id: &task.id,
            title: &task.title,
            description: task.description.trim(),
        }
    }
}

/// Renders role prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Implementer prompt. `answers` are tracker comments on the task.
    pub fn implement(
        &self,
        task: &Task,
        branch: &str,
        epic: Option<&Task>,
        answers: &[Comment],
    ) -> Result<String> {
        let epic = epic.map(|e| format!("{} ({}): {}", e.title, e.id, e.description.trim()));
        self.render(
            "implement",
            context! {
                task => TaskContext::from_task(task),
                branch => branch,
                epic => epic,
                answers => (!answers.is_empty()).then_some(answers),
            },
        )
    }

    /// Repair prompt restricted to the reported gaps.
    pub fn repair(
        &self,
        task: &Task,
        branch: &str,
        gaps: &[String],
        validation_tail: Option<&str>,
    ) -> Result<String> {
        self.render(
            "repair",
            context! {
                task => TaskContext::from_task(task),
                branch => branch,
                gaps => gaps,
                validation => validation_tail.map(str::trim).filter(|s| !s.is_empty()),
            },
        )
    }

    pub fn review(&self, task: &Task, diff: &str, preview_url: Option<&str>) -> Result<String> {
        self.render(
            "review",
            context! {
                task => TaskContext::from_task(task),
                diff => diff.trim(),
                preview_url => preview_url,
            },
        )
    }

    pub fn check(&self, task: &Task, diff: &str, review_comments: &[String]) -> Result<String> {
        self.render(
            "check",
            context! {
                task => TaskContext::from_task(task),
                diff => diff.trim(),
                review => (!review_comments.is_empty()).then_some(review_comments),
            },
        )
    }

    /// Classifier prompt listing the closed taxonomy and the action allowlist.
    pub fn classify(&self, error_text: &str, phase: &str, task_id: &str) -> Result<String> {
        let classes: Vec<&str> = FailureClass::ALL.iter().map(FailureClass::as_str).collect();
        let actions: Vec<&str> = RemediationAction::ALL
            .iter()
            .map(RemediationAction::name)
            .collect();
        self.render(
            "classify",
            context! {
                classes => classes,
                actions => actions,
                max_actions => MAX_PROPOSED_ACTIONS,
                phase => phase,
                task_id => task_id,
                error => error_text.trim(),
            },
        )
    }

    fn render(&self, template: &str, ctx: minijinja::Value) -> Result<String> {
        let rendered = ENGINE
            .get_template(template)
            .with_context(|| format!("load {template} template"))?
            .render(ctx)
            .with_context(|| format!("render {template} prompt"))?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        let prompt = render_sections(&sections);
        debug!(template, bytes = prompt.len(), "rendered prompt");
        Ok(prompt)
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let required = kind.as_str() == "required";
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len: usize = sections
        .iter()
        .take(sections.len().saturating_sub(1))
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut()
        && last.content.len() > allowed
    {
        let before_len = last.content.len();
        let marker = "\n[truncated]";
        let keep = floor_char_boundary(&last.content, allowed.saturating_sub(marker.len()));
        last.content.truncate(keep);
        if allowed > marker.len() {
            last.content.push_str(marker);
        }
        debug!(
            section = %last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0)
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{epic, task};

    #[test]
    fn implement_prompt_orders_sections_and_includes_answers() {
        let mut t = task("T1");
        t.description = "Add a --verbose flag".to_string();
        let answers = vec![Comment {
            author: "dana".to_string(),
            text: "Use the existing logger".to_string(),
        }];
        let prompt = PromptBuilder::new(10_000)
            .implement(&t, "epic/E1/T1-foo", Some(&epic("E1")), &answers)
            .expect("render");

        let contract = prompt.find("### Implementer Contract").expect("contract");
        let task_pos = prompt.find("### Task").expect("task");
        let epic_pos = prompt.find("### Epic").expect("epic");
        let answers_pos = prompt.find("### Answers From Humans").expect("answers");
        assert!(contract < task_pos && task_pos < epic_pos && epic_pos < answers_pos);
        assert!(prompt.contains("`epic/E1/T1-foo`"));
        assert!(prompt.contains("- dana: Use the existing logger"));
    }

    #[test]
    fn optional_sections_are_omitted_when_empty() {
        let prompt = PromptBuilder::new(10_000)
            .implement(&task("T1"), "agent/T1-x", None, &[])
            .expect("render");
        assert!(!prompt.contains("### Epic"));
        assert!(!prompt.contains("### Answers"));
        assert!(!prompt.contains("section:"));
    }

    #[test]
    fn budget_drops_diff_before_required_sections() {
        let diff = "+line\n".repeat(500);
        let prompt = PromptBuilder::new(1_200)
            .review(&task("T1"), &diff, None)
            .expect("render");
        assert!(prompt.contains("### Reviewer Contract"));
        assert!(prompt.contains("### Task"));
        assert!(!prompt.contains("### Diff"));
    }

    #[test]
    fn oversized_required_section_is_truncated() {
        let mut t = task("T1");
        t.description = "x".repeat(5_000);
        let prompt = PromptBuilder::new(1_000)
            .repair(&t, "agent/T1-x", &["missing tests".to_string()], None)
            .expect("render");
        assert!(prompt.len() <= 1_100);
        assert!(prompt.ends_with("[truncated]"));
    }

    #[test]
    fn classify_prompt_lists_taxonomy_and_allowlist() {
        let prompt = PromptBuilder::new(10_000)
            .classify("boom", "IMPLEMENT", "T1")
            .expect("render");
        assert!(prompt.contains("- GRAPHITE_DRIFT"));
        assert!(prompt.contains("- GT_TRACK_FORCE"));
        assert!(prompt.contains("at most 3 recovery actions"));
    }
}
