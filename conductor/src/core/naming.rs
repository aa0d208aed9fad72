//! Deterministic branch naming and external-reference encoding.
//!
//! Branches follow `epic/<epic-id>/<task-id>-<slug>` for epic-scoped tasks and
//! `agent/<task-id>-<slug>` for epic-less tasks. The same inputs always yield
//! the same name, which is what makes branch existence usable as the
//! "work already started" signal.

use std::sync::LazyLock;

use regex::Regex;

const MAX_SLUG_LEN: usize = 40;

pub const EPIC_PREFIX: &str = "epic";
pub const FLAT_PREFIX: &str = "agent";

/// Namespace that all branches of an epic (or of epic-less tasks) live under.
pub fn branch_namespace(epic_id: Option<&str>) -> String {
    match epic_id {
        Some(epic) => format!("{EPIC_PREFIX}/{}/", sanitize_id(epic)),
        None => format!("{FLAT_PREFIX}/"),
    }
}

/// Compute the desired branch name for a task.
pub fn branch_name(epic_id: Option<&str>, task_id: &str, title: &str) -> String {
    format!(
        "{}{}-{}",
        branch_namespace(epic_id),
        sanitize_id(task_id),
        slugify(title)
    )
}

/// True when `branch` (local name, remote prefix already stripped) belongs to `task_id`
/// under the given epic namespace.
pub fn branch_belongs_to_task(branch: &str, epic_id: Option<&str>, task_id: &str) -> bool {
    let namespace = branch_namespace(epic_id);
    let Some(rest) = branch.strip_prefix(&namespace) else {
        return false;
    };
    let id = sanitize_id(task_id);
    rest == id
        || rest
            .strip_prefix(&id)
            .is_some_and(|suffix| suffix.starts_with('-'))
}

/// Keep ids path-safe: `[A-Za-z0-9._-]`, everything else becomes `-`.
pub fn sanitize_id(id: &str) -> String {
    let cleaned: String = id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '-' || c == '.').to_string();
    if cleaned.is_empty() {
        "task".to_string()
    } else {
        cleaned
    }
}

/// Lowercase, hyphen-separated slug of a title, bounded in length.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// Branch name and/or PR number stored on a task's external reference.
///
/// Encoded as whitespace/comma/semicolon separated tokens: `branch:<name>`,
/// `parent:<name>`, `pr:<n>` (also accepts `#<n>` and `.../pull/<n>` URLs).
/// Any other token (a ticket link, say) is kept and rendered back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalRef {
    pub branch: Option<String>,
    /// Branch the task branch was stacked on when it was created.
    pub parent: Option<String>,
    pub pr: Option<u64>,
    pub other: Vec<String>,
}

static PULL_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/pull/(\d+)").expect("valid pull url regex"));

impl ExternalRef {
    pub fn parse(raw: &str) -> Self {
        let mut parsed = Self::default();
        let tokens = raw
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .map(str::trim)
            .filter(|t| !t.is_empty());
        for token in tokens {
            if !parsed.absorb(token) {
                parsed.other.push(token.to_string());
            }
        }
        parsed
    }

    /// Take a recognised token into its field; false when it is not ours.
    fn absorb(&mut self, token: &str) -> bool {
        if let Some(branch) = token.strip_prefix("branch:")
            && !branch.is_empty()
        {
            self.branch = Some(branch.to_string());
        } else if let Some(parent) = token.strip_prefix("parent:")
            && !parent.is_empty()
        {
            self.parent = Some(parent.to_string());
        } else if let Some(n) = token
            .strip_prefix("pr:")
            .or_else(|| token.strip_prefix('#'))
            .and_then(|pr| pr.trim_start_matches('#').parse::<u64>().ok())
        {
            self.pr = Some(n);
        } else if let Some(n) = PULL_URL_RE
            .captures(token)
            .and_then(|caps| caps[1].parse::<u64>().ok())
        {
            self.pr = Some(n);
        } else {
            return false;
        }
        true
    }

    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if let Some(branch) = &self.branch {
            parts.push(format!("branch:{branch}"));
        }
        if let Some(parent) = &self.parent {
            parts.push(format!("parent:{parent}"));
        }
        if let Some(pr) = self.pr {
            parts.push(format!("pr:{pr}"));
        }
        parts.extend(self.other.iter().cloned());
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_is_deterministic_and_scoped() {
        assert_eq!(branch_name(Some("E1"), "T1", "Foo"), "epic/E1/T1-foo");
        assert_eq!(
            branch_name(None, "bd-12", "Add retry: backoff & jitter!"),
            "agent/bd-12-add-retry-backoff-jitter"
        );
        assert_eq!(
            branch_name(Some("E1"), "T1", "Foo"),
            branch_name(Some("E1"), "T1", "Foo")
        );
    }

    #[test]
    fn slug_is_bounded_and_never_empty() {
        let long = "word ".repeat(30);
        let slug = slugify(&long);
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert!(!slug.ends_with('-'));
        assert_eq!(slugify("!!!"), "task");
    }

    #[test]
    fn sanitize_id_replaces_path_separators() {
        assert_eq!(sanitize_id("a/b c"), "a-b-c");
        assert_eq!(sanitize_id("bd-a1.2"), "bd-a1.2");
        assert_eq!(sanitize_id("///"), "task");
    }

    #[test]
    fn branch_membership_requires_id_boundary() {
        assert!(branch_belongs_to_task("epic/E1/T1-foo", Some("E1"), "T1"));
        assert!(branch_belongs_to_task("epic/E1/T1", Some("E1"), "T1"));
        assert!(!branch_belongs_to_task("epic/E1/T10-foo", Some("E1"), "T1"));
        assert!(!branch_belongs_to_task("epic/E2/T1-foo", Some("E1"), "T1"));
        assert!(branch_belongs_to_task("agent/T1-foo", None, "T1"));
        assert!(!branch_belongs_to_task("epic/E1/T1-foo", None, "T1"));
    }

    #[test]
    fn external_ref_parses_mixed_tokens() {
        let parsed = ExternalRef::parse("branch:epic/E1/T1-foo, pr:42");
        assert_eq!(parsed.branch.as_deref(), Some("epic/E1/T1-foo"));
        assert_eq!(parsed.pr, Some(42));

        assert_eq!(ExternalRef::parse("#17").pr, Some(17));
        assert_eq!(
            ExternalRef::parse("https://github.com/o/r/pull/99").pr,
            Some(99)
        );
        let unknown = ExternalRef::parse("garbage pr:notanumber");
        assert_eq!(unknown.pr, None);
        assert_eq!(unknown.other, vec!["garbage", "pr:notanumber"]);
    }

    #[test]
    fn external_ref_render_is_parseable() {
        let value = ExternalRef {
            branch: Some("agent/T1-x".to_string()),
            parent: Some("main".to_string()),
            pr: Some(5),
            other: Vec::new(),
        };
        assert_eq!(value.render(), "branch:agent/T1-x parent:main pr:5");
        assert_eq!(ExternalRef::parse(&value.render()), value);
    }

    #[test]
    fn foreign_tokens_survive_an_update() {
        let mut value = ExternalRef::parse("JIRA-123 https://tickets.example.com/JIRA-123");
        value.branch = Some("epic/E1/T1-foo".to_string());
        value.pr = Some(8);
        assert_eq!(
            value.render(),
            "branch:epic/E1/T1-foo pr:8 JIRA-123 https://tickets.example.com/JIRA-123"
        );
    }
}
