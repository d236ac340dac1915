//! Action classification for the approval gate.
//!
//! After each successful execution the controller asks an [`ActionClassifier`]
//! whether the agent did something that needs a human to sign off. The
//! classifier is a named, ordered list of [`ClassificationRule`]s; the first
//! rule with a matching pattern wins.
//!
//! This is a best-effort heuristic. A missed risky action (false negative)
//! is the dangerous failure mode, so the default rule set checks the
//! approval-requiring categories before any safe pattern and errs toward
//! matching them.

use crate::approval::ApprovalActionType;
use crate::task::Task;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of action the agent performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Planning,
    Architecture,
    GitPush,
    LargeEdit,
    TestRun,
    FormatLint,
    GitLocal,
    PackageInstall,
    Edit,
}

impl ActionKind {
    /// Approval category for kinds that require sign-off.
    #[must_use]
    pub fn approval_type(&self) -> Option<ApprovalActionType> {
        match self {
            ActionKind::Planning => Some(ApprovalActionType::Planning),
            ActionKind::Architecture => Some(ApprovalActionType::Architecture),
            ActionKind::GitPush => Some(ApprovalActionType::GitPush),
            ActionKind::LargeEdit => Some(ApprovalActionType::LargeEdit),
            _ => None,
        }
    }

    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            ActionKind::Planning => "Planning decision",
            ActionKind::Architecture => "Architecture change",
            ActionKind::GitPush => "Push to remote repository",
            ActionKind::LargeEdit => "Large-scale edit",
            ActionKind::TestRun => "Test run",
            ActionKind::FormatLint => "Formatting or linting",
            ActionKind::GitLocal => "Local git operation",
            ActionKind::PackageInstall => "Package installation",
            ActionKind::Edit => "Code edit",
        }
    }
}

impl From<ApprovalActionType> for ActionKind {
    fn from(action_type: ApprovalActionType) -> Self {
        match action_type {
            ApprovalActionType::Planning => ActionKind::Planning,
            ApprovalActionType::Architecture => ActionKind::Architecture,
            ApprovalActionType::GitPush => ActionKind::GitPush,
            ApprovalActionType::LargeEdit => ActionKind::LargeEdit,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Verdict for one agent response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub kind: ActionKind,
    pub requires_approval: bool,
    /// Name of the rule that matched, `None` for the fallback.
    pub rule: Option<String>,
    /// Text fragment that triggered the match.
    pub matched: Option<String>,
    pub description: String,
}

impl Classification {
    #[must_use]
    pub fn approval_type(&self) -> Option<ApprovalActionType> {
        if self.requires_approval {
            self.kind.approval_type()
        } else {
            None
        }
    }
}

/// One named pattern list.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub name: String,
    pub kind: ActionKind,
    pub requires_approval: bool,
    patterns: Vec<Regex>,
}

impl ClassificationRule {
    /// Build a rule from case-insensitive regex patterns.
    ///
    /// # Errors
    ///
    /// Returns an error if any pattern fails to compile.
    pub fn new<S: AsRef<str>>(
        name: impl Into<String>,
        kind: ActionKind,
        requires_approval: bool,
        patterns: &[S],
    ) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| RegexBuilder::new(p.as_ref()).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.into(),
            kind,
            requires_approval,
            patterns,
        })
    }

    /// First matching fragment in `text`.
    #[must_use]
    pub fn find<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.patterns
            .iter()
            .find_map(|re| re.find(text).map(|m| m.as_str()))
    }
}

/// A rule supplied through configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    pub name: String,
    pub kind: ActionKind,
    #[serde(default = "default_requires_approval")]
    pub requires_approval: bool,
    pub patterns: Vec<String>,
}

fn default_requires_approval() -> bool {
    true
}

impl RuleConfig {
    /// # Errors
    ///
    /// Returns an error if any pattern fails to compile.
    pub fn compile(&self) -> Result<ClassificationRule, regex::Error> {
        ClassificationRule::new(
            self.name.clone(),
            self.kind,
            self.requires_approval,
            &self.patterns,
        )
    }
}

const PLANNING_PATTERNS: &[&str] = &[
    r"\bimplementation plan\b",
    r"\bplan(?:s|ned|ning)?\b",
    r"\bstrateg(?:y|ies|ic)\b",
    r"\broadmap\b",
    r"\bproposal\b",
];

const ARCHITECTURE_PATTERNS: &[&str] = &[
    r"\barchitect(?:ure|ural|ed)?\b",
    r"\bdesign(?:ed|s)?\b",
    r"\bschema change\b",
    r"\bdata model\b",
];

const GIT_PUSH_PATTERNS: &[&str] = &[
    r"\bgit push\b",
    r"\bpush(?:ed|es|ing)?\b[^.\n]{0,40}?\b(?:to|upstream)\b",
    r"\b(?:origin|upstream|remote)/\S+",
    r"\bforce[- ]push",
];

const LARGE_EDIT_PATTERNS: &[&str] = &[
    r"\brefactor(?:ed|ing|s)?\b",
    r"\brewr(?:ite|ote|itten|iting)\b",
    r"\bmultiple files\b",
    r"\bacross the (?:code ?base|project|repo(?:sitory)?)\b",
    r"\bmigrat(?:e|ed|ion|ing)\b",
    r"\brenamed? .* throughout\b",
];

const TEST_RUN_PATTERNS: &[&str] = &[
    r"\bcargo (?:test|nextest)\b",
    r"\b(?:npm|pnpm|yarn) (?:run )?test\b",
    r"\bpytest\b",
    r"\bgo test\b",
    r"\btests? (?:pass(?:ed|es)?|are passing)\b",
];

const FORMAT_LINT_PATTERNS: &[&str] = &[
    r"\bcargo (?:fmt|clippy)\b",
    r"\bprettier\b",
    r"\beslint\b",
    r"\bruff\b",
    r"\bblack\b",
    r"\bgofmt\b",
    r"\bformatted\b",
    r"\blint(?:ed|ing)?\b",
];

const GIT_LOCAL_PATTERNS: &[&str] = &[
    r"\bgit (?:add|commit|status|diff|stash|log)\b",
    r"\bcommitted\b",
    r"\bstaged\b",
];

const PACKAGE_INSTALL_PATTERNS: &[&str] = &[
    r"\b(?:npm|pnpm|yarn) (?:install|add|i)\b",
    r"\bpip install\b",
    r"\bcargo add\b",
    r"\bgo get\b",
    r"\binstalled (?:the )?(?:dependenc(?:y|ies)|packages?)\b",
];

/// Priority-ordered rule list.
#[derive(Debug, Clone)]
pub struct ActionClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for ActionClassifier {
    fn default() -> Self {
        Self::standard()
    }
}

impl ActionClassifier {
    /// Classifier with a custom rule list, evaluated in order.
    #[must_use]
    pub fn with_rules(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// The default rule set.
    #[must_use]
    pub fn standard() -> Self {
        let specs: [(&str, ActionKind, bool, &[&str]); 8] = [
            ("planning", ActionKind::Planning, true, PLANNING_PATTERNS),
            (
                "architecture",
                ActionKind::Architecture,
                true,
                ARCHITECTURE_PATTERNS,
            ),
            ("git-push", ActionKind::GitPush, true, GIT_PUSH_PATTERNS),
            ("large-edit", ActionKind::LargeEdit, true, LARGE_EDIT_PATTERNS),
            ("test-run", ActionKind::TestRun, false, TEST_RUN_PATTERNS),
            (
                "format-lint",
                ActionKind::FormatLint,
                false,
                FORMAT_LINT_PATTERNS,
            ),
            ("git-local", ActionKind::GitLocal, false, GIT_LOCAL_PATTERNS),
            (
                "package-install",
                ActionKind::PackageInstall,
                false,
                PACKAGE_INSTALL_PATTERNS,
            ),
        ];

        let rules = specs
            .into_iter()
            .filter_map(|(name, kind, requires_approval, patterns)| {
                ClassificationRule::new(name, kind, requires_approval, patterns)
                    .map_err(|e| tracing::error!("Invalid built-in pattern in {}: {}", name, e))
                    .ok()
            })
            .collect();

        Self { rules }
    }

    /// The default rule set with `extra` rules checked first.
    ///
    /// # Errors
    ///
    /// Returns the first pattern that fails to compile.
    pub fn standard_with(extra: &[RuleConfig]) -> Result<Self, regex::Error> {
        let mut rules = extra
            .iter()
            .map(RuleConfig::compile)
            .collect::<Result<Vec<_>, _>>()?;
        rules.extend(Self::standard().rules);
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classify an agent response for a task.
    ///
    /// The task's title and description are matched together with the
    /// response.
    ///
    /// # Example
    ///
    /// ```
    /// use foreman::classifier::{ActionClassifier, ActionKind};
    /// use foreman::task::Task;
    ///
    /// let classifier = ActionClassifier::standard();
    /// let task = Task::new("t1", "Fix off-by-one");
    /// let verdict = classifier.classify("Fixed it and ran git push origin main", &task);
    /// assert_eq!(verdict.kind, ActionKind::GitPush);
    /// assert!(verdict.requires_approval);
    /// ```
    #[must_use]
    pub fn classify(&self, response: &str, task: &Task) -> Classification {
        let text = format!("{}\n{}\n{}", task.title, task.description, response);
        self.classify_text(&text)
    }

    /// Classify free text.
    #[must_use]
    pub fn classify_text(&self, text: &str) -> Classification {
        for rule in &self.rules {
            if let Some(fragment) = rule.find(text) {
                return Classification {
                    kind: rule.kind,
                    requires_approval: rule.requires_approval,
                    rule: Some(rule.name.clone()),
                    matched: Some(fragment.to_string()),
                    description: format!("{} (matched \"{}\")", rule.kind, fragment),
                };
            }
        }

        Classification {
            kind: ActionKind::Edit,
            requires_approval: false,
            rule: None,
            matched: None,
            description: ActionKind::Edit.description().to_string(),
        }
    }
}
