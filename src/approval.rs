//! Human-in-the-loop approval gate.
//!
//! When the classifier flags an agent action as risky, the controller opens an
//! [`ApprovalRequest`] and stops selecting new work until the request is
//! resolved. Resolution happens in one of three ways:
//!
//! - an operator approves or rejects it,
//! - the request expires (`timed_out`),
//! - an [`AutoApprovalRules`] policy approves it after it has waited long
//!   enough.
//!
//! Terminal requests leave the live queue immediately; every request ends in
//! exactly one of `approved`, `rejected` or `timed_out`.
//!
//! The queue itself is plain data. The controller decides what resolution
//! means for the task and the controller status.

use crate::classifier::Classification;
use crate::error::{ForemanError, Result};
use crate::task::Task;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

/// Default lifetime of a pending request.
pub const DEFAULT_APPROVAL_EXPIRY_MINUTES: i64 = 30;

// ============================================================================
// Types
// ============================================================================

/// Category of risky action awaiting approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalActionType {
    Planning,
    Architecture,
    GitPush,
    LargeEdit,
}

impl fmt::Display for ApprovalActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalActionType::Planning => write!(f, "planning"),
            ApprovalActionType::Architecture => write!(f, "architecture"),
            ApprovalActionType::GitPush => write!(f, "git_push"),
            ApprovalActionType::LargeEdit => write!(f, "large_edit"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Rejected => write!(f, "rejected"),
            ApprovalStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// One action pending human sign-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub task_id: String,
    pub task_title: String,
    pub action_type: ApprovalActionType,
    pub description: String,
    /// Raw agent output that triggered the request.
    pub details: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution_note: Option<String>,
}

impl ApprovalRequest {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// How long the request has been waiting.
    #[must_use]
    pub fn pending_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

/// Policy for resolving requests without a human.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoApprovalRules {
    pub enabled: bool,
    pub allowed_action_types: Vec<ApprovalActionType>,
    /// Auto-approve after this many minutes pending. 0 disables.
    pub max_pending_time_minutes: u32,
    /// `git_push` always needs a human, whatever the allow-list says.
    pub require_confirmation_for_git_push: bool,
}

impl Default for AutoApprovalRules {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_action_types: Vec::new(),
            max_pending_time_minutes: 0,
            require_confirmation_for_git_push: true,
        }
    }
}

impl AutoApprovalRules {
    /// Whether `action_type` may ever be auto-approved.
    #[must_use]
    pub fn allows(&self, action_type: ApprovalActionType) -> bool {
        if action_type == ApprovalActionType::GitPush && self.require_confirmation_for_git_push {
            return false;
        }
        self.allowed_action_types.contains(&action_type)
    }

    /// Whether `request` should be auto-approved at `now`.
    #[must_use]
    pub fn should_auto_approve(&self, request: &ApprovalRequest, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.max_pending_time_minutes > 0
            && request.pending_for(now) > Duration::minutes(i64::from(self.max_pending_time_minutes))
            && self.allows(request.action_type)
    }
}

/// What a timeout sweep decided for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction {
    Expire(String),
    AutoApprove(String),
}

// ============================================================================
// Queue
// ============================================================================

/// Live collection of pending approval requests, in creation order.
#[derive(Debug, Clone)]
pub struct ApprovalQueue {
    pending: Vec<ApprovalRequest>,
    expiry: Duration,
}

impl Default for ApprovalQueue {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_EXPIRY_MINUTES)
    }
}

impl ApprovalQueue {
    #[must_use]
    pub fn new(expiry_minutes: i64) -> Self {
        Self {
            pending: Vec::new(),
            expiry: Duration::minutes(expiry_minutes),
        }
    }

    /// Open a request for an action on `task`.
    ///
    /// Returns `None` if the classification does not require approval.
    pub fn create(
        &mut self,
        task: &Task,
        classification: &Classification,
        details: &str,
        now: DateTime<Utc>,
    ) -> Option<ApprovalRequest> {
        let action_type = classification.approval_type()?;
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            task_title: task.title.clone(),
            action_type,
            description: classification.description.clone(),
            details: details.to_string(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + self.expiry,
            resolved_at: None,
            resolution_note: None,
        };
        info!(
            "Approval requested for task {} ({}): {}",
            task.id, action_type, request.id
        );
        self.pending.push(request.clone());
        Some(request)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ApprovalRequest> {
        self.pending.iter().find(|r| r.id == id)
    }

    #[must_use]
    pub fn pending(&self) -> &[ApprovalRequest] {
        &self.pending
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Move a request into a terminal status and remove it from the queue.
    ///
    /// # Errors
    ///
    /// Returns `ApprovalNotFound` for unknown or already-resolved ids.
    pub fn resolve(
        &mut self,
        id: &str,
        status: ApprovalStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest> {
        let index = self
            .pending
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| ForemanError::ApprovalNotFound { id: id.to_string() })?;

        let mut request = self.pending.remove(index);
        request.status = status;
        request.resolved_at = Some(now);
        request.resolution_note = note;
        info!(
            "Approval {} for task {} {}",
            request.id, request.task_id, request.status
        );
        Ok(request)
    }

    /// Decide expiry and auto-approval for every pending request.
    ///
    /// Expiry wins over auto-approval. Nothing is mutated; the caller applies
    /// the actions.
    #[must_use]
    pub fn plan_timeouts(&self, rules: &AutoApprovalRules, now: DateTime<Utc>) -> Vec<TimeoutAction> {
        self.pending
            .iter()
            .filter_map(|request| {
                if request.is_expired(now) {
                    Some(TimeoutAction::Expire(request.id.clone()))
                } else if rules.should_auto_approve(request, now) {
                    Some(TimeoutAction::AutoApprove(request.id.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Discard every pending request, returning them.
    pub fn drain(&mut self) -> Vec<ApprovalRequest> {
        if !self.pending.is_empty() {
            debug!("Discarding {} pending approval(s)", self.pending.len());
        }
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ActionClassifier;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn classify(text: &str) -> Classification {
        ActionClassifier::standard().classify_text(text)
    }

    fn queue_with(text: &str, at: DateTime<Utc>) -> (ApprovalQueue, ApprovalRequest) {
        let mut queue = ApprovalQueue::default();
        let task = Task::new("t1", "Ship it");
        let request = queue.create(&task, &classify(text), text, at).unwrap();
        (queue, request)
    }

    #[test]
    fn test_create_sets_expiry() {
        let (queue, request) = queue_with("git push origin main", now());
        assert_eq!(request.action_type, ApprovalActionType::GitPush);
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert_eq!(request.expires_at, now() + Duration::minutes(30));
        assert_eq!(request.task_title, "Ship it");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_create_skips_safe_actions() {
        let mut queue = ApprovalQueue::default();
        let task = Task::new("t1", "Fix bug");
        assert!(queue
            .create(&task, &classify("Ran cargo test"), "", now())
            .is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_resolve_removes_and_stamps() {
        let (mut queue, request) = queue_with("refactor the parser", now());
        let resolved = queue
            .resolve(
                &request.id,
                ApprovalStatus::Rejected,
                Some("too big".into()),
                now(),
            )
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Rejected);
        assert_eq!(resolved.resolution_note.as_deref(), Some("too big"));
        assert_eq!(resolved.resolved_at, Some(now()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_resolve_unknown_or_twice_is_not_found() {
        let (mut queue, request) = queue_with("refactor", now());
        assert!(matches!(
            queue.resolve("nope", ApprovalStatus::Approved, None, now()),
            Err(ForemanError::ApprovalNotFound { .. })
        ));
        queue
            .resolve(&request.id, ApprovalStatus::Approved, None, now())
            .unwrap();
        assert!(matches!(
            queue.resolve(&request.id, ApprovalStatus::Approved, None, now()),
            Err(ForemanError::ApprovalNotFound { .. })
        ));
    }

    #[test]
    fn test_sweep_expires_past_deadline() {
        // Created 30m1s ago, so expires_at = now - 1s
        let created = now() - Duration::minutes(30) - Duration::seconds(1);
        let (mut queue, request) = queue_with("git push", created);
        assert_eq!(request.expires_at, now() - Duration::seconds(1));

        let actions = queue.plan_timeouts(&AutoApprovalRules::default(), now());
        assert_eq!(actions, vec![TimeoutAction::Expire(request.id.clone())]);

        let expired = queue
            .resolve(&request.id, ApprovalStatus::TimedOut, None, now())
            .unwrap();
        assert_eq!(expired.status, ApprovalStatus::TimedOut);
        assert!(queue.get(&request.id).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_not_expired_at_deadline() {
        let (queue, request) = queue_with("git push", now() - Duration::minutes(30));
        assert_eq!(request.expires_at, now());
        assert!(queue
            .plan_timeouts(&AutoApprovalRules::default(), now())
            .is_empty());
    }

    fn permissive_rules() -> AutoApprovalRules {
        AutoApprovalRules {
            enabled: true,
            allowed_action_types: vec![
                ApprovalActionType::LargeEdit,
                ApprovalActionType::GitPush,
            ],
            max_pending_time_minutes: 5,
            require_confirmation_for_git_push: true,
        }
    }

    #[test]
    fn test_auto_approve_after_pending_time() {
        let (queue, request) = queue_with("refactor", now() - Duration::minutes(6));
        assert_eq!(
            queue.plan_timeouts(&permissive_rules(), now()),
            vec![TimeoutAction::AutoApprove(request.id)]
        );
    }

    #[test]
    fn test_auto_approve_requires_elapsed_time() {
        let (queue, _) = queue_with("refactor", now() - Duration::minutes(5));
        assert!(queue.plan_timeouts(&permissive_rules(), now()).is_empty());
    }

    #[test]
    fn test_git_push_override() {
        let (queue, _) = queue_with("git push", now() - Duration::minutes(10));
        assert!(queue.plan_timeouts(&permissive_rules(), now()).is_empty());

        let mut rules = permissive_rules();
        rules.require_confirmation_for_git_push = false;
        assert_eq!(queue.plan_timeouts(&rules, now()).len(), 1);
    }

    #[test]
    fn test_auto_approval_disabled_paths() {
        let (queue, _) = queue_with("refactor", now() - Duration::minutes(10));

        let mut rules = permissive_rules();
        rules.enabled = false;
        assert!(queue.plan_timeouts(&rules, now()).is_empty());

        let mut rules = permissive_rules();
        rules.max_pending_time_minutes = 0;
        assert!(queue.plan_timeouts(&rules, now()).is_empty());

        let mut rules = permissive_rules();
        rules.allowed_action_types = vec![ApprovalActionType::Planning];
        assert!(queue.plan_timeouts(&rules, now()).is_empty());
    }

    #[test]
    fn test_drain() {
        let (mut queue, _) = queue_with("refactor", now());
        queue.create(
            &Task::new("t2", "Other"),
            &classify("git push"),
            "",
            now(),
        );
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].task_id, "t2");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rules_serde_defaults() {
        let rules: AutoApprovalRules =
            serde_json::from_str(r#"{"enabled": true, "allowedActionTypes": ["large_edit"]}"#)
                .unwrap();
        assert!(rules.enabled);
        assert!(rules.require_confirmation_for_git_push);
        assert_eq!(rules.max_pending_time_minutes, 0);
        assert!(rules.allows(ApprovalActionType::LargeEdit));
        assert!(!rules.allows(ApprovalActionType::Planning));
    }
}
