use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hivemind_core::config::ApprovalConfig;
use hivemind_core::error::{HivemindError, Result};
use hivemind_core::event::EventHub;
use hivemind_core::frame::{ControlFrame, ControlType};
use hivemind_core::types::{ApprovalStatus, ExecutionId};

/// Resolved requests older than this are dropped on the next insert.
const RESOLVED_RETENTION: Duration = Duration::from_secs(3600);

/// A gated tool call waiting for (or past) a human decision.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub execution_id: ExecutionId,
    pub agent_id: String,
    pub tool: String,
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    /// Replacement parameters supplied by the approver.
    pub resolved_parameters: Option<serde_json::Value>,
}

/// What the calling path learns once its request is settled.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    /// `None` when the tool is not gated.
    pub approval_id: Option<String>,
    pub status: ApprovalStatus,
    /// Parameters to run the tool with, possibly modified by the approver.
    pub parameters: serde_json::Value,
    pub reason: Option<String>,
}

impl ApprovalOutcome {
    pub fn approved(&self) -> bool {
        self.status.is_approved()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(ApprovalStatus),
    /// The request had already reached this terminal status.
    AlreadyResolved(ApprovalStatus),
    NotFound,
}

struct Entry {
    request: ApprovalRequest,
    fingerprint: String,
    created: Instant,
    resolved: Option<Instant>,
    tx: watch::Sender<ApprovalStatus>,
}

/// Suspends sensitive tool calls until an external actor decides.
///
/// Waiters hold a watch receiver keyed by approval id; there is no polling.
/// Each request makes exactly one terminal transition and the first one wins.
pub struct ApprovalGate {
    config: ApprovalConfig,
    sensitive: HashSet<String>,
    entries: Mutex<HashMap<String, Entry>>,
    hub: Option<Arc<EventHub>>,
}

impl ApprovalGate {
    pub fn new(config: ApprovalConfig) -> Self {
        let sensitive = config.sensitive_tools.iter().cloned().collect();
        Self {
            config,
            sensitive,
            entries: Mutex::new(HashMap::new()),
            hub: None,
        }
    }

    /// Publish `approval_requested` / `approval_resolved` frames to `hub`.
    pub fn with_hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn is_sensitive(&self, tool: &str) -> bool {
        self.sensitive.contains(tool)
    }

    /// Ask for permission to run `tool`, suspending until a decision or
    /// the approval timeout. Non-sensitive tools are approved immediately.
    pub async fn request_approval(
        &self,
        execution_id: &ExecutionId,
        agent_id: &str,
        tool: &str,
        parameters: serde_json::Value,
    ) -> Result<ApprovalOutcome> {
        if !self.is_sensitive(tool) {
            return Ok(ApprovalOutcome {
                approval_id: None,
                status: ApprovalStatus::Approved,
                parameters,
                reason: None,
            });
        }
        let id = self
            .create_approval(execution_id, agent_id, tool, parameters)
            .await;
        self.wait(&id).await
    }

    /// Register a request without waiting for it. Identical requests inside
    /// the dedupe window return the existing id.
    pub async fn create_approval(
        &self,
        execution_id: &ExecutionId,
        agent_id: &str,
        tool: &str,
        parameters: serde_json::Value,
    ) -> String {
        let fingerprint = fingerprint(execution_id, agent_id, tool, &parameters);
        let window = Duration::from_secs(self.config.dedupe_window_secs);

        let request = {
            let mut entries = self.entries.lock().await;
            entries.retain(|_, e| e.resolved.map_or(true, |at| at.elapsed() < RESOLVED_RETENTION));

            if let Some(existing) = entries
                .values()
                .filter(|e| e.fingerprint == fingerprint && e.created.elapsed() < window)
                .max_by_key(|e| e.created)
            {
                debug!(approval_id = %existing.request.id, tool, "Deduplicated approval request");
                return existing.request.id.clone();
            }

            let request = ApprovalRequest {
                id: Uuid::new_v4().to_string(),
                execution_id: execution_id.clone(),
                agent_id: agent_id.to_string(),
                tool: tool.to_string(),
                parameters,
                created_at: Utc::now(),
                status: ApprovalStatus::Pending,
                resolved_at: None,
                reason: None,
                resolved_parameters: None,
            };
            let (tx, _rx) = watch::channel(ApprovalStatus::Pending);
            entries.insert(
                request.id.clone(),
                Entry {
                    request: request.clone(),
                    fingerprint,
                    created: Instant::now(),
                    resolved: None,
                    tx,
                },
            );
            request
        };

        info!(
            approval_id = %request.id,
            execution_id = %execution_id,
            agent_id,
            tool,
            "Approval requested"
        );
        self.announce(
            ControlFrame::new(request.execution_id.clone(), ControlType::ApprovalRequested)
                .with_agent(&request.agent_id)
                .with_payload(serde_json::json!({
                    "approval_id": request.id,
                    "tool": request.tool,
                    "parameters": request.parameters,
                })),
        )
        .await;
        request.id
    }

    /// Wait until request `id` is terminal, timing it out if the approval
    /// window (measured from creation) runs out first.
    pub async fn wait(&self, id: &str) -> Result<ApprovalOutcome> {
        let (mut rx, created) = {
            let entries = self.entries.lock().await;
            let entry = entries
                .get(id)
                .ok_or_else(|| HivemindError::ApprovalNotFound(id.to_string()))?;
            (entry.tx.subscribe(), entry.created)
        };

        let budget = Duration::from_secs(self.config.timeout_secs);
        let remaining = budget.saturating_sub(created.elapsed());
        let timed_out = tokio::time::timeout(remaining, rx.wait_for(|s| s.is_terminal()))
            .await
            .is_err();
        if timed_out {
            self.finalize(id, ApprovalStatus::TimedOut, None, Some("approval timed out".into()))
                .await;
        }

        let entries = self.entries.lock().await;
        let entry = entries
            .get(id)
            .ok_or_else(|| HivemindError::ApprovalNotFound(id.to_string()))?;
        let request = &entry.request;
        let parameters = match (&request.resolved_parameters, request.status) {
            (Some(modified), ApprovalStatus::Approved) => modified.clone(),
            _ => request.parameters.clone(),
        };
        Ok(ApprovalOutcome {
            approval_id: Some(request.id.clone()),
            status: request.status,
            parameters,
            reason: request.reason.clone(),
        })
    }

    /// Approve or reject a request, optionally replacing its parameters.
    pub async fn resolve(
        &self,
        id: &str,
        approved: bool,
        modified_parameters: Option<serde_json::Value>,
        reason: Option<String>,
    ) -> ResolveOutcome {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        self.finalize(id, status, modified_parameters, reason).await
    }

    /// Boundary form of [`resolve`](Self::resolve): true only for the call
    /// that actually settled the request.
    pub async fn resolve_approval(
        &self,
        id: &str,
        approved: bool,
        modified_parameters: Option<serde_json::Value>,
        reason: Option<String>,
    ) -> bool {
        matches!(
            self.resolve(id, approved, modified_parameters, reason).await,
            ResolveOutcome::Resolved(_)
        )
    }

    pub async fn cancel(&self, id: &str) -> ResolveOutcome {
        self.finalize(id, ApprovalStatus::Cancelled, None, Some("cancelled".into()))
            .await
    }

    /// Cancel every pending request of an execution. Returns how many.
    pub async fn cancel_execution(&self, execution_id: &ExecutionId) -> usize {
        let ids: Vec<String> = self
            .list_pending(Some(execution_id))
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if let ResolveOutcome::Resolved(_) = self.cancel(&id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Pending requests, oldest first.
    pub async fn list_pending(&self, execution_id: Option<&ExecutionId>) -> Vec<ApprovalRequest> {
        let entries = self.entries.lock().await;
        let mut pending: Vec<ApprovalRequest> = entries
            .values()
            .map(|e| &e.request)
            .filter(|r| r.status == ApprovalStatus::Pending)
            .filter(|r| execution_id.map_or(true, |id| &r.execution_id == id))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    pub async fn get(&self, id: &str) -> Option<ApprovalRequest> {
        self.entries.lock().await.get(id).map(|e| e.request.clone())
    }

    async fn finalize(
        &self,
        id: &str,
        status: ApprovalStatus,
        modified_parameters: Option<serde_json::Value>,
        reason: Option<String>,
    ) -> ResolveOutcome {
        let frame = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(id) else {
                return ResolveOutcome::NotFound;
            };
            if entry.request.status.is_terminal() {
                return ResolveOutcome::AlreadyResolved(entry.request.status);
            }

            entry.request.status = status;
            entry.request.resolved_at = Some(Utc::now());
            entry.request.reason = reason;
            entry.request.resolved_parameters = modified_parameters;
            entry.resolved = Some(Instant::now());
            entry.tx.send_replace(status);

            ControlFrame::new(entry.request.execution_id.clone(), ControlType::ApprovalResolved)
                .with_agent(&entry.request.agent_id)
                .with_payload(serde_json::json!({
                    "approval_id": id,
                    "tool": entry.request.tool,
                    "status": status,
                    "reason": entry.request.reason,
                }))
        };

        info!(approval_id = %id, status = %status, "Approval resolved");
        self.announce(frame).await;
        ResolveOutcome::Resolved(status)
    }

    async fn announce(&self, frame: ControlFrame) {
        if let Some(ref hub) = self.hub {
            if let Err(e) = hub.publish_control(frame).await {
                warn!(error = %e, "Dropped approval frame");
            }
        }
    }
}

fn fingerprint(
    execution_id: &ExecutionId,
    agent_id: &str,
    tool: &str,
    parameters: &serde_json::Value,
) -> String {
    // serde_json maps are ordered, so equal parameters serialize equally.
    format!("{}\u{1f}{}\u{1f}{}\u{1f}{}", execution_id, agent_id, tool, parameters)
}
