//! Merging pushed snapshots into client-visible state.
//!
//! The [`Reconciler`] is the only owner of the visible [`Project`] and of the
//! pending action set. Every change to either goes through one of its
//! methods, and each method runs to completion without suspending, so two
//! passes can never interleave.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::*;
use crate::pending::{Action, ActionId, Outcome, PendingAction, Progress, Retired, UnknownReason};
use crate::snapshot::{parse_project, RawSnapshot, SnapshotError};

/// Default age after which an action without a visible result is given up on.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// Whether the visible project differs from the one before the pass.
    pub changed: bool,
    /// Actions that left the pending set during the pass.
    pub retired: Vec<Retired>,
}

impl Reconciliation {
    /// Whether anything the view renders moved during the pass.
    pub fn is_noop(&self) -> bool {
        !self.changed && self.retired.is_empty()
    }
}

/// Owner of the authoritative project tree and the in-flight actions.
#[derive(Debug, Clone)]
pub struct Reconciler {
    project: Project,
    pending: Vec<PendingAction>,
    stale_after: Duration,
    snapshots_applied: u64,
}

impl Reconciler {
    pub fn new(project_id: ProjectId, stale_after: Duration) -> Self {
        Self {
            project: Project::empty(project_id),
            pending: Vec::new(),
            stale_after,
            snapshots_applied: 0,
        }
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// In-flight actions, oldest first.
    pub fn pending(&self) -> &[PendingAction] {
        &self.pending
    }

    /// Whether at least one snapshot has been applied.
    pub fn is_loaded(&self) -> bool {
        self.snapshots_applied > 0
    }

    pub fn snapshots_applied(&self) -> u64 {
        self.snapshots_applied
    }

    /// Record `action` as in flight before its request resolves.
    ///
    /// The result baseline is taken from the currently visible project, so
    /// the action only retires once something new appears on its target.
    pub fn register(&mut self, action: Action, now: DateTime<Utc>) -> ActionId {
        let index = ProjectIndex::new(&self.project);
        let pending = PendingAction::register(action, &index, now);
        let id = pending.id;

        let visible = pending.target == self.project.id
            || index.haiku(&pending.target).is_some()
            || index.image_prompt(&pending.target).is_some();
        if !self.is_loaded() {
            tracing::debug!(
                "Registered {} {} on {} before the first snapshot",
                pending.kind,
                id,
                pending.target
            );
        } else if !visible {
            tracing::warn!(
                "Registering {} {} on {} which is not in the visible project",
                pending.kind,
                id,
                pending.target
            );
        } else {
            tracing::debug!("Registered {} {} on {}", pending.kind, id, pending.target);
        }

        self.pending.push(pending);
        id
    }

    /// Parse and apply a pushed snapshot.
    ///
    /// A malformed snapshot leaves the project and the pending set exactly
    /// as they were.
    pub fn apply(
        &mut self,
        raw: &RawSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation, SnapshotError> {
        match parse_project(&self.project.id, &raw.payload) {
            Ok(next) => Ok(self.apply_project(next, now)),
            Err(e) => {
                tracing::error!(
                    "Skipping snapshot for project {}: {}",
                    self.project.id,
                    e
                );
                Err(e)
            }
        }
    }

    /// Replace the visible project with `next` and retire what it resolves.
    ///
    /// Actions registered before the first snapshot get their baseline from
    /// that snapshot and cannot complete in the same pass.
    pub fn apply_project(&mut self, next: Project, now: DateTime<Utc>) -> Reconciliation {
        let first = !self.is_loaded();
        let changed = self.project != next;
        self.project = next;
        self.snapshots_applied += 1;

        let index = ProjectIndex::new(&self.project);
        if first {
            for action in &mut self.pending {
                tracing::debug!("Rebasing {} {} on the first snapshot", action.kind, action.id);
                action.rebase(&index);
            }
        }
        let mut retired = retire_where(&mut self.pending, now, |action| {
            match action.progress(&index) {
                Progress::Done if first => None,
                Progress::Done => Some(Outcome::Completed),
                Progress::TargetRemoved => Some(Outcome::Unknown {
                    reason: UnknownReason::TargetRemoved,
                }),
                Progress::Waiting => None,
            }
        });
        retired.extend(self.expire(now));

        for r in &retired {
            tracing::debug!("Retired {} {}: {:?}", r.action.kind, r.action.id, r.outcome);
        }

        Reconciliation { changed, retired }
    }

    /// Retire `id` after its request failed. Returns `None` if the action
    /// already left the pending set.
    pub fn fail(
        &mut self,
        id: ActionId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<Retired> {
        let position = self.pending.iter().position(|a| a.id == id)?;
        let action = self.pending.remove(position);
        let reason = reason.into();
        tracing::warn!("{} {} failed: {}", action.kind, action.id, reason);
        Some(Retired {
            action,
            outcome: Outcome::Failed { reason },
            retired_at: now,
        })
    }

    /// Retire every action older than the stale timeout.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Retired> {
        let stale_after = self.stale_after;
        let expired = retire_where(&mut self.pending, now, |action| {
            action.is_stale(now, stale_after).then_some(Outcome::Unknown {
                reason: UnknownReason::Stale,
            })
        });
        for r in &expired {
            tracing::info!(
                "{} {} on {} went stale after {:?}",
                r.action.kind,
                r.action.id,
                r.action.target,
                stale_after
            );
        }
        expired
    }
}

fn retire_where<F>(
    pending: &mut Vec<PendingAction>,
    now: DateTime<Utc>,
    mut decide: F,
) -> Vec<Retired>
where
    F: FnMut(&PendingAction) -> Option<Outcome>,
{
    let mut retired = Vec::new();
    let mut kept = Vec::with_capacity(pending.len());
    for action in pending.drain(..) {
        match decide(&action) {
            Some(outcome) => retired.push(Retired {
                action,
                outcome,
                retired_at: now,
            }),
            None => kept.push(action),
        }
    }
    *pending = kept;
    retired
}
