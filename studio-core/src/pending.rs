//! Actions that are in flight on the server.
//!
//! A [`PendingAction`] is registered the moment the user triggers a job, before
//! the request has even left the client. It is retired when a later snapshot
//! shows the job's result, when the request fails, or when it goes stale.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::*;

/// A job the user asks the server to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    CreateHaiku {
        description: String,
    },
    RequestPrompts {
        haiku_id: EntityId,
        /// Free-text guidance for the prompt generator.
        #[serde(default)]
        directions: Option<String>,
    },
    GenerateImage {
        prompt_id: EntityId,
        haiku_id: EntityId,
    },
    Critique {
        haiku_id: EntityId,
    },
    EditPrompt {
        prompt_id: EntityId,
        text: String,
    },
}

/// The kind of an [`Action`], without its parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateHaiku,
    RequestPrompts,
    GenerateImage,
    Critique,
    EditPrompt,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateHaiku => "create_haiku",
            Self::RequestPrompts => "request_prompts",
            Self::GenerateImage => "generate_image",
            Self::Critique => "critique",
            Self::EditPrompt => "edit_prompt",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::CreateHaiku { .. } => ActionKind::CreateHaiku,
            Self::RequestPrompts { .. } => ActionKind::RequestPrompts,
            Self::GenerateImage { .. } => ActionKind::GenerateImage,
            Self::Critique { .. } => ActionKind::Critique,
            Self::EditPrompt { .. } => ActionKind::EditPrompt,
        }
    }

    /// The entity whose progress indicator this action drives. Creating a
    /// haiku targets the project itself.
    pub fn target(&self, project: &ProjectId) -> EntityId {
        match self {
            Self::CreateHaiku { .. } => project.clone(),
            Self::RequestPrompts { haiku_id, .. } | Self::Critique { haiku_id } => {
                haiku_id.clone()
            }
            Self::GenerateImage { prompt_id, .. } | Self::EditPrompt { prompt_id, .. } => {
                prompt_id.clone()
            }
        }
    }
}

/// Client-side identity of one submitted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(Uuid);

impl ActionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the target has to look like for the action to count as done.
///
/// Captured from the visible project when the action is registered, so a
/// result is recognised by the appearance of a new identity rather than by
/// position or by counting list entries that may be reordered.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Expectation {
    NewHaiku { known: HashSet<EntityId> },
    NewPrompt { known: HashSet<EntityId> },
    NewImage { known: HashSet<EntityId> },
    MoreCritiques { seen: usize },
    PromptText { text: String },
}

impl Expectation {
    fn capture(action: &Action, index: &ProjectIndex<'_>) -> Self {
        match action {
            Action::CreateHaiku { .. } => Self::NewHaiku {
                known: index.project().haikus.iter().map(|h| h.id.clone()).collect(),
            },
            Action::RequestPrompts { haiku_id, .. } => Self::NewPrompt {
                known: index
                    .haiku(haiku_id)
                    .map(|h| h.image_prompts.iter().map(|p| p.id.clone()).collect())
                    .unwrap_or_default(),
            },
            Action::GenerateImage { prompt_id, .. } => Self::NewImage {
                known: index
                    .image_prompt(prompt_id)
                    .map(|p| p.images.iter().map(|i| i.id.clone()).collect())
                    .unwrap_or_default(),
            },
            Action::Critique { haiku_id } => Self::MoreCritiques {
                seen: index.haiku(haiku_id).map_or(0, |h| h.critiques.len()),
            },
            Action::EditPrompt { text, .. } => Self::PromptText { text: text.clone() },
        }
    }
}

/// Result of checking a pending action against one version of the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Waiting,
    Done,
    TargetRemoved,
}

/// An action the server accepted, or may still accept, whose result has not
/// shown up in a snapshot yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    pub id: ActionId,
    pub target: EntityId,
    pub kind: ActionKind,
    pub action: Action,
    pub submitted_at: DateTime<Utc>,
    expectation: Expectation,
}

impl PendingAction {
    pub(crate) fn register(
        action: Action,
        index: &ProjectIndex<'_>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        let project = index.project();
        let target = action.target(&project.id);

        let expectation = Expectation::capture(&action, index);

        Self {
            id: ActionId::new(),
            target,
            kind: action.kind(),
            action,
            submitted_at,
            expectation,
        }
    }

    /// Take the baseline again from `index`.
    ///
    /// Used for actions registered before any snapshot was seen, whose
    /// baseline is otherwise the empty project.
    pub(crate) fn rebase(&mut self, index: &ProjectIndex<'_>) {
        self.expectation = Expectation::capture(&self.action, index);
    }

    /// Whether `now` is past this action's stale deadline.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: std::time::Duration) -> bool {
        match (now - self.submitted_at).to_std() {
            Ok(age) => age >= stale_after,
            // Submitted "in the future" relative to `now`
            Err(_) => false,
        }
    }

    pub(crate) fn progress(&self, index: &ProjectIndex<'_>) -> Progress {
        let done = match &self.expectation {
            Expectation::NewHaiku { known } => {
                index.project().haikus.iter().any(|h| !known.contains(&h.id))
            }
            Expectation::NewPrompt { known } => match index.haiku(&self.target) {
                Some(haiku) => haiku.image_prompts.iter().any(|p| !known.contains(&p.id)),
                None => return Progress::TargetRemoved,
            },
            Expectation::NewImage { known } => match index.image_prompt(&self.target) {
                Some(prompt) => prompt.images.iter().any(|i| !known.contains(&i.id)),
                None => return Progress::TargetRemoved,
            },
            Expectation::MoreCritiques { seen } => match index.haiku(&self.target) {
                Some(haiku) => haiku.critiques.len() > *seen,
                None => return Progress::TargetRemoved,
            },
            Expectation::PromptText { text } => match index.image_prompt(&self.target) {
                Some(prompt) => &prompt.text == text,
                None => return Progress::TargetRemoved,
            },
        };

        if done {
            Progress::Done
        } else {
            Progress::Waiting
        }
    }
}

/// Why an action left the pending set without a known result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReason {
    /// No matching result arrived before the stale-action timeout.
    Stale,
    /// The target entity disappeared from the project.
    TargetRemoved,
}

impl UnknownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::TargetRemoved => "target_removed",
        }
    }
}

/// How a pending action was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A snapshot showed the expected result.
    Completed,
    /// The request was rejected or never reached the server.
    Failed { reason: String },
    /// The result never showed up; the job may or may not have run.
    Unknown { reason: UnknownReason },
}

/// A pending action together with how it was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retired {
    pub action: PendingAction,
    pub outcome: Outcome,
    pub retired_at: DateTime<Utc>,
}
