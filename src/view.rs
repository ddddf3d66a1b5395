//! What the view layer receives from a project session.
//!
//! A renderer gets a read-only [`ViewState`] after every reconciliation pass
//! and a [`Notice`] whenever an action leaves the pending set. Pending
//! actions on an entity are the only signal for progress indicators.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use studio_core::{
    EntityId, HaikuOrder, Outcome, PendingAction, Project, ProjectId, Retired, UnknownReason,
};

use crate::channel::ChannelStatus;

const PENDING: char = '⏳';

/// One published version of the client-visible state.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub project: Arc<Project>,
    pub pending: Arc<[PendingAction]>,
    pub status: ChannelStatus,
    /// Whether any snapshot has been applied yet.
    pub loaded: bool,
    /// Increases with every publication.
    pub revision: u64,
}

impl ViewState {
    /// State shown before the first snapshot arrives.
    pub fn initial(project_id: ProjectId) -> Self {
        Self {
            project: Arc::new(Project::empty(project_id)),
            pending: Arc::from(Vec::new()),
            status: ChannelStatus::Connecting,
            loaded: false,
            revision: 0,
        }
    }

    pub fn is_pending(&self, entity: &EntityId) -> bool {
        self.pending.iter().any(|a| &a.target == entity)
    }

    pub fn pending_for<'a>(
        &'a self,
        entity: &'a EntityId,
    ) -> impl Iterator<Item = &'a PendingAction> + 'a {
        self.pending.iter().filter(move |a| &a.target == entity)
    }
}

/// Resolution of an action, reported once per action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Completed {
        action: PendingAction,
    },
    Failed {
        action: PendingAction,
        reason: String,
    },
    /// Neither success nor failure; the job may still have run.
    OutcomeUnknown {
        action: PendingAction,
        reason: UnknownReason,
    },
}

impl Notice {
    pub fn action(&self) -> &PendingAction {
        match self {
            Self::Completed { action }
            | Self::Failed { action, .. }
            | Self::OutcomeUnknown { action, .. } => action,
        }
    }
}

impl From<Retired> for Notice {
    fn from(retired: Retired) -> Self {
        let action = retired.action;
        match retired.outcome {
            Outcome::Completed => Self::Completed { action },
            Outcome::Failed { reason } => Self::Failed { action, reason },
            Outcome::Unknown { reason } => Self::OutcomeUnknown { action, reason },
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = self.action();
        match self {
            Self::Completed { .. } => {
                write!(f, "{} on {} completed", action.kind, action.target)
            }
            Self::Failed { reason, .. } => {
                write!(f, "{} on {} failed: {}", action.kind, action.target, reason)
            }
            Self::OutcomeUnknown { reason, .. } => write!(
                f,
                "{} on {} has an unknown outcome ({})",
                action.kind,
                action.target,
                reason.as_str()
            ),
        }
    }
}

/// Receives published state. Implemented by whatever draws the project.
pub trait ViewProjection {
    fn render(&mut self, state: &ViewState);

    fn notify(&mut self, _notice: &Notice) {}
}

/// Plain-text renderer writing the project tree to `W`.
pub struct TextView<W> {
    out: W,
}

impl<W: Write> TextView<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ViewProjection for TextView<W> {
    fn render(&mut self, state: &ViewState) {
        if let Err(e) = write!(self.out, "{}", render_tree(state)).and_then(|_| self.out.flush()) {
            tracing::warn!("Failed to write view: {}", e);
        }
    }

    fn notify(&mut self, notice: &Notice) {
        if let Err(e) = writeln!(self.out, "» {}", notice) {
            tracing::warn!("Failed to write notice: {}", e);
        }
    }
}

// ============================================================
// Tree rendering
// ============================================================

struct Node {
    label: String,
    children: Vec<Node>,
}

/// Render the project as an ASCII tree with pending markers.
///
/// Example output:
/// ```text
/// Seasons [connected]
/// ├── Spring #1 ⏳ critique
/// │   ├── prompt p-1: pink petals on water ⏳ generate_image
/// │   │   └── image i-1 (5 bytes)
/// │   └── critique creativity 7 · vocabulary 5 · rizz 9
/// └── summer grass #2
/// ```
pub fn render_tree(state: &ViewState) -> String {
    let root = project_node(state);
    let mut output = String::new();
    render_node(&mut output, &root, "", true, true);
    output
}

fn with_markers(mut label: String, state: &ViewState, entity: &EntityId) -> String {
    for action in state.pending_for(entity) {
        label.push(' ');
        label.push(PENDING);
        label.push(' ');
        label.push_str(action.kind.as_str());
    }
    label
}

fn project_node(state: &ViewState) -> Node {
    let project = &state.project;
    let name = if project.name.is_empty() {
        format!("project {}", project.id)
    } else {
        project.name.clone()
    };
    let mut label = format!("{} [{}]", name, state.status.as_str());
    if project.haiku_order != HaikuOrder::Unspecified {
        label.push_str(&format!(" ({})", project.haiku_order.as_str()));
    }
    if !state.loaded {
        label.push_str(" (waiting for first snapshot)");
    }

    let children = project
        .haikus
        .iter()
        .map(|haiku| {
            let prompts = haiku.image_prompts.iter().map(|prompt| {
                let images = prompt
                    .images
                    .iter()
                    .map(|image| Node {
                        label: match image.bytes() {
                            Ok(bytes) => format!("image {} ({} bytes)", image.id, bytes.len()),
                            Err(_) => format!("image {} (undecodable)", image.id),
                        },
                        children: vec![],
                    })
                    .collect();
                Node {
                    label: with_markers(
                        format!("prompt {}: {}", prompt.id, prompt.text),
                        state,
                        &prompt.id,
                    ),
                    children: images,
                }
            });
            let critiques = haiku.critiques.iter().map(|c| Node {
                label: format!(
                    "critique creativity {} · vocabulary {} · rizz {}",
                    c.creativity, c.vocabulary_density, c.rizz_level
                ),
                children: vec![],
            });
            Node {
                label: with_markers(
                    format!("{} #{}", haiku.display_title(), haiku.id),
                    state,
                    &haiku.id,
                ),
                children: prompts.chain(critiques).collect(),
            }
        })
        .collect();

    Node {
        label: with_markers(label, state, &project.id),
        children,
    }
}

fn render_node(output: &mut String, node: &Node, prefix: &str, is_last: bool, is_root: bool) {
    if is_root {
        output.push_str(&node.label);
    } else {
        let branch = if is_last { "└── " } else { "├── " };
        output.push_str(prefix);
        output.push_str(branch);
        output.push_str(&node.label);
    }
    output.push('\n');

    let child_prefix = if is_root {
        String::new()
    } else {
        let continuation = if is_last { "    " } else { "│   " };
        format!("{}{}", prefix, continuation)
    };

    for (i, child) in node.children.iter().enumerate() {
        let child_is_last = i == node.children.len() - 1;
        render_node(output, child, &child_prefix, child_is_last, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use studio_core::{Action, RawSnapshot, Reconciler};

    fn state_from(reconciler: &Reconciler, status: ChannelStatus) -> ViewState {
        ViewState {
            project: Arc::new(reconciler.project().clone()),
            pending: reconciler.pending().into(),
            status,
            loaded: reconciler.is_loaded(),
            revision: 1,
        }
    }

    fn seasons() -> Reconciler {
        let mut reconciler = Reconciler::new(EntityId::from(7), std::time::Duration::from_secs(30));
        reconciler
            .apply(
                &RawSnapshot::new(json!({
                    "name": "Seasons",
                    "haikus": [
                        {
                            "id": 1,
                            "title": "Spring",
                            "text": "cherry petals fall",
                            "image_prompts": [{
                                "id": "p-1",
                                "text": "pink petals on water",
                                "images": [{ "id": "i-1", "data": "aGFpa3U=" }]
                            }],
                            "critiques": [{ "creativity": 7, "vocabulary_density": 5, "rizz_level": 9 }]
                        },
                        { "id": 2, "text": "summer grass" }
                    ]
                })),
                Utc::now(),
            )
            .unwrap();
        reconciler
    }

    #[test]
    fn renders_the_project_tree() {
        let state = state_from(&seasons(), ChannelStatus::Connected);
        let expected = "Seasons [connected]\n\
                        ├── Spring #1\n\
                        │   ├── prompt p-1: pink petals on water\n\
                        │   │   └── image i-1 (5 bytes)\n\
                        │   └── critique creativity 7 · vocabulary 5 · rizz 9\n\
                        └── summer grass #2\n";
        assert_eq!(render_tree(&state), expected);
    }

    #[test]
    fn marks_pending_entities() {
        let mut reconciler = seasons();
        reconciler.register(
            Action::Critique {
                haiku_id: EntityId::from(2),
            },
            Utc::now(),
        );
        let state = state_from(&reconciler, ChannelStatus::Reconnecting { attempt: 2 });

        assert!(state.is_pending(&EntityId::from(2)));
        assert!(!state.is_pending(&EntityId::from(1)));
        let output = render_tree(&state);
        assert!(output.starts_with("Seasons [reconnecting]\n"));
        assert!(output.ends_with("└── summer grass #2 ⏳ critique\n"));
    }

    #[test]
    fn shows_the_declared_order_without_reordering() {
        let mut reconciler = Reconciler::new(EntityId::from(7), std::time::Duration::from_secs(30));
        reconciler
            .apply(
                &RawSnapshot::new(json!({
                    "name": "Seasons",
                    "haiku_order": "reverse_chronological",
                    "haikus": [{ "id": 2, "text": "newer" }, { "id": 1, "text": "older" }]
                })),
                Utc::now(),
            )
            .unwrap();
        let state = state_from(&reconciler, ChannelStatus::Connected);
        assert_eq!(
            render_tree(&state),
            "Seasons [connected] (reverse_chronological)\n├── newer #2\n└── older #1\n"
        );
    }

    #[test]
    fn initial_state_waits_for_a_snapshot() {
        let state = ViewState::initial(EntityId::from(3));
        assert_eq!(
            render_tree(&state),
            "project 3 [connecting] (waiting for first snapshot)\n"
        );
    }

    #[test]
    fn text_view_writes_notices() {
        let mut reconciler = seasons();
        let id = reconciler.register(
            Action::Critique {
                haiku_id: EntityId::from(1),
            },
            Utc::now(),
        );
        let retired = reconciler.fail(id, "Server error: 500", Utc::now()).unwrap();

        let mut view = TextView::new(Vec::new());
        view.notify(&Notice::from(retired));
        let written = String::from_utf8(view.into_inner()).unwrap();
        assert_eq!(written, "» critique on 1 failed: Server error: 500\n");
    }
}
