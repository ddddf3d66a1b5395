use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::haiku::{Haiku, ImagePrompt};
use super::id::{EntityId, ProjectId};

/// A project containing haikus.
///
/// The client-side copy is always the last snapshot the server pushed; it is
/// replaced wholesale on every reconciliation pass. `haikus` keeps the order
/// in which the server delivered them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Order the server declares for `haikus`. Informational only, the
    /// client never re-sorts.
    #[serde(default)]
    pub haiku_order: HaikuOrder,
    pub haikus: Vec<Haiku>,
}

/// The ordering a server declares for the haiku list of a snapshot.
///
/// - `Unspecified`: The server did not say; display as delivered
/// - `Chronological`: Oldest first
/// - `ReverseChronological`: Newest first
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HaikuOrder {
    #[default]
    Unspecified,
    Chronological,
    ReverseChronological,
}

impl HaikuOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Chronological => "chronological",
            Self::ReverseChronological => "reverse_chronological",
        }
    }
}

impl Project {
    /// The state of a project before its first snapshot arrives.
    pub fn empty(id: ProjectId) -> Self {
        Self {
            id,
            name: String::new(),
            haiku_order: HaikuOrder::Unspecified,
            haikus: Vec::new(),
        }
    }

    pub fn haiku(&self, id: &EntityId) -> Option<&Haiku> {
        self.haikus.iter().find(|h| &h.id == id)
    }

    pub fn image_prompt(&self, id: &EntityId) -> Option<&ImagePrompt> {
        self.haikus
            .iter()
            .flat_map(|h| h.image_prompts.iter())
            .find(|p| &p.id == id)
    }

    pub fn image_count(&self) -> usize {
        self.haikus
            .iter()
            .flat_map(|h| h.image_prompts.iter())
            .map(|p| p.images.len())
            .sum()
    }
}

/// Identity lookup over one version of a project.
///
/// Built once per reconciliation pass so that every pending action is
/// matched by id regardless of where its target sits in the lists.
pub struct ProjectIndex<'a> {
    project: &'a Project,
    haikus: HashMap<&'a EntityId, &'a Haiku>,
    prompts: HashMap<&'a EntityId, &'a ImagePrompt>,
}

impl<'a> ProjectIndex<'a> {
    pub fn new(project: &'a Project) -> Self {
        let mut haikus = HashMap::with_capacity(project.haikus.len());
        let mut prompts = HashMap::new();
        for haiku in &project.haikus {
            haikus.insert(&haiku.id, haiku);
            for prompt in &haiku.image_prompts {
                prompts.insert(&prompt.id, prompt);
            }
        }
        Self {
            project,
            haikus,
            prompts,
        }
    }

    pub fn project(&self) -> &'a Project {
        self.project
    }

    pub fn haiku(&self, id: &EntityId) -> Option<&'a Haiku> {
        self.haikus.get(id).copied()
    }

    pub fn image_prompt(&self, id: &EntityId) -> Option<&'a ImagePrompt> {
        self.prompts.get(id).copied()
    }
}
