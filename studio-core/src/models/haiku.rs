use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::id::EntityId;

/// Highest value any critique score can take. Scores range over `0..=MAX_SCORE`.
pub const MAX_SCORE: u8 = 10;

/// A generated haiku.
///
/// The body `text` is fixed once the haiku exists; only its prompts, images
/// and critiques grow over time as background jobs finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Haiku {
    pub id: EntityId,
    pub title: Option<String>,
    pub text: String,
    pub image_prompts: Vec<ImagePrompt>,
    pub critiques: Vec<Critique>,
}

/// An image prompt derived from a haiku.
///
/// `text` is editable by the user through the edit-prompt action; the edit
/// shows up here only once the server pushes it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePrompt {
    pub id: EntityId,
    pub text: String,
    pub images: Vec<GeneratedImage>,
}

/// An image generated from a prompt. `data` is the base64 text the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: EntityId,
    pub data: String,
}

impl GeneratedImage {
    /// Decode the payload into raw image bytes.
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(self.data.trim())
    }
}

/// Scores assigned to a haiku by one critique job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Critique {
    pub creativity: u8,
    pub vocabulary_density: u8,
    pub rizz_level: u8,
}

impl Haiku {
    pub fn image_prompt(&self, id: &EntityId) -> Option<&ImagePrompt> {
        self.image_prompts.iter().find(|p| &p.id == id)
    }

    /// Display title, falling back to the first line of the poem.
    pub fn display_title(&self) -> &str {
        match self.title.as_deref() {
            Some(title) if !title.trim().is_empty() => title,
            _ => self.text.lines().next().unwrap_or_default(),
        }
    }
}
