//! Parsing of pushed project snapshots.
//!
//! A snapshot is always the complete project tree. Parsing either yields a
//! whole [`Project`] or an error; nothing is ever half applied.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::*;

/// A payload received on the push channel that is valid JSON but has not
/// been checked against the project shape yet.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSnapshot {
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl RawSnapshot {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Why a snapshot could not be turned into a project.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is not a JSON object")]
    NotAnObject,

    #[error("snapshot does not match the project shape: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("server reported an error instead of a snapshot: {0}")]
    ServerReported(String),

    #[error("snapshot belongs to project {found}, expected {expected}")]
    WrongProject { expected: ProjectId, found: ProjectId },
}

// ============================================================
// Wire shapes
// ============================================================

#[derive(Debug, Deserialize)]
struct WireProject {
    #[serde(default)]
    project_id: Option<EntityId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    haiku_order: HaikuOrder,
    #[serde(default)]
    haikus: Vec<WireHaiku>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireHaiku {
    id: EntityId,
    #[serde(default)]
    title: Option<String>,
    #[serde(alias = "haiku")]
    text: String,
    #[serde(default)]
    image_prompts: Vec<WireImagePrompt>,
    #[serde(default)]
    critiques: Vec<WireCritique>,
}

#[derive(Debug, Deserialize)]
struct WireImagePrompt {
    id: EntityId,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    images: Vec<WireImage>,
}

#[derive(Debug, Deserialize)]
struct WireImage {
    id: EntityId,
    #[serde(alias = "b64")]
    data: String,
}

#[derive(Debug, Deserialize)]
struct WireCritique {
    #[serde(alias = "creativity_score")]
    creativity: i64,
    vocabulary_density: i64,
    rizz_level: i64,
}

// ============================================================
// Parsing
// ============================================================

/// Parse a snapshot payload for the project `expected`.
pub fn parse_project(expected: &ProjectId, payload: &Value) -> Result<Project, SnapshotError> {
    if !payload.is_object() {
        return Err(SnapshotError::NotAnObject);
    }

    let wire = WireProject::deserialize(payload)?;

    if let Some(message) = wire.error {
        return Err(SnapshotError::ServerReported(message));
    }

    if let Some(found) = wire.project_id {
        if &found != expected {
            return Err(SnapshotError::WrongProject {
                expected: expected.clone(),
                found,
            });
        }
    }

    let haikus = dedup_by_id("haiku", wire.haikus, |h| &h.id)
        .into_iter()
        .map(into_haiku)
        .collect();

    Ok(Project {
        id: expected.clone(),
        name: wire.name.unwrap_or_default(),
        haiku_order: wire.haiku_order,
        haikus,
    })
}

fn into_haiku(wire: WireHaiku) -> Haiku {
    let image_prompts = dedup_by_id("image prompt", wire.image_prompts, |p| &p.id)
        .into_iter()
        .map(|prompt| ImagePrompt {
            images: dedup_by_id("image", prompt.images, |i| &i.id)
                .into_iter()
                .map(|image| GeneratedImage {
                    id: image.id,
                    data: image.data,
                })
                .collect(),
            id: prompt.id,
            text: prompt.text.unwrap_or_default(),
        })
        .collect();

    let critiques = wire
        .critiques
        .into_iter()
        .map(|c| Critique {
            creativity: clamp_score(&wire.id, "creativity", c.creativity),
            vocabulary_density: clamp_score(&wire.id, "vocabulary_density", c.vocabulary_density),
            rizz_level: clamp_score(&wire.id, "rizz_level", c.rizz_level),
        })
        .collect();

    Haiku {
        id: wire.id,
        title: wire.title,
        text: wire.text,
        image_prompts,
        critiques,
    }
}

/// Keep the first entity for every id, in delivered order.
fn dedup_by_id<T>(kind: &str, items: Vec<T>, id: impl Fn(&T) -> &EntityId) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(id(&item).clone()) {
            kept.push(item);
        } else {
            tracing::warn!("Duplicate {} id {} in snapshot, keeping the first", kind, id(&item));
        }
    }
    kept
}

fn clamp_score(haiku: &EntityId, field: &str, value: i64) -> u8 {
    let clamped = value.clamp(0, i64::from(MAX_SCORE));
    if clamped != value {
        tracing::warn!(
            "Critique {} of haiku {} out of range ({}), clamped to {}",
            field,
            haiku,
            value,
            clamped
        );
    }
    u8::try_from(clamped).unwrap_or(MAX_SCORE)
}
