use crate::core::config::GenerationConfig;
use crate::core::error::ErrorKind;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Opaque reference to narration audio (a URL or a local path).
pub type AudioRef = String;

/// A story shared between the generation and playback coordinators.
///
/// Writers hold the lock only for the duration of a field update, never
/// across an await point.
pub type SharedStory = Arc<RwLock<Story>>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    #[default]
    Pending,
    Generated,
    /// Generation failed; the scene is shown as a placeholder until retried.
    Placeholder,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Illustration {
    pub id: Uuid,
    pub display_order: u32,
    /// Seconds into the narration at which the scene becomes active.
    pub timestamp: f64,
    pub image_ref: Option<String>,
    #[serde(default)]
    pub generation_status: GenerationStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip)]
    pub last_error: Option<ErrorKind>,
}

impl Illustration {
    pub fn new(display_order: u32, timestamp: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_order,
            timestamp,
            image_ref: None,
            generation_status: GenerationStatus::Pending,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.generation_status == GenerationStatus::Placeholder
    }

    pub fn mark_failed(&mut self, kind: ErrorKind) {
        self.generation_status = GenerationStatus::Placeholder;
        self.last_error = Some(kind);
    }

    /// Takes the image of a regenerated copy, keeping identity and position.
    pub fn apply_regenerated(&mut self, fresh: &Illustration) {
        self.image_ref = fresh.image_ref.clone();
        self.generation_status = fresh.generation_status;
        self.last_error = if fresh.generation_status == GenerationStatus::Generated {
            None
        } else {
            fresh.last_error.clone()
        };
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Story {
    pub id: Uuid,
    /// Identity on the content backend, absent until the story was generated remotely.
    pub backend_id: Option<String>,
    pub title: String,
    pub content: String,
    pub audio_ref: Option<AudioRef>,
    #[serde(default)]
    pub needs_audio_regeneration: bool,
    pub estimated_duration: f64,
    #[serde(default)]
    pub illustrations: Vec<Illustration>,
    #[serde(default)]
    pub play_count: u32,
    #[serde(default)]
    pub is_favorite: bool,
    pub created_at: DateTime<Utc>,
    /// Bumped on every text change; narration is tied to the revision it was
    /// requested for.
    #[serde(skip)]
    content_revision: u64,
}

impl Story {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_id: None,
            title: title.into(),
            content: content.into(),
            audio_ref: None,
            needs_audio_regeneration: false,
            estimated_duration: 0.0,
            illustrations: Vec::new(),
            play_count: 0,
            is_favorite: false,
            created_at: Utc::now(),
            content_revision: 0,
        }
    }

    pub fn into_shared(self) -> SharedStory {
        Arc::new(RwLock::new(self))
    }

    /// Audio exists and was produced for the current text.
    pub fn has_playable_audio(&self) -> bool {
        self.audio_ref.is_some() && !self.needs_audio_regeneration
    }

    pub fn content_revision(&self) -> u64 {
        self.content_revision
    }

    /// Stores narration requested at `revision`. If the text changed while it
    /// was being produced the audio stays flagged for regeneration.
    pub fn attach_audio(&mut self, audio_ref: AudioRef, revision: u64) {
        self.audio_ref = Some(audio_ref);
        self.needs_audio_regeneration = revision != self.content_revision;
    }

    /// Replaces the narration text. Existing audio no longer matches and is
    /// flagged for regeneration.
    pub fn set_content(&mut self, content: impl Into<String>) {
        let content = content.into();
        if content == self.content {
            return;
        }
        self.content = content;
        self.content_revision += 1;
        if self.audio_ref.is_some() {
            self.needs_audio_regeneration = true;
        }
    }

    /// Installs a fresh illustration list, ordered by `display_order`.
    pub fn set_illustrations(&mut self, mut illustrations: Vec<Illustration>) {
        illustrations.sort_by_key(|i| i.display_order);
        self.illustrations = illustrations;
    }

    pub fn illustration_mut(&mut self, display_order: u32) -> Option<&mut Illustration> {
        self.illustrations
            .iter_mut()
            .find(|i| i.display_order == display_order)
    }

    pub fn failed_illustrations(&self) -> Vec<u32> {
        self.illustrations
            .iter()
            .filter(|i| i.is_failed())
            .map(|i| i.display_order)
            .collect()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Hero {
    pub id: String,
    pub name: String,
    /// Visual reference required before scene illustrations can be generated.
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventSpec {
    pub event: String,
    #[serde(default)]
    pub details: Option<String>,
}

impl EventSpec {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            details: None,
        }
    }
}

/// What a generation session was asked to produce.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub hero: Hero,
    pub event: EventSpec,
    pub language: String,
    pub voice: String,
    pub include_illustrations: bool,
}

impl GenerationRequest {
    pub fn new(hero: Hero, event: EventSpec, config: &GenerationConfig) -> Self {
        Self {
            hero,
            event,
            language: config.language.clone(),
            voice: config.voice.clone(),
            include_illustrations: config.illustrations,
        }
    }

    /// Illustrations are requested and the hero has the avatar they are drawn from.
    pub fn wants_illustrations(&self) -> bool {
        self.include_illustrations && self.hero.avatar_ref.is_some()
    }
}
