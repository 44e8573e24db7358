use crate::core::model::{AudioRef, EventSpec, Hero, Illustration, Story};
use anyhow::Result;
use async_trait::async_trait;

/// Remote content backend. Every call is a single attempt, retries are
/// driven by the caller.
///
/// Implementations may fail with any error; the coordinators map it into the
/// taxonomy with [`crate::core::error::ContentError::classify`]. Returning a
/// `ContentError` directly keeps its kind untouched.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    async fn generate_story(&self, hero: &Hero, event: &EventSpec, language: &str)
        -> Result<Story>;

    async fn generate_audio(&self, story_id: &str, language: &str, voice: &str)
        -> Result<AudioRef>;

    /// Returns the story with its illustration list filled in.
    async fn generate_illustrations(&self, story_id: &str) -> Result<Story>;

    async fn regenerate_illustration(&self, story_id: &str, display_order: u32)
        -> Result<Illustration>;

    async fn update_story(&self, story: &Story) -> Result<()>;

    async fn delete_story(&self, story_id: &str) -> Result<()>;
}
