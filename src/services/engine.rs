use anyhow::Result;
use async_trait::async_trait;

/// Display information handed to the engine alongside the audio.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    pub title: String,
    pub estimated_duration: f64,
    pub artwork_ref: Option<String>,
}

/// Audio transport. Time values are seconds.
#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    async fn play(&self, audio_ref: &str, metadata: &TrackMetadata) -> Result<()>;
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
    fn seek(&self, time: f64);
    fn set_speed(&self, speed: f32);

    fn is_playing(&self) -> bool;
    fn current_time(&self) -> f64;
    fn duration(&self) -> f64;
}
