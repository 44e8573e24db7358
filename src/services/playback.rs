//! Narration playback, story queue navigation and the time-update tick that
//! drives the illustration carousel.

use crate::core::config::{Config, GenerationConfig, PlaybackConfig};
use crate::core::error::{ContentError, PlaybackError};
use crate::core::model::SharedStory;
use crate::services::engine::{PlaybackEngine, TrackMetadata};
use crate::services::illustration_sync::{IllustrationSyncEngine, IllustrationSyncState};
use crate::services::repository::ContentRepository;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Positions this close to the end count as a finished track.
const END_OF_TRACK_TOLERANCE: f64 = 0.25;
const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct PlaybackSession {
    pub current_story: Option<SharedStory>,
    pub current_time: f64,
    pub duration: f64,
    pub is_playing: bool,
    pub playback_speed: f32,
    pub queue: Vec<SharedStory>,
    pub queue_index: usize,
    pub is_queue_mode: bool,
}

impl PlaybackSession {
    pub fn is_paused(&self) -> bool {
        self.duration > 0.0 && !self.is_playing && self.current_time > 0.0
    }

    pub fn current_story_id(&self) -> Option<Uuid> {
        self.current_story.as_ref().map(|s| s.read().id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    StoryStarted { story_id: Uuid },
    TrackFinished { story_id: Uuid },
    QueueFinished,
}

struct Inner {
    engine: Arc<dyn PlaybackEngine>,
    repository: Arc<dyn ContentRepository>,
    generation: GenerationConfig,
    config: PlaybackConfig,
    session: watch::Sender<PlaybackSession>,
    sync: Mutex<IllustrationSyncEngine>,
    sync_state: watch::Sender<IllustrationSyncState>,
    events: broadcast::Sender<PlaybackEvent>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// What one tick observed.
struct TickOutcome {
    playing: bool,
    finished: Option<Uuid>,
}

#[derive(Clone)]
pub struct PlaybackCoordinator {
    inner: Arc<Inner>,
}

impl PlaybackCoordinator {
    pub fn new(
        engine: Arc<dyn PlaybackEngine>,
        repository: Arc<dyn ContentRepository>,
        config: &Config,
    ) -> Self {
        let (session, _) = watch::channel(PlaybackSession {
            playback_speed: config.playback.default_speed,
            ..PlaybackSession::default()
        });
        let (sync_state, _) = watch::channel(IllustrationSyncState::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                engine,
                repository,
                generation: config.generation.clone(),
                config: config.playback.clone(),
                session,
                sync: Mutex::new(IllustrationSyncEngine::new()),
                sync_state,
                events,
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn session(&self) -> PlaybackSession {
        self.inner.session.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSession> {
        self.inner.session.subscribe()
    }

    pub fn sync_state(&self) -> IllustrationSyncState {
        *self.inner.sync_state.borrow()
    }

    pub fn subscribe_sync(&self) -> watch::Receiver<IllustrationSyncState> {
        self.inner.sync_state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.inner.events.subscribe()
    }

    /// Starts a story from the beginning, generating its narration first
    /// when it is missing or stale.
    pub async fn play(&self, story: SharedStory) -> Result<(), PlaybackError> {
        self.ensure_audio(&story).await?;
        let (story_id, audio_ref, metadata) = {
            let s = story.read();
            let audio_ref = s.audio_ref.clone().ok_or_else(|| {
                PlaybackError::AudioGeneration(ContentError::invariant(
                    "Story has no audio after generation",
                ))
            })?;
            let metadata = TrackMetadata {
                title: s.title.clone(),
                estimated_duration: s.estimated_duration,
                artwork_ref: s.illustrations.first().and_then(|i| i.image_ref.clone()),
            };
            (s.id, audio_ref, metadata)
        };

        self.stop_ticker();
        let engine = &self.inner.engine;
        engine
            .play(&audio_ref, &metadata)
            .await
            .map_err(PlaybackError::Engine)?;
        engine.set_speed(self.inner.session.borrow().playback_speed);
        story.write().play_count += 1;
        info!("Playing \"{}\"", metadata.title);

        self.inner
            .session
            .send_modify(|s| s.current_story = Some(story.clone()));
        self.reset_sync();
        self.tick();
        self.start_ticker();
        let _ = self.inner.events.send(PlaybackEvent::StoryStarted { story_id });
        Ok(())
    }

    pub fn pause(&self) {
        self.inner.engine.pause();
        self.stop_ticker();
        self.tick();
    }

    pub fn resume(&self) -> Result<(), PlaybackError> {
        self.require_story()?;
        self.inner.engine.resume();
        self.tick();
        self.start_ticker();
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.engine.stop();
        self.stop_ticker();
        self.inner.session.send_modify(|s| s.current_story = None);
        self.reset_sync();
        self.tick();
    }

    pub fn toggle_play_pause(&self) -> Result<(), PlaybackError> {
        if self.inner.session.borrow().is_playing {
            self.pause();
            Ok(())
        } else {
            self.resume()
        }
    }

    /// Moves playback and hands the carousel back to time-driven sync.
    pub fn seek(&self, time: f64) -> Result<(), PlaybackError> {
        self.require_story()?;
        let duration = self.inner.engine.duration();
        let target = if duration > 0.0 {
            time.clamp(0.0, duration)
        } else {
            time.max(0.0)
        };
        debug!("Seeking to {:.2}s", target);
        self.inner.engine.seek(target);
        self.inner.sync.lock().resume_auto();
        self.publish_sync();
        self.tick();
        Ok(())
    }

    pub fn skip_forward(&self) -> Result<(), PlaybackError> {
        self.skip_by(self.inner.config.skip_seconds)
    }

    pub fn skip_backward(&self) -> Result<(), PlaybackError> {
        self.skip_by(-self.inner.config.skip_seconds)
    }

    pub fn skip_by(&self, seconds: f64) -> Result<(), PlaybackError> {
        self.require_story()?;
        let position = self.inner.engine.current_time();
        self.seek(position + seconds)
    }

    pub fn set_speed(&self, multiplier: f32) {
        let speed = self.inner.config.clamp_speed(multiplier);
        self.inner.engine.set_speed(speed);
        self.inner.session.send_modify(|s| s.playback_speed = speed);
    }

    pub async fn setup_queue(
        &self,
        stories: Vec<SharedStory>,
        start_index: usize,
    ) -> Result<(), PlaybackError> {
        if stories.is_empty() {
            return Err(PlaybackError::EmptyQueue);
        }
        if start_index >= stories.len() {
            return Err(PlaybackError::QueueIndexOutOfRange {
                index: start_index,
                len: stories.len(),
            });
        }
        let first = stories[start_index].clone();
        self.ensure_audio(&first).await?;
        info!("Queue of {} stories, starting at {}", stories.len(), start_index);

        let previous = {
            let s = self.inner.session.borrow();
            (s.queue.clone(), s.queue_index, s.is_queue_mode)
        };
        self.inner.session.send_modify(|s| {
            s.queue = stories;
            s.queue_index = start_index;
            s.is_queue_mode = true;
        });
        if let Err(e) = self.play(first).await {
            let (queue, queue_index, is_queue_mode) = previous;
            self.inner.session.send_modify(|s| {
                s.queue = queue;
                s.queue_index = queue_index;
                s.is_queue_mode = is_queue_mode;
            });
            self.tick();
            return Err(e);
        }
        Ok(())
    }

    pub fn clear_queue(&self) {
        self.inner.session.send_modify(|s| {
            s.queue.clear();
            s.queue_index = 0;
            s.is_queue_mode = false;
        });
    }

    /// No-op outside queue mode or on the last entry.
    pub async fn play_next(&self) -> Result<(), PlaybackError> {
        let next = {
            let s = self.inner.session.borrow();
            let index = s.queue_index + 1;
            if !s.is_queue_mode || index >= s.queue.len() {
                return Ok(());
            }
            (index, s.queue[index].clone())
        };
        self.jump_to_queue_entry(next.0, next.1).await
    }

    /// Goes to the previous queue entry when close to the start of the
    /// current one, otherwise restarts the current story.
    pub async fn play_previous(&self) -> Result<(), PlaybackError> {
        self.tick();
        let previous = {
            let s = self.inner.session.borrow();
            let near_start = s.current_time < self.inner.config.previous_track_threshold_seconds;
            if s.is_queue_mode && near_start && s.queue_index > 0 {
                let index = s.queue_index - 1;
                s.queue.get(index).cloned().map(|story| (index, story))
            } else {
                None
            }
        };
        match previous {
            Some((index, story)) => self.jump_to_queue_entry(index, story).await,
            None => self.restart_current(),
        }
    }

    /// Manual carousel move; playback position is left alone.
    pub fn move_to_index(&self, index: usize) -> Result<(), PlaybackError> {
        let story = self.require_story()?;
        let len = story.read().illustrations.len();
        if index >= len {
            return Err(PlaybackError::IllustrationOutOfRange { index, len });
        }
        self.inner.sync.lock().move_to_index(index);
        self.publish_sync();
        Ok(())
    }

    pub fn move_to_illustration(&self, illustration_id: Uuid) -> Result<usize, PlaybackError> {
        let story = self.require_story()?;
        let index = {
            let s = story.read();
            self.inner
                .sync
                .lock()
                .move_to_illustration(illustration_id, &s.illustrations)
        };
        let index = index.ok_or(PlaybackError::IllustrationNotFound)?;
        self.publish_sync();
        Ok(index)
    }

    /// Tapping a scene: select it and move playback to where it begins.
    pub fn skip_to_illustration(&self, illustration_id: Uuid) -> Result<(), PlaybackError> {
        self.move_to_illustration(illustration_id)?;
        let story = self.require_story()?;
        let timestamp = story
            .read()
            .illustrations
            .iter()
            .find(|i| i.id == illustration_id)
            .map(|i| i.timestamp)
            .ok_or(PlaybackError::IllustrationNotFound)?;
        self.seek(timestamp)
    }

    /// Reads the engine into the session and, in auto mode, moves the
    /// carousel. This is the only place the playback position is written.
    fn tick(&self) -> TickOutcome {
        let engine = &self.inner.engine;
        let playing = engine.is_playing();
        let time = engine.current_time();
        let duration = engine.duration();

        let mut was_playing = false;
        let mut story = None;
        self.inner.session.send_if_modified(|s| {
            was_playing = s.is_playing;
            story = s.current_story.clone();
            let changed =
                s.is_playing != playing || s.current_time != time || s.duration != duration;
            s.is_playing = playing;
            s.current_time = time;
            s.duration = duration;
            changed
        });

        let mut finished = None;
        if let Some(story) = story {
            let (story_id, changed) = {
                let s = story.read();
                let changed = self
                    .inner
                    .sync
                    .lock()
                    .update_for_time(time, &s.illustrations);
                (s.id, changed)
            };
            if changed {
                self.publish_sync();
            }
            if was_playing
                && !playing
                && duration > 0.0
                && time >= duration - END_OF_TRACK_TOLERANCE
            {
                finished = Some(story_id);
            }
        }
        TickOutcome { playing, finished }
    }

    fn start_ticker(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.tick_interval();
        let handle = tokio::spawn(tick_loop(weak, period));
        if let Some(previous) = self.inner.ticker.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_ticker(&self) {
        if let Some(handle) = self.inner.ticker.lock().take() {
            handle.abort();
        }
    }

    async fn handle_track_finished(&self, story_id: Uuid) {
        debug!("Track {} finished", story_id);
        let _ = self.inner.events.send(PlaybackEvent::TrackFinished { story_id });
        let (queue_mode, at_end) = {
            let s = self.inner.session.borrow();
            (s.is_queue_mode, s.queue_index + 1 >= s.queue.len())
        };
        if !queue_mode || !self.inner.config.auto_advance {
            return;
        }
        if at_end {
            let _ = self.inner.events.send(PlaybackEvent::QueueFinished);
        } else if let Err(e) = self.play_next().await {
            warn!("Could not advance the queue: {}", e);
        }
    }

    /// The queue position only moves once the entry is playing. Narration is
    /// produced before the current story is stopped.
    async fn jump_to_queue_entry(
        &self,
        index: usize,
        story: SharedStory,
    ) -> Result<(), PlaybackError> {
        self.ensure_audio(&story).await?;
        self.inner.engine.stop();
        self.stop_ticker();
        if let Err(e) = self.play(story).await {
            self.tick();
            return Err(e);
        }
        self.inner.session.send_modify(|s| s.queue_index = index);
        Ok(())
    }

    async fn ensure_audio(&self, story: &SharedStory) -> Result<(), PlaybackError> {
        if story.read().has_playable_audio() {
            return Ok(());
        }
        self.generate_audio(story).await
    }

    fn restart_current(&self) -> Result<(), PlaybackError> {
        self.require_story()?;
        let engine = &self.inner.engine;
        engine.seek(0.0);
        if !engine.is_playing() {
            engine.resume();
        }
        self.inner.sync.lock().resume_auto();
        self.publish_sync();
        self.tick();
        self.start_ticker();
        Ok(())
    }

    async fn generate_audio(&self, story: &SharedStory) -> Result<(), PlaybackError> {
        let (story_id, revision) = {
            let s = story.read();
            let story_id = s.backend_id.clone().ok_or_else(|| {
                PlaybackError::AudioGeneration(ContentError::invariant(format!(
                    "Story {} has no backend id",
                    s.id
                )))
            })?;
            (story_id, s.content_revision())
        };
        info!("Narration missing or stale for {}, generating", story_id);
        let audio_ref = self
            .inner
            .repository
            .generate_audio(
                &story_id,
                &self.inner.generation.language,
                &self.inner.generation.voice,
            )
            .await
            .map_err(|e| PlaybackError::AudioGeneration(ContentError::classify(&e)))?;
        story.write().attach_audio(audio_ref, revision);
        Ok(())
    }

    fn require_story(&self) -> Result<SharedStory, PlaybackError> {
        self.inner
            .session
            .borrow()
            .current_story
            .clone()
            .ok_or(PlaybackError::NothingLoaded)
    }

    fn reset_sync(&self) {
        self.inner.sync.lock().reset();
        self.publish_sync();
    }

    fn publish_sync(&self) {
        let state = self.inner.sync.lock().state();
        self.inner.sync_state.send_replace(state);
    }
}

async fn tick_loop(inner: Weak<Inner>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(strong) = inner.upgrade() else {
            break;
        };
        let coordinator = PlaybackCoordinator { inner: strong };
        let outcome = coordinator.tick();
        if outcome.playing {
            continue;
        }
        if let Some(story_id) = outcome.finished {
            // Advancing restarts the ticker, which aborts this task.
            tokio::spawn(async move { coordinator.handle_track_finished(story_id).await });
        }
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{AudioRef, EventSpec, Hero, Illustration, Story};
    use crate::services::illustration_sync::SyncMode;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct EngineState {
        playing: bool,
        time: f64,
        duration: f64,
        speed: f32,
        played: Vec<String>,
        seeks: Vec<f64>,
        stops: usize,
    }

    #[derive(Default)]
    struct MockEngine {
        state: Mutex<EngineState>,
    }

    impl MockEngine {
        fn set_position(&self, time: f64) {
            self.state.lock().time = time;
        }

        fn finish_track(&self) {
            let mut state = self.state.lock();
            state.time = state.duration;
            state.playing = false;
        }

        fn played(&self) -> Vec<String> {
            self.state.lock().played.clone()
        }
    }

    #[async_trait]
    impl PlaybackEngine for MockEngine {
        async fn play(&self, audio_ref: &str, metadata: &TrackMetadata) -> Result<()> {
            let mut state = self.state.lock();
            state.played.push(audio_ref.to_string());
            state.playing = true;
            state.time = 0.0;
            state.duration = metadata.estimated_duration;
            Ok(())
        }
        fn pause(&self) {
            self.state.lock().playing = false;
        }
        fn resume(&self) {
            self.state.lock().playing = true;
        }
        fn stop(&self) {
            let mut state = self.state.lock();
            state.playing = false;
            state.time = 0.0;
            state.stops += 1;
        }
        fn seek(&self, time: f64) {
            let mut state = self.state.lock();
            state.time = time;
            state.seeks.push(time);
        }
        fn set_speed(&self, speed: f32) {
            self.state.lock().speed = speed;
        }
        fn is_playing(&self) -> bool {
            self.state.lock().playing
        }
        fn current_time(&self) -> f64 {
            self.state.lock().time
        }
        fn duration(&self) -> f64 {
            self.state.lock().duration
        }
    }

    #[derive(Default)]
    struct AudioOnlyRepository {
        audio_calls: Mutex<Vec<String>>,
        failing: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContentRepository for AudioOnlyRepository {
        async fn generate_story(&self, _: &Hero, _: &EventSpec, _: &str) -> Result<Story> {
            anyhow::bail!("not used")
        }
        async fn generate_audio(&self, story_id: &str, _: &str, _: &str) -> Result<AudioRef> {
            self.audio_calls.lock().push(story_id.to_string());
            if self.failing.lock().iter().any(|id| id == story_id) {
                anyhow::bail!("narration service unavailable");
            }
            Ok(format!("{}.mp3", story_id))
        }
        async fn generate_illustrations(&self, _: &str) -> Result<Story> {
            anyhow::bail!("not used")
        }
        async fn regenerate_illustration(&self, _: &str, _: u32) -> Result<Illustration> {
            anyhow::bail!("not used")
        }
        async fn update_story(&self, _: &Story) -> Result<()> {
            Ok(())
        }
        async fn delete_story(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn story(name: &str) -> SharedStory {
        let mut story = Story::new(name, "text");
        story.backend_id = Some(name.to_string());
        story.estimated_duration = 60.0;
        let revision = story.content_revision();
        story.attach_audio(format!("{}.mp3", name), revision);
        story.set_illustrations(vec![
            Illustration::new(0, 0.0),
            Illustration::new(1, 5.0),
            Illustration::new(2, 12.0),
        ]);
        story.into_shared()
    }

    /// Story whose text changed after narration, so playing it needs new audio.
    fn stale_story(name: &str) -> SharedStory {
        let s = story(name);
        s.write().set_content("edited text");
        s
    }

    fn coordinator() -> (PlaybackCoordinator, Arc<MockEngine>, Arc<AudioOnlyRepository>) {
        let engine = Arc::new(MockEngine::default());
        let repo = Arc::new(AudioOnlyRepository::default());
        let coordinator = PlaybackCoordinator::new(engine.clone(), repo.clone(), &Config::default());
        (coordinator, engine, repo)
    }

    #[tokio::test]
    async fn test_play_existing_audio_increments_play_count() {
        let (coordinator, engine, repo) = coordinator();
        let s = story("s1");

        coordinator.play(s.clone()).await.unwrap();

        assert_eq!(engine.played(), vec!["s1.mp3".to_string()]);
        assert!(repo.audio_calls.lock().is_empty());
        assert_eq!(s.read().play_count, 1);
        let session = coordinator.session();
        assert!(session.is_playing);
        assert_eq!(session.duration, 60.0);
        assert_eq!(session.current_story_id(), Some(s.read().id));
    }

    #[tokio::test]
    async fn test_play_generates_missing_or_stale_audio_first() {
        let (coordinator, engine, repo) = coordinator();
        let s = story("s1");
        s.write().set_content("edited text");
        assert!(s.read().needs_audio_regeneration);

        coordinator.play(s.clone()).await.unwrap();

        assert_eq!(*repo.audio_calls.lock(), vec!["s1".to_string()]);
        assert!(s.read().has_playable_audio());
        assert_eq!(engine.played(), vec!["s1.mp3".to_string()]);
    }

    #[tokio::test]
    async fn test_play_without_backend_id_reports_audio_error() {
        let (coordinator, engine, _) = coordinator();
        let s = Story::new("local", "text").into_shared();

        let err = coordinator.play(s).await.unwrap_err();
        assert!(matches!(err, PlaybackError::AudioGeneration(_)));
        assert!(engine.played().is_empty());
    }

    #[tokio::test]
    async fn test_pause_resume_and_derived_paused_flag() {
        let (coordinator, engine, _) = coordinator();
        coordinator.play(story("s1")).await.unwrap();
        engine.set_position(10.0);

        coordinator.pause();
        let session = coordinator.session();
        assert!(!session.is_playing);
        assert!(session.is_paused());
        assert_eq!(session.current_time, 10.0);

        coordinator.toggle_play_pause().unwrap();
        assert!(coordinator.session().is_playing);
    }

    #[tokio::test]
    async fn test_stop_unloads_story() {
        let (coordinator, _, _) = coordinator();
        coordinator.play(story("s1")).await.unwrap();

        coordinator.stop();

        let session = coordinator.session();
        assert!(session.current_story.is_none());
        assert!(!session.is_paused());
        assert!(matches!(coordinator.resume(), Err(PlaybackError::NothingLoaded)));
        assert!(matches!(coordinator.seek(3.0), Err(PlaybackError::NothingLoaded)));
    }

    #[tokio::test]
    async fn test_seek_clamps_and_skips() {
        let (coordinator, engine, _) = coordinator();
        coordinator.play(story("s1")).await.unwrap();

        coordinator.seek(100.0).unwrap();
        assert_eq!(coordinator.session().current_time, 60.0);

        coordinator.seek(20.0).unwrap();
        coordinator.skip_forward().unwrap();
        assert_eq!(engine.current_time(), 35.0);
        coordinator.skip_backward().unwrap();
        coordinator.skip_backward().unwrap();
        assert_eq!(engine.current_time(), 5.0);
        coordinator.skip_backward().unwrap();
        assert_eq!(engine.current_time(), 0.0);
    }

    #[tokio::test]
    async fn test_speed_is_clamped() {
        let (coordinator, engine, _) = coordinator();
        coordinator.set_speed(4.0);
        assert_eq!(engine.state.lock().speed, 2.0);
        assert_eq!(coordinator.session().playback_speed, 2.0);
    }

    async fn queue_at_index_two(
        coordinator: &PlaybackCoordinator,
    ) -> Vec<SharedStory> {
        let stories = vec![story("q0"), story("q1"), story("q2")];
        coordinator.setup_queue(stories.clone(), 2).await.unwrap();
        stories
    }

    #[tokio::test]
    async fn test_previous_within_threshold_moves_back() {
        let (coordinator, engine, _) = coordinator();
        queue_at_index_two(&coordinator).await;
        engine.set_position(2.9);

        coordinator.play_previous().await.unwrap();

        let session = coordinator.session();
        assert_eq!(session.queue_index, 1);
        assert_eq!(engine.played().last().map(String::as_str), Some("q1.mp3"));
    }

    #[tokio::test]
    async fn test_previous_after_threshold_restarts_current() {
        let (coordinator, engine, _) = coordinator();
        queue_at_index_two(&coordinator).await;
        engine.set_position(3.1);

        coordinator.play_previous().await.unwrap();

        let session = coordinator.session();
        assert_eq!(session.queue_index, 2);
        assert_eq!(session.current_time, 0.0);
        assert_eq!(engine.played(), vec!["q2.mp3".to_string()]);
        assert_eq!(engine.state.lock().seeks.last(), Some(&0.0));
    }

    #[tokio::test]
    async fn test_previous_at_exact_threshold_restarts_current() {
        let (coordinator, engine, _) = coordinator();
        queue_at_index_two(&coordinator).await;
        engine.set_position(3.0);

        coordinator.play_previous().await.unwrap();

        let session = coordinator.session();
        assert_eq!(session.queue_index, 2);
        assert_eq!(session.current_time, 0.0);
        assert_eq!(engine.played(), vec!["q2.mp3".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_advance_keeps_queue_position() {
        let (coordinator, engine, repo) = coordinator();
        repo.failing.lock().push("b".to_string());
        let a = story("a");
        coordinator
            .setup_queue(vec![a.clone(), stale_story("b")], 0)
            .await
            .unwrap();

        let err = coordinator.play_next().await.unwrap_err();
        assert!(matches!(err, PlaybackError::AudioGeneration(_)));

        let session = coordinator.session();
        assert_eq!(session.queue_index, 0);
        assert_eq!(session.current_story_id(), Some(a.read().id));
        assert!(session.is_playing);
        assert_eq!(engine.played(), vec!["a.mp3".to_string()]);
        assert_eq!(engine.state.lock().stops, 0);
    }

    #[tokio::test]
    async fn test_failed_queue_setup_leaves_queue_off() {
        let (coordinator, engine, repo) = coordinator();
        repo.failing.lock().push("bad".to_string());

        let err = coordinator
            .setup_queue(vec![stale_story("bad"), story("good")], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, PlaybackError::AudioGeneration(_)));

        let session = coordinator.session();
        assert!(!session.is_queue_mode);
        assert!(session.queue.is_empty());
        assert!(session.current_story.is_none());
        assert!(engine.played().is_empty());
    }

    #[tokio::test]
    async fn test_previous_outside_queue_restarts() {
        let (coordinator, engine, _) = coordinator();
        coordinator.play(story("s1")).await.unwrap();
        engine.set_position(1.0);
        coordinator.pause();

        coordinator.play_previous().await.unwrap();

        assert_eq!(engine.current_time(), 0.0);
        assert!(coordinator.session().is_playing);
        assert_eq!(engine.played().len(), 1);
    }

    #[tokio::test]
    async fn test_next_is_noop_at_end_and_outside_queue() {
        let (coordinator, engine, _) = coordinator();
        queue_at_index_two(&coordinator).await;
        coordinator.play_next().await.unwrap();
        assert_eq!(coordinator.session().queue_index, 2);
        assert_eq!(engine.played().len(), 1);

        coordinator.setup_queue(vec![story("a"), story("b")], 0).await.unwrap();
        coordinator.play_next().await.unwrap();
        assert_eq!(coordinator.session().queue_index, 1);
        assert_eq!(engine.played().last().map(String::as_str), Some("b.mp3"));

        coordinator.clear_queue();
        coordinator.play_next().await.unwrap();
        assert!(!coordinator.session().is_queue_mode);
        assert_eq!(engine.played().last().map(String::as_str), Some("b.mp3"));
    }

    #[tokio::test]
    async fn test_setup_queue_validates_input() {
        let (coordinator, _, _) = coordinator();
        assert!(matches!(
            coordinator.setup_queue(Vec::new(), 0).await,
            Err(PlaybackError::EmptyQueue)
        ));
        assert!(matches!(
            coordinator.setup_queue(vec![story("a")], 1).await,
            Err(PlaybackError::QueueIndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_drives_carousel_in_auto_mode() {
        let (coordinator, engine, _) = coordinator();
        coordinator.play(story("s1")).await.unwrap();
        assert_eq!(coordinator.sync_state().active_index, Some(0));

        engine.set_position(6.0);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(coordinator.session().current_time, 6.0);
        assert_eq!(coordinator.sync_state().active_index, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_move_holds_until_seek() {
        let (coordinator, engine, _) = coordinator();
        coordinator.play(story("s1")).await.unwrap();

        coordinator.move_to_index(2).unwrap();
        engine.set_position(1.0);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let state = coordinator.sync_state();
        assert_eq!(state.mode, SyncMode::Manual);
        assert_eq!(state.active_index, Some(2));

        coordinator.seek(6.0).unwrap();
        let state = coordinator.sync_state();
        assert_eq!(state.mode, SyncMode::Auto);
        assert_eq!(state.active_index, Some(1));

        assert!(matches!(
            coordinator.move_to_index(9),
            Err(PlaybackError::IllustrationOutOfRange { index: 9, len: 3 })
        ));
    }

    #[tokio::test]
    async fn test_skip_to_illustration_seeks_to_scene() {
        let (coordinator, engine, _) = coordinator();
        let s = story("s1");
        coordinator.play(s.clone()).await.unwrap();
        let target = s.read().illustrations[2].id;

        coordinator.skip_to_illustration(target).unwrap();

        assert_eq!(engine.current_time(), 12.0);
        let state = coordinator.sync_state();
        assert_eq!(state.mode, SyncMode::Auto);
        assert_eq!(state.active_index, Some(2));
        assert!(matches!(
            coordinator.move_to_illustration(Uuid::new_v4()),
            Err(PlaybackError::IllustrationNotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_end_advances_queue() {
        let (coordinator, engine, _) = coordinator();
        let mut events = coordinator.subscribe_events();
        coordinator
            .setup_queue(vec![story("a"), story("b")], 0)
            .await
            .unwrap();

        engine.finish_track();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(coordinator.session().queue_index, 1);
        assert_eq!(engine.played(), vec!["a.mp3".to_string(), "b.mp3".to_string()]);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], PlaybackEvent::StoryStarted { .. }));
        assert!(matches!(seen[1], PlaybackEvent::TrackFinished { .. }));
        assert!(matches!(seen[2], PlaybackEvent::StoryStarted { .. }));

        engine.finish_track();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(PlaybackEvent::QueueFinished));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_when_paused() {
        let (coordinator, engine, _) = coordinator();
        coordinator.play(story("s1")).await.unwrap();
        engine.pause();
        engine.set_position(4.0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!coordinator.session().is_playing);

        engine.set_position(30.0);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(coordinator.session().current_time, 4.0);
    }
}
