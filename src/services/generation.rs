//! Story → audio → illustrations pipeline.
//!
//! One session at a time. Each stage runs only after the previous stage's
//! artifact is attached to the shared story. A failed stage leaves every
//! upstream artifact in place so that it can be retried (audio,
//! illustrations) or skipped (illustrations) without re-running the stages
//! before it.

use crate::core::error::{ContentError, ErrorKind, GenerationError};
use crate::core::model::{GenerationRequest, Illustration, SharedStory, Story};
use crate::core::session::{
    GenerationSession, Stage, Step, PROGRESS_AUDIO_DONE, PROGRESS_COMPLETE, PROGRESS_STORY_DONE,
    PROGRESS_STORY_STARTED,
};
use crate::services::background::{BackgroundTaskGuard, BackgroundTaskProvider};
use crate::services::network::{AssumeOnline, NetworkMonitor};
use crate::services::repository::ContentRepository;
use futures_util::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const BACKGROUND_TASK_NAME: &str = "story-generation";
const MAX_CONCURRENT_ILLUSTRATION_RETRIES: usize = 3;

/// Outcome of a bulk illustration retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IllustrationRetrySummary {
    pub regenerated: usize,
    pub still_failed: usize,
}

struct ActiveRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    repository: Arc<dyn ContentRepository>,
    background: Arc<dyn BackgroundTaskProvider>,
    network: Arc<dyn NetworkMonitor>,
    session: watch::Sender<GenerationSession>,
    request: Mutex<Option<GenerationRequest>>,
    run: Mutex<Option<ActiveRun>>,
    next_session_id: AtomicU64,
}

#[derive(Clone)]
pub struct GenerationCoordinator {
    inner: Arc<Inner>,
}

impl GenerationCoordinator {
    pub fn new(
        repository: Arc<dyn ContentRepository>,
        background: Arc<dyn BackgroundTaskProvider>,
    ) -> Self {
        Self::with_network_monitor(repository, background, Arc::new(AssumeOnline))
    }

    pub fn with_network_monitor(
        repository: Arc<dyn ContentRepository>,
        background: Arc<dyn BackgroundTaskProvider>,
        network: Arc<dyn NetworkMonitor>,
    ) -> Self {
        let (session, _) = watch::channel(GenerationSession::idle());
        Self {
            inner: Arc::new(Inner {
                repository,
                background,
                network,
                session,
                request: Mutex::new(None),
                run: Mutex::new(None),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn session(&self) -> GenerationSession {
        self.inner.session.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GenerationSession> {
        self.inner.session.subscribe()
    }

    /// Resolves once the session is no longer running.
    pub async fn wait_until_settled(&self) -> GenerationSession {
        let mut rx = self.inner.session.subscribe();
        let settled = match rx.wait_for(|s| !s.stage.is_running()).await {
            Ok(session) => session.clone(),
            Err(_) => self.session(),
        };
        settled
    }

    /// Begins a new session. Rejected while another session is running.
    pub fn start(&self, request: GenerationRequest) -> Result<GenerationSession, GenerationError> {
        let mut run = self.inner.run.lock();
        if self.inner.session.borrow().stage.is_running() {
            return Err(GenerationError::SessionAlreadyActive);
        }
        self.ensure_online()?;

        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        info!(
            "Starting story generation {} for hero {} ({})",
            id, request.hero.name, request.event.event
        );
        let session = GenerationSession {
            id,
            stage: Stage::Running(Step::Story),
            progress: PROGRESS_STORY_STARTED,
            story: None,
        };
        self.inner.session.send_replace(session.clone());
        *self.inner.request.lock() = Some(request.clone());
        *run = Some(self.spawn(id, request, Step::Story, None));
        Ok(session)
    }

    /// Re-runs a failed stage with the artifacts already produced, then
    /// continues with the stages after it.
    pub fn retry_stage(&self, step: Step) -> Result<GenerationSession, GenerationError> {
        let mut run = self.inner.run.lock();
        let current = self.session();
        if current.stage.is_running() {
            return Err(GenerationError::SessionAlreadyActive);
        }
        if !step.is_retryable() {
            return Err(GenerationError::StageNotRetryable(step));
        }
        if current.last_failed_step() != Some(step) {
            return Err(GenerationError::StageMismatch {
                requested: step,
                actual: current.stage.to_string(),
            });
        }
        self.ensure_online()?;

        let request = self
            .inner
            .request
            .lock()
            .clone()
            .ok_or(GenerationError::NoSession)?;
        let story = current.story.clone().ok_or(GenerationError::NoSession)?;

        info!("Retrying {} stage of session {}", step, current.id);
        let session = GenerationSession {
            stage: Stage::Running(step),
            ..current
        };
        self.inner.session.send_replace(session.clone());
        *run = Some(self.spawn(session.id, request, step, Some(story)));
        Ok(session)
    }

    /// Completes a session whose optional illustration stage failed, keeping
    /// the story and its audio.
    pub fn skip_stage(&self, step: Step) -> Result<GenerationSession, GenerationError> {
        let _run = self.inner.run.lock();
        if !step.is_optional() {
            return Err(GenerationError::StageNotSkippable(step));
        }
        let current = self.session();
        if current.last_failed_step() != Some(step) {
            return Err(GenerationError::StageMismatch {
                requested: step,
                actual: current.stage.to_string(),
            });
        }

        info!("Skipping {} stage of session {}", step, current.id);
        let session = GenerationSession {
            stage: Stage::Completed,
            progress: PROGRESS_COMPLETE,
            ..current
        };
        self.inner.session.send_replace(session.clone());
        Ok(session)
    }

    /// Abandons the running stage. The background token and idle hold are
    /// released before this returns.
    pub async fn cancel(&self) {
        let active = self.inner.run.lock().take();
        let Some(active) = active else {
            return;
        };
        active.cancel.cancel();
        let was_running = self.inner.session.send_if_modified(|s| {
            if !s.stage.is_running() {
                return false;
            }
            *s = GenerationSession::idle();
            true
        });
        if was_running {
            info!("Story generation cancelled");
        }
        if let Err(e) = active.handle.await {
            warn!("Generation task ended abnormally: {}", e);
        }
    }

    /// Resets a settled session back to idle.
    pub fn clear(&self) -> Result<(), GenerationError> {
        let mut run = self.inner.run.lock();
        if self.inner.session.borrow().stage.is_running() {
            return Err(GenerationError::SessionAlreadyActive);
        }
        *run = None;
        *self.inner.request.lock() = None;
        self.inner.session.send_replace(GenerationSession::idle());
        Ok(())
    }

    /// Replaces the story text and pushes it to the backend. The narration
    /// is flagged for regeneration.
    pub async fn edit_story_content(
        &self,
        story: &SharedStory,
        content: &str,
    ) -> Result<(), GenerationError> {
        self.ensure_online()?;
        let snapshot = {
            let mut guard = story.write();
            guard.set_content(content);
            guard.clone()
        };
        self.inner
            .repository
            .update_story(&snapshot)
            .await
            .map_err(|e| ContentError::classify(&e))?;
        Ok(())
    }

    pub async fn delete_story(&self, story: &SharedStory) -> Result<(), GenerationError> {
        self.ensure_online()?;
        let story_id = backend_id(&story.read())?;
        self.inner
            .repository
            .delete_story(&story_id)
            .await
            .map_err(|e| ContentError::classify(&e))?;
        info!("Deleted story {}", story_id);
        Ok(())
    }

    /// Regenerates one scene in place. The illustration keeps its position
    /// whatever the outcome.
    pub async fn retry_illustration(
        &self,
        story: &SharedStory,
        display_order: u32,
    ) -> Result<Illustration, GenerationError> {
        self.ensure_online()?;
        let story_id = {
            let guard = story.read();
            if !guard
                .illustrations
                .iter()
                .any(|i| i.display_order == display_order)
            {
                return Err(GenerationError::IllustrationNotFound(display_order));
            }
            backend_id(&guard)?
        };

        let result = self
            .inner
            .repository
            .regenerate_illustration(&story_id, display_order)
            .await;

        let mut guard = story.write();
        let illustration = guard
            .illustration_mut(display_order)
            .ok_or(GenerationError::IllustrationNotFound(display_order))?;
        illustration.retry_count += 1;
        match result {
            Ok(fresh) => {
                illustration.apply_regenerated(&fresh);
                debug!(
                    "Illustration {} of {} regenerated ({:?})",
                    display_order, story_id, illustration.generation_status
                );
                Ok(illustration.clone())
            }
            Err(e) => {
                let error = ContentError::classify(&e);
                warn!(
                    "Illustration {} of {} failed again: {}",
                    display_order, story_id, error
                );
                illustration.mark_failed(error.kind.clone());
                Err(error.into())
            }
        }
    }

    /// Retries every scene currently marked as failed.
    pub async fn retry_failed_illustrations(
        &self,
        story: &SharedStory,
    ) -> Result<IllustrationRetrySummary, GenerationError> {
        self.ensure_online()?;
        let failed = story.read().failed_illustrations();
        if failed.is_empty() {
            return Ok(IllustrationRetrySummary::default());
        }
        info!("Retrying {} failed illustrations", failed.len());

        let results: Vec<Result<Illustration, GenerationError>> = futures_util::stream::iter(failed)
            .map(|order| self.retry_illustration(story, order))
            .buffer_unordered(MAX_CONCURRENT_ILLUSTRATION_RETRIES)
            .collect()
            .await;

        let mut summary = IllustrationRetrySummary::default();
        for result in results {
            match result {
                Ok(illustration) if !illustration.is_failed() => summary.regenerated += 1,
                _ => summary.still_failed += 1,
            }
        }
        Ok(summary)
    }

    fn ensure_online(&self) -> Result<(), GenerationError> {
        if self.inner.network.is_online() {
            Ok(())
        } else {
            warn!("Network unavailable, not contacting the content backend");
            Err(ContentError::network_unavailable().into())
        }
    }

    fn spawn(
        &self,
        id: u64,
        request: GenerationRequest,
        from: Step,
        story: Option<SharedStory>,
    ) -> ActiveRun {
        let cancel = CancellationToken::new();
        let on_expire = cancel.clone();
        let guard = BackgroundTaskGuard::acquire(
            self.inner.background.clone(),
            BACKGROUND_TASK_NAME,
            Box::new(move || {
                warn!("Background time expired, cancelling story generation");
                on_expire.cancel();
            }),
        );

        let pipeline = Pipeline {
            inner: self.inner.clone(),
            id,
            request,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = pipeline.cancel.cancelled() => None,
                stage = pipeline.run(from, story) => Some(stage),
            };
            drop(guard);
            match outcome {
                Some(stage) => pipeline.finish(stage),
                None => pipeline.abandon(),
            }
        });
        ActiveRun { cancel, handle }
    }
}

fn backend_id(story: &Story) -> Result<String, ContentError> {
    story
        .backend_id
        .clone()
        .ok_or_else(|| ContentError::invariant(format!("Story {} has no backend id", story.id)))
}

/// One spawned run of the pipeline, starting at a given stage.
struct Pipeline {
    inner: Arc<Inner>,
    id: u64,
    request: GenerationRequest,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn run(&self, from: Step, existing: Option<SharedStory>) -> Stage {
        let story = match (from, existing) {
            (Step::Story, _) => match self.generate_story().await {
                Ok(story) => story,
                Err(error) => return self.failed(Step::Story, error),
            },
            (_, Some(story)) => story,
            (step, None) => {
                return self.failed(step, ContentError::invariant("No story to resume from"))
            }
        };

        if from != Step::Illustrations {
            if let Err(error) = self.generate_audio(&story).await {
                return self.failed(Step::Audio, error);
            }
        }

        if self.request.wants_illustrations() {
            if let Err(error) = self.generate_illustrations(&story).await {
                return self.failed(Step::Illustrations, error);
            }
        } else {
            debug!("Illustrations not requested or hero has no avatar, skipping");
        }

        Stage::Completed
    }

    async fn generate_story(&self) -> Result<SharedStory, ContentError> {
        self.update(|s| {
            s.stage = Stage::Running(Step::Story);
            s.progress = PROGRESS_STORY_STARTED;
        });
        let request = &self.request;
        let story = self
            .inner
            .repository
            .generate_story(&request.hero, &request.event, &request.language)
            .await
            .map_err(|e| ContentError::classify(&e))?;

        if story.content.trim().is_empty() {
            return Err(ContentError::new(
                ErrorKind::DecodingError,
                "The backend returned a story without text",
            ));
        }
        backend_id(&story)?;
        info!("Story \"{}\" generated", story.title);

        let story = story.into_shared();
        self.update(|s| {
            s.story = Some(story.clone());
            s.progress = PROGRESS_STORY_DONE;
        });
        Ok(story)
    }

    async fn generate_audio(&self, story: &SharedStory) -> Result<(), ContentError> {
        self.update(|s| s.stage = Stage::Running(Step::Audio));
        let (story_id, revision) = {
            let guard = story.read();
            (backend_id(&guard)?, guard.content_revision())
        };
        let audio_ref = self
            .inner
            .repository
            .generate_audio(&story_id, &self.request.language, &self.request.voice)
            .await
            .map_err(|e| ContentError::classify(&e))?;

        info!("Narration for {} ready at {}", story_id, audio_ref);
        let mut guard = story.write();
        guard.attach_audio(audio_ref, revision);
        if guard.needs_audio_regeneration {
            warn!("Story {} was edited during narration, audio is stale", story_id);
        }
        drop(guard);
        self.update(|s| s.progress = PROGRESS_AUDIO_DONE);
        Ok(())
    }

    async fn generate_illustrations(&self, story: &SharedStory) -> Result<(), ContentError> {
        self.update(|s| s.stage = Stage::Running(Step::Illustrations));
        let story_id = {
            let guard = story.read();
            if guard.audio_ref.is_none() {
                return Err(ContentError::invariant(
                    "Illustrations requested before narration was attached",
                ));
            }
            backend_id(&guard)?
        };
        let illustrated = self
            .inner
            .repository
            .generate_illustrations(&story_id)
            .await
            .map_err(|e| ContentError::classify(&e))?;

        let count = illustrated.illustrations.len();
        story.write().set_illustrations(illustrated.illustrations);
        info!("{} illustrations generated for {}", count, story_id);
        Ok(())
    }

    fn failed(&self, step: Step, error: ContentError) -> Stage {
        warn!("Story generation failed at {} stage: {}", step, error);
        Stage::Failed { step, error }
    }

    fn finish(&self, stage: Stage) {
        if stage == Stage::Completed {
            info!("Story generation {} completed", self.id);
        }
        self.update(|s| {
            if stage == Stage::Completed {
                s.progress = PROGRESS_COMPLETE;
            }
            s.stage = stage;
        });
    }

    /// Cancelled from outside `cancel()`, i.e. by background expiry.
    fn abandon(&self) {
        let id = self.id;
        self.inner.session.send_if_modified(|s| {
            if s.id != id || !s.stage.is_running() {
                return false;
            }
            *s = GenerationSession::idle();
            true
        });
    }

    /// Writes to the session this run belongs to, unless it was cancelled.
    fn update(&self, f: impl FnOnce(&mut GenerationSession)) {
        let id = self.id;
        let cancel = &self.cancel;
        self.inner.session.send_if_modified(|s| {
            if s.id != id || cancel.is_cancelled() {
                return false;
            }
            f(s);
            true
        });
    }
}
