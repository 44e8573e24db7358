use crate::core::error::ContentError;
use crate::core::model::SharedStory;
use std::fmt;

pub const PROGRESS_STORY_STARTED: f64 = 0.10;
pub const PROGRESS_STORY_DONE: f64 = 0.33;
pub const PROGRESS_AUDIO_DONE: f64 = 0.66;
pub const PROGRESS_COMPLETE: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    Story,
    Audio,
    Illustrations,
}

impl Step {
    /// Whether a failed step can be re-run in place with the upstream artifacts.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Step::Story)
    }

    pub fn is_optional(self) -> bool {
        matches!(self, Step::Illustrations)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Story => "story",
            Step::Audio => "audio",
            Step::Illustrations => "illustrations",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stage {
    Idle,
    Running(Step),
    Completed,
    Failed { step: Step, error: ContentError },
}

impl Stage {
    pub fn is_running(&self) -> bool {
        matches!(self, Stage::Running(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed { .. })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Idle => f.write_str("idle"),
            Stage::Running(step) => write!(f, "generating {}", step),
            Stage::Completed => f.write_str("completed"),
            Stage::Failed { step, error } => write!(f, "{} failed: {}", step, error),
        }
    }
}

/// Snapshot of one run of the generation pipeline.
#[derive(Clone, Debug)]
pub struct GenerationSession {
    pub id: u64,
    pub stage: Stage,
    pub progress: f64,
    pub story: Option<SharedStory>,
}

impl GenerationSession {
    pub fn idle() -> Self {
        Self {
            id: 0,
            stage: Stage::Idle,
            progress: 0.0,
            story: None,
        }
    }

    pub fn last_failed_step(&self) -> Option<Step> {
        match &self.stage {
            Stage::Failed { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ContentError> {
        match &self.stage {
            Stage::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.last_failed_step().is_some_and(Step::is_retryable)
    }

    pub fn can_skip(&self) -> bool {
        self.last_failed_step().is_some_and(Step::is_optional)
    }
}

impl Default for GenerationSession {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    fn failed(step: Step) -> GenerationSession {
        GenerationSession {
            stage: Stage::Failed {
                step,
                error: ContentError::from_kind(ErrorKind::ServerError),
            },
            ..GenerationSession::idle()
        }
    }

    #[test]
    fn test_failure_table() {
        let story = failed(Step::Story);
        assert!(!story.can_retry());
        assert!(!story.can_skip());

        let audio = failed(Step::Audio);
        assert!(audio.can_retry());
        assert!(!audio.can_skip());

        let illustrations = failed(Step::Illustrations);
        assert!(illustrations.can_retry());
        assert!(illustrations.can_skip());
    }

    #[test]
    fn test_last_failed_step_only_when_failed() {
        let mut session = GenerationSession::idle();
        assert_eq!(session.last_failed_step(), None);
        session.stage = Stage::Running(Step::Audio);
        assert_eq!(session.last_failed_step(), None);
        session.stage = Stage::Completed;
        assert_eq!(session.last_failed_step(), None);
        assert_eq!(failed(Step::Audio).last_failed_step(), Some(Step::Audio));
    }
}
