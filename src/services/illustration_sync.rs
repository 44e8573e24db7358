//! Keeps the scene carousel in step with the narration clock.
//!
//! In `Auto` mode the active scene follows playback time. A swipe or a tap on
//! a thumbnail switches to `Manual`; the next explicit seek switches back.

use crate::core::model::Illustration;
use log::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IllustrationSyncState {
    pub mode: SyncMode,
    pub active_index: Option<usize>,
}

/// Index of the last illustration whose timestamp is at or before `time`.
///
/// `illustrations` must be in display order, which also orders timestamps.
/// Returns `None` while `time` precedes the first scene.
pub fn index_for_time(time: f64, illustrations: &[Illustration]) -> Option<usize> {
    let boundary = illustrations.partition_point(|i| i.timestamp <= time);
    boundary.checked_sub(1)
}

#[derive(Debug, Default)]
pub struct IllustrationSyncEngine {
    state: IllustrationSyncState,
}

impl IllustrationSyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> IllustrationSyncState {
        self.state
    }

    pub fn mode(&self) -> SyncMode {
        self.state.mode
    }

    pub fn active_index(&self) -> Option<usize> {
        self.state.active_index
    }

    /// Recomputes the active scene from live illustration data. No-op in
    /// manual mode. Before the first scene boundary the current index is kept.
    /// Returns true when the active index changed.
    pub fn update_for_time(&mut self, time: f64, illustrations: &[Illustration]) -> bool {
        if self.state.mode == SyncMode::Manual {
            return false;
        }
        match index_for_time(time, illustrations) {
            Some(index) if self.state.active_index != Some(index) => {
                self.state.active_index = Some(index);
                true
            }
            _ => false,
        }
    }

    pub fn move_to_index(&mut self, index: usize) {
        debug!("Illustration carousel moved manually to {}", index);
        self.state.mode = SyncMode::Manual;
        self.state.active_index = Some(index);
    }

    /// Looks the illustration up by identity. Returns the index it moved to.
    pub fn move_to_illustration(
        &mut self,
        id: Uuid,
        illustrations: &[Illustration],
    ) -> Option<usize> {
        let index = illustrations.iter().position(|i| i.id == id)?;
        self.move_to_index(index);
        Some(index)
    }

    /// Called on every explicit seek.
    pub fn resume_auto(&mut self) {
        self.state.mode = SyncMode::Auto;
    }

    /// Fresh state for a newly loaded story.
    pub fn reset(&mut self) {
        self.state = IllustrationSyncState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenes(timestamps: &[f64]) -> Vec<Illustration> {
        timestamps
            .iter()
            .enumerate()
            .map(|(i, t)| Illustration::new(i as u32, *t))
            .collect()
    }

    #[test]
    fn test_index_for_time() {
        let illustrations = scenes(&[0.0, 5.0, 12.0]);
        assert_eq!(index_for_time(0.0, &illustrations), Some(0));
        assert_eq!(index_for_time(4.9, &illustrations), Some(0));
        assert_eq!(index_for_time(5.0, &illustrations), Some(1));
        assert_eq!(index_for_time(11.99, &illustrations), Some(1));
        assert_eq!(index_for_time(20.0, &illustrations), Some(2));
    }

    #[test]
    fn test_index_before_first_scene_is_none() {
        let illustrations = scenes(&[3.0, 8.0]);
        assert_eq!(index_for_time(1.0, &illustrations), None);
        assert_eq!(index_for_time(0.0, &[]), None);
    }

    #[test]
    fn test_equal_timestamps_pick_last() {
        let illustrations = scenes(&[0.0, 4.0, 4.0, 9.0]);
        assert_eq!(index_for_time(4.0, &illustrations), Some(2));
    }

    #[test]
    fn test_auto_mode_keeps_index_before_first_boundary() {
        let illustrations = scenes(&[2.0, 6.0]);
        let mut engine = IllustrationSyncEngine::new();
        assert!(!engine.update_for_time(1.0, &illustrations));
        assert_eq!(engine.active_index(), None);

        assert!(engine.update_for_time(6.5, &illustrations));
        assert_eq!(engine.active_index(), Some(1));
        assert!(!engine.update_for_time(7.0, &illustrations));
    }

    #[test]
    fn test_manual_mode_ignores_time_until_resumed() {
        let illustrations = scenes(&[0.0, 5.0, 12.0]);
        let mut engine = IllustrationSyncEngine::new();
        engine.update_for_time(6.0, &illustrations);
        assert_eq!(engine.active_index(), Some(1));

        engine.move_to_index(2);
        assert_eq!(engine.mode(), SyncMode::Manual);
        assert!(!engine.update_for_time(1.0, &illustrations));
        assert_eq!(engine.active_index(), Some(2));

        engine.resume_auto();
        engine.update_for_time(1.0, &illustrations);
        assert_eq!(engine.active_index(), Some(0));
    }

    #[test]
    fn test_move_to_illustration_by_identity() {
        let illustrations = scenes(&[0.0, 5.0, 12.0]);
        let mut engine = IllustrationSyncEngine::new();
        let target = illustrations[1].id;
        assert_eq!(engine.move_to_illustration(target, &illustrations), Some(1));
        assert_eq!(engine.state().mode, SyncMode::Manual);

        assert_eq!(engine.move_to_illustration(Uuid::new_v4(), &illustrations), None);
        assert_eq!(engine.active_index(), Some(1));
    }
}
