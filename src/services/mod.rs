pub mod background;
pub mod engine;
pub mod generation;
pub mod http_repository;
pub mod illustration_sync;
pub mod network;
pub mod playback;
pub mod repository;
