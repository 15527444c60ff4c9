//! Core profiler runtime shared by every embedding surface: components
//! A through E, G through J of the profiler's architecture. `systrace-pyhook`
//! and `systrace-interposer` link this crate and translate their own
//! call/return/allocation events into calls on [`manager::Manager`].

pub mod barrier;
pub mod dump;
pub mod env;
pub mod error;
pub mod manager;
pub mod pool;
pub mod profile_engine;
pub mod sdk;
pub mod stage;
pub mod tag;

pub use manager::Manager;
pub use profile_engine::Profiler;
