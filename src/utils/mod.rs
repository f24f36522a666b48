//! Small helpers shared across the engine's components

pub mod time;

pub use time::deadline_after;
