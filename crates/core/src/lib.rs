//! Domain rules for the render pipeline.
//!
//! Pure logic with no internal dependencies: pricing, admission limits,
//! quality scoring, perceptual hashing, review and queue state machines, and
//! the record store interfaces the other crates implement.

pub mod admission;
pub mod credits;
pub mod error;
pub mod job;
pub mod perceptual_hash;
pub mod quality;
pub mod render;
pub mod review;
pub mod scheduling;
pub mod store;
pub mod tier;
pub mod types;
