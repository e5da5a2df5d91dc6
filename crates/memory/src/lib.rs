//! Rolling memory summaries at three granularities (per NPC, per session,
//! per day) with background compression, plus the ephemeral per-partner
//! conversation contexts.

pub mod service;
pub mod summarize;

pub use service::{MemoryService, SummaryKey};
