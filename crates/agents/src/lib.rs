//! The four social transducers: Opinion, Stance, Knowledge, Reputation.
//!
//! Each wraps one LLM call behind strict templates.  A disabled agent
//! returns its neutral constant without any I/O; the `test` provider
//! returns a deterministic sample so simulations replay exactly.

pub mod format;
pub mod knowledge;
pub mod opinion;
pub mod reputation;
pub mod stance;

use std::time::Duration;

use folksim_llm::stable_hash;

pub use knowledge::{KnowledgeAgent, KnowledgeInput};
pub use opinion::{OpinionAgent, OpinionInput};
pub use reputation::{ReputationAgent, ReputationInput};
pub use stance::{StanceAgent, StanceInput};

/// Neutral constant returned by disabled Opinion/Stance/Reputation agents.
pub const NEUTRAL: &str = "Neutral";

pub(crate) const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Stable sample choice for the `test` provider.
pub(crate) fn pick<'a>(samples: &[&'a str], seed: &str) -> &'a str {
    samples[(stable_hash(seed) as usize) % samples.len()]
}

/// Reply clean-up shared by the word-valued agents: first line only, at most
/// `max_words` words.
pub(crate) fn clamp_words(reply: &str, max_words: usize) -> String {
    let first_line = reply.trim().lines().next().unwrap_or("").trim();
    let words: Vec<&str> = first_line.split_whitespace().collect();
    if words.len() > max_words {
        words[..max_words].join(" ")
    } else {
        first_line.to_string()
    }
}

/// The full transducer set handed to the dialogue engine.
#[derive(Clone)]
pub struct SocialAgents {
    pub opinion: OpinionAgent,
    pub stance: StanceAgent,
    pub knowledge: KnowledgeAgent,
    pub reputation: ReputationAgent,
}
