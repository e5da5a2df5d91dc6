pub mod period;
pub mod settings;

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use period::TimePeriod;
pub use settings::{CharacterSpec, GameSettings, SpeechStyle, WorldSettings};

/// Provider + model pair for one agent role.
///
/// The provider string is parsed by the llm crate; recognized values are
/// `test`, `ollama` and `openrouter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentLlm {
    pub provider: String,
    pub model: String,
}

impl Default for AgentLlm {
    fn default() -> Self {
        Self {
            provider: "test".to_string(),
            model: "test".to_string(),
        }
    }
}

/// LLM routing: one default selection, optional per-agent overrides and an
/// ordered fallback chain shared by every caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmSettings {
    pub default: AgentLlm,
    /// Tried in order after the primary selection fails.
    pub fallbacks: Vec<AgentLlm>,
    /// Returned instead of an error when every provider fails and the
    /// process is non-interactive.
    pub fallback_text: Option<String>,
    pub agents: AgentOverrides,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            default: AgentLlm::default(),
            fallbacks: Vec::new(),
            fallback_text: Some("I need to go now. Goodbye!".to_string()),
            agents: AgentOverrides::default(),
        }
    }
}

/// Per-agent LLM overrides. A `None` falls back to [`LlmSettings::default`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentOverrides {
    pub npc: Option<AgentLlm>,
    pub opinion: Option<AgentLlm>,
    pub stance: Option<AgentLlm>,
    pub knowledge: Option<AgentLlm>,
    pub reputation: Option<AgentLlm>,
    pub lifecycle: Option<AgentLlm>,
    pub schedule: Option<AgentLlm>,
    pub summarizer: Option<AgentLlm>,
}

impl LlmSettings {
    pub fn for_agent(&self, agent: AgentRole) -> &AgentLlm {
        let slot = match agent {
            AgentRole::Npc => &self.agents.npc,
            AgentRole::Opinion => &self.agents.opinion,
            AgentRole::Stance => &self.agents.stance,
            AgentRole::Knowledge => &self.agents.knowledge,
            AgentRole::Reputation => &self.agents.reputation,
            AgentRole::Lifecycle => &self.agents.lifecycle,
            AgentRole::Schedule => &self.agents.schedule,
            AgentRole::Summarizer => &self.agents.summarizer,
        };
        slot.as_ref().unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Npc,
    Opinion,
    Stance,
    Knowledge,
    Reputation,
    Lifecycle,
    Schedule,
    Summarizer,
}

/// Memory buffer sizing. The character threshold for every rolling summary
/// is the token budget converted to characters and bounded at 80% of the
/// product, so summaries always leave prompt headroom.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemorySettings {
    pub summary_token_budget: usize,
    pub avg_chars_per_token: f64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            summary_token_budget: 1250,
            avg_chars_per_token: 4.0,
        }
    }
}

impl MemorySettings {
    pub fn max_context_length(&self) -> usize {
        let chars = self.summary_token_budget as f64 * self.avg_chars_per_token;
        (chars * 0.8) as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DialogueSettings {
    pub max_messages_per_dialogue: u32,
    pub max_tokens_per_dialogue: u32,
    pub goodbye_threshold: u32,
    pub message_timeout_seconds: u64,
    pub reputation_update_timeout_seconds: u64,
    /// Pacing delay between turns.
    pub turn_delay_ms: u64,
}

impl Default for DialogueSettings {
    fn default() -> Self {
        Self {
            max_messages_per_dialogue: 10,
            max_tokens_per_dialogue: 2000,
            goodbye_threshold: 2,
            message_timeout_seconds: 60,
            reputation_update_timeout_seconds: 20,
            turn_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationSettings {
    pub opinion_enabled: bool,
    pub stance_enabled: bool,
    pub knowledge_enabled: bool,
    pub reputation_enabled: bool,
    /// Ordered subset of the period enum for each simulated day.  When unset
    /// the world calendar (or the full enum) is used.
    pub time_periods: Option<Vec<TimePeriod>>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            opinion_enabled: true,
            stance_enabled: true,
            knowledge_enabled: true,
            reputation_enabled: true,
            time_periods: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    pub llm: LlmSettings,
    pub memory: MemorySettings,
    pub dialogue: DialogueSettings,
    pub simulation: SimulationSettings,
}

impl SimConfig {
    /// Load from a TOML file; a missing file yields the defaults.  Unknown
    /// keys anywhere in the document are an error, not a warning.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() && config.llm.default.provider == "test" {
                config.llm.default.provider = "ollama".to_string();
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_dialogue_contract() {
        let config = SimConfig::default();
        assert_eq!(config.dialogue.max_messages_per_dialogue, 10);
        assert_eq!(config.dialogue.max_tokens_per_dialogue, 2000);
        assert_eq!(config.dialogue.goodbye_threshold, 2);
        assert_eq!(config.dialogue.message_timeout_seconds, 60);
        assert_eq!(config.dialogue.reputation_update_timeout_seconds, 20);
    }

    #[test]
    fn max_context_length_is_eighty_percent_of_char_budget() {
        let memory = MemorySettings {
            summary_token_budget: 1000,
            avg_chars_per_token: 4.0,
        };
        assert_eq!(memory.max_context_length(), 3200);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = "[dialogue]\nmax_messages_per_dialogue = 4\nmax_mesages = 9\n";
        let parsed = toml::from_str::<SimConfig>(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn per_agent_override_falls_back_to_default() {
        let raw = r#"
[llm.default]
provider = "openrouter"
model = "meta-llama/llama-3-8b-instruct"

[llm.agents.reputation]
provider = "ollama"
model = "qwen2.5:7b"
"#;
        let config: SimConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.llm.for_agent(AgentRole::Reputation).provider, "ollama");
        assert_eq!(
            config.llm.for_agent(AgentRole::Npc).provider,
            "openrouter"
        );
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config = SimConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let back: SimConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(
            back.dialogue.max_messages_per_dialogue,
            config.dialogue.max_messages_per_dialogue
        );
        assert_eq!(back.llm.default, config.llm.default);
    }
}
