//! Opinion: one observer's one-or-two-word judgement of a speaker, formed
//! from the incoming message and the recent turns.

use tracing::debug;

use folksim_llm::{CompletionClient, LlmError, LlmSelection, ProviderKind};

use crate::format::safe_format;
use crate::{DEFAULT_AGENT_TIMEOUT, NEUTRAL, pick};

const SYSTEM_TEMPLATE: &str = include_str!("../templates/opinion_system.txt");
const USER_TEMPLATE: &str = include_str!("../templates/opinion_user.txt");

const TEST_SAMPLES: &[&str] = &["trustworthy", "suspicious", "friendly", "hostile", "neutral"];

pub struct OpinionInput<'a> {
    pub observer: &'a str,
    pub personality: &'a str,
    pub story: &'a str,
    /// Who the opinion is about: the sender of the incoming message.
    pub recipient: &'a str,
    pub incoming_message: &'a str,
    /// Compact recent-turn context; falls back to the incoming message.
    pub recent_dialogue: &'a str,
    pub recipient_reputation: Option<&'a str>,
}

#[derive(Clone)]
pub struct OpinionAgent {
    llm: CompletionClient,
    selection: LlmSelection,
    enabled: bool,
    system_template: String,
    user_template: String,
}

impl OpinionAgent {
    pub fn new(llm: CompletionClient, selection: LlmSelection, enabled: bool) -> Self {
        Self {
            llm,
            selection,
            enabled,
            system_template: SYSTEM_TEMPLATE.to_string(),
            user_template: USER_TEMPLATE.to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn generate_opinion(&self, input: OpinionInput<'_>) -> Result<String, LlmError> {
        if !self.enabled {
            return Ok(NEUTRAL.to_string());
        }
        if self.selection.provider == ProviderKind::Test {
            let seed = format!("opinion|{}|{}", input.observer, input.recipient);
            return Ok(pick(TEST_SAMPLES, &seed).to_string());
        }

        let system = safe_format(
            &self.system_template,
            &[
                ("name", input.observer),
                ("personality", input.personality),
                ("story", input.story),
            ],
        );

        let dialogue = if input.recent_dialogue.is_empty() {
            input.incoming_message
        } else {
            input.recent_dialogue
        };
        let reputation_line = input
            .recipient_reputation
            .map(|r| format!("Reputation: {r}"))
            .unwrap_or_default();
        let user = safe_format(
            &self.user_template,
            &[
                ("name", input.observer),
                ("personality", input.personality),
                ("story", input.story),
                ("recipient", input.recipient),
                ("incoming_message", input.incoming_message),
                ("dialogue", dialogue),
                ("recipient_reputation", &reputation_line),
            ],
        );

        let reply = self
            .llm
            .call(&self.selection, &system, &user, 0.2, DEFAULT_AGENT_TIMEOUT)
            .await?;
        let opinion = crate::clamp_words(&reply, 2);
        debug!(observer = input.observer, recipient = input.recipient, %opinion, "opinion formed");
        Ok(opinion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use folksim_llm::testing::ScriptedBackend;

    fn input<'a>() -> OpinionInput<'a> {
        OpinionInput {
            observer: "Elara",
            personality: "warm, sharp-eared",
            story: "runs the tavern",
            recipient: "Grak",
            incoming_message: "The forge fire went out again.",
            recent_dialogue: "Grak: The forge fire went out again.",
            recipient_reputation: Some("gruff"),
        }
    }

    #[tokio::test]
    async fn disabled_agent_is_neutral_without_io() {
        let backend = Arc::new(ScriptedBackend::default_reply("unused"));
        let agent = OpinionAgent::new(
            CompletionClient::new(backend.clone()),
            LlmSelection::test(),
            false,
        );
        assert_eq!(agent.generate_opinion(input()).await.unwrap(), NEUTRAL);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_is_deterministic_per_pair() {
        let backend = Arc::new(ScriptedBackend::default_reply("unused"));
        let agent = OpinionAgent::new(
            CompletionClient::new(backend.clone()),
            LlmSelection::test(),
            true,
        );
        let first = agent.generate_opinion(input()).await.unwrap();
        let second = agent.generate_opinion(input()).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn prompts_carry_persona_and_context() {
        let backend = Arc::new(ScriptedBackend::default_reply("wary"));
        let agent = OpinionAgent::new(
            CompletionClient::new(backend.clone()),
            LlmSelection::parse("ollama", "qwen2.5:7b").unwrap(),
            true,
        );
        let opinion = agent.generate_opinion(input()).await.unwrap();
        assert_eq!(opinion, "wary");

        let (system, user) = backend.requests().remove(0);
        assert!(system.contains("You are Elara"));
        assert!(system.contains("runs the tavern"));
        assert!(user.contains("Grak has just spoken to you."));
        assert!(user.contains("Reputation: gruff"));
        assert!(user.contains("The forge fire went out again."));
    }

    #[tokio::test]
    async fn verbose_reply_is_clamped_to_two_words() {
        let backend = Arc::new(ScriptedBackend::default_reply(
            "deeply suspicious of that smith",
        ));
        let agent = OpinionAgent::new(
            CompletionClient::new(backend),
            LlmSelection::parse("ollama", "m").unwrap(),
            true,
        );
        assert_eq!(
            agent.generate_opinion(input()).await.unwrap(),
            "deeply suspicious"
        );
    }
}
