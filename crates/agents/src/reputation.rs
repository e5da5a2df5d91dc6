//! Reputation: a one-or-two-word label for how the world sees a character,
//! distilled from every opinion held about them plus recent dialogue.

use std::collections::BTreeMap;

use tracing::debug;

use folksim_llm::{CompletionClient, LlmError, LlmSelection, ProviderKind};

use crate::format::safe_format;
use crate::{DEFAULT_AGENT_TIMEOUT, NEUTRAL, clamp_words, pick};

const SYSTEM_TEMPLATE: &str = include_str!("../templates/reputation_system.txt");
const USER_TEMPLATE: &str = include_str!("../templates/reputation_user.txt");

const TEST_SAMPLES: &[&str] = &[
    "neutral",
    "trusted",
    "loose cannon",
    "scheming",
    "honorable",
    "hot-headed",
    "shrewd",
    "benevolent",
    "cautious",
    "brash",
];

pub struct ReputationInput<'a> {
    pub character: &'a str,
    pub world_definition: &'a str,
    /// Opinions held about the character, keyed by holder.
    pub opinions: &'a BTreeMap<String, String>,
    /// Concatenation of NPC summary, recent dialogue and session summary.
    pub dialogues: &'a str,
    pub current_reputation: Option<&'a str>,
}

#[derive(Clone)]
pub struct ReputationAgent {
    llm: CompletionClient,
    selection: LlmSelection,
    enabled: bool,
    system_template: String,
    user_template: String,
}

impl ReputationAgent {
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

    pub async fn generate_reputation(
        &self,
        input: ReputationInput<'_>,
    ) -> Result<String, LlmError> {
        if !self.enabled {
            return Ok(NEUTRAL.to_string());
        }
        if self.selection.provider == ProviderKind::Test {
            let seed = format!("reputation|{}", input.character);
            return Ok(pick(TEST_SAMPLES, &seed).to_string());
        }

        let system = safe_format(
            &self.system_template,
            &[("world_definition", input.world_definition)],
        );
        let user = safe_format(
            &self.user_template,
            &[
                ("character_name", input.character),
                (
                    "current_reputation",
                    input.current_reputation.unwrap_or("neutral"),
                ),
                ("opinions", &format_opinions(input.opinions)),
                ("dialogues", input.dialogues),
            ],
        );

        let reply = self
            .llm
            .call(&self.selection, &system, &user, 0.2, DEFAULT_AGENT_TIMEOUT)
            .await?;
        let reputation = clamp_words(&reply, 2);
        debug!(character = input.character, %reputation, "reputation updated");
        Ok(reputation)
    }
}

fn format_opinions(opinions: &BTreeMap<String, String>) -> String {
    if opinions.is_empty() {
        return "(no opinions available)".to_string();
    }
    opinions
        .iter()
        .map(|(holder, opinion)| format!("- {holder}: {opinion}"))
        .collect::<Vec<_>>()
        .join("\n")
}
