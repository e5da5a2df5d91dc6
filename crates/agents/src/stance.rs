//! Social stance: how a character decides to carry themselves toward an
//! opponent, weighing hearsay against first-hand experience.  Once the two
//! have actually talked, reputation loses part of its weight.

use tracing::debug;

use folksim_llm::{CompletionClient, LlmError, LlmSelection, ProviderKind};

use crate::format::safe_format;
use crate::{DEFAULT_AGENT_TIMEOUT, NEUTRAL, pick};

const SYSTEM_TEMPLATE: &str = include_str!("../templates/stance_system.txt");
const USER_TEMPLATE: &str = include_str!("../templates/stance_user.txt");

const TEST_SAMPLES: &[&str] = &["warm", "guarded", "open", "wary", "formal"];

pub struct StanceInput<'a> {
    pub observer: &'a str,
    pub observer_personality: &'a str,
    pub opponent: &'a str,
    /// The observer's prior opinion of the opponent.
    pub opponent_reputation: &'a str,
    /// What the opponent thinks of the observer.
    pub opponent_opinion: &'a str,
    pub knowledge: &'a serde_json::Map<String, serde_json::Value>,
    pub interaction_history: &'a str,
    /// 1 when the observer has exchanges with the opponent on record,
    /// 0 otherwise.
    pub interaction_count: usize,
}

#[derive(Clone)]
pub struct StanceAgent {
    llm: CompletionClient,
    selection: LlmSelection,
    enabled: bool,
    system_template: String,
    user_template: String,
}

impl StanceAgent {
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

    pub async fn set_social_stance(&self, input: StanceInput<'_>) -> Result<String, LlmError> {
        if !self.enabled {
            return Ok(NEUTRAL.to_string());
        }
        if self.selection.provider == ProviderKind::Test {
            let seed = format!("stance|{}|{}", input.observer, input.opponent);
            return Ok(pick(TEST_SAMPLES, &seed).to_string());
        }

        // Reputation carries full weight until the pair has prior contact.
        let reputation_weight = 1.0 / (1.0 + 0.1 * input.interaction_count as f64);
        let knowledge_weight = 1.0 - reputation_weight;

        let knowledge_json = serde_json::Value::Object(input.knowledge.clone()).to_string();
        let system = safe_format(
            &self.system_template,
            &[
                ("npc_name", input.observer),
                ("npc_personality", input.observer_personality),
                ("opponent_name", input.opponent),
                ("interaction_history", input.interaction_history),
                ("reputation_weight", &format!("{reputation_weight:.2}")),
                ("knowledge_weight", &format!("{knowledge_weight:.2}")),
                ("opponent_reputation", input.opponent_reputation),
                ("opponent_opinion", input.opponent_opinion),
                ("knowledge_base", &knowledge_json),
            ],
        );
        let user = safe_format(
            &self.user_template,
            &[
                (
                    "reputation_weight_pct",
                    &format!("{:.0}", reputation_weight * 100.0),
                ),
                (
                    "knowledge_weight_pct",
                    &format!("{:.0}", knowledge_weight * 100.0),
                ),
            ],
        );

        let reply = self
            .llm
            .call(&self.selection, &system, &user, 0.2, DEFAULT_AGENT_TIMEOUT)
            .await?;
        let stance = reply.trim().to_string();
        debug!(observer = input.observer, opponent = input.opponent, %stance, "stance set");
        Ok(stance)
    }
}
