//! Knowledge: extract entities, relationships and timeline events from a
//! finished dialogue into a character's private world-knowledge object.

use serde_json::{Value, json};
use tracing::debug;

use folksim_llm::{CompletionClient, LlmError, LlmSelection, ProviderKind, extract_json_object};

use crate::DEFAULT_AGENT_TIMEOUT;
use crate::format::safe_format;

const SYSTEM_TEMPLATE: &str = include_str!("../templates/knowledge_system.txt");
const USER_TEMPLATE: &str = include_str!("../templates/knowledge_user.txt");

pub struct KnowledgeInput<'a> {
    pub observer: &'a str,
    pub personality: &'a str,
    pub knowledge: &'a serde_json::Map<String, Value>,
    /// Header line plus `speaker: text` lines.
    pub dialogue: &'a str,
}

#[derive(Clone)]
pub struct KnowledgeAgent {
    llm: CompletionClient,
    selection: LlmSelection,
    enabled: bool,
    system_template: String,
    user_template: String,
}

impl KnowledgeAgent {
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

    /// Returns the knowledge update to merge.  Disabled ⇒ empty object.
    pub async fn analyze(&self, input: KnowledgeInput<'_>) -> Result<Value, LlmError> {
        if !self.enabled {
            return Ok(json!({}));
        }
        if self.selection.provider == ProviderKind::Test {
            return Ok(test_knowledge(input.dialogue));
        }

        let knowledge_json = Value::Object(input.knowledge.clone()).to_string();
        let system = safe_format(
            &self.system_template,
            &[
                ("name", input.observer),
                ("personality", input.personality),
                ("knowledge", &knowledge_json),
            ],
        );
        let user = safe_format(
            &self.user_template,
            &[
                ("name", input.observer),
                ("personality", input.personality),
                ("knowledge", &knowledge_json),
                ("dialogue", input.dialogue),
            ],
        );

        let reply = self
            .llm
            .call(&self.selection, &system, &user, 0.2, DEFAULT_AGENT_TIMEOUT)
            .await?;

        let update = match extract_json_object::<Value>(&reply) {
            Some(value @ Value::Object(_)) => value,
            // Whatever the model said, keep it rather than lose it.
            _ => json!({"raw": reply}),
        };
        debug!(observer = input.observer, "knowledge analyzed");
        Ok(update)
    }
}

/// Deterministic stand-in for the `test` provider: speakers become people,
/// the `@ location` from the header becomes a place, and a conversation
/// event is synthesized.
fn test_knowledge(dialogue: &str) -> Value {
    let mut people: Vec<String> = Vec::new();
    for line in dialogue.lines() {
        let Some((speaker, _)) = line.split_once(':') else {
            continue;
        };
        let speaker = speaker.trim();
        let is_name = !speaker.is_empty()
            && speaker.chars().all(|c| c.is_alphabetic())
            && speaker != "Day"
            && speaker != "Participants";
        if is_name && !people.iter().any(|p| p == speaker) {
            people.push(speaker.to_string());
        }
    }

    let mut places: Vec<String> = Vec::new();
    if let Some(at) = dialogue.find('@') {
        let rest = &dialogue[at + 1..];
        let place = rest.split('|').next().unwrap_or("").trim();
        if !place.is_empty() {
            places.push(place.to_string());
        }
    }

    let mut events: Vec<String> = Vec::new();
    if let Some(place) = places.first() {
        events.push(format!("Conversation at {place}"));
    }
    if people.len() >= 2 {
        events.push(format!("Dialogue between {}", people.join(" and ")));
    }

    json!({
        "entities": {
            "people": people,
            "places": places,
            "objects": [],
            "events": events,
        },
        "relationships": [],
        "timeline": [],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use folksim_llm::testing::ScriptedBackend;

    const DIALOGUE: &str = "Day 2 | noon | @ The Old Forge | Participants: Elara and Grak\n\
                            Elara: The mill burned down last night.\n\
                            Grak: Aye, I smelled the smoke.";

    fn empty() -> serde_json::Map<String, Value> {
        serde_json::Map::new()
    }

    #[tokio::test]
    async fn disabled_agent_returns_empty_object_without_io() {
        let backend = Arc::new(ScriptedBackend::default_reply("unused"));
        let agent = KnowledgeAgent::new(
            CompletionClient::new(backend.clone()),
            LlmSelection::test(),
            false,
        );
        let know = empty();
        let update = agent
            .analyze(KnowledgeInput {
                observer: "Elara",
                personality: "warm",
                knowledge: &know,
                dialogue: DIALOGUE,
            })
            .await
            .unwrap();
        assert_eq!(update, json!({}));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_extracts_speakers_and_location() {
        let backend = Arc::new(ScriptedBackend::default_reply("unused"));
        let agent = KnowledgeAgent::new(
            CompletionClient::new(backend),
            LlmSelection::test(),
            true,
        );
        let know = empty();
        let update = agent
            .analyze(KnowledgeInput {
                observer: "Elara",
                personality: "warm",
                knowledge: &know,
                dialogue: DIALOGUE,
            })
            .await
            .unwrap();

        assert_eq!(update["entities"]["people"], json!(["Elara", "Grak"]));
        assert_eq!(update["entities"]["places"], json!(["The Old Forge"]));
        assert!(
            update["entities"]["events"]
                .as_array()
                .unwrap()
                .iter()
                .any(|e| e.as_str().unwrap().contains("The Old Forge"))
        );
    }

    #[tokio::test]
    async fn unparseable_reply_is_kept_raw() {
        let backend = Arc::new(ScriptedBackend::default_reply("the mill is gone, sad times"));
        let agent = KnowledgeAgent::new(
            CompletionClient::new(backend),
            LlmSelection::parse("ollama", "m").unwrap(),
            true,
        );
        let know = empty();
        let update = agent
            .analyze(KnowledgeInput {
                observer: "Elara",
                personality: "warm",
                knowledge: &know,
                dialogue: DIALOGUE,
            })
            .await
            .unwrap();
        assert_eq!(update["raw"], json!("the mill is gone, sad times"));
    }

    #[tokio::test]
    async fn structured_reply_is_parsed_even_when_fenced() {
        let backend = Arc::new(ScriptedBackend::default_reply(
            "```json\n{\"entities\": {\"people\": [\"Anya\"]}}\n```",
        ));
        let agent = KnowledgeAgent::new(
            CompletionClient::new(backend.clone()),
            LlmSelection::parse("ollama", "m").unwrap(),
            true,
        );
        let know = empty();
        let update = agent
            .analyze(KnowledgeInput {
                observer: "Elara",
                personality: "warm",
                knowledge: &know,
                dialogue: DIALOGUE,
            })
            .await
            .unwrap();
        assert_eq!(update["entities"]["people"], json!(["Anya"]));

        // The system prompt must keep its literal JSON shape intact.
        let (system, _) = backend.requests().remove(0);
        assert!(system.contains(r#"{"entities": {"people": [], "places": [], "objects": [], "events": []}"#));
    }
}
