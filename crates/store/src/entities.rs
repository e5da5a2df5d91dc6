//! Durable entities.  Relations are expressed by ID, never by pointers;
//! every row is independently (de)serializable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use folksim_config::{CharacterSpec, GameSettings, TimePeriod};

pub type DialogueId = u64;
pub type MessageId = u64;

/// Entities with their own monotone ID counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdEntity {
    Sessions,
    Dialogues,
    Messages,
}

impl IdEntity {
    pub fn as_str(self) -> &'static str {
        match self {
            IdEntity::Sessions => "sessions",
            IdEntity::Dialogues => "dialogues",
            IdEntity::Messages => "messages",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub current_day: u32,
    pub current_period: TimePeriod,
    pub settings: GameSettings,
    pub reputations: BTreeMap<String, String>,
    pub session_summary: String,
    pub active_npcs: Vec<String>,
    pub dialogue_ids: Vec<DialogueId>,
}

impl Session {
    pub fn new(session_id: String, settings: GameSettings) -> Self {
        let now = Utc::now();
        let first_period = settings
            .day_periods()
            .first()
            .copied()
            .unwrap_or(TimePeriod::Morning);
        Self {
            session_id,
            created_at: now,
            last_updated: now,
            current_day: 1,
            current_period: first_period,
            settings,
            reputations: BTreeMap::new(),
            session_summary: String::new(),
            active_npcs: Vec::new(),
            dialogue_ids: Vec::new(),
        }
    }

    /// Global accumulative dialogue memory, with the canonical opener used
    /// in prompts before anything has happened.
    pub fn accumulative_summary(&self) -> &str {
        if self.session_summary.is_empty() {
            "no conversations yet, this is the beginning of the new game"
        } else {
            &self.session_summary
        }
    }

    pub fn append_summary_line(&mut self, line: &str) {
        if !self.session_summary.is_empty() {
            self.session_summary.push('\n');
        }
        self.session_summary.push_str(line);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Day {
    pub session_id: String,
    pub day: u32,
    pub time_period: TimePeriod,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub active_npcs: Vec<String>,
    pub passive_npcs: Vec<String>,
    pub dialogue_ids: Vec<DialogueId>,
    pub day_summary: String,
}

impl Day {
    pub fn new(session_id: String, day: u32, time_period: TimePeriod) -> Self {
        Self {
            session_id,
            day,
            time_period,
            started_at: Utc::now(),
            ended_at: None,
            active_npcs: Vec::new(),
            passive_npcs: Vec::new(),
            dialogue_ids: Vec::new(),
            day_summary: String::new(),
        }
    }

    pub fn append_summary_line(&mut self, line: &str) {
        if !self.day_summary.is_empty() {
            self.day_summary.push('\n');
        }
        self.day_summary.push_str(line);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialogue {
    pub dialogue_id: DialogueId,
    pub session_id: String,
    pub initiator: String,
    pub receiver: String,
    pub day: u32,
    pub time_period: TimePeriod,
    pub location: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_ids: Vec<MessageId>,
    pub summary: Option<String>,
    pub total_text_length: usize,
}

impl Dialogue {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn participants(&self) -> [&str; 2] {
        [&self.initiator, &self.receiver]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub dialogue_id: DialogueId,
    pub sender: String,
    pub receiver: String,
    pub message_text: String,
    pub timestamp: DateTime<Utc>,
    pub sender_opinion: Option<String>,
    pub receiver_opinion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpcMemory {
    pub npc_name: String,
    pub session_id: String,
    /// Immutable base, written once on first reference.
    pub character_properties: CharacterSpec,
    pub dialogue_ids: Vec<DialogueId>,
    pub messages_summary: String,
    pub messages_summary_length: usize,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_summarized: Option<DateTime<Utc>>,
    pub opinion_on_npcs: BTreeMap<String, String>,
    pub world_knowledge: serde_json::Map<String, serde_json::Value>,
    pub social_stance: BTreeMap<String, String>,
}

impl NpcMemory {
    pub fn new(npc_name: String, session_id: String, properties: CharacterSpec) -> Self {
        let now = Utc::now();
        Self {
            npc_name,
            session_id,
            character_properties: properties,
            dialogue_ids: Vec::new(),
            messages_summary: String::new(),
            messages_summary_length: 0,
            created_at: now,
            last_updated: now,
            last_summarized: None,
            opinion_on_npcs: BTreeMap::new(),
            social_stance: BTreeMap::new(),
            world_knowledge: serde_json::Map::new(),
        }
    }

    pub fn record_dialogue(&mut self, dialogue_id: DialogueId) {
        if !self.dialogue_ids.contains(&dialogue_id) {
            self.dialogue_ids.push(dialogue_id);
        }
    }

    pub fn append_summary_line(&mut self, line: &str) {
        self.messages_summary.push('\n');
        self.messages_summary.push_str(line);
        self.messages_summary_length = self.messages_summary.len();
    }

    pub fn replace_summary(&mut self, summary: String, summarized_at: DateTime<Utc>) {
        self.messages_summary = summary;
        self.messages_summary_length = self.messages_summary.len();
        self.last_summarized = Some(summarized_at);
    }

    /// Fold an agent-produced knowledge object into the stored one.
    /// Top-level object keys are inserted or replaced; a non-object payload
    /// lands under `"raw"` so nothing the model said is lost.
    pub fn merge_world_knowledge(&mut self, update: serde_json::Value) {
        match update {
            serde_json::Value::Object(map) => {
                for (key, value) in map {
                    self.world_knowledge.insert(key, value);
                }
            }
            serde_json::Value::Null => {}
            other => {
                self.world_knowledge.insert("raw".to_string(), other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory() -> NpcMemory {
        NpcMemory::new(
            "Elara".to_string(),
            "1".to_string(),
            CharacterSpec::default(),
        )
    }

    #[test]
    fn summary_length_tracks_buffer() {
        let mut mem = memory();
        mem.append_summary_line("[Day 1 morning] Elara -> Grak: hello");
        mem.append_summary_line("[Day 1 morning] Grak -> Elara: well met");
        assert_eq!(mem.messages_summary_length, mem.messages_summary.len());

        mem.replace_summary("short".to_string(), Utc::now());
        assert_eq!(mem.messages_summary_length, 5);
        assert!(mem.last_summarized.is_some());
    }

    #[test]
    fn merge_replaces_top_level_keys_only() {
        let mut mem = memory();
        mem.merge_world_knowledge(json!({"entities": {"people": ["Grak"]}, "timeline": []}));
        mem.merge_world_knowledge(json!({"entities": {"people": ["Grak", "Anya"]}}));

        assert_eq!(
            mem.world_knowledge["entities"],
            json!({"people": ["Grak", "Anya"]})
        );
        assert_eq!(mem.world_knowledge["timeline"], json!([]));
    }

    #[test]
    fn merge_wraps_non_object_payloads() {
        let mut mem = memory();
        mem.merge_world_knowledge(json!("the mill burned down"));
        assert_eq!(mem.world_knowledge["raw"], json!("the mill burned down"));

        mem.merge_world_knowledge(serde_json::Value::Null);
        assert_eq!(mem.world_knowledge.len(), 1);
    }

    #[test]
    fn record_dialogue_deduplicates() {
        let mut mem = memory();
        mem.record_dialogue(4);
        mem.record_dialogue(4);
        mem.record_dialogue(5);
        assert_eq!(mem.dialogue_ids, vec![4, 5]);
    }

    #[test]
    fn session_summary_opener_before_first_line() {
        let mut session = Session::new("1".to_string(), GameSettings::default_cast());
        assert!(session.accumulative_summary().contains("beginning"));
        session.append_summary_line("[Day 1 morning] Elara -> Grak: hello");
        assert!(session.accumulative_summary().starts_with("[Day 1"));
    }
}
