//! The NPC speaker: produce the next utterance for a (speaker, partner,
//! dialogue) triple from store/memory snapshots.
//!
//! Stateless beyond configuration.  It never writes anywhere (persisting
//! the produced message is the dialogue engine's job) and it never
//! propagates failures: anything that goes wrong yields the fallback
//! farewell so a dialogue can always wind down.

use std::time::Duration;

use tracing::{debug, warn};

use folksim_config::CharacterSpec;
use folksim_llm::{CompletionClient, LlmSelection};
use folksim_memory::MemoryService;
use folksim_store::{Dialogue, Message, NpcMemory, Store};

/// Produced whenever a character cannot (or should not) speak.
pub const FALLBACK_FAREWELL: &str = "I need to go now. Goodbye!";

/// How many trailing turns the respond branch shows the model.
const RECENT_TURNS: usize = 6;

#[derive(Clone)]
pub struct NpcSpeaker {
    store: Store,
    memory: MemoryService,
    llm: CompletionClient,
    selection: LlmSelection,
}

impl NpcSpeaker {
    pub fn new(
        store: Store,
        memory: MemoryService,
        llm: CompletionClient,
        selection: LlmSelection,
    ) -> Self {
        Self {
            store,
            memory,
            llm,
            selection,
        }
    }

    /// Next utterance of `speaker` toward `partner`.  Always returns text;
    /// failures become the fallback farewell.
    pub async fn generate_message(
        &self,
        dialogue: &Dialogue,
        speaker: &str,
        partner: &str,
        force_goodbye: bool,
        timeout: Duration,
    ) -> String {
        let session = match self.store.get_session(&dialogue.session_id).await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "cannot load session for message generation");
                return FALLBACK_FAREWELL.to_string();
            }
        };

        let Some(character) = session.settings.character(speaker).cloned() else {
            warn!(speaker, "unknown speaker; using fallback farewell");
            return FALLBACK_FAREWELL.to_string();
        };
        if session.settings.character(partner).is_none() {
            warn!(partner, "unknown partner; using fallback farewell");
            return FALLBACK_FAREWELL.to_string();
        }

        let speaker_memory = match self.store.get_npc_memory(&dialogue.session_id, speaker).await {
            Ok(memory) => memory,
            Err(err) => {
                warn!(error = %err, speaker, "cannot load npc memory");
                None
            }
        };
        let messages = match self.store.dialogue_messages(dialogue.dialogue_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "cannot load dialogue messages");
                return FALLBACK_FAREWELL.to_string();
            }
        };

        let mut system = self.persona_prompt(&character, speaker_memory.as_ref(), dialogue, partner);
        if force_goodbye {
            system.push_str(
                "\n\nIMPORTANT: You must end this conversation now. \
                 Say goodbye politely and naturally.",
            );
        }

        let (user, temperature) = if messages.is_empty() {
            let known = self
                .knows_partner(speaker_memory.as_ref(), &dialogue.session_id, speaker, partner)
                .await;
            if known {
                (greet_prompt(&character.name, partner), 0.7)
            } else {
                (introduce_prompt(&character.name, partner), 0.6)
            }
        } else {
            // messages is non-empty here, so last() always yields.
            let Some(last) = messages.last() else {
                return FALLBACK_FAREWELL.to_string();
            };
            let user = respond_prompt(&character, last, &messages, force_goodbye);
            (user, 0.9)
        };

        debug!(
            speaker,
            partner,
            dialogue_id = dialogue.dialogue_id,
            prior_messages = messages.len(),
            force_goodbye,
            "generating npc message"
        );

        match self
            .llm
            .call(&self.selection, &system, &user, temperature, timeout)
            .await
        {
            Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(_) => {
                warn!(speaker, "empty reply from model; using fallback farewell");
                FALLBACK_FAREWELL.to_string()
            }
            Err(err) => {
                warn!(speaker, error = %err, "message generation failed; using fallback farewell");
                FALLBACK_FAREWELL.to_string()
            }
        }
    }

    /// A partner is known if an opinion about them exists or the two share
    /// any recorded dialogue.
    async fn knows_partner(
        &self,
        memory: Option<&NpcMemory>,
        session_id: &str,
        speaker: &str,
        partner: &str,
    ) -> bool {
        if memory.is_some_and(|mem| mem.opinion_on_npcs.contains_key(partner)) {
            return true;
        }
        match self.memory.interaction_count(session_id, speaker, partner).await {
            Ok(count) => count > 0,
            Err(_) => false,
        }
    }

    fn persona_prompt(
        &self,
        character: &CharacterSpec,
        memory: Option<&NpcMemory>,
        dialogue: &Dialogue,
        partner: &str,
    ) -> String {
        let name = &character.name;
        let mut prompt = format!(
            "You are {name}. {story} Your personality is {personality}.\n\n\
             CHARACTER BACKGROUND:\n\
             - Your role is {role}\n\
             - Your home is {home}\n\
             - Your working place is {work}\n\
             - Current location: {location}\n",
            story = character.story,
            personality = character.personality,
            role = character.role,
            home = character.location_home,
            work = character.location_work,
            location = dialogue.location,
        );
        if !character.titles.is_empty() {
            prompt.push_str(&format!("- Titles: {}\n", character.titles.join(", ")));
        }

        prompt.push_str("\nMEMORY AND CONTEXT:\n");
        if let Some(memory) = memory {
            if !memory.messages_summary.is_empty() {
                prompt.push_str(&format!(
                    "Recent experiences and conversations: {}\n",
                    truncate_for_prompt(&memory.messages_summary, 1200)
                ));
            }
            if !memory.world_knowledge.is_empty() {
                let knowledge = serde_json::Value::Object(memory.world_knowledge.clone());
                prompt.push_str(&format!("World knowledge: {knowledge}\n"));
            }
            if !memory.opinion_on_npcs.is_empty() {
                let opinions = memory
                    .opinion_on_npcs
                    .iter()
                    .map(|(who, what)| format!("{who}: {what}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                prompt.push_str(&format!("Opinions about others: {opinions}\n"));
            }
            if let Some(stance) = memory.social_stance.get(partner) {
                prompt.push_str(&format!("Your stance toward {partner}: {stance}\n"));
            }
        }
        if let Some(context) = self.memory.conversation_context(name, partner) {
            prompt.push_str(&format!("Current conversation context: {context}\n"));
        }

        let has_style = !character.speech.register.is_empty()
            || !character.speech.constraints.is_empty()
            || !character.motifs.is_empty()
            || !character.quirks.is_empty();
        if has_style {
            prompt.push_str("\nSTYLE HINTS:\n");
            if !character.speech.register.is_empty() {
                prompt.push_str(&format!("- Speech register: {}\n", character.speech.register));
            }
            if !character.speech.constraints.is_empty() {
                prompt.push_str(&format!(
                    "- Speech constraints: {}\n",
                    character.speech.constraints
                ));
            }
            if !character.motifs.is_empty() {
                prompt.push_str(&format!(
                    "- Motifs to weave in subtly: {}\n",
                    character.motifs.join(", ")
                ));
            }
            if !character.quirks.is_empty() {
                prompt.push_str(&format!(
                    "- Quirks to surface subtly (no stage directions): {}\n",
                    character.quirks.join(", ")
                ));
            }
        }

        prompt.push_str(&format!(
            "\nROLEPLAY RULES:\n\
             - Chat exclusively as {name}, in first person, reacting to the current moment.\n\
             - Reference your memories and opinions naturally without reciting them.\n\
             - Stay consistent with your established relationships and knowledge.\n\
             - Never break character and never mention being simulated.\n\
             - Keep replies succinct; no internal monologue, no narration.\n\
             - When you want to end the conversation, say \"Goodbye\".\n\
             \nToday is day {day} around {period}, at {location}.",
            day = dialogue.day,
            period = dialogue.time_period,
            location = dialogue.location,
        ));

        prompt
    }
}

fn introduce_prompt(name: &str, partner: &str) -> String {
    format!(
        "As {name}, introduce yourself to {partner}, a stranger you've just encountered. \
         Speak only as {name}, summarizing your background and story naturally. \
         Do not narrate or break character."
    )
}

fn greet_prompt(name: &str, partner: &str) -> String {
    format!(
        "As {name}, briefly say hi to {partner}. Speak only as {name}, greeting them \
         naturally based on your personality and background. \
         Do not narrate or break character."
    )
}

fn respond_prompt(
    character: &CharacterSpec,
    last: &Message,
    messages: &[Message],
    force_goodbye: bool,
) -> String {
    let name = &character.name;
    let sender = &last.sender;

    let recent = messages
        .iter()
        .rev()
        .take(RECENT_TURNS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .map(|m| format!("{}: {}", m.sender, m.message_text.replace('\n', " ")))
        .collect::<Vec<_>>()
        .join("\n");

    let constraint_note = if character.speech.constraints.is_empty() {
        String::new()
    } else {
        format!(" Honor your speech constraints: {}.", character.speech.constraints)
    };
    let wrap_up_note = if force_goodbye {
        " You are at the end of the conversation. Wrap up and say GOODBYE."
    } else {
        ""
    };

    format!(
        "Recent turns:\n{recent}\n\n\
         Respond in first person as {name} directly to {sender}; say only your reply. \
         Do not repeat {sender}'s sentence verbatim; respond with your own \
         wording.{constraint_note}{wrap_up_note}\n\n\
         {sender} says: {incoming}",
        incoming = last.message_text,
    )
}

fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let truncated: String = chars.into_iter().take(max_chars).collect();
    format!("{truncated}…")
}

// ── Tests ────────────────────────────────────────────────────────────────────
