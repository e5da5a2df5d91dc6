//! The bounded conversation state machine.
//!
//! One engine executes one scheduled pair at a time per `(initiator,
//! responder, phase)` key: Starting registers the key and creates the
//! dialogue row, Turn alternates speakers under message/token/goodbye
//! limits, Ending closes the row and runs the post-dialogue social updates
//! from a single pre-update snapshot.  Fatal storage errors abort with
//! best-effort cleanup; everything else degrades and the dialogue still
//! ends.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use folksim_agents::{KnowledgeInput, OpinionInput, ReputationInput, SocialAgents, StanceInput};
use folksim_config::{GameSettings, TimePeriod};
use folksim_memory::MemoryService;
use folksim_npc::{FALLBACK_FAREWELL, NpcSpeaker};
use folksim_store::{Dialogue, Message, NpcMemory, Session, StorageError, Store};

use crate::error::DialogueError;
use crate::limits::{DialogueLimits, contains_goodbye, count_tokens};

const STORAGE_RETRIES: u32 = 3;
const STORAGE_RETRY_BASE: Duration = Duration::from_millis(100);

type ActiveKey = (String, String, String);

#[derive(Clone)]
pub struct DialogueEngine {
    store: Store,
    memory: MemoryService,
    speaker: NpcSpeaker,
    agents: SocialAgents,
    limits: DialogueLimits,
    /// Membership is a precondition for appending messages; duplicates are
    /// refused, never queued.
    active: Arc<Mutex<HashSet<ActiveKey>>>,
}

impl DialogueEngine {
    pub fn new(
        store: Store,
        memory: MemoryService,
        speaker: NpcSpeaker,
        agents: SocialAgents,
        limits: DialogueLimits,
    ) -> Self {
        Self {
            store,
            memory,
            speaker,
            agents,
            limits,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn limits(&self) -> &DialogueLimits {
        &self.limits
    }

    #[cfg(test)]
    pub(crate) fn register_active_for_test(
        &self,
        initiator: &str,
        responder: &str,
        phase: TimePeriod,
    ) -> bool {
        self.active
            .lock()
            .expect("active set poisoned")
            .insert((initiator.to_string(), responder.to_string(), phase.to_string()))
    }

    /// Execute one scheduled pair to completion.
    pub async fn execute_dialogue(
        &self,
        session_id: &str,
        initiator: &str,
        responder: &str,
        location: &str,
        phase: TimePeriod,
    ) -> Result<Dialogue, DialogueError> {
        if initiator.trim().is_empty() || responder.trim().is_empty() {
            return Err(DialogueError::Validation(
                "initiator and responder must be non-empty names".to_string(),
            ));
        }
        if initiator == responder {
            return Err(DialogueError::Validation(format!(
                "{initiator} cannot talk to themselves"
            )));
        }

        let key: ActiveKey = (
            initiator.to_string(),
            responder.to_string(),
            phase.to_string(),
        );
        {
            let mut active = self.active.lock().expect("active set poisoned");
            if !active.insert(key.clone()) {
                return Err(DialogueError::State(format!(
                    "dialogue already active: {initiator}/{responder}/{phase}"
                )));
            }
        }

        let result = self
            .run_dialogue(session_id, initiator, responder, location, phase)
            .await;

        self.active
            .lock()
            .expect("active set poisoned")
            .remove(&key);
        result
    }

    async fn run_dialogue(
        &self,
        session_id: &str,
        initiator: &str,
        responder: &str,
        location: &str,
        phase: TimePeriod,
    ) -> Result<Dialogue, DialogueError> {
        let session = self.store.get_session(session_id).await?;
        let day = session.current_day;

        let dialogue = {
            let store = self.store.clone();
            let (sid, a, b, loc) = (
                session_id.to_string(),
                initiator.to_string(),
                responder.to_string(),
                location.to_string(),
            );
            with_retry("create dialogue", move || {
                let store = store.clone();
                let (sid, a, b, loc) = (sid.clone(), a.clone(), b.clone(), loc.clone());
                async move { store.create_dialogue(&sid, &a, &b, day, phase, &loc).await }
            })
            .await?
        };
        info!(
            dialogue_id = dialogue.dialogue_id,
            initiator,
            responder,
            day,
            phase = %phase,
            location,
            "dialogue started"
        );

        match self.turn_loop(&session, &dialogue, initiator, responder).await {
            Ok(stats) => {
                let ended = {
                    let store = self.store.clone();
                    let id = dialogue.dialogue_id;
                    with_retry("end dialogue", move || {
                        let store = store.clone();
                        async move { store.end_dialogue(id, None).await }
                    })
                    .await?
                };

                self.post_dialogue_updates(&ended, initiator, responder).await;

                info!(
                    dialogue_id = ended.dialogue_id,
                    messages = stats.messages,
                    tokens = stats.tokens,
                    goodbyes = stats.goodbyes,
                    "dialogue completed"
                );
                Ok(ended)
            }
            Err(err) => {
                warn!(dialogue_id = dialogue.dialogue_id, error = %err, "dialogue aborted");
                if let Err(cleanup) = self.store.end_dialogue(dialogue.dialogue_id, None).await {
                    warn!(
                        dialogue_id = dialogue.dialogue_id,
                        error = %cleanup,
                        "best-effort cleanup failed"
                    );
                }
                Err(DialogueError::Handler(format!(
                    "dialogue {} failed: {err}",
                    dialogue.dialogue_id
                )))
            }
        }
    }

    async fn turn_loop(
        &self,
        session: &Session,
        dialogue: &Dialogue,
        initiator: &str,
        responder: &str,
    ) -> Result<TurnStats, StorageError> {
        let limits = &self.limits;
        let mut stats = TurnStats::default();
        let mut speaker_name = initiator;
        let mut listener_name = responder;

        while stats.messages < limits.max_messages
            && stats.tokens < limits.max_tokens
            && stats.goodbyes < limits.goodbye_threshold
        {
            let force_goodbye = stats.goodbyes > 0
                || stats.messages + 2 >= limits.max_messages
                || f64::from(stats.tokens) >= 0.9 * f64::from(limits.max_tokens);

            // Before replying, the speaker re-judges whoever spoke last.
            if stats.messages > 0 {
                self.update_turn_opinion(&session.settings, dialogue, speaker_name, listener_name)
                    .await;
            }

            let generation = timeout(
                limits.message_timeout,
                self.speaker.generate_message(
                    dialogue,
                    speaker_name,
                    listener_name,
                    force_goodbye,
                    limits.message_timeout,
                ),
            )
            .await;
            let message_text = match generation {
                Ok(text) => text,
                Err(_) => {
                    warn!(
                        speaker = speaker_name,
                        timeout_s = limits.message_timeout.as_secs(),
                        "message generation timed out; forcing wrap-up"
                    );
                    stats.goodbyes = limits.goodbye_threshold;
                    FALLBACK_FAREWELL.to_string()
                }
            };

            stats.tokens += count_tokens(&message_text);
            if contains_goodbye(&message_text) {
                stats.goodbyes += 1;
                info!(
                    goodbye_count = stats.goodbyes,
                    threshold = limits.goodbye_threshold,
                    "goodbye detected"
                );
            }

            let message = {
                let store = self.store.clone();
                let id = dialogue.dialogue_id;
                let (s, r, text) = (
                    speaker_name.to_string(),
                    listener_name.to_string(),
                    message_text.clone(),
                );
                with_retry("append message", move || {
                    let store = store.clone();
                    let (s, r, text) = (s.clone(), r.clone(), text.clone());
                    async move { store.append_message(id, &s, &r, &text).await }
                })
                .await?
            };

            let preview: String = message_text.replace('\n', " ").chars().take(120).collect();
            info!(
                dialogue_id = dialogue.dialogue_id,
                turn = stats.messages + 1,
                message_id = message.message_id,
                from = speaker_name,
                to = listener_name,
                preview,
                "message appended"
            );

            // Rolling summaries; failures are logged and the dialogue goes on.
            if let Err(err) = self
                .memory
                .record_message(dialogue, speaker_name, listener_name, &message_text)
                .await
            {
                warn!(error = %err, "failed to record message into memory buffers");
            }

            self.memory.update_conversation_context(
                speaker_name,
                listener_name,
                format!(
                    "{message_text} on day {} around {}, at {}",
                    dialogue.day, dialogue.time_period, dialogue.location
                ),
            );

            stats.messages += 1;
            std::mem::swap(&mut speaker_name, &mut listener_name);
            sleep(limits.turn_delay).await;
        }

        Ok(stats)
    }

    /// Non-critical: the current speaker forms an opinion about the sender of
    /// the last incoming message before composing a reply.
    async fn update_turn_opinion(
        &self,
        settings: &GameSettings,
        dialogue: &Dialogue,
        speaker: &str,
        listener: &str,
    ) {
        if !self.agents.opinion.is_enabled() {
            return;
        }
        let messages = match self.store.dialogue_messages(dialogue.dialogue_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "cannot load messages for opinion update");
                return;
            }
        };
        let Some(last) = messages.last() else {
            return;
        };
        if last.sender != listener {
            return;
        }
        let Some(character) = settings.character(speaker).cloned() else {
            return;
        };

        let prior = match self.store.get_npc_memory(&dialogue.session_id, speaker).await {
            Ok(memory) => memory.and_then(|mem| mem.opinion_on_npcs.get(listener).cloned()),
            Err(_) => None,
        };
        let recent = recent_turn_lines(&messages, 6);

        let opinion = match self
            .agents
            .opinion
            .generate_opinion(OpinionInput {
                observer: speaker,
                personality: &character.personality,
                story: &character.story,
                recipient: listener,
                incoming_message: &last.message_text,
                recent_dialogue: &recent,
                recipient_reputation: prior.as_deref(),
            })
            .await
        {
            Ok(opinion) => opinion,
            Err(err) => {
                warn!(observer = speaker, error = %err, "opinion update skipped");
                return;
            }
        };

        let target = listener.to_string();
        if let Err(err) = self
            .store
            .update_npc_memory_with(&dialogue.session_id, speaker, character, move |mem| {
                mem.opinion_on_npcs.insert(target, opinion);
            })
            .await
        {
            warn!(observer = speaker, error = %err, "failed to persist opinion");
        }
    }

    // ── Post-dialogue updates ────────────────────────────────────────────────

    /// Knowledge, stance and (optionally) reputation updates for both
    /// participants, computed from one pre-update snapshot.  Failures here
    /// never fail the dialogue.
    async fn post_dialogue_updates(&self, dialogue: &Dialogue, npc_a: &str, npc_b: &str) {
        let messages = match self.store.dialogue_messages(dialogue.dialogue_id).await {
            Ok(messages) if !messages.is_empty() => messages,
            Ok(_) => {
                debug!(dialogue_id = dialogue.dialogue_id, "no content for post-dialogue updates");
                return;
            }
            Err(err) => {
                warn!(error = %err, "cannot load dialogue content for post-dialogue updates");
                return;
            }
        };
        let dialogue_text = render_dialogue_text(dialogue, &messages);

        let session = match self.store.get_session(&dialogue.session_id).await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "cannot load session for post-dialogue updates");
                return;
            }
        };

        // One snapshot for both participants: agents see the world as it was
        // when the dialogue ended, not each other's updates.
        let snapshot_a = self.memory_snapshot(&session, npc_a).await;
        let snapshot_b = self.memory_snapshot(&session, npc_b).await;

        let knowledge_updates = if self.agents.knowledge.is_enabled() {
            let (update_a, update_b) = tokio::join!(
                self.agents.knowledge.analyze(KnowledgeInput {
                    observer: npc_a,
                    personality: &snapshot_a.personality,
                    knowledge: &snapshot_a.memory.world_knowledge,
                    dialogue: &dialogue_text,
                }),
                self.agents.knowledge.analyze(KnowledgeInput {
                    observer: npc_b,
                    personality: &snapshot_b.personality,
                    knowledge: &snapshot_b.memory.world_knowledge,
                    dialogue: &dialogue_text,
                }),
            );
            let keep = |name: &str, result: Result<serde_json::Value, folksim_llm::LlmError>| {
                match result {
                    Ok(update) => Some(update),
                    Err(err) => {
                        warn!(npc = name, error = %err, "knowledge update skipped");
                        None
                    }
                }
            };
            (keep(npc_a, update_a), keep(npc_b, update_b))
        } else {
            (None, None)
        };

        let stances = if self.agents.stance.is_enabled() {
            let opinion_a_of_b = snapshot_a.opinion_of(npc_b);
            let opinion_b_of_a = snapshot_b.opinion_of(npc_a);
            let history_a = self.history_or_empty(&dialogue.session_id, npc_a, npc_b).await;
            let history_b = self.history_or_empty(&dialogue.session_id, npc_b, npc_a).await;
            // Prior contact is a flag, not a count: hearsay keeps full
            // weight until the observer has an exchange on record.
            let interactions_a = usize::from(!history_a.is_empty());
            let interactions_b = usize::from(!history_b.is_empty());

            let (stance_a, stance_b) = tokio::join!(
                self.agents.stance.set_social_stance(StanceInput {
                    observer: npc_a,
                    observer_personality: &snapshot_a.personality,
                    opponent: npc_b,
                    opponent_reputation: &opinion_a_of_b,
                    opponent_opinion: &opinion_b_of_a,
                    knowledge: &snapshot_a.memory.world_knowledge,
                    interaction_history: &history_a,
                    interaction_count: interactions_a,
                }),
                self.agents.stance.set_social_stance(StanceInput {
                    observer: npc_b,
                    observer_personality: &snapshot_b.personality,
                    opponent: npc_a,
                    opponent_reputation: &opinion_b_of_a,
                    opponent_opinion: &opinion_a_of_b,
                    knowledge: &snapshot_b.memory.world_knowledge,
                    interaction_history: &history_b,
                    interaction_count: interactions_b,
                }),
            );
            let keep = |name: &str, result: Result<String, folksim_llm::LlmError>| match result {
                Ok(stance) => Some(stance),
                Err(err) => {
                    warn!(npc = name, error = %err, "stance update skipped");
                    None
                }
            };
            (keep(npc_a, stance_a), keep(npc_b, stance_b))
        } else {
            (None, None)
        };

        self.persist_social_updates(
            dialogue,
            (npc_a, snapshot_a, knowledge_updates.0, stances.0, npc_b),
            (npc_b, snapshot_b, knowledge_updates.1, stances.1, npc_a),
        )
        .await;

        if self.agents.reputation.is_enabled() {
            self.update_reputations(&session, dialogue, &dialogue_text, npc_a, npc_b)
                .await;
        }
    }

    async fn persist_social_updates(
        &self,
        dialogue: &Dialogue,
        a: (&str, Snapshot, Option<serde_json::Value>, Option<String>, &str),
        b: (&str, Snapshot, Option<serde_json::Value>, Option<String>, &str),
    ) {
        for (npc, snapshot, knowledge, stance, opponent) in [a, b] {
            if knowledge.is_none() && stance.is_none() {
                continue;
            }
            let opponent = opponent.to_string();
            let result = self
                .store
                .update_npc_memory_with(
                    &dialogue.session_id,
                    npc,
                    snapshot.memory.character_properties.clone(),
                    move |mem| {
                        if let Some(update) = knowledge {
                            mem.merge_world_knowledge(update);
                        }
                        if let Some(stance) = stance {
                            mem.social_stance.insert(opponent, stance);
                        }
                    },
                )
                .await;
            if let Err(err) = result {
                warn!(npc, error = %err, "failed to persist post-dialogue updates");
            }
        }
    }

    async fn update_reputations(
        &self,
        session: &Session,
        dialogue: &Dialogue,
        dialogue_text: &str,
        npc_a: &str,
        npc_b: &str,
    ) {
        let world_definition = session.settings.world.description.clone();
        let memories = match self.store.npc_memories_for_session(&session.session_id).await {
            Ok(memories) => memories,
            Err(err) => {
                warn!(error = %err, "cannot load memories for reputation update");
                return;
            }
        };

        let (result_a, result_b) = tokio::join!(
            self.reputation_for(session, dialogue, dialogue_text, &world_definition, &memories, npc_a),
            self.reputation_for(session, dialogue, dialogue_text, &world_definition, &memories, npc_b),
        );

        // Partial success is fine: whoever resolved in time gets written.
        for (npc, result) in [(npc_a, result_a), (npc_b, result_b)] {
            let Some(reputation) = result else {
                continue;
            };
            let npc_owned = npc.to_string();
            let value = reputation.clone();
            if let Err(err) = self
                .store
                .update_session_with(&session.session_id, move |session| {
                    session.reputations.insert(npc_owned, value);
                })
                .await
            {
                warn!(npc, error = %err, "failed to persist reputation");
            } else {
                info!(npc, reputation, "reputation updated");
            }
        }
    }

    async fn reputation_for(
        &self,
        session: &Session,
        dialogue: &Dialogue,
        dialogue_text: &str,
        world_definition: &str,
        memories: &[NpcMemory],
        npc: &str,
    ) -> Option<String> {
        // Opinions held about this character, across the whole cast.
        let mut held_about: BTreeMap<String, String> = BTreeMap::new();
        for memory in memories {
            if memory.npc_name == npc {
                continue;
            }
            if let Some(opinion) = memory.opinion_on_npcs.get(npc) {
                held_about.insert(memory.npc_name.clone(), opinion.clone());
            }
        }

        let own_summary = memories
            .iter()
            .find(|m| m.npc_name == npc)
            .map(|m| m.messages_summary.clone())
            .unwrap_or_default();
        let dialogues = format!(
            "{own_summary}\n{dialogue_text}\n{session_summary}",
            session_summary = session.session_summary
        );
        let current = session.reputations.get(npc).cloned();

        let call = self.agents.reputation.generate_reputation(ReputationInput {
            character: npc,
            world_definition,
            opinions: &held_about,
            dialogues: &dialogues,
            current_reputation: current.as_deref(),
        });
        match timeout(self.limits.reputation_timeout, call).await {
            Ok(Ok(reputation)) => Some(reputation),
            Ok(Err(err)) => {
                warn!(npc, dialogue_id = dialogue.dialogue_id, error = %err, "reputation call failed");
                None
            }
            Err(_) => {
                warn!(
                    npc,
                    dialogue_id = dialogue.dialogue_id,
                    timeout_s = self.limits.reputation_timeout.as_secs(),
                    "reputation update timed out"
                );
                None
            }
        }
    }

    async fn memory_snapshot(&self, session: &Session, npc: &str) -> Snapshot {
        let memory = match self.store.get_npc_memory(&session.session_id, npc).await {
            Ok(Some(memory)) => memory,
            _ => NpcMemory::new(
                npc.to_string(),
                session.session_id.clone(),
                session.settings.character(npc).cloned().unwrap_or_default(),
            ),
        };
        let personality = session
            .settings
            .character(npc)
            .map(|c| c.personality.clone())
            .unwrap_or_default();
        Snapshot {
            memory,
            personality,
        }
    }

    async fn history_or_empty(&self, session_id: &str, npc: &str, partner: &str) -> String {
        self.memory
            .conversation_history(session_id, npc, partner)
            .await
            .unwrap_or_default()
    }
}

/// Pre-update view of one participant.
struct Snapshot {
    memory: NpcMemory,
    personality: String,
}

impl Snapshot {
    fn opinion_of(&self, other: &str) -> String {
        self.memory
            .opinion_on_npcs
            .get(other)
            .cloned()
            .unwrap_or_else(|| "Neutral".to_string())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TurnStats {
    messages: u32,
    tokens: u32,
    goodbyes: u32,
}

/// Header plus `speaker: text` lines, the shared context for every
/// post-dialogue agent.
pub fn render_dialogue_text(dialogue: &Dialogue, messages: &[Message]) -> String {
    let mut lines = vec![format!(
        "Day {} | {} | @ {} | Participants: {} and {}",
        dialogue.day,
        dialogue.time_period,
        dialogue.location,
        dialogue.initiator,
        dialogue.receiver
    )];
    for message in messages {
        let text = message.message_text.replace('\n', " ");
        let text = text.trim();
        if !text.is_empty() {
            lines.push(format!("{}: {}", message.sender, text));
        }
    }
    lines.join("\n")
}

fn recent_turn_lines(messages: &[Message], limit: usize) -> String {
    messages
        .iter()
        .rev()
        .take(limit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .map(|m| format!("{}: {}", m.sender, m.message_text.replace('\n', " ")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Retry transient storage failures with exponential backoff.  `Conflict`
/// and `NotFound` are deterministic and returned immediately.
async fn with_retry<T, F, Fut>(operation: &str, mut call: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut delay = STORAGE_RETRY_BASE;
    let mut last_error = None;

    for attempt in 1..=STORAGE_RETRIES {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err @ (StorageError::Conflict(_) | StorageError::NotFound(_))) => return Err(err),
            Err(err) => {
                warn!(operation, attempt, error = %err, "storage operation failed");
                last_error = Some(err);
                if attempt < STORAGE_RETRIES {
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| StorageError::Busy(format!("{operation}: no attempts made"))))
}
