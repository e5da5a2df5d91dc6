//! The memory service: append-then-maybe-compress.
//!
//! Every persisted message is appended, stamped, to three rolling buffers
//! (each participant's NPC log, the session log, the current day's log).
//! Whenever a buffer crosses `max_context_length` and no compression is
//! already in flight for that key, a background job rewrites it through the
//! summarizer LLM.  The store write path is only entered to commit the
//! result, never during LLM I/O.  In-flight markers are process-local; after
//! a restart the next append simply re-triggers the job.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use folksim_config::CharacterSpec;
use folksim_llm::{CompletionClient, LlmSelection};
use folksim_store::{Dialogue, Store, StorageError};

use crate::summarize;

const SUMMARIZER_TIMEOUT: Duration = Duration::from_secs(30);

/// One rolling buffer, as keyed by the in-flight marker set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SummaryKey {
    Npc { session_id: String, npc: String },
    Session { session_id: String },
    Day { session_id: String, day: u32 },
}

#[derive(Clone)]
pub struct MemoryService {
    store: Store,
    llm: CompletionClient,
    summarizer: LlmSelection,
    max_context_length: usize,
    in_flight: Arc<Mutex<HashSet<SummaryKey>>>,
    /// Ephemeral per-(npc, partner) small-talk context; cleared at day end.
    contexts: Arc<Mutex<HashMap<(String, String), String>>>,
    jobs: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MemoryService {
    pub fn new(
        store: Store,
        llm: CompletionClient,
        summarizer: LlmSelection,
        max_context_length: usize,
    ) -> Self {
        Self {
            store,
            llm,
            summarizer,
            max_context_length,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            contexts: Arc::new(Mutex::new(HashMap::new())),
            jobs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn max_context_length(&self) -> usize {
        self.max_context_length
    }

    // ── Append protocol ──────────────────────────────────────────────────────

    /// Record one persisted message into all three buffer granularities.
    pub async fn record_message(
        &self,
        dialogue: &Dialogue,
        sender: &str,
        receiver: &str,
        text: &str,
    ) -> Result<(), StorageError> {
        let stamp = format!(
            "[Day {} {}] {sender} -> {receiver}: {text}",
            dialogue.day, dialogue.time_period
        );
        let session = self.store.get_session(&dialogue.session_id).await?;

        for npc in [sender, receiver] {
            let properties = session
                .settings
                .character(npc)
                .cloned()
                .unwrap_or_default();
            let dialogue_id = dialogue.dialogue_id;
            let line = stamp.clone();
            let memory = self
                .store
                .update_npc_memory_with(&dialogue.session_id, npc, properties, move |mem| {
                    mem.record_dialogue(dialogue_id);
                    mem.append_summary_line(&line);
                })
                .await?;
            self.maybe_compress(
                SummaryKey::Npc {
                    session_id: dialogue.session_id.clone(),
                    npc: npc.to_string(),
                },
                memory.messages_summary_length,
                memory.messages_summary,
            );
        }

        let line = stamp.clone();
        let session = self
            .store
            .update_session_with(&dialogue.session_id, move |session| {
                session.append_summary_line(&line);
            })
            .await?;
        self.maybe_compress(
            SummaryKey::Session {
                session_id: dialogue.session_id.clone(),
            },
            session.session_summary.len(),
            session.session_summary,
        );

        if self.store.find_day(&dialogue.session_id, dialogue.day).await?.is_some() {
            let line = stamp.clone();
            let day = self
                .store
                .update_day_with(&dialogue.session_id, dialogue.day, move |day| {
                    day.append_summary_line(&line);
                })
                .await?;
            self.maybe_compress(
                SummaryKey::Day {
                    session_id: dialogue.session_id.clone(),
                    day: dialogue.day,
                },
                day.day_summary.len(),
                day.day_summary,
            );
        }

        Ok(())
    }

    // ── Compression ──────────────────────────────────────────────────────────

    fn maybe_compress(&self, key: SummaryKey, buffer_len: usize, source: String) {
        if buffer_len <= self.max_context_length {
            return;
        }
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight set poisoned");
            if !in_flight.insert(key.clone()) {
                return;
            }
        }

        debug!(?key, buffer_len, "memory buffer over threshold; compression queued");
        let service = self.clone();
        let handle = tokio::spawn(async move {
            service.run_compression(key, source).await;
        });

        let mut jobs = self.jobs.lock().expect("job list poisoned");
        jobs.retain(|job| !job.is_finished());
        jobs.push(handle);
    }

    async fn run_compression(&self, key: SummaryKey, source: String) {
        let max_chars = self.max_context_length;
        let (system, user) = match &key {
            SummaryKey::Npc { .. } => summarize::npc_summary_prompts(&source, max_chars),
            SummaryKey::Session { .. } => summarize::session_summary_prompts(&source, max_chars),
            SummaryKey::Day { day, .. } => summarize::day_summary_prompts(*day, &source, max_chars),
        };

        let outcome = self
            .llm
            .call(&self.summarizer, &system, &user, 0.2, SUMMARIZER_TIMEOUT)
            .await;

        match outcome {
            Ok(summary) => {
                if let Err(err) = self.commit_summary(&key, summary).await {
                    warn!(?key, error = %err, "failed to commit compressed summary");
                }
            }
            // Leave the buffer unchanged; the next append retries.
            Err(err) => warn!(?key, error = %err, "memory compression failed"),
        }

        self.in_flight
            .lock()
            .expect("in-flight set poisoned")
            .remove(&key);
    }

    async fn commit_summary(&self, key: &SummaryKey, summary: String) -> Result<(), StorageError> {
        match key {
            SummaryKey::Npc { session_id, npc } => {
                let now = Utc::now();
                self.store
                    .update_npc_memory_with(session_id, npc, CharacterSpec::default(), move |mem| {
                        mem.replace_summary(summary, now);
                    })
                    .await?;
            }
            SummaryKey::Session { session_id } => {
                self.store
                    .update_session_with(session_id, move |session| {
                        session.session_summary = summary;
                    })
                    .await?;
            }
            SummaryKey::Day { session_id, day } => {
                self.store
                    .update_day_with(session_id, *day, move |row| {
                        row.day_summary = summary;
                    })
                    .await?;
            }
        }
        debug!(?key, "compressed summary committed");
        Ok(())
    }

    /// Await every compression job spawned so far.  Tests use this to make
    /// background work deterministic; the simulation never needs to.
    pub async fn wait_for_compressions(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut jobs = self.jobs.lock().expect("job list poisoned");
            jobs.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn compression_in_flight(&self) -> usize {
        self.in_flight.lock().expect("in-flight set poisoned").len()
    }

    // ── Snapshots for prompt assembly ────────────────────────────────────────

    /// An NPC's rolling dialogue summary, or the empty string.
    pub async fn npc_summary(&self, session_id: &str, npc: &str) -> Result<String, StorageError> {
        Ok(self
            .store
            .get_npc_memory(session_id, npc)
            .await?
            .map(|mem| mem.messages_summary)
            .unwrap_or_default())
    }

    /// Past exchanges between two characters, one `speaker: text` line per
    /// message, bounded to the most recent shared dialogues.
    pub async fn conversation_history(
        &self,
        session_id: &str,
        npc: &str,
        partner: &str,
    ) -> Result<String, StorageError> {
        let shared = self.shared_dialogues(session_id, npc, partner, 3).await?;
        let mut lines = Vec::new();
        for dialogue in shared {
            for message in self.store.dialogue_messages(dialogue.dialogue_id).await? {
                let text = message.message_text.replace('\n', " ");
                lines.push(format!("{}: {}", message.sender, text.trim()));
            }
        }
        Ok(lines.join("\n"))
    }

    /// Number of completed dialogues the two characters share.
    pub async fn interaction_count(
        &self,
        session_id: &str,
        npc: &str,
        partner: &str,
    ) -> Result<usize, StorageError> {
        Ok(self
            .shared_dialogues(session_id, npc, partner, usize::MAX)
            .await?
            .len())
    }

    async fn shared_dialogues(
        &self,
        session_id: &str,
        npc: &str,
        partner: &str,
        limit: usize,
    ) -> Result<Vec<Dialogue>, StorageError> {
        let mut shared: Vec<Dialogue> = self
            .store
            .dialogues_for_npc(session_id, npc, 1000)
            .await?
            .into_iter()
            .filter(|d| d.initiator == partner || d.receiver == partner)
            .collect();
        if shared.len() > limit {
            shared.drain(..shared.len() - limit);
        }
        Ok(shared)
    }

    // ── Seeding ──────────────────────────────────────────────────────────────

    /// Give every character a `"Neutral"` prior about every other character,
    /// creating NPC memory rows as needed.  Idempotent.
    pub async fn seed_neutral_opinions(
        &self,
        session: &folksim_store::Session,
    ) -> Result<(), StorageError> {
        let names = session.settings.character_names();
        for npc in &names {
            let properties = session.settings.character(npc).cloned().unwrap_or_default();
            let others: Vec<String> = names.iter().filter(|n| *n != npc).cloned().collect();
            self.store
                .update_npc_memory_with(&session.session_id, npc, properties, move |mem| {
                    for other in others {
                        mem.opinion_on_npcs.entry(other).or_insert_with(|| "Neutral".to_string());
                    }
                })
                .await?;
        }
        Ok(())
    }

    // ── Conversation contexts ────────────────────────────────────────────────

    pub fn update_conversation_context(&self, npc: &str, partner: &str, context: String) {
        self.contexts
            .lock()
            .expect("context map poisoned")
            .insert((npc.to_string(), partner.to_string()), context);
    }

    pub fn conversation_context(&self, npc: &str, partner: &str) -> Option<String> {
        self.contexts
            .lock()
            .expect("context map poisoned")
            .get(&(npc.to_string(), partner.to_string()))
            .cloned()
    }

    /// End-of-day cleanup for the given characters.
    pub fn clear_conversation_contexts(&self, npcs: &[String]) {
        self.contexts
            .lock()
            .expect("context map poisoned")
            .retain(|(npc, _), _| !npcs.contains(npc));
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
