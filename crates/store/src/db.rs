//! Synchronous redb layer.
//!
//! One database file, six logical tables plus four secondary indices.  All
//! rows are JSON bytes under string keys (see [`crate::keys`] for the key
//! layout).  Methods here run on the blocking pool; the async façade in
//! `lib.rs` owns lock discipline.

use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use folksim_config::{GameSettings, TimePeriod};

use crate::entities::{Day, Dialogue, DialogueId, IdEntity, Message, NpcMemory, Session};
use crate::error::StorageError;
use crate::keys;

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const DAYS: TableDefinition<&str, &[u8]> = TableDefinition::new("days");
const DIALOGUES: TableDefinition<&str, &[u8]> = TableDefinition::new("dialogues");
const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");
const NPC_MEMORIES: TableDefinition<&str, &[u8]> = TableDefinition::new("npc_memories");
const ID_COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("id_counters");

const DIALOGUES_BY_SESSION: TableDefinition<&str, &[u8]> =
    TableDefinition::new("dialogues_by_session");
const MESSAGES_BY_DIALOGUE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("messages_by_dialogue");
const MESSAGES_BY_SENDER: TableDefinition<&str, &[u8]> = TableDefinition::new("messages_by_sender");
const MESSAGES_BY_RECEIVER: TableDefinition<&str, &[u8]> =
    TableDefinition::new("messages_by_receiver");

const EMPTY: &[u8] = &[];

pub struct StoreDb {
    db: Database,
}

impl StoreDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Open every table once so later read transactions never observe a
        // missing table.
        let txn = db.begin_write()?;
        {
            txn.open_table(SESSIONS)?;
            txn.open_table(DAYS)?;
            txn.open_table(DIALOGUES)?;
            txn.open_table(MESSAGES)?;
            txn.open_table(NPC_MEMORIES)?;
            txn.open_table(ID_COUNTERS)?;
            txn.open_table(DIALOGUES_BY_SESSION)?;
            txn.open_table(MESSAGES_BY_DIALOGUE)?;
            txn.open_table(MESSAGES_BY_SENDER)?;
            txn.open_table(MESSAGES_BY_RECEIVER)?;
        }
        txn.commit()?;

        Ok(Self { db })
    }

    // ── ID allocation ────────────────────────────────────────────────────────

    pub fn allocate_id(&self, entity: IdEntity) -> Result<u64, StorageError> {
        let txn = self.db.begin_write()?;
        let id = next_id_in(&txn, entity)?;
        txn.commit()?;
        Ok(id)
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub fn create_session(
        &self,
        session_id: Option<String>,
        settings: GameSettings,
    ) -> Result<Session, StorageError> {
        let txn = self.db.begin_write()?;
        let id = match session_id {
            Some(id) => id,
            None => next_id_in(&txn, IdEntity::Sessions)?.to_string(),
        };

        let session = {
            let mut table = txn.open_table(SESSIONS)?;
            if table.get(id.as_str())?.is_some() {
                return Err(StorageError::conflict(format!("session {id} already exists")));
            }
            let session = Session::new(id, settings);
            put(&mut table, &session.session_id, &session)?;
            session
        };
        txn.commit()?;

        debug!(session_id = %session.session_id, "session created");
        Ok(session)
    }

    pub fn find_session(&self, session_id: &str) -> Result<Option<Session>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SESSIONS)?;
        get_row(&table, session_id)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session, StorageError> {
        self.find_session(session_id)?
            .ok_or_else(|| StorageError::not_found(format!("session {session_id}")))
    }

    /// Last-writer-wins replacement of the whole row.
    pub fn update_session(&self, mut session: Session) -> Result<Session, StorageError> {
        session.last_updated = Utc::now();
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SESSIONS)?;
            put(&mut table, &session.session_id, &session)?;
        }
        txn.commit()?;
        Ok(session)
    }

    pub fn update_session_with(
        &self,
        session_id: &str,
        mutate: impl FnOnce(&mut Session),
    ) -> Result<Session, StorageError> {
        let mut session = self.get_session(session_id)?;
        mutate(&mut session);
        self.update_session(session)
    }

    // ── Days ─────────────────────────────────────────────────────────────────

    /// Upsert keyed by `(session_id, day)`.  An existing row keeps its
    /// dialogue list and summary; period and cast split are refreshed.
    pub fn upsert_day(
        &self,
        session_id: &str,
        day: u32,
        time_period: TimePeriod,
        active_npcs: Vec<String>,
        passive_npcs: Vec<String>,
    ) -> Result<Day, StorageError> {
        let key = keys::day_key(session_id, day);
        let txn = self.db.begin_write()?;
        let row = {
            let mut table = txn.open_table(DAYS)?;
            let mut row: Day = get_row(&table, &key)?
                .unwrap_or_else(|| Day::new(session_id.to_string(), day, time_period));
            row.time_period = time_period;
            row.active_npcs = active_npcs;
            row.passive_npcs = passive_npcs;
            put(&mut table, &key, &row)?;
            row
        };
        txn.commit()?;
        Ok(row)
    }

    pub fn find_day(&self, session_id: &str, day: u32) -> Result<Option<Day>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DAYS)?;
        get_row(&table, &keys::day_key(session_id, day))
    }

    pub fn get_day(&self, session_id: &str, day: u32) -> Result<Day, StorageError> {
        self.find_day(session_id, day)?
            .ok_or_else(|| StorageError::not_found(format!("day {day} of session {session_id}")))
    }

    pub fn update_day(&self, day: Day) -> Result<Day, StorageError> {
        let key = keys::day_key(&day.session_id, day.day);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DAYS)?;
            put(&mut table, &key, &day)?;
        }
        txn.commit()?;
        Ok(day)
    }

    /// Stamp a day row closed when the next day begins.  Idempotent: an
    /// already-closed day keeps its original timestamp.
    pub fn close_day(&self, session_id: &str, day: u32) -> Result<Day, StorageError> {
        let key = keys::day_key(session_id, day);
        let txn = self.db.begin_write()?;
        let row = {
            let mut table = txn.open_table(DAYS)?;
            let mut row: Day = get_row(&table, &key)?.ok_or_else(|| {
                StorageError::not_found(format!("day {day} of session {session_id}"))
            })?;
            if row.ended_at.is_none() {
                row.ended_at = Some(Utc::now());
            }
            put(&mut table, &key, &row)?;
            row
        };
        txn.commit()?;
        Ok(row)
    }

    // ── Dialogues ────────────────────────────────────────────────────────────

    pub fn create_dialogue(
        &self,
        session_id: &str,
        initiator: &str,
        receiver: &str,
        day: u32,
        time_period: TimePeriod,
        location: &str,
    ) -> Result<Dialogue, StorageError> {
        let txn = self.db.begin_write()?;

        let dialogue = {
            let mut sessions = txn.open_table(SESSIONS)?;
            let mut session: Session = get_row(&sessions, session_id)?
                .ok_or_else(|| StorageError::not_found(format!("session {session_id}")))?;

            let dialogue_id = next_id_in(&txn, IdEntity::Dialogues)?;
            let dialogue = Dialogue {
                dialogue_id,
                session_id: session_id.to_string(),
                initiator: initiator.to_string(),
                receiver: receiver.to_string(),
                day,
                time_period,
                location: location.to_string(),
                started_at: Utc::now(),
                ended_at: None,
                message_ids: Vec::new(),
                summary: None,
                total_text_length: 0,
            };

            let mut dialogues = txn.open_table(DIALOGUES)?;
            put(&mut dialogues, &keys::id_key(dialogue_id), &dialogue)?;

            let mut by_session = txn.open_table(DIALOGUES_BY_SESSION)?;
            by_session.insert(
                keys::session_dialogue_key(session_id, dialogue_id).as_str(),
                EMPTY,
            )?;

            session.dialogue_ids.push(dialogue_id);
            session.last_updated = Utc::now();
            put(&mut sessions, session_id, &session)?;

            // Day rows are created lazily by the first dialogue of the day.
            let mut days = txn.open_table(DAYS)?;
            let day_key = keys::day_key(session_id, day);
            let mut day_row: Day = get_row(&days, &day_key)?
                .unwrap_or_else(|| Day::new(session_id.to_string(), day, time_period));
            day_row.dialogue_ids.push(dialogue_id);
            put(&mut days, &day_key, &day_row)?;

            dialogue
        };
        txn.commit()?;

        debug!(
            dialogue_id = dialogue.dialogue_id,
            initiator, receiver, "dialogue created"
        );
        Ok(dialogue)
    }

    pub fn find_dialogue(&self, dialogue_id: DialogueId) -> Result<Option<Dialogue>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DIALOGUES)?;
        get_row(&table, &keys::id_key(dialogue_id))
    }

    pub fn get_dialogue(&self, dialogue_id: DialogueId) -> Result<Dialogue, StorageError> {
        self.find_dialogue(dialogue_id)?
            .ok_or_else(|| StorageError::not_found(format!("dialogue {dialogue_id}")))
    }

    pub fn append_message(
        &self,
        dialogue_id: DialogueId,
        sender: &str,
        receiver: &str,
        message_text: &str,
    ) -> Result<Message, StorageError> {
        let txn = self.db.begin_write()?;

        let message = {
            let mut dialogues = txn.open_table(DIALOGUES)?;
            let dialogue_key = keys::id_key(dialogue_id);
            let mut dialogue: Dialogue = get_row(&dialogues, &dialogue_key)?
                .ok_or_else(|| StorageError::not_found(format!("dialogue {dialogue_id}")))?;
            if dialogue.is_ended() {
                return Err(StorageError::conflict(format!(
                    "dialogue {dialogue_id} already ended"
                )));
            }

            let message_id = next_id_in(&txn, IdEntity::Messages)?;
            let message = Message {
                message_id,
                dialogue_id,
                sender: sender.to_string(),
                receiver: receiver.to_string(),
                message_text: message_text.to_string(),
                timestamp: Utc::now(),
                sender_opinion: None,
                receiver_opinion: None,
            };

            let mut messages = txn.open_table(MESSAGES)?;
            put(&mut messages, &keys::id_key(message_id), &message)?;

            let mut by_dialogue = txn.open_table(MESSAGES_BY_DIALOGUE)?;
            by_dialogue.insert(
                keys::dialogue_message_key(dialogue_id, message_id).as_str(),
                EMPTY,
            )?;
            let mut by_sender = txn.open_table(MESSAGES_BY_SENDER)?;
            by_sender.insert(keys::name_message_key(sender, message_id).as_str(), EMPTY)?;
            let mut by_receiver = txn.open_table(MESSAGES_BY_RECEIVER)?;
            by_receiver.insert(keys::name_message_key(receiver, message_id).as_str(), EMPTY)?;

            dialogue.message_ids.push(message_id);
            dialogue.total_text_length += message_text.len();
            put(&mut dialogues, &dialogue_key, &dialogue)?;

            message
        };
        txn.commit()?;
        Ok(message)
    }

    pub fn end_dialogue(
        &self,
        dialogue_id: DialogueId,
        summary: Option<String>,
    ) -> Result<Dialogue, StorageError> {
        let txn = self.db.begin_write()?;
        let dialogue = {
            let mut dialogues = txn.open_table(DIALOGUES)?;
            let key = keys::id_key(dialogue_id);
            let mut dialogue: Dialogue = get_row(&dialogues, &key)?
                .ok_or_else(|| StorageError::not_found(format!("dialogue {dialogue_id}")))?;
            if dialogue.is_ended() {
                return Err(StorageError::conflict(format!(
                    "dialogue {dialogue_id} already ended"
                )));
            }
            dialogue.ended_at = Some(Utc::now());
            if summary.is_some() {
                dialogue.summary = summary;
            }
            put(&mut dialogues, &key, &dialogue)?;
            dialogue
        };
        txn.commit()?;
        Ok(dialogue)
    }

    /// Messages of one dialogue, in allocation order.
    pub fn dialogue_messages(&self, dialogue_id: DialogueId) -> Result<Vec<Message>, StorageError> {
        let txn = self.db.begin_read()?;
        let by_dialogue = txn.open_table(MESSAGES_BY_DIALOGUE)?;
        let message_keys = scan_prefix_keys(&by_dialogue, &keys::prefix(&keys::id_key(dialogue_id)))?;

        let messages = txn.open_table(MESSAGES)?;
        let mut rows = Vec::with_capacity(message_keys.len());
        for key in message_keys {
            let message_id = keys::parse_id_key(keys::suffix(&key))
                .ok_or_else(|| StorageError::Corrupt(format!("bad message index key {key}")))?;
            if let Some(row) = get_row::<Message>(&messages, &keys::id_key(message_id))? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    pub fn dialogues_for_session(&self, session_id: &str) -> Result<Vec<Dialogue>, StorageError> {
        let txn = self.db.begin_read()?;
        let by_session = txn.open_table(DIALOGUES_BY_SESSION)?;
        let dialogue_keys = scan_prefix_keys(&by_session, &keys::prefix(session_id))?;

        let dialogues = txn.open_table(DIALOGUES)?;
        let mut rows = Vec::with_capacity(dialogue_keys.len());
        for key in dialogue_keys {
            let dialogue_id = keys::parse_id_key(keys::suffix(&key))
                .ok_or_else(|| StorageError::Corrupt(format!("bad dialogue index key {key}")))?;
            if let Some(row) = get_row::<Dialogue>(&dialogues, &keys::id_key(dialogue_id))? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Most recent dialogues a character took part in, oldest first.
    pub fn dialogues_for_npc(
        &self,
        session_id: &str,
        npc_name: &str,
        limit: usize,
    ) -> Result<Vec<Dialogue>, StorageError> {
        let mut rows: Vec<Dialogue> = self
            .dialogues_for_session(session_id)?
            .into_iter()
            .filter(|d| d.initiator == npc_name || d.receiver == npc_name)
            .collect();
        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        Ok(rows)
    }

    pub fn messages_from_sender(&self, sender: &str) -> Result<Vec<Message>, StorageError> {
        self.messages_by_name(MESSAGES_BY_SENDER, sender)
    }

    pub fn messages_to_receiver(&self, receiver: &str) -> Result<Vec<Message>, StorageError> {
        self.messages_by_name(MESSAGES_BY_RECEIVER, receiver)
    }

    fn messages_by_name(
        &self,
        index: TableDefinition<&'static str, &'static [u8]>,
        name: &str,
    ) -> Result<Vec<Message>, StorageError> {
        let txn = self.db.begin_read()?;
        let index = txn.open_table(index)?;
        let index_keys = scan_prefix_keys(&index, &keys::prefix(name))?;

        let messages = txn.open_table(MESSAGES)?;
        let mut rows = Vec::with_capacity(index_keys.len());
        for key in index_keys {
            let message_id = keys::parse_id_key(keys::suffix(&key))
                .ok_or_else(|| StorageError::Corrupt(format!("bad message index key {key}")))?;
            if let Some(row) = get_row::<Message>(&messages, &keys::id_key(message_id))? {
                rows.push(row);
            }
        }
        rows.sort_by_key(|m| m.message_id);
        Ok(rows)
    }

    // ── NPC memories ─────────────────────────────────────────────────────────

    pub fn get_npc_memory(
        &self,
        session_id: &str,
        npc_name: &str,
    ) -> Result<Option<NpcMemory>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(NPC_MEMORIES)?;
        get_row(&table, &keys::npc_key(session_id, npc_name))
    }

    pub fn upsert_npc_memory(&self, mut memory: NpcMemory) -> Result<NpcMemory, StorageError> {
        memory.last_updated = Utc::now();
        let key = keys::npc_key(&memory.session_id, &memory.npc_name);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(NPC_MEMORIES)?;
            put(&mut table, &key, &memory)?;
        }
        txn.commit()?;
        Ok(memory)
    }

    pub fn npc_memories_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<NpcMemory>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(NPC_MEMORIES)?;
        scan_prefix_rows(&table, &keys::prefix(session_id))
    }

    // ── Purge ────────────────────────────────────────────────────────────────

    /// Removes everything belonging to a session: messages, then dialogues,
    /// then days, then NPC memories, then the session row itself.
    pub fn delete_session_data(&self, session_id: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut by_session = txn.open_table(DIALOGUES_BY_SESSION)?;
            let dialogue_keys = scan_prefix_keys(&by_session, &keys::prefix(session_id))?;
            let dialogue_ids: Vec<DialogueId> = dialogue_keys
                .iter()
                .filter_map(|k| keys::parse_id_key(keys::suffix(k)))
                .collect();

            let mut messages = txn.open_table(MESSAGES)?;
            let mut by_dialogue = txn.open_table(MESSAGES_BY_DIALOGUE)?;
            let mut by_sender = txn.open_table(MESSAGES_BY_SENDER)?;
            let mut by_receiver = txn.open_table(MESSAGES_BY_RECEIVER)?;
            let mut dialogues = txn.open_table(DIALOGUES)?;

            for dialogue_id in &dialogue_ids {
                let message_keys =
                    scan_prefix_keys(&by_dialogue, &keys::prefix(&keys::id_key(*dialogue_id)))?;
                for key in &message_keys {
                    let Some(message_id) = keys::parse_id_key(keys::suffix(key)) else {
                        continue;
                    };
                    let message_key = keys::id_key(message_id);
                    if let Some(row) = get_row::<Message>(&messages, &message_key)? {
                        by_sender.remove(keys::name_message_key(&row.sender, message_id).as_str())?;
                        by_receiver
                            .remove(keys::name_message_key(&row.receiver, message_id).as_str())?;
                    }
                    messages.remove(message_key.as_str())?;
                    by_dialogue.remove(key.as_str())?;
                }
                dialogues.remove(keys::id_key(*dialogue_id).as_str())?;
            }
            for key in &dialogue_keys {
                by_session.remove(key.as_str())?;
            }

            let mut days = txn.open_table(DAYS)?;
            for key in scan_prefix_keys(&days, &keys::prefix(session_id))? {
                days.remove(key.as_str())?;
            }

            let mut memories = txn.open_table(NPC_MEMORIES)?;
            for key in scan_prefix_keys(&memories, &keys::prefix(session_id))? {
                memories.remove(key.as_str())?;
            }

            let mut sessions = txn.open_table(SESSIONS)?;
            sessions.remove(session_id)?;
        }
        txn.commit()?;

        debug!(session_id, "session data purged");
        Ok(())
    }
}

// ── Row helpers ──────────────────────────────────────────────────────────────

fn put<T: Serialize>(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
    row: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(row)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

fn get_row<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn scan_prefix_keys(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<String>, StorageError> {
    let mut keys = Vec::new();
    for item in table.range(prefix..)? {
        let (key, _) = item?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

fn scan_prefix_rows<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<T>, StorageError> {
    let mut rows = Vec::new();
    for item in table.range(prefix..)? {
        let (key, value) = item?;
        if !key.value().starts_with(prefix) {
            break;
        }
        rows.push(serde_json::from_slice(value.value())?);
    }
    Ok(rows)
}

/// Atomically hand out the next ID for `entity` within `txn`.  On first use
/// the counter aligns to one past the largest pre-existing ID so imported
/// data never collides.
fn next_id_in(txn: &redb::WriteTransaction, entity: IdEntity) -> Result<u64, StorageError> {
    let mut counters = txn.open_table(ID_COUNTERS)?;
    let current = match counters.get(entity.as_str())? {
        Some(guard) => guard.value(),
        None => max_existing_id(txn, entity)?.map_or(0, |max| max + 1),
    };
    counters.insert(entity.as_str(), current + 1)?;
    Ok(current)
}

fn max_existing_id(
    txn: &redb::WriteTransaction,
    entity: IdEntity,
) -> Result<Option<u64>, StorageError> {
    let table = match entity {
        IdEntity::Sessions => txn.open_table(SESSIONS)?,
        IdEntity::Dialogues => txn.open_table(DIALOGUES)?,
        IdEntity::Messages => txn.open_table(MESSAGES)?,
    };

    let mut max = None;
    for item in table.iter()? {
        let (key, _) = item?;
        if let Ok(id) = key.value().parse::<u64>() {
            max = Some(max.map_or(id, |m: u64| m.max(id)));
        }
    }
    Ok(max)
}
