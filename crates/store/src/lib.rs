//! Durable state for the simulation.
//!
//! The [`Store`] is the sole owner of persistent rows.  A single writer
//! mutex serializes every logical read-modify-write sequence; reads bypass
//! it and run concurrently.  All redb work happens on the blocking pool so
//! the simulation tasks never stall on disk I/O, and no caller is ever
//! allowed to hold the write lock across LLM I/O.

pub mod db;
pub mod entities;
pub mod error;
pub mod keys;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task;

use folksim_config::{CharacterSpec, GameSettings, TimePeriod};

pub use entities::{Day, Dialogue, DialogueId, IdEntity, Message, MessageId, NpcMemory, Session};
pub use error::StorageError;

use db::StoreDb;

#[derive(Clone)]
pub struct Store {
    db: Arc<StoreDb>,
    write_lock: Arc<Mutex<()>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: Arc::new(StoreDb::open(path)?),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&StoreDb) -> Result<T, StorageError> + Send + 'static,
    {
        let db = self.db.clone();
        task::spawn_blocking(move || op(&db))
            .await
            .map_err(|err| StorageError::Busy(format!("store worker: {err}")))?
    }

    /// Mutating operations funnel through here: the writer mutex is held for
    /// the whole logical sequence, read-modify-write included.
    async fn run_write<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&StoreDb) -> Result<T, StorageError> + Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        self.run(op).await
    }

    // ── IDs ──────────────────────────────────────────────────────────────────

    pub async fn allocate_id(&self, entity: IdEntity) -> Result<u64, StorageError> {
        self.run_write(move |db| db.allocate_id(entity)).await
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        session_id: Option<String>,
        settings: GameSettings,
    ) -> Result<Session, StorageError> {
        self.run_write(move |db| db.create_session(session_id, settings))
            .await
    }

    pub async fn find_session(&self, session_id: &str) -> Result<Option<Session>, StorageError> {
        let id = session_id.to_string();
        self.run(move |db| db.find_session(&id)).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, StorageError> {
        let id = session_id.to_string();
        self.run(move |db| db.get_session(&id)).await
    }

    pub async fn update_session(&self, session: Session) -> Result<Session, StorageError> {
        self.run_write(move |db| db.update_session(session)).await
    }

    pub async fn update_session_with<F>(
        &self,
        session_id: &str,
        mutate: F,
    ) -> Result<Session, StorageError>
    where
        F: FnOnce(&mut Session) + Send + 'static,
    {
        let id = session_id.to_string();
        self.run_write(move |db| db.update_session_with(&id, mutate))
            .await
    }

    // ── Days ─────────────────────────────────────────────────────────────────

    pub async fn upsert_day(
        &self,
        session_id: &str,
        day: u32,
        time_period: TimePeriod,
        active_npcs: Vec<String>,
        passive_npcs: Vec<String>,
    ) -> Result<Day, StorageError> {
        let id = session_id.to_string();
        self.run_write(move |db| db.upsert_day(&id, day, time_period, active_npcs, passive_npcs))
            .await
    }

    pub async fn find_day(&self, session_id: &str, day: u32) -> Result<Option<Day>, StorageError> {
        let id = session_id.to_string();
        self.run(move |db| db.find_day(&id, day)).await
    }

    pub async fn get_day(&self, session_id: &str, day: u32) -> Result<Day, StorageError> {
        let id = session_id.to_string();
        self.run(move |db| db.get_day(&id, day)).await
    }

    pub async fn update_day(&self, day: Day) -> Result<Day, StorageError> {
        self.run_write(move |db| db.update_day(day)).await
    }

    pub async fn close_day(&self, session_id: &str, day: u32) -> Result<Day, StorageError> {
        let id = session_id.to_string();
        self.run_write(move |db| db.close_day(&id, day)).await
    }

    pub async fn update_day_with<F>(
        &self,
        session_id: &str,
        day: u32,
        mutate: F,
    ) -> Result<Day, StorageError>
    where
        F: FnOnce(&mut Day) + Send + 'static,
    {
        let id = session_id.to_string();
        self.run_write(move |db| {
            let mut row = db.get_day(&id, day)?;
            mutate(&mut row);
            db.update_day(row)
        })
        .await
    }

    // ── Dialogues & messages ─────────────────────────────────────────────────

    pub async fn create_dialogue(
        &self,
        session_id: &str,
        initiator: &str,
        receiver: &str,
        day: u32,
        time_period: TimePeriod,
        location: &str,
    ) -> Result<Dialogue, StorageError> {
        let (id, a, b, loc) = (
            session_id.to_string(),
            initiator.to_string(),
            receiver.to_string(),
            location.to_string(),
        );
        self.run_write(move |db| db.create_dialogue(&id, &a, &b, day, time_period, &loc))
            .await
    }

    pub async fn get_dialogue(&self, dialogue_id: DialogueId) -> Result<Dialogue, StorageError> {
        self.run(move |db| db.get_dialogue(dialogue_id)).await
    }

    pub async fn append_message(
        &self,
        dialogue_id: DialogueId,
        sender: &str,
        receiver: &str,
        message_text: &str,
    ) -> Result<Message, StorageError> {
        let (s, r, text) = (
            sender.to_string(),
            receiver.to_string(),
            message_text.to_string(),
        );
        self.run_write(move |db| db.append_message(dialogue_id, &s, &r, &text))
            .await
    }

    pub async fn end_dialogue(
        &self,
        dialogue_id: DialogueId,
        summary: Option<String>,
    ) -> Result<Dialogue, StorageError> {
        self.run_write(move |db| db.end_dialogue(dialogue_id, summary))
            .await
    }

    pub async fn dialogue_messages(
        &self,
        dialogue_id: DialogueId,
    ) -> Result<Vec<Message>, StorageError> {
        self.run(move |db| db.dialogue_messages(dialogue_id)).await
    }

    pub async fn dialogues_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<Dialogue>, StorageError> {
        let id = session_id.to_string();
        self.run(move |db| db.dialogues_for_session(&id)).await
    }

    pub async fn dialogues_for_npc(
        &self,
        session_id: &str,
        npc_name: &str,
        limit: usize,
    ) -> Result<Vec<Dialogue>, StorageError> {
        let (id, npc) = (session_id.to_string(), npc_name.to_string());
        self.run(move |db| db.dialogues_for_npc(&id, &npc, limit))
            .await
    }

    pub async fn messages_from_sender(&self, sender: &str) -> Result<Vec<Message>, StorageError> {
        let name = sender.to_string();
        self.run(move |db| db.messages_from_sender(&name)).await
    }

    pub async fn messages_to_receiver(
        &self,
        receiver: &str,
    ) -> Result<Vec<Message>, StorageError> {
        let name = receiver.to_string();
        self.run(move |db| db.messages_to_receiver(&name)).await
    }

    // ── NPC memories ─────────────────────────────────────────────────────────

    pub async fn get_npc_memory(
        &self,
        session_id: &str,
        npc_name: &str,
    ) -> Result<Option<NpcMemory>, StorageError> {
        let (id, npc) = (session_id.to_string(), npc_name.to_string());
        self.run(move |db| db.get_npc_memory(&id, &npc)).await
    }

    pub async fn upsert_npc_memory(&self, memory: NpcMemory) -> Result<NpcMemory, StorageError> {
        self.run_write(move |db| db.upsert_npc_memory(memory)).await
    }

    /// Read-modify-write of one NPC memory under the write lock, creating the
    /// row from `properties` on first reference.
    pub async fn update_npc_memory_with<F>(
        &self,
        session_id: &str,
        npc_name: &str,
        properties: CharacterSpec,
        mutate: F,
    ) -> Result<NpcMemory, StorageError>
    where
        F: FnOnce(&mut NpcMemory) + Send + 'static,
    {
        let (id, npc) = (session_id.to_string(), npc_name.to_string());
        self.run_write(move |db| {
            let mut memory = db
                .get_npc_memory(&id, &npc)?
                .unwrap_or_else(|| NpcMemory::new(npc.clone(), id.clone(), properties));
            mutate(&mut memory);
            db.upsert_npc_memory(memory)
        })
        .await
    }

    pub async fn npc_memories_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<NpcMemory>, StorageError> {
        let id = session_id.to_string();
        self.run(move |db| db.npc_memories_for_session(&id)).await
    }

    // ── Purge ────────────────────────────────────────────────────────────────

    pub async fn delete_session_data(&self, session_id: &str) -> Result<(), StorageError> {
        let id = session_id.to_string();
        self.run_write(move |db| db.delete_session_data(&id)).await
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use folksim_config::TimePeriod;

    fn settings() -> GameSettings {
        GameSettings::default_cast()
    }

    async fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(dir.path().join("state.redb")).unwrap()
    }

    #[tokio::test]
    async fn session_roundtrip_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let created = store
            .create_session(Some("exp-1".to_string()), settings())
            .await
            .unwrap();
        assert_eq!(created.current_day, 1);
        assert_eq!(created.current_period, TimePeriod::Morning);

        let loaded = store.get_session("exp-1").await.unwrap();
        assert_eq!(loaded.session_id, created.session_id);
        assert_eq!(loaded.dialogue_ids, created.dialogue_ids);

        let duplicate = store.create_session(Some("exp-1".to_string()), settings()).await;
        assert!(matches!(duplicate, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn allocated_session_ids_are_monotone_integers() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let first = store.create_session(None, settings()).await.unwrap();
        let second = store.create_session(None, settings()).await.unwrap();
        assert_eq!(first.session_id, "0");
        assert_eq!(second.session_id, "1");
    }

    #[tokio::test]
    async fn dialogue_and_message_ids_start_at_zero_and_increase() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let session = store.create_session(None, settings()).await.unwrap();

        let dialogue = store
            .create_dialogue(
                &session.session_id,
                "Elara",
                "Grak",
                1,
                TimePeriod::Morning,
                "The Gilded Tankard",
            )
            .await
            .unwrap();
        assert_eq!(dialogue.dialogue_id, 0);

        let m0 = store
            .append_message(dialogue.dialogue_id, "Elara", "Grak", "hello")
            .await
            .unwrap();
        let m1 = store
            .append_message(dialogue.dialogue_id, "Grak", "Elara", "well met")
            .await
            .unwrap();
        assert_eq!((m0.message_id, m1.message_id), (0, 1));

        let reloaded = store.get_dialogue(dialogue.dialogue_id).await.unwrap();
        assert_eq!(reloaded.message_ids, vec![0, 1]);
        assert_eq!(reloaded.total_text_length, "hello".len() + "well met".len());

        let session = store.get_session(&session.session_id).await.unwrap();
        assert_eq!(session.dialogue_ids, vec![0]);

        let day = store.get_day(&session.session_id, 1).await.unwrap();
        assert_eq!(day.dialogue_ids, vec![0]);
    }

    #[tokio::test]
    async fn ids_survive_reopen_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let last_id = {
            let store = open_store(&dir).await;
            let session = store.create_session(None, settings()).await.unwrap();
            let dialogue = store
                .create_dialogue(&session.session_id, "Elara", "Grak", 1, TimePeriod::Noon, "sq")
                .await
                .unwrap();
            store
                .append_message(dialogue.dialogue_id, "Elara", "Grak", "hi")
                .await
                .unwrap();
            dialogue.dialogue_id
        };

        let store = open_store(&dir).await;
        let next_dialogue = store.allocate_id(IdEntity::Dialogues).await.unwrap();
        let next_message = store.allocate_id(IdEntity::Messages).await.unwrap();
        assert!(next_dialogue > last_id);
        assert_eq!(next_message, 1);
    }

    #[tokio::test]
    async fn ended_dialogue_rejects_appends_and_double_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let session = store.create_session(None, settings()).await.unwrap();
        let dialogue = store
            .create_dialogue(&session.session_id, "Anya", "Tomas", 1, TimePeriod::Noon, "sq")
            .await
            .unwrap();

        let ended = store.end_dialogue(dialogue.dialogue_id, None).await.unwrap();
        assert!(ended.is_ended());

        let append = store
            .append_message(dialogue.dialogue_id, "Anya", "Tomas", "late")
            .await;
        assert!(matches!(append, Err(StorageError::Conflict(_))));

        let again = store.end_dialogue(dialogue.dialogue_id, None).await;
        assert!(matches!(again, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn message_indices_are_ordered_and_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let session = store.create_session(None, settings()).await.unwrap();
        let dialogue = store
            .create_dialogue(&session.session_id, "Elara", "Grak", 2, TimePeriod::Evening, "inn")
            .await
            .unwrap();

        for (sender, receiver, text) in [
            ("Elara", "Grak", "one"),
            ("Grak", "Elara", "two"),
            ("Elara", "Grak", "three"),
        ] {
            store
                .append_message(dialogue.dialogue_id, sender, receiver, text)
                .await
                .unwrap();
        }

        let messages = store.dialogue_messages(dialogue.dialogue_id).await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.message_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(messages.len(), 3);

        let from_elara = store.messages_from_sender("Elara").await.unwrap();
        assert_eq!(from_elara.len(), 2);
        let to_elara = store.messages_to_receiver("Elara").await.unwrap();
        assert_eq!(to_elara.len(), 1);
    }

    #[tokio::test]
    async fn npc_memory_upsert_and_mutator() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let session = store.create_session(None, settings()).await.unwrap();
        let props = session.settings.character("Elara").unwrap().clone();

        let updated = store
            .update_npc_memory_with(&session.session_id, "Elara", props, |mem| {
                mem.opinion_on_npcs
                    .insert("Grak".to_string(), "trustworthy".to_string());
                mem.record_dialogue(0);
            })
            .await
            .unwrap();
        assert_eq!(updated.opinion_on_npcs["Grak"], "trustworthy");

        let loaded = store
            .get_npc_memory(&session.session_id, "Elara")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.dialogue_ids, vec![0]);
        assert_eq!(loaded.character_properties.role, "Innkeeper");
    }

    #[tokio::test]
    async fn purge_leaves_no_orphans_and_id_allocation_stays_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let session = store
            .create_session(Some("wipe-me".to_string()), settings())
            .await
            .unwrap();
        let dialogue = store
            .create_dialogue(&session.session_id, "Elara", "Grak", 1, TimePeriod::Morning, "inn")
            .await
            .unwrap();
        store
            .append_message(dialogue.dialogue_id, "Elara", "Grak", "soon gone")
            .await
            .unwrap();
        store
            .update_npc_memory_with(
                &session.session_id,
                "Elara",
                CharacterSpec::default(),
                |_| {},
            )
            .await
            .unwrap();

        store.delete_session_data("wipe-me").await.unwrap();

        assert!(store.find_session("wipe-me").await.unwrap().is_none());
        assert!(store.find_day("wipe-me", 1).await.unwrap().is_none());
        assert!(
            store
                .get_npc_memory("wipe-me", "Elara")
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.dialogues_for_session("wipe-me").await.unwrap().is_empty());
        assert!(store.messages_from_sender("Elara").await.unwrap().is_empty());

        // Recreate under the same id; IDs must not be reused.
        let session = store
            .create_session(Some("wipe-me".to_string()), settings())
            .await
            .unwrap();
        let dialogue = store
            .create_dialogue(&session.session_id, "Elara", "Grak", 1, TimePeriod::Morning, "inn")
            .await
            .unwrap();
        assert!(dialogue.dialogue_id > 0);
    }

    #[tokio::test]
    async fn closing_a_day_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let session = store.create_session(None, settings()).await.unwrap();
        store
            .upsert_day(
                &session.session_id,
                1,
                TimePeriod::Night,
                vec!["Elara".to_string()],
                vec![],
            )
            .await
            .unwrap();

        let closed = store.close_day(&session.session_id, 1).await.unwrap();
        let stamp = closed.ended_at;
        assert!(stamp.is_some());

        let again = store.close_day(&session.session_id, 1).await.unwrap();
        assert_eq!(again.ended_at, stamp);

        let missing = store.close_day(&session.session_id, 99).await;
        assert!(matches!(missing, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn day_upsert_refreshes_split_but_keeps_dialogues() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let session = store.create_session(None, settings()).await.unwrap();
        store
            .create_dialogue(&session.session_id, "Elara", "Grak", 3, TimePeriod::Morning, "inn")
            .await
            .unwrap();

        let day = store
            .upsert_day(
                &session.session_id,
                3,
                TimePeriod::Noon,
                vec!["Elara".to_string(), "Grak".to_string()],
                vec!["Anya".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(day.time_period, TimePeriod::Noon);
        assert_eq!(day.dialogue_ids.len(), 1);
        assert_eq!(day.active_npcs.len(), 2);
        assert_eq!(day.passive_npcs, vec!["Anya".to_string()]);
    }
}
