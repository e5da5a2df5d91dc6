//! Bounded conversation execution: the dialogue state machine, its limits
//! and its post-dialogue social updates.

pub mod engine;
pub mod error;
pub mod limits;

pub use engine::{DialogueEngine, render_dialogue_text};
pub use error::DialogueError;
pub use limits::{DialogueLimits, GOODBYE_PHRASES, contains_goodbye, count_tokens};

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use folksim_agents::{
        KnowledgeAgent, OpinionAgent, ReputationAgent, SocialAgents, StanceAgent,
    };
    use folksim_config::{GameSettings, TimePeriod};
    use folksim_llm::testing::ScriptedBackend;
    use folksim_llm::{CompletionClient, LlmSelection};
    use folksim_memory::MemoryService;
    use folksim_npc::{FALLBACK_FAREWELL, NpcSpeaker};
    use folksim_store::{Session, Store};

    struct Harness {
        _dir: tempfile::TempDir,
        store: Store,
        engine: DialogueEngine,
        session: Session,
    }

    fn fast(mut limits: DialogueLimits) -> DialogueLimits {
        limits.turn_delay = Duration::from_millis(1);
        limits
    }

    async fn harness(
        limits: DialogueLimits,
        backend: Arc<ScriptedBackend>,
        agents_enabled: bool,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("state.redb")).unwrap();
        let llm = CompletionClient::new(backend);
        let memory = MemoryService::new(store.clone(), llm.clone(), LlmSelection::test(), 100_000);
        let speaker = NpcSpeaker::new(
            store.clone(),
            memory.clone(),
            llm.clone(),
            LlmSelection::parse("ollama", "chat-model").unwrap(),
        );
        let agents = SocialAgents {
            opinion: OpinionAgent::new(llm.clone(), LlmSelection::test(), agents_enabled),
            stance: StanceAgent::new(llm.clone(), LlmSelection::test(), agents_enabled),
            knowledge: KnowledgeAgent::new(llm.clone(), LlmSelection::test(), agents_enabled),
            reputation: ReputationAgent::new(llm.clone(), LlmSelection::test(), agents_enabled),
        };
        let engine = DialogueEngine::new(store.clone(), memory, speaker, agents, limits);

        let session = store
            .create_session(None, GameSettings::default_cast())
            .await
            .unwrap();

        Harness {
            _dir: dir,
            store,
            engine,
            session,
        }
    }

    #[tokio::test]
    async fn self_pair_is_rejected() {
        let h = harness(
            fast(DialogueLimits::default()),
            Arc::new(ScriptedBackend::default_reply("hi")),
            false,
        )
        .await;
        let result = h
            .engine
            .execute_dialogue(
                &h.session.session_id,
                "Elara",
                "Elara",
                "inn",
                TimePeriod::Morning,
            )
            .await;
        assert!(matches!(result, Err(DialogueError::Validation(_))));
    }

    #[tokio::test]
    async fn max_messages_one_ends_after_single_message() {
        let limits = fast(DialogueLimits {
            max_messages: 1,
            ..DialogueLimits::default()
        });
        let h = harness(
            limits,
            Arc::new(ScriptedBackend::default_reply("A fine morning to you.")),
            false,
        )
        .await;

        let dialogue = h
            .engine
            .execute_dialogue(
                &h.session.session_id,
                "Elara",
                "Grak",
                "The Gilded Tankard",
                TimePeriod::Morning,
            )
            .await
            .unwrap();

        assert!(dialogue.is_ended());
        let messages = h.store.dialogue_messages(dialogue.dialogue_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_text, "A fine morning to you.");
    }

    #[tokio::test]
    async fn goodbye_threshold_short_circuits() {
        let limits = fast(DialogueLimits {
            max_messages: 10,
            goodbye_threshold: 2,
            ..DialogueLimits::default()
        });
        let h = harness(
            limits,
            Arc::new(ScriptedBackend::default_reply("A fine tale. Goodbye, friend!")),
            false,
        )
        .await;

        let dialogue = h
            .engine
            .execute_dialogue(
                &h.session.session_id,
                "Elara",
                "Grak",
                "inn",
                TimePeriod::Noon,
            )
            .await
            .unwrap();

        let messages = h.store.dialogue_messages(dialogue.dialogue_id).await.unwrap();
        assert_eq!(messages.len(), 2, "one goodbye per turn, two turns to threshold");
    }

    #[tokio::test]
    async fn goodbye_threshold_of_one_ends_after_greeting() {
        let limits = fast(DialogueLimits {
            goodbye_threshold: 1,
            ..DialogueLimits::default()
        });
        let h = harness(
            limits,
            Arc::new(ScriptedBackend::default_reply("Hello and bye for now.")),
            false,
        )
        .await;

        let dialogue = h
            .engine
            .execute_dialogue(
                &h.session.session_id,
                "Anya",
                "Tomas",
                "Market Square",
                TimePeriod::Afternoon,
            )
            .await
            .unwrap();

        let messages = h.store.dialogue_messages(dialogue.dialogue_id).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn hung_speaker_falls_back_and_forces_ending() {
        let limits = fast(DialogueLimits {
            message_timeout: Duration::from_millis(50),
            ..DialogueLimits::default()
        });
        let h = harness(
            limits,
            Arc::new(
                ScriptedBackend::default_reply("too slow").with_delay(Duration::from_millis(400)),
            ),
            false,
        )
        .await;

        let dialogue = h
            .engine
            .execute_dialogue(
                &h.session.session_id,
                "Elara",
                "Grak",
                "inn",
                TimePeriod::Evening,
            )
            .await
            .unwrap();

        assert!(dialogue.is_ended());
        let messages = h.store.dialogue_messages(dialogue.dialogue_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_text, FALLBACK_FAREWELL);
    }

    #[tokio::test]
    async fn token_budget_bounds_the_dialogue() {
        let limits = fast(DialogueLimits {
            max_messages: 10,
            max_tokens: 10,
            ..DialogueLimits::default()
        });
        // 12 words ⇒ ⌈15.6⌉ = 16 tokens, over budget after one message.
        let h = harness(
            limits,
            Arc::new(ScriptedBackend::default_reply(
                "so many words in this single reply that the budget is gone",
            )),
            false,
        )
        .await;

        let dialogue = h
            .engine
            .execute_dialogue(
                &h.session.session_id,
                "Elara",
                "Grak",
                "inn",
                TimePeriod::Night,
            )
            .await
            .unwrap();

        let messages = h.store.dialogue_messages(dialogue.dialogue_id).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_active_dialogue_is_refused() {
        let h = harness(
            fast(DialogueLimits::default()),
            Arc::new(ScriptedBackend::default_reply("hi")),
            false,
        )
        .await;
        assert!(h.engine.register_active_for_test("Elara", "Grak", TimePeriod::Morning));

        let result = h
            .engine
            .execute_dialogue(
                &h.session.session_id,
                "Elara",
                "Grak",
                "inn",
                TimePeriod::Morning,
            )
            .await;
        assert!(matches!(result, Err(DialogueError::State(_))));

        // A different phase is a different key.
        let ok = h
            .engine
            .execute_dialogue(
                &h.session.session_id,
                "Elara",
                "Grak",
                "inn",
                TimePeriod::Noon,
            )
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn key_is_released_after_completion() {
        let h = harness(
            fast(DialogueLimits {
                max_messages: 1,
                ..DialogueLimits::default()
            }),
            Arc::new(ScriptedBackend::default_reply("short")),
            false,
        )
        .await;

        for _ in 0..2 {
            h.engine
                .execute_dialogue(
                    &h.session.session_id,
                    "Elara",
                    "Grak",
                    "inn",
                    TimePeriod::Morning,
                )
                .await
                .unwrap();
        }
        assert_eq!(
            h.store
                .dialogues_for_session(&h.session.session_id)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn post_dialogue_updates_social_state_for_both() {
        let limits = fast(DialogueLimits {
            max_messages: 2,
            ..DialogueLimits::default()
        });
        let h = harness(
            limits,
            Arc::new(ScriptedBackend::default_reply("The mill burned down, you know.")),
            true,
        )
        .await;

        let dialogue = h
            .engine
            .execute_dialogue(
                &h.session.session_id,
                "Elara",
                "Grak",
                "The Old Forge",
                TimePeriod::Noon,
            )
            .await
            .unwrap();
        assert!(dialogue.is_ended());

        let elara = h
            .store
            .get_npc_memory(&h.session.session_id, "Elara")
            .await
            .unwrap()
            .unwrap();
        let grak = h
            .store
            .get_npc_memory(&h.session.session_id, "Grak")
            .await
            .unwrap()
            .unwrap();

        assert!(elara.social_stance.contains_key("Grak"));
        assert!(grak.social_stance.contains_key("Elara"));
        assert!(!elara.world_knowledge.is_empty());
        assert!(!grak.world_knowledge.is_empty());
        // Grak replied to Elara's opener, so he judged her mid-dialogue.
        assert!(grak.opinion_on_npcs.contains_key("Elara"));

        let session = h.store.get_session(&h.session.session_id).await.unwrap();
        let rep_a = session.reputations.get("Elara").expect("reputation for Elara");
        let rep_b = session.reputations.get("Grak").expect("reputation for Grak");
        assert!(!rep_a.is_empty() && rep_a.split_whitespace().count() <= 2);
        assert!(!rep_b.is_empty() && rep_b.split_whitespace().count() <= 2);
    }

    #[tokio::test]
    async fn disabled_agents_leave_social_state_untouched() {
        let h = harness(
            fast(DialogueLimits {
                max_messages: 2,
                ..DialogueLimits::default()
            }),
            Arc::new(ScriptedBackend::default_reply("Quiet day at the market.")),
            false,
        )
        .await;

        h.engine
            .execute_dialogue(
                &h.session.session_id,
                "Anya",
                "Tomas",
                "Market Square",
                TimePeriod::Noon,
            )
            .await
            .unwrap();

        let anya = h
            .store
            .get_npc_memory(&h.session.session_id, "Anya")
            .await
            .unwrap()
            .unwrap();
        assert!(anya.social_stance.is_empty());
        assert!(anya.world_knowledge.is_empty());

        let session = h.store.get_session(&h.session.session_id).await.unwrap();
        assert!(session.reputations.is_empty());
    }
}
