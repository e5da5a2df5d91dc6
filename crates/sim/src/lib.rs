//! The top-level day/phase driver.
//!
//! Each simulated day runs lifecycle → (optional) introduction → schedule,
//! then executes every phase in order and every scheduled pair sequentially
//! within its phase.  Cancellation is observed between days, phases and
//! pairs; a dialogue in flight is allowed to reach its ending.  Ordinary
//! per-dialogue failures are logged and skipped; only loss of storage
//! surfaces to the caller.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use folksim_config::{GameSettings, TimePeriod};
use folksim_dialogue::DialogueEngine;
use folksim_memory::MemoryService;
use folksim_scheduler::Scheduler;
use folksim_store::{Session, StorageError, Store};

#[derive(Debug, Clone, Error)]
pub enum SimError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// What one `run_days` call accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub days_completed: u32,
    pub dialogues_executed: u32,
    pub cancelled: bool,
}

pub struct SimulationLoop {
    store: Store,
    memory: MemoryService,
    engine: DialogueEngine,
    scheduler: Scheduler,
    /// Settings used when the session does not exist yet.
    default_settings: GameSettings,
    /// Overrides the world calendar when set (ordered, non-empty).
    periods_override: Option<Vec<TimePeriod>>,
    cancel: CancellationToken,
}

impl SimulationLoop {
    pub fn new(
        store: Store,
        memory: MemoryService,
        engine: DialogueEngine,
        scheduler: Scheduler,
        default_settings: GameSettings,
        periods_override: Option<Vec<TimePeriod>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            memory,
            engine,
            scheduler,
            default_settings,
            periods_override,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Load the session or create it with the default settings, seeding
    /// neutral opinions on first creation.
    async fn ensure_session(&self, session_id: &str) -> Result<Session, SimError> {
        if let Some(session) = self.store.find_session(session_id).await? {
            info!(
                session_id,
                current_day = session.current_day,
                "resuming existing session"
            );
            return Ok(session);
        }

        let session = self
            .store
            .create_session(Some(session_id.to_string()), self.default_settings.clone())
            .await?;
        self.memory.seed_neutral_opinions(&session).await?;
        info!(session_id, "session created");
        Ok(session)
    }

    /// Simulate `num_days` full days starting from the session's current
    /// day.
    pub async fn run_days(&mut self, session_id: &str, num_days: u32) -> Result<RunReport, SimError> {
        let mut session = self.ensure_session(session_id).await?;
        let periods = self
            .periods_override
            .clone()
            .unwrap_or_else(|| session.settings.day_periods());

        let first_day = session.current_day;
        let mut previous_active = session.active_npcs.clone();
        let mut previous_passive: Vec<String> = session
            .settings
            .character_names()
            .into_iter()
            .filter(|name| !previous_active.contains(name))
            .collect();

        let mut report = RunReport::default();

        for day in first_day..first_day + num_days {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }
            info!(session_id, day, "=== starting day cycle ===");

            let (active, passive) = self
                .scheduler
                .run_lifecycle(&session, &previous_active, &previous_passive)
                .await;
            session = {
                let active = active.clone();
                self.store
                    .update_session_with(session_id, move |session| {
                        session.active_npcs = active;
                    })
                    .await?
            };

            if let Some(newcomer) = self.scheduler.run_introduction(&session, &active).await {
                let name = newcomer.name.clone();
                session = self
                    .store
                    .update_session_with(session_id, move |session| {
                        session.settings.add_character(newcomer);
                    })
                    .await?;
                info!(session_id, day, newcomer = %name, "new character joined the cast");
            }

            let schedule = self
                .scheduler
                .build_schedule(&session, &active, day, &periods)
                .await;

            for &phase in &periods {
                if self.cancelled() {
                    report.cancelled = true;
                    break;
                }
                info!(session_id, day, phase = %phase, "--- starting phase ---");

                session = self
                    .store
                    .update_session_with(session_id, move |session| {
                        session.current_day = day;
                        session.current_period = phase;
                    })
                    .await?;
                self.store
                    .upsert_day(session_id, day, phase, active.clone(), passive.clone())
                    .await?;

                let pairs = schedule.get(&phase).cloned().unwrap_or_default();
                for (initiator, recipient) in pairs {
                    if self.cancelled() {
                        report.cancelled = true;
                        break;
                    }
                    // Conversations happen where the recipient is right now.
                    let location = session
                        .settings
                        .character(&recipient)
                        .map(|c| c.location_for(phase).to_string())
                        .unwrap_or_default();

                    match self
                        .engine
                        .execute_dialogue(session_id, &initiator, &recipient, &location, phase)
                        .await
                    {
                        Ok(dialogue) => {
                            report.dialogues_executed += 1;
                            info!(
                                session_id,
                                day,
                                phase = %phase,
                                dialogue_id = dialogue.dialogue_id,
                                initiator,
                                recipient,
                                "dialogue finished"
                            );
                        }
                        Err(err) => {
                            warn!(
                                session_id,
                                day,
                                phase = %phase,
                                initiator,
                                recipient,
                                error = %err,
                                "dialogue failed; continuing with next pair"
                            );
                        }
                    }
                }
                if report.cancelled {
                    break;
                }
            }
            if report.cancelled {
                break;
            }

            // End of day: close the day row, drop the small-talk contexts,
            // advance the clock.
            match self.store.close_day(session_id, day).await {
                Ok(_) => {}
                // No phase wrote a day row; nothing to close.
                Err(StorageError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
            self.memory.clear_conversation_contexts(&active);
            let next_period = periods.first().copied().unwrap_or(TimePeriod::Morning);
            session = self
                .store
                .update_session_with(session_id, move |session| {
                    session.current_day = day + 1;
                    session.current_period = next_period;
                })
                .await?;

            report.days_completed += 1;
            previous_active = active;
            previous_passive = passive;
            info!(session_id, day, "=== day cycle complete ===");
        }

        info!(
            session_id,
            days = report.days_completed,
            dialogues = report.dialogues_executed,
            cancelled = report.cancelled,
            "simulation run finished"
        );
        Ok(report)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
