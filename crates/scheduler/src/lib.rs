//! Per-day orchestration: who is awake, who meets whom in each phase, and
//! the occasional newcomer.
//!
//! Every pass degrades deterministically when the model misbehaves; a day
//! is never aborted because a prompt came back as prose.

pub mod parse;
pub mod prompts;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use folksim_config::{CharacterSpec, TimePeriod};
use folksim_llm::{CompletionClient, LlmSelection, extract_json_object};
use folksim_memory::MemoryService;
use folksim_store::{Session, Store};

use parse::parse_csv_names;
use prompts::CHARACTER_LIMIT;

const PASS_TIMEOUT: Duration = Duration::from_secs(30);

/// Scheduled pairs of one day, keyed by phase.
pub type DaySchedule = HashMap<TimePeriod, Vec<(String, String)>>;

/// The newcomer must be exactly this shape to take effect.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IntroducedCharacter {
    name: String,
    story: String,
    personality: String,
    role: String,
    location_home: String,
    location_work: String,
}

pub struct Scheduler {
    store: Store,
    memory: MemoryService,
    llm: CompletionClient,
    lifecycle_selection: LlmSelection,
    schedule_selection: LlmSelection,
    /// `day → phase → pairs`, consulted for "already spoken" sets.
    history: HashMap<u32, DaySchedule>,
    /// One active/passive map per lifecycle pass, newest last.
    lifecycle_history: Vec<BTreeMap<String, String>>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        memory: MemoryService,
        llm: CompletionClient,
        lifecycle_selection: LlmSelection,
        schedule_selection: LlmSelection,
    ) -> Self {
        Self {
            store,
            memory,
            llm,
            lifecycle_selection,
            schedule_selection,
            history: HashMap::new(),
            lifecycle_history: Vec::new(),
        }
    }

    pub fn schedule_for(&self, day: u32) -> Option<&DaySchedule> {
        self.history.get(&day)
    }

    // ── Lifecycle pass ───────────────────────────────────────────────────────

    /// Decide the day's active/passive split.  Model failures fall back to
    /// the full roster; a reply with no valid names falls back to the first
    /// two roster names.
    pub async fn run_lifecycle(
        &mut self,
        session: &Session,
        previous_active: &[String],
        previous_passive: &[String],
    ) -> (Vec<String>, Vec<String>) {
        let roster = session.settings.character_names();
        let (system, user) = prompts::lifecycle_prompts(
            session.accumulative_summary(),
            &roster,
            previous_active,
            previous_passive,
        );

        let active = match self
            .llm
            .call(&self.lifecycle_selection, &system, &user, 0.5, PASS_TIMEOUT)
            .await
        {
            Ok(response) => {
                let proposed = parse_csv_names(&response);
                if proposed.is_empty() {
                    warn!("lifecycle reply had no names; activating the full roster");
                    roster.clone()
                } else {
                    let valid: Vec<String> = proposed
                        .into_iter()
                        .filter(|name| roster.contains(name))
                        .collect();
                    if valid.is_empty() {
                        warn!("lifecycle reply had no valid names; activating first two of roster");
                        roster.iter().take(2).cloned().collect()
                    } else {
                        valid
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "lifecycle pass failed; activating the full roster");
                roster.clone()
            }
        };

        let passive: Vec<String> = roster
            .iter()
            .filter(|name| !active.contains(name))
            .cloned()
            .collect();

        let mut map = BTreeMap::new();
        for name in &active {
            map.insert(name.clone(), "active".to_string());
        }
        for name in &passive {
            map.insert(name.clone(), "passive".to_string());
        }
        self.lifecycle_history.push(map);

        info!(active = ?active, passive = ?passive, "lifecycle pass complete");
        (active, passive)
    }

    // ── Introduction pass ────────────────────────────────────────────────────

    /// Maybe invent a newcomer.  No-op unless the reply is a JSON object
    /// with exactly the six expected fields; hard cap of ten characters.
    pub async fn run_introduction(
        &mut self,
        session: &Session,
        active: &[String],
    ) -> Option<CharacterSpec> {
        let roster = session.settings.character_names();
        if roster.len() >= CHARACTER_LIMIT {
            debug!(roster = roster.len(), "cast is full; skipping introduction pass");
            return None;
        }

        let (system, user) = prompts::introduction_prompts(
            &session.settings.world.description,
            session.accumulative_summary(),
            &roster,
            active,
            &session.settings.world.roles,
            &session.settings.world.locations,
        );

        let response = match self
            .llm
            .call(&self.lifecycle_selection, &system, &user, 0.5, PASS_TIMEOUT)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "introduction pass failed; no newcomer");
                return None;
            }
        };

        let Some(newcomer) = extract_json_object::<IntroducedCharacter>(&response) else {
            debug!("no well-formed newcomer in reply; skipping introduction");
            return None;
        };
        if newcomer.name.trim().is_empty() || roster.contains(&newcomer.name) {
            debug!(name = %newcomer.name, "newcomer name empty or taken; skipping");
            return None;
        }

        info!(name = %newcomer.name, role = %newcomer.role, "introducing new character");
        Some(CharacterSpec {
            name: newcomer.name,
            story: newcomer.story,
            personality: newcomer.personality,
            role: newcomer.role,
            location_home: newcomer.location_home,
            location_work: newcomer.location_work,
            kind: "npc".to_string(),
            life_cycle: "active".to_string(),
            ..CharacterSpec::default()
        })
    }

    // ── Schedule pass ────────────────────────────────────────────────────────

    /// Produce the day's pairs per phase.  `(a, b)` and `(b, a)` never both
    /// appear within one phase.
    pub async fn build_schedule(
        &mut self,
        session: &Session,
        active: &[String],
        day: u32,
        phases: &[TimePeriod],
    ) -> DaySchedule {
        let mut schedule: DaySchedule = HashMap::new();

        for &phase in phases {
            let mut pairs: Vec<(String, String)> = Vec::new();
            for npc in active {
                let recipients = self
                    .schedule_character(session, npc, active, day, phase, &pairs)
                    .await;
                for recipient in recipients {
                    if recipient == *npc || !active.contains(&recipient) {
                        continue;
                    }
                    let duplicate = pairs.iter().any(|(a, b)| {
                        (a == npc && *b == recipient) || (*a == recipient && b == npc)
                    });
                    if !duplicate {
                        pairs.push((npc.clone(), recipient));
                    }
                }
            }
            info!(day, phase = %phase, pairs = pairs.len(), "phase scheduled");
            schedule.insert(phase, pairs);
        }

        self.history.insert(day, schedule.clone());
        schedule
    }

    async fn schedule_character(
        &self,
        session: &Session,
        npc: &str,
        active: &[String],
        day: u32,
        phase: TimePeriod,
        in_progress: &[(String, String)],
    ) -> Vec<String> {
        let already_spoken = self.already_spoken(day, phase, npc, in_progress);

        let memory_summary = match self.memory.npc_summary(&session.session_id, npc).await {
            Ok(summary) if !summary.is_empty() => summary,
            _ => "No memories yet.".to_string(),
        };
        let opinions_json = self.opinion_web(session, npc).await;

        let available: Vec<String> = active.iter().filter(|n| *n != npc).cloned().collect();
        let (system, user) = prompts::schedule_prompts(
            npc,
            day,
            phase,
            &available,
            &already_spoken,
            &memory_summary,
            &opinions_json,
        );

        match self
            .llm
            .call(&self.schedule_selection, &system, &user, 0.2, PASS_TIMEOUT)
            .await
        {
            Ok(response) => {
                let recipients: Vec<String> = parse_csv_names(&response)
                    .into_iter()
                    .filter(|name| name != npc && active.contains(name))
                    .collect();
                debug!(npc, day, phase = %phase, recipients = ?recipients, "character scheduled");
                recipients
            }
            Err(err) => {
                // Deterministic fallback: the first available partner.
                warn!(npc, error = %err, "schedule pass failed; falling back to first partner");
                available.into_iter().take(1).collect()
            }
        }
    }

    /// Names this character is already paired with in this phase, from the
    /// persisted history and the phase set under construction.
    fn already_spoken(
        &self,
        day: u32,
        phase: TimePeriod,
        npc: &str,
        in_progress: &[(String, String)],
    ) -> Vec<String> {
        let mut names = Vec::new();
        let mut visit = |pairs: &[(String, String)]| {
            for (a, b) in pairs {
                if a == npc && !names.contains(b) {
                    names.push(b.clone());
                } else if b == npc && !names.contains(a) {
                    names.push(a.clone());
                }
            }
        };
        if let Some(day_schedule) = self.history.get(&day) {
            if let Some(pairs) = day_schedule.get(&phase) {
                visit(pairs);
            }
        }
        visit(in_progress);
        names
    }

    /// Outgoing and incoming opinions for the schedule prompt, as JSON.
    async fn opinion_web(&self, session: &Session, npc: &str) -> String {
        let outgoing = match self.store.get_npc_memory(&session.session_id, npc).await {
            Ok(Some(memory)) => memory.opinion_on_npcs,
            _ => BTreeMap::new(),
        };

        let mut incoming = BTreeMap::new();
        for other in session.settings.character_names() {
            if other == npc {
                continue;
            }
            if let Ok(Some(memory)) = self.store.get_npc_memory(&session.session_id, &other).await {
                if let Some(opinion) = memory.opinion_on_npcs.get(npc) {
                    incoming.insert(other, opinion.clone());
                }
            }
        }

        serde_json::json!({ "outgoing": outgoing, "incoming": incoming }).to_string()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
