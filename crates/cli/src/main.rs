use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use folksim_agents::{KnowledgeAgent, OpinionAgent, ReputationAgent, SocialAgents, StanceAgent};
use folksim_config::{AgentRole, GameSettings, SimConfig};
use folksim_dialogue::{DialogueEngine, DialogueLimits};
use folksim_llm::{CompletionClient, HttpBackend, LlmSelection};
use folksim_memory::MemoryService;
use folksim_npc::NpcSpeaker;
use folksim_scheduler::Scheduler;
use folksim_sim::SimulationLoop;
use folksim_store::Store;

#[derive(Debug, Parser)]
#[command(
    name = "folksim",
    version,
    about = "A multi-agent NPC social world simulator"
)]
struct Cli {
    /// Simulation config (TOML); defaults apply when the file is absent.
    #[arg(long, default_value = "folksim.toml")]
    config: PathBuf,

    /// Game settings JSON (world + cast); the built-in cast when omitted.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Directory holding the embedded database.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Session ID to create or resume.
    #[arg(long, default_value = "0")]
    session: String,

    /// Number of days to simulate.
    #[arg(long, default_value_t = 1)]
    days: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SimConfig::load_from(&cli.config)?;
    let settings = match &cli.settings {
        Some(path) => GameSettings::load_from(path)?,
        None => GameSettings::default_cast(),
    };

    let store = Store::open(cli.data_dir.join("folksim.redb"))?;

    let fallbacks = config
        .llm
        .fallbacks
        .iter()
        .map(|f| LlmSelection::parse(&f.provider, &f.model).map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()
        .context("invalid llm fallback list")?;
    let llm = CompletionClient::new(Arc::new(HttpBackend::new()))
        .with_fallbacks(fallbacks)
        .with_fallback_text(config.llm.fallback_text.clone());

    let select = |role: AgentRole| -> Result<LlmSelection> {
        let agent = config.llm.for_agent(role);
        LlmSelection::parse(&agent.provider, &agent.model).map_err(anyhow::Error::msg)
    };

    let memory = MemoryService::new(
        store.clone(),
        llm.clone(),
        select(AgentRole::Summarizer)?,
        config.memory.max_context_length(),
    );
    let speaker = NpcSpeaker::new(
        store.clone(),
        memory.clone(),
        llm.clone(),
        select(AgentRole::Npc)?,
    );
    let agents = SocialAgents {
        opinion: OpinionAgent::new(
            llm.clone(),
            select(AgentRole::Opinion)?,
            config.simulation.opinion_enabled,
        ),
        stance: StanceAgent::new(
            llm.clone(),
            select(AgentRole::Stance)?,
            config.simulation.stance_enabled,
        ),
        knowledge: KnowledgeAgent::new(
            llm.clone(),
            select(AgentRole::Knowledge)?,
            config.simulation.knowledge_enabled,
        ),
        reputation: ReputationAgent::new(
            llm.clone(),
            select(AgentRole::Reputation)?,
            config.simulation.reputation_enabled,
        ),
    };
    let engine = DialogueEngine::new(
        store.clone(),
        memory.clone(),
        speaker,
        agents,
        DialogueLimits::from(&config.dialogue),
    );
    let scheduler = Scheduler::new(
        store.clone(),
        memory.clone(),
        llm,
        select(AgentRole::Lifecycle)?,
        select(AgentRole::Schedule)?,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("stop requested; finishing the current dialogue");
                cancel.cancel();
            }
        });
    }

    let mut sim = SimulationLoop::new(
        store,
        memory,
        engine,
        scheduler,
        settings,
        config.simulation.time_periods.clone(),
        cancel,
    );
    let report = sim.run_days(&cli.session, cli.days).await?;

    println!(
        "session {}: {} day(s), {} dialogue(s){}",
        cli.session,
        report.days_completed,
        report.dialogues_executed,
        if report.cancelled { ", cancelled" } else { "" }
    );
    Ok(())
}
