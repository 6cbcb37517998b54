use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use canopy::api::{serve, AppState};
use canopy::billing::UnmeteredBilling;
use canopy::engine::{Dispatcher, TickMode, TickStatus};
use canopy::providers::llm::{AnthropicProvider, OpenAIProvider};
use canopy::providers::search::BraveSearchProvider;
use canopy::providers::{LLMProvider, MockLLMProvider, MockSearchProvider, SearchProvider};
use canopy::storage::{InMemoryStore, PostgresStorage, Storage};
use canopy::types::MissionStatus;
use canopy::Config;

#[derive(Parser)]
#[command(name = "canopy")]
#[command(about = "Tick-driven scheduler for recursive agent trees", long_about = None)]
#[command(version)]
struct Cli {
    /// Optional TOML config; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API, optionally driving global ticks in the background
    Serve {
        #[arg(long)]
        port: Option<u16>,
        /// Seconds between background global ticks; 0 disables them
        #[arg(long, default_value_t = 5)]
        tick_interval_secs: u64,
    },
    /// Launch a mission and tick it until it completes
    Run {
        #[arg(help = "Mission objective")]
        objective: String,
        #[arg(long, default_value_t = 200)]
        max_ticks: usize,
    },
    /// Run a single global tick over every live mission
    Tick,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("canopy=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            port,
            tick_interval_secs,
        } => {
            let port = port.or(config.port).unwrap_or(3000);
            run_server(config, port, tick_interval_secs).await?
        }
        Commands::Run {
            objective,
            max_ticks,
        } => run_mission(config, &objective, max_ticks).await?,
        Commands::Tick => {
            let dispatcher = build_dispatcher(&config).await?;
            let report = dispatcher.run_global_tick().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn build_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    match &config.database_url {
        Some(url) => {
            let storage = PostgresStorage::new(url)
                .await
                .context("connecting to Postgres")?;
            storage.run_migrations().await?;
            log::info!("Using Postgres storage");
            Ok(Arc::new(storage))
        }
        None => {
            log::info!("DATABASE_URL not set; using in-memory storage");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

fn build_llm(config: &Config) -> Arc<dyn LLMProvider> {
    if let Some(key) = &config.anthropic_api_key {
        Arc::new(AnthropicProvider::new(key.clone()))
    } else if let Some(key) = &config.openai_api_key {
        Arc::new(OpenAIProvider::new(key.clone()))
    } else {
        log::warn!("No LLM API key configured; agents will run against the mock provider");
        Arc::new(MockLLMProvider::new())
    }
}

fn build_search(config: &Config) -> Arc<dyn SearchProvider> {
    match &config.brave_api_key {
        Some(key) => Arc::new(BraveSearchProvider::new(key.clone())),
        None => Arc::new(MockSearchProvider::new()),
    }
}

async fn build_dispatcher(config: &Config) -> Result<Arc<Dispatcher>> {
    let storage = build_storage(config).await?;
    Ok(Arc::new(Dispatcher::new(
        storage,
        build_llm(config),
        Some(build_search(config)),
        Arc::new(UnmeteredBilling),
        config.scheduler.clone(),
    )))
}

async fn run_server(config: Config, port: u16, tick_interval_secs: u64) -> Result<()> {
    let dispatcher = build_dispatcher(&config).await?;

    if tick_interval_secs > 0 {
        let ticker = dispatcher.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(tick_interval_secs));
            loop {
                interval.tick().await;
                match ticker.run_global_tick().await {
                    Ok(report) if !report.ticks.is_empty() || !report.reaped.is_empty() => {
                        log::debug!(
                            "Global tick: {} missions ticked, {} reaped, {} synthesized",
                            report.ticks.len(),
                            report.reaped.len(),
                            report.synthesized.len()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("Global tick failed: {}", e),
                }
            }
        });
    }

    let state = AppState::new(dispatcher, &config.scheduler);
    serve(state, port).await
}

async fn run_mission(config: Config, objective: &str, max_ticks: usize) -> Result<()> {
    let dispatcher = build_dispatcher(&config).await?;
    let storage = dispatcher.storage().clone();

    let mission = dispatcher.launch_mission(objective).await?;
    println!("Launched mission {}: {}", mission.id, mission.objective);

    for tick in 1..=max_ticks {
        let response = dispatcher.run_tick(mission.id, TickMode::Iterate).await?;
        if let Some(agent_id) = response.agent_id {
            println!("[tick {}] {:?} agent {}", tick, response.status, agent_id);
        }

        match response.status {
            TickStatus::WaitingForInput => {
                println!("An agent is waiting for input; answer it over the HTTP API.");
                break;
            }
            TickStatus::InsufficientCredits => {
                println!("Mission is out of credits.");
                break;
            }
            _ => {}
        }

        let current = storage
            .get_mission(mission.id)
            .await?
            .context("mission disappeared")?;
        match current.status {
            MissionStatus::Synthesizing => {
                dispatcher.run_tick(mission.id, TickMode::Synthesize).await?;
            }
            MissionStatus::Completed => break,
            MissionStatus::Active => {
                if response.status == TickStatus::NoAgentAvailable {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    let finished = storage
        .get_mission(mission.id)
        .await?
        .context("mission disappeared")?;
    let agents = storage.get_mission_agents(mission.id).await?;
    println!(
        "\nMission finished with status {} ({} agents)",
        finished.status.as_str(),
        agents.len()
    );
    if let Some(report) = finished.synthesis {
        println!("\n{}", report);
    }

    Ok(())
}
