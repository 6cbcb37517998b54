//! End-to-end mission tests.
//!
//! Drives whole missions through the dispatcher against the in-memory store
//! and a scripted model. Scripted replies are consumed in call order, so each
//! test lists them in the order the engine asks: compression summaries,
//! generation steps, then synthesis.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;

use canopy::billing::UnmeteredBilling;
use canopy::config::SchedulerConfig;
use canopy::engine::reaper::REAPED_OUTPUT;
use canopy::engine::{Dispatcher, SpawnBudget, StaleMissionReaper, TickMode, TickStatus};
use canopy::providers::{
    Completion, CompletionRequest, LLMProvider, MockLLMProvider, MockSearchProvider, TokenUsage,
};
use canopy::storage::{InMemoryStore, Storage};
use canopy::types::{
    Agent, AgentRole, AgentStatus, EventKind, FindingKind, Mission, MissionId, MissionStatus,
};

struct Harness {
    store: Arc<InMemoryStore>,
    llm: Arc<MockLLMProvider>,
    dispatcher: Dispatcher,
}

impl Harness {
    fn new(llm: MockLLMProvider, config: SchedulerConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(llm);
        let dispatcher = Dispatcher::new(
            store.clone(),
            llm.clone(),
            Some(Arc::new(MockSearchProvider::new())),
            Arc::new(UnmeteredBilling),
            config,
        );
        Self {
            store,
            llm,
            dispatcher,
        }
    }

    async fn tick(&self, mission_id: MissionId) -> Result<TickStatus> {
        Ok(self
            .dispatcher
            .run_tick(mission_id, TickMode::Iterate)
            .await?
            .status)
    }

    async fn event_count(&self, mission_id: MissionId, kind: EventKind) -> Result<usize> {
        Ok(self
            .store
            .get_events(mission_id)
            .await?
            .iter()
            .filter(|e| e.kind == kind)
            .count())
    }
}

#[tokio::test]
async fn test_mission_runs_through_synthesis() -> Result<()> {
    let llm = MockLLMProvider::with_responses([
        // root plans
        r#"{"activity": "Planning", "progress_delta": 10, "spawn": [{"role": "researcher", "objective": "Find tide tables", "context": "Monterey only"}]}"#,
        // researcher searches, then reports
        r#"{"tool": "web_search", "params": {"query": "monterey tide tables"}}"#,
        r#"{"output": "High tide is near noon.", "complete": true, "findings": [{"title": "Tides", "content": "High tide near noon"}]}"#,
        // root folds in the child and finishes
        r#"{"output": "Visit at noon for high tide.", "complete": true}"#,
        // synthesis
        "# Tide survey\n\nVisit at noon.",
    ]);
    let h = Harness::new(llm, SchedulerConfig::default());
    let mission = h.dispatcher.launch_mission("Survey the Monterey tides").await?;

    assert_eq!(h.tick(mission.id).await?, TickStatus::Iterated);
    let agents = h.store.get_mission_agents(mission.id).await?;
    assert_eq!(agents.len(), 2);
    let root = agents.iter().find(|a| a.is_root()).unwrap().clone();
    let child = agents.iter().find(|a| !a.is_root()).unwrap().clone();
    assert_eq!(child.depth, 1);
    assert_eq!(child.parent_id, Some(root.id));
    assert_eq!(child.status, AgentStatus::Spawning);

    // The fresh child is older in claim order than the just-updated root
    let response = h.dispatcher.run_tick(mission.id, TickMode::Iterate).await?;
    assert_eq!(response.status, TickStatus::Completed);
    assert_eq!(response.agent_id, Some(child.id));

    let child_messages = h.store.get_messages(child.id).await?;
    assert!(child_messages[0].content.contains("Monterey only"));

    let response = h.dispatcher.run_tick(mission.id, TickMode::Iterate).await?;
    assert_eq!(response.status, TickStatus::Completed);
    assert_eq!(response.agent_id, Some(root.id));

    let requests = h.llm.requests();
    let root_second = requests.last().unwrap();
    assert!(root_second
        .messages
        .iter()
        .any(|m| m.content.contains("sub-agents finished") && m.content.contains("noon")));

    let current = h.store.get_mission(mission.id).await?.unwrap();
    assert_eq!(current.status, MissionStatus::Synthesizing);
    assert_eq!(current.searches_used, 1);
    assert_eq!(h.tick(mission.id).await?, TickStatus::NoAgentAvailable);

    let response = h
        .dispatcher
        .run_tick(mission.id, TickMode::Synthesize)
        .await?;
    assert_eq!(response.status, TickStatus::Synthesized);

    let finished = h.store.get_mission(mission.id).await?.unwrap();
    assert_eq!(finished.status, MissionStatus::Completed);
    assert_eq!(
        finished.synthesis.as_deref(),
        Some("# Tide survey\n\nVisit at noon.")
    );

    // Synthesis happens once
    let again = h
        .dispatcher
        .run_tick(mission.id, TickMode::Synthesize)
        .await?;
    assert_eq!(again.status, TickStatus::Completed);
    assert_eq!(h.tick(mission.id).await?, TickStatus::Completed);
    assert_eq!(h.event_count(mission.id, EventKind::MissionCompleted).await?, 1);

    let findings = h.store.get_findings(mission.id, 50).await?;
    assert!(findings.iter().any(|f| f.kind == FindingKind::Search));
    assert!(findings.iter().any(|f| f.kind == FindingKind::Note && f.title == "Tides"));
    assert_eq!(
        findings
            .iter()
            .filter(|f| f.kind == FindingKind::Result)
            .count(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn test_iteration_ceiling_forces_completion() -> Result<()> {
    let config = SchedulerConfig {
        max_iterations: 3,
        ..SchedulerConfig::default()
    };
    let h = Harness::new(MockLLMProvider::new(), config);
    let mission = h.dispatcher.launch_mission("Keep going forever").await?;

    assert_eq!(h.tick(mission.id).await?, TickStatus::Iterated);
    assert_eq!(h.tick(mission.id).await?, TickStatus::Iterated);
    assert_eq!(h.tick(mission.id).await?, TickStatus::Completed);

    let agents = h.store.get_mission_agents(mission.id).await?;
    let root = &agents[0];
    assert_eq!(root.status, AgentStatus::Completed);
    assert_eq!(root.iteration, 3);
    assert_eq!(root.progress, 100);
    assert_eq!(root.output.as_deref(), Some("Mock progress"));

    let events = h.store.get_events(mission.id).await?;
    let completed = events
        .iter()
        .find(|e| e.kind == EventKind::AgentCompleted)
        .unwrap();
    assert_eq!(completed.detail["forced"], true);

    let current = h.store.get_mission(mission.id).await?.unwrap();
    assert_eq!(current.status, MissionStatus::Synthesizing);
    Ok(())
}

#[tokio::test]
async fn test_history_stays_bounded_under_compression() -> Result<()> {
    let config = SchedulerConfig {
        max_iterations: 20,
        ..SchedulerConfig::default()
    };
    let window = config.compression_window;
    let h = Harness::new(MockLLMProvider::new(), config);
    let mission = h.dispatcher.launch_mission("Long running survey").await?;
    let root_id = h.store.get_mission_agents(mission.id).await?[0].id;

    let mut lengths = Vec::new();
    for _ in 0..7 {
        assert_eq!(h.tick(mission.id).await?, TickStatus::Iterated);
        lengths.push(h.store.get_messages(root_id).await?.len());
    }

    // Bootstrap plus one reply and one nudge per iteration until the fourth
    assert_eq!(&lengths[..3], &[3, 5, 7]);
    // Summary, the kept window, then this iteration's reply and nudge
    assert_eq!(lengths[3], window + 3);
    assert_eq!(lengths[6], window + 3);
    assert!(lengths.iter().all(|&len| len <= 2 * window + 3));

    let messages = h.store.get_messages(root_id).await?;
    assert!(messages[0]
        .content
        .starts_with("Summary of earlier work on the objective \"Long running survey\""));
    assert_eq!(h.event_count(mission.id, EventKind::Compressed).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_spawn_budget_limits_the_tree() -> Result<()> {
    let config = SchedulerConfig {
        budget: SpawnBudget {
            max_total_agents: 2,
            ..SpawnBudget::default()
        },
        ..SchedulerConfig::default()
    };
    let llm = MockLLMProvider::with_responses([
        r#"{"spawn": [{"role": "researcher", "objective": "north shore"}, {"role": "researcher", "objective": "south shore"}, {"role": "validator", "objective": "check both"}]}"#,
        r#"{"activity": "Reading", "progress_delta": 5}"#,
        r#"{"spawn": [{"role": "executor", "objective": "one more"}]}"#,
    ]);
    let h = Harness::new(llm, config);
    let mission = h.dispatcher.launch_mission("Map the coastline").await?;

    assert_eq!(h.tick(mission.id).await?, TickStatus::Iterated);
    assert_eq!(h.store.get_mission_agents(mission.id).await?.len(), 2);
    assert_eq!(h.tick(mission.id).await?, TickStatus::Iterated);
    assert_eq!(h.tick(mission.id).await?, TickStatus::Iterated);

    let agents = h.store.get_mission_agents(mission.id).await?;
    assert_eq!(agents.len(), 2);
    let root = agents.iter().find(|a| a.is_root()).unwrap();
    let child = agents.iter().find(|a| !a.is_root()).unwrap();
    assert_eq!(child.objective, "north shore");

    let messages = h.store.get_messages(root.id).await?;
    assert!(messages
        .iter()
        .any(|m| m.content.contains("2 spawn request(s) were dropped")));
    assert!(messages.iter().any(|m| m
        .content
        .starts_with("Spawn request denied: Maximum total agents reached")));
    assert_eq!(h.event_count(mission.id, EventKind::Spawned).await?, 1);
    assert_eq!(h.event_count(mission.id, EventKind::SpawnDenied).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_depth_limit_holds() -> Result<()> {
    let config = SchedulerConfig {
        budget: SpawnBudget {
            max_depth: 1,
            ..SpawnBudget::default()
        },
        ..SchedulerConfig::default()
    };
    let spawn = r#"{"spawn": [{"role": "executor", "objective": "go deeper"}]}"#;
    let h = Harness::new(MockLLMProvider::with_responses([spawn, spawn]), config);
    let mission = h.dispatcher.launch_mission("Dig").await?;

    h.tick(mission.id).await?;
    h.tick(mission.id).await?;

    let agents = h.store.get_mission_agents(mission.id).await?;
    assert_eq!(agents.len(), 2);
    assert!(agents.iter().all(|a| a.depth <= 1));

    let events = h.store.get_events(mission.id).await?;
    let denied = events
        .iter()
        .find(|e| e.kind == EventKind::SpawnDenied)
        .unwrap();
    assert_eq!(denied.detail["reason"], "Maximum depth reached");
    Ok(())
}

#[tokio::test]
async fn test_waiting_agent_resumes_with_answer() -> Result<()> {
    let llm = MockLLMProvider::with_responses([
        r#"{"activity": "Asking", "input_request": {"question": "Which beach?"}}"#,
    ]);
    let h = Harness::new(llm, SchedulerConfig::default());
    let mission = h.dispatcher.launch_mission("Count the seals").await?;

    assert_eq!(h.tick(mission.id).await?, TickStatus::WaitingForInput);
    let root = h.store.get_mission_agents(mission.id).await?[0].clone();
    assert_eq!(root.status, AgentStatus::Waiting);
    assert_eq!(root.pending_input.as_deref(), Some("Which beach?"));

    // A waiting agent is never claimed and never counts as finished
    assert_eq!(h.tick(mission.id).await?, TickStatus::NoAgentAvailable);
    let current = h.store.get_mission(mission.id).await?.unwrap();
    assert_eq!(current.status, MissionStatus::Active);

    let resumed = h.dispatcher.respond_to_input(root.id, "Point Lobos").await?;
    assert_eq!(resumed.status, AgentStatus::Working);
    assert!(resumed.pending_input.is_none());

    assert_eq!(h.tick(mission.id).await?, TickStatus::Iterated);
    let last = h.llm.requests().pop().unwrap();
    assert!(last
        .messages
        .iter()
        .any(|m| m.content.contains("Which beach?") && m.content.contains("Point Lobos")));
    Ok(())
}

#[tokio::test]
async fn test_reaped_mission_synthesizes_from_fallback() -> Result<()> {
    let h = Harness::new(MockLLMProvider::new(), SchedulerConfig::default());
    let mission = h.dispatcher.launch_mission("Catalogue the kelp").await?;
    assert_eq!(h.tick(mission.id).await?, TickStatus::Iterated);

    let reaper = StaleMissionReaper::new(h.store.clone(), Duration::minutes(30));
    let reaped = reaper.reap(Utc::now() + Duration::hours(1)).await?;
    assert_eq!(reaped, vec![mission.id]);

    let agents = h.store.get_mission_agents(mission.id).await?;
    assert!(agents.iter().all(|a| a.status == AgentStatus::Completed));
    assert_eq!(agents[0].output.as_deref(), Some(REAPED_OUTPUT));

    // Reaping is not repeated for a mission that already left active
    let again = reaper.reap(Utc::now() + Duration::hours(2)).await?;
    assert!(again.is_empty());

    h.llm.push_failure("model unavailable");
    let response = h
        .dispatcher
        .run_tick(mission.id, TickMode::Synthesize)
        .await?;
    assert_eq!(response.status, TickStatus::Synthesized);

    let finished = h.store.get_mission(mission.id).await?.unwrap();
    assert_eq!(finished.status, MissionStatus::Completed);
    let report = finished.synthesis.unwrap();
    assert!(report.starts_with("# Catalogue the kelp"));
    assert!(report.contains(REAPED_OUTPUT));
    assert_eq!(h.event_count(mission.id, EventKind::MissionReaped).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_global_tick_covers_every_mission() -> Result<()> {
    let h = Harness::new(
        MockLLMProvider::with_response(r#"{"output": "done", "complete": true}"#),
        SchedulerConfig::default(),
    );
    let first = h.dispatcher.launch_mission("First survey").await?;
    let second = h.dispatcher.launch_mission("Second survey").await?;

    let report = h.dispatcher.run_global_tick().await?;
    assert!(report.reaped.is_empty());
    assert_eq!(report.ticks.len(), 2);
    assert!(report
        .ticks
        .iter()
        .all(|t| t.status == TickStatus::Completed));
    // Both roots finished during the pass, so both missions synthesize in it too
    assert_eq!(report.synthesized.len(), 2);

    let report = h.dispatcher.run_global_tick().await?;
    assert!(report.ticks.is_empty());
    assert!(report.synthesized.is_empty());

    for id in [first.id, second.id] {
        let mission = h.store.get_mission(id).await?.unwrap();
        assert_eq!(mission.status, MissionStatus::Completed);
    }
    Ok(())
}

/// Holds the first `parties` generations until all of them have started, so
/// their spawn checks all see the same tree.
struct LockstepModel {
    barrier: Barrier,
    parties: usize,
    calls: AtomicUsize,
    reply: &'static str,
}

impl LockstepModel {
    fn new(parties: usize, reply: &'static str) -> Self {
        Self {
            barrier: Barrier::new(parties),
            parties,
            calls: AtomicUsize::new(0),
            reply,
        }
    }
}

#[async_trait]
impl LLMProvider for LockstepModel {
    async fn complete(&self, _request: CompletionRequest) -> Result<Completion> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.parties {
            self.barrier.wait().await;
        }
        Ok(Completion {
            text: self.reply.to_string(),
            usage: TokenUsage::default(),
        })
    }
}

#[tokio::test]
async fn test_overlapping_ticks_respect_agent_cap() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let mission = Mission::new("Catalogue the reef".to_string());
    store.create_mission(&mission).await?;

    // root -> scout -> surveyor -> two working leaves, plus finished helpers
    let mut chain = vec![Agent::root(mission.id, mission.objective.clone())];
    for objective in ["scout", "surveyor"] {
        let parent = chain.last().unwrap();
        let child = Agent::child_of(parent, AgentRole::Researcher, objective.to_string());
        chain.push(child);
    }
    for agent in &mut chain {
        agent.status = AgentStatus::Waiting;
        agent.pending_input = Some("hold".to_string());
        store.create_agent(agent).await?;
    }
    let surveyor = chain.last().unwrap();
    for objective in ["east wall", "west wall"] {
        let mut leaf = Agent::child_of(surveyor, AgentRole::Executor, objective.to_string());
        leaf.status = AgentStatus::Working;
        store.create_agent(&leaf).await?;
    }
    for i in 0..19 {
        let mut helper = Agent::child_of(&chain[0], AgentRole::Executor, format!("helper {}", i));
        helper.status = AgentStatus::Completed;
        helper.completed_at = Some(Utc::now());
        store.create_agent(&helper).await?;
    }
    assert_eq!(store.get_mission_agents(mission.id).await?.len(), 24);

    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(LockstepModel::new(
            2,
            r#"{"output": "splitting", "spawn": [{"role": "executor", "objective": "count coral"}]}"#,
        )),
        None,
        Arc::new(UnmeteredBilling),
        SchedulerConfig::default(),
    );

    let (a, b) = tokio::join!(
        dispatcher.run_tick(mission.id, TickMode::Iterate),
        dispatcher.run_tick(mission.id, TickMode::Iterate)
    );
    assert_eq!(a?.status, TickStatus::Iterated);
    assert_eq!(b?.status, TickStatus::Iterated);

    let agents = store.get_mission_agents(mission.id).await?;
    assert_eq!(agents.len(), SchedulerConfig::default().budget.max_total_agents);
    assert_eq!(agents.iter().filter(|a| a.objective == "count coral").count(), 1);
    assert_eq!(
        agents
            .iter()
            .filter(|a| a.status == AgentStatus::Working && a.iteration == 1)
            .count(),
        2
    );
    let events = store.get_events(mission.id).await?;
    assert_eq!(events.iter().filter(|e| e.kind == EventKind::Spawned).count(), 1);
    let trimmed = events
        .into_iter()
        .find(|e| e.kind == EventKind::SpawnDenied)
        .expect("trimmed spawn is recorded");
    assert_eq!(trimmed.detail["trimmed"], 1);
    Ok(())
}
