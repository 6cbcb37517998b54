use anyhow::{anyhow, Result};
use chrono::Duration;
use serde_json::json;
use std::sync::Arc;

use crate::billing::Billing;
use crate::providers::{CompletionRequest, LLMProvider};
use crate::storage::Storage;
use crate::text::truncate_chars;
use crate::types::{Agent, AgentStatus, Event, EventKind, Finding, Message, MissionId, MissionStatus};

const SYNTHESIS_FINDINGS_LIMIT: usize = 20;
const SYNTHESIS_MAX_TOKENS: u32 = 4096;
const SOURCE_MAX_CHARS: usize = 4000;

const SYNTHESIZER_PROMPT: &str = "You consolidate the work of a team of agents into one final \
     report for the mission objective. Merge overlapping results, keep concrete facts, \
     note disagreements, and finish with a short conclusion. Write Markdown.";

/// Moves a mission to `synthesizing` once every agent is terminal.
pub struct CompletionTrigger {
    storage: Arc<dyn Storage>,
}

impl CompletionTrigger {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Returns true when this call performed the transition.
    pub async fn check(&self, mission_id: MissionId) -> Result<bool> {
        if !self.storage.all_agents_terminal(mission_id).await? {
            return Ok(false);
        }

        let moved = self
            .storage
            .transition_mission(mission_id, MissionStatus::Active, MissionStatus::Synthesizing)
            .await?;
        if moved {
            log::info!("Mission {} converged; awaiting synthesis", mission_id);
            self.storage
                .record_event(&Event::new(mission_id, None, EventKind::MissionSynthesizing))
                .await?;
        }
        Ok(moved)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisOutcome {
    Synthesized { fallback: bool },
    AlreadyCompleted,
    /// Mission is still active.
    NotReady,
    /// Another caller holds the synthesis claim.
    InProgress,
}

/// Produces the mission's consolidated artifact, at most once.
pub struct Synthesizer {
    storage: Arc<dyn Storage>,
    llm_provider: Arc<dyn LLMProvider>,
    billing: Arc<dyn Billing>,
    lease: Duration,
}

impl Synthesizer {
    pub fn new(
        storage: Arc<dyn Storage>,
        llm_provider: Arc<dyn LLMProvider>,
        billing: Arc<dyn Billing>,
        lease: Duration,
    ) -> Self {
        Self {
            storage,
            llm_provider,
            billing,
            lease,
        }
    }

    pub async fn synthesize(&self, mission_id: MissionId) -> Result<SynthesisOutcome> {
        let mission = self
            .storage
            .get_mission(mission_id)
            .await?
            .ok_or_else(|| anyhow!("Mission {} not found", mission_id))?;

        match mission.status {
            MissionStatus::Completed => return Ok(SynthesisOutcome::AlreadyCompleted),
            MissionStatus::Active => return Ok(SynthesisOutcome::NotReady),
            MissionStatus::Synthesizing => {}
        }

        if !self.storage.claim_synthesis(mission_id, self.lease).await? {
            return Ok(SynthesisOutcome::InProgress);
        }

        let agents: Vec<Agent> = self
            .storage
            .get_mission_agents(mission_id)
            .await?
            .into_iter()
            .filter(|a| a.status == AgentStatus::Completed)
            .collect();
        let findings = self
            .storage
            .get_findings(mission_id, SYNTHESIS_FINDINGS_LIMIT)
            .await?;

        let request = CompletionRequest::new(
            SYNTHESIZER_PROMPT,
            vec![Message::user(synthesis_brief(&mission.objective, &agents, &findings))],
        )
        .with_max_tokens(SYNTHESIS_MAX_TOKENS);

        let (artifact, fallback) = match self.llm_provider.complete(request).await {
            Ok(completion) if !completion.text.trim().is_empty() => {
                let description = format!("synthesis for mission {}", mission_id);
                if let Err(e) = self
                    .billing
                    .record_usage(mission_id, &completion.usage, &description)
                    .await
                {
                    log::warn!("Failed to record synthesis usage: {}", e);
                }
                (completion.text.trim().to_string(), false)
            }
            Ok(_) => {
                log::warn!("Synthesis for mission {} came back empty; concatenating", mission_id);
                (concatenate_outputs(&mission.objective, &agents), true)
            }
            Err(e) => {
                log::warn!("Synthesis for mission {} failed: {}; concatenating", mission_id, e);
                (concatenate_outputs(&mission.objective, &agents), true)
            }
        };

        if !self.storage.complete_mission(mission_id, &artifact).await? {
            return Ok(SynthesisOutcome::AlreadyCompleted);
        }

        self.storage
            .record_event(
                &Event::new(mission_id, None, EventKind::MissionCompleted).with_detail(json!({
                    "fallback": fallback,
                    "sources": agents.len(),
                })),
            )
            .await?;
        log::info!("Mission {} completed", mission_id);

        Ok(SynthesisOutcome::Synthesized { fallback })
    }
}

fn synthesis_brief(objective: &str, agents: &[Agent], findings: &[Finding]) -> String {
    let mut brief = format!("Mission objective: {}\n\n## Agent results\n", objective);
    for agent in agents {
        brief.push_str(&format!(
            "\n### {} ({})\n{}\n",
            agent.objective,
            agent.role.as_str(),
            truncate_chars(agent.output.as_deref().unwrap_or(""), SOURCE_MAX_CHARS)
        ));
    }
    if !findings.is_empty() {
        brief.push_str("\n## Recent findings\n");
        for finding in findings {
            brief.push_str(&format!(
                "- [{}] {}: {}\n",
                finding.kind.as_str(),
                finding.title,
                truncate_chars(&finding.content, 500)
            ));
        }
    }
    brief
}

/// Deterministic report used when the model is unavailable.
pub fn concatenate_outputs(objective: &str, agents: &[Agent]) -> String {
    let mut report = format!("# {}\n", objective);
    for agent in agents {
        report.push_str(&format!(
            "\n## {} ({})\n\n{}\n",
            agent.objective,
            agent.role.as_str(),
            agent.output.as_deref().unwrap_or("(no output)")
        ));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::UnmeteredBilling;
    use crate::providers::MockLLMProvider;
    use crate::storage::InMemoryStore;
    use crate::types::{AgentRole, Mission};

    async fn finished_mission(store: &InMemoryStore) -> (Mission, Vec<Agent>) {
        let mission = Mission::new("catalogue tide pools".to_string());
        store.create_mission(&mission).await.unwrap();

        let mut root = Agent::root(mission.id, mission.objective.clone());
        let mut child = Agent::child_of(&root, AgentRole::Researcher, "rock pools".to_string());
        root.status = AgentStatus::Completed;
        root.output = Some("Root summary".to_string());
        child.status = AgentStatus::Failed;
        child.output = Some("Could not reach site".to_string());
        store.create_agent(&root).await.unwrap();
        store.create_agent(&child).await.unwrap();
        (mission, vec![root, child])
    }

    fn synthesizer(store: Arc<InMemoryStore>, llm: Arc<MockLLMProvider>) -> Synthesizer {
        Synthesizer::new(store, llm, Arc::new(UnmeteredBilling), Duration::minutes(10))
    }

    #[tokio::test]
    async fn test_check_requires_all_terminal() {
        let store = Arc::new(InMemoryStore::new());
        let mission = Mission::new("x".to_string());
        store.create_mission(&mission).await.unwrap();
        let trigger = CompletionTrigger::new(store.clone());

        // No agents yet
        assert!(!trigger.check(mission.id).await.unwrap());

        let mut root = Agent::root(mission.id, "x".to_string());
        root.status = AgentStatus::Waiting;
        store.create_agent(&root).await.unwrap();
        assert!(!trigger.check(mission.id).await.unwrap());

        root.status = AgentStatus::Failed;
        store.update_agent(&root).await.unwrap();
        assert!(trigger.check(mission.id).await.unwrap());
        assert!(!trigger.check(mission.id).await.unwrap());

        let stored = store.get_mission(mission.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MissionStatus::Synthesizing);
    }

    #[tokio::test]
    async fn test_synthesis_runs_once() {
        let store = Arc::new(InMemoryStore::new());
        let (mission, _) = finished_mission(&store).await;
        CompletionTrigger::new(store.clone())
            .check(mission.id)
            .await
            .unwrap();
        let llm = Arc::new(MockLLMProvider::with_response("# Final report"));
        let synthesizer = synthesizer(store.clone(), llm.clone());

        assert_eq!(
            synthesizer.synthesize(mission.id).await.unwrap(),
            SynthesisOutcome::Synthesized { fallback: false }
        );
        assert_eq!(
            synthesizer.synthesize(mission.id).await.unwrap(),
            SynthesisOutcome::AlreadyCompleted
        );
        assert_eq!(llm.requests().len(), 1);

        let brief = &llm.requests()[0].messages[0].content;
        assert!(brief.contains("Root summary"));
        assert!(!brief.contains("Could not reach site"));

        let stored = store.get_mission(mission.id).await.unwrap().unwrap();
        assert_eq!(stored.synthesis.as_deref(), Some("# Final report"));
    }

    #[tokio::test]
    async fn test_synthesis_falls_back_to_concatenation() {
        let store = Arc::new(InMemoryStore::new());
        let (mission, _) = finished_mission(&store).await;
        CompletionTrigger::new(store.clone())
            .check(mission.id)
            .await
            .unwrap();
        let llm = Arc::new(MockLLMProvider::new());
        llm.push_failure("overloaded");

        let outcome = synthesizer(store.clone(), llm).synthesize(mission.id).await.unwrap();

        assert_eq!(outcome, SynthesisOutcome::Synthesized { fallback: true });
        let stored = store.get_mission(mission.id).await.unwrap().unwrap();
        let report = stored.synthesis.unwrap();
        assert!(report.starts_with("# catalogue tide pools"));
        assert!(report.contains("Root summary"));
    }

    #[tokio::test]
    async fn test_synthesis_waits_for_convergence() {
        let store = Arc::new(InMemoryStore::new());
        let (mission, _) = finished_mission(&store).await;
        let llm = Arc::new(MockLLMProvider::new());

        assert_eq!(
            synthesizer(store, llm.clone()).synthesize(mission.id).await.unwrap(),
            SynthesisOutcome::NotReady
        );
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_synthesis_claim() {
        let store = Arc::new(InMemoryStore::new());
        let (mission, _) = finished_mission(&store).await;
        CompletionTrigger::new(store.clone())
            .check(mission.id)
            .await
            .unwrap();

        assert!(store
            .claim_synthesis(mission.id, Duration::minutes(10))
            .await
            .unwrap());
        let outcome = synthesizer(store, Arc::new(MockLLMProvider::new()))
            .synthesize(mission.id)
            .await
            .unwrap();
        assert_eq!(outcome, SynthesisOutcome::InProgress);
    }
}
