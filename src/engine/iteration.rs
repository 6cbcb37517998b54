use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::Arc;

use crate::billing::Billing;
use crate::config::SchedulerConfig;
use crate::engine::budget::{admit_spawn_requests, can_spawn, AgentForest, SpawnCheck};
use crate::engine::compression::{compress_history, should_compress};
use crate::engine::generation::WorkGenerator;
use crate::engine::parser::{parse_reply, IterationResult};
use crate::lifecycle::{AgentStateMachine, IterationPolicy, Transition};
use crate::providers::{LLMProvider, TokenUsage};
use crate::storage::{ChildLimits, IterationWrites, MessageWrite, Storage};
use crate::text::truncate_chars;
use crate::tools::{SearchAllowance, ToolContext, ToolType};
use crate::types::{
    Agent, AgentId, Event, EventKind, Finding, FindingKind, Message, Mission, ReportSection,
};

const CONTINUE_PROMPT: &str =
    "Continue working on your objective. Reply with your JSON result when ready.";
const FINALIZE_PROMPT: &str =
    "Iteration limit reached. Your latest output has been recorded as your final result.";

/// What one processed claim produced.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub agent: Agent,
    pub transition: Transition,
    pub spawned: Vec<AgentId>,
    pub spawn_denied: Option<String>,
    pub usage: TokenUsage,
    /// False when the stored agent no longer held this claim at commit; its
    /// status, messages and children were not written.
    pub applied: bool,
    pub unparsed: bool,
}

pub struct IterationEngine {
    storage: Arc<dyn Storage>,
    llm_provider: Arc<dyn LLMProvider>,
    generator: WorkGenerator,
    billing: Arc<dyn Billing>,
    config: SchedulerConfig,
}

impl IterationEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        llm_provider: Arc<dyn LLMProvider>,
        generator: WorkGenerator,
        billing: Arc<dyn Billing>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            storage,
            llm_provider,
            generator,
            billing,
            config,
        }
    }

    /// Runs one iteration for a claimed agent and commits its writes.
    pub async fn process(&self, mut agent: Agent) -> Result<IterationOutcome> {
        let mission = self
            .storage
            .get_mission(agent.mission_id)
            .await?
            .ok_or_else(|| anyhow!("Mission {} not found", agent.mission_id))?;

        let mut usage = TokenUsage::default();
        let mut events = Vec::new();
        // Messages not yet in the store, in the order they will be written
        let mut pending = Vec::new();

        let mut history = self.storage.get_messages(agent.id).await?;
        if history.is_empty() {
            pending.push(Message::user(bootstrap_prompt(&agent)));
        }

        let mut replaced = false;
        if should_compress(
            agent.iteration,
            self.config.compression_interval,
            history.len(),
            self.config.compression_window,
        ) {
            let compressed = compress_history(
                self.llm_provider.as_ref(),
                &agent.objective,
                &history,
                self.config.compression_window,
            )
            .await;
            usage.add(compressed.usage);
            events.push(
                Event::new(agent.mission_id, Some(agent.id), EventKind::Compressed).with_detail(
                    json!({ "collapsed": compressed.collapsed, "summarized": compressed.summarized }),
                ),
            );
            history = compressed.messages;
            replaced = true;
        }

        self.fan_in(&mut agent, &mut pending).await?;
        self.sibling_awareness(&agent, &mut pending).await;

        let agents = self.storage.get_mission_agents(agent.mission_id).await?;
        let forest = AgentForest::new(&agents);
        let check = can_spawn(&forest, &agent.id, &self.config.budget);

        let searches_left = self
            .config
            .budget
            .max_searches_per_mission
            .saturating_sub(mission.searches_used);
        let tools: &[ToolType] = if agent.role.is_search_eligible() && searches_left > 0 {
            &[ToolType::WebSearch]
        } else {
            &[]
        };
        let tool_context = ToolContext {
            agent_id: agent.id,
            mission_id: agent.mission_id,
            search_allowance: Arc::new(SearchAllowance::new(
                self.config.searches_per_iteration,
                searches_left,
            )),
        };

        let conversation: Vec<Message> = history.iter().chain(pending.iter()).cloned().collect();
        let generation = self
            .generator
            .generate(
                &system_prompt(&agent, &mission, &check, !tools.is_empty()),
                conversation,
                tools,
                &tool_context,
                self.config.tool_step_limit,
            )
            .await?;
        usage.add(generation.usage);
        pending.push(Message::assistant(generation.text.clone()));

        let parsed = parse_reply(&generation.text, self.config.fallback_progress_delta);
        let unparsed = parsed.is_fallback();
        if unparsed {
            log::debug!("Agent {} reply had no parsable payload", agent.id);
        }
        let mut result = parsed.into_result();
        result.searches = generation.searches;

        let transition =
            AgentStateMachine::apply(&mut agent, &result, &IterationPolicy::from(&self.config))?;

        let mut writes = IterationWrites::new(agent.clone(), MessageWrite::Append(Vec::new()));
        let mut spawn_denied = None;

        if !result.spawn.is_empty() {
            if transition.is_complete() {
                log::debug!(
                    "Agent {} completed; ignoring {} spawn request(s)",
                    agent.id,
                    result.spawn.len()
                );
            } else if check.allowed {
                let children = admit_spawn_requests(&agent, &result.spawn, &check);
                let dropped = result.spawn.len().saturating_sub(children.len());
                if dropped > 0 {
                    pending.push(Message::user(format!(
                        "{} spawn request(s) were dropped to stay within the agent budget.",
                        dropped
                    )));
                }
                writes.children = children;
                writes.child_limits = Some(ChildLimits {
                    max_total_agents: self.config.budget.max_total_agents,
                    max_children: self.config.budget.max_spawns_per_agent,
                });
            } else {
                let reason = check
                    .reason
                    .clone()
                    .unwrap_or_else(|| "Spawn budget exhausted".to_string());
                pending.push(Message::user(format!(
                    "Spawn request denied: {}. Carry out that work yourself instead.",
                    reason
                )));
                events.push(
                    Event::new(agent.mission_id, Some(agent.id), EventKind::SpawnDenied)
                        .with_detail(json!({ "reason": reason })),
                );
                spawn_denied = Some(reason);
            }
        }

        match &transition {
            Transition::Complete { forced } => {
                if *forced {
                    pending.push(Message::user(FINALIZE_PROMPT));
                }
                events.push(
                    Event::new(agent.mission_id, Some(agent.id), EventKind::AgentCompleted)
                        .with_detail(json!({ "forced": forced, "iteration": agent.iteration })),
                );
            }
            Transition::WaitingForInput { request } => {
                events.push(
                    Event::new(agent.mission_id, Some(agent.id), EventKind::WaitingForInput)
                        .with_detail(json!({ "request": request })),
                );
            }
            Transition::Continue => pending.push(Message::user(CONTINUE_PROMPT)),
        }

        events.push(
            Event::new(agent.mission_id, Some(agent.id), EventKind::Iterated).with_detail(json!({
                "iteration": agent.iteration,
                "progress": agent.progress,
                "activity": agent.current_activity,
                "unparsed": unparsed,
            })),
        );

        self.collect_records(&agent, &result, &mut writes, &mut events);

        writes.agent = agent.clone();
        writes.messages = if replaced {
            history.extend(pending);
            MessageWrite::Replace(history)
        } else {
            MessageWrite::Append(pending)
        };
        writes.events = events;
        writes.searches_used = result.searches.len() as u32;

        let receipt = self.storage.commit_iteration(&writes).await?;
        if receipt.applied {
            spawn_denied = self
                .record_spawns(&agent, &writes.children, &receipt.children)
                .await?
                .or(spawn_denied);
        } else {
            log::warn!(
                "Agent {} lost its claim while iterating; agent writes skipped",
                agent.id
            );
        }

        let description = format!("{} iteration {}", agent.role.as_str(), agent.iteration);
        if let Err(e) = self
            .billing
            .record_usage(agent.mission_id, &usage, &description)
            .await
        {
            log::warn!("Failed to record usage for mission {}: {}", agent.mission_id, e);
        }

        Ok(IterationOutcome {
            agent,
            transition,
            spawned: receipt.children,
            spawn_denied,
            usage,
            applied: receipt.applied,
            unparsed,
        })
    }

    /// Logs the children the store admitted and tells the agent about any
    /// it trimmed because other ticks filled the tree first.
    async fn record_spawns(
        &self,
        agent: &Agent,
        requested: &[Agent],
        admitted: &[AgentId],
    ) -> Result<Option<String>> {
        for child in requested.iter().filter(|c| admitted.contains(&c.id)) {
            self.storage
                .record_event(
                    &Event::new(agent.mission_id, Some(agent.id), EventKind::Spawned).with_detail(
                        json!({
                            "child_id": child.id,
                            "role": child.role.as_str(),
                            "objective": child.objective,
                        }),
                    ),
                )
                .await?;
        }

        let trimmed = requested.len() - admitted.len();
        if trimmed == 0 {
            return Ok(None);
        }
        let reason = "Agent budget filled by concurrent spawns".to_string();
        log::info!("Agent {}: {} spawn(s) trimmed at commit", agent.id, trimmed);
        self.storage
            .record_event(
                &Event::new(agent.mission_id, Some(agent.id), EventKind::SpawnDenied)
                    .with_detail(json!({ "reason": reason, "trimmed": trimmed })),
            )
            .await?;
        self.storage
            .append_messages(
                agent.id,
                &[Message::user(format!(
                    "{} spawn request(s) were dropped to stay within the agent budget.",
                    trimmed
                ))],
            )
            .await?;
        Ok(Some(reason))
    }

    /// Surfaces children that finished since the last check.
    async fn fan_in(&self, agent: &mut Agent, pending: &mut Vec<Message>) -> Result<()> {
        let finished = self
            .storage
            .get_terminal_children_since(agent.id, agent.last_completion_check)
            .await?;
        if finished.is_empty() {
            return Ok(());
        }

        let reports = finished
            .iter()
            .map(|child| {
                let output = child.output.as_deref().unwrap_or("(no output)");
                format!(
                    "### {} ({}): {}\n{}",
                    child.role.as_str(),
                    child.status.as_str(),
                    child.objective,
                    truncate_chars(output, self.config.child_preview_chars)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        pending.push(Message::user(format!(
            "{} of your sub-agents finished:\n\n{}",
            finished.len(),
            reports
        )));

        agent.last_completion_check = finished
            .iter()
            .filter_map(|c| c.completed_at)
            .max()
            .or(agent.last_completion_check);
        Ok(())
    }

    async fn sibling_awareness(&self, agent: &Agent, pending: &mut Vec<Message>) {
        let interval = self.config.sibling_interval;
        if interval == 0 || agent.iteration == 0 || agent.iteration % interval != 0 {
            return;
        }
        let Some(parent_id) = agent.parent_id else {
            return;
        };

        match self
            .storage
            .get_sibling_findings(parent_id, agent.id, self.config.sibling_findings_limit)
            .await
        {
            Ok(findings) if !findings.is_empty() => {
                let notes = findings
                    .iter()
                    .map(|f| format!("- {}: {}", f.title, truncate_chars(&f.content, 300)))
                    .collect::<Vec<_>>()
                    .join("\n");
                pending.push(Message::user(format!(
                    "Sibling agents recently reported the following. Avoid duplicating their work:\n{}",
                    notes
                )));
            }
            Ok(_) => {}
            Err(e) => log::warn!("Sibling findings unavailable for agent {}: {}", agent.id, e),
        }
    }

    fn collect_records(
        &self,
        agent: &Agent,
        result: &IterationResult,
        writes: &mut IterationWrites,
        events: &mut Vec<Event>,
    ) {
        for draft in &result.findings {
            if draft.title.trim().is_empty() && draft.content.trim().is_empty() {
                continue;
            }
            writes.findings.push(Finding::new(
                agent.mission_id,
                agent.id,
                FindingKind::Note,
                truncate_chars(draft.title.trim(), 200),
                truncate_chars(&draft.content, self.config.output_max_chars),
            ));
        }

        for search in &result.searches {
            writes.findings.push(Finding::new(
                agent.mission_id,
                agent.id,
                FindingKind::Search,
                truncate_chars(&search.query, 200),
                search
                    .answer
                    .clone()
                    .unwrap_or_else(|| format!("{} results", search.result_count)),
            ));
            events.push(
                Event::new(agent.mission_id, Some(agent.id), EventKind::SearchPerformed)
                    .with_detail(json!({
                        "query": search.query,
                        "result_count": search.result_count,
                    })),
            );
        }

        for artifact in &result.artifacts {
            if artifact.content.trim().is_empty() {
                continue;
            }
            let title = if artifact.title.trim().is_empty() {
                agent.objective.clone()
            } else {
                artifact.title.clone()
            };
            writes.report_sections.push(ReportSection::new(
                agent.mission_id,
                agent.id,
                truncate_chars(&title, 200),
                truncate_chars(&artifact.content, self.config.output_max_chars),
            ));
        }

        if agent.is_terminal() {
            if let Some(output) = agent.output.as_deref() {
                writes.findings.push(Finding::new(
                    agent.mission_id,
                    agent.id,
                    FindingKind::Result,
                    truncate_chars(&agent.objective, 200),
                    output,
                ));
            }
        }
    }
}

fn bootstrap_prompt(agent: &Agent) -> String {
    let mut prompt = format!("Your objective: {}", agent.objective);
    if let Some(brief) = agent.context.get("brief").and_then(|b| b.as_str()) {
        prompt.push_str(&format!("\n\nContext from your parent: {}", brief));
    }
    prompt.push_str("\n\nBegin work. Reply with your JSON result.");
    prompt
}

fn system_prompt(agent: &Agent, mission: &Mission, check: &SpawnCheck, searchable: bool) -> String {
    let spawning = if check.allowed {
        let mut line = format!(
            "You may spawn up to {} sub-agent(s) (you are at depth {}).",
            check.remaining, check.depth
        );
        if check.near_soft_cap {
            line.push_str(" The mission is close to its agent limit; only spawn if essential.");
        }
        line
    } else {
        format!(
            "You cannot spawn sub-agents ({}). Do the work yourself.",
            check.reason.as_deref().unwrap_or("budget exhausted")
        )
    };
    let search = if searchable {
        "You may use the web_search tool."
    } else {
        "Web search is not available to you this iteration."
    };

    format!(
        "You are a {role} agent working toward the mission: {mission}\n\
         Your own objective: {objective}\n\
         Iteration {iteration}, progress {progress}%.\n\
         {spawning}\n\
         {search}\n\n\
         Reply with one JSON object:\n\
         {{\"thinking\": string, \"activity\": short label, \"progress_delta\": 0-20, \
         \"output\": string, \"spawn\": [{{\"role\": string, \"objective\": string, \"context\": string}}], \
         \"input_request\": string or null, \"complete\": bool, \
         \"artifacts\": [{{\"title\": string, \"content\": string}}], \
         \"findings\": [{{\"title\": string, \"content\": string}}]}}",
        role = agent.role.as_str(),
        mission = mission.objective,
        objective = agent.objective,
        iteration = agent.iteration + 1,
        progress = agent.progress,
    )
}
