use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::storage::traits::{CommitReceipt, IterationWrites, MessageWrite, Storage};
use crate::types::{
    Agent, AgentId, AgentRole, AgentStatus, Event, EventKind, Finding, FindingKind, Message,
    Mission, MissionId, MissionStatus, ReportSection,
};

const MISSION_COLUMNS: &str =
    "id, objective, status, started_at, searches_used, synthesis, synthesis_claimed_at, completed_at";

const AGENT_COLUMNS: &str = "id, mission_id, parent_id, role, objective, status, depth, iteration, \
     progress, pending_input, output, current_activity, context, last_completion_check, \
     claimed_at, created_at, updated_at, completed_at";

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/V001__initial_schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_agent(tx: &mut Transaction<'_, Postgres>, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, mission_id, parent_id, role, objective, status, depth,
                                iteration, progress, context, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(agent.id)
        .bind(agent.mission_id)
        .bind(agent.parent_id)
        .bind(agent.role.as_str())
        .bind(&agent.objective)
        .bind(agent.status.as_str())
        .bind(agent.depth as i32)
        .bind(agent.iteration as i32)
        .bind(agent.progress as i16)
        .bind(&agent.context)
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_messages(
        tx: &mut Transaction<'_, Postgres>,
        agent_id: AgentId,
        messages: &[Message],
    ) -> Result<()> {
        for message in messages {
            sqlx::query("INSERT INTO messages (agent_id, role, content) VALUES ($1, $2, $3)")
                .bind(agent_id)
                .bind(&message.role)
                .bind(&message.content)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

fn lease_secs(lease: Duration) -> f64 {
    lease.num_milliseconds() as f64 / 1000.0
}

fn row_to_mission(r: &PgRow) -> Result<Mission> {
    let status: String = r.get("status");
    let searches_used: i32 = r.get("searches_used");
    Ok(Mission {
        id: r.get("id"),
        objective: r.get("objective"),
        status: MissionStatus::parse(&status)
            .ok_or_else(|| anyhow!("Unknown mission status: {}", status))?,
        started_at: r.get("started_at"),
        searches_used: searches_used.max(0) as u32,
        synthesis: r.get("synthesis"),
        synthesis_claimed_at: r.get("synthesis_claimed_at"),
        completed_at: r.get("completed_at"),
    })
}

fn row_to_agent(r: &PgRow) -> Result<Agent> {
    let status: String = r.get("status");
    let role: String = r.get("role");
    let depth: i32 = r.get("depth");
    let iteration: i32 = r.get("iteration");
    let progress: i16 = r.get("progress");
    Ok(Agent {
        id: r.get("id"),
        mission_id: r.get("mission_id"),
        parent_id: r.get("parent_id"),
        role: AgentRole::from_str_lossy(&role),
        objective: r.get("objective"),
        status: AgentStatus::parse(&status)
            .ok_or_else(|| anyhow!("Unknown agent status: {}", status))?,
        depth: depth.max(0) as u32,
        iteration: iteration.max(0) as u32,
        progress: progress.clamp(0, 100) as u8,
        pending_input: r.get("pending_input"),
        output: r.get("output"),
        current_activity: r.get("current_activity"),
        context: r.get("context"),
        last_completion_check: r.get("last_completion_check"),
        claimed_at: r.get("claimed_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        completed_at: r.get("completed_at"),
    })
}

fn row_to_finding(r: &PgRow) -> Finding {
    let kind: String = r.get("kind");
    Finding {
        id: r.get("id"),
        mission_id: r.get("mission_id"),
        agent_id: r.get("agent_id"),
        kind: FindingKind::parse(&kind),
        title: r.get("title"),
        content: r.get("content"),
        created_at: r.get("created_at"),
    }
}

fn row_to_event(r: &PgRow) -> Result<Event> {
    let kind: String = r.get("kind");
    Ok(Event {
        id: r.get("id"),
        mission_id: r.get("mission_id"),
        agent_id: r.get("agent_id"),
        kind: EventKind::parse(&kind).ok_or_else(|| anyhow!("Unknown event kind: {}", kind))?,
        detail: r.get("detail"),
        created_at: r.get("created_at"),
    })
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_mission(&self, mission: &Mission) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO missions (id, objective, status, started_at, searches_used)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(mission.id)
        .bind(&mission.objective)
        .bind(mission.status.as_str())
        .bind(mission.started_at)
        .bind(mission.searches_used as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_mission(&self, id: MissionId) -> Result<Option<Mission>> {
        let row = sqlx::query(&format!("SELECT {} FROM missions WHERE id = $1", MISSION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_mission).transpose()
    }

    async fn list_missions(&self, status: Option<MissionStatus>) -> Result<Vec<Mission>> {
        let rows = match status {
            Some(s) => {
                sqlx::query(&format!(
                    "SELECT {} FROM missions WHERE status = $1 ORDER BY started_at DESC",
                    MISSION_COLUMNS
                ))
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM missions ORDER BY started_at DESC",
                    MISSION_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_mission).collect()
    }

    async fn transition_mission(
        &self,
        id: MissionId,
        from: MissionStatus,
        to: MissionStatus,
    ) -> Result<bool> {
        if !from.can_advance_to(to) {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE missions
            SET status = $3,
                completed_at = CASE WHEN $3 = 'completed' THEN NOW() ELSE completed_at END
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_synthesis(&self, id: MissionId, lease: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE missions
            SET synthesis_claimed_at = NOW()
            WHERE id = $1
              AND status = 'synthesizing'
              AND (synthesis_claimed_at IS NULL
                   OR synthesis_claimed_at < NOW() - $2::double precision * INTERVAL '1 second')
            "#,
        )
        .bind(id)
        .bind(lease_secs(lease))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_mission(&self, id: MissionId, synthesis: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE missions
            SET status = 'completed', synthesis = $2, completed_at = NOW()
            WHERE id = $1 AND status = 'synthesizing'
            "#,
        )
        .bind(id)
        .bind(synthesis)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_agent(&self, agent: &Agent) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_agent(&mut tx, agent).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        let row = sqlx::query(&format!("SELECT {} FROM agents WHERE id = $1", AGENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn update_agent(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agents
            SET role = $2, objective = $3, status = $4, iteration = $5, progress = $6,
                pending_input = $7, output = $8, current_activity = $9, context = $10,
                last_completion_check = $11, completed_at = $12,
                claimed_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(agent.id)
        .bind(agent.role.as_str())
        .bind(&agent.objective)
        .bind(agent.status.as_str())
        .bind(agent.iteration as i32)
        .bind(agent.progress as i16)
        .bind(&agent.pending_input)
        .bind(&agent.output)
        .bind(&agent.current_activity)
        .bind(&agent.context)
        .bind(agent.last_completion_check)
        .bind(agent.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_mission_agents(&self, mission_id: MissionId) -> Result<Vec<Agent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM agents WHERE mission_id = $1 ORDER BY created_at ASC",
            AGENT_COLUMNS
        ))
        .bind(mission_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn get_children(&self, parent_id: AgentId) -> Result<Vec<Agent>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM agents WHERE parent_id = $1 ORDER BY created_at ASC",
            AGENT_COLUMNS
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn get_terminal_children_since(
        &self,
        parent_id: AgentId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Agent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM agents
            WHERE parent_id = $1
              AND status IN ('completed', 'failed')
              AND completed_at IS NOT NULL
              AND ($2::timestamptz IS NULL OR completed_at > $2)
            ORDER BY completed_at ASC
            "#,
            AGENT_COLUMNS
        ))
        .bind(parent_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_agent).collect()
    }

    async fn activate_spawning_agents(&self, mission_id: MissionId) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE agents SET status = 'working'
            WHERE mission_id = $1 AND status = 'spawning'
            "#,
        )
        .bind(mission_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn claim_one_working_agent(
        &self,
        mission_id: MissionId,
        lease: Duration,
    ) -> Result<Option<Agent>> {
        // SKIP LOCKED lets concurrent ticks pass over a row another claim is
        // already updating instead of blocking on it.
        let row = sqlx::query(&format!(
            r#"
            UPDATE agents SET claimed_at = NOW()
            WHERE id = (
                SELECT id FROM agents
                WHERE mission_id = $1
                  AND status = 'working'
                  AND (claimed_at IS NULL
                       OR claimed_at < NOW() - $2::double precision * INTERVAL '1 second')
                ORDER BY updated_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            AGENT_COLUMNS
        ))
        .bind(mission_id)
        .bind(lease_secs(lease))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_agent).transpose()
    }

    async fn release_claim(&self, agent_id: AgentId) -> Result<()> {
        sqlx::query("UPDATE agents SET claimed_at = NULL, updated_at = NOW() WHERE id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all_agents_terminal(&self, mission_id: MissionId) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status NOT IN ('completed', 'failed')) AS live
            FROM agents WHERE mission_id = $1
            "#,
        )
        .bind(mission_id)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get("total");
        let live: i64 = row.get("live");
        Ok(total > 0 && live == 0)
    }

    async fn force_complete_agents(&self, mission_id: MissionId, output: &str) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE agents
            SET status = 'completed', output = $2, progress = 100, claimed_at = NULL,
                completed_at = NOW(), updated_at = NOW()
            WHERE mission_id = $1 AND status IN ('working', 'spawning')
            "#,
        )
        .bind(mission_id)
        .bind(output)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get_messages(&self, agent_id: AgentId) -> Result<Vec<Message>> {
        let rows = sqlx::query("SELECT role, content FROM messages WHERE agent_id = $1 ORDER BY seq ASC")
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| Message {
                role: r.get("role"),
                content: r.get("content"),
            })
            .collect())
    }

    async fn append_messages(&self, agent_id: AgentId, messages: &[Message]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_messages(&mut tx, agent_id, messages).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_findings(&self, mission_id: MissionId, limit: usize) -> Result<Vec<Finding>> {
        let rows = sqlx::query(
            r#"
            SELECT id, mission_id, agent_id, kind, title, content, created_at
            FROM findings WHERE mission_id = $1
            ORDER BY created_at DESC LIMIT $2
            "#,
        )
        .bind(mission_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_finding).collect())
    }

    async fn get_sibling_findings(
        &self,
        parent_id: AgentId,
        exclude: AgentId,
        limit: usize,
    ) -> Result<Vec<Finding>> {
        let rows = sqlx::query(
            r#"
            SELECT f.id, f.mission_id, f.agent_id, f.kind, f.title, f.content, f.created_at
            FROM findings f
            JOIN agents a ON a.id = f.agent_id
            WHERE a.parent_id = $1 AND f.agent_id <> $2
            ORDER BY f.created_at DESC LIMIT $3
            "#,
        )
        .bind(parent_id)
        .bind(exclude)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_finding).collect())
    }

    async fn get_report_sections(&self, mission_id: MissionId) -> Result<Vec<ReportSection>> {
        let rows = sqlx::query(
            r#"
            SELECT id, mission_id, agent_id, title, content, created_at
            FROM report_sections WHERE mission_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(mission_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ReportSection {
                id: r.get("id"),
                mission_id: r.get("mission_id"),
                agent_id: r.get("agent_id"),
                title: r.get("title"),
                content: r.get("content"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn record_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, mission_id, agent_id, kind, detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.mission_id)
        .bind(event.agent_id)
        .bind(event.kind.as_str())
        .bind(&event.detail)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_events(&self, mission_id: MissionId) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT id, mission_id, agent_id, kind, detail, created_at
            FROM events WHERE mission_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(mission_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn commit_iteration(&self, writes: &IterationWrites) -> Result<CommitReceipt> {
        let agent = &writes.agent;
        let mut tx = self.pool.begin().await?;

        // Serializes spawn commits within a mission so the counts below hold
        sqlx::query("SELECT id FROM missions WHERE id = $1 FOR UPDATE")
            .bind(agent.mission_id)
            .fetch_optional(&mut *tx)
            .await?;

        let updated = sqlx::query(
            r#"
            UPDATE agents
            SET status = $2, iteration = $3, progress = $4, pending_input = $5, output = $6,
                current_activity = $7, context = $8, last_completion_check = $9,
                completed_at = $10, claimed_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'working' AND claimed_at IS NOT DISTINCT FROM $11
            "#,
        )
        .bind(agent.id)
        .bind(agent.status.as_str())
        .bind(agent.iteration as i32)
        .bind(agent.progress as i16)
        .bind(&agent.pending_input)
        .bind(&agent.output)
        .bind(&agent.current_activity)
        .bind(&agent.context)
        .bind(agent.last_completion_check)
        .bind(agent.completed_at)
        .bind(agent.claimed_at)
        .execute(&mut *tx)
        .await?;

        let mut receipt = CommitReceipt {
            applied: updated.rows_affected() == 1,
            children: Vec::new(),
        };

        if receipt.applied {
            let room = match writes.child_limits {
                Some(limits) => {
                    let row = sqlx::query(
                        r#"
                        SELECT COUNT(*) AS total,
                               COUNT(*) FILTER (WHERE parent_id = $2) AS children
                        FROM agents WHERE mission_id = $1
                        "#,
                    )
                    .bind(agent.mission_id)
                    .bind(agent.id)
                    .fetch_one(&mut *tx)
                    .await?;
                    let total: i64 = row.try_get("total")?;
                    let children: i64 = row.try_get("children")?;
                    limits
                        .max_total_agents
                        .saturating_sub(total as usize)
                        .min(limits.max_children.saturating_sub(children as usize))
                }
                None => writes.children.len(),
            };
            for child in writes.children.iter().take(room) {
                Self::insert_agent(&mut tx, child).await?;
                receipt.children.push(child.id);
            }

            if let MessageWrite::Replace(_) = writes.messages {
                sqlx::query("DELETE FROM messages WHERE agent_id = $1")
                    .bind(agent.id)
                    .execute(&mut *tx)
                    .await?;
            }
            Self::insert_messages(&mut tx, agent.id, writes.messages.messages()).await?;
        }

        for finding in &writes.findings {
            sqlx::query(
                r#"
                INSERT INTO findings (id, mission_id, agent_id, kind, title, content, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(finding.id)
            .bind(finding.mission_id)
            .bind(finding.agent_id)
            .bind(finding.kind.as_str())
            .bind(&finding.title)
            .bind(&finding.content)
            .bind(finding.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for section in &writes.report_sections {
            sqlx::query(
                r#"
                INSERT INTO report_sections (id, mission_id, agent_id, title, content, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(section.id)
            .bind(section.mission_id)
            .bind(section.agent_id)
            .bind(&section.title)
            .bind(&section.content)
            .bind(section.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for event in &writes.events {
            sqlx::query(
                r#"
                INSERT INTO events (id, mission_id, agent_id, kind, detail, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(event.id)
            .bind(event.mission_id)
            .bind(event.agent_id)
            .bind(event.kind.as_str())
            .bind(&event.detail)
            .bind(event.created_at)
            .execute(&mut *tx)
            .await?;
        }

        if writes.searches_used > 0 {
            sqlx::query("UPDATE missions SET searches_used = searches_used + $2 WHERE id = $1")
                .bind(agent.mission_id)
                .bind(writes.searches_used as i32)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(receipt)
    }
}
