use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use crate::storage::Storage;
use crate::types::{Event, EventKind, Mission, MissionId, MissionStatus};

pub const REAPED_OUTPUT: &str = "Mission time limit reached; work stopped.";

/// Force-drains active missions that outlived their wall-clock budget.
pub struct StaleMissionReaper {
    storage: Arc<dyn Storage>,
    time_limit: Duration,
}

impl StaleMissionReaper {
    pub fn new(storage: Arc<dyn Storage>, time_limit: Duration) -> Self {
        Self {
            storage,
            time_limit,
        }
    }

    /// Returns the ids of missions moved to `synthesizing`.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<Vec<MissionId>> {
        let active = self
            .storage
            .list_missions(Some(MissionStatus::Active))
            .await?;

        let mut reaped = Vec::new();
        for mission in active
            .iter()
            .filter(|m| m.elapsed(now) > self.time_limit)
        {
            match self.drain(mission).await {
                Ok(true) => reaped.push(mission.id),
                Ok(false) => {}
                Err(e) => log::warn!("Failed to reap mission {}: {}", mission.id, e),
            }
        }
        Ok(reaped)
    }

    async fn drain(&self, mission: &Mission) -> Result<bool> {
        let stopped = self
            .storage
            .force_complete_agents(mission.id, REAPED_OUTPUT)
            .await?;
        let moved = self
            .storage
            .transition_mission(mission.id, MissionStatus::Active, MissionStatus::Synthesizing)
            .await?;
        if moved {
            log::warn!(
                "Mission {} exceeded {} minutes; stopped {} agent(s)",
                mission.id,
                self.time_limit.num_minutes(),
                stopped
            );
            self.storage
                .record_event(
                    &Event::new(mission.id, None, EventKind::MissionReaped)
                        .with_detail(json!({ "stopped_agents": stopped })),
                )
                .await?;
        }
        Ok(moved)
    }
}
