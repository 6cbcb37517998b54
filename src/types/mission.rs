use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{MissionId, MissionStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: MissionId,
    pub objective: String,
    pub status: MissionStatus,
    pub started_at: DateTime<Utc>,
    pub searches_used: u32,
    pub synthesis: Option<String>,
    pub synthesis_claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Mission {
    pub fn new(objective: String) -> Self {
        Self {
            id: MissionId::new_v4(),
            objective,
            status: MissionStatus::Active,
            started_at: Utc::now(),
            searches_used: 0,
            synthesis: None,
            synthesis_claimed_at: None,
            completed_at: None,
        }
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.started_at)
    }
}
