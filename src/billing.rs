use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::providers::TokenUsage;
use crate::types::MissionId;

/// Receives usage counts; pricing and balances live behind this trait.
#[async_trait]
pub trait Billing: Send + Sync {
    async fn has_credits(&self, mission_id: MissionId) -> Result<bool>;
    async fn record_usage(
        &self,
        mission_id: MissionId,
        usage: &TokenUsage,
        description: &str,
    ) -> Result<()>;
}

/// Always has credits; usage is only logged.
#[derive(Debug, Default)]
pub struct UnmeteredBilling;

#[async_trait]
impl Billing for UnmeteredBilling {
    async fn has_credits(&self, _mission_id: MissionId) -> Result<bool> {
        Ok(true)
    }

    async fn record_usage(
        &self,
        mission_id: MissionId,
        usage: &TokenUsage,
        description: &str,
    ) -> Result<()> {
        log::debug!(
            "Mission {} used {} tokens ({} in / {} out): {}",
            mission_id,
            usage.total(),
            usage.input_tokens,
            usage.output_tokens,
            description
        );
        Ok(())
    }
}

/// Token balance debited per recorded usage. A mission without an explicit
/// balance draws from the default.
#[derive(Debug)]
pub struct CreditLedger {
    default_balance: i64,
    balances: Mutex<HashMap<MissionId, i64>>,
    entries: Mutex<Vec<(MissionId, u64, String)>>,
}

impl CreditLedger {
    pub fn new(default_balance: i64) -> Self {
        Self {
            default_balance,
            balances: Mutex::new(HashMap::new()),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn balance(&self, mission_id: MissionId) -> i64 {
        self.balances
            .lock()
            .ok()
            .and_then(|b| b.get(&mission_id).copied())
            .unwrap_or(self.default_balance)
    }

    pub fn entries(&self) -> Vec<(MissionId, u64, String)> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Billing for CreditLedger {
    async fn has_credits(&self, mission_id: MissionId) -> Result<bool> {
        Ok(self.balance(mission_id) > 0)
    }

    async fn record_usage(
        &self,
        mission_id: MissionId,
        usage: &TokenUsage,
        description: &str,
    ) -> Result<()> {
        let mut balances = self
            .balances
            .lock()
            .map_err(|_| anyhow!("ledger lock poisoned"))?;
        let balance = balances.entry(mission_id).or_insert(self.default_balance);
        *balance -= usage.total() as i64;
        drop(balances);

        self.entries
            .lock()
            .map_err(|_| anyhow!("ledger lock poisoned"))?
            .push((mission_id, usage.total(), description.to_string()));
        Ok(())
    }
}
