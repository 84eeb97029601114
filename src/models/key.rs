//! API key principal: the unit of authentication and the narrowest
//! budget/rate scope.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Api,
    Virtual,
    Master,
}

/// Budget accounting period. Absent means the budget never resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl BudgetPeriod {
    /// Advance a reset timestamp by one period.
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BudgetPeriod::Daily => from + Duration::days(1),
            BudgetPeriod::Weekly => from + Duration::weeks(1),
            BudgetPeriod::Monthly => {
                // Clamp to the same day next month where it exists.
                let (year, month) = if from.month() == 12 {
                    (from.year() + 1, 1)
                } else {
                    (from.year(), from.month() + 1)
                };
                from.with_month(month)
                    .and_then(|d| d.with_year(year))
                    .unwrap_or(from + Duration::days(30))
            }
            BudgetPeriod::Yearly => from
                .with_year(from.year() + 1)
                .unwrap_or(from + Duration::days(365)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    /// sha-256 of the raw key, hex encoded. The raw key is never stored.
    pub hash: String,
    /// Short public fingerprint for supportability (`sg-...`).
    pub prefix: String,
    pub kind: KeyKind,
    pub user_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub enabled: bool,
    /// Empty allow set means every model not in the block set.
    pub allowed_models: HashSet<String>,
    pub blocked_models: HashSet<String>,
    /// 0 means uncapped.
    pub tpm: u32,
    pub rpm: u32,
    pub max_parallel: u32,
    pub max_budget: Option<f64>,
    pub budget_period: Option<BudgetPeriod>,
    pub expires_at: Option<DateTime<Utc>>,

    // Mutable bookkeeping, owned by the settlement pipeline.
    pub current_spend: f64,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub budget_reset_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// A key is usable iff enabled, not expired and not revoked.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled || self.revoked_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(expiry) => expiry > now,
            None => true,
        }
    }

    pub fn allows_model(&self, model: &str) -> bool {
        if self.blocked_models.contains(model) {
            return false;
        }
        self.allowed_models.is_empty() || self.allowed_models.contains(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            hash: "00".repeat(32),
            prefix: "sg-test".into(),
            kind: KeyKind::Api,
            user_id: None,
            team_id: None,
            enabled: true,
            allowed_models: HashSet::new(),
            blocked_models: HashSet::new(),
            tpm: 0,
            rpm: 0,
            max_parallel: 0,
            max_budget: None,
            budget_period: None,
            expires_at: None,
            current_spend: 0.0,
            usage_count: 0,
            last_used_at: None,
            budget_reset_at: None,
            revoked_at: None,
        }
    }

    #[test]
    fn revoked_key_is_unusable() {
        let mut k = key();
        assert!(k.is_usable(Utc::now()));
        k.revoked_at = Some(Utc::now());
        assert!(!k.is_usable(Utc::now()));
    }

    #[test]
    fn expired_key_is_unusable() {
        let mut k = key();
        k.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(!k.is_usable(Utc::now()));
    }

    #[test]
    fn empty_allow_set_means_all_not_blocked() {
        let mut k = key();
        assert!(k.allows_model("gpt-4"));
        k.blocked_models.insert("gpt-4".into());
        assert!(!k.allows_model("gpt-4"));
        assert!(k.allows_model("claude-3-opus"));

        k.allowed_models.insert("claude-3-opus".into());
        assert!(k.allows_model("claude-3-opus"));
        assert!(!k.allows_model("gemini-pro"));
    }

    #[test]
    fn monthly_period_advances_across_year_end() {
        let december = Utc::now().with_month(12).unwrap().with_day(15).unwrap();
        let next = BudgetPeriod::Monthly.advance(december);
        assert_eq!(next.month(), 1);
        assert_eq!(next.year(), december.year() + 1);
    }
}
