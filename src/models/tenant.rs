//! Team and user scopes. Each carries its own budget, spend and rate
//! ceilings; the guard evaluates every applicable scope independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::key::BudgetPeriod;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub allowed_models: HashSet<String>,
    pub blocked_models: HashSet<String>,
    pub tpm: u32,
    pub rpm: u32,
    pub max_budget: Option<f64>,
    pub budget_period: Option<BudgetPeriod>,
    pub current_spend: f64,
    pub budget_reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
    pub enabled: bool,
    pub allowed_models: HashSet<String>,
    pub blocked_models: HashSet<String>,
    pub tpm: u32,
    pub rpm: u32,
    pub max_budget: Option<f64>,
    pub budget_period: Option<BudgetPeriod>,
    pub current_spend: f64,
    pub budget_reset_at: Option<DateTime<Utc>>,
}

impl Team {
    pub fn allows_model(&self, model: &str) -> bool {
        if self.blocked_models.contains(model) {
            return false;
        }
        self.allowed_models.is_empty() || self.allowed_models.contains(model)
    }
}

impl User {
    pub fn allows_model(&self, model: &str) -> bool {
        if self.blocked_models.contains(model) {
            return false;
        }
        self.allowed_models.is_empty() || self.allowed_models.contains(model)
    }
}
