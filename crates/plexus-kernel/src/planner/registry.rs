//! Plan registry — tracks active plans and retires terminal ones.
//!
//! The registry owns plan lifecycle bookkeeping: plans enter on creation,
//! change status as the scheduler drives them, and are swept out after a
//! retention window once terminal. Replanning swaps the old plan for its
//! successor under a single write lock, so observers never see both active.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::ids::{Clock, SystemClock};
use crate::plan::{Plan, PlanStatus};

/// Default retention of terminal plans, in milliseconds (10 minutes).
pub const DEFAULT_RETENTION_MS: u64 = 600_000;

struct RegisteredPlan {
    plan: Plan,
    /// Set when the plan reaches a terminal status; drives retention sweeps.
    retired_at: Option<u64>,
}

/// Keyed store of all known plans.
pub struct PlanRegistry {
    plans: RwLock<HashMap<String, RegisteredPlan>>,
    retention_ms: u64,
    clock: Arc<dyn Clock>,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION_MS)
    }

    pub fn with_retention(retention_ms: u64) -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            retention_ms,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a freshly created plan.
    pub async fn insert(&self, plan: Plan) {
        let mut plans = self.plans.write().await;
        plans.insert(
            plan.id.clone(),
            RegisteredPlan {
                plan,
                retired_at: None,
            },
        );
    }

    /// Fetch a clone of a plan.
    pub async fn get(&self, plan_id: &str) -> Option<Plan> {
        self.plans.read().await.get(plan_id).map(|r| r.plan.clone())
    }

    /// Returns `true` if the plan is known.
    pub async fn contains(&self, plan_id: &str) -> bool {
        self.plans.read().await.contains_key(plan_id)
    }

    /// Update a plan's status. Terminal statuses start the retention window.
    /// Returns `false` if the plan is unknown.
    pub async fn set_status(&self, plan_id: &str, status: PlanStatus) -> bool {
        let mut plans = self.plans.write().await;
        let Some(entry) = plans.get_mut(plan_id) else {
            return false;
        };
        entry.plan.status = status;
        if status.is_terminal() && entry.retired_at.is_none() {
            entry.retired_at = Some(self.clock.now_millis());
        }
        true
    }

    /// Atomically retire `old_id` (status `Cancelled`) and register its
    /// successor. Returns `false` if the old plan is unknown (the successor
    /// is still registered).
    pub async fn swap(&self, old_id: &str, successor: Plan) -> bool {
        let mut plans = self.plans.write().await;
        let known = match plans.get_mut(old_id) {
            Some(entry) => {
                if !entry.plan.status.is_terminal() {
                    entry.plan.status = PlanStatus::Cancelled;
                }
                entry.retired_at.get_or_insert(self.clock.now_millis());
                true
            }
            None => false,
        };
        plans.insert(
            successor.id.clone(),
            RegisteredPlan {
                plan: successor,
                retired_at: None,
            },
        );
        known
    }

    /// IDs of plans that have not reached a terminal status.
    pub async fn active_ids(&self) -> Vec<String> {
        self.plans
            .read()
            .await
            .values()
            .filter(|r| !r.plan.status.is_terminal())
            .map(|r| r.plan.id.clone())
            .collect()
    }

    /// Remove terminal plans whose retention window has elapsed. Returns the
    /// number removed.
    pub async fn sweep(&self) -> usize {
        let cutoff = self.clock.now_millis().saturating_sub(self.retention_ms);
        let mut plans = self.plans.write().await;
        let before = plans.len();
        plans.retain(|_, r| match r.retired_at {
            Some(retired) => retired > cutoff,
            None => true,
        });
        before - plans.len()
    }

    /// Number of plans currently tracked (active and retained).
    pub async fn len(&self) -> usize {
        self.plans.read().await.len()
    }

    /// Returns `true` when no plans are tracked.
    pub async fn is_empty(&self) -> bool {
        self.plans.read().await.is_empty()
    }
}

impl Default for PlanRegistry {
    fn default() -> Self {
        Self::new()
    }
}
