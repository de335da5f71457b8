//! Strategy knobs shared by the scheduler and the martingale controller.

use serde::{Deserialize, Serialize};

/// How the base stake of a run is derived from a signal's stake value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeMode {
    /// The stake is an absolute amount in account currency.
    #[default]
    Fixed,
    /// The stake is a percentage of the balance reported at authorization.
    PercentOfBalance,
}

/// What a losing attempt does to a run when martingale is disabled for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossPolicy {
    /// The run ends as lost after the first losing attempt.
    #[default]
    ResolveLost,
    /// The run retries at base stake until it wins or a stop condition hits.
    RetryAtBase,
}

impl LossPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            LossPolicy::ResolveLost => "resolve_lost",
            LossPolicy::RetryAtBase => "retry_at_base",
        }
    }
}
