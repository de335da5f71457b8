//! Trade attempts: one submitted order and its eventual outcome.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error taxonomy every terminal attempt state is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient transport failure.
    ConnectionError,
    /// Token rejected; trading halts for the account.
    AuthenticationError,
    /// Business-level refusal such as insufficient balance or a closed market.
    OrderRejected,
    /// No result within the attempt window. Inconclusive.
    AttemptTimeout,
    /// A stop threshold ended the run. Informational.
    StopConditionHit,
}

/// Why an attempt ended without a settled contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// The connection dropped and no resubmissions were left.
    Disconnected,
    /// The account was switched before the buy was answered. The order may
    /// have reached the old account, so it is never resubmitted.
    AccountSwitched,
    /// No result arrived within the attempt window.
    Timeout,
    /// The broker refused the order.
    Order { code: String, message: String },
    /// The session's token was rejected.
    Unauthorized { message: String },
}

impl RejectReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            RejectReason::Disconnected | RejectReason::AccountSwitched => ErrorClass::ConnectionError,
            RejectReason::Timeout => ErrorClass::AttemptTimeout,
            RejectReason::Order { .. } => ErrorClass::OrderRejected,
            RejectReason::Unauthorized { .. } => ErrorClass::AuthenticationError,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Disconnected => write!(f, "connection lost before a result arrived"),
            RejectReason::AccountSwitched => write!(f, "account switched before the buy was answered"),
            RejectReason::Timeout => write!(f, "no result within the attempt window"),
            RejectReason::Order { code, message } => write!(f, "order rejected ({code}): {message}"),
            RejectReason::Unauthorized { message } => write!(f, "unauthorized: {message}"),
        }
    }
}

/// Result of a trade attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Pending,
    Won,
    Lost,
    Rejected(RejectReason),
}

/// Final state of a settled contract, as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSettlement {
    pub contract_id: u64,
    /// Net profit of the contract. Non-positive means the attempt lost.
    pub profit: Decimal,
    /// Amount returned when the contract was sold.
    pub payout: Decimal,
    pub buy_price: Option<Decimal>,
}

impl ContractSettlement {
    pub fn is_win(&self) -> bool {
        self.profit > Decimal::ZERO
    }
}

/// One submitted order and its eventual outcome. Immutable once finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeAttempt {
    pub id: Uuid,
    pub signal_id: Uuid,
    /// 1-based position of this attempt within its signal's run.
    pub sequence: u32,
    pub stake: Decimal,
    pub submitted_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub result: AttemptResult,
    pub contract_id: Option<u64>,
    pub payout: Decimal,
    pub profit: Decimal,
    /// Times the same order was resubmitted after a dropped connection.
    pub resubmissions: u32,
}

impl TradeAttempt {
    pub fn new(signal_id: Uuid, sequence: u32, stake: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal_id,
            sequence,
            stake,
            submitted_at: Utc::now(),
            finalized_at: None,
            result: AttemptResult::Pending,
            contract_id: None,
            payout: Decimal::ZERO,
            profit: Decimal::ZERO,
            resubmissions: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.result == AttemptResult::Pending
    }

    /// Finalize from a contract settlement. Returns false if already final.
    pub fn settle(&mut self, settlement: &ContractSettlement) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.contract_id = Some(settlement.contract_id);
        self.payout = settlement.payout;
        self.profit = settlement.profit;
        self.result = if settlement.is_win() {
            AttemptResult::Won
        } else {
            AttemptResult::Lost
        };
        self.finalized_at = Some(Utc::now());
        true
    }

    /// Finalize as rejected. Returns false if already final.
    pub fn reject(&mut self, reason: RejectReason) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.result = AttemptResult::Rejected(reason);
        self.finalized_at = Some(Utc::now());
        true
    }

    /// Realized profit or loss. Only settled attempts count toward P/L.
    pub fn realized_pnl(&self) -> Option<Decimal> {
        match self.result {
            AttemptResult::Won | AttemptResult::Lost => Some(self.profit),
            _ => None,
        }
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        match &self.result {
            AttemptResult::Rejected(reason) => Some(reason.class()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settlement(profit: i64) -> ContractSettlement {
        ContractSettlement {
            contract_id: 42,
            profit: Decimal::new(profit, 0),
            payout: Decimal::new(profit.max(0) + 10, 0),
            buy_price: Some(Decimal::new(10, 0)),
        }
    }

    #[test]
    fn test_settle_win_and_loss() {
        let mut won = TradeAttempt::new(Uuid::new_v4(), 1, Decimal::new(10, 0));
        assert!(won.settle(&settlement(8)));
        assert_eq!(won.result, AttemptResult::Won);
        assert_eq!(won.realized_pnl(), Some(Decimal::new(8, 0)));
        assert_eq!(won.contract_id, Some(42));

        let mut lost = TradeAttempt::new(Uuid::new_v4(), 1, Decimal::new(10, 0));
        lost.settle(&settlement(-10));
        assert_eq!(lost.result, AttemptResult::Lost);
        assert_eq!(lost.realized_pnl(), Some(Decimal::new(-10, 0)));
    }

    #[test]
    fn test_break_even_counts_as_loss() {
        let mut attempt = TradeAttempt::new(Uuid::new_v4(), 1, Decimal::new(10, 0));
        attempt.settle(&settlement(0));
        assert_eq!(attempt.result, AttemptResult::Lost);
    }

    #[test]
    fn test_finalized_attempt_is_immutable() {
        let mut attempt = TradeAttempt::new(Uuid::new_v4(), 1, Decimal::new(10, 0));
        assert!(attempt.reject(RejectReason::Timeout));
        assert!(!attempt.settle(&settlement(8)));
        assert!(!attempt.reject(RejectReason::Disconnected));
        assert_eq!(attempt.result, AttemptResult::Rejected(RejectReason::Timeout));
        assert_eq!(attempt.realized_pnl(), None);
    }

    #[test]
    fn test_every_rejection_has_one_class() {
        let cases = [
            (RejectReason::Disconnected, ErrorClass::ConnectionError),
            (RejectReason::Timeout, ErrorClass::AttemptTimeout),
            (
                RejectReason::Order {
                    code: "MarketIsClosed".to_string(),
                    message: "closed".to_string(),
                },
                ErrorClass::OrderRejected,
            ),
            (
                RejectReason::Unauthorized {
                    message: "InvalidToken".to_string(),
                },
                ErrorClass::AuthenticationError,
            ),
        ];

        for (reason, class) in cases {
            let mut attempt = TradeAttempt::new(Uuid::new_v4(), 1, Decimal::ONE);
            attempt.reject(reason);
            assert_eq!(attempt.error_class(), Some(class));
        }
    }
}
