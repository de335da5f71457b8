//! In-process paper broker.
//!
//! Speaks the same JSON frames as the live broker over channel-backed
//! connections, so the session, executor and scheduler run unchanged against
//! it. Outcomes are either drawn at random or taken from a script, which
//! makes it the test double for the whole engine.

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::api::protocol::decimal_value;
use crate::api::transport::{Connector, FrameSink, FrameStream};
use crate::config::PaperSettings;
use crate::{Error, Result};

/// Settings of the paper broker.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Probability of a random outcome being a win.
    pub win_rate: f64,
    /// Profit of a random win as a fraction of the stake.
    pub payout_ratio: Decimal,
    pub starting_balance: Decimal,
    pub currency: String,
    /// Time from purchase until the contract is sold.
    pub settle_after: Duration,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self::from(&PaperSettings::default())
    }
}

impl From<&PaperSettings> for PaperConfig {
    fn from(settings: &PaperSettings) -> Self {
        Self {
            win_rate: settings.win_rate,
            payout_ratio: settings.payout_ratio,
            starting_balance: settings.starting_balance,
            currency: "USD".to_string(),
            settle_after: Duration::from_millis(settings.settle_after_ms),
        }
    }
}

/// Scripted result of the next buy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaperOutcome {
    /// The contract wins with this net profit.
    Win { profit: Decimal },
    /// The contract loses its whole stake.
    Loss,
    /// The buy is refused with a broker error.
    Reject { code: String, message: String },
    /// The connection closes before the buy is answered.
    DropBeforeReply,
    /// The buy is accepted but the contract never settles.
    Unsettled,
    /// The buy is recorded but never answered.
    NoReply,
}

/// A buy request the paper broker received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperPurchase {
    pub symbol: String,
    pub contract_type: String,
    pub stake: Decimal,
    /// Whether the buy was confirmed with a contract.
    pub acknowledged: bool,
    pub contract_id: Option<u64>,
}

struct PaperContract {
    stake: Decimal,
    /// `None` for contracts that never settle.
    profit: Option<Decimal>,
    settles_at: Instant,
    credited: bool,
}

struct PaperState {
    script: VecDeque<PaperOutcome>,
    contracts: HashMap<u64, PaperContract>,
    purchases: Vec<PaperPurchase>,
    rejected_tokens: HashSet<String>,
    next_contract_id: u64,
    balance: Decimal,
    refuse_next: u32,
    /// Subscribe requests received per contract, across connections.
    subscriptions: HashMap<u64, u32>,
    pings: u32,
}

impl PaperState {
    fn next_outcome(&mut self, config: &PaperConfig, stake: Decimal) -> PaperOutcome {
        if let Some(outcome) = self.script.pop_front() {
            return outcome;
        }
        if rand::thread_rng().gen_bool(config.win_rate.clamp(0.0, 1.0)) {
            PaperOutcome::Win {
                profit: (stake * config.payout_ratio).round_dp(2),
            }
        } else {
            PaperOutcome::Loss
        }
    }
}

/// Scriptable in-process broker.
pub struct PaperBroker {
    config: PaperConfig,
    state: Arc<Mutex<PaperState>>,
    connections: AtomicU32,
    kill: watch::Sender<u64>,
}

impl PaperBroker {
    /// Broker with random outcomes.
    pub fn new(config: PaperConfig) -> Self {
        Self::scripted(config, Vec::new())
    }

    /// Broker that plays `outcomes` in order, then falls back to random ones.
    pub fn scripted(config: PaperConfig, outcomes: Vec<PaperOutcome>) -> Self {
        let (kill, _) = watch::channel(0);
        let state = PaperState {
            script: outcomes.into(),
            contracts: HashMap::new(),
            purchases: Vec::new(),
            rejected_tokens: HashSet::new(),
            next_contract_id: 1_000,
            balance: config.starting_balance,
            refuse_next: 0,
            subscriptions: HashMap::new(),
            pings: 0,
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            connections: AtomicU32::new(0),
            kill,
        }
    }

    /// Treat `token` as invalid on authorization.
    pub fn reject_token(&self, token: &str) {
        self.state().rejected_tokens.insert(token.to_string());
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.state().refuse_next = count;
    }

    /// Close every open connection, as a network drop would.
    pub fn drop_connections(&self) {
        info!("Paper broker dropping all connections");
        self.kill.send_modify(|generation| *generation += 1);
    }

    pub fn purchases(&self) -> Vec<PaperPurchase> {
        self.state().purchases.clone()
    }

    /// Stakes of acknowledged and unacknowledged buys, in arrival order.
    pub fn submitted_stakes(&self) -> Vec<Decimal> {
        self.state().purchases.iter().map(|p| p.stake).collect()
    }

    /// Connections opened so far.
    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Subscribe requests received for `contract_id`.
    pub fn contract_subscriptions(&self, contract_id: u64) -> u32 {
        self.state().subscriptions.get(&contract_id).copied().unwrap_or(0)
    }

    /// Keepalive pings received.
    pub fn pings(&self) -> u32 {
        self.state().pings
    }

    pub fn balance(&self) -> Decimal {
        self.state().balance
    }

    /// Open one channel-backed connection and start serving it.
    pub fn open_connection(&self) -> Result<(FrameSink, FrameStream)> {
        {
            let mut state = self.state();
            if state.refuse_next > 0 {
                state.refuse_next -= 1;
                return Err(Error::Connection {
                    message: "paper broker refused the connection".to_string(),
                });
            }
        }
        let connection = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(connection, "Paper broker accepted connection");

        let (client_tx, server_rx) = mpsc::channel::<String>(64);
        let (server_tx, client_rx) = mpsc::channel::<String>(64);

        let server = PaperServer {
            config: self.config.clone(),
            state: self.state.clone(),
            inbound: server_rx,
            outbound: server_tx,
            kill: self.kill.subscribe(),
            authorized: false,
            scheduled: Vec::new(),
        };
        tokio::spawn(server.run());

        let sink = futures_util::sink::unfold(client_tx, |tx, frame: String| async move {
            tx.send(frame).await.map_err(|_| Error::Connection {
                message: "paper connection closed".to_string(),
            })?;
            Ok::<_, Error>(tx)
        });
        let stream = futures_util::stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (Ok::<_, Error>(frame), rx))
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        lock(&self.state)
    }
}

#[async_trait]
impl Connector for PaperBroker {
    async fn connect(&self) -> Result<(FrameSink, FrameStream)> {
        self.open_connection()
    }
}

fn lock(state: &Mutex<PaperState>) -> MutexGuard<'_, PaperState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ScheduledSettlement {
    due: Instant,
    contract_id: u64,
    req_id: Option<u64>,
}

/// Serves one connection until the client goes away or it is killed.
struct PaperServer {
    config: PaperConfig,
    state: Arc<Mutex<PaperState>>,
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<String>,
    kill: watch::Receiver<u64>,
    authorized: bool,
    scheduled: Vec<ScheduledSettlement>,
}

impl PaperServer {
    async fn run(mut self) {
        loop {
            let next_due = self.scheduled.iter().map(|s| s.due).min();
            let wake_at = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3_600));

            tokio::select! {
                _ = self.kill.changed() => return,
                frame = self.inbound.recv() => {
                    let Some(frame) = frame else { return };
                    if !self.handle(&frame).await {
                        return;
                    }
                }
                _ = tokio::time::sleep_until(wake_at), if next_due.is_some() => {
                    if !self.flush_due().await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns false when the connection should close.
    async fn handle(&mut self, frame: &str) -> bool {
        let Ok(request) = serde_json::from_str::<Value>(frame) else {
            return self.error(None, "unknown", "InputValidationFailed", "Malformed JSON").await;
        };
        let req_id = request.get("req_id").and_then(Value::as_u64);

        if let Some(token) = request.get("authorize").and_then(Value::as_str) {
            return self.authorize(req_id, token).await;
        }
        if request.get("ping").is_some() {
            lock(&self.state).pings += 1;
            return self.send(json!({ "msg_type": "ping", "ping": "pong" }), req_id).await;
        }
        if !self.authorized {
            return self
                .error(req_id, "unknown", "AuthorizationRequired", "Please log in.")
                .await;
        }
        if request.get("buy").is_some() {
            return self.buy(req_id, &request).await;
        }
        if request.get("proposal_open_contract").is_some() {
            let contract_id = request.get("contract_id").and_then(Value::as_u64).unwrap_or(0);
            *lock(&self.state).subscriptions.entry(contract_id).or_default() += 1;
            return self.open_contract(req_id, contract_id).await;
        }
        if request.get("forget").is_some() {
            return self.send(json!({ "msg_type": "forget", "forget": 1 }), req_id).await;
        }
        self.error(req_id, "unknown", "UnrecognisedRequest", "Unrecognised request")
            .await
    }

    async fn authorize(&mut self, req_id: Option<u64>, token: &str) -> bool {
        let (rejected, balance) = {
            let state = lock(&self.state);
            (state.rejected_tokens.contains(token), state.balance)
        };
        if rejected {
            return self
                .error(req_id, "authorize", "InvalidToken", "The token is invalid.")
                .await;
        }

        self.authorized = true;
        self.send(
            json!({
                "msg_type": "authorize",
                "authorize": {
                    "balance": decimal_value(balance),
                    "currency": self.config.currency,
                    "loginid": "VRTC0000001",
                }
            }),
            req_id,
        )
        .await
    }

    async fn buy(&mut self, req_id: Option<u64>, request: &Value) -> bool {
        let params = &request["parameters"];
        let stake = params
            .get("amount")
            .map(|v| v.to_string().trim_matches('"').to_string())
            .and_then(|s| Decimal::from_str(&s).ok())
            .unwrap_or(Decimal::ZERO);
        let symbol = params["symbol"].as_str().unwrap_or_default().to_string();
        let contract_type = params["contract_type"].as_str().unwrap_or_default().to_string();

        let (outcome, contract_id) = {
            let mut state = lock(&self.state);
            let outcome = state.next_outcome(&self.config, stake);
            let contract_id = match &outcome {
                PaperOutcome::Win { .. } | PaperOutcome::Loss | PaperOutcome::Unsettled => {
                    let id = state.next_contract_id;
                    state.next_contract_id += 1;
                    let profit = match &outcome {
                        PaperOutcome::Win { profit } => Some(*profit),
                        PaperOutcome::Loss => Some(-stake),
                        _ => None,
                    };
                    state.contracts.insert(
                        id,
                        PaperContract {
                            stake,
                            profit,
                            settles_at: Instant::now() + self.config.settle_after,
                            credited: false,
                        },
                    );
                    state.balance -= stake;
                    Some(id)
                }
                _ => None,
            };
            state.purchases.push(PaperPurchase {
                symbol: symbol.clone(),
                contract_type: contract_type.clone(),
                stake,
                acknowledged: contract_id.is_some(),
                contract_id,
            });
            (outcome, contract_id)
        };

        match (outcome, contract_id) {
            (PaperOutcome::DropBeforeReply, _) => {
                info!(stake = %stake, "Paper broker dropping connection before buy reply");
                false
            }
            (PaperOutcome::Reject { code, message }, _) => {
                self.error(req_id, "buy", &code, &message).await
            }
            (_, Some(contract_id)) => {
                let potential = stake + (stake * self.config.payout_ratio).round_dp(2);
                self.send(
                    json!({
                        "msg_type": "buy",
                        "buy": {
                            "contract_id": contract_id,
                            "buy_price": decimal_value(stake),
                            "payout": decimal_value(potential),
                            "transaction_id": contract_id * 2,
                            "longcode": format!("{} {} paper contract", contract_type, symbol),
                        }
                    }),
                    req_id,
                )
                .await
            }
            (_, None) => true,
        }
    }

    async fn open_contract(&mut self, req_id: Option<u64>, contract_id: u64) -> bool {
        let status = {
            let state = lock(&self.state);
            state
                .contracts
                .get(&contract_id)
                .map(|c| (c.profit.is_some(), c.settles_at))
        };
        let Some((settles, settles_at)) = status else {
            return self
                .error(
                    req_id,
                    "proposal_open_contract",
                    "InvalidContractId",
                    "Contract not found",
                )
                .await;
        };

        if settles && Instant::now() >= settles_at {
            return self.send_settlement(contract_id, req_id).await;
        }

        let open = json!({
            "msg_type": "proposal_open_contract",
            "proposal_open_contract": {
                "contract_id": contract_id,
                "is_sold": 0,
                "status": "open",
            },
            "subscription": { "id": subscription_id(contract_id) },
        });
        if !self.send(open, req_id).await {
            return false;
        }
        if settles {
            self.scheduled.push(ScheduledSettlement {
                due: settles_at,
                contract_id,
                req_id,
            });
        }
        true
    }

    async fn flush_due(&mut self) -> bool {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) =
            self.scheduled.drain(..).partition(|s| s.due <= now);
        self.scheduled = pending;

        for settlement in due {
            if !self
                .send_settlement(settlement.contract_id, settlement.req_id)
                .await
            {
                return false;
            }
        }
        true
    }

    async fn send_settlement(&mut self, contract_id: u64, req_id: Option<u64>) -> bool {
        let settled = {
            let mut state = lock(&self.state);
            let Some(contract) = state.contracts.get_mut(&contract_id) else {
                return true;
            };
            let Some(profit) = contract.profit else {
                return true;
            };
            let stake = contract.stake;
            let sell_price = (stake + profit).max(Decimal::ZERO);
            let credit = !contract.credited;
            contract.credited = true;
            if credit {
                state.balance += sell_price;
            }
            (stake, profit, sell_price)
        };
        let (stake, profit, sell_price) = settled;

        self.send(
            json!({
                "msg_type": "proposal_open_contract",
                "proposal_open_contract": {
                    "contract_id": contract_id,
                    "is_sold": 1,
                    "profit": decimal_value(profit),
                    "buy_price": decimal_value(stake),
                    "sell_price": decimal_value(sell_price),
                    "status": if profit > Decimal::ZERO { "won" } else { "lost" },
                },
                "subscription": { "id": subscription_id(contract_id) },
            }),
            req_id,
        )
        .await
    }

    async fn error(&mut self, req_id: Option<u64>, msg_type: &str, code: &str, message: &str) -> bool {
        self.send(
            json!({
                "msg_type": msg_type,
                "error": { "code": code, "message": message },
            }),
            req_id,
        )
        .await
    }

    async fn send(&mut self, mut body: Value, req_id: Option<u64>) -> bool {
        if let (Value::Object(map), Some(req_id)) = (&mut body, req_id) {
            map.insert("req_id".to_string(), Value::from(req_id));
        }
        self.outbound.send(body.to_string()).await.is_ok()
    }
}

fn subscription_id(contract_id: u64) -> String {
    format!("paper-{contract_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};

    async fn next_json(stream: &mut FrameStream) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_authorize_and_buy_scripted_win() {
        let config = PaperConfig {
            settle_after: Duration::ZERO,
            ..PaperConfig::default()
        };
        let broker = PaperBroker::scripted(
            config,
            vec![PaperOutcome::Win {
                profit: Decimal::new(8, 0),
            }],
        );
        let (mut sink, mut stream) = broker.open_connection().unwrap();

        sink.send(r#"{"authorize":"tok","req_id":1}"#.to_string()).await.unwrap();
        let reply = next_json(&mut stream).await;
        assert_eq!(reply["msg_type"], "authorize");
        assert_eq!(reply["req_id"], 1);

        sink.send(
            r#"{"buy":1,"price":5,"parameters":{"amount":5,"basis":"stake","contract_type":"CALL","currency":"USD","duration":1,"duration_unit":"m","symbol":"R_100"},"req_id":2}"#
                .to_string(),
        )
        .await
        .unwrap();
        let reply = next_json(&mut stream).await;
        let contract_id = reply["buy"]["contract_id"].as_u64().unwrap();

        sink.send(format!(
            r#"{{"proposal_open_contract":1,"contract_id":{},"subscribe":1,"req_id":3}}"#,
            contract_id
        ))
        .await
        .unwrap();
        let update = next_json(&mut stream).await;
        assert_eq!(update["proposal_open_contract"]["is_sold"], 1);
        assert_eq!(update["proposal_open_contract"]["profit"].as_f64(), Some(8.0));

        let purchases = broker.purchases();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].stake, Decimal::new(5, 0));
        assert!(purchases[0].acknowledged);
        assert_eq!(broker.balance(), Decimal::new(10_008, 0));
    }

    #[tokio::test]
    async fn test_buy_requires_authorization() {
        let broker = PaperBroker::new(PaperConfig::default());
        let (mut sink, mut stream) = broker.open_connection().unwrap();
        sink.send(r#"{"buy":1,"parameters":{"amount":1},"req_id":9}"#.to_string())
            .await
            .unwrap();
        let reply = next_json(&mut stream).await;
        assert_eq!(reply["error"]["code"], "AuthorizationRequired");
        assert!(broker.purchases().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_token() {
        let broker = PaperBroker::new(PaperConfig::default());
        broker.reject_token("bad");
        let (mut sink, mut stream) = broker.open_connection().unwrap();
        sink.send(r#"{"authorize":"bad","req_id":1}"#.to_string()).await.unwrap();
        let reply = next_json(&mut stream).await;
        assert_eq!(reply["error"]["code"], "InvalidToken");
    }

    #[tokio::test]
    async fn test_refused_and_dropped_connections() {
        let broker = PaperBroker::new(PaperConfig::default());
        broker.refuse_connections(1);
        assert!(broker.open_connection().is_err());

        let (_sink, mut stream) = broker.open_connection().unwrap();
        assert_eq!(broker.connections(), 1);

        broker.drop_connections();
        let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
