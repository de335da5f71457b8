//! Broker wire protocol: JSON frames with request/response correlation.

use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;

use crate::types::{ContractSettlement, Direction, DurationUnit};

/// Order parameters for a single stake-based contract purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuyParameters {
    pub symbol: String,
    pub direction: Direction,
    pub amount: Decimal,
    pub currency: String,
    pub duration: u32,
    pub duration_unit: DurationUnit,
}

/// Outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Authorize { token: String },
    Buy(BuyParameters),
    SubscribeContract { contract_id: u64 },
    Forget { subscription_id: String },
    Ping,
}

impl Request {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Authorize { .. } => "authorize",
            Request::Buy(_) => "buy",
            Request::SubscribeContract { .. } => "proposal_open_contract",
            Request::Forget { .. } => "forget",
            Request::Ping => "ping",
        }
    }

    /// Encode as a text frame tagged with `req_id`.
    pub fn to_frame(&self, req_id: u64) -> String {
        let mut body = match self {
            Request::Authorize { token } => json!({ "authorize": token }),
            Request::Buy(params) => json!({
                "buy": 1,
                "price": decimal_value(params.amount),
                "parameters": {
                    "amount": decimal_value(params.amount),
                    "basis": "stake",
                    "contract_type": params.direction.contract_type(),
                    "currency": params.currency,
                    "duration": params.duration,
                    "duration_unit": params.duration_unit.code(),
                    "symbol": params.symbol,
                }
            }),
            Request::SubscribeContract { contract_id } => json!({
                "proposal_open_contract": 1,
                "contract_id": contract_id,
                "subscribe": 1,
            }),
            Request::Forget { subscription_id } => json!({ "forget": subscription_id }),
            Request::Ping => json!({ "ping": 1 }),
        };

        if let Value::Object(map) = &mut body {
            map.insert("req_id".to_string(), Value::from(req_id));
        }
        body.to_string()
    }
}

/// Encode a decimal as a JSON number without going through binary floats
/// where the text form is representable.
pub(crate) fn decimal_value(amount: Decimal) -> Value {
    serde_json::Number::from_str(&amount.normalize().to_string())
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(amount.to_string()))
}

/// Broker error body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthorizeReply {
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub balance: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub loginid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuyReply {
    pub contract_id: u64,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub buy_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub payout: Option<Decimal>,
    #[serde(default)]
    pub transaction_id: Option<u64>,
    #[serde(default)]
    pub longcode: Option<String>,
}

/// One update on an open contract's subscription stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContractUpdate {
    pub contract_id: u64,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub is_sold: bool,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub profit: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub payout: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub buy_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub sell_price: Option<Decimal>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ContractUpdate {
    /// The settlement, once the contract has been sold.
    pub fn settlement(&self) -> Option<ContractSettlement> {
        if !self.is_sold {
            return None;
        }
        Some(ContractSettlement {
            contract_id: self.contract_id,
            profit: self.profit.unwrap_or(Decimal::ZERO),
            payout: self.sell_price.unwrap_or(Decimal::ZERO),
            buy_price: self.buy_price,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Subscription {
    pub id: String,
}

/// Inbound frame envelope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Response {
    pub msg_type: String,
    #[serde(default)]
    pub req_id: Option<u64>,
    #[serde(default)]
    pub error: Option<ApiError>,
    #[serde(default)]
    pub authorize: Option<AuthorizeReply>,
    #[serde(default)]
    pub buy: Option<BuyReply>,
    #[serde(default)]
    pub proposal_open_contract: Option<ContractUpdate>,
    #[serde(default)]
    pub subscription: Option<Subscription>,
}

impl Response {
    pub fn parse(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.id.as_str())
    }
}

/// Accept a decimal encoded as a JSON number or string.
fn lenient_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => parse_decimal(&n.to_string()).map(Some).map_err(de::Error::custom),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => parse_decimal(s.trim()).map(Some).map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!("expected a decimal, got {}", other))),
    }
}

fn parse_decimal(text: &str) -> Result<Decimal, rust_decimal::Error> {
    Decimal::from_str(text).or_else(|_| Decimal::from_scientific(text))
}

/// Accept a boolean encoded as `true`/`false` or `1`/`0`.
fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(false),
        _ => false,
    })
}
