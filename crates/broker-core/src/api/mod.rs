//! Broker API: wire protocol, transports and the account session.

pub mod paper;
pub mod protocol;
pub mod session;
pub mod transport;

pub use paper::{PaperBroker, PaperConfig, PaperOutcome, PaperPurchase};
pub use protocol::{BuyParameters, ContractUpdate, Request, Response};
pub use session::{
    AccountSession, BackoffPolicy, ConnectionState, PendingReply, RequestFailure, SessionConfig,
    SessionEvent, SessionHandle, SessionStatus,
};
pub use transport::{Connector, FrameSink, FrameStream, WsConnector};
