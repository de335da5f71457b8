//! Account session: one streaming connection per account.
//!
//! A supervisory task owns the connection. It reconnects with capped
//! exponential backoff, re-authorizes, re-subscribes open contract watches
//! before reporting `Connected`, and routes every inbound frame either to the
//! caller awaiting that `req_id` or to the watcher of that contract.
//! Callers talk to it through a cloneable [`SessionHandle`].

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::api::protocol::{ContractUpdate, Request, Response};
use crate::api::transport::{Connector, FrameSink, FrameStream};
use crate::config::SessionSettings;
use crate::types::{Account, ContractSettlement};
use crate::{Error, Result};

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reauthenticating,
}

/// Snapshot of a session for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub account_id: String,
    /// Consecutive failed connection attempts since the last success.
    pub reconnect_attempts: u32,
    pub balance: Option<Decimal>,
    pub currency: Option<String>,
    /// Set when the broker rejected the token. Cleared by an account switch.
    pub auth_error: Option<String>,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl SessionStatus {
    fn new(account_id: &str) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            account_id: account_id.to_string(),
            reconnect_attempts: 0,
            balance: None,
            currency: None,
            auth_error: None,
            last_error: None,
            connected_at: None,
        }
    }
}

/// Events published to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    ContractUpdated(ContractUpdate),
    AuthenticationFailed(String),
}

/// Why a request did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    /// Written on a connection that dropped before the reply arrived.
    Disconnected,
    /// The broker answered with an error body.
    Rejected { code: String, message: String },
    /// The session's token was rejected.
    Unauthorized { message: String },
    /// The account was switched before the reply arrived.
    AccountSwitched,
    /// The session was shut down.
    SessionClosed,
}

impl From<RequestFailure> for Error {
    fn from(failure: RequestFailure) -> Self {
        match failure {
            RequestFailure::Disconnected => Error::Disconnected,
            RequestFailure::Rejected { code, message } => Error::OrderRejected { code, message },
            RequestFailure::Unauthorized { message } => Error::Auth { message },
            RequestFailure::AccountSwitched => Error::AccountSwitched,
            RequestFailure::SessionClosed => Error::SessionClosed,
        }
    }
}

type Reply = std::result::Result<Response, RequestFailure>;

/// Capped exponential backoff with optional full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Upper bound of the delay before retry number `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay before retry number `attempt`: uniform in `[0, ceiling]` with
    /// jitter, the ceiling itself without.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter {
            return ceiling;
        }
        let millis = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Runtime settings of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backoff: BackoffPolicy,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            backoff: BackoffPolicy {
                base: Duration::from_millis(settings.backoff_base_ms),
                cap: Duration::from_millis(settings.backoff_cap_ms),
                jitter: settings.backoff_jitter,
            },
            handshake_timeout: Duration::from_secs(settings.handshake_timeout_secs),
            ping_interval: Duration::from_secs(settings.ping_interval_secs),
            read_timeout: Duration::from_secs(settings.read_timeout_secs),
            command_buffer: 256,
        }
    }
}

enum Command {
    Send {
        req_id: u64,
        request: Request,
        reply: oneshot::Sender<Reply>,
    },
    WatchContract {
        contract_id: u64,
        watcher: oneshot::Sender<ContractSettlement>,
    },
    ForgetContract {
        contract_id: u64,
    },
}

/// A request that has been queued; resolves to the correlated response.
#[derive(Debug)]
pub struct PendingReply {
    req_id: u64,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    /// Correlation id echoed back by the broker.
    pub fn correlation_id(&self) -> u64 {
        self.req_id
    }

    pub async fn recv(self) -> Reply {
        self.rx.await.unwrap_or(Err(RequestFailure::SessionClosed))
    }
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    account: Arc<watch::Sender<Account>>,
    shutdown: Arc<watch::Sender<bool>>,
    next_req_id: Arc<AtomicU64>,
}

impl SessionHandle {
    /// Queue a request. Requests issued while disconnected are sent after the
    /// next successful handshake.
    pub async fn send(&self, request: Request) -> Result<PendingReply> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                req_id,
                request,
                reply,
            })
            .await
            .map_err(|_| self.closed_error())?;
        Ok(PendingReply { req_id, rx })
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, request: Request, timeout: Duration) -> Result<Response> {
        let kind = request.kind();
        let pending = self.send(request).await?;
        match tokio::time::timeout(timeout, pending.recv()).await {
            Ok(reply) => reply.map_err(Error::from),
            Err(_) => Err(Error::Timeout {
                operation: kind.to_string(),
            }),
        }
    }

    /// Register interest in a contract's settlement. The watch survives
    /// reconnects; it is dropped on account switch or shutdown.
    pub async fn watch_contract(&self, contract_id: u64) -> Result<oneshot::Receiver<ContractSettlement>> {
        let (watcher, rx) = oneshot::channel();
        self.commands
            .send(Command::WatchContract {
                contract_id,
                watcher,
            })
            .await
            .map_err(|_| self.closed_error())?;
        Ok(rx)
    }

    /// Drop the watch on a contract whose result is no longer awaited. It is
    /// not re-subscribed after later reconnects.
    pub async fn forget_contract(&self, contract_id: u64) -> Result<()> {
        self.commands
            .send(Command::ForgetContract { contract_id })
            .await
            .map_err(|_| self.closed_error())
    }

    /// Wait until the session is connected and authorized.
    pub async fn connected(&self) -> Result<()> {
        let mut status = self.status.clone();
        loop {
            {
                let current = status.borrow_and_update();
                if current.state == ConnectionState::Connected {
                    return Ok(());
                }
                if let Some(message) = &current.auth_error {
                    return Err(Error::Auth {
                        message: message.clone(),
                    });
                }
            }
            if status.changed().await.is_err() {
                return Err(self.closed_error());
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watch channel over the session status.
    pub fn status_receiver(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn account_id(&self) -> String {
        self.account.borrow().id.clone()
    }

    /// Tear down the current connection and rebuild it for `account`.
    pub fn switch_account(&self, account: Account) {
        info!(account = %account.id, "Switching session account");
        self.account.send_replace(account);
    }

    /// Stop the session. Pending requests fail with `SessionClosed`.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    fn closed_error(&self) -> Error {
        match &self.status.borrow().auth_error {
            Some(message) => Error::Auth {
                message: message.clone(),
            },
            None => Error::SessionClosed,
        }
    }
}

struct ContractWatch {
    watcher: Option<oneshot::Sender<ContractSettlement>>,
    subscription_id: Option<String>,
}

enum SessionExit {
    Shutdown,
    AccountSwitched,
    Disconnected(String),
}

enum HandshakeError {
    Unauthorized(String),
    Transient(Error),
}

/// Supervisory task owning one broker connection.
pub struct AccountSession {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    account: watch::Receiver<Account>,
    commands: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    next_req_id: Arc<AtomicU64>,
    pending: HashMap<u64, oneshot::Sender<Reply>>,
    contracts: HashMap<u64, ContractWatch>,
    has_connected: bool,
}

impl AccountSession {
    /// Start the session task and return its handle without waiting.
    pub fn spawn(account: Account, connector: Arc<dyn Connector>, config: SessionConfig) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (status_tx, status_rx) = watch::channel(SessionStatus::new(&account.id));
        let (events_tx, _) = broadcast::channel(256);
        let (account_tx, account_rx) = watch::channel(account);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let next_req_id = Arc::new(AtomicU64::new(1));

        let session = AccountSession {
            connector,
            config,
            account: account_rx,
            commands: command_rx,
            shutdown: shutdown_rx,
            status: status_tx,
            events: events_tx.clone(),
            next_req_id: next_req_id.clone(),
            pending: HashMap::new(),
            contracts: HashMap::new(),
            has_connected: false,
        };
        tokio::spawn(session.run());

        SessionHandle {
            commands: command_tx,
            status: status_rx,
            events: events_tx,
            account: Arc::new(account_tx),
            shutdown: Arc::new(shutdown_tx),
            next_req_id,
        }
    }

    /// Start the session and wait for the first successful authorization.
    ///
    /// Transient failures are retried indefinitely; a rejected token fails
    /// with [`Error::Auth`].
    pub async fn connect(
        account: Account,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Result<SessionHandle> {
        let handle = Self::spawn(account, connector, config);
        if let Err(e) = handle.connected().await {
            handle.close();
            return Err(e);
        }
        Ok(handle)
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;
        info!(account = %self.account_id(), "Session supervisor started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                result = self.connector.connect() => result,
                _ = self.shutdown.changed() => break,
            };

            let exit = match connected {
                Ok((mut sink, mut stream)) => match self.handshake(&mut sink, &mut stream).await {
                    Ok(()) => {
                        attempt = 0;
                        self.pump(sink, stream).await
                    }
                    Err(HandshakeError::Unauthorized(message)) => {
                        if self.hold_after_auth_failure(message).await {
                            attempt = 0;
                            continue;
                        }
                        break;
                    }
                    Err(HandshakeError::Transient(e)) => SessionExit::Disconnected(e.to_string()),
                },
                Err(e) => SessionExit::Disconnected(e.to_string()),
            };

            match exit {
                SessionExit::Shutdown => break,
                SessionExit::AccountSwitched => {
                    self.on_account_switched();
                    attempt = 0;
                }
                SessionExit::Disconnected(reason) => {
                    self.fail_pending(RequestFailure::Disconnected);
                    let delay = self.config.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        account = %self.account_id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Broker connection lost, reconnecting"
                    );
                    self.status.send_modify(|s| {
                        s.state = ConnectionState::Connecting;
                        s.reconnect_attempts = attempt;
                        s.last_error = Some(reason);
                    });

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => break,
                        changed = self.account.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            self.on_account_switched();
                            attempt = 0;
                        }
                    }
                }
            }
        }

        self.fail_pending(RequestFailure::SessionClosed);
        self.contracts.clear();
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Send { reply, .. } = command {
                let _ = reply.send(Err(RequestFailure::SessionClosed));
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!(account = %self.account_id(), "Session closed");
    }

    /// Authorize the fresh connection and restore contract subscriptions.
    async fn handshake(
        &mut self,
        sink: &mut FrameSink,
        stream: &mut FrameStream,
    ) -> std::result::Result<(), HandshakeError> {
        if self.has_connected {
            self.set_state(ConnectionState::Reauthenticating);
        }

        let token = self.account.borrow_and_update().token().to_string();
        let req_id = self.next_req_id();
        sink.send(Request::Authorize { token }.to_frame(req_id))
            .await
            .map_err(HandshakeError::Transient)?;

        let deadline = Instant::now() + self.config.handshake_timeout;
        let reply = loop {
            let frame = match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => {
                    return Err(HandshakeError::Transient(Error::Timeout {
                        operation: "authorize".to_string(),
                    }))
                }
                Ok(None) => {
                    return Err(HandshakeError::Transient(Error::Connection {
                        message: "stream ended during authorization".to_string(),
                    }))
                }
                Ok(Some(Err(e))) => return Err(HandshakeError::Transient(e)),
                Ok(Some(Ok(frame))) => frame,
            };

            match Response::parse(&frame) {
                Ok(response) if response.req_id == Some(req_id) => break response,
                Ok(response) => {
                    debug!(msg_type = %response.msg_type, "Ignoring frame before authorization")
                }
                Err(e) => warn!(error = %e, "Unparseable frame during authorization"),
            }
        };

        if let Some(err) = reply.error {
            return Err(HandshakeError::Unauthorized(format!("{}: {}", err.code, err.message)));
        }
        let authorize = reply.authorize.ok_or_else(|| {
            HandshakeError::Transient(Error::Protocol {
                message: "authorize reply without body".to_string(),
            })
        })?;

        let contract_ids: Vec<u64> = self.contracts.keys().copied().collect();
        for contract_id in &contract_ids {
            let req_id = self.next_req_id();
            sink.send(Request::SubscribeContract { contract_id: *contract_id }.to_frame(req_id))
                .await
                .map_err(HandshakeError::Transient)?;
        }

        let resumed = self.has_connected;
        self.has_connected = true;
        self.status.send_modify(|s| {
            s.state = ConnectionState::Connected;
            s.reconnect_attempts = 0;
            s.balance = authorize.balance;
            s.currency = authorize.currency.clone();
            s.auth_error = None;
            s.connected_at = Some(Utc::now());
        });
        let _ = self
            .events
            .send(SessionEvent::StateChanged(ConnectionState::Connected));

        info!(
            account = %self.account_id(),
            login_id = authorize.loginid.as_deref().unwrap_or("-"),
            balance = ?authorize.balance,
            resubscribed = contract_ids.len(),
            resumed,
            "Broker session authorized"
        );
        Ok(())
    }

    /// Drive an authorized connection until it drops or the session ends.
    async fn pump(&mut self, mut sink: FrameSink, mut stream: FrameStream) -> SessionExit {
        let read_timeout = self.config.read_timeout;
        let mut ping_tick = tokio::time::interval(self.config.ping_interval.max(Duration::from_millis(1)));
        ping_tick.tick().await;

        // Only inbound frames push the deadline out; pings do not.
        let read_deadline = tokio::time::sleep(read_timeout);
        tokio::pin!(read_deadline);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return SessionExit::Shutdown,
                changed = self.account.changed() => {
                    return match changed {
                        Ok(()) => SessionExit::AccountSwitched,
                        Err(_) => SessionExit::Shutdown,
                    };
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return SessionExit::Shutdown;
                    };
                    if let Err(e) = self.dispatch(command, &mut sink).await {
                        return SessionExit::Disconnected(e.to_string());
                    }
                }
                _ = ping_tick.tick() => {
                    let req_id = self.next_req_id();
                    if let Err(e) = sink.send(Request::Ping.to_frame(req_id)).await {
                        return SessionExit::Disconnected(e.to_string());
                    }
                }
                _ = &mut read_deadline => {
                    return SessionExit::Disconnected(format!(
                        "no frames for {}s",
                        read_timeout.as_secs()
                    ));
                }
                frame = stream.next() => {
                    read_deadline.as_mut().reset(Instant::now() + read_timeout);
                    match frame {
                        None => return SessionExit::Disconnected("stream ended".to_string()),
                        Some(Err(e)) => return SessionExit::Disconnected(e.to_string()),
                        Some(Ok(text)) => self.route(&text, &mut sink).await,
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, command: Command, sink: &mut FrameSink) -> Result<()> {
        match command {
            Command::Send {
                req_id,
                request,
                reply,
            } => {
                debug!(req_id, kind = request.kind(), "Sending request");
                self.pending.insert(req_id, reply);
                sink.send(request.to_frame(req_id)).await
            }
            Command::WatchContract {
                contract_id,
                watcher,
            } => {
                self.contracts.insert(
                    contract_id,
                    ContractWatch {
                        watcher: Some(watcher),
                        subscription_id: None,
                    },
                );
                let req_id = self.next_req_id();
                debug!(req_id, contract_id, "Subscribing to contract updates");
                sink.send(Request::SubscribeContract { contract_id }.to_frame(req_id))
                    .await
            }
            Command::ForgetContract { contract_id } => {
                let Some(watch) = self.contracts.remove(&contract_id) else {
                    return Ok(());
                };
                debug!(contract_id, "Dropping contract watch");
                match watch.subscription_id {
                    Some(subscription_id) => {
                        let req_id = self.next_req_id();
                        sink.send(Request::Forget { subscription_id }.to_frame(req_id))
                            .await
                    }
                    None => Ok(()),
                }
            }
        }
    }

    async fn route(&mut self, frame: &str, sink: &mut FrameSink) {
        let response = match Response::parse(frame) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Unparseable frame from broker");
                return;
            }
        };

        if let Some(update) = &response.proposal_open_contract {
            self.on_contract_update(update, response.subscription_id(), sink)
                .await;
        }

        let Some(req_id) = response.req_id else {
            return;
        };
        if let Some(reply) = self.pending.remove(&req_id) {
            let result = match &response.error {
                Some(err) => Err(RequestFailure::Rejected {
                    code: err.code.clone(),
                    message: err.message.clone(),
                }),
                None => Ok(response),
            };
            let _ = reply.send(result);
        }
    }

    async fn on_contract_update(
        &mut self,
        update: &ContractUpdate,
        subscription_id: Option<&str>,
        sink: &mut FrameSink,
    ) {
        let _ = self.events.send(SessionEvent::ContractUpdated(update.clone()));

        let Some(watch) = self.contracts.get_mut(&update.contract_id) else {
            return;
        };
        if let Some(id) = subscription_id {
            watch.subscription_id = Some(id.to_string());
        }

        let Some(settlement) = update.settlement() else {
            return;
        };
        let Some(watch) = self.contracts.remove(&update.contract_id) else {
            return;
        };

        info!(
            contract_id = update.contract_id,
            profit = %settlement.profit,
            status = update.status.as_deref().unwrap_or("-"),
            "Contract settled"
        );
        if let Some(watcher) = watch.watcher {
            let _ = watcher.send(settlement);
        }
        if let Some(subscription_id) = watch.subscription_id {
            let req_id = self.next_req_id();
            if let Err(e) = sink.send(Request::Forget { subscription_id }.to_frame(req_id)).await {
                debug!(error = %e, "Failed to forget contract subscription");
            }
        }
    }

    /// Park the session after a rejected token. Returns true when an account
    /// switch asks for a fresh attempt, false on shutdown.
    async fn hold_after_auth_failure(&mut self, message: String) -> bool {
        error!(
            account = %self.account_id(),
            error = %message,
            "Broker rejected the account token; trading halted for this account"
        );
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.auth_error = Some(message.clone());
            s.last_error = Some(message.clone());
        });
        let _ = self
            .events
            .send(SessionEvent::AuthenticationFailed(message.clone()));
        self.fail_pending(RequestFailure::Unauthorized {
            message: message.clone(),
        });
        self.contracts.clear();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return false,
                changed = self.account.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    self.on_account_switched();
                    return true;
                }
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(Err(RequestFailure::Unauthorized {
                            message: message.clone(),
                        }));
                    }
                    Some(Command::WatchContract { contract_id, .. }) => {
                        debug!(contract_id, "Dropping contract watch on unauthorized session");
                    }
                    Some(Command::ForgetContract { .. }) => {}
                },
            }
        }
    }

    fn on_account_switched(&mut self) {
        self.fail_pending(RequestFailure::AccountSwitched);
        if !self.contracts.is_empty() {
            warn!(
                dropped = self.contracts.len(),
                "Account switch abandons open contract watches"
            );
        }
        self.contracts.clear();
        self.has_connected = false;
        let account_id = self.account_id();
        self.status.send_modify(|s| {
            s.account_id = account_id;
            s.auth_error = None;
            s.balance = None;
            s.currency = None;
            s.reconnect_attempts = 0;
        });
    }

    fn fail_pending(&mut self, failure: RequestFailure) {
        if self.pending.is_empty() {
            return;
        }
        warn!(count = self.pending.len(), failure = ?failure, "Failing in-flight requests");
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(failure.clone()));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.status.send_if_modified(|s| {
            if s.state == state {
                return false;
            }
            s.state = state;
            true
        });
        if changed {
            let _ = self.events.send(SessionEvent::StateChanged(state));
        }
    }

    fn account_id(&self) -> String {
        self.account.borrow().id.clone()
    }

    fn next_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed)
    }
}
