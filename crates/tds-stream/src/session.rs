//! Streaming session: lifecycle, gating, and the outbound write path.
//!
//! ```text
//! Connecting ──attach/open──▶ AwaitingLogin ──LOGIN code 0──▶ Ready ──LOGOUT ack──▶ Closed
//!      │                           │                            │
//!      └──────── transport failure, login rejection, stop ──────┴──────────────────▶ Closed
//! ```
//!
//! Every command except LOGIN waits until the session is `Ready` before it is
//! written. `Closed` is terminal: pending requests are failed with the reason
//! the session closed and later commands are refused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tds_core::config::StreamConfig;
use tds_core::error::{Result, TdsError};
use tds_core::ws::{self, FrameSink, FrameSource};
use tds_core::{Command, Principal, QosLevel, Service};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::correlation::{fail_all, CorrelationTable, ResponseCallback};
use crate::dispatcher::{self, Expiry};
use crate::handshake;
use crate::proto::{encode_request, Acknowledgement, OutboundCommand, PushRecord, Response};
use crate::registry::SubscriptionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingLogin,
    Ready,
    Closed,
}

/// Why a session reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// LOGOUT acknowledged by the server.
    Logout,
    /// Stopped before login completed.
    Local,
    /// Fatal error; replayed to every waiter.
    Failed(TdsError),
}

impl CloseReason {
    fn to_error(&self) -> TdsError {
        match self {
            CloseReason::Logout | CloseReason::Local => TdsError::SessionClosed,
            CloseReason::Failed(e) => e.clone(),
        }
    }
}

pub(crate) struct Shared {
    principal: Arc<Principal>,
    config: StreamConfig,
    state: watch::Sender<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    login_sent: AtomicBool,
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    pub(crate) table: Mutex<CorrelationTable>,
    pub(crate) registry: SubscriptionRegistry,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `to` unless already closed.
    fn transition(&self, to: SessionState) {
        let mut from = to;
        let changed = self.state.send_if_modified(|s| {
            if *s == SessionState::Closed || *s == to {
                return false;
            }
            from = *s;
            *s = to;
            true
        });
        if changed {
            info!("[session] {from:?} → {to:?}");
        }
    }

    /// Enter `Closed` once and fail everything still pending.
    pub(crate) fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        let from = self.state.send_replace(SessionState::Closed);
        match &reason {
            CloseReason::Failed(e) => error!("[session] {from:?} → Closed: {e}"),
            other => info!("[session] {from:?} → Closed ({other:?})"),
        }

        let err = reason.to_error();
        let pending = self.table.lock().drain();
        if !pending.is_empty() {
            warn!("[session] failing {} pending request(s)", pending.len());
        }
        fail_all(pending, |_| err.clone());
    }

    fn closed_error(&self) -> TdsError {
        self.close_reason
            .lock()
            .as_ref()
            .map_or(TdsError::SessionClosed, CloseReason::to_error)
    }

    async fn wait_ready(&self, command: &Command) -> Result<()> {
        let mut rx = self.state.subscribe();
        if *rx.borrow() != SessionState::Ready {
            debug!("[session] {command} waiting for login");
        }
        let state = match rx
            .wait_for(|s| matches!(s, SessionState::Ready | SessionState::Closed))
            .await
        {
            Ok(s) => *s,
            Err(_) => SessionState::Closed,
        };
        if state == SessionState::Ready {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    /// Assign a request id, register `on_response` and write the request.
    ///
    /// Returns once the frame is handed to the transport. A write failure is
    /// fatal to the session.
    async fn send(&self, command: OutboundCommand, on_response: ResponseCallback) -> Result<u64> {
        if !command.is_login() {
            self.wait_ready(&command.command).await?;
        }

        let mut guard = self.sink.lock().await;
        if self.state() == SessionState::Closed {
            return Err(self.closed_error());
        }
        let Some(sink) = guard.as_mut() else {
            return Err(TdsError::InvalidState("transport not attached".into()));
        };

        let account = self.principal.session_account()?;
        let is_login = command.is_login();
        let label = format!("{}/{}", command.service, command.command);
        let id = self.table.lock().register(on_response);
        let request = command.into_request(id, &account.account_id, &self.principal.streamer_info.app_id);
        let text = match encode_request(&request) {
            Ok(t) => t,
            Err(e) => {
                self.table.lock().take(id);
                return Err(e);
            }
        };

        if is_login {
            debug!("[session] → #{id} {label}");
        } else {
            debug!("[session] → #{id} {label}: {text}");
        }

        let written = sink.send_text(text).await;
        if let Err(e) = written {
            self.table.lock().take(id);
            drop(guard);
            self.close(CloseReason::Failed(e.clone()));
            return Err(e);
        }
        Ok(id)
    }

    /// Send and wait for the matching response.
    async fn request(&self, command: OutboundCommand) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        self.send(
            command,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .await?;
        rx.await.unwrap_or_else(|_| Err(self.closed_error()))
    }
}

/// Fail with `Rejected` unless the response acknowledges `expected` with
/// code 0.
fn expect_ack(resp: &Response, expected: &Command) -> Result<()> {
    if &resp.command != expected {
        return Err(TdsError::Decode(format!(
            "request #{} answered as {} instead of {expected}",
            resp.request_id, resp.command
        )));
    }
    if resp.content.is_ok() {
        Ok(())
    } else {
        Err(TdsError::Rejected {
            command: expected.to_string(),
            code: resp.content.code,
            msg: resp.content.msg.clone(),
        })
    }
}

/// Handle to one streaming session. Clones share the same session.
#[derive(Clone)]
pub struct StreamSession {
    shared: Arc<Shared>,
}

impl StreamSession {
    /// Create a session in `Connecting`. Nothing is sent until [`start`](Self::start).
    pub fn new(principal: Arc<Principal>, config: StreamConfig) -> Result<Self> {
        principal.validate()?;
        let (state, _) = watch::channel(SessionState::Connecting);
        Ok(Self {
            shared: Arc::new(Shared {
                principal,
                config,
                state,
                close_reason: Mutex::new(None),
                login_sent: AtomicBool::new(false),
                sink: tokio::sync::Mutex::new(None),
                dispatcher: Mutex::new(None),
                table: Mutex::new(CorrelationTable::new()),
                registry: SubscriptionRegistry::new(),
            }),
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Resolve once the session is `Closed`, with the reason it closed.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
        self.shared.close_reason.lock().clone().unwrap_or(CloseReason::Local)
    }

    /// Subscribers registered on `(service, symbol)`, sorted.
    pub fn subscribers(&self, service: &Service, symbol: &str) -> Vec<String> {
        self.shared.registry.subscribers(service, symbol)
    }

    /// Connect to the principal's socket host.
    pub async fn open(&self) -> Result<()> {
        if self.state() != SessionState::Connecting {
            return Err(TdsError::InvalidState(format!("open in {:?}", self.state())));
        }
        let url = self
            .shared
            .config
            .socket_url(&self.shared.principal.streamer_info.streamer_socket_url);
        match ws::connect(&url, &HashMap::new()).await {
            Ok((sink, source)) => self.attach(sink, source),
            Err(e) => {
                self.shared.close(CloseReason::Failed(e.clone()));
                Err(e)
            }
        }
    }

    /// Bind an already-open transport and spawn the dispatcher.
    ///
    /// Must be called within a Tokio runtime.
    pub fn attach(&self, sink: impl FrameSink, source: impl FrameSource) -> Result<()> {
        let mut slot = self
            .shared
            .sink
            .try_lock()
            .map_err(|_| TdsError::InvalidState("transport busy".into()))?;
        if self.state() != SessionState::Connecting || slot.is_some() {
            return Err(TdsError::InvalidState(format!("attach in {:?}", self.state())));
        }
        *slot = Some(Box::new(sink));
        drop(slot);

        let expiry = self.shared.config.request_timeout().map(|timeout| Expiry {
            timeout,
            sweep_interval: self.shared.config.sweep_interval(),
        });
        let handle = tokio::spawn(dispatcher::run(
            Arc::downgrade(&self.shared),
            self.shared.state.subscribe(),
            Box::new(source),
            expiry,
        ));
        *self.shared.dispatcher.lock() = Some(handle);
        self.shared.transition(SessionState::AwaitingLogin);
        Ok(())
    }

    /// Connect if needed, send LOGIN and wait for its acknowledgement.
    ///
    /// Code 0 moves the session to `Ready` and releases every gated command.
    /// Any other outcome closes the session and the same error is returned
    /// here and to every waiter.
    pub async fn start(&self) -> Result<()> {
        if self.state() == SessionState::Connecting {
            self.open().await?;
        }
        match self.state() {
            SessionState::AwaitingLogin => {}
            SessionState::Closed => return Err(self.shared.closed_error()),
            other => return Err(TdsError::InvalidState(format!("start in {other:?}"))),
        }
        if self.shared.login_sent.swap(true, Ordering::SeqCst) {
            return Err(TdsError::InvalidState("login already sent".into()));
        }

        let command = handshake::login(&self.shared.principal, &self.shared.config.protocol_version)?;
        let (tx, rx) = oneshot::channel();
        let weak = Arc::downgrade(&self.shared);
        self.shared
            .send(
                command,
                Box::new(move |result| {
                    let outcome = login_outcome(result);
                    if let Some(shared) = weak.upgrade() {
                        match &outcome {
                            Ok(()) => shared.transition(SessionState::Ready),
                            Err(e) => shared.close(CloseReason::Failed(e.clone())),
                        }
                    }
                    let _ = tx.send(outcome);
                }),
            )
            .await?;
        rx.await.unwrap_or_else(|_| Err(self.shared.closed_error()))
    }

    /// Set the server's update interval and wait for the acknowledgement.
    pub async fn set_qos(&self, level: QosLevel) -> Result<()> {
        let resp = self.shared.request(handshake::qos(level)).await?;
        expect_ack(&resp, &Command::Qos)?;
        info!("[session] qos set to {level:?} ({:?})", level.interval());
        Ok(())
    }

    /// Register `subscriber` for `symbols` on `service`.
    ///
    /// Only symbols not already on the wire for `service` are sent in a SUBS.
    /// Returns once that SUBS is written; its acknowledgement is logged. A
    /// conflict with an existing `(service, symbol, subscriber)` entry fails
    /// the whole call and changes nothing.
    pub async fn subscribe<F>(&self, service: Service, subscriber: &str, symbols: &[String], callback: F) -> Result<()>
    where
        F: Fn(&PushRecord) + Send + Sync + 'static,
    {
        if self.state() == SessionState::Closed {
            return Err(self.shared.closed_error());
        }
        let registration = self
            .shared
            .registry
            .register(&service, subscriber, symbols, Arc::new(callback))?;
        if registration.new_on_wire.is_empty() {
            debug!(
                "[session] {subscriber} joined {service} {:?}; nothing new on the wire",
                registration.symbols
            );
            return Ok(());
        }

        let label = service.clone();
        let keys = registration.new_on_wire.join(",");
        let on_ack: ResponseCallback = Box::new(move |result| match result {
            Ok(resp) => match expect_ack(&resp, &Command::Subs) {
                Ok(()) => debug!("[session] {label} SUBS {keys} acknowledged"),
                Err(e) => warn!("[session] {label} SUBS {keys}: {e}"),
            },
            Err(e) => debug!("[session] {label} SUBS {keys}: no acknowledgement ({e})"),
        });

        let command = handshake::subs(service.clone(), &registration.new_on_wire);
        if let Err(e) = self.shared.send(command, on_ack).await {
            self.shared.registry.rollback(&service, subscriber, &registration);
            return Err(e);
        }
        Ok(())
    }

    /// Send LOGOUT, wait for its acknowledgement and release the transport.
    ///
    /// Before login completes there is nothing to log out of; the session is
    /// closed locally instead. Must not be called from a data callback.
    pub async fn stop(&self) -> Result<()> {
        match self.state() {
            SessionState::Closed => return Err(self.shared.closed_error()),
            SessionState::Connecting | SessionState::AwaitingLogin => {
                self.shared.close(CloseReason::Local);
                self.shutdown_transport().await;
                return Ok(());
            }
            SessionState::Ready => {}
        }

        let (tx, rx) = oneshot::channel();
        let weak = Arc::downgrade(&self.shared);
        self.shared
            .send(
                handshake::logout(),
                Box::new(move |result| {
                    let outcome = result.and_then(|resp| expect_ack(&resp, &Command::Logout));
                    if outcome.is_ok()
                        && let Some(shared) = weak.upgrade()
                    {
                        shared.close(CloseReason::Logout);
                    }
                    let _ = tx.send(outcome);
                }),
            )
            .await?;
        rx.await.unwrap_or_else(|_| Err(self.shared.closed_error()))?;
        self.shutdown_transport().await;
        Ok(())
    }

    async fn shutdown_transport(&self) {
        if let Some(mut sink) = self.shared.sink.lock().await.take()
            && let Err(e) = sink.close().await
        {
            debug!("[session] close transport: {e}");
        }
        let handle = self.shared.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Send an arbitrary command. `on_response` runs on the dispatcher with the
    /// matching response, or with an error if the request is abandoned.
    pub async fn send_command(&self, command: OutboundCommand, on_response: ResponseCallback) -> Result<u64> {
        self.shared.send(command, on_response).await
    }
}

fn login_outcome(result: Result<Response>) -> Result<()> {
    let resp = result?;
    match resp.acknowledgement() {
        Acknowledgement::Login(ack) if ack.is_ok() => Ok(()),
        Acknowledgement::Login(ack) => Err(TdsError::LoginRejected {
            code: ack.code,
            msg: ack.msg,
        }),
        other => Err(TdsError::Decode(format!("LOGIN answered with {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;
    use tds_core::ws::{memory, MemoryPeer};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::handshake::tests::sample_principal;

    fn session_with(config: StreamConfig) -> StreamSession {
        StreamSession::new(Arc::new(sample_principal()), config).unwrap()
    }

    async fn next_request(peer: &mut MemoryPeer) -> Value {
        let text = timeout(Duration::from_secs(1), peer.recv())
            .await
            .expect("no frame written")
            .expect("sink closed");
        let mut v: Value = serde_json::from_str(&text).unwrap();
        v["requests"][0].take()
    }

    fn ack(service: &str, command: &str, id: u64, code: i64) -> String {
        format!(
            r#"{{"response":[{{"service":"{service}","command":"{command}","timestamp":1590113568000,
                "requestid":"{id}","content":{{"code":{code},"msg":"m"}}}}]}}"#
        )
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn ready_session(config: StreamConfig) -> (StreamSession, MemoryPeer) {
        let (sink, source, mut peer) = memory::pair();
        let session = session_with(config);
        session.attach(sink, source).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingLogin);

        let s = session.clone();
        let start = tokio::spawn(async move { s.start().await });
        let login = next_request(&mut peer).await;
        assert_eq!(login["command"], "LOGIN");
        assert_eq!(login["requestid"], 0);
        peer.push(ack("ADMIN", "LOGIN", 0, 0)).unwrap();
        start.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        (session, peer)
    }

    #[tokio::test]
    async fn login_carries_account_and_source() {
        let (sink, source, mut peer) = memory::pair();
        let session = session_with(StreamConfig::default());
        session.attach(sink, source).unwrap();
        let s = session.clone();
        tokio::spawn(async move { s.start().await });

        let login = next_request(&mut peer).await;
        assert_eq!(login["service"], "ADMIN");
        assert_eq!(login["account"], "123");
        assert_eq!(login["source"], "APP1");
        assert_eq!(login["parameters"]["token"], "T");
        assert_eq!(login["parameters"]["version"], "1.0");
    }

    #[tokio::test]
    async fn request_ids_increase_across_commands() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;

        session.subscribe(Service::Quote, "a", &symbols(&["SPY"]), |_| {}).await.unwrap();
        session.subscribe(Service::Quote, "a", &symbols(&["QQQ"]), |_| {}).await.unwrap();
        assert_eq!(next_request(&mut peer).await["requestid"], 1);
        assert_eq!(next_request(&mut peer).await["requestid"], 2);

        let s = session.clone();
        let qos = tokio::spawn(async move { s.set_qos(QosLevel::Fast).await });
        let req = next_request(&mut peer).await;
        assert_eq!(req["requestid"], 3);
        assert_eq!(req["parameters"]["qoslevel"], "2");
        peer.push(ack("ADMIN", "QOS", 3, 0)).unwrap();
        qos.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn commands_wait_for_login() {
        let (sink, source, mut peer) = memory::pair();
        let session = session_with(StreamConfig::default());
        session.attach(sink, source).unwrap();

        let s = session.clone();
        let sub = tokio::spawn(async move { s.subscribe(Service::Quote, "a", &symbols(&["SPY"]), |_| {}).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer.try_recv().is_none());

        let s = session.clone();
        let start = tokio::spawn(async move { s.start().await });
        assert_eq!(next_request(&mut peer).await["command"], "LOGIN");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer.try_recv().is_none());

        peer.push(ack("ADMIN", "LOGIN", 0, 0)).unwrap();
        start.await.unwrap().unwrap();
        sub.await.unwrap().unwrap();
        let subs = next_request(&mut peer).await;
        assert_eq!(subs["command"], "SUBS");
        assert_eq!(subs["requestid"], 1);
    }

    #[tokio::test]
    async fn shared_symbol_is_subscribed_once() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;

        session.subscribe(Service::Quote, "a", &symbols(&["SPY"]), |_| {}).await.unwrap();
        let subs = next_request(&mut peer).await;
        assert_eq!(subs["parameters"]["keys"], "SPY");
        assert_eq!(subs["parameters"]["fields"], handshake::SUBS_FIELDS);

        session.subscribe(Service::Quote, "b", &symbols(&["SPY"]), |_| {}).await.unwrap();
        assert!(peer.try_recv().is_none());

        session
            .subscribe(Service::Quote, "c", &symbols(&["SPY", "QQQ", "QQQ"]), |_| {})
            .await
            .unwrap();
        assert_eq!(next_request(&mut peer).await["parameters"]["keys"], "QQQ");
        assert_eq!(session.subscribers(&Service::Quote, "SPY"), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn duplicate_subscriber_is_rejected() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = tx.clone();
        session
            .subscribe(Service::Quote, "a", &symbols(&["SPY"]), move |_| {
                let _ = first.send("first");
            })
            .await
            .unwrap();
        next_request(&mut peer).await;

        let err = session
            .subscribe(Service::Quote, "a", &symbols(&["SPY"]), move |_| {
                let _ = tx.send("second");
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TdsError::SubscriberConflict { .. }));
        assert!(peer.try_recv().is_none());

        peer.push(
            r#"{"data":[{"service":"QUOTE","command":"SUBS","timestamp":1,"content":[{"key":"SPY","1":1.0}]}]}"#,
        )
        .unwrap();
        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some("first"));
    }

    #[tokio::test]
    async fn records_reach_only_their_subscribers() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        session
            .subscribe(Service::Quote, "a", &symbols(&["SPY"]), move |r: &PushRecord| {
                let _ = tx.send((r.key.clone(), r.field_f64(1)));
            })
            .await
            .unwrap();
        next_request(&mut peer).await;

        peer.push(
            r#"{"data":[{"service":"QUOTE","command":"SUBS","timestamp":1590113568000,"content":[
                {"key":"SPY","1":301.5},{"key":"QQQ","1":230.1}]}]}"#,
        )
        .unwrap();

        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(("SPY".to_string(), Some(301.5))));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn logout_is_final() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;

        let s = session.clone();
        let stop = tokio::spawn(async move { s.stop().await });
        let logout = next_request(&mut peer).await;
        assert_eq!(logout["command"], "LOGOUT");
        peer.push(ack("ADMIN", "LOGOUT", 1, 0)).unwrap();
        stop.await.unwrap().unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        let err = session
            .subscribe(Service::Quote, "a", &symbols(&["SPY"]), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, TdsError::SessionClosed);
    }

    #[tokio::test]
    async fn login_rejection_releases_waiters() {
        let (sink, source, mut peer) = memory::pair();
        let session = session_with(StreamConfig::default());
        session.attach(sink, source).unwrap();

        let s = session.clone();
        let sub = tokio::spawn(async move { s.subscribe(Service::Quote, "a", &symbols(&["SPY"]), |_| {}).await });
        let s = session.clone();
        let start = tokio::spawn(async move { s.start().await });
        next_request(&mut peer).await;
        peer.push(ack("ADMIN", "LOGIN", 0, 3)).unwrap();

        let expected = TdsError::LoginRejected { code: 3, msg: "m".into() };
        assert_eq!(start.await.unwrap().unwrap_err(), expected);
        assert_eq!(sub.await.unwrap().unwrap_err(), expected);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.subscribers(&Service::Quote, "SPY").is_empty());
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn rejected_qos_is_reported() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;
        let s = session.clone();
        let qos = tokio::spawn(async move { s.set_qos(QosLevel::Delayed).await });
        next_request(&mut peer).await;
        peer.push(ack("ADMIN", "QOS", 1, 11)).unwrap();

        let err = qos.await.unwrap().unwrap_err();
        assert!(matches!(err, TdsError::Rejected { code: 11, .. }));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn unmatched_response_is_ignored() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;
        peer.push(ack("ADMIN", "QOS", 42, 0)).unwrap();
        peer.push("{not json").unwrap();

        let s = session.clone();
        let qos = tokio::spawn(async move { s.set_qos(QosLevel::Express).await });
        assert_eq!(next_request(&mut peer).await["requestid"], 1);
        peer.push(ack("ADMIN", "QOS", 1, 0)).unwrap();
        qos.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_failure_fails_pending_requests() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;
        let s = session.clone();
        let qos = tokio::spawn(async move { s.set_qos(QosLevel::Fast).await });
        next_request(&mut peer).await;

        peer.fail(TdsError::Transport("reset".into())).unwrap();
        assert_eq!(qos.await.unwrap().unwrap_err(), TdsError::Transport("reset".into()));
        assert_eq!(session.state(), SessionState::Closed);

        let err = session.set_qos(QosLevel::Fast).await.unwrap_err();
        assert_eq!(err, TdsError::Transport("reset".into()));
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let config = StreamConfig {
            request_timeout_ms: Some(50),
            sweep_interval_ms: 10,
            ..StreamConfig::default()
        };
        let (session, mut peer) = ready_session(config).await;
        let s = session.clone();
        let qos = tokio::spawn(async move { s.set_qos(QosLevel::Fast).await });
        next_request(&mut peer).await;

        let err = timeout(Duration::from_secs(1), qos).await.unwrap().unwrap().unwrap_err();
        assert_eq!(err, TdsError::Timeout { request_id: 1 });
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn stop_before_login_closes_locally() {
        let (sink, source, mut peer) = memory::pair();
        let session = session_with(StreamConfig::default());
        session.attach(sink, source).unwrap();

        session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(peer.try_recv().is_none());
        assert_eq!(session.start().await.unwrap_err(), TdsError::SessionClosed);
    }

    #[tokio::test]
    async fn failed_subscription_is_rolled_back() {
        let (session, peer) = ready_session(StreamConfig::default()).await;
        drop(peer);

        let err = session
            .subscribe(Service::Quote, "a", &symbols(&["SPY"]), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TdsError::Transport(_)));
        assert!(session.subscribers(&Service::Quote, "SPY").is_empty());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn invalid_ack_bodies_still_settle_requests() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;

        session.subscribe(Service::Quote, "a", &symbols(&["SPY"]), |_| {}).await.unwrap();
        assert_eq!(next_request(&mut peer).await["requestid"], 1);
        peer.push(
            r#"{"response":[{"service":"QUOTE","command":"SUBS","timestamp":1,"requestid":"1","content":{}}]}"#,
        )
        .unwrap();

        let s = session.clone();
        let qos = tokio::spawn(async move { s.set_qos(QosLevel::Fast).await });
        assert_eq!(next_request(&mut peer).await["requestid"], 2);
        peer.push(
            r#"{"response":[{"service":"ADMIN","command":"QOS","timestamp":1,"requestid":"2","content":{"msg":"ok"}}]}"#,
        )
        .unwrap();

        let err = timeout(Duration::from_secs(1), qos).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, TdsError::Decode(_)));
        assert!(session.shared.table.lock().is_empty());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn panicking_callbacks_do_not_stop_the_reader() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        session
            .subscribe(Service::Quote, "bad", &symbols(&["SPY"]), |_| panic!("subscriber failure"))
            .await
            .unwrap();
        next_request(&mut peer).await;
        session
            .subscribe(Service::Quote, "good", &symbols(&["SPY"]), move |r: &PushRecord| {
                let _ = tx.send(r.key.clone());
            })
            .await
            .unwrap();

        let id = session
            .send_command(handshake::qos(QosLevel::Slow), Box::new(|_| panic!("response failure")))
            .await
            .unwrap();
        assert_eq!(next_request(&mut peer).await["requestid"], id);
        peer.push(ack("ADMIN", "QOS", id, 0)).unwrap();

        for _ in 0..2 {
            peer.push(r#"{"data":[{"service":"QUOTE","command":"SUBS","timestamp":1,"content":[{"key":"SPY"}]}]}"#)
                .unwrap();
            let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
            assert_eq!(got.as_deref(), Some("SPY"));
        }

        let s = session.clone();
        let qos = tokio::spawn(async move { s.set_qos(QosLevel::Fast).await });
        let req = next_request(&mut peer).await;
        peer.push(ack("ADMIN", "QOS", req["requestid"].as_u64().unwrap(), 0)).unwrap();
        timeout(Duration::from_secs(1), qos).await.unwrap().unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn rejected_logout_keeps_session_ready() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;

        let s = session.clone();
        let stop = tokio::spawn(async move { s.stop().await });
        assert_eq!(next_request(&mut peer).await["command"], "LOGOUT");
        peer.push(ack("ADMIN", "LOGOUT", 1, 9)).unwrap();

        let err = stop.await.unwrap().unwrap_err();
        assert!(matches!(err, TdsError::Rejected { code: 9, .. }));
        assert_eq!(session.state(), SessionState::Ready);

        session.subscribe(Service::Quote, "a", &symbols(&["SPY"]), |_| {}).await.unwrap();
        assert_eq!(next_request(&mut peer).await["command"], "SUBS");
    }

    #[tokio::test]
    async fn response_and_data_in_one_frame() {
        let (session, mut peer) = ready_session(StreamConfig::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        session
            .subscribe(Service::Quote, "a", &symbols(&["SPY"]), move |r: &PushRecord| {
                let _ = tx.send(r.field_f64(1));
            })
            .await
            .unwrap();
        next_request(&mut peer).await;

        let s = session.clone();
        let qos = tokio::spawn(async move { s.set_qos(QosLevel::Moderate).await });
        assert_eq!(next_request(&mut peer).await["requestid"], 2);
        peer.push(
            r#"{"response":[{"service":"ADMIN","command":"QOS","timestamp":1,"requestid":"2","content":{"code":0}}],
                "data":[{"service":"QUOTE","command":"SUBS","timestamp":1,"content":[{"key":"SPY","1":"301.5"}]}]}"#,
        )
        .unwrap();

        timeout(Duration::from_secs(1), qos).await.unwrap().unwrap().unwrap();
        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(Some(301.5)));
    }

    #[tokio::test]
    async fn closed_resolves_with_the_failure() {
        let (session, peer) = ready_session(StreamConfig::default()).await;
        let s = session.clone();
        let closed = tokio::spawn(async move { s.closed().await });

        peer.fail(TdsError::Transport("reset".into())).unwrap();
        let reason = timeout(Duration::from_secs(1), closed).await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::Failed(TdsError::Transport("reset".into())));
        assert_eq!(session.closed().await, reason);
    }
}
