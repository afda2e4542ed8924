use async_trait::async_trait;
use futures_util::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use crate::auth::{AuthError, Credential, CredentialGuard};
use crate::helix::{ChatMessageRequest, EventSubApi};
use crate::model::{
    Envelope, EventKind, InboundMessage, Notification, NotificationEvent, SessionInfo,
    SubscriptionRequest,
};
use crate::queue::CommandSender;
use crate::router::Router;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("command queue has been stopped")]
    QueueStopped,
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    Oversize { size: usize, limit: usize },
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Auth(err) => err.is_fatal(),
            Self::ReconnectExhausted { .. } | Self::QueueStopped => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data { bytes: Vec<u8>, fin: bool },
    Close(Option<String>),
    Control,
}

#[async_trait]
pub trait Connection: Send {
    async fn recv(&mut self) -> Option<Result<Frame, SessionError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Connection;

    async fn connect(
        &self,
        url: &str,
        credential: &Credential,
        client_id: &str,
    ) -> Result<Self::Conn, SessionError>;
}

#[derive(Debug)]
pub struct MessageAssembler {
    buf: Vec<u8>,
    limit: usize,
    received: usize,
}

impl MessageAssembler {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            received: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8], fin: bool) -> Result<Option<Vec<u8>>, SessionError> {
        self.received += bytes.len();
        if self.received > self.limit {
            self.buf.clear();
        } else {
            self.buf.extend_from_slice(bytes);
        }
        if !fin {
            return Ok(None);
        }

        let size = std::mem::replace(&mut self.received, 0);
        if size > self.limit {
            return Err(SessionError::Oversize {
                size,
                limit: self.limit,
            });
        }
        Ok(Some(std::mem::take(&mut self.buf)))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.received = 0;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(2500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub default_url: String,
    pub channel_id: String,
    pub subscriptions: Vec<EventKind>,
    pub reconnect: ReconnectPolicy,
    pub max_message_bytes: usize,
    pub dev_mode: bool,
}

#[derive(Debug)]
pub enum Outcome {
    Continue,
    Reconnect(String),
    Fatal(SessionError),
}

enum ListenExit {
    Reconnect(String),
    Dropped(String),
    Fatal(SessionError),
}

pub struct Session<C: Connector> {
    connector: C,
    guard: Arc<CredentialGuard>,
    api: Arc<dyn EventSubApi>,
    router: Router,
    commands: CommandSender,
    settings: SessionSettings,
    state: watch::Sender<SessionState>,
    conn: Option<C::Conn>,
    current: Option<SessionInfo>,
    assembler: MessageAssembler,
}

impl<C: Connector> Session<C> {
    pub fn new(
        connector: C,
        guard: Arc<CredentialGuard>,
        api: Arc<dyn EventSubApi>,
        router: Router,
        commands: CommandSender,
        settings: SessionSettings,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        let assembler = MessageAssembler::new(settings.max_message_bytes);
        Self {
            connector,
            guard,
            api,
            router,
            commands,
            settings,
            state,
            conn: None,
            current: None,
            assembler,
        }
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    // Runs until the session is closed for good. An initial connect failure
    // is returned as is; later transport losses go through the reconnect
    // protocol first.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let url = self.settings.default_url.clone();
        if let Err(err) = self.validate_and_connect(&url).await {
            self.set_state(SessionState::Closed);
            return Err(err);
        }

        loop {
            let exit = self.listen().await;
            self.drop_connection().await;
            let result = match exit {
                ListenExit::Fatal(err) => Err(err),
                ListenExit::Reconnect(url) => {
                    self.set_state(SessionState::Reconnecting);
                    match self.validate_and_connect(&url).await {
                        Ok(()) => Ok(()),
                        Err(err) if err.is_fatal() => Err(err),
                        Err(err) => {
                            tracing::warn!(error = %err, url = %url, "reconnect url failed, falling back to default endpoint");
                            self.reconnect().await
                        }
                    }
                }
                ListenExit::Dropped(reason) => {
                    tracing::warn!(reason = %reason, "eventsub connection lost");
                    self.reconnect().await
                }
            };
            if let Err(err) = result {
                self.set_state(SessionState::Closed);
                return Err(err);
            }
        }
    }

    async fn validate_and_connect(&mut self, url: &str) -> Result<(), SessionError> {
        let credential = self.guard.ensure_valid().await?;
        let client_id = self.guard.client_id().await?;
        let conn = self.connector.connect(url, &credential, &client_id).await?;
        self.conn = Some(conn);
        self.assembler.clear();
        self.set_state(SessionState::Open);
        tracing::info!(url, "connected to eventsub");
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), SessionError> {
        self.set_state(SessionState::Reconnecting);
        let policy = self.settings.reconnect;
        let url = self.settings.default_url.clone();

        for attempt in 1..=policy.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(policy.delay).await;
            }
            tracing::info!(attempt, max = policy.max_attempts, "attempting to reconnect");
            match self.validate_and_connect(&url).await {
                Ok(()) => {
                    tracing::info!(attempt, "reconnected");
                    return Ok(());
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => tracing::warn!(attempt, error = %err, "reconnect attempt failed"),
            }
        }

        tracing::error!(attempts = policy.max_attempts, "max reconnect attempts reached");
        Err(SessionError::ReconnectExhausted {
            attempts: policy.max_attempts,
        })
    }

    async fn listen(&mut self) -> ListenExit {
        loop {
            let next = match self.conn.as_mut() {
                Some(conn) => conn.recv().await,
                None => return ListenExit::Dropped("no connection".to_string()),
            };
            let frame = match next {
                None => return ListenExit::Dropped("stream ended".to_string()),
                Some(Err(err)) => return ListenExit::Dropped(err.to_string()),
                Some(Ok(frame)) => frame,
            };

            let (bytes, fin) = match frame {
                Frame::Data { bytes, fin } => (bytes, fin),
                Frame::Close(reason) => {
                    return ListenExit::Dropped(format!(
                        "closed by server: {}",
                        reason.unwrap_or_default()
                    ))
                }
                Frame::Control => continue,
            };

            let message = match self.assembler.push(&bytes, fin) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "dropping inbound message");
                    continue;
                }
            };

            match self.dispatch(&message).await {
                Outcome::Continue => {}
                Outcome::Reconnect(url) => return ListenExit::Reconnect(url),
                Outcome::Fatal(err) => return ListenExit::Fatal(err),
            }
        }
    }

    pub async fn dispatch(&mut self, raw: &[u8]) -> Outcome {
        if self.settings.dev_mode {
            tracing::debug!(raw = %String::from_utf8_lossy(raw), "inbound message");
        }
        let Envelope { metadata, message } = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable eventsub message dropped");
                return Outcome::Continue;
            }
        };
        tracing::trace!(
            message_id = %metadata.message_id,
            timestamp = metadata.message_timestamp.as_deref().unwrap_or("-"),
            "eventsub message"
        );

        match message {
            InboundMessage::Welcome(info) => {
                tracing::info!(
                    session_id = %info.id,
                    keepalive_secs = ?info.keepalive_timeout_seconds,
                    "session welcome"
                );
                self.subscribe_all(&info.id).await;
                self.current = Some(info);
                Outcome::Continue
            }
            InboundMessage::Keepalive => Outcome::Continue,
            InboundMessage::Reconnect(info) => match info.reconnect_url {
                Some(url) => {
                    tracing::info!(session_id = %info.id, url = %url, "server requested reconnect");
                    Outcome::Reconnect(url)
                }
                None => {
                    tracing::warn!(session_id = %info.id, "reconnect message without url ignored");
                    Outcome::Continue
                }
            },
            InboundMessage::Notification(notification) => self.notify(notification).await,
            InboundMessage::Revocation(sub) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    subscription = %sub.kind,
                    status = %sub.status,
                    "subscription revoked"
                );
                Outcome::Continue
            }
        }
    }

    async fn subscribe_all(&mut self, session_id: &str) {
        for kind in &self.settings.subscriptions {
            let request = SubscriptionRequest::new(*kind, &self.settings.channel_id, session_id);
            match self.api.create_subscription(&request).await {
                Ok(()) => tracing::info!(event = %kind, "subscribed"),
                Err(err) => tracing::warn!(event = %kind, error = %err, "subscription failed"),
            }
        }
    }

    async fn notify(&mut self, notification: Notification) -> Outcome {
        let kind: EventKind = match notification.subscription.kind.parse() {
            Ok(kind) => kind,
            Err(err) => {
                tracing::info!(error = %err, "unhandled event type");
                return Outcome::Continue;
            }
        };
        let event = match NotificationEvent::decode(kind, notification.event) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "notification dropped");
                return Outcome::Continue;
            }
        };

        let routed = self.router.route(&event);
        tracing::debug!(
            event = %event.kind(),
            commands = routed.commands.len(),
            replies = routed.replies.len(),
            "notification routed"
        );
        for command in routed.commands {
            if self.commands.enqueue(command).await.is_err() {
                return Outcome::Fatal(SessionError::QueueStopped);
            }
        }
        for reply in routed.replies {
            let request = ChatMessageRequest {
                broadcaster_id: self.settings.channel_id.clone(),
                sender_id: self.settings.channel_id.clone(),
                message: reply.message,
            };
            if let Err(err) = self.api.send_chat_message(&request).await {
                tracing::warn!(error = %err, "chat reply failed");
            }
        }
        Outcome::Continue
    }

    async fn drop_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        if let Some(info) = self.current.take() {
            tracing::debug!(
                session_id = %info.id,
                status = info.status.as_deref().unwrap_or("-"),
                connected_at = info.connected_at.as_deref().unwrap_or("-"),
                "session ended"
            );
        }
    }

    fn set_state(&self, next: SessionState) {
        let changed = self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
        if changed {
            tracing::debug!(state = %next, "session state changed");
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct TungsteniteConnector;

pub struct TungsteniteConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connector for TungsteniteConnector {
    type Conn = TungsteniteConnection;

    async fn connect(
        &self,
        url: &str,
        credential: &Credential,
        client_id: &str,
    ) -> Result<Self::Conn, SessionError> {
        let connect_err = |reason: String| SessionError::Connect {
            url: url.to_string(),
            reason,
        };
        let mut request = url
            .into_client_request()
            .map_err(|err| connect_err(format!("invalid websocket request: {err}")))?;

        request.headers_mut().insert(
            "client-id",
            client_id
                .trim()
                .parse()
                .map_err(|err| connect_err(format!("invalid client-id header: {err}")))?,
        );
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Bearer {}", credential.access_token.trim())
                .parse()
                .map_err(|err| connect_err(format!("invalid authorization header: {err}")))?,
        );
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let (stream, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|err| connect_err(format!("websocket connection failed: {err}")))?;
        Ok(TungsteniteConnection { stream })
    }
}

#[async_trait]
impl Connection for TungsteniteConnection {
    async fn recv(&mut self) -> Option<Result<Frame, SessionError>> {
        let message = match self.stream.next().await? {
            Ok(message) => message,
            Err(err) => return Some(Err(SessionError::Transport(err.to_string()))),
        };
        let frame = match message {
            Message::Text(text) => Frame::Data {
                bytes: text.into_bytes(),
                fin: true,
            },
            Message::Binary(bytes) => Frame::Data { bytes, fin: true },
            Message::Close(close) => Frame::Close(close.map(|c| format!("{} {}", u16::from(c.code), c.reason))),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Frame::Control,
        };
        Some(Ok(frame))
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            tracing::debug!(error = %err, "websocket close failed");
        }
        // wait briefly for the peer to acknowledge the close
        let drain = async { while let Some(Ok(_)) = self.stream.next().await {} };
        let _ = tokio::time::timeout(Duration::from_secs(2), drain).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{seeded_store, FakeAuthority};
    use crate::color::{Palette, Rgb};
    use crate::config::Config;
    use crate::device::{DeviceCommandPort, DeviceError, LampTarget};
    use crate::helix::HelixError;
    use crate::queue::{CommandQueue, LampCommand, QueueSettings};
    use crate::store::keys;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    // ---- transport double ----

    struct ScriptedConnection {
        rx: mpsc::UnboundedReceiver<Frame>,
        closed: Arc<Mutex<Vec<String>>>,
        url: String,
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn recv(&mut self) -> Option<Result<Frame, SessionError>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.closed.lock().unwrap().push(self.url.clone());
        }
    }

    // Hands out one scripted connection per successful connect; once the
    // script runs dry every connect fails.
    #[derive(Clone, Default)]
    struct ScriptedConnector {
        script: Arc<Mutex<VecDeque<mpsc::UnboundedReceiver<Frame>>>>,
        attempts: Arc<Mutex<Vec<(String, Instant)>>>,
        closed: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedConnector {
        fn push_connection(&self) -> mpsc::UnboundedSender<Frame> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.script.lock().unwrap().push_back(rx);
            tx
        }

        fn attempts(&self) -> Vec<(String, Instant)> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Conn = ScriptedConnection;

        async fn connect(
            &self,
            url: &str,
            _credential: &Credential,
            _client_id: &str,
        ) -> Result<Self::Conn, SessionError> {
            self.attempts
                .lock()
                .unwrap()
                .push((url.to_string(), Instant::now()));
            match self.script.lock().unwrap().pop_front() {
                Some(rx) => Ok(ScriptedConnection {
                    rx,
                    closed: self.closed.clone(),
                    url: url.to_string(),
                }),
                None => Err(SessionError::Connect {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                }),
            }
        }
    }

    // ---- REST and device doubles ----

    #[derive(Default)]
    struct RecordingApi {
        subscriptions: Mutex<Vec<SubscriptionRequest>>,
        chats: Mutex<Vec<ChatMessageRequest>>,
    }

    #[async_trait]
    impl EventSubApi for RecordingApi {
        async fn create_subscription(&self, request: &SubscriptionRequest) -> Result<(), HelixError> {
            self.subscriptions.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn send_chat_message(&self, request: &ChatMessageRequest) -> Result<(), HelixError> {
            self.chats.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPort {
        seen: Mutex<Vec<LampCommand>>,
    }

    #[async_trait]
    impl DeviceCommandPort for RecordingPort {
        async fn set_color(&self, lamp: &str, color: Rgb) -> Result<(), DeviceError> {
            self.seen.lock().unwrap().push(LampCommand::SetColor {
                lamp: lamp.to_string(),
                color,
            });
            Ok(())
        }

        async fn run_effect(
            &self,
            target: &LampTarget,
            palette: &Palette,
            duration: Duration,
        ) -> Result<(), DeviceError> {
            self.seen.lock().unwrap().push(LampCommand::RunEffect {
                target: target.clone(),
                palette: palette.clone(),
                duration,
            });
            Ok(())
        }
    }

    struct Harness {
        authority: Arc<FakeAuthority>,
        connector: ScriptedConnector,
        api: Arc<RecordingApi>,
        port: Arc<RecordingPort>,
        queue: CommandQueue,
        session: Session<ScriptedConnector>,
    }

    const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";

    async fn harness() -> Harness {
        let store = seeded_store(&[(keys::ACCESS_TOKEN, "tok"), (keys::CLIENT_ID, "cid")]).await;
        let authority = Arc::new(FakeAuthority::accepting("tok"));
        let guard = Arc::new(CredentialGuard::new(store, authority.clone()));
        let connector = ScriptedConnector::default();
        let api = Arc::new(RecordingApi::default());
        let port = Arc::new(RecordingPort::default());
        let queue = CommandQueue::start(port.clone(), QueueSettings::default());
        let config = Config::default();
        let router = Router::from_config(&config, false).unwrap();
        let settings = SessionSettings {
            default_url: DEFAULT_URL.to_string(),
            channel_id: "1234".to_string(),
            subscriptions: config.subscriptions(false),
            reconnect: ReconnectPolicy::default(),
            max_message_bytes: 64 * 1024,
            dev_mode: false,
        };
        let session = Session::new(
            connector.clone(),
            guard,
            api.clone(),
            router,
            queue.sender(),
            settings,
        );
        Harness {
            authority,
            connector,
            api,
            port,
            queue,
            session,
        }
    }

    fn text(json: &str) -> Frame {
        Frame::Data {
            bytes: json.as_bytes().to_vec(),
            fin: true,
        }
    }

    fn welcome(session_id: &str) -> String {
        format!(
            r#"{{"metadata":{{"message_id":"m-w","message_type":"session_welcome","message_timestamp":"2024-01-01T00:00:00Z"}},
               "payload":{{"session":{{"id":"{session_id}","status":"connected","keepalive_timeout_seconds":10,"reconnect_url":null,"connected_at":"2024-01-01T00:00:00Z"}}}}}}"#
        )
    }

    fn reconnect(url: &str) -> String {
        format!(
            r#"{{"metadata":{{"message_id":"m-r","message_type":"session_reconnect","message_timestamp":"2024-01-01T00:00:00Z"}},
               "payload":{{"session":{{"id":"abc123","status":"reconnecting","keepalive_timeout_seconds":null,"reconnect_url":"{url}","connected_at":"2024-01-01T00:00:00Z"}}}}}}"#
        )
    }

    fn notification(kind: &str, event: &str) -> String {
        format!(
            r#"{{"metadata":{{"message_id":"m-n","message_type":"notification","message_timestamp":"2024-01-01T00:00:00Z","subscription_type":"{kind}","subscription_version":"1"}},
               "payload":{{"subscription":{{"id":"s-1","type":"{kind}","version":"1","status":"enabled"}},"event":{event}}}}}"#
        )
    }

    fn redemption(title: &str, input: &str) -> String {
        notification(
            "channel.channel_points_custom_reward_redemption.add",
            &format!(
                r#"{{"id":"r-1","user_name":"viewer","user_input":"{input}","reward":{{"id":"rw-1","title":"{title}"}}}}"#
            ),
        )
    }

    const KEEPALIVE: &str = r#"{"metadata":{"message_id":"m-k","message_type":"session_keepalive","message_timestamp":"2024-01-01T00:00:00Z"},"payload":{}}"#;

    // Lets every spawned task run until the runtime goes idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn welcome_issues_one_subscription_per_type_with_session_id() {
        let h = harness().await;
        let tx = h.connector.push_connection();
        let state = h.session.state();
        let task = tokio::spawn(h.session.run());

        tx.send(text(&welcome("abc123"))).unwrap();
        tx.send(text(KEEPALIVE)).unwrap();
        settle().await;

        assert_eq!(*state.borrow(), SessionState::Open);
        let subs = h.api.subscriptions.lock().unwrap().clone();
        let expected = Config::default().subscriptions(false);
        assert_eq!(subs.len(), expected.len());
        for (sub, kind) in subs.iter().zip(&expected) {
            assert_eq!(sub.kind, *kind);
            assert_eq!(sub.transport.session_id, "abc123");
            assert_eq!(sub.condition.broadcaster_user_id.as_deref(), Some("1234"));
        }

        drop(tx);
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ReconnectExhausted { attempts: 5 }));
        assert_eq!(*state.borrow(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn fragmented_redemption_reaches_device_as_one_command() {
        let h = harness().await;
        let tx = h.connector.push_connection();
        let task = tokio::spawn(h.session.run());

        tx.send(text(&welcome("abc123"))).unwrap();
        let raw = redemption("Change left lamp color", "#FF00FF");
        let (head, tail) = raw.as_bytes().split_at(raw.len() / 2);
        tx.send(Frame::Data {
            bytes: head.to_vec(),
            fin: false,
        })
        .unwrap();
        tx.send(Frame::Control).unwrap();
        tx.send(Frame::Data {
            bytes: tail.to_vec(),
            fin: true,
        })
        .unwrap();
        tx.send(text(&redemption("Change right lamp color", "blue"))).unwrap();
        settle().await;

        drop(tx);
        let _ = task.await.unwrap();
        h.queue.stop().await;

        assert_eq!(
            *h.port.seen.lock().unwrap(),
            vec![
                LampCommand::SetColor {
                    lamp: "left".to_string(),
                    color: Rgb::new(0xFF, 0x00, 0xFF),
                },
                LampCommand::SetColor {
                    lamp: "right".to_string(),
                    color: Rgb::new(0x00, 0x00, 0xFF),
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_event_type_is_dropped_and_session_stays_open() {
        let h = harness().await;
        let tx = h.connector.push_connection();
        let state = h.session.state();
        let task = tokio::spawn(h.session.run());

        tx.send(text(&welcome("abc123"))).unwrap();
        tx.send(text(&notification("channel.follow", r#"{"user_name":"f"}"#)))
            .unwrap();
        tx.send(text(r#"{"metadata":{"message_id":"x","message_type":"mystery"},"payload":{}}"#))
            .unwrap();
        tx.send(text("not json")).unwrap();
        settle().await;

        assert_eq!(*state.borrow(), SessionState::Open);
        assert_eq!(h.connector.attempts().len(), 1);

        drop(tx);
        let _ = task.await.unwrap();
        h.queue.stop().await;
        assert!(h.port.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_color_sends_chat_reply_from_channel() {
        let h = harness().await;
        let tx = h.connector.push_connection();
        let task = tokio::spawn(h.session.run());

        tx.send(text(&welcome("abc123"))).unwrap();
        tx.send(text(&redemption("Change left lamp color", "glitter"))).unwrap();
        settle().await;

        let chats = h.api.chats.lock().unwrap().clone();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].broadcaster_id, "1234");
        assert_eq!(chats[0].sender_id, "1234");
        assert!(chats[0].message.contains("'glitter'"));

        drop(tx);
        let _ = task.await.unwrap();
        h.queue.stop().await;
        assert_eq!(h.port.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_message_moves_to_carried_url_and_resubscribes() {
        let h = harness().await;
        let first = h.connector.push_connection();
        let second = h.connector.push_connection();
        let state = h.session.state();
        let task = tokio::spawn(h.session.run());

        first.send(text(&welcome("abc123"))).unwrap();
        first
            .send(text(&reconnect("wss://edge.example.test/ws?id=1")))
            .unwrap();
        settle().await;
        second.send(text(&welcome("def456"))).unwrap();
        settle().await;

        assert_eq!(*state.borrow(), SessionState::Open);
        let urls: Vec<String> = h.connector.attempts().into_iter().map(|(u, _)| u).collect();
        assert_eq!(urls, vec![DEFAULT_URL, "wss://edge.example.test/ws?id=1"]);
        assert_eq!(*h.connector.closed.lock().unwrap(), vec![DEFAULT_URL]);

        let subs = h.api.subscriptions.lock().unwrap().clone();
        let per_session = Config::default().subscriptions(false).len();
        assert_eq!(subs.len(), per_session * 2);
        assert!(subs[per_session..]
            .iter()
            .all(|s| s.transport.session_id == "def456"));

        drop(first);
        drop(second);
        let _ = task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_close_the_session_with_fixed_spacing() {
        let h = harness().await;
        let tx = h.connector.push_connection();
        let state = h.session.state();
        let task = tokio::spawn(h.session.run());

        tx.send(text(&welcome("abc123"))).unwrap();
        settle().await;
        tx.send(Frame::Close(Some("4000 internal error".to_string())))
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ReconnectExhausted { attempts: 5 }));
        assert_eq!(*state.borrow(), SessionState::Closed);

        let attempts = h.connector.attempts();
        // initial connect + five retries, nothing after
        assert_eq!(attempts.len(), 6);
        let retries = &attempts[1..];
        assert!(retries.iter().all(|(url, _)| url == DEFAULT_URL));
        for pair in retries.windows(2) {
            let gap = pair[1].1 - pair[0].1;
            assert!(gap >= Duration::from_millis(2500), "gap {gap:?}");
            assert!(gap < Duration::from_millis(2600), "gap {gap:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_url_failure_falls_back_to_default_endpoint() {
        let h = harness().await;
        let first = h.connector.push_connection();
        let state = h.session.state();
        let task = tokio::spawn(h.session.run());

        first.send(text(&welcome("abc123"))).unwrap();
        first
            .send(text(&reconnect("wss://edge.example.test/ws")))
            .unwrap();
        settle().await;

        let urls: Vec<String> = h.connector.attempts().into_iter().map(|(u, _)| u).collect();
        assert_eq!(urls, vec![DEFAULT_URL, "wss://edge.example.test/ws", DEFAULT_URL]);
        assert_eq!(*state.borrow(), SessionState::Reconnecting);

        let second = h.connector.push_connection();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(*state.borrow(), SessionState::Open);
        let attempts = h.connector.attempts();
        assert_eq!(attempts.len(), 4);
        assert_eq!(attempts[3].0, DEFAULT_URL);

        second.send(text(&welcome("def456"))).unwrap();
        settle().await;
        assert!(h
            .api
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.transport.session_id == "def456"));

        drop(first);
        drop(second);
        let _ = task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn revocation_is_dropped_and_session_stays_open() {
        let h = harness().await;
        let tx = h.connector.push_connection();
        let state = h.session.state();
        let task = tokio::spawn(h.session.run());

        tx.send(text(&welcome("abc123"))).unwrap();
        tx.send(text(
            r#"{"metadata":{"message_id":"m-v","message_type":"revocation","message_timestamp":"2024-01-01T00:00:00Z"},
                "payload":{"subscription":{"id":"s-1","type":"channel.cheer","version":"1","status":"authorization_revoked"}}}"#,
        ))
        .unwrap();
        tx.send(text(KEEPALIVE)).unwrap();
        settle().await;

        assert_eq!(*state.borrow(), SessionState::Open);
        assert_eq!(h.connector.attempts().len(), 1);
        assert!(h.api.chats.lock().unwrap().is_empty());

        drop(tx);
        let _ = task.await.unwrap();
        h.queue.stop().await;
        assert!(h.port.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_refresh_token_aborts_reconnect() {
        let h = harness().await;
        let tx = h.connector.push_connection();
        let state = h.session.state();
        let task = tokio::spawn(h.session.run());

        tx.send(text(&welcome("abc123"))).unwrap();
        settle().await;
        h.authority.valid.lock().unwrap().clear();
        drop(tx);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Auth(AuthError::MissingRefreshToken)
        ));
        assert!(err.is_fatal());
        assert_eq!(*state.borrow(), SessionState::Closed);
        assert_eq!(h.connector.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_when_a_retry_succeeds() {
        let h = harness().await;
        let first = h.connector.push_connection();
        let state = h.session.state();
        let task = tokio::spawn(h.session.run());

        first.send(text(&welcome("abc123"))).unwrap();
        settle().await;
        let second = h.connector.push_connection();
        drop(first);
        settle().await;

        assert_eq!(*state.borrow(), SessionState::Open);
        second.send(text(&welcome("def456"))).unwrap();
        settle().await;
        assert_eq!(h.connector.attempts().len(), 2);

        drop(second);
        let _ = task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn initial_connect_failure_is_returned_without_retries() {
        let h = harness().await;
        let err = h.session.run().await.unwrap_err();
        assert!(matches!(err, SessionError::Connect { .. }));
        assert_eq!(h.connector.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_queue_closes_the_session() {
        let h = harness().await;
        let tx = h.connector.push_connection();
        let state = h.session.state();
        h.queue.stop().await;
        let task = tokio::spawn(h.session.run());

        tx.send(text(&welcome("abc123"))).unwrap();
        tx.send(text(&redemption("Change left lamp color", "red"))).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::QueueStopped));
        assert_eq!(*state.borrow(), SessionState::Closed);
        assert_eq!(*h.connector.closed.lock().unwrap(), vec![DEFAULT_URL]);
    }

    #[test]
    fn assembler_rejects_oversized_messages_and_recovers() {
        let mut asm = MessageAssembler::new(8);
        assert_eq!(asm.push(b"abcd", false).unwrap(), None);
        assert_eq!(asm.push(b"efghij", false).unwrap(), None);
        assert!(matches!(
            asm.push(b"kl", true),
            Err(SessionError::Oversize { size: 12, limit: 8 })
        ));
        assert_eq!(asm.push(b"ok", true).unwrap(), Some(b"ok".to_vec()));
        assert_eq!(asm.push(b"12345678", true).unwrap(), Some(b"12345678".to_vec()));
    }
}
