//! Per-session state machine.
//!
//! ```text
//! CONNECTING ──ready──▶ ACTIVE ──close / disconnect / idle──▶ CLOSING ──▶ CLOSED
//! ```
//!
//! [`VoiceSession::serve`] is a single receive loop over [`Inbound`] events.
//! Audio accumulates in a buffer until an utterance boundary (a `stop` frame,
//! or the STT backend reporting end of speech). Finished utterances wait in a
//! queue and are processed strictly one at a time: transcribe, send the
//! transcript, answer, send the response.
//!
//! The queue holds at most `max_queued_utterances` recordings. This is the
//! one case where a recording is dropped instead of buffered: once the queue
//! is full, a further recording is discarded and the client gets an `error`
//! frame asking it to wait for the current answer.
//!
//! `serve` returns with the session in CLOSING. The transport flushes
//! whatever frames are still queued and then calls
//! [`VoiceSession::finish`], which moves it to CLOSED and removes it from
//! the registry. [`VoiceSession::run`] does both for transports with nothing
//! to flush.
//!
//! A disconnect drops the in-flight utterance; provider calls already
//! started still complete and update their breakers. An explicit `close`
//! lets the in-flight utterance finish and discards the queue.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::{SessionGuard, SessionInfo};
use super::{ClientFrame, ServerFrame};
use crate::config::VoiceConfig;
use crate::orchestrator::Orchestrator;
use crate::stt::SpeechToText;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// One event from the socket reader.
#[derive(Debug)]
pub enum Inbound {
    Frame(ClientFrame),
    /// A text message that is not a valid [`ClientFrame`].
    Malformed(String),
    Disconnected,
}

impl Inbound {
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => Inbound::Frame(frame),
            Err(e) => Inbound::Malformed(format!("malformed frame: {}", e)),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    Disconnected,
    IdleTimeout,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub max_utterance_bytes: usize,
    pub max_queued_utterances: usize,
}

impl From<&VoiceConfig> for SessionSettings {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            max_utterance_bytes: config.max_utterance_bytes,
            max_queued_utterances: config.max_queued_utterances.max(1),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&VoiceConfig::default())
    }
}

struct Utterance {
    audio: Vec<u8>,
    mime_type: String,
}

enum Flow {
    Continue,
    Close,
}

/// The outbound channel is gone; the client cannot be reached.
struct Gone;

pub struct VoiceSession {
    guard: SessionGuard,
    orchestrator: Arc<Orchestrator>,
    stt: Arc<dyn SpeechToText>,
    settings: SessionSettings,
    buffer: Vec<u8>,
    mime_type: Option<String>,
    queue: VecDeque<Utterance>,
}

impl VoiceSession {
    pub fn new(
        guard: SessionGuard,
        orchestrator: Arc<Orchestrator>,
        stt: Arc<dyn SpeechToText>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            guard,
            orchestrator,
            stt,
            settings,
            buffer: Vec::new(),
            mime_type: None,
            queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.guard.info().id()
    }

    pub fn info(&self) -> &Arc<SessionInfo> {
        self.guard.info()
    }

    /// [`serve`](Self::serve) then [`finish`](Self::finish).
    pub async fn run(
        mut self,
        inbound: mpsc::Receiver<Inbound>,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> CloseReason {
        let reason = self.serve(inbound, outbound).await;
        self.finish();
        reason
    }

    /// Mark the session CLOSED and drop it from the registry.
    pub fn finish(self) {
        let info = self.guard.info();
        info.set_state(SessionState::Closed);
        debug!(session = info.id(), "voice session finished");
    }

    /// Drive the session until it closes, leaving it in CLOSING. `outbound`
    /// is dropped on return, which lets the socket writer drain and close.
    pub async fn serve(
        &mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> CloseReason {
        let info = Arc::clone(self.guard.info());
        info.set_state(SessionState::Active);
        let ready = ServerFrame::Ready {
            session_id: info.id().to_string(),
        };
        if outbound.send(ready).await.is_err() {
            info.set_state(SessionState::Closing);
            return CloseReason::Disconnected;
        }
        info!(
            session = info.id(),
            tenant = %info.identity().tenant_id,
            user = %info.identity().user_id,
            "voice session active"
        );

        let mut in_flight: Option<BoxFuture<'static, ()>> = None;
        let mut closing = false;
        let mut idle_deadline = Instant::now() + self.settings.idle_timeout;

        let reason = loop {
            if in_flight.is_none() {
                if let Some(utterance) = self.queue.pop_front() {
                    info.record_utterance();
                    in_flight = Some(self.process(utterance, outbound.clone()));
                } else if closing {
                    break CloseReason::ClientClosed;
                }
            }
            let busy = in_flight.is_some();

            tokio::select! {
                () = async {
                    if let Some(work) = in_flight.as_mut() {
                        work.await
                    }
                }, if busy => {
                    in_flight = None;
                    idle_deadline = Instant::now() + self.settings.idle_timeout;
                }
                event = inbound.recv() => {
                    idle_deadline = Instant::now() + self.settings.idle_timeout;
                    let flow = match event {
                        None | Some(Inbound::Disconnected) => break CloseReason::Disconnected,
                        Some(Inbound::Malformed(msg)) => send(&outbound, ServerFrame::error(msg)).await.map(|_| Flow::Continue),
                        Some(Inbound::Frame(_)) if closing => Ok(Flow::Continue),
                        Some(Inbound::Frame(frame)) => self.handle(frame, &outbound).await,
                    };
                    match flow {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => {
                            closing = true;
                            info.set_state(SessionState::Closing);
                            let dropped = self.queue.len();
                            self.queue.clear();
                            self.buffer.clear();
                            if dropped > 0 {
                                debug!(session = info.id(), dropped, "discarding queued utterances on close");
                            }
                        }
                        Err(Gone) => break CloseReason::Disconnected,
                    }
                }
                () = tokio::time::sleep_until(idle_deadline), if !busy && !closing => {
                    break CloseReason::IdleTimeout;
                }
            }
        };

        info.set_state(SessionState::Closing);
        drop(in_flight);
        info!(
            session = info.id(),
            reason = ?reason,
            utterances = info.summary().utterances,
            "voice session closed"
        );
        reason
    }

    async fn handle(&mut self, frame: ClientFrame, outbound: &mpsc::Sender<ServerFrame>) -> Result<Flow, Gone> {
        match frame {
            ClientFrame::Audio { data, mime_type } => {
                let bytes = match BASE64.decode(data.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        send(outbound, ServerFrame::error(format!("invalid base64 audio: {}", e))).await?;
                        return Ok(Flow::Continue);
                    }
                };
                if self.buffer.len() + bytes.len() > self.settings.max_utterance_bytes {
                    self.buffer.clear();
                    self.mime_type = None;
                    let msg = format!(
                        "utterance exceeds {} bytes and was discarded",
                        self.settings.max_utterance_bytes
                    );
                    send(outbound, ServerFrame::error(msg)).await?;
                    return Ok(Flow::Continue);
                }
                self.buffer.extend_from_slice(&bytes);
                self.mime_type = Some(mime_type);
                if self.stt.utterance_complete(&self.buffer) {
                    self.end_utterance(outbound).await?;
                }
                Ok(Flow::Continue)
            }
            ClientFrame::Stop => {
                self.end_utterance(outbound).await?;
                Ok(Flow::Continue)
            }
            ClientFrame::Ping => {
                send(outbound, ServerFrame::Pong).await?;
                Ok(Flow::Continue)
            }
            ClientFrame::Close => Ok(Flow::Close),
        }
    }

    /// Move the buffered audio onto the utterance queue.
    async fn end_utterance(&mut self, outbound: &mpsc::Sender<ServerFrame>) -> Result<(), Gone> {
        if self.buffer.is_empty() {
            return send(outbound, ServerFrame::error("no audio recorded")).await;
        }
        let audio = std::mem::take(&mut self.buffer);
        let mime_type = self
            .mime_type
            .take()
            .unwrap_or_else(|| "audio/webm".to_string());

        if self.queue.len() >= self.settings.max_queued_utterances {
            warn!(session = self.id(), "utterance queue full; dropping recording");
            return send(
                outbound,
                ServerFrame::error("too many recordings waiting; please wait for the current answer"),
            )
            .await;
        }
        self.queue.push_back(Utterance { audio, mime_type });
        Ok(())
    }

    /// Transcribe and answer one utterance, streaming frames as they are ready.
    fn process(&self, utterance: Utterance, outbound: mpsc::Sender<ServerFrame>) -> BoxFuture<'static, ()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let stt = Arc::clone(&self.stt);
        let info = Arc::clone(self.guard.info());

        async move {
            let transcript = match stt.transcribe(&utterance.audio, &utterance.mime_type).await {
                Ok(text) if text.trim().is_empty() => {
                    let _ = outbound.send(ServerFrame::error("no speech detected")).await;
                    return;
                }
                Ok(text) => text,
                Err(e) => {
                    warn!(session = info.id(), stt = stt.name(), error = %e, "transcription failed");
                    let _ = outbound.send(ServerFrame::error(e.to_string())).await;
                    return;
                }
            };

            let frame = ServerFrame::Transcript {
                data: transcript.clone(),
            };
            if outbound.send(frame).await.is_err() {
                return;
            }

            let frame = match orchestrator.answer(info.identity(), &transcript).await {
                Ok(answer) => ServerFrame::Response {
                    data: answer.answer_text,
                    sources: answer.sources,
                    cached: answer.cached,
                },
                Err(e) => ServerFrame::error(e.to_string()),
            };
            let _ = outbound.send(frame).await;
        }
        .boxed()
    }
}

async fn send(outbound: &mpsc::Sender<ServerFrame>, frame: ServerFrame) -> Result<(), Gone> {
    outbound.send(frame).await.map_err(|_| Gone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::cache::MemoryCache;
    use crate::embedding::HashEmbedder;
    use crate::error::SttError;
    use crate::llm::MockProvider;
    use crate::models::Identity;
    use crate::orchestrator::QuerySettings;
    use crate::retriever::{MemoryVectorStore, Retriever};
    use crate::router::{Route, Router};
    use crate::voice::SessionRegistry;
    use async_trait::async_trait;

    /// Treats the audio bytes as UTF-8 text; `"fail"` fails.
    struct EchoStt;

    #[async_trait]
    impl SpeechToText for EchoStt {
        fn name(&self) -> &str {
            "echo"
        }
        async fn transcribe(&self, audio: &[u8], _mime_type: &str) -> Result<String, SttError> {
            let text = String::from_utf8_lossy(audio).to_string();
            if text == "fail" {
                return Err(SttError::Failed("could not decode audio".into()));
            }
            Ok(text)
        }
    }

    fn orchestrator() -> Arc<Orchestrator> {
        let retriever = Arc::new(Retriever::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(HashEmbedder::new(32)),
            Duration::from_secs(2),
        ));
        let router = Arc::new(Router::new(vec![Route::new(
            Arc::new(MockProvider::new("mock")),
            BreakerConfig::new(3, Duration::from_secs(30)),
            Duration::from_secs(5),
        )]));
        Arc::new(Orchestrator::new(
            retriever,
            Arc::new(MemoryCache::new(100)),
            router,
            None,
            QuerySettings::default(),
        ))
    }

    struct Harness {
        tx: mpsc::Sender<Inbound>,
        rx: mpsc::Receiver<ServerFrame>,
        registry: SessionRegistry,
        task: tokio::task::JoinHandle<CloseReason>,
    }

    fn start(settings: SessionSettings) -> Harness {
        let registry = SessionRegistry::new();
        let guard = registry.register(Identity::new("acme", "alice"));
        let session = VoiceSession::new(guard, orchestrator(), Arc::new(EchoStt), settings);
        let (tx, inbound) = mpsc::channel(16);
        let (outbound, rx) = mpsc::channel(16);
        let task = tokio::spawn(session.run(inbound, outbound));
        Harness {
            tx,
            rx,
            registry,
            task,
        }
    }

    async fn send_frame(h: &Harness, frame: ClientFrame) {
        h.tx.send(Inbound::Frame(frame)).await.unwrap();
    }

    fn audio(text: &str) -> ClientFrame {
        ClientFrame::Audio {
            data: BASE64.encode(text),
            mime_type: "audio/webm".into(),
        }
    }

    #[tokio::test]
    async fn test_ready_ping_and_close() {
        let mut h = start(SessionSettings::default());
        assert!(matches!(h.rx.recv().await, Some(ServerFrame::Ready { .. })));
        assert_eq!(h.registry.list("acme")[0].state, SessionState::Active);

        send_frame(&h, ClientFrame::Ping).await;
        assert_eq!(h.rx.recv().await, Some(ServerFrame::Pong));

        send_frame(&h, ClientFrame::Close).await;
        assert_eq!(h.task.await.unwrap(), CloseReason::ClientClosed);
        assert!(h.registry.is_empty());
        assert_eq!(h.rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_utterance_yields_transcript_then_response() {
        let mut h = start(SessionSettings::default());
        h.rx.recv().await.unwrap();

        send_frame(&h, audio("what is the ")).await;
        send_frame(&h, audio("refund policy")).await;
        send_frame(&h, ClientFrame::Stop).await;

        assert_eq!(
            h.rx.recv().await,
            Some(ServerFrame::Transcript {
                data: "what is the refund policy".into()
            })
        );
        match h.rx.recv().await {
            Some(ServerFrame::Response { data, cached, .. }) => {
                assert!(!data.is_empty());
                assert!(!cached);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_stop_and_stt_failure_keep_session_active() {
        let mut h = start(SessionSettings::default());
        h.rx.recv().await.unwrap();

        send_frame(&h, ClientFrame::Stop).await;
        assert!(matches!(h.rx.recv().await, Some(ServerFrame::Error { .. })));

        send_frame(&h, audio("fail")).await;
        send_frame(&h, ClientFrame::Stop).await;
        match h.rx.recv().await {
            Some(ServerFrame::Error { data }) => assert!(data.contains("could not decode")),
            other => panic!("expected error, got {:?}", other),
        }

        send_frame(&h, ClientFrame::Ping).await;
        assert_eq!(h.rx.recv().await, Some(ServerFrame::Pong));
        assert_eq!(h.registry.list("acme")[0].state, SessionState::Active);
    }

    #[tokio::test]
    async fn test_malformed_and_oversized_input_are_errors() {
        let mut h = start(SessionSettings {
            max_utterance_bytes: 4,
            ..SessionSettings::default()
        });
        h.rx.recv().await.unwrap();

        h.tx.send(Inbound::parse("{not json")).await.unwrap();
        assert!(matches!(h.rx.recv().await, Some(ServerFrame::Error { .. })));

        send_frame(&h, audio("too long")).await;
        match h.rx.recv().await {
            Some(ServerFrame::Error { data }) => assert!(data.contains("exceeds 4 bytes")),
            other => panic!("expected error, got {:?}", other),
        }

        send_frame(&h, ClientFrame::Stop).await;
        match h.rx.recv().await {
            Some(ServerFrame::Error { data }) => assert_eq!(data, "no audio recorded"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_session() {
        let mut h = start(SessionSettings {
            idle_timeout: Duration::from_secs(30),
            ..SessionSettings::default()
        });
        h.rx.recv().await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(h.task.await.unwrap(), CloseReason::IdleTimeout);
    }

    #[tokio::test]
    async fn test_disconnect_ends_session() {
        let mut h = start(SessionSettings::default());
        h.rx.recv().await.unwrap();
        h.tx.send(Inbound::Disconnected).await.unwrap();
        assert_eq!(h.task.await.unwrap(), CloseReason::Disconnected);
        assert!(h.registry.is_empty());
    }

    /// Echoes after a delay so recordings pile up behind the first one.
    struct SlowEcho(Duration);

    #[async_trait]
    impl SpeechToText for SlowEcho {
        fn name(&self) -> &str {
            "slow-echo"
        }
        async fn transcribe(&self, audio: &[u8], _mime_type: &str) -> Result<String, SttError> {
            tokio::time::sleep(self.0).await;
            Ok(String::from_utf8_lossy(audio).to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_refuses_recording_with_error() {
        let registry = SessionRegistry::new();
        let guard = registry.register(Identity::new("acme", "alice"));
        let settings = SessionSettings {
            max_queued_utterances: 1,
            ..SessionSettings::default()
        };
        let session = VoiceSession::new(guard, orchestrator(), Arc::new(SlowEcho(Duration::from_secs(1))), settings);
        let (tx, inbound) = mpsc::channel(16);
        let (outbound, mut rx) = mpsc::channel(16);
        let task = tokio::spawn(session.run(inbound, outbound));
        rx.recv().await.unwrap();

        // One in flight, one waiting, the third is refused.
        for words in ["first", "second", "third"] {
            tx.send(Inbound::Frame(audio(words))).await.unwrap();
            tx.send(Inbound::Frame(ClientFrame::Stop)).await.unwrap();
        }
        match rx.recv().await {
            Some(ServerFrame::Error { data }) => assert!(data.contains("too many recordings"), "{}", data),
            other => panic!("expected error, got {:?}", other),
        }
        for expected in ["first", "second"] {
            assert_eq!(rx.recv().await, Some(ServerFrame::Transcript { data: expected.into() }));
            assert!(matches!(rx.recv().await, Some(ServerFrame::Response { .. })));
        }

        tx.send(Inbound::Frame(ClientFrame::Close)).await.unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::ClientClosed);
    }

    #[tokio::test]
    async fn test_closed_only_after_finish() {
        let registry = SessionRegistry::new();
        let guard = registry.register(Identity::new("acme", "alice"));
        let mut session = VoiceSession::new(guard, orchestrator(), Arc::new(EchoStt), SessionSettings::default());
        let info = Arc::clone(session.info());
        let (tx, inbound) = mpsc::channel(16);
        let (outbound, mut rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            let reason = session.serve(inbound, outbound).await;
            (session, reason)
        });
        rx.recv().await.unwrap();

        tx.send(Inbound::Frame(ClientFrame::Close)).await.unwrap();
        let (session, reason) = task.await.unwrap();
        assert_eq!(reason, CloseReason::ClientClosed);

        // Output is flushed but the session is still listed until finish.
        assert_eq!(rx.recv().await, None);
        assert_eq!(registry.list("acme")[0].state, SessionState::Closing);

        session.finish();
        assert_eq!(info.state(), SessionState::Closed);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_inbound_parse() {
        assert!(matches!(
            Inbound::parse(r#"{"type":"ping"}"#),
            Inbound::Frame(ClientFrame::Ping)
        ));
        assert!(matches!(Inbound::parse("[]"), Inbound::Malformed(_)));
    }
}
