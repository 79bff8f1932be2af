//! WHEP stream reader
//!
//! [`WebRtcReader`] is a handle to a supervisor task that owns every piece of
//! mutable state. The task:
//! - probes non-advertised codecs once, before the first attempt
//! - runs negotiation attempts (OPTIONS, offer, POST, answer, trickle)
//! - reports tracks, readiness and errors on the event bus
//! - retries after a pause when a running attempt fails
//!
//! I/O steps run as spawned tasks that post their result back to the
//! supervisor tagged with the attempt generation. Results and transport events
//! of an earlier attempt are dropped, so a late failure or answer can never
//! affect the attempt that replaced it.
//!
//! ```text
//!  Initializing --probe done--> Running --failure--> Restarting
//!       |                        ^   ^                   |
//!       | failure                |   +----retry pause----+
//!       v                        |
//!     Error -------restart()-----+
//!
//!  any state --close()--> Closed
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Sleep;
use tracing::{debug, info, trace, warn};

use super::codec::CodecSet;
use super::config::IceServer;
use super::probe::probe_all;
use super::sdp::{edit_offer, OfferData};
use super::signaling::{ConnectionState, IceCandidate, MediaKind};
use super::transport::{PeerTransport, TransportEvent, TransportEventSender, TransportFactory};
use super::trickle::{generate_sdp_fragment, CandidateQueue};
use super::whep::{WhepAnswer, WhepClient};
use crate::auth::StreamEndpoint;
use crate::config::ReaderConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, ReadyInfo, ReaderEvent};

/// Suffix of error messages that are followed by an automatic retry
const RETRY_SUFFIX: &str = ", retrying in some seconds";

/// Public reader state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderState {
    Initializing,
    Running,
    Restarting,
    Error,
    Closed,
}

impl std::fmt::Display for ReaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderState::Initializing => write!(f, "initializing"),
            ReaderState::Running => write!(f, "running"),
            ReaderState::Restarting => write!(f, "restarting"),
            ReaderState::Error => write!(f, "error"),
            ReaderState::Closed => write!(f, "closed"),
        }
    }
}

enum Command {
    Close(Option<oneshot::Sender<()>>),
    Restart,
}

/// Handle to a running reader
///
/// Dropping the handle closes the reader.
pub struct WebRtcReader {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ReaderState>,
    events: Arc<EventBus>,
}

impl WebRtcReader {
    /// Validate the config and start reading
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: ReaderConfig,
        events: Arc<EventBus>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let (reader, task) = Self::build(config, events, factory)?;
        tokio::spawn(task.run());
        Ok(reader)
    }

    fn build(
        config: ReaderConfig,
        events: Arc<EventBus>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<(Self, ReaderTask)> {
        config.validate()?;
        let endpoint = StreamEndpoint::new(&config.url, config.auth_token.as_deref())?;

        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        info!("Reader {} created for {}", id, endpoint.url());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ReaderState::Initializing);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let task = ReaderTask {
            id: id.clone(),
            whep: WhepClient::new(endpoint),
            config,
            factory,
            events: events.clone(),
            state_tx,
            commands: commands_rx,
            inbox_tx,
            inbox: inbox_rx,
            transport_tx,
            transport_events: transport_rx,
            codecs: CodecSet::new(),
            generation: 0,
            phase: Phase::Initializing,
        };

        let reader = Self {
            id,
            commands: commands_tx,
            state_rx,
            events,
        };

        Ok((reader, task))
    }

    /// Short identifier used in log lines
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ReaderState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<ReaderState> {
        self.state_rx.clone()
    }

    /// Subscribe to reader events
    pub fn subscribe(&self) -> broadcast::Receiver<ReaderEvent> {
        self.events.subscribe()
    }

    /// Start a fresh attempt after a non-retried error
    ///
    /// Ignored unless the reader is in the error state.
    pub fn restart(&self) {
        let _ = self.commands.send(Command::Restart);
    }

    /// Close the reader and release the transport
    ///
    /// Returns once teardown is complete. Calling it again is a no-op.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(Some(tx))).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

impl Drop for WebRtcReader {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close(None));
    }
}

/// Per-attempt state
struct Attempt {
    generation: u64,
    transport: Option<Arc<dyn PeerTransport>>,
    offer: Option<OfferData>,
    session_url: Option<Url>,
    queue: CandidateQueue,
    ready: bool,
    track_count: usize,
}

impl Attempt {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            transport: None,
            offer: None,
            session_url: None,
            queue: CandidateQueue::new(),
            ready: false,
            track_count: 0,
        }
    }
}

enum Phase {
    Initializing,
    Running(Attempt),
    Restarting { resume: Pin<Box<Sleep>> },
    Error,
    Closed,
}

impl Phase {
    fn state(&self) -> ReaderState {
        match self {
            Phase::Initializing => ReaderState::Initializing,
            Phase::Running(_) => ReaderState::Running,
            Phase::Restarting { .. } => ReaderState::Restarting,
            Phase::Error => ReaderState::Error,
            Phase::Closed => ReaderState::Closed,
        }
    }

    /// Running attempt with the given generation
    fn attempt_mut(&mut self, generation: u64) -> Option<&mut Attempt> {
        match self {
            Phase::Running(attempt) if attempt.generation == generation => Some(attempt),
            _ => None,
        }
    }
}

/// Local side of an attempt, ready to be sent
struct PreparedOffer {
    transport: Arc<dyn PeerTransport>,
    sdp: String,
    offer_data: OfferData,
}

/// Result of a spawned I/O step
enum Step {
    IceServers(Result<Vec<IceServer>>),
    OfferReady(Result<PreparedOffer>),
    Answer(Result<WhepAnswer>),
    AnswerApplied(Result<()>),
    CandidatesSent(Result<()>),
}

enum Input {
    Command(Option<Command>),
    Step(u64, Step),
    Transport(u64, TransportEvent),
    Resume,
}

struct ReaderTask {
    id: String,
    config: ReaderConfig,
    whep: WhepClient,
    factory: Arc<dyn TransportFactory>,
    events: Arc<EventBus>,
    state_tx: watch::Sender<ReaderState>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbox_tx: mpsc::UnboundedSender<(u64, Step)>,
    inbox: mpsc::UnboundedReceiver<(u64, Step)>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    transport_events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    codecs: CodecSet,
    generation: u64,
    phase: Phase,
}

fn spawn_step<F>(inbox: &mpsc::UnboundedSender<(u64, Step)>, generation: u64, step: F)
where
    F: Future<Output = Step> + Send + 'static,
{
    let inbox = inbox.clone();
    tokio::spawn(async move {
        let _ = inbox.send((generation, step.await));
    });
}

impl ReaderTask {
    async fn run(mut self) {
        let factory = self.factory.clone();
        let payload_type = self.config.probe_payload_type;
        let mut probe = tokio::spawn(async move { probe_all(factory.as_ref(), payload_type).await });

        loop {
            tokio::select! {
                result = &mut probe => {
                    self.codecs = result.unwrap_or_else(|e| {
                        warn!("Reader {} codec probe aborted: {}", self.id, e);
                        CodecSet::new()
                    });
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Restart) => debug!("Reader {} ignoring restart while probing", self.id),
                    Some(Command::Close(ack)) => return self.close(ack).await,
                    None => return self.close(None).await,
                },
            }
        }

        if matches!(self.phase, Phase::Initializing) {
            self.start_attempt();
        }

        loop {
            match self.next_input().await {
                Input::Command(Some(Command::Close(ack))) => return self.close(ack).await,
                Input::Command(Some(Command::Restart)) => self.restart(),
                Input::Command(None) => return self.close(None).await,
                Input::Step(generation, step) => self.handle_step(generation, step).await,
                Input::Transport(generation, event) => {
                    self.handle_transport_event(generation, event).await
                }
                Input::Resume => {
                    info!("Reader {} retrying", self.id);
                    self.start_attempt();
                }
            }
        }
    }

    async fn next_input(&mut self) -> Input {
        let phase = &mut self.phase;
        let resume = async move {
            match phase {
                Phase::Restarting { resume } => resume.as_mut().await,
                _ => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            command = self.commands.recv() => Input::Command(command),
            Some((generation, event)) = self.transport_events.recv() => Input::Transport(generation, event),
            Some((generation, step)) = self.inbox.recv() => Input::Step(generation, step),
            _ = resume => Input::Resume,
        }
    }

    fn set_phase(&mut self, phase: Phase) -> Phase {
        let old = std::mem::replace(&mut self.phase, phase);
        let state = self.phase.state();
        if old.state() != state {
            debug!("Reader {} state: {} -> {}", self.id, old.state(), state);
        }
        self.state_tx.send_replace(state);
        old
    }

    fn current(&mut self, generation: u64) -> Option<&mut Attempt> {
        self.phase.attempt_mut(generation)
    }

    fn start_attempt(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        info!("Reader {} starting attempt {}", self.id, generation);

        self.set_phase(Phase::Running(Attempt::new(generation)));

        let whep = self.whep.clone();
        spawn_step(&self.inbox_tx, generation, async move {
            Step::IceServers(whep.request_ice_servers().await)
        });
    }

    fn restart(&mut self) {
        if matches!(self.phase, Phase::Error) {
            info!("Reader {} restarting on request", self.id);
            self.start_attempt();
        } else {
            debug!("Reader {} ignoring restart in state {}", self.id, self.phase.state());
        }
    }

    async fn handle_step(&mut self, generation: u64, step: Step) {
        let Some(attempt) = self.phase.attempt_mut(generation) else {
            debug!("Reader {} dropping stale result of attempt {}", self.id, generation);
            if let Step::OfferReady(Ok(prepared)) = step {
                close_transport(&self.id, prepared.transport).await;
            }
            return;
        };

        match step {
            Step::IceServers(Ok(ice_servers)) => {
                let factory = self.factory.clone();
                let events = TransportEventSender::new(generation, self.transport_tx.clone());
                let codecs = self.codecs.clone();
                spawn_step(&self.inbox_tx, generation, async move {
                    Step::OfferReady(prepare_offer(factory, ice_servers, events, codecs).await)
                });
            }
            Step::OfferReady(Ok(prepared)) => {
                attempt.transport = Some(prepared.transport);
                attempt.offer = Some(prepared.offer_data);
                let whep = self.whep.clone();
                let sdp = prepared.sdp;
                spawn_step(&self.inbox_tx, generation, async move {
                    Step::Answer(whep.send_offer(&sdp).await)
                });
            }
            Step::Answer(Ok(answer)) => {
                attempt.session_url = Some(answer.session_url);
                let Some(transport) = attempt.transport.clone() else {
                    return;
                };
                trace!("Reader {} answer:\n{}", self.id, answer.sdp);
                let sdp = answer.sdp;
                spawn_step(&self.inbox_tx, generation, async move {
                    Step::AnswerApplied(transport.set_remote_description(&sdp).await)
                });
            }
            Step::AnswerApplied(Ok(())) => {
                let queued = attempt.queue.flush();
                debug!("Reader {} answer applied, {} queued candidate(s)", self.id, queued.len());
                if !queued.is_empty() {
                    self.send_candidates(generation, queued);
                }
            }
            Step::CandidatesSent(Ok(())) => {}
            Step::IceServers(Err(e))
            | Step::OfferReady(Err(e))
            | Step::Answer(Err(e))
            | Step::AnswerApplied(Err(e))
            | Step::CandidatesSent(Err(e)) => self.handle_failure(e).await,
        }
    }

    async fn handle_transport_event(&mut self, generation: u64, event: TransportEvent) {
        let Some(attempt) = self.phase.attempt_mut(generation) else {
            trace!("Reader {} dropping event of attempt {}", self.id, generation);
            return;
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => self.on_local_candidate(generation, candidate),
            TransportEvent::ConnectionState(state) => {
                info!("Reader {} peer connection state: {}", self.id, state);
                if state.is_terminal() {
                    self.handle_failure(AppError::TransportTerminated).await;
                } else {
                    self.check_ready(generation).await;
                }
            }
            TransportEvent::IceConnectionState(state) => {
                debug!("Reader {} ICE connection state: {}", self.id, state);
                self.check_ready(generation).await;
            }
            TransportEvent::Track(track) => {
                attempt.track_count += 1;
                info!(
                    "Reader {} received {} track {} ({})",
                    self.id, track.info.kind, track.info.id, track.info.mime_type
                );
                self.events.publish(ReaderEvent::Track(track));
                self.check_ready(generation).await;
            }
        }
    }

    fn on_local_candidate(&mut self, generation: u64, candidate: IceCandidate) {
        let Some(attempt) = self.current(generation) else {
            return;
        };

        if attempt.session_url.is_none() {
            attempt.queue.push(candidate);
        } else {
            self.send_candidates(generation, vec![candidate]);
        }
    }

    fn send_candidates(&mut self, generation: u64, candidates: Vec<IceCandidate>) {
        let Some(attempt) = self.current(generation) else {
            return;
        };
        let (Some(session_url), Some(offer)) = (attempt.session_url.clone(), attempt.offer.as_ref())
        else {
            return;
        };
        let fragment = generate_sdp_fragment(offer, &candidates);

        let whep = self.whep.clone();
        spawn_step(&self.inbox_tx, generation, async move {
            Step::CandidatesSent(whep.send_candidates(&session_url, fragment).await)
        });
    }

    /// Publish readiness once per attempt
    async fn check_ready(&mut self, generation: u64) {
        let Some(attempt) = self.current(generation) else {
            return;
        };
        if attempt.ready || attempt.track_count == 0 {
            return;
        }
        let Some(transport) = attempt.transport.clone() else {
            return;
        };

        let connected = transport.connection_state() == ConnectionState::Connected
            || transport.ice_connection_state().is_connected();
        if !connected {
            return;
        }

        attempt.ready = true;
        let track_count = attempt.track_count;
        let streams = transport.live_tracks().await;

        info!("Reader {} ready with {} track(s)", self.id, track_count);
        self.events.publish(ReaderEvent::Ready(ReadyInfo {
            streams,
            track_count,
        }));
    }

    /// Single entry point for every failure
    async fn handle_failure(&mut self, err: AppError) {
        match self.phase.state() {
            ReaderState::Running => {
                let message = format!("{}{}", err, RETRY_SUFFIX);
                warn!("Reader {} error: {}", self.id, message);

                let resume = Box::pin(tokio::time::sleep(self.config.retry_pause()));
                let old = self.set_phase(Phase::Restarting { resume });
                self.teardown(old).await;
                self.events.publish(ReaderEvent::Error(message));
            }
            ReaderState::Initializing => {
                warn!("Reader {} error: {}", self.id, err);

                let old = self.set_phase(Phase::Error);
                self.teardown(old).await;
                self.events.publish(ReaderEvent::Error(err.to_string()));
            }
            state => {
                debug!("Reader {} ignoring error in state {}: {}", self.id, state, err);
            }
        }
    }

    /// Release the transport of a replaced phase
    async fn teardown(&self, old: Phase) -> Option<Url> {
        let Phase::Running(attempt) = old else {
            return None;
        };
        if let Some(transport) = attempt.transport {
            close_transport(&self.id, transport).await;
        }
        attempt.session_url
    }

    async fn close(mut self, ack: Option<oneshot::Sender<()>>) {
        let old = self.set_phase(Phase::Closed);
        let session_url = self.teardown(old).await;

        if self.config.delete_session_on_close {
            if let Some(url) = session_url {
                if let Err(e) = self.whep.delete_session(&url).await {
                    debug!("Reader {} failed to delete session: {}", self.id, e);
                }
            }
        }

        info!("Reader {} closed", self.id);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}

async fn close_transport(id: &str, transport: Arc<dyn PeerTransport>) {
    if let Err(e) = transport.close().await {
        debug!("Reader {} failed to close transport: {}", id, e);
    }
}

/// Create the transport and apply the edited local offer
///
/// The transport is closed again when any step fails.
async fn prepare_offer(
    factory: Arc<dyn TransportFactory>,
    ice_servers: Vec<IceServer>,
    events: TransportEventSender,
    codecs: CodecSet,
) -> Result<PreparedOffer> {
    let transport = factory.create(&ice_servers, events).await?;

    match apply_local_offer(transport.as_ref(), &codecs).await {
        Ok((sdp, offer_data)) => Ok(PreparedOffer {
            transport,
            sdp,
            offer_data,
        }),
        Err(e) => {
            let _ = transport.close().await;
            Err(e)
        }
    }
}

pub(crate) async fn apply_local_offer(
    transport: &dyn PeerTransport,
    codecs: &CodecSet,
) -> Result<(String, OfferData)> {
    transport.add_recvonly_transceiver(MediaKind::Video).await?;
    transport.add_recvonly_transceiver(MediaKind::Audio).await?;

    let offer = transport.create_offer().await?;
    let sdp = edit_offer(&offer, codecs)?;
    let offer_data = OfferData::parse(&sdp);
    transport.set_local_description(&sdp).await?;

    Ok((sdp, offer_data))
}
