//! Per-client proxy connection.
//!
//! One `ProxyConnection` owns the inbound client socket, the downstream
//! target slots, and the echo correlation cache. Events fan out to every
//! enabled target; echoed frames route to the single target that issued the
//! echo. Target slot indexes are 1-based; index 0 is the proxy itself and is
//! used to deliver locally synthesized frames to the client.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use onemux_core::{
    ConnectionConfig, Direction, EnvelopeKind, ProxyHooks, TargetEndpoint, envelope,
};
use onemux_sakoya as sakoya;

use crate::echo::EchoCache;
use crate::target::{RecvOutcome, TargetReader, TargetWriter, dial};

/// Immediate retry phase: one attempt every 3 s, at most 40 attempts.
const NEAR_ATTEMPTS: u32 = 40;
const NEAR_DELAY: Duration = Duration::from_secs(3);
/// Long retry phase afterwards, for as long as the client stays connected.
const FAR_DELAY: Duration = Duration::from_secs(600);
/// Non-Sakoya targets get this long to register before traffic resumes.
const SETTLE_DELAY: Duration = Duration::from_secs(5);
/// Grace period before the first reconnect when the initial dial fails.
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Aggregate deadline for closing all target sockets on shutdown.
const CLOSE_DEADLINE: Duration = Duration::from_secs(3);
/// Keepalive ping interval on the client socket.
const PING_INTERVAL: Duration = Duration::from_secs(300);

/// One downstream slot: the endpoint snapshot, the current writer half, and
/// the lock serializing reconnect attempts. Disabled slots carry no lock and
/// never connect.
struct TargetSlot {
    index: usize,
    endpoint: TargetEndpoint,
    generation: u64,
    writer: tokio::sync::Mutex<Option<TargetWriter>>,
    reconnect_lock: Option<tokio::sync::Mutex<()>>,
}

impl TargetSlot {
    fn new(index: usize, endpoint: TargetEndpoint, generation: u64) -> Self {
        let reconnect_lock = (!endpoint.is_disabled()).then(|| tokio::sync::Mutex::new(()));
        Self {
            index,
            endpoint,
            generation,
            writer: tokio::sync::Mutex::new(None),
            reconnect_lock,
        }
    }
}

/// A single client session multiplexed onto N targets.
pub struct ProxyConnection {
    id: String,
    hooks: ProxyHooks,
    config: parking_lot::RwLock<ConnectionConfig>,
    client_headers: HashMap<String, String>,
    client_tx: mpsc::Sender<Message>,
    client_rx: parking_lot::Mutex<Option<mpsc::Receiver<Message>>>,
    client_open: AtomicBool,
    reloading: AtomicBool,
    generation: AtomicU64,
    self_id: parking_lot::Mutex<Option<i64>>,
    first_frame: parking_lot::Mutex<Option<String>>,
    echo_cache: parking_lot::Mutex<EchoCache>,
    slots: tokio::sync::RwLock<Vec<Arc<TargetSlot>>>,
    shutdown: CancellationToken,
}

impl ProxyConnection {
    /// Creates a connection for an accepted client socket. `client_headers`
    /// are the lowercased handshake headers, propagated on target dials.
    pub fn new(
        id: impl Into<String>,
        config: ConnectionConfig,
        client_headers: HashMap<String, String>,
        hooks: ProxyHooks,
    ) -> Arc<Self> {
        let (client_tx, client_rx) = mpsc::channel(256);
        Arc::new(Self {
            id: id.into(),
            hooks,
            config: parking_lot::RwLock::new(config),
            client_headers,
            client_tx,
            client_rx: parking_lot::Mutex::new(Some(client_rx)),
            client_open: AtomicBool::new(true),
            reloading: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            self_id: parking_lot::Mutex::new(None),
            first_frame: parking_lot::Mutex::new(None),
            echo_cache: parking_lot::Mutex::new(EchoCache::new()),
            slots: tokio::sync::RwLock::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Whether the client socket is still attached. The router uses this to
    /// reject a second client for the same connection id.
    pub fn is_client_open(&self) -> bool {
        self.client_open.load(Ordering::SeqCst)
    }

    /// Whether `new_config` carries a different target set than the live one.
    pub fn targets_differ(&self, new_config: &ConnectionConfig) -> bool {
        self.config.read().target_endpoints != new_config.target_endpoints
    }

    /// Drives the session until the client disconnects or `stop` is called.
    ///
    /// The first client frame is read before any target is dialed: some
    /// frameworks embed their registration in it and expect targets to see
    /// it on connect.
    pub async fn run(self: Arc<Self>, socket: WebSocket) {
        let Some(client_rx) = self.client_rx.lock().take() else {
            error!(connection_id = %self.id, "connection already running");
            return;
        };

        let (ws_tx, mut ws_rx) = socket.split();
        tokio::spawn(client_writer_loop(
            ws_tx,
            client_rx,
            self.shutdown.clone(),
            self.id.clone(),
        ));

        let first = loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => break text.to_string(),
                Some(Ok(Message::Binary(data))) => {
                    break String::from_utf8_lossy(&data).into_owned();
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.client_tx.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    info!(connection_id = %self.id, "client left before registering");
                    self.stop().await;
                    return;
                }
                Some(Err(e)) => {
                    warn!(connection_id = %self.id, error = %e, "client socket error before registration");
                    self.stop().await;
                    return;
                }
            }
        };
        *self.first_frame.lock() = Some(first.clone());

        self.connect_targets(false).await;

        // the registration frame flows through the normal pipeline once
        self.handle_client_frame(&first).await;

        let self_id = *self.self_id.lock();
        if let Some(notice) = self.hooks.command.startup_notice(self_id) {
            self.deliver_from_target(notice, 0).await;
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_client_frame(text.as_str()).await,
                    Some(Ok(Message::Binary(data))) => {
                        let text = String::from_utf8_lossy(&data).into_owned();
                        self.handle_client_frame(&text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = self.client_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        info!(connection_id = %self.id, ?frame, "client closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %self.id, error = %e, "client socket error");
                        break;
                    }
                    None => break,
                }
            }
        }

        self.stop().await;
    }

    /// Rebuilds the slot array from the current config and dials every
    /// enabled slot. With `replay_each`, the retained first frame is sent to
    /// each freshly dialed target before its receive loop starts.
    async fn connect_targets(self: &Arc<Self>, replay_each: bool) {
        let generation = self.generation.load(Ordering::SeqCst);
        let endpoints = self.config.read().target_endpoints.clone();

        let mut slots = Vec::with_capacity(endpoints.len());
        let mut connected = Vec::new();
        let mut failed = Vec::new();

        for (i, endpoint) in endpoints.into_iter().enumerate() {
            let index = i + 1;
            let slot = Arc::new(TargetSlot::new(index, endpoint.clone(), generation));
            if endpoint.is_disabled() {
                info!(connection_id = %self.id, target = index, "target disabled, not connecting");
                slots.push(slot);
                continue;
            }
            match dial(&endpoint, &self.client_headers).await {
                Ok((writer, reader)) => {
                    *slot.writer.lock().await = Some(writer);
                    info!(connection_id = %self.id, target = index, url = %endpoint.url(), "connected to target");
                    connected.push((slot.clone(), reader));
                }
                Err(e) => {
                    error!(connection_id = %self.id, target = index, error = %e, "target dial failed, scheduling reconnect");
                    failed.push(slot.clone());
                }
            }
            slots.push(slot);
        }

        *self.slots.write().await = slots;

        if replay_each {
            for (slot, _) in &connected {
                self.replay_first_frame_to(slot).await;
            }
        }
        for (slot, reader) in connected {
            self.spawn_recv_loop(slot, reader);
        }
        for slot in failed {
            self.spawn_reconnect(slot, INITIAL_RETRY_DELAY);
        }
    }

    /// Processes one frame from the client socket.
    async fn handle_client_frame(&self, text: &str) {
        let frame = match envelope::parse_frame(text) {
            Ok(v) => v,
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                warn!(connection_id = %self.id, error = %e, preview, "dropping non-JSON client frame");
                return;
            }
        };

        // clients occasionally switch accounts; nothing downstream survives
        // that, so it is surfaced loudly but the session stays up
        if let Some(observed) = envelope::self_id(&frame) {
            let mut current = self.self_id.lock();
            if let Some(previous) = *current
                && previous != observed
            {
                warn!(
                    connection_id = %self.id,
                    previous, observed,
                    "client self_id changed, restart this connection to re-register"
                );
            }
            *current = Some(observed);
        }

        let frame = self.hooks.command.preprocess(frame).await;

        match envelope::classify(&frame) {
            EnvelopeKind::ApiResponse if envelope::is_success_response(&frame) => {
                // a send succeeded: reconstruct the message from the cached
                // call and persist it as outbound traffic
                if let Some(echo) = envelope::echo_of(&frame) {
                    let call = self
                        .echo_cache
                        .lock()
                        .peek(&echo)
                        .map(|entry| entry.original_call.clone());
                    if let Some(call) = call
                        && envelope::action(&call).is_some_and(envelope::is_send_action)
                    {
                        let message_id = frame.pointer("/data/message_id").cloned();
                        let pseudo = envelope::synthesize_message_sent(
                            &call,
                            *self.self_id.lock(),
                            message_id,
                        );
                        self.hooks
                            .persistence
                            .save_message(&pseudo, Direction::Send, &self.id)
                            .await;
                    }
                }
            }
            EnvelopeKind::ApiResponse => {
                let call = envelope::echo_of(&frame).and_then(|echo| {
                    self.echo_cache
                        .lock()
                        .peek(&echo)
                        .map(|entry| envelope::compact_preview(&entry.original_call, 200))
                });
                warn!(
                    connection_id = %self.id,
                    call = call.as_deref().unwrap_or("<unknown>"),
                    response = %envelope::compact_preview(&frame, 200),
                    "API call failed"
                );
            }
            _ => {
                self.hooks
                    .persistence
                    .save_message(&frame, Direction::Recv, &self.id)
                    .await;
            }
        }

        if let Some(response) = self.hooks.command.handle(&frame).await {
            debug!(connection_id = %self.id, "event answered locally, not forwarding");
            self.deliver_from_target(response, 0).await;
            return;
        }

        self.forward_to_targets(frame).await;
    }

    /// Routes a client frame downstream: echoed frames go to the single
    /// target that issued the echo, everything else fans out.
    async fn forward_to_targets(&self, frame: Value) {
        if let Some(echo) = envelope::echo_of(&frame) {
            let entry = self.echo_cache.lock().take(&echo);
            let Some(entry) = entry else {
                warn!(connection_id = %self.id, echo, "no target registered for echo, dropping frame");
                return;
            };
            let slot = self.slot_at(entry.target_index).await;
            let Some(slot) = slot else {
                warn!(connection_id = %self.id, target = entry.target_index, "echo target no longer exists");
                return;
            };
            let mut writer = slot.writer.lock().await;
            match writer.as_mut() {
                Some(w) => {
                    debug!(connection_id = %self.id, target = slot.index, echo, "routing echoed frame");
                    if let Err(e) = w.send_envelope(&frame).await {
                        warn!(connection_id = %self.id, target = slot.index, error = %e, "send to target failed");
                    }
                }
                None => {
                    warn!(connection_id = %self.id, target = slot.index, "echo target offline, dropping frame");
                }
            }
            return;
        }

        let action = envelope::action(&frame).unwrap_or_default();
        let post_type = envelope::post_type(&frame).unwrap_or_default();
        // dialect backends only want message traffic; lifecycle chatter is
        // suppressed for them
        let skip_sakoya = sakoya::is_passthrough_action(action) || post_type == "meta_event";

        let slots: Vec<Arc<TargetSlot>> = self.slots.read().await.clone();
        for slot in slots {
            if slot.endpoint.is_disabled() {
                continue;
            }
            if skip_sakoya && slot.endpoint.is_sakoya() {
                debug!(connection_id = %self.id, target = slot.index, post_type, action, "skipping dialect target");
                continue;
            }
            let mut writer = slot.writer.lock().await;
            if let Some(w) = writer.as_mut()
                && let Err(e) = w.send_envelope(&frame).await
            {
                warn!(connection_id = %self.id, target = slot.index, error = %e, "send to target failed");
            }
        }
    }

    /// Processes one frame from target `target_index` (0 for frames the
    /// proxy produced itself) and writes it to the client.
    async fn deliver_from_target(&self, frame: Value, target_index: usize) {
        if target_index > 0 {
            if let Some(echo) = envelope::echo_of(&frame) {
                // responses are not re-registered: their entry was consumed
                // when the originating call was routed
                if envelope::classify(&frame) != EnvelopeKind::ApiResponse {
                    self.echo_cache
                        .lock()
                        .record(target_index, &echo, frame.clone());
                }
            } else if envelope::action(&frame).is_some_and(envelope::is_send_action) {
                // echoless send calls still deserve an outbound record
                let pseudo =
                    envelope::synthesize_message_sent(&frame, *self.self_id.lock(), None);
                self.hooks
                    .persistence
                    .save_message(&pseudo, Direction::Send, &self.id)
                    .await;
            }
        }

        let self_id = *self.self_id.lock();
        let Some(frame) = self.hooks.command.postprocess(frame, self_id).await else {
            debug!(connection_id = %self.id, target = target_index, "frame dropped by postprocessing");
            return;
        };

        match serde_json::to_string(&frame) {
            Ok(json) => {
                if self.client_tx.send(Message::Text(json.into())).await.is_err() {
                    warn!(connection_id = %self.id, "client writer gone, shutting down");
                    self.shutdown.cancel();
                }
            }
            Err(e) => error!(connection_id = %self.id, error = %e, "frame serialization failed"),
        }
    }

    async fn slot_at(&self, target_index: usize) -> Option<Arc<TargetSlot>> {
        self.slots
            .read()
            .await
            .get(target_index.checked_sub(1)?)
            .cloned()
    }

    fn spawn_recv_loop(self: &Arc<Self>, slot: Arc<TargetSlot>, mut reader: TargetReader) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            debug!(connection_id = %conn.id, target = slot.index, "target receive loop started");
            loop {
                tokio::select! {
                    _ = conn.shutdown.cancelled() => return,
                    outcome = reader.next_frame() => {
                        let detail = match outcome {
                            RecvOutcome::Frame(text) => {
                                conn.handle_target_frame(&text, slot.index).await;
                                continue;
                            }
                            RecvOutcome::Closed { code, reason } => {
                                format!("closed by peer (code {code:?}, reason {reason:?})")
                            }
                            RecvOutcome::Error(e) => format!("socket error: {e}"),
                        };
                        let stale = conn.reloading.load(Ordering::SeqCst)
                            || conn.shutdown.is_cancelled()
                            || slot.generation != conn.generation.load(Ordering::SeqCst);
                        if stale {
                            debug!(connection_id = %conn.id, target = slot.index, detail, "target left during reload or shutdown");
                        } else {
                            warn!(connection_id = %conn.id, target = slot.index, detail, "target connection lost");
                            conn.spawn_reconnect(slot.clone(), Duration::ZERO);
                        }
                        return;
                    }
                }
            }
        });
    }

    async fn handle_target_frame(&self, text: &str, target_index: usize) {
        let frame = match envelope::parse_frame(text) {
            Ok(v) => v,
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                warn!(connection_id = %self.id, target = target_index, error = %e, preview, "dropping non-JSON target frame");
                return;
            }
        };
        self.deliver_from_target(frame, target_index).await;
    }

    /// Sends the retained registration frame to one slot's fresh socket.
    /// This path deliberately bypasses the hooks: the frame was already
    /// processed (and persisted) once when it first arrived.
    async fn replay_first_frame_to(&self, slot: &TargetSlot) {
        let Some(first) = self.first_frame.lock().clone() else {
            return;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&first) else {
            return;
        };
        let mut writer = slot.writer.lock().await;
        if let Some(w) = writer.as_mut() {
            match w.send_envelope(&frame).await {
                Ok(()) => debug!(connection_id = %self.id, target = slot.index, "registration frame replayed"),
                Err(e) => warn!(connection_id = %self.id, target = slot.index, error = %e, "registration replay failed"),
            }
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, slot: Arc<TargetSlot>, delay: Duration) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() && !conn.sleep_unless_stopped(delay).await {
                return;
            }
            conn.reconnect_target(slot).await;
        });
    }

    /// Redial loop for one slot: a near phase of 40 attempts 3 s apart, then
    /// an indefinite far phase every 600 s while the client stays attached.
    async fn reconnect_target(self: Arc<Self>, slot: Arc<TargetSlot>) {
        let Some(lock) = slot.reconnect_lock.as_ref() else {
            debug!(connection_id = %self.id, target = slot.index, "disabled slot, no reconnect");
            return;
        };
        let _guard = lock.lock().await;

        info!(connection_id = %self.id, target = slot.index, "target down, retrying every 3s");
        for attempt in 1..=NEAR_ATTEMPTS {
            if !self.sleep_unless_stopped(NEAR_DELAY).await {
                return;
            }
            match self.try_redial(&slot).await {
                RedialOutcome::Done | RedialOutcome::Abort => return,
                RedialOutcome::Retry => {
                    debug!(connection_id = %self.id, target = slot.index, attempt, max = NEAR_ATTEMPTS, "redial failed");
                }
            }
        }

        info!(connection_id = %self.id, target = slot.index, "still down, retrying every 600s");
        loop {
            if !self.sleep_unless_stopped(FAR_DELAY).await {
                return;
            }
            match self.try_redial(&slot).await {
                RedialOutcome::Done | RedialOutcome::Abort => return,
                RedialOutcome::Retry => {}
            }
        }
    }

    async fn try_redial(self: &Arc<Self>, slot: &Arc<TargetSlot>) -> RedialOutcome {
        if self.shutdown.is_cancelled() || !self.is_client_open() {
            info!(connection_id = %self.id, target = slot.index, "client gone, abandoning reconnect");
            return RedialOutcome::Abort;
        }
        if self.reloading.load(Ordering::SeqCst) {
            info!(connection_id = %self.id, target = slot.index, "reload in progress, abandoning reconnect");
            return RedialOutcome::Abort;
        }
        if slot.generation != self.generation.load(Ordering::SeqCst) {
            debug!(connection_id = %self.id, target = slot.index, "slot superseded, abandoning reconnect");
            return RedialOutcome::Abort;
        }

        // the slot's config may have changed or been disabled since
        let endpoint = {
            let config = self.config.read();
            config.target_endpoints.get(slot.index - 1).cloned()
        };
        let Some(endpoint) = endpoint else {
            warn!(connection_id = %self.id, target = slot.index, "slot no longer configured, abandoning reconnect");
            return RedialOutcome::Abort;
        };
        if endpoint.is_disabled() {
            info!(connection_id = %self.id, target = slot.index, "target disabled, abandoning reconnect");
            return RedialOutcome::Abort;
        }

        match dial(&endpoint, &self.client_headers).await {
            Err(e) => {
                debug!(connection_id = %self.id, target = slot.index, error = %e, "redial attempt failed");
                RedialOutcome::Retry
            }
            Ok((writer, reader)) => {
                *slot.writer.lock().await = Some(writer);
                self.replay_first_frame_to(slot).await;
                if endpoint.is_sakoya() {
                    info!(connection_id = %self.id, target = slot.index, "target restored, forwarding resumes now");
                } else {
                    info!(connection_id = %self.id, target = slot.index, "target restored, forwarding resumes in 5s");
                    if !self.sleep_unless_stopped(SETTLE_DELAY).await {
                        return RedialOutcome::Abort;
                    }
                }
                self.spawn_recv_loop(slot.clone(), reader);
                RedialOutcome::Done
            }
        }
    }

    /// Tears the current target set down and rebuilds it from `new_config`
    /// without touching the client socket. The `reloading` flag plus a
    /// generation bump keep stale receive loops and reconnect tasks away
    /// from the new slot array.
    pub async fn reload_targets(self: &Arc<Self>, new_config: ConnectionConfig) {
        info!(connection_id = %self.id, "reloading target endpoints");
        self.reloading.store(true, Ordering::SeqCst);
        *self.config.write() = new_config;
        self.generation.fetch_add(1, Ordering::SeqCst);

        let old = std::mem::take(&mut *self.slots.write().await);
        for slot in old {
            if let Some(mut writer) = slot.writer.lock().await.take() {
                writer.close().await;
            }
        }

        self.connect_targets(true).await;
        self.reloading.store(false, Ordering::SeqCst);
        info!(connection_id = %self.id, "target endpoints reloaded");
    }

    /// Stops the session: cancels every child task, closes target sockets
    /// under an aggregate 3 s deadline, and lets the client writer shut the
    /// client socket. Pending echo entries die with the connection.
    pub async fn stop(&self) {
        if !self.client_open.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(connection_id = %self.id, "stopping proxy connection");
        self.shutdown.cancel();

        let slots = std::mem::take(&mut *self.slots.write().await);
        let close_all = async {
            for slot in &slots {
                if let Some(mut writer) = slot.writer.lock().await.take() {
                    writer.close().await;
                }
            }
        };
        if tokio::time::timeout(CLOSE_DEADLINE, close_all).await.is_err() {
            warn!(connection_id = %self.id, "timed out closing target sockets");
        }

        let pending = self.echo_cache.lock().len();
        if pending > 0 {
            debug!(connection_id = %self.id, pending, "dropping pending echo entries");
        }
        info!(connection_id = %self.id, "proxy connection stopped");
    }

    async fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

enum RedialOutcome {
    Done,
    Retry,
    Abort,
}

/// Single writer task for the client socket. All target receive loops funnel
/// through the channel, so writes never interleave. Also emits the
/// keepalive ping.
async fn client_writer_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
    connection_id: String,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_tx.close().await;
                return;
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    warn!(connection_id = %connection_id, "client ping failed, shutting down");
                    shutdown.cancel();
                    let _ = ws_tx.close().await;
                    return;
                }
            }
            message = rx.recv() => match message {
                Some(message) => {
                    if ws_tx.send(message).await.is_err() {
                        warn!(connection_id = %connection_id, "client write failed, shutting down");
                        shutdown.cancel();
                        let _ = ws_tx.close().await;
                        return;
                    }
                }
                None => {
                    let _ = ws_tx.close().await;
                    return;
                }
            }
        }
    }
}
