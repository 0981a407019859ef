//! The session object and its lifecycle state machine.
//!
//! A session joins client-side stream configuration to a set of audio
//! interface attachments. The first realized attachment opens the
//! graph; later ones extend it with add/change edits; detaching the
//! last realized attachment stops just that subgraph. Prepare, start
//! and stop order the graph against the devices by stream direction so
//! the data sink is always armed before the data source.

use std::sync::Arc;

use agm_core::{
    AgmError, BufferConfig, Direction, EventParams, EventRegistration, EventType, KeyVector,
    MediaConfig, Metadata, Result, StreamConfig, TagConfig,
};
use agm_device::DeviceState;
use agm_engine::{EngineEventCallback, StopProperties, TagModuleInfo};
use agm_graph::Graph;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::aif::{AifAttachment, AifState};
use crate::callback::{CallbackPool, SessionEventCallback};
use crate::manager::ServiceContext;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No graph exists.
    Closed,
    /// Graph opened with the staged attachments realized.
    Opened,
    /// Graph and devices prepared.
    Prepared,
    /// Data flowing.
    Started,
    /// Stopped after running.
    Stopped,
    /// Soft-paused while started.
    Paused,
}

struct SessionInner {
    metadata: Metadata,
    stream_config: StreamConfig,
    media_config: MediaConfig,
    buffer_config: BufferConfig,
    aifs: Vec<AifAttachment>,
    graph: Option<Graph>,
    cached_params: Option<Vec<u8>>,
    loopback_peer: u32,
    loopback_enabled: bool,
    ec_ref_aif: u32,
    ec_ref_enabled: bool,
    state: SessionState,
}

/// One client-visible audio stream.
///
/// The lifecycle lock guards everything except the callback pool,
/// which has its own lock so event delivery never contends with a
/// session API call.
pub struct Session {
    sess_id: u32,
    inner: Mutex<SessionInner>,
    callbacks: Mutex<CallbackPool>,
}

/// Merge of the session metadata with every attachment's pair and
/// device metadata.
fn full_metadata(inner: &SessionInner) -> Metadata {
    let mut bundles = vec![inner.metadata.clone()];
    for aif in &inner.aifs {
        bundles.push(aif.metadata.clone());
        bundles.push(aif.device.metadata());
    }
    Metadata::merge(bundles.iter())
}

/// As [`full_metadata`], without the device bundles. Used for the
/// echo-reference edge, which brings its own device metadata.
fn metadata_without_devices(inner: &SessionInner) -> Metadata {
    let mut bundles = vec![inner.metadata.clone()];
    for aif in &inner.aifs {
        bundles.push(aif.metadata.clone());
    }
    Metadata::merge(bundles.iter())
}

fn realized_count(inner: &SessionInner) -> usize {
    inner
        .aifs
        .iter()
        .filter(|aif| aif.state.is_realized())
        .count()
}

fn graph_of(inner: &SessionInner) -> Result<&Graph> {
    inner
        .graph
        .as_ref()
        .ok_or_else(|| AgmError::invalid_state("session has no graph"))
}

fn record_err(result: Result<()>, first: &mut Option<AgmError>) {
    if let Err(err) = result {
        warn!(%err, "best-effort teardown step failed");
        if first.is_none() {
            *first = Some(err);
        }
    }
}

impl Session {
    pub(crate) fn new(sess_id: u32) -> Self {
        Self {
            sess_id,
            inner: Mutex::new(SessionInner {
                metadata: Metadata::default(),
                stream_config: StreamConfig::default(),
                media_config: MediaConfig::default(),
                buffer_config: BufferConfig::default(),
                aifs: Vec::new(),
                graph: None,
                cached_params: None,
                loopback_peer: 0,
                loopback_enabled: false,
                ec_ref_aif: 0,
                ec_ref_enabled: false,
                state: SessionState::Closed,
            }),
            callbacks: Mutex::new(CallbackPool::default()),
        }
    }

    /// Session id.
    pub fn id(&self) -> u32 {
        self.sess_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Connection state of one attachment, if it exists.
    pub fn aif_state(&self, aif_id: u32) -> Option<AifState> {
        self.inner
            .lock()
            .aifs
            .iter()
            .find(|aif| aif.aif_id == aif_id)
            .map(|aif| aif.state)
    }

    pub(crate) fn full_metadata(&self) -> Metadata {
        full_metadata(&self.inner.lock())
    }

    /// Replace the session-level metadata bundle.
    pub fn set_metadata(&self, metadata: Metadata) {
        self.inner.lock().metadata = metadata;
    }

    /// Replace the session-AIF pair metadata, creating the attachment
    /// if needed.
    pub fn set_aif_metadata(
        &self,
        ctx: &ServiceContext,
        aif_id: u32,
        metadata: Metadata,
    ) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let idx = ensure_attachment(inner, ctx, aif_id)?;
        inner.aifs[idx].metadata = metadata;
        Ok(())
    }

    /// Store the stream, media and buffer configuration.
    pub fn set_config(
        &self,
        stream_config: &StreamConfig,
        media_config: &MediaConfig,
        buffer_config: &BufferConfig,
    ) {
        let inner = &mut *self.inner.lock();
        inner.stream_config = *stream_config;
        inner.media_config = *media_config;
        inner.buffer_config = *buffer_config;
        if let Some(graph) = &inner.graph {
            graph.update_session_config(*stream_config, *media_config, *buffer_config);
        }
    }

    /// Stage or realize a connection between this session and an audio
    /// interface.
    pub fn connect_aif(&self, ctx: &Arc<ServiceContext>, aif_id: u32, enable: bool) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let idx = ensure_attachment(inner, ctx, aif_id)?;
        let aif_state = inner.aifs[idx].state;

        if enable && aif_state.is_realized() {
            return Err(AgmError::already(format!("aif {aif_id} already connected")));
        }
        if !enable && matches!(aif_state, AifState::Close | AifState::Closed) {
            return Err(AgmError::already(format!(
                "aif {aif_id} already disconnected"
            )));
        }

        let opened_count = realized_count(inner);

        if enable {
            match inner.state {
                SessionState::Closed => inner.aifs[idx].state = AifState::Open,
                SessionState::Opened => {
                    self.attach(inner, ctx, idx, opened_count)?;
                    inner.aifs[idx].state = AifState::Opened;
                }
                SessionState::Prepared | SessionState::Stopped => {
                    self.attach(inner, ctx, idx, opened_count)?;
                    inner.aifs[idx].state = AifState::Opened;
                    if let Err(err) = self.prepare_locked(inner) {
                        self.unwind_attach(inner, idx);
                        return Err(err);
                    }
                }
                SessionState::Started => {
                    self.attach(inner, ctx, idx, opened_count)?;
                    inner.aifs[idx].state = AifState::Opened;
                    let brought_up = self
                        .prepare_locked(inner)
                        .and_then(|()| self.start_locked(inner, ctx));
                    if let Err(err) = brought_up {
                        self.unwind_attach(inner, idx);
                        return Err(err);
                    }
                }
                SessionState::Paused => {
                    return Err(AgmError::invalid_state("connect while paused"));
                }
            }
        } else {
            match inner.state {
                SessionState::Closed => inner.aifs[idx].state = AifState::Close,
                SessionState::Paused => {
                    return Err(AgmError::invalid_state("disconnect while paused"));
                }
                _ => {
                    inner.aifs[idx].state = AifState::Close;
                    self.detach(inner, idx, opened_count)?;
                    inner.aifs[idx].state = AifState::Closed;
                }
            }
        }
        Ok(())
    }

    /// Realize every staged attachment and bring the session to
    /// `Opened`. Requires at least one attachment staged on.
    pub fn open(&self, ctx: &Arc<ServiceContext>) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if inner.state != SessionState::Closed {
            return Err(AgmError::already(format!(
                "session {} already open",
                self.sess_id
            )));
        }

        let first = inner
            .aifs
            .iter()
            .position(|aif| aif.state == AifState::Open)
            .ok_or(AgmError::NoAifAttached)?;
        self.attach(inner, ctx, first, 0)?;
        inner.aifs[first].state = AifState::Opened;

        let mut opened = 1;
        let pending: Vec<usize> = inner
            .aifs
            .iter()
            .enumerate()
            .filter(|(_, aif)| aif.state == AifState::Open)
            .map(|(idx, _)| idx)
            .collect();
        for idx in pending {
            if let Err(err) = self.attach(inner, ctx, idx, opened) {
                self.unwind_open(inner);
                return Err(err);
            }
            inner.aifs[idx].state = AifState::Opened;
            opened += 1;
        }

        if inner.loopback_enabled {
            let peer = inner.loopback_peer;
            if let Err(err) = self.realize_loopback(inner, ctx, peer, true) {
                self.unwind_open(inner);
                return Err(err);
            }
        }
        if inner.ec_ref_enabled {
            let aif = inner.ec_ref_aif;
            if let Err(err) = self.realize_ec_ref(inner, ctx, aif, true) {
                self.unwind_open(inner);
                return Err(err);
            }
        }

        inner.state = SessionState::Opened;
        Ok(())
    }

    /// Prepare the graph and every realized device, ordered by
    /// direction: capture arms the graph first, playback the devices.
    pub fn prepare(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if !matches!(
            inner.state,
            SessionState::Opened | SessionState::Prepared | SessionState::Stopped
        ) {
            return Err(AgmError::invalid_state(format!(
                "prepare from {:?}",
                inner.state
            )));
        }
        self.prepare_locked(inner)
    }

    /// Start the graph and every realized device, with the same
    /// direction-ordered arming as prepare.
    pub fn start(&self, ctx: &Arc<ServiceContext>) -> Result<()> {
        let inner = &mut *self.inner.lock();
        match inner.state {
            SessionState::Opened => {
                self.prepare_locked(inner)?;
                self.start_locked(inner, ctx)
            }
            SessionState::Prepared | SessionState::Stopped => self.start_locked(inner, ctx),
            state => Err(AgmError::invalid_state(format!("start from {state:?}"))),
        }
    }

    /// Stop the data flow. Best-effort: every stop is attempted and
    /// the first error is returned.
    pub fn stop(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if inner.state != SessionState::Started {
            return Err(AgmError::invalid_state(format!(
                "stop from {:?}",
                inner.state
            )));
        }
        let direction = inner.stream_config.direction;
        let mut first_err = None;

        if direction == Direction::Rx {
            record_err(graph_of(inner)?.stop(None), &mut first_err);
        }
        for aif in &mut inner.aifs {
            if aif.state == AifState::Started {
                record_err(aif.device.stop(), &mut first_err);
                aif.state = AifState::Stopped;
            }
        }
        if direction == Direction::Tx {
            record_err(graph_of(inner)?.stop(None), &mut first_err);
        }

        inner.state = SessionState::Stopped;
        first_err.map_or(Ok(()), Err)
    }

    /// Tear the session down to `Closed`. Best-effort past the first
    /// step; the session always ends closed.
    pub fn close(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(AgmError::already(format!(
                "session {} already closed",
                self.sess_id
            )));
        }

        if inner.state == SessionState::Started {
            if let Ok(graph) = graph_of(inner) {
                if let Err(err) = graph.stop(None) {
                    warn!(sess = self.sess_id, %err, "stopping graph at close");
                }
            }
        }

        // Dropping the graph releases the engine handle even when the
        // engine objects to the teardown.
        inner.graph = None;

        for aif in &mut inner.aifs {
            if aif.state.is_realized() {
                if let Err(err) = aif.device.close() {
                    warn!(sess = self.sess_id, aif = aif.aif_id, %err, "closing device");
                }
                aif.state = AifState::Closed;
            }
        }
        inner.state = SessionState::Closed;
        Ok(())
    }

    /// Soft-pause a started session.
    pub fn pause(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if inner.state != SessionState::Started {
            return Err(AgmError::invalid_state(format!(
                "pause from {:?}",
                inner.state
            )));
        }
        graph_of(inner)?.pause()?;
        inner.state = SessionState::Paused;
        Ok(())
    }

    /// Resume a paused session.
    pub fn resume(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if inner.state != SessionState::Paused {
            return Err(AgmError::invalid_state(format!(
                "resume from {:?}",
                inner.state
            )));
        }
        graph_of(inner)?.resume()?;
        inner.state = SessionState::Started;
        Ok(())
    }

    /// Stage or realize a loopback edge into a playback session's
    /// graph.
    pub fn set_loopback(&self, ctx: &Arc<ServiceContext>, peer_id: u32, enable: bool) -> Result<()> {
        if peer_id == self.sess_id {
            return Err(AgmError::invalid_argument(
                "loopback peer must be a different session",
            ));
        }
        let inner = &mut *self.inner.lock();
        if peer_id == inner.loopback_peer && enable == inner.loopback_enabled {
            return Err(AgmError::already(format!(
                "loopback already {} for session {}",
                if enable { "enabled" } else { "disabled" },
                self.sess_id
            )));
        }

        if matches!(
            inner.state,
            SessionState::Opened
                | SessionState::Prepared
                | SessionState::Started
                | SessionState::Stopped
        ) {
            // Disable targets the edge recorded earlier, not the peer
            // named in this call.
            let target = if enable { peer_id } else { inner.loopback_peer };
            self.realize_loopback(inner, ctx, target, enable)?;
        }

        inner.loopback_peer = peer_id;
        inner.loopback_enabled = enable;
        Ok(())
    }

    /// Stage or realize an echo-reference edge from an RX device into
    /// this capture session.
    pub fn set_ec_ref(&self, ctx: &Arc<ServiceContext>, aif_id: u32, enable: bool) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if aif_id == inner.ec_ref_aif && enable == inner.ec_ref_enabled {
            return Err(AgmError::already(format!(
                "echo reference already {} for session {}",
                if enable { "enabled" } else { "disabled" },
                self.sess_id
            )));
        }

        if matches!(
            inner.state,
            SessionState::Opened
                | SessionState::Prepared
                | SessionState::Started
                | SessionState::Stopped
        ) {
            let target = if enable { aif_id } else { inner.ec_ref_aif };
            self.realize_ec_ref(inner, ctx, target, enable)?;
        }

        inner.ec_ref_aif = aif_id;
        inner.ec_ref_enabled = enable;
        Ok(())
    }

    /// Cache session-level params; push them immediately when a graph
    /// exists.
    pub fn set_params(&self, payload: &[u8]) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner.cached_params = Some(payload.to_vec());
        if inner.state != SessionState::Closed {
            if let Err(err) = graph_of(inner)?.set_config(payload) {
                inner.cached_params = None;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Cache per-AIF params; push them immediately when the attachment
    /// is realized.
    pub fn set_aif_params(&self, ctx: &ServiceContext, aif_id: u32, payload: &[u8]) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let idx = ensure_attachment(inner, ctx, aif_id)?;
        inner.aifs[idx].cached_params = Some(payload.to_vec());
        if inner.state != SessionState::Closed && inner.aifs[idx].state.is_realized() {
            if let Err(err) = graph_of(inner)?.set_config(payload) {
                inner.aifs[idx].cached_params = None;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Push a tag-scoped parameter set under the merged key vector of
    /// one attachment.
    pub fn set_params_with_tag(
        &self,
        ctx: &ServiceContext,
        aif_id: u32,
        tag_config: &TagConfig,
    ) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let idx = ensure_attachment(inner, ctx, aif_id)?;
        let merged = inner.aifs[idx].merged_with(&inner.metadata);
        graph_of(inner)?.set_tagged_config(&merged.gkv, tag_config.tag, &tag_config.tkv)
    }

    /// Apply a calibration patch to the session, pair and device
    /// bundles, then hand the merged result to the engine.
    pub fn set_cal(&self, ctx: &ServiceContext, aif_id: u32, ckv: &KeyVector) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let idx = ensure_attachment(inner, ctx, aif_id)?;
        if inner.state == SessionState::Closed || !inner.aifs[idx].state.is_realized() {
            return Err(AgmError::invalid_state(
                "calibration needs a realized attachment",
            ));
        }

        inner.metadata.update_cal(ckv);
        inner.aifs[idx].metadata.update_cal(ckv);
        inner.aifs[idx].device.update_cal(ckv);

        let merged = inner.aifs[idx].merged_with(&inner.metadata);
        graph_of(inner)?.set_cal(&merged)
    }

    /// Round-trip a custom-config query through the graph.
    pub fn get_params(&self, request: &[u8]) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(AgmError::invalid_state("get params on a closed session"));
        }
        graph_of(&inner)?.get_config(request)
    }

    /// Tag-to-module mapping under the merged key vector of one
    /// attachment.
    pub fn tag_module_info(
        &self,
        ctx: &ServiceContext,
        aif_id: u32,
    ) -> Result<Vec<TagModuleInfo>> {
        let inner = &mut *self.inner.lock();
        let idx = ensure_attachment(inner, ctx, aif_id)?;
        let merged = inner.aifs[idx].merged_with(&inner.metadata);
        ctx.engine.tag_module_info(&merged.gkv)
    }

    /// Subscribe (`Some`) or unsubscribe (`None`, matched on event
    /// type and client data) an event callback.
    pub fn register_callback(
        &self,
        callback: Option<SessionEventCallback>,
        event_type: EventType,
        client_data: u64,
    ) {
        let mut pool = self.callbacks.lock();
        match callback {
            Some(callback) => pool.register(callback, event_type, client_data),
            None => pool.unregister(event_type, client_data),
        }
    }

    /// Register a module-generated event with the engine.
    pub fn register_for_events(&self, registration: &EventRegistration) -> Result<()> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(AgmError::invalid_state(
                "event registration on a closed session",
            ));
        }
        graph_of(&inner)?.register_custom_event(registration)
    }

    /// Write client data; returns bytes consumed.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(AgmError::invalid_state("write on a closed session"));
        }
        graph_of(&inner)?.write(buf)
    }

    /// Read captured data; returns bytes produced.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(AgmError::invalid_state("read on a closed session"));
        }
        graph_of(&inner)?.read(buf)
    }

    /// Signal end-of-stream.
    pub fn eos(&self) -> Result<()> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(AgmError::invalid_state("eos on a closed session"));
        }
        graph_of(&inner)?.eos()
    }

    /// Count of buffers processed by hardware.
    pub fn processed_buffer_count(&self, direction: Direction) -> Result<usize> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(AgmError::invalid_state(
                "buffer count on a closed session",
            ));
        }
        Ok(graph_of(&inner)?.processed_buffer_count(direction))
    }

    /// 64-bit session clock from the time-reporter module.
    pub fn session_time(&self) -> Result<u64> {
        let inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(AgmError::invalid_state("timestamp on a closed session"));
        }
        graph_of(&inner)?.session_time()
    }

    /// Fan an engine event out to the matching subscribers.
    pub fn dispatch_event(&self, params: &EventParams) {
        self.callbacks.lock().dispatch(self.sess_id, params);
    }

    fn trampoline(&self, ctx: &Arc<ServiceContext>) -> EngineEventCallback {
        let ctx = Arc::downgrade(ctx);
        let sess_id = self.sess_id;
        Box::new(move |params: &EventParams| {
            let Some(ctx) = ctx.upgrade() else { return };
            match ctx.sessions.retrieve(sess_id) {
                Some(session) => session.dispatch_event(params),
                None => debug!(sess_id, "event for unknown session dropped"),
            }
        })
    }

    /// Live-attach one staged interface: merge metadata, open the
    /// device, open/change/add the graph, replay cached params.
    fn attach(
        &self,
        inner: &mut SessionInner,
        ctx: &Arc<ServiceContext>,
        idx: usize,
        opened_count: usize,
    ) -> Result<()> {
        let merged = inner.aifs[idx].merged_with(&inner.metadata);
        let device = Arc::clone(&inner.aifs[idx].device);
        device.open()?;

        let edited: Result<()> = (|| {
            if opened_count == 0 {
                if inner.state == SessionState::Closed {
                    let graph = Graph::open(
                        Arc::clone(&ctx.engine),
                        &merged,
                        inner.stream_config,
                        inner.media_config,
                        inner.buffer_config,
                        Some(&device),
                    )?;
                    graph.register_callback(self.trampoline(ctx))?;
                    inner.graph = Some(graph);
                } else {
                    graph_of(inner)?.change(&merged, Some(&device))?;
                }
            } else {
                graph_of(inner)?.add(&merged, Some(&device))?;
            }
            Ok(())
        })();
        if let Err(err) = edited {
            let _ = device.close();
            return Err(err);
        }

        let replayed: Result<()> = (|| {
            if inner.state == SessionState::Closed {
                if let Some(params) = &inner.cached_params {
                    graph_of(inner)?.set_config(params)?;
                }
            }
            if let Some(params) = &inner.aifs[idx].cached_params {
                graph_of(inner)?.set_config(params)?;
            }
            Ok(())
        })();
        if let Err(err) = replayed {
            if opened_count == 0 && inner.state == SessionState::Closed {
                inner.graph = None;
            } else if let Ok(graph) = graph_of(inner) {
                let _ = graph.remove(&merged);
            }
            let _ = device.close();
            return Err(err);
        }
        Ok(())
    }

    /// Live-detach one realized interface. The last realized
    /// attachment stops just its subgraph; earlier ones are removed
    /// from the topology. The device is closed either way.
    fn detach(&self, inner: &mut SessionInner, idx: usize, opened_count: usize) -> Result<()> {
        let aif = &inner.aifs[idx];
        let merged = aif.merged_with(&inner.metadata);
        let device = Arc::clone(&aif.device);

        if let Some(graph) = &inner.graph {
            if opened_count == 1 {
                let subgraph = Metadata::merge([&aif.metadata, &device.metadata()]);
                let props = StopProperties {
                    gkv: merged.gkv.clone(),
                    prop_id: subgraph.props.prop_id,
                    values: subgraph.props.values.clone(),
                };
                if let Err(err) = graph.stop(Some(&props)) {
                    warn!(sess = self.sess_id, aif = aif.aif_id, %err, "subgraph stop");
                }
            } else if let Err(err) = graph.remove(&merged) {
                warn!(sess = self.sess_id, aif = aif.aif_id, %err, "graph remove");
            }
        }

        device.close()
    }

    fn unwind_attach(&self, inner: &mut SessionInner, idx: usize) {
        let count = realized_count(inner);
        if let Err(err) = self.detach(inner, idx, count) {
            warn!(sess = self.sess_id, %err, "detach during attach unwind");
        }
        inner.aifs[idx].state = AifState::Closed;
    }

    fn unwind_open(&self, inner: &mut SessionInner) {
        let realized: Vec<usize> = inner
            .aifs
            .iter()
            .enumerate()
            .filter(|(_, aif)| aif.state == AifState::Opened)
            .map(|(idx, _)| idx)
            .collect();
        for idx in realized {
            if let Err(err) = self.detach(inner, idx, 1) {
                warn!(sess = self.sess_id, %err, "detach during open unwind");
            }
            inner.aifs[idx].state = AifState::Open;
        }
        inner.graph = None;
    }

    fn prepare_locked(&self, inner: &mut SessionInner) -> Result<()> {
        if realized_count(inner) == 0 {
            return Err(AgmError::invalid_state(
                "no audio interface in a realized state",
            ));
        }
        let direction = inner.stream_config.direction;
        let graph = inner
            .graph
            .as_ref()
            .ok_or_else(|| AgmError::invalid_state("session has no graph"))?;

        if direction == Direction::Tx {
            graph.prepare()?;
        }
        for aif in &mut inner.aifs {
            if matches!(aif.state, AifState::Opened | AifState::Stopped) {
                Arc::clone(&aif.device).prepare()?;
                aif.state = AifState::Prepared;
            }
        }
        if direction == Direction::Rx {
            graph.prepare()?;
        }

        inner.state = SessionState::Prepared;
        Ok(())
    }

    fn start_locked(&self, inner: &mut SessionInner, ctx: &Arc<ServiceContext>) -> Result<()> {
        if realized_count(inner) == 0 {
            return Err(AgmError::invalid_state(
                "no audio interface in a realized state",
            ));
        }
        let direction = inner.stream_config.direction;
        let graph = inner
            .graph
            .as_ref()
            .ok_or_else(|| AgmError::invalid_state("session has no graph"))?;

        if direction == Direction::Tx {
            if inner.loopback_enabled {
                let peer = ctx.sessions.retrieve(inner.loopback_peer).ok_or_else(|| {
                    AgmError::invalid_state(format!(
                        "loopback playback session {} does not exist",
                        inner.loopback_peer
                    ))
                })?;
                if peer.state() != SessionState::Started {
                    return Err(AgmError::invalid_state(format!(
                        "loopback playback session {} not started",
                        inner.loopback_peer
                    )));
                }
            }
            if inner.ec_ref_enabled {
                let device = ctx.devices.get(inner.ec_ref_aif)?;
                if device.state() != DeviceState::Started {
                    return Err(AgmError::invalid_state(format!(
                        "echo-reference device {} not started",
                        inner.ec_ref_aif
                    )));
                }
            }
            graph.start()?;
        }

        let mut failed = None;
        for aif in &mut inner.aifs {
            if matches!(
                aif.state,
                AifState::Opened | AifState::Prepared | AifState::Stopped
            ) {
                if let Err(err) = aif.device.start() {
                    failed = Some(err);
                    break;
                }
                aif.state = AifState::Started;
            }
        }

        if failed.is_none() && direction == Direction::Rx {
            if let Err(err) = graph.start() {
                failed = Some(err);
            }
        }

        if let Some(err) = failed {
            if let Err(stop_err) = graph.stop(None) {
                debug!(sess = self.sess_id, %stop_err, "graph stop during start unwind");
            }
            for aif in &mut inner.aifs {
                if aif.state == AifState::Started {
                    let _ = aif.device.stop();
                }
                // Back to opened so a client retry can prepare again.
                if matches!(aif.state, AifState::Started | AifState::Prepared) {
                    aif.state = AifState::Opened;
                }
            }
            return Err(err);
        }

        inner.state = SessionState::Started;
        Ok(())
    }

    fn realize_loopback(
        &self,
        inner: &SessionInner,
        ctx: &Arc<ServiceContext>,
        peer_id: u32,
        enable: bool,
    ) -> Result<()> {
        let graph = graph_of(inner)?;
        let peer = ctx.sessions.get_or_create(peer_id);
        let capture = full_metadata(inner);
        let playback = peer.full_metadata();
        let merged = Metadata::merge([&capture, &playback]);
        if enable {
            graph.add(&merged, None)
        } else {
            graph.remove(&merged)
        }
    }

    fn realize_ec_ref(
        &self,
        inner: &SessionInner,
        ctx: &Arc<ServiceContext>,
        aif_id: u32,
        enable: bool,
    ) -> Result<()> {
        let graph = graph_of(inner)?;
        let device = ctx.devices.get(aif_id)?;
        let capture = metadata_without_devices(inner);
        let merged = Metadata::merge([&capture, &device.metadata()]);
        if enable {
            graph.add(&merged, None)
        } else {
            graph.remove(&merged)
        }
    }
}

fn ensure_attachment(
    inner: &mut SessionInner,
    ctx: &ServiceContext,
    aif_id: u32,
) -> Result<usize> {
    if let Some(pos) = inner.aifs.iter().position(|aif| aif.aif_id == aif_id) {
        return Ok(pos);
    }
    let device = ctx.devices.get(aif_id)?;
    inner.aifs.push(AifAttachment::new(aif_id, device));
    Ok(inner.aifs.len() - 1)
}
