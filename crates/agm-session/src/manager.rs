//! The public service facade.

use std::sync::Arc;

use agm_core::{
    AifInfo, BufferConfig, Direction, EventRegistration, EventType, KeyVector, MediaConfig,
    Metadata, Result, StreamConfig, TagConfig,
};
use agm_device::{DeviceRegistry, PcmDriver};
use agm_engine::acdb::{discover_acdb_files, EngineInitData};
use agm_engine::{GraphEngine, TagModuleInfo};
use tracing::info;

use crate::callback::SessionEventCallback;
use crate::pool::SessionPool;
use crate::service_config::ServiceConfig;
use crate::session::Session;

/// Shared state behind one manager instance: the engine, the device
/// registry and the session pool.
///
/// Sessions receive the context per call instead of holding it, so the
/// only long-lived reference cycle candidate (graph event callbacks)
/// is broken with a weak reference.
pub struct ServiceContext {
    pub(crate) engine: Arc<dyn GraphEngine>,
    pub(crate) devices: DeviceRegistry,
    pub(crate) sessions: SessionPool,
}

/// The audio graph manager service.
///
/// An explicit runtime object: construction enumerates the PCM
/// registry, discovers calibration files and initializes the engine;
/// drop closes every session and shuts the engine down.
pub struct AudioGraphManager {
    ctx: Arc<ServiceContext>,
}

impl AudioGraphManager {
    /// Bring the service up from a configuration, a graph engine and a
    /// PCM driver.
    pub fn new(
        config: &ServiceConfig,
        engine: Arc<dyn GraphEngine>,
        driver: Arc<dyn PcmDriver>,
    ) -> Result<Self> {
        let devices = DeviceRegistry::from_file(&config.pcm_registry, driver)?;
        info!(interfaces = devices.len(), "device registry ready");

        let acdb_files = discover_acdb_files(&config.acdb_dir, config.max_acdb_files)?;
        engine.initialize(&EngineInitData {
            acdb_files,
            delta_file: config.acdb_delta_file.clone(),
        })?;

        Ok(Self {
            ctx: Arc::new(ServiceContext {
                engine,
                devices,
                sessions: SessionPool::new(),
            }),
        })
    }

    fn session(&self, session_id: u32) -> Arc<Session> {
        self.ctx.sessions.get_or_create(session_id)
    }

    /// The session pool behind this manager.
    pub fn sessions(&self) -> &SessionPool {
        &self.ctx.sessions
    }

    /// The device registry behind this manager.
    pub fn devices(&self) -> &DeviceRegistry {
        &self.ctx.devices
    }

    /// Store the media configuration of an audio interface.
    /// Fails while the interface is in use with different values.
    pub fn aif_set_media_config(&self, aif_id: u32, config: &MediaConfig) -> Result<()> {
        self.ctx.devices.get(aif_id)?.set_media_config(config)
    }

    /// Replace the metadata bundle of an audio interface.
    pub fn aif_set_metadata(&self, aif_id: u32, metadata: &[u8]) -> Result<()> {
        let bundle = Metadata::from_bytes(metadata)?;
        self.ctx.devices.get(aif_id)?.set_metadata(bundle);
        Ok(())
    }

    /// Replace the session-level metadata bundle.
    pub fn session_set_metadata(&self, session_id: u32, metadata: &[u8]) -> Result<()> {
        let bundle = Metadata::from_bytes(metadata)?;
        self.session(session_id).set_metadata(bundle);
        Ok(())
    }

    /// Replace the metadata bundle of a session-AIF pair.
    pub fn session_aif_set_metadata(
        &self,
        session_id: u32,
        aif_id: u32,
        metadata: &[u8],
    ) -> Result<()> {
        let bundle = Metadata::from_bytes(metadata)?;
        self.session(session_id)
            .set_aif_metadata(&self.ctx, aif_id, bundle)
    }

    /// Stage or realize a session-to-interface connection.
    pub fn session_aif_connect(&self, session_id: u32, aif_id: u32, state: bool) -> Result<()> {
        self.session(session_id)
            .connect_aif(&self.ctx, aif_id, state)
    }

    /// Tag-to-module mapping of the graph between a session and an
    /// interface, with the two-pass size protocol: a zero `*size`
    /// reports the required byte count, otherwise up to `*size` bytes
    /// of the serialized list are copied.
    pub fn session_aif_get_tag_module_info(
        &self,
        session_id: u32,
        aif_id: u32,
        payload: Option<&mut [u8]>,
        size: &mut usize,
    ) -> Result<()> {
        let info = self
            .session(session_id)
            .tag_module_info(&self.ctx, aif_id)?;
        let serialized = serialize_tag_info(&info);
        match payload {
            None => *size = serialized.len(),
            Some(_) if *size == 0 => *size = serialized.len(),
            Some(out) => {
                let copied = serialized.len().min(*size).min(out.len());
                out[..copied].copy_from_slice(&serialized[..copied]);
                *size = copied;
            }
        }
        Ok(())
    }

    /// Push (and cache) parameters scoped to a session-AIF pair.
    pub fn session_aif_set_params(
        &self,
        session_id: u32,
        aif_id: u32,
        payload: &[u8],
    ) -> Result<()> {
        self.session(session_id)
            .set_aif_params(&self.ctx, aif_id, payload)
    }

    /// Apply a calibration patch to a session-AIF pair.
    pub fn session_aif_set_cal(
        &self,
        session_id: u32,
        aif_id: u32,
        cal: &KeyVector,
    ) -> Result<()> {
        self.session(session_id).set_cal(&self.ctx, aif_id, cal)
    }

    /// Push (and cache) session-level parameters.
    pub fn session_set_params(&self, session_id: u32, payload: &[u8]) -> Result<()> {
        self.session(session_id).set_params(payload)
    }

    /// Round-trip a parameter query through the session's graph.
    pub fn session_get_params(&self, session_id: u32, request: &[u8]) -> Result<Vec<u8>> {
        self.session(session_id).get_params(request)
    }

    /// Push a tag-scoped parameter set.
    pub fn set_params_with_tag(
        &self,
        session_id: u32,
        aif_id: u32,
        tag_config: &TagConfig,
    ) -> Result<()> {
        self.session(session_id)
            .set_params_with_tag(&self.ctx, aif_id, tag_config)
    }

    /// Subscribe (`Some`) or unsubscribe (`None`) a session event
    /// callback.
    pub fn session_register_cb(
        &self,
        session_id: u32,
        callback: Option<SessionEventCallback>,
        event_type: EventType,
        client_data: u64,
    ) {
        self.session(session_id)
            .register_callback(callback, event_type, client_data);
    }

    /// Register a module-generated event. Not needed for data-path
    /// events.
    pub fn session_register_for_events(
        &self,
        session_id: u32,
        registration: &EventRegistration,
    ) -> Result<()> {
        self.session(session_id).register_for_events(registration)
    }

    /// Store a session's stream, media and buffer configuration.
    pub fn session_set_config(
        &self,
        session_id: u32,
        stream_config: &StreamConfig,
        media_config: &MediaConfig,
        buffer_config: &BufferConfig,
    ) {
        self.session(session_id)
            .set_config(stream_config, media_config, buffer_config);
    }

    /// Open a session: realize every staged attachment.
    pub fn session_open(&self, session_id: u32) -> Result<()> {
        self.session(session_id).open(&self.ctx)
    }

    /// Close a session.
    pub fn session_close(&self, session_id: u32) -> Result<()> {
        self.session(session_id).close()
    }

    /// Prepare a session.
    pub fn session_prepare(&self, session_id: u32) -> Result<()> {
        self.session(session_id).prepare()
    }

    /// Start a session.
    pub fn session_start(&self, session_id: u32) -> Result<()> {
        self.session(session_id).start(&self.ctx)
    }

    /// Stop a session.
    pub fn session_stop(&self, session_id: u32) -> Result<()> {
        self.session(session_id).stop()
    }

    /// Pause a started session.
    pub fn session_pause(&self, session_id: u32) -> Result<()> {
        self.session(session_id).pause()
    }

    /// Resume a paused session.
    pub fn session_resume(&self, session_id: u32) -> Result<()> {
        self.session(session_id).resume()
    }

    /// Signal end-of-stream on a session.
    pub fn session_eos(&self, session_id: u32) -> Result<()> {
        self.session(session_id).eos()
    }

    /// Read captured data; returns bytes produced.
    pub fn session_read(&self, session_id: u32, buf: &mut [u8]) -> Result<usize> {
        self.session(session_id).read(buf)
    }

    /// Write playback data; returns bytes consumed.
    pub fn session_write(&self, session_id: u32, buf: &[u8]) -> Result<usize> {
        self.session(session_id).write(buf)
    }

    /// Count of buffers processed by hardware; wraps at `usize::MAX`.
    pub fn get_hw_processed_buff_cnt(
        &self,
        session_id: u32,
        direction: Direction,
    ) -> Result<usize> {
        self.session(session_id).processed_buffer_count(direction)
    }

    /// 64-bit session clock from the time-reporter module.
    pub fn get_session_time(&self, session_id: u32) -> Result<u64> {
        self.session(session_id).session_time()
    }

    /// Two-pass enumeration of the audio interfaces.
    pub fn get_aif_info_list(&self, list: Option<&mut [AifInfo]>, count: &mut usize) {
        self.ctx.devices.aif_info_list(list, count);
    }

    /// Stage or realize a loopback edge from a capture session into a
    /// playback session.
    pub fn session_set_loopback(
        &self,
        capture_session_id: u32,
        playback_session_id: u32,
        state: bool,
    ) -> Result<()> {
        self.session(capture_session_id)
            .set_loopback(&self.ctx, playback_session_id, state)
    }

    /// Stage or realize an echo-reference edge from an RX device into
    /// a capture session.
    pub fn session_set_ec_ref(
        &self,
        capture_session_id: u32,
        aif_id: u32,
        state: bool,
    ) -> Result<()> {
        self.session(capture_session_id)
            .set_ec_ref(&self.ctx, aif_id, state)
    }
}

impl Drop for AudioGraphManager {
    fn drop(&mut self) {
        self.ctx.sessions.close_all();
        self.ctx.engine.shutdown();
    }
}

/// Wire form of a tag/module listing:
///
/// ```text
/// u32 num_tags
/// per tag: u32 tag, u32 num_modules, { u32 module_id, u32 miid } *
/// ```
fn serialize_tag_info(info: &[TagModuleInfo]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(info.len() as u32).to_le_bytes());
    for tag in info {
        out.extend_from_slice(&tag.tag.to_le_bytes());
        out.extend_from_slice(&(tag.modules.len() as u32).to_le_bytes());
        for module in &tag.modules {
            out.extend_from_slice(&module.module_id.to_le_bytes());
            out.extend_from_slice(&module.module_instance_id.to_le_bytes());
        }
    }
    out
}
