//! The graph object: one engine handle plus its resolved modules.

use std::sync::Arc;

use agm_core::{
    params, tags, AgmError, BufferConfig, DataMode, Direction, EventRegistration, KeyVector,
    MediaConfig, Metadata, ModuleParamHeader, Result, StreamConfig, MODULE_PARAM_HEADER_LEN,
};
use agm_device::Device;
use agm_engine::{
    BufferSetup, EngineEventCallback, EngineGraph, GraphEngine, StopProperties,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::module::{ConfigureContext, ModuleRole, ResolvedModule};

/// Lifecycle state of a graph. A graph exists only between open and
/// close, so `Opened` is the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    /// Opened with the engine, modules resolved.
    Opened,
    /// Modules configured, buffers armed.
    Prepared,
    /// Data flowing.
    Started,
    /// Stopped after running.
    Stopped,
}

struct GraphInner {
    handle: Box<dyn EngineGraph>,
    modules: Vec<ResolvedModule>,
    stream_config: StreamConfig,
    media_config: MediaConfig,
    buffer_config: BufferConfig,
    spr_miid: u32,
    state: GraphState,
}

/// One engine graph owned by a session.
pub struct Graph {
    engine: Arc<dyn GraphEngine>,
    inner: Mutex<GraphInner>,
}

fn resolve_stream_module(
    pool: &mut Vec<ModuleRole>,
    tag: u32,
    modules: &[agm_engine::ModuleIdPair],
) -> Result<Option<ResolvedModule>> {
    let Some(pos) = pool.iter().position(|role| role.tag() == tag) else {
        return Ok(None);
    };
    if modules.len() > 1 {
        return Err(AgmError::invalid_argument(format!(
            "tag {tag:#x} resolves to {} modules, expected one",
            modules.len()
        )));
    }
    let Some(pair) = modules.first() else {
        return Ok(None);
    };
    let role = pool.remove(pos);
    debug!(?role, miid = pair.module_instance_id, "resolved module");
    Ok(Some(ResolvedModule {
        role,
        module_id: pair.module_id,
        miid: pair.module_instance_id,
        device: None,
        gkv: None,
        configured: false,
    }))
}

impl Graph {
    /// Open a graph for the merged metadata of a session and its first
    /// audio interface.
    ///
    /// Resolves the stream-side template modules, and the hardware
    /// endpoint of `device` when present; the endpoint snapshots the
    /// graph key vector for later tagged queries. A partial failure
    /// leaves nothing behind: the engine handle is only created after
    /// resolution succeeds.
    pub fn open(
        engine: Arc<dyn GraphEngine>,
        metadata: &Metadata,
        stream_config: StreamConfig,
        media_config: MediaConfig,
        buffer_config: BufferConfig,
        device: Option<&Arc<Device>>,
    ) -> Result<Self> {
        let tag_info = engine.tag_module_info(&metadata.gkv)?;

        let mut stream_pool: Vec<ModuleRole> = ModuleRole::stream_roles().to_vec();
        let mut device_pool: Vec<ModuleRole> = ModuleRole::device_roles().to_vec();
        let mut modules = Vec::new();

        for info in &tag_info {
            if let Some(module) = resolve_stream_module(&mut stream_pool, info.tag, &info.modules)?
            {
                modules.push(module);
                continue;
            }

            let Some(device) = device else { continue };
            let Some(pos) = device_pool.iter().position(|role| role.tag() == info.tag) else {
                continue;
            };
            if info.modules.len() > 1 {
                return Err(AgmError::invalid_argument(format!(
                    "tag {:#x} resolves to {} modules, expected one",
                    info.tag,
                    info.modules.len()
                )));
            }
            let Some(pair) = info.modules.first() else {
                continue;
            };
            let role = device_pool.remove(pos);
            debug!(?role, miid = pair.module_instance_id, "resolved device module");
            modules.push(ResolvedModule {
                role,
                module_id: pair.module_id,
                miid: pair.module_instance_id,
                device: Some(Arc::clone(device)),
                gkv: Some(metadata.gkv.clone()),
                configured: false,
            });
        }

        let handle = engine.open(&metadata.gkv, &metadata.ckv)?;

        Ok(Self {
            engine,
            inner: Mutex::new(GraphInner {
                handle,
                modules,
                stream_config,
                media_config,
                buffer_config,
                spr_miid: 0,
                state: GraphState::Opened,
            }),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GraphState {
        self.inner.lock().state
    }

    /// Instance id of the session-time reporter, zero until configured.
    pub fn spr_miid(&self) -> u32 {
        self.inner.lock().spr_miid
    }

    /// `(role, instance id)` of every resolved module, in list order.
    pub fn resolved_modules(&self) -> Vec<(ModuleRole, u32)> {
        self.inner
            .lock()
            .modules
            .iter()
            .map(|module| (module.role, module.miid))
            .collect()
    }

    /// Install the engine event callback for this graph.
    pub fn register_callback(&self, callback: EngineEventCallback) -> Result<()> {
        self.inner.lock().handle.register_event_callback(callback)
    }

    /// Register or deregister a module-generated event with the engine.
    pub fn register_custom_event(&self, registration: &EventRegistration) -> Result<()> {
        self.inner.lock().handle.register_custom_event(registration)
    }

    /// Refresh the session configuration copies used at prepare time.
    pub fn update_session_config(
        &self,
        stream_config: StreamConfig,
        media_config: MediaConfig,
        buffer_config: BufferConfig,
    ) {
        let mut inner = self.inner.lock();
        inner.stream_config = stream_config;
        inner.media_config = media_config;
        inner.buffer_config = buffer_config;
    }

    /// Configure every unconfigured module, validate the module list
    /// against the stream configuration, arm the client data path and
    /// issue the engine prepare.
    pub fn prepare(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let GraphInner {
            handle,
            modules,
            stream_config,
            media_config,
            buffer_config,
            spr_miid,
            state,
        } = inner;

        let endpoint_miids: Vec<u32> = modules
            .iter()
            .filter(|module| module.role.is_hw_endpoint())
            .map(|module| module.miid)
            .collect();
        let ctx = ConfigureContext {
            stream: stream_config,
            media: media_config,
            endpoint_miids: &endpoint_miids,
        };

        for module in modules.iter_mut() {
            if module.configured {
                continue;
            }
            validate_module(module, stream_config)?;
            module.configure(&ctx, handle.as_mut())?;
            module.configured = true;
            if module.role == ModuleRole::Spr {
                *spr_miid = module.miid;
            }
        }

        if !stream_config.hostless {
            handle.configure_buffers(
                stream_config.direction,
                &BufferSetup {
                    count: buffer_config.count,
                    size: buffer_config.size,
                    start_threshold: stream_config.start_threshold,
                    stop_threshold: stream_config.stop_threshold,
                    blocking: stream_config.data_mode == DataMode::Blocking,
                },
            )?;
        }

        handle.prepare()?;
        *state = GraphState::Prepared;
        Ok(())
    }

    /// Start the graph. Legal from `Prepared` and `Stopped`.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, GraphState::Prepared | GraphState::Stopped) {
            return Err(AgmError::invalid_state(format!(
                "graph start from {:?}",
                inner.state
            )));
        }
        inner.handle.start()?;
        inner.state = GraphState::Started;
        Ok(())
    }

    /// Stop the whole graph, or only the subgraph selected by `props`.
    /// Legal from `Started`.
    pub fn stop(&self, props: Option<&StopProperties>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != GraphState::Started {
            return Err(AgmError::invalid_state(format!(
                "graph stop from {:?}",
                inner.state
            )));
        }
        inner.handle.stop(props)?;
        inner.state = GraphState::Stopped;
        Ok(())
    }

    fn pause_resume(&self, pause: bool) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let Some(module) = inner
            .modules
            .iter()
            .find(|module| module.role == ModuleRole::Pause)
        else {
            // Pause is an optional capability of the pipeline.
            debug!("no pause module resolved, ignoring");
            return Ok(());
        };

        let param_id = if pause {
            params::SOFT_PAUSE_START
        } else {
            params::SOFT_PAUSE_RESUME
        };
        let payload = ModuleParamHeader::with_body(module.miid, param_id, &[]);
        inner.handle.set_custom_config(&payload)
    }

    /// Ramp the pipeline into a soft pause. A silent no-op without a
    /// pause module.
    pub fn pause(&self) -> Result<()> {
        self.pause_resume(true)
    }

    /// Resume from a soft pause. A silent no-op without a pause module.
    pub fn resume(&self) -> Result<()> {
        self.pause_resume(false)
    }

    /// Add the subgraph selected by `metadata` to this graph; when a
    /// new device is introduced its endpoint module is resolved and
    /// appended. Newly added and routing-sensitive modules are
    /// (re)configured.
    pub fn add(&self, metadata: &Metadata, device: Option<&Arc<Device>>) -> Result<()> {
        let inner = &mut *self.inner.lock();
        inner.handle.add_graph(&metadata.gkv, &metadata.ckv)?;

        if let Some(device) = device {
            let role = ModuleRole::endpoint_for(device.direction());
            let pairs = self.engine.tagged_module_info(&metadata.gkv, role.tag())?;
            let pair = pairs.first().ok_or_else(|| {
                AgmError::Engine(format!("no module tagged {:#x} in added graph", role.tag()))
            })?;

            let present = inner
                .modules
                .iter()
                .any(|module| module.miid == pair.module_instance_id);
            if !present {
                debug!(?role, miid = pair.module_instance_id, "new endpoint module");
                inner.modules.push(ResolvedModule {
                    role,
                    module_id: pair.module_id,
                    miid: pair.module_instance_id,
                    device: Some(Arc::clone(device)),
                    gkv: Some(metadata.gkv.clone()),
                    configured: false,
                });
            }
        }

        // Configure what the edit introduced; the session-time reporter
        // is reconfigured as well since its routing depends on the
        // device set.
        self.configure_modules(inner, |module| {
            !module.configured || module.role == ModuleRole::Spr
        })
    }

    /// Replace this graph's topology with the one selected by
    /// `metadata`. The engine tears the previous topology down, so all
    /// modules are reconfigured; a replaced hardware endpoint drops the
    /// stale module record. Illegal while started.
    pub fn change(&self, metadata: &Metadata, device: Option<&Arc<Device>>) -> Result<()> {
        let inner = &mut *self.inner.lock();
        if inner.state == GraphState::Started {
            return Err(AgmError::invalid_state("graph change while started"));
        }

        for module in &mut inner.modules {
            module.configured = false;
        }

        if let Some(device) = device {
            let role = ModuleRole::endpoint_for(device.direction());
            let pairs = self.engine.tagged_module_info(&metadata.gkv, role.tag())?;
            let pair = pairs.first().ok_or_else(|| {
                AgmError::Engine(format!("no module tagged {:#x} in new graph", role.tag()))
            })?;

            let present = inner
                .modules
                .iter()
                .any(|module| module.miid == pair.module_instance_id);
            if !present {
                // The engine already tore the old endpoint down as part
                // of the removed subgraph.
                inner.modules.retain(|module| !module.role.is_hw_endpoint());
                inner.modules.push(ResolvedModule {
                    role,
                    module_id: pair.module_id,
                    miid: pair.module_instance_id,
                    device: Some(Arc::clone(device)),
                    gkv: Some(metadata.gkv.clone()),
                    configured: false,
                });
            }
        }

        inner.handle.change_graph(&metadata.gkv, &metadata.ckv)?;
        self.configure_modules(inner, |_| true)
    }

    /// Remove the subgraph selected by `metadata`. No reconfiguration:
    /// the caller follows up with add/change or start.
    pub fn remove(&self, metadata: &Metadata) -> Result<()> {
        self.inner.lock().handle.remove_graph(&metadata.gkv)
    }

    fn configure_modules(
        &self,
        inner: &mut GraphInner,
        needs_configure: impl Fn(&ResolvedModule) -> bool,
    ) -> Result<()> {
        let GraphInner {
            handle,
            modules,
            stream_config,
            media_config,
            spr_miid,
            ..
        } = inner;

        let endpoint_miids: Vec<u32> = modules
            .iter()
            .filter(|module| module.role.is_hw_endpoint())
            .map(|module| module.miid)
            .collect();
        let ctx = ConfigureContext {
            stream: stream_config,
            media: media_config,
            endpoint_miids: &endpoint_miids,
        };

        for module in modules.iter_mut() {
            if !needs_configure(module) {
                continue;
            }
            module.configure(&ctx, handle.as_mut())?;
            module.configured = true;
            if module.role == ModuleRole::Spr {
                *spr_miid = module.miid;
            }
        }
        Ok(())
    }

    /// Push an opaque configuration blob.
    pub fn set_config(&self, payload: &[u8]) -> Result<()> {
        self.inner.lock().handle.set_custom_config(payload)
    }

    /// Round-trip an opaque configuration query.
    pub fn get_config(&self, request: &[u8]) -> Result<Vec<u8>> {
        self.inner.lock().handle.get_custom_config(request)
    }

    /// Set a tag-scoped configuration under `gkv`.
    pub fn set_tagged_config(&self, gkv: &KeyVector, tag: u32, tkv: &KeyVector) -> Result<()> {
        self.inner.lock().handle.set_tagged_config(gkv, tag, tkv)
    }

    /// Apply the calibration selected by `metadata`.
    pub fn set_cal(&self, metadata: &Metadata) -> Result<()> {
        self.inner
            .lock()
            .handle
            .set_cal(&metadata.gkv, &metadata.ckv)
    }

    /// Write client data into the shared-memory endpoint. Legal from
    /// `Prepared` and `Started`; returns bytes consumed.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, GraphState::Prepared | GraphState::Started) {
            return Err(AgmError::invalid_state(format!(
                "graph write from {:?}",
                inner.state
            )));
        }
        inner.handle.write(tags::STREAM_SHMEM_ENDPOINT, buf)
    }

    /// Read captured data from the shared-memory endpoint. Legal from
    /// `Started`; returns bytes produced.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.state != GraphState::Started {
            return Err(AgmError::invalid_state(format!(
                "graph read from {:?}",
                inner.state
            )));
        }
        inner.handle.read(tags::STREAM_SHMEM_ENDPOINT, buf)
    }

    /// Signal end-of-stream into the data path.
    pub fn eos(&self) -> Result<()> {
        self.inner.lock().handle.eos()
    }

    /// Count of buffers processed by hardware in `direction`.
    pub fn processed_buffer_count(&self, direction: Direction) -> usize {
        self.inner.lock().handle.processed_buffer_count(direction)
    }

    /// Query the session-time reporter for the 64-bit session clock.
    /// Requires a started graph and a configured reporter.
    pub fn session_time(&self) -> Result<u64> {
        let inner = &mut *self.inner.lock();
        if inner.state != GraphState::Started {
            return Err(AgmError::invalid_state(format!(
                "session time query from {:?}",
                inner.state
            )));
        }
        if inner.spr_miid == 0 {
            return Err(AgmError::invalid_state(
                "no session-time reporter in this graph",
            ));
        }

        // Request body mirrors the response: three msw/lsw pairs.
        let request =
            ModuleParamHeader::with_body(inner.spr_miid, params::SPR_SESSION_TIME, &[0u8; 24]);
        let response = inner.handle.get_custom_config(&request)?;
        if response.len() < MODULE_PARAM_HEADER_LEN + 8 {
            return Err(AgmError::Engine(format!(
                "short session-time response: {} bytes",
                response.len()
            )));
        }
        let word = |at: usize| {
            u32::from_le_bytes(
                response[at..at + 4]
                    .try_into()
                    .expect("bounds checked above"),
            )
        };
        let msw = word(MODULE_PARAM_HEADER_LEN);
        let lsw = word(MODULE_PARAM_HEADER_LEN + 4);
        Ok((u64::from(msw) << 32) | u64::from(lsw))
    }
}

fn validate_module(module: &ResolvedModule, stream: &StreamConfig) -> Result<()> {
    match module.role {
        ModuleRole::MediaFormatWriter | ModuleRole::ShmemEndpoint if stream.hostless => {
            return Err(AgmError::invalid_argument(
                "shared-memory module resolved for a hostless session",
            ));
        }
        ModuleRole::PcmDecoder if stream.direction == Direction::Tx => {
            return Err(AgmError::invalid_argument(
                "pcm decoder resolved for a capture session",
            ));
        }
        ModuleRole::PcmEncoder if stream.direction == Direction::Rx => {
            return Err(AgmError::invalid_argument(
                "pcm encoder resolved for a playback session",
            ));
        }
        _ => {}
    }

    if let Some(device) = &module.device {
        // Only meaningful while no session keeps the device running.
        if device.start_refcount() == 0
            && module.role.is_hw_endpoint()
            && module.role != ModuleRole::endpoint_for(device.direction())
        {
            warn!(
                aif = device.aif_id(),
                role = ?module.role,
                "endpoint direction does not match device"
            );
            return Err(AgmError::invalid_argument(
                "endpoint module direction does not match its device",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agm_core::{EventParams, KeyVector};
    use agm_device::mock::MockPcm;
    use agm_device::DeviceRegistry;
    use agm_engine::mock::{MockCommand, MockEngine, MockOp};

    const REGISTRY: &str = "\
00-00: Speaker : : playback 1
00-01: Mic : : capture 1
";

    fn rx_tags() -> Vec<u32> {
        vec![
            tags::STREAM_INPUT_MEDIA_FORMAT,
            tags::STREAM_PCM_DECODER,
            tags::STREAM_SHMEM_ENDPOINT,
            tags::STREAM_SPR,
            tags::STREAM_PAUSE,
            tags::DEVICE_HW_ENDPOINT_RX,
        ]
    }

    fn setup() -> (DeviceRegistry, Arc<Device>) {
        let registry =
            DeviceRegistry::from_reader(REGISTRY.as_bytes(), Arc::new(MockPcm::new())).unwrap();
        let device = registry.get(0).unwrap();
        (registry, device)
    }

    fn open_graph(engine: &MockEngine, device: &Arc<Device>) -> Graph {
        let metadata = Metadata {
            gkv: KeyVector::from_pairs([(1, 100), (2, 200)]),
            ..Metadata::default()
        };
        Graph::open(
            Arc::new(engine.clone()),
            &metadata,
            StreamConfig::default(),
            MediaConfig::default(),
            BufferConfig {
                count: 4,
                size: 3840,
            },
            Some(device),
        )
        .unwrap()
    }

    #[test]
    fn open_resolves_stream_and_device_modules() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);

        let modules = graph.resolved_modules();
        assert_eq!(modules.len(), 6);
        assert!(modules
            .iter()
            .any(|(role, _)| *role == ModuleRole::HwEndpointRx));

        // Instance ids are unique across the module list.
        let mut miids: Vec<u32> = modules.iter().map(|(_, miid)| *miid).collect();
        miids.sort_unstable();
        miids.dedup();
        assert_eq!(miids.len(), modules.len());
    }

    #[test]
    fn duplicate_modules_per_tag_are_malformed() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        engine.set_duplicate_tag(Some(tags::STREAM_PCM_DECODER));
        let (_registry, device) = setup();

        let metadata = Metadata {
            gkv: KeyVector::from_pairs([(1, 100)]),
            ..Metadata::default()
        };
        let result = Graph::open(
            Arc::new(engine.clone()),
            &metadata,
            StreamConfig::default(),
            MediaConfig::default(),
            BufferConfig::default(),
            Some(&device),
        );
        assert!(matches!(result, Err(AgmError::InvalidArgument(_))));
    }

    #[test]
    fn prepare_configures_modules_and_buffers() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);

        graph.prepare().unwrap();
        assert_eq!(graph.state(), GraphState::Prepared);
        assert_ne!(graph.spr_miid(), 0);

        let commands = engine.commands();
        assert!(commands.iter().any(|cmd| matches!(
            cmd,
            MockCommand::ConfigureBuffers { setup, .. } if setup.count == 4 && setup.size == 3840
        )));
        assert!(commands.iter().any(|cmd| matches!(cmd, MockCommand::Prepare)));
    }

    #[test]
    fn decoder_in_capture_session_is_rejected() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (registry, _device) = setup();
        let mic = registry.get(1).unwrap();

        let metadata = Metadata {
            gkv: KeyVector::from_pairs([(1, 100)]),
            ..Metadata::default()
        };
        let graph = Graph::open(
            Arc::new(engine.clone()),
            &metadata,
            StreamConfig {
                direction: Direction::Tx,
                ..StreamConfig::default()
            },
            MediaConfig::default(),
            BufferConfig::default(),
            Some(&mic),
        )
        .unwrap();
        assert!(matches!(
            graph.prepare(),
            Err(AgmError::InvalidArgument(_))
        ));
        assert_eq!(graph.state(), GraphState::Opened);
    }

    #[test]
    fn hostless_session_rejects_shmem_modules() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();

        let metadata = Metadata {
            gkv: KeyVector::from_pairs([(1, 100)]),
            ..Metadata::default()
        };
        let graph = Graph::open(
            Arc::new(engine.clone()),
            &metadata,
            StreamConfig {
                hostless: true,
                ..StreamConfig::default()
            },
            MediaConfig::default(),
            BufferConfig::default(),
            Some(&device),
        )
        .unwrap();
        assert!(graph.prepare().is_err());
    }

    #[test]
    fn lifecycle_state_gates() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);

        assert!(graph.start().is_err());
        assert!(graph.stop(None).is_err());
        assert!(graph.read(&mut [0; 8]).is_err());
        assert!(graph.write(&[0; 8]).is_err());

        graph.prepare().unwrap();
        graph.start().unwrap();
        assert_eq!(graph.state(), GraphState::Started);
        assert_eq!(graph.write(&[0; 7680]).unwrap(), 7680);

        graph.stop(None).unwrap();
        assert_eq!(graph.state(), GraphState::Stopped);
        graph.start().unwrap();
        graph.stop(None).unwrap();
    }

    #[test]
    fn pause_without_pause_module_is_silent() {
        let engine = MockEngine::new().with_tags(&[
            tags::STREAM_INPUT_MEDIA_FORMAT,
            tags::STREAM_PCM_DECODER,
            tags::STREAM_SHMEM_ENDPOINT,
            tags::DEVICE_HW_ENDPOINT_RX,
        ]);
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);
        graph.prepare().unwrap();
        engine.clear_commands();

        graph.pause().unwrap();
        graph.resume().unwrap();
        assert!(engine.commands().is_empty());
    }

    #[test]
    fn pause_targets_the_pause_module() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);
        graph.prepare().unwrap();
        engine.clear_commands();

        graph.pause().unwrap();
        assert!(engine.commands().iter().any(|cmd| matches!(
            cmd,
            MockCommand::SetConfig { param_id, .. } if *param_id == params::SOFT_PAUSE_START
        )));
        graph.resume().unwrap();
        assert!(engine.commands().iter().any(|cmd| matches!(
            cmd,
            MockCommand::SetConfig { param_id, .. } if *param_id == params::SOFT_PAUSE_RESUME
        )));
    }

    #[test]
    fn add_resolves_new_endpoint_and_reconfigures_spr() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);
        graph.prepare().unwrap();
        let before = graph.resolved_modules().len();
        engine.clear_commands();

        // A different key vector resolves a new endpoint instance.
        let added = Metadata {
            gkv: KeyVector::from_pairs([(1, 100), (3, 300)]),
            ..Metadata::default()
        };
        graph.add(&added, Some(&device)).unwrap();
        assert_eq!(graph.resolved_modules().len(), before + 1);

        let commands = engine.commands();
        assert!(commands
            .iter()
            .any(|cmd| matches!(cmd, MockCommand::AddGraph { gkv } if gkv.len() == 2)));
        // The reporter was reconfigured for the new endpoint set.
        assert!(commands.iter().any(|cmd| matches!(
            cmd,
            MockCommand::SetConfig { param_id, .. } if *param_id == params::SPR_ENDPOINT_ROUTING
        )));
    }

    #[test]
    fn add_with_same_metadata_does_not_duplicate_modules() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();
        let metadata = Metadata {
            gkv: KeyVector::from_pairs([(1, 100), (2, 200)]),
            ..Metadata::default()
        };
        let graph = open_graph(&engine, &device);
        graph.prepare().unwrap();
        let before = graph.resolved_modules().len();

        graph.add(&metadata, Some(&device)).unwrap();
        assert_eq!(graph.resolved_modules().len(), before);
    }

    #[test]
    fn change_replaces_endpoint_and_reconfigures_everything() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);
        graph.prepare().unwrap();
        engine.clear_commands();

        let changed = Metadata {
            gkv: KeyVector::from_pairs([(1, 100), (4, 400)]),
            ..Metadata::default()
        };
        graph.change(&changed, Some(&device)).unwrap();

        let modules = graph.resolved_modules();
        let endpoints: Vec<_> = modules
            .iter()
            .filter(|(role, _)| role.is_hw_endpoint())
            .collect();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(
            endpoints[0].1,
            engine.instance_id(tags::DEVICE_HW_ENDPOINT_RX, &changed.gkv)
        );

        // Every module was reconfigured after the change.
        let configures = engine
            .commands()
            .iter()
            .filter(|cmd| matches!(cmd, MockCommand::SetConfig { .. }))
            .count();
        assert!(configures >= 3);
    }

    #[test]
    fn change_while_started_is_rejected() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);
        graph.prepare().unwrap();
        graph.start().unwrap();
        assert!(matches!(
            graph.change(&Metadata::default(), None),
            Err(AgmError::InvalidState(_))
        ));
    }

    #[test]
    fn session_time_roundtrip() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);
        graph.prepare().unwrap();

        // Not started yet.
        assert!(graph.session_time().is_err());

        graph.start().unwrap();
        engine.set_session_time(0xDEAD_0000_BEEF);
        assert_eq!(graph.session_time().unwrap(), 0xDEAD_0000_BEEF);
    }

    #[test]
    fn session_time_without_reporter_is_invalid_state() {
        let engine = MockEngine::new().with_tags(&[
            tags::STREAM_INPUT_MEDIA_FORMAT,
            tags::STREAM_PCM_DECODER,
            tags::STREAM_SHMEM_ENDPOINT,
            tags::DEVICE_HW_ENDPOINT_RX,
        ]);
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);
        graph.prepare().unwrap();
        graph.start().unwrap();
        assert!(matches!(
            graph.session_time(),
            Err(AgmError::InvalidState(_))
        ));
    }

    #[test]
    fn engine_failure_propagates_from_prepare() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);
        engine.fail_on(MockOp::Prepare);
        assert!(matches!(graph.prepare(), Err(AgmError::Engine(_))));
        assert_eq!(graph.state(), GraphState::Opened);
    }

    #[test]
    fn callback_receives_injected_events() {
        let engine = MockEngine::new().with_tags(&rx_tags());
        let (_registry, device) = setup();
        let graph = open_graph(&engine, &device);

        let seen = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&seen);
        graph
            .register_callback(Box::new(move |_params: &EventParams| {
                *sink.lock() += 1;
            }))
            .unwrap();

        engine.inject_event(&EventParams {
            source_module_id: 0x5000,
            event_id: 1,
            payload: Vec::new(),
        });
        assert_eq!(*seen.lock(), 1);
    }
}
