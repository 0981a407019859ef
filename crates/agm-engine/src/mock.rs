//! Deterministic in-memory engine for tests and CI.
//!
//! The mock reports a configurable tag set for any graph key vector,
//! derives module instance ids stably from `(tag, gkv)` so that
//! topology edits against a different key vector resolve to different
//! instances, records every command it receives, and supports scripted
//! failures per command kind.

use std::collections::HashSet;
use std::sync::Arc;

use agm_core::{
    params, AgmError, Direction, EventParams, EventRegistration, KeyVector, ModuleParamHeader,
    Result,
};
use parking_lot::Mutex;

use crate::{
    acdb::EngineInitData, BufferSetup, EngineEventCallback, EngineGraph, GraphEngine, ModuleIdPair,
    StopProperties, TagModuleInfo,
};

/// Command kinds, used for failure scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// Graph open.
    Open,
    /// Graph prepare.
    Prepare,
    /// Graph start.
    Start,
    /// Graph stop.
    Stop,
    /// End of stream.
    Eos,
    /// Add-graph topology edit.
    AddGraph,
    /// Change-graph topology edit.
    ChangeGraph,
    /// Remove-graph topology edit.
    RemoveGraph,
    /// Data-path buffer configuration.
    ConfigureBuffers,
    /// Custom config write.
    SetConfig,
    /// Custom config query.
    GetConfig,
    /// Tag-scoped config.
    SetTaggedConfig,
    /// Calibration application.
    SetCal,
    /// Data write.
    Write,
    /// Data read.
    Read,
    /// Custom event registration.
    RegisterCustomEvent,
    /// Tag/module queries.
    TagInfo,
}

/// A recorded engine command with the details tests care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCommand {
    /// Graph opened with these key vectors.
    Open {
        /// Graph key vector.
        gkv: KeyVector,
        /// Calibration key vector.
        ckv: KeyVector,
    },
    /// Graph prepared.
    Prepare,
    /// Graph started.
    Start,
    /// Graph stopped; `scoped` when stop properties selected a
    /// subgraph.
    Stop {
        /// True for a subgraph-scoped stop.
        scoped: bool,
    },
    /// EOS issued.
    Eos,
    /// Subgraph added.
    AddGraph {
        /// Graph key vector of the added subgraph.
        gkv: KeyVector,
    },
    /// Topology changed.
    ChangeGraph {
        /// New graph key vector.
        gkv: KeyVector,
    },
    /// Subgraph removed.
    RemoveGraph {
        /// Graph key vector of the removed subgraph.
        gkv: KeyVector,
    },
    /// Buffer parameters configured.
    ConfigureBuffers {
        /// Data direction.
        direction: Direction,
        /// Parameters as handed to the engine.
        setup: BufferSetup,
    },
    /// Custom config pushed; the target module and param are decoded
    /// from the payload header.
    SetConfig {
        /// Target module instance.
        module_instance_id: u32,
        /// Parameter id.
        param_id: u32,
    },
    /// Custom config queried.
    GetConfig {
        /// Parameter id.
        param_id: u32,
    },
    /// Tag-scoped config pushed.
    SetTaggedConfig {
        /// Target tag.
        tag: u32,
    },
    /// Calibration applied.
    SetCal {
        /// Calibration key vector.
        ckv: KeyVector,
    },
    /// Data written.
    Write {
        /// Bytes consumed.
        len: usize,
    },
    /// Data read.
    Read {
        /// Bytes produced.
        len: usize,
    },
    /// Custom event (de)registered.
    RegisterCustomEvent {
        /// Target module instance.
        module_instance_id: u32,
        /// Event id.
        event_id: u32,
        /// True for register, false for deregister.
        register: bool,
    },
    /// Graph handle dropped.
    Close,
}

#[derive(Default)]
struct MockInner {
    initialized: bool,
    tags: Vec<u32>,
    keyed_tags: Vec<(u32, Vec<u32>)>,
    duplicate_tag: Option<u32>,
    fail: HashSet<MockOp>,
    commands: Vec<MockCommand>,
    callbacks: Vec<Arc<dyn Fn(&EventParams) + Send + Sync>>,
    session_time: u64,
    ring_full: bool,
    processed: usize,
}

impl MockInner {
    fn check(&self, op: MockOp) -> Result<()> {
        if self.fail.contains(&op) {
            return Err(AgmError::Engine(format!("scripted failure for {op:?}")));
        }
        Ok(())
    }

    /// Tag set for a key vector: a keyed override wins when the vector
    /// carries its key, otherwise the default set applies.
    fn tags_for(&self, gkv: &KeyVector) -> Vec<u32> {
        for (key, tags) in &self.keyed_tags {
            if gkv.contains_key(*key) {
                return tags.clone();
            }
        }
        self.tags.clone()
    }
}

/// Deterministic engine double.
///
/// Clone-cheap via `Arc`; hold one clone in the test and hand another
/// to the service under test.
#[derive(Clone, Default)]
pub struct MockEngine {
    inner: Arc<Mutex<MockInner>>,
}

/// Stable instance-id derivation: FNV-1a over the key vector, mixed
/// with the tag. Different key vectors yield different instances for
/// the same tag, mirroring how the engine instantiates per-subgraph
/// modules.
fn derive_miid(tag: u32, gkv: &KeyVector) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    let mut mix = |word: u32| {
        for byte in word.to_le_bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
    };
    mix(tag);
    for kv in gkv.entries() {
        mix(kv.key);
        mix(kv.value);
    }
    // Keep instance ids out of the engine-internal id space.
    hash | 0x0001_0000
}

fn pair_for(tag: u32, gkv: &KeyVector) -> ModuleIdPair {
    ModuleIdPair {
        module_id: 0x0700_0000 | (tag & 0xFFFF),
        module_instance_id: derive_miid(tag, gkv),
    }
}

impl MockEngine {
    /// New mock with an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tag set reported for every graph key vector.
    pub fn with_tags(self, tags: &[u32]) -> Self {
        self.inner.lock().tags = tags.to_vec();
        self
    }

    /// Report `tags` instead of the default set whenever the queried
    /// key vector carries `key`.
    pub fn with_tags_for_key(self, key: u32, tags: &[u32]) -> Self {
        self.inner.lock().keyed_tags.push((key, tags.to_vec()));
        self
    }

    /// Report two module instances for `tag` (malformed-graph case).
    pub fn set_duplicate_tag(&self, tag: Option<u32>) {
        self.inner.lock().duplicate_tag = tag;
    }

    /// Script every subsequent command of kind `op` to fail.
    pub fn fail_on(&self, op: MockOp) {
        self.inner.lock().fail.insert(op);
    }

    /// Clear all scripted failures.
    pub fn clear_failures(&self) {
        self.inner.lock().fail.clear();
    }

    /// Snapshot of the recorded command log.
    pub fn commands(&self) -> Vec<MockCommand> {
        self.inner.lock().commands.clone()
    }

    /// Clear the recorded command log.
    pub fn clear_commands(&self) {
        self.inner.lock().commands.clear();
    }

    /// True once `initialize` was called.
    pub fn initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    /// Set the session time reported for SPR queries.
    pub fn set_session_time(&self, time: u64) {
        self.inner.lock().session_time = time;
    }

    /// Mark the write ring full (non-blocking writes return zero).
    pub fn set_ring_full(&self, full: bool) {
        self.inner.lock().ring_full = full;
    }

    /// Seed the processed-buffer counter.
    pub fn set_processed_count(&self, count: usize) {
        self.inner.lock().processed = count;
    }

    /// Deliver an event to every registered graph callback.
    pub fn inject_event(&self, params: &EventParams) {
        let callbacks = self.inner.lock().callbacks.clone();
        for cb in callbacks {
            cb(params);
        }
    }

    /// The module instance id the mock reports for `tag` under `gkv`.
    pub fn instance_id(&self, tag: u32, gkv: &KeyVector) -> u32 {
        derive_miid(tag, gkv)
    }
}

impl GraphEngine for MockEngine {
    fn initialize(&self, _init: &EngineInitData) -> Result<()> {
        self.inner.lock().initialized = true;
        Ok(())
    }

    fn shutdown(&self) {
        self.inner.lock().initialized = false;
    }

    fn open(&self, gkv: &KeyVector, ckv: &KeyVector) -> Result<Box<dyn EngineGraph>> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::Open)?;
        inner.commands.push(MockCommand::Open {
            gkv: gkv.clone(),
            ckv: ckv.clone(),
        });
        drop(inner);
        Ok(Box::new(MockGraph {
            inner: Arc::clone(&self.inner),
            blocking: true,
        }))
    }

    fn tag_module_info(&self, gkv: &KeyVector) -> Result<Vec<TagModuleInfo>> {
        let inner = self.inner.lock();
        inner.check(MockOp::TagInfo)?;
        Ok(inner
            .tags_for(gkv)
            .iter()
            .map(|&tag| {
                let mut modules = vec![pair_for(tag, gkv)];
                if inner.duplicate_tag == Some(tag) {
                    modules.push(ModuleIdPair {
                        module_id: modules[0].module_id,
                        module_instance_id: modules[0].module_instance_id ^ 1,
                    });
                }
                TagModuleInfo { tag, modules }
            })
            .collect())
    }

    fn tagged_module_info(&self, gkv: &KeyVector, tag: u32) -> Result<Vec<ModuleIdPair>> {
        let inner = self.inner.lock();
        inner.check(MockOp::TagInfo)?;
        if inner.tags_for(gkv).contains(&tag) {
            Ok(vec![pair_for(tag, gkv)])
        } else {
            Err(AgmError::Engine(format!("no module tagged {tag:#x}")))
        }
    }
}

struct MockGraph {
    inner: Arc<Mutex<MockInner>>,
    blocking: bool,
}

impl EngineGraph for MockGraph {
    fn prepare(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::Prepare)?;
        inner.commands.push(MockCommand::Prepare);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::Start)?;
        inner.commands.push(MockCommand::Start);
        Ok(())
    }

    fn stop(&mut self, props: Option<&StopProperties>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::Stop)?;
        inner.commands.push(MockCommand::Stop {
            scoped: props.is_some(),
        });
        Ok(())
    }

    fn eos(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::Eos)?;
        inner.commands.push(MockCommand::Eos);
        Ok(())
    }

    fn add_graph(&mut self, gkv: &KeyVector, _ckv: &KeyVector) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::AddGraph)?;
        inner.commands.push(MockCommand::AddGraph { gkv: gkv.clone() });
        Ok(())
    }

    fn change_graph(&mut self, gkv: &KeyVector, _ckv: &KeyVector) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::ChangeGraph)?;
        inner
            .commands
            .push(MockCommand::ChangeGraph { gkv: gkv.clone() });
        Ok(())
    }

    fn remove_graph(&mut self, gkv: &KeyVector) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::RemoveGraph)?;
        inner
            .commands
            .push(MockCommand::RemoveGraph { gkv: gkv.clone() });
        Ok(())
    }

    fn configure_buffers(&mut self, direction: Direction, setup: &BufferSetup) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::ConfigureBuffers)?;
        self.blocking = setup.blocking;
        inner.commands.push(MockCommand::ConfigureBuffers {
            direction,
            setup: *setup,
        });
        Ok(())
    }

    fn set_custom_config(&mut self, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::SetConfig)?;
        let header = ModuleParamHeader::decode(payload).unwrap_or_default();
        inner.commands.push(MockCommand::SetConfig {
            module_instance_id: header.module_instance_id,
            param_id: header.param_id,
        });
        Ok(())
    }

    fn get_custom_config(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::GetConfig)?;
        let header = ModuleParamHeader::decode(request)?;
        inner.commands.push(MockCommand::GetConfig {
            param_id: header.param_id,
        });

        if header.param_id == params::SPR_SESSION_TIME {
            // Body: session time, absolute time, timestamp - three
            // msw/lsw pairs.
            let time = inner.session_time;
            let mut body = Vec::with_capacity(24);
            for value in [time, time, time] {
                body.extend_from_slice(&((value >> 32) as u32).to_le_bytes());
                body.extend_from_slice(&((value & 0xFFFF_FFFF) as u32).to_le_bytes());
            }
            return Ok(ModuleParamHeader::with_body(
                header.module_instance_id,
                header.param_id,
                &body,
            ));
        }
        Ok(request.to_vec())
    }

    fn set_tagged_config(&mut self, _gkv: &KeyVector, tag: u32, _tkv: &KeyVector) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::SetTaggedConfig)?;
        inner.commands.push(MockCommand::SetTaggedConfig { tag });
        Ok(())
    }

    fn set_cal(&mut self, _gkv: &KeyVector, ckv: &KeyVector) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::SetCal)?;
        inner.commands.push(MockCommand::SetCal { ckv: ckv.clone() });
        Ok(())
    }

    fn write(&mut self, _tag: u32, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::Write)?;
        let written = if inner.ring_full && !self.blocking {
            0
        } else {
            buf.len()
        };
        if written > 0 {
            inner.processed = inner.processed.wrapping_add(1);
        }
        inner.commands.push(MockCommand::Write { len: written });
        Ok(written)
    }

    fn read(&mut self, _tag: u32, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::Read)?;
        buf.fill(0xA5);
        inner.processed = inner.processed.wrapping_add(1);
        inner.commands.push(MockCommand::Read { len: buf.len() });
        Ok(buf.len())
    }

    fn register_event_callback(&mut self, callback: EngineEventCallback) -> Result<()> {
        self.inner.lock().callbacks.push(Arc::from(callback));
        Ok(())
    }

    fn register_custom_event(&mut self, registration: &EventRegistration) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(MockOp::RegisterCustomEvent)?;
        inner.commands.push(MockCommand::RegisterCustomEvent {
            module_instance_id: registration.module_instance_id,
            event_id: registration.event_id,
            register: registration.register,
        });
        Ok(())
    }

    fn processed_buffer_count(&self, _direction: Direction) -> usize {
        self.inner.lock().processed
    }
}

impl Drop for MockGraph {
    fn drop(&mut self) {
        self.inner.lock().commands.push(MockCommand::Close);
    }
}
