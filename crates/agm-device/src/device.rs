//! Device objects and their lifecycle state machine.

use std::sync::Arc;
use std::thread::JoinHandle;

use agm_core::{AgmError, Direction, KeyVector, MediaConfig, Metadata, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::PcmDriver;
use crate::PcmStream;

/// Lifecycle state of a device.
///
/// `Closed → Opened → Prepared → Started ⇄ Stopped`; close from any
/// state at or above `Opened` returns to `Closed` once the open
/// refcount reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    /// No PCM handle is held.
    Closed,
    /// PCM opened with the current media config.
    Opened,
    /// PCM armed for data flow.
    Prepared,
    /// PCM running.
    Started,
    /// PCM stopped after running.
    Stopped,
}

#[derive(Debug, Clone, Copy, Default)]
struct Refcounts {
    open: u32,
    prepare: u32,
    start: u32,
}

struct DeviceInner {
    media_config: MediaConfig,
    metadata: Metadata,
    state: DeviceState,
    refs: Refcounts,
    stream: Option<Box<dyn PcmStream>>,
    prepare_thread: Option<JoinHandle<Result<()>>>,
}

/// One physical audio endpoint, shared across sessions.
///
/// All mutable state sits behind the device's own lock; sessions hold
/// `Arc<Device>` clones and drive lifecycle transitions through the
/// refcounted methods.
pub struct Device {
    aif_id: u32,
    card_id: u32,
    pcm_id: u32,
    name: String,
    direction: Direction,
    driver: Arc<dyn PcmDriver>,
    inner: Mutex<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("aif_id", &self.aif_id)
            .field("card_id", &self.card_id)
            .field("pcm_id", &self.pcm_id)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Promote the calling thread to FIFO scheduling so PCM prepare is not
/// delayed by lower-priority work.
#[cfg(target_os = "linux")]
fn promote_to_fifo() {
    let param = libc::sched_param { sched_priority: 70 };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        debug!("sched_setscheduler failed, prepare runs at normal priority");
    }
}

#[cfg(not(target_os = "linux"))]
fn promote_to_fifo() {}

impl Device {
    pub(crate) fn new(
        aif_id: u32,
        card_id: u32,
        pcm_id: u32,
        name: String,
        direction: Direction,
        driver: Arc<dyn PcmDriver>,
    ) -> Self {
        Self {
            aif_id,
            card_id,
            pcm_id,
            name,
            direction,
            driver,
            inner: Mutex::new(DeviceInner {
                media_config: MediaConfig::default(),
                metadata: Metadata::default(),
                state: DeviceState::Closed,
                refs: Refcounts::default(),
                stream: None,
                prepare_thread: None,
            }),
        }
    }

    /// Audio interface id of this device.
    pub fn aif_id(&self) -> u32 {
        self.aif_id
    }

    /// Sound card id.
    pub fn card_id(&self) -> u32 {
        self.card_id
    }

    /// PCM device id on the card.
    pub fn pcm_id(&self) -> u32 {
        self.pcm_id
    }

    /// Endpoint name from the platform registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    /// Current open refcount.
    pub fn open_refcount(&self) -> u32 {
        self.inner.lock().refs.open
    }

    /// Current start refcount.
    pub fn start_refcount(&self) -> u32 {
        self.inner.lock().refs.start
    }

    /// Endpoint metadata bundle.
    pub fn metadata(&self) -> Metadata {
        self.inner.lock().metadata.clone()
    }

    /// Replace the endpoint metadata bundle.
    pub fn set_metadata(&self, metadata: Metadata) {
        self.inner.lock().metadata = metadata;
    }

    /// Apply a calibration patch to the endpoint metadata.
    pub fn update_cal(&self, patch: &KeyVector) {
        self.inner.lock().metadata.update_cal(patch);
    }

    /// Current media configuration.
    pub fn media_config(&self) -> MediaConfig {
        self.inner.lock().media_config
    }

    /// Store the media configuration used at next open.
    ///
    /// While the device is held open, a differing configuration is
    /// rejected: the PCM cannot be reconfigured under a live user.
    pub fn set_media_config(&self, config: &MediaConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.refs.open > 0 && inner.media_config != *config {
            return Err(AgmError::invalid_state(format!(
                "device {} is in use with a different media config",
                self.aif_id
            )));
        }
        inner.media_config = *config;
        Ok(())
    }

    /// Open the PCM, or bump the open refcount if already open.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.refs.open > 0 {
            debug!(pcm = self.pcm_id, "device already opened");
            inner.refs.open += 1;
            return Ok(());
        }

        let stream = self
            .driver
            .open(self.card_id, self.pcm_id, self.direction, &inner.media_config)?;
        inner.stream = Some(stream);
        inner.state = DeviceState::Opened;
        inner.refs.open = 1;
        Ok(())
    }

    /// Arm the PCM for data flow.
    ///
    /// The first caller dispatches the driver prepare onto a dedicated
    /// FIFO-priority thread; subsequent callers only bump the prepare
    /// refcount. [`start`] joins that thread before inspecting state.
    ///
    /// [`start`]: Device::start
    pub fn prepare(self: Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.refs.open == 0 {
            return Err(AgmError::invalid_state(format!(
                "device {} prepare before open",
                self.aif_id
            )));
        }
        if inner.refs.prepare > 0 {
            debug!(pcm = self.pcm_id, "device already prepared");
            inner.refs.prepare += 1;
            return Ok(());
        }

        let device = Arc::clone(&self);
        let handle = std::thread::Builder::new()
            .name(format!("agm-prep-{}", self.pcm_id))
            .spawn(move || {
                promote_to_fifo();
                let mut inner = device.inner.lock();
                let stream = inner.stream.as_mut().ok_or_else(|| {
                    AgmError::invalid_state(format!("device {} closed during prepare", device.aif_id))
                })?;
                stream.prepare()?;
                inner.state = DeviceState::Prepared;
                inner.refs.prepare += 1;
                Ok(())
            })?;
        inner.prepare_thread = Some(handle);
        Ok(())
    }

    /// Start the PCM, or bump the start refcount if already running.
    ///
    /// Joins an outstanding prepare thread first; a failed prepare
    /// surfaces here.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.prepare_thread.take() {
            // The prepare thread takes the device lock; release it
            // across the join.
            drop(inner);
            let prepared = handle
                .join()
                .map_err(|_| AgmError::Pcm(format!("device {} prepare thread panicked", self.aif_id)))?;
            prepared?;
            inner = self.inner.lock();
        }

        if inner.state < DeviceState::Prepared {
            return Err(AgmError::invalid_state(format!(
                "device {} not prepared",
                self.aif_id
            )));
        }

        if inner.refs.start > 0 {
            debug!(pcm = self.pcm_id, "device already started");
            inner.refs.start += 1;
            return Ok(());
        }

        let stream = inner.stream.as_mut().ok_or_else(|| {
            AgmError::invalid_state(format!("device {} has no pcm handle", self.aif_id))
        })?;
        stream.start()?;
        inner.state = DeviceState::Started;
        inner.refs.start = 1;
        Ok(())
    }

    /// Stop the PCM. Only the last stopper stops the hardware.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.refs.start == 0 {
            debug!(pcm = self.pcm_id, "device already stopped");
            return Ok(());
        }
        if inner.refs.start > 1 {
            inner.refs.start -= 1;
            return Ok(());
        }

        let stream = inner.stream.as_mut().ok_or_else(|| {
            AgmError::invalid_state(format!("device {} has no pcm handle", self.aif_id))
        })?;
        stream.stop()?;
        inner.state = DeviceState::Stopped;
        inner.refs.start = 0;
        Ok(())
    }

    /// Release one open reference; the last closer closes the PCM and
    /// resets the prepare/start counts.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.refs.open == 0 {
            return Err(AgmError::invalid_state(format!(
                "device {} close without open",
                self.aif_id
            )));
        }
        inner.refs.open -= 1;
        if inner.refs.open == 0 {
            // A queued prepare thread finds the stream gone and bails;
            // its handle is dropped detached.
            if inner.prepare_thread.take().is_some() {
                warn!(pcm = self.pcm_id, "closing device with prepare in flight");
            }
            inner.stream = None;
            inner.state = DeviceState::Closed;
            inner.refs = Refcounts::default();
        }
        Ok(())
    }
}
