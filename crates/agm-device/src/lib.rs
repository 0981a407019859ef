//! Audio endpoint registry for the Audio Graph Manager.
//!
//! One [`Device`] exists per physical PCM endpoint, enumerated from the
//! platform's PCM registry at service start. Devices are shared across
//! sessions through per-phase refcounts: the first opener opens the
//! PCM, the last closer closes it, and likewise for prepare and start.
//!
//! The PCM driver itself sits behind the [`PcmDriver`] trait so the
//! registry can run against real hardware or the deterministic
//! [`mock::MockPcm`] in tests.

mod device;
mod driver;
#[cfg(feature = "mock")]
pub mod mock;
mod registry;

pub use device::{Device, DeviceState};
pub use driver::{PcmDriver, PcmStream};
pub use registry::{parse_pcm_registry, DeviceRegistry, PcmEntry};
