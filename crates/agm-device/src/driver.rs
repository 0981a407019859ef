//! PCM driver seam.
//!
//! The manager never talks to hardware directly; it opens streams
//! through an object-safe [`PcmDriver`] handed in at registry
//! construction. Closing a stream is dropping it.

use agm_core::{Direction, MediaConfig, Result};

/// One opened PCM stream.
///
/// Calls may block at the rate of a DMA cycle; the owning device's
/// lock is held across them by design.
pub trait PcmStream: Send {
    /// Arm the stream for data flow.
    fn prepare(&mut self) -> Result<()>;

    /// Start the stream.
    fn start(&mut self) -> Result<()>;

    /// Stop the stream.
    fn stop(&mut self) -> Result<()>;
}

/// Platform PCM driver.
pub trait PcmDriver: Send + Sync {
    /// Open the PCM identified by `(card_id, pcm_id)` in `direction`
    /// with the given media configuration.
    fn open(
        &self,
        card_id: u32,
        pcm_id: u32,
        direction: Direction,
        config: &MediaConfig,
    ) -> Result<Box<dyn PcmStream>>;
}
