//! Deterministic in-memory PCM driver for tests and CI.

use std::collections::HashSet;
use std::sync::Arc;

use agm_core::{AgmError, Direction, MediaConfig, Result};
use parking_lot::Mutex;

use crate::{PcmDriver, PcmStream};

/// Lifecycle phase of a PCM stream, used for call recording and
/// failure scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PcmPhase {
    /// Stream open.
    Open,
    /// Stream prepare.
    Prepare,
    /// Stream start.
    Start,
    /// Stream stop.
    Stop,
    /// Stream close (drop).
    Close,
}

#[derive(Default)]
struct MockPcmState {
    fail: HashSet<(u32, PcmPhase)>,
    log: Vec<(u32, u32, PcmPhase)>,
    open_streams: Vec<u32>,
}

impl MockPcmState {
    fn check(&self, pcm_id: u32, phase: PcmPhase) -> Result<()> {
        if self.fail.contains(&(pcm_id, phase)) {
            return Err(AgmError::Pcm(format!(
                "scripted failure for pcm {pcm_id} {phase:?}"
            )));
        }
        Ok(())
    }
}

/// PCM driver double recording every call per `(card, pcm)`.
#[derive(Clone, Default)]
pub struct MockPcm {
    inner: Arc<Mutex<MockPcmState>>,
}

impl MockPcm {
    /// New driver with no scripted failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script every subsequent `phase` call on `pcm_id` to fail.
    pub fn fail_on(&self, pcm_id: u32, phase: PcmPhase) {
        self.inner.lock().fail.insert((pcm_id, phase));
    }

    /// Clear all scripted failures.
    pub fn clear_failures(&self) {
        self.inner.lock().fail.clear();
    }

    /// Phases recorded for `pcm_id`, in call order.
    pub fn phases(&self, pcm_id: u32) -> Vec<PcmPhase> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|(_, pcm, _)| *pcm == pcm_id)
            .map(|(_, _, phase)| *phase)
            .collect()
    }

    /// Number of currently open streams on `pcm_id`.
    pub fn open_streams(&self, pcm_id: u32) -> usize {
        self.inner
            .lock()
            .open_streams
            .iter()
            .filter(|&&pcm| pcm == pcm_id)
            .count()
    }
}

impl PcmDriver for MockPcm {
    fn open(
        &self,
        card_id: u32,
        pcm_id: u32,
        _direction: Direction,
        _config: &MediaConfig,
    ) -> Result<Box<dyn PcmStream>> {
        let mut inner = self.inner.lock();
        inner.check(pcm_id, PcmPhase::Open)?;
        inner.log.push((card_id, pcm_id, PcmPhase::Open));
        inner.open_streams.push(pcm_id);
        drop(inner);
        Ok(Box::new(MockStream {
            inner: Arc::clone(&self.inner),
            card_id,
            pcm_id,
        }))
    }
}

struct MockStream {
    inner: Arc<Mutex<MockPcmState>>,
    card_id: u32,
    pcm_id: u32,
}

impl MockStream {
    fn record(&self, phase: PcmPhase) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check(self.pcm_id, phase)?;
        inner.log.push((self.card_id, self.pcm_id, phase));
        Ok(())
    }
}

impl PcmStream for MockStream {
    fn prepare(&mut self) -> Result<()> {
        self.record(PcmPhase::Prepare)
    }

    fn start(&mut self) -> Result<()> {
        self.record(PcmPhase::Start)
    }

    fn stop(&mut self) -> Result<()> {
        self.record(PcmPhase::Stop)
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.log.push((self.card_id, self.pcm_id, PcmPhase::Close));
        if let Some(pos) = inner.open_streams.iter().position(|&pcm| pcm == self.pcm_id) {
            inner.open_streams.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_full_lifecycle() {
        let driver = MockPcm::new();
        let mut stream = driver
            .open(0, 7, Direction::Rx, &MediaConfig::default())
            .unwrap();
        stream.prepare().unwrap();
        stream.start().unwrap();
        stream.stop().unwrap();
        drop(stream);

        assert_eq!(
            driver.phases(7),
            vec![
                PcmPhase::Open,
                PcmPhase::Prepare,
                PcmPhase::Start,
                PcmPhase::Stop,
                PcmPhase::Close,
            ]
        );
        assert_eq!(driver.open_streams(7), 0);
    }

    #[test]
    fn scripted_failure_only_hits_target_device() {
        let driver = MockPcm::new();
        driver.fail_on(2, PcmPhase::Start);

        let mut ok = driver
            .open(0, 1, Direction::Rx, &MediaConfig::default())
            .unwrap();
        let mut bad = driver
            .open(0, 2, Direction::Rx, &MediaConfig::default())
            .unwrap();
        assert!(ok.start().is_ok());
        assert!(bad.start().is_err());
    }
}
