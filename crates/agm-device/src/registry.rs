//! PCM registry enumeration.
//!
//! The platform exposes its PCM endpoints as a line-oriented text file
//! (`/proc/asound/pcm` on Linux). Each parseable line becomes one
//! [`Device`]; unparseable lines are skipped with a diagnostic so a
//! partially valid registry still yields a working device table.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use agm_core::{AgmError, AifInfo, Direction, Result, AIF_NAME_MAX_LEN};
use tracing::{info, warn};

use crate::{Device, PcmDriver};

/// One parsed registry line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmEntry {
    /// Sound card id.
    pub card_id: u32,
    /// PCM device id on the card.
    pub pcm_id: u32,
    /// Endpoint name.
    pub name: String,
    /// Endpoint direction.
    pub direction: Direction,
}

/// Parse one `<card>-<pcm>: <name> ...` line. The direction token
/// (`playback` or `capture`) may appear anywhere after the name.
fn parse_line(line: &str) -> Option<PcmEntry> {
    let (ids, rest) = line.split_once(':')?;
    let (card, pcm) = ids.trim().split_once('-')?;
    let card_id = card.parse().ok()?;
    let pcm_id = pcm.parse().ok()?;

    let name = rest
        .split(':')
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty())?;

    // Parse both tokens explicitly; a playback-capable endpoint is a
    // render device even when it also lists capture.
    let direction = if rest.contains("playback") {
        Direction::Rx
    } else if rest.contains("capture") {
        Direction::Tx
    } else {
        return None;
    };

    let mut name = name.to_string();
    name.truncate(AIF_NAME_MAX_LEN);

    Some(PcmEntry {
        card_id,
        pcm_id,
        name,
        direction,
    })
}

/// Parse a whole registry, skipping blank and malformed lines.
pub fn parse_pcm_registry(reader: impl BufRead) -> Result<Vec<PcmEntry>> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Some(entry) => entries.push(entry),
            None => warn!(line = %line, "skipping unparseable pcm registry line"),
        }
    }
    Ok(entries)
}

/// Process-wide table of audio endpoints.
///
/// Devices are stored in registry order, so the index is the stable
/// audio interface id handed to clients.
pub struct DeviceRegistry {
    devices: Vec<Arc<Device>>,
}

impl DeviceRegistry {
    /// Build the registry from registry text and a PCM driver.
    pub fn from_reader(reader: impl BufRead, driver: Arc<dyn PcmDriver>) -> Result<Self> {
        let entries = parse_pcm_registry(reader)?;
        let devices = entries
            .into_iter()
            .enumerate()
            .map(|(aif_id, entry)| {
                info!(
                    aif_id,
                    card = entry.card_id,
                    pcm = entry.pcm_id,
                    name = %entry.name,
                    "audio interface"
                );
                Arc::new(Device::new(
                    aif_id as u32,
                    entry.card_id,
                    entry.pcm_id,
                    entry.name,
                    entry.direction,
                    Arc::clone(&driver),
                ))
            })
            .collect();
        Ok(Self { devices })
    }

    /// Build the registry from the platform registry file.
    pub fn from_file(path: &Path, driver: Arc<dyn PcmDriver>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file), driver)
    }

    /// Number of enumerated interfaces.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if no interface was enumerated.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Look up a device by audio interface id.
    pub fn get(&self, aif_id: u32) -> Result<Arc<Device>> {
        self.devices
            .get(aif_id as usize)
            .cloned()
            .ok_or_else(|| {
                AgmError::invalid_argument(format!(
                    "aif id {aif_id} out of range, {} interfaces enumerated",
                    self.devices.len()
                ))
            })
    }

    /// Devices in interface order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.iter()
    }

    /// Two-pass interface enumeration.
    ///
    /// With `list` absent or `*count == 0`, only reports the number of
    /// interfaces. Otherwise fills at most `*count` entries and updates
    /// `*count` with the number copied.
    pub fn aif_info_list(&self, list: Option<&mut [AifInfo]>, count: &mut usize) {
        match list {
            None => *count = self.devices.len(),
            Some(_) if *count == 0 => *count = self.devices.len(),
            Some(out) => {
                let copied = self.devices.len().min(*count).min(out.len());
                for (slot, device) in out.iter_mut().zip(&self.devices).take(copied) {
                    *slot = AifInfo {
                        name: device.name().to_string(),
                        direction: device.direction(),
                    };
                }
                *count = copied;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = "\
00-00: Speaker Out : : playback 1
00-01: Builtin Mic : : capture 1

garbage line without structure
00-02: HDMI Out : : playback 1
99-xx: broken ids : : playback 1
";

    #[test]
    fn parses_valid_lines_and_skips_junk() {
        let entries = parse_pcm_registry(REGISTRY.as_bytes()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "Speaker Out");
        assert_eq!(entries[0].direction, Direction::Rx);
        assert_eq!(entries[1].direction, Direction::Tx);
        assert_eq!(entries[2].pcm_id, 2);
    }

    #[test]
    fn line_without_direction_token_is_skipped() {
        let entries = parse_pcm_registry("00-03: Mystery : : 1\n".as_bytes()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn long_names_are_truncated() {
        let line = format!("00-00: {} : : playback 1\n", "x".repeat(100));
        let entries = parse_pcm_registry(line.as_bytes()).unwrap();
        assert_eq!(entries[0].name.len(), AIF_NAME_MAX_LEN);
    }

    #[cfg(feature = "mock")]
    mod with_driver {
        use super::*;
        use crate::mock::MockPcm;

        fn registry() -> DeviceRegistry {
            DeviceRegistry::from_reader(REGISTRY.as_bytes(), Arc::new(MockPcm::new())).unwrap()
        }

        #[test]
        fn aif_ids_are_registry_order() {
            let registry = registry();
            assert_eq!(registry.len(), 3);
            assert_eq!(registry.get(1).unwrap().pcm_id(), 1);
            assert!(registry.get(3).is_err());
        }

        #[test]
        fn two_pass_enumeration() {
            let registry = registry();

            let mut count = 0;
            registry.aif_info_list(None, &mut count);
            assert_eq!(count, 3);

            let empty_aif = AifInfo {
                name: String::new(),
                direction: Direction::Rx,
            };
            let mut list = vec![empty_aif.clone(); 3];
            let mut count = 3;
            registry.aif_info_list(Some(&mut list), &mut count);
            assert_eq!(count, 3);
            assert_eq!(list[0].name, "Speaker Out");

            // Asking for more than available fills only what exists.
            let mut list = vec![empty_aif; 5];
            let mut count = 5;
            registry.aif_info_list(Some(&mut list), &mut count);
            assert_eq!(count, 3);
            assert!(list[3].name.is_empty());
        }

        #[test]
        fn from_missing_file_is_io_error() {
            let dir = tempfile::tempdir().unwrap();
            let missing = dir.path().join("pcm");
            assert!(DeviceRegistry::from_file(&missing, Arc::new(MockPcm::new())).is_err());
        }
    }
}
