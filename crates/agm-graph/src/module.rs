//! Tagged module roles and their configuration payloads.
//!
//! Every module the manager cares about plays one well-known role in
//! the pipeline. The role is a closed enum so that adding a tag forces
//! every match to be revisited; configuration payloads are emitted from
//! a single exhaustive dispatch instead of per-module function
//! pointers.

use std::sync::Arc;

use agm_core::{
    params, tags, Direction, KeyVector, MediaConfig, MediaFormat, ModuleParamHeader, Result,
    StreamConfig,
};
use agm_device::Device;
use agm_engine::EngineGraph;

/// Role a tagged module plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleRole {
    /// PCM decoder on the render path.
    PcmDecoder,
    /// PCM encoder on the capture path.
    PcmEncoder,
    /// Media-format writer at the stream input.
    MediaFormatWriter,
    /// Shared-memory endpoint for client read/write.
    ShmemEndpoint,
    /// Session-time reporter.
    Spr,
    /// Soft-pause point.
    Pause,
    /// Media-format converter.
    Mfc,
    /// Hardware endpoint of an output device.
    HwEndpointRx,
    /// Hardware endpoint of an input device.
    HwEndpointTx,
}

impl ModuleRole {
    /// The tag naming this role.
    pub fn tag(self) -> u32 {
        match self {
            ModuleRole::PcmDecoder => tags::STREAM_PCM_DECODER,
            ModuleRole::PcmEncoder => tags::STREAM_PCM_ENCODER,
            ModuleRole::MediaFormatWriter => tags::STREAM_INPUT_MEDIA_FORMAT,
            ModuleRole::ShmemEndpoint => tags::STREAM_SHMEM_ENDPOINT,
            ModuleRole::Spr => tags::STREAM_SPR,
            ModuleRole::Pause => tags::STREAM_PAUSE,
            ModuleRole::Mfc => tags::STREAM_MFC,
            ModuleRole::HwEndpointRx => tags::DEVICE_HW_ENDPOINT_RX,
            ModuleRole::HwEndpointTx => tags::DEVICE_HW_ENDPOINT_TX,
        }
    }

    /// Stream-side template list, in configure order.
    pub fn stream_roles() -> &'static [ModuleRole] {
        &[
            ModuleRole::MediaFormatWriter,
            ModuleRole::PcmDecoder,
            ModuleRole::PcmEncoder,
            ModuleRole::ShmemEndpoint,
            ModuleRole::Spr,
            ModuleRole::Pause,
            ModuleRole::Mfc,
        ]
    }

    /// Device-side template list.
    pub fn device_roles() -> &'static [ModuleRole] {
        &[ModuleRole::HwEndpointRx, ModuleRole::HwEndpointTx]
    }

    /// The endpoint role for a device of the given direction.
    pub fn endpoint_for(direction: Direction) -> ModuleRole {
        match direction {
            Direction::Rx => ModuleRole::HwEndpointRx,
            Direction::Tx => ModuleRole::HwEndpointTx,
        }
    }

    /// True for the hardware endpoint roles.
    pub fn is_hw_endpoint(self) -> bool {
        matches!(self, ModuleRole::HwEndpointRx | ModuleRole::HwEndpointTx)
    }
}

/// Wire code for a media format in module payloads.
fn format_code(format: MediaFormat) -> u32 {
    match format {
        MediaFormat::PcmS8 => 1,
        MediaFormat::PcmS16Le => 2,
        MediaFormat::PcmS24Le => 3,
        MediaFormat::PcmS24Packed => 4,
        MediaFormat::PcmS32Le => 5,
        MediaFormat::Mp3 => 6,
        MediaFormat::Aac => 7,
        MediaFormat::Flac => 8,
        MediaFormat::Alac => 9,
        MediaFormat::Ape => 10,
        MediaFormat::WmaStd => 11,
        MediaFormat::WmaPro => 12,
        MediaFormat::Vorbis => 13,
    }
}

fn media_format_body(config: &MediaConfig) -> Vec<u8> {
    let mut body = Vec::with_capacity(16);
    body.extend_from_slice(&config.rate.to_le_bytes());
    body.extend_from_slice(&config.channels.to_le_bytes());
    body.extend_from_slice(&config.format.bits_per_sample().to_le_bytes());
    body.extend_from_slice(&format_code(config.format).to_le_bytes());
    body
}

/// Inputs needed while configuring modules.
pub struct ConfigureContext<'a> {
    /// Session stream configuration.
    pub stream: &'a StreamConfig,
    /// Session media configuration.
    pub media: &'a MediaConfig,
    /// Instance ids of the resolved hardware endpoints, for modules
    /// whose routing depends on the device set.
    pub endpoint_miids: &'a [u32],
}

/// One module resolved for a graph from the effective key vector.
pub struct ResolvedModule {
    /// Role of the module.
    pub role: ModuleRole,
    /// Module type id reported by the engine.
    pub module_id: u32,
    /// Module instance id reported by the engine.
    pub miid: u32,
    /// Owning device, for device-side modules.
    pub device: Option<Arc<Device>>,
    /// Key vector the module was resolved under, for later tagged
    /// calibration queries. Device-side modules only.
    pub gkv: Option<KeyVector>,
    /// True once the configure payload has been sent.
    pub configured: bool,
}

impl ResolvedModule {
    /// Emit this module's configuration payload into the engine.
    pub fn configure(&self, ctx: &ConfigureContext<'_>, handle: &mut dyn EngineGraph) -> Result<()> {
        match self.role {
            ModuleRole::PcmDecoder | ModuleRole::PcmEncoder | ModuleRole::MediaFormatWriter => {
                let payload = ModuleParamHeader::with_body(
                    self.miid,
                    params::MEDIA_FORMAT,
                    &media_format_body(ctx.media),
                );
                handle.set_custom_config(&payload)
            }
            ModuleRole::Mfc => {
                // The converter is configured to the stream format; the
                // engine negotiates the device-side format itself.
                let payload = ModuleParamHeader::with_body(
                    self.miid,
                    params::MEDIA_FORMAT,
                    &media_format_body(ctx.media),
                );
                handle.set_custom_config(&payload)
            }
            ModuleRole::Spr => {
                let mut body = Vec::with_capacity(4 + 4 * ctx.endpoint_miids.len());
                body.extend_from_slice(&(ctx.endpoint_miids.len() as u32).to_le_bytes());
                for miid in ctx.endpoint_miids {
                    body.extend_from_slice(&miid.to_le_bytes());
                }
                let payload =
                    ModuleParamHeader::with_body(self.miid, params::SPR_ENDPOINT_ROUTING, &body);
                handle.set_custom_config(&payload)
            }
            ModuleRole::HwEndpointRx | ModuleRole::HwEndpointTx => {
                let config = self
                    .device
                    .as_ref()
                    .map_or(*ctx.media, |device| device.media_config());
                let payload = ModuleParamHeader::with_body(
                    self.miid,
                    params::HW_EP_MEDIA_FORMAT,
                    &media_format_body(&config),
                );
                handle.set_custom_config(&payload)
            }
            // The shared-memory endpoint is configured through the
            // buffer setup command; pause only acts on pause/resume.
            ModuleRole::ShmemEndpoint | ModuleRole::Pause => Ok(()),
        }
    }
}
