//! Tag and parameter identifiers shared with the graph engine.

use crate::{AgmError, Result};

/// Well-known module tags.
///
/// A tag names the role a module plays in a pipeline; the engine
/// reports which concrete module instances carry each tag under a given
/// graph key vector.
pub mod tags {
    /// Media-format writer at the stream input.
    pub const STREAM_INPUT_MEDIA_FORMAT: u32 = 0xC000_1001;
    /// PCM decoder on the render path.
    pub const STREAM_PCM_DECODER: u32 = 0xC000_1002;
    /// PCM encoder on the capture path.
    pub const STREAM_PCM_ENCODER: u32 = 0xC000_1003;
    /// Shared-memory endpoint the client read/write path targets.
    pub const STREAM_SHMEM_ENDPOINT: u32 = 0xC000_1004;
    /// Session-time reporter.
    pub const STREAM_SPR: u32 = 0xC000_1005;
    /// Soft-pause point.
    pub const STREAM_PAUSE: u32 = 0xC000_1006;
    /// Media-format converter / limiter.
    pub const STREAM_MFC: u32 = 0xC000_1007;
    /// Hardware endpoint on an output (render) device.
    pub const DEVICE_HW_ENDPOINT_RX: u32 = 0xC000_2001;
    /// Hardware endpoint on an input (capture) device.
    pub const DEVICE_HW_ENDPOINT_TX: u32 = 0xC000_2002;
}

/// Well-known module parameter ids.
pub mod params {
    /// Begin a soft pause ramp.
    pub const SOFT_PAUSE_START: u32 = 0x0800_102E;
    /// Resume from a soft pause.
    pub const SOFT_PAUSE_RESUME: u32 = 0x0800_102F;
    /// Query the session-time reporter for its 64-bit timestamp.
    pub const SPR_SESSION_TIME: u32 = 0x0800_1031;
    /// Endpoint routing for the session-time reporter.
    pub const SPR_ENDPOINT_ROUTING: u32 = 0x0800_1032;
    /// Media format configuration on a stream module.
    pub const MEDIA_FORMAT: u32 = 0x0800_1010;
    /// Media format configuration on a hardware endpoint.
    pub const HW_EP_MEDIA_FORMAT: u32 = 0x0800_1020;
}

/// Wire header preceding every module parameter payload.
///
/// Payloads are padded to an 8-byte boundary after the header plus
/// `param_size` bytes of body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleParamHeader {
    /// Instance id of the target module.
    pub module_instance_id: u32,
    /// Parameter id.
    pub param_id: u32,
    /// Error code, zero on requests.
    pub error_code: u32,
    /// Size of the body following this header, in bytes.
    pub param_size: u32,
}

/// Encoded size of [`ModuleParamHeader`].
pub const MODULE_PARAM_HEADER_LEN: usize = 16;

impl ModuleParamHeader {
    /// Header for a request targeting `miid` with `param_id` and a body
    /// of `param_size` bytes.
    pub const fn request(module_instance_id: u32, param_id: u32, param_size: u32) -> Self {
        Self {
            module_instance_id,
            param_id,
            error_code: 0,
            param_size,
        }
    }

    /// Encode to the wire layout.
    pub fn encode(&self) -> [u8; MODULE_PARAM_HEADER_LEN] {
        let mut out = [0u8; MODULE_PARAM_HEADER_LEN];
        out[0..4].copy_from_slice(&self.module_instance_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.param_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.error_code.to_le_bytes());
        out[12..16].copy_from_slice(&self.param_size.to_le_bytes());
        out
    }

    /// Decode from the wire layout.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MODULE_PARAM_HEADER_LEN {
            return Err(AgmError::invalid_argument(
                "module param payload shorter than its header",
            ));
        }
        let word = |i: usize| u32::from_le_bytes(bytes[i..i + 4].try_into().expect("4-byte slice"));
        Ok(Self {
            module_instance_id: word(0),
            param_id: word(4),
            error_code: word(8),
            param_size: word(12),
        })
    }

    /// Build a full payload: header, body, zero padding to an 8-byte
    /// boundary.
    pub fn with_body(module_instance_id: u32, param_id: u32, body: &[u8]) -> Vec<u8> {
        let header = Self::request(module_instance_id, param_id, body.len() as u32);
        let mut out = Vec::with_capacity(aligned_len(MODULE_PARAM_HEADER_LEN + body.len()));
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(body);
        out.resize(aligned_len(out.len()), 0);
        out
    }
}

/// Round `len` up to the engine's 8-byte payload alignment.
pub fn aligned_len(len: usize) -> usize {
    len.div_ceil(8) * 8
}
