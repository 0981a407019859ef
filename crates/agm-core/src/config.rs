//! Session, media and buffer configuration types.

/// Maximum length of an audio interface name, including padding.
pub const AIF_NAME_MAX_LEN: usize = 28;

/// Sample formats the service understands.
///
/// The PCM variants map directly onto driver formats; the compressed
/// variants select a decoder/encoder module in the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MediaFormat {
    /// 8-bit signed PCM.
    PcmS8,
    /// 16-bit signed little-endian PCM.
    #[default]
    PcmS16Le,
    /// 24 bits in 4 bytes, little-endian.
    PcmS24Le,
    /// 24 bits in 3 bytes, little-endian.
    PcmS24Packed,
    /// 32-bit signed little-endian PCM.
    PcmS32Le,
    /// MP3 bitstream.
    Mp3,
    /// AAC bitstream.
    Aac,
    /// FLAC bitstream.
    Flac,
    /// ALAC bitstream.
    Alac,
    /// APE bitstream.
    Ape,
    /// WMA standard bitstream.
    WmaStd,
    /// WMA professional bitstream.
    WmaPro,
    /// Vorbis bitstream.
    Vorbis,
}

impl MediaFormat {
    /// Bit width of one sample for PCM formats; compressed formats
    /// report 16 (the post-decode width the engine assumes).
    pub fn bits_per_sample(self) -> u32 {
        match self {
            MediaFormat::PcmS8 => 8,
            MediaFormat::PcmS24Packed | MediaFormat::PcmS24Le => 24,
            MediaFormat::PcmS32Le => 32,
            _ => 16,
        }
    }

    /// Bytes occupied by one sample in client buffers.
    pub fn bytes_per_sample(self) -> u32 {
        match self {
            MediaFormat::PcmS8 => 1,
            MediaFormat::PcmS24Packed => 3,
            MediaFormat::PcmS24Le | MediaFormat::PcmS32Le => 4,
            _ => 2,
        }
    }

    /// True for raw PCM formats.
    pub fn is_pcm(self) -> bool {
        matches!(
            self,
            MediaFormat::PcmS8
                | MediaFormat::PcmS16Le
                | MediaFormat::PcmS24Le
                | MediaFormat::PcmS24Packed
                | MediaFormat::PcmS32Le
        )
    }
}

/// Stream/device direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Render path: client (or decoder) to device.
    Rx,
    /// Capture path: device to client.
    Tx,
}

/// Data transfer mode for the client read/write path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataMode {
    /// Writes block while the shared-memory ring is full; reads block
    /// until data arrives.
    #[default]
    Blocking,
    /// Partial counts are returned immediately.
    NonBlocking,
}

/// AAC decoder parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AacDecoder {
    /// Bitstream format flag.
    pub format_flag: u16,
    /// Audio object type.
    pub audio_object_type: u16,
    /// Channel count.
    pub num_channels: u16,
    /// Size of the PCE payload in bits.
    pub pce_bits_size: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// FLAC decoder parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlacDecoder {
    /// Channel count.
    pub num_channels: u16,
    /// Sample size in bits.
    pub sample_size: u16,
    /// Minimum block size.
    pub min_blk_size: u16,
    /// Maximum block size.
    pub max_blk_size: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Minimum frame size.
    pub min_frame_size: u32,
    /// Maximum frame size.
    pub max_frame_size: u32,
}

/// ALAC decoder parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlacDecoder {
    /// Frame length.
    pub frame_length: u32,
    /// Compatibility version.
    pub compatible_version: u8,
    /// Bit depth.
    pub bit_depth: u8,
    /// Rice parameter `pb`.
    pub pb: u8,
    /// Rice parameter `mb`.
    pub mb: u8,
    /// Rice parameter `kb`.
    pub kb: u8,
    /// Channel count.
    pub num_channels: u8,
    /// Maximum run length.
    pub max_run: u16,
    /// Maximum frame size in bytes.
    pub max_frame_bytes: u32,
    /// Average bit rate.
    pub avg_bit_rate: u32,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel layout tag.
    pub channel_layout_tag: u32,
}

/// APE decoder parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApeDecoder {
    /// Compatibility version.
    pub compatible_version: u16,
    /// Compression level.
    pub compression_level: u16,
    /// Format flags.
    pub format_flags: u32,
    /// Blocks per frame.
    pub blocks_per_frame: u32,
    /// Blocks in the final frame.
    pub final_frame_blocks: u32,
    /// Total frame count.
    pub total_frames: u32,
    /// Bit width.
    pub bit_width: u16,
    /// Channel count.
    pub num_channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Whether a seek table is present.
    pub seek_table_present: u32,
}

/// WMA standard decoder parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WmaDecoder {
    /// Format tag.
    pub fmt_tag: u16,
    /// Channel count.
    pub num_channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Average bytes per second.
    pub avg_bytes_per_sec: u32,
    /// Block alignment.
    pub blk_align: u16,
    /// Bits per sample.
    pub bits_per_sample: u16,
    /// Channel mask.
    pub channel_mask: u32,
    /// Encoder options.
    pub enc_options: u16,
}

/// WMA professional decoder parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WmaProDecoder {
    /// Format tag.
    pub fmt_tag: u16,
    /// Channel count.
    pub num_channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Average bytes per second.
    pub avg_bytes_per_sec: u32,
    /// Block alignment.
    pub blk_align: u16,
    /// Bits per sample.
    pub bits_per_sample: u16,
    /// Channel mask.
    pub channel_mask: u32,
    /// Encoder options.
    pub enc_options: u16,
    /// Advanced encoder options.
    pub advanced_enc_option: u16,
    /// Second advanced encoder options word.
    pub advanced_enc_option2: u32,
}

/// Per-session codec configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionCodec {
    /// Raw PCM, no codec parameters.
    #[default]
    None,
    /// AAC decode parameters.
    Aac(AacDecoder),
    /// FLAC decode parameters.
    Flac(FlacDecoder),
    /// ALAC decode parameters.
    Alac(AlacDecoder),
    /// APE decode parameters.
    Ape(ApeDecoder),
    /// WMA standard decode parameters.
    Wma(WmaDecoder),
    /// WMA professional decode parameters.
    WmaPro(WmaProDecoder),
}

/// Media configuration for a session or audio interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConfig {
    /// Sample rate in Hz.
    pub rate: u32,
    /// Channel count.
    pub channels: u32,
    /// Sample format.
    pub format: MediaFormat,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            rate: 48_000,
            channels: 2,
            format: MediaFormat::PcmS16Le,
        }
    }
}

/// Stream configuration for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Data direction of the session.
    pub direction: Direction,
    /// True when the session exchanges no data with the client
    /// (device-to-device loopback). No buffer configuration applies.
    pub hostless: bool,
    /// Start threshold in bytes (buffers x buffer size).
    pub start_threshold: u32,
    /// Stop threshold in bytes.
    pub stop_threshold: u32,
    /// Codec parameters for compressed sessions.
    pub codec: SessionCodec,
    /// Read/write transfer mode.
    pub data_mode: DataMode,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            direction: Direction::Rx,
            hostless: false,
            start_threshold: 0,
            stop_threshold: 0,
            codec: SessionCodec::None,
            data_mode: DataMode::Blocking,
        }
    }
}

/// Client buffer configuration for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferConfig {
    /// Number of buffers.
    pub count: u32,
    /// Size of each buffer in bytes.
    pub size: usize,
}

/// Descriptor of one audio interface, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AifInfo {
    /// Interface name, truncated to [`AIF_NAME_MAX_LEN`] bytes.
    pub name: String,
    /// Endpoint direction.
    pub direction: Direction,
}

/// A tag-scoped parameter set: one tag plus the tag key vector
/// parameterizing its module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagConfig {
    /// Target tag.
    pub tag: u32,
    /// Tag key vector.
    pub tkv: crate::KeyVector,
}
