//! Core types for the Audio Graph Manager.
//!
//! This crate provides the data model shared by every AGM layer:
//!
//! - **Key vectors and metadata**: [`KeyVector`], [`Metadata`] with the
//!   flat wire format used by clients, N-way merge, and calibration
//!   overwrite
//! - **Configuration**: [`MediaConfig`], [`StreamConfig`],
//!   [`BufferConfig`] and the codec parameter structs
//! - **Events**: [`EventType`], [`EventParams`] and the data-path event
//!   ids delivered to client callbacks
//! - **Module identifiers**: the tag and parameter-id constants shared
//!   with the graph engine, plus the [`ModuleParamHeader`] wire header
//!
//! # Example
//!
//! ```rust
//! use agm_core::{KeyValue, Metadata};
//!
//! let mut meta = Metadata::default();
//! meta.gkv.push(KeyValue::new(0xA100_0000, 0x1));
//! let bytes = meta.to_bytes();
//! assert_eq!(Metadata::from_bytes(&bytes).unwrap(), meta);
//! ```

mod config;
mod event;
mod ids;
mod metadata;

pub use config::{
    AacDecoder, AifInfo, AlacDecoder, ApeDecoder, BufferConfig, DataMode, Direction, FlacDecoder,
    MediaConfig, MediaFormat, SessionCodec, StreamConfig, TagConfig, WmaDecoder, WmaProDecoder,
    AIF_NAME_MAX_LEN,
};
pub use event::{
    EventParams, EventRegistration, EventType, ENGINE_EVENT_SOURCE_MODULE, EVENT_ID_EOS_RENDERED,
    EVENT_ID_READ_DONE, EVENT_ID_WRITE_DONE,
};
pub use ids::{aligned_len, params, tags, ModuleParamHeader, MODULE_PARAM_HEADER_LEN};
pub use metadata::{KeyValue, KeyVector, Metadata, PropertyData};

/// Error type shared across the audio graph manager.
///
/// The variants mirror the service's errno-style return surface:
/// argument and state errors never mutate state, resource errors roll
/// back any partial effect before surfacing.
#[derive(Debug, thiserror::Error)]
pub enum AgmError {
    /// Malformed input: null-equivalent ids, out-of-range values,
    /// truncated metadata blobs.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is legal in the abstract but not in the object's
    /// current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The request is redundant: the object is already in the requested
    /// state.
    #[error("already in requested state: {0}")]
    Already(String),

    /// A session operation that needs at least one staged audio
    /// interface found none.
    #[error("no audio interface attached to session")]
    NoAifAttached,

    /// Graph engine failure, propagated unchanged.
    #[error("graph engine error: {0}")]
    Engine(String),

    /// PCM driver failure, propagated unchanged.
    #[error("pcm driver error: {0}")]
    Pcm(String),

    /// Filesystem error (PCM registry, ACDB directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgmError {
    /// Create an `InvalidArgument` error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        AgmError::InvalidArgument(msg.into())
    }

    /// Create an `InvalidState` error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        AgmError::InvalidState(msg.into())
    }

    /// Create an `Already` error.
    pub fn already(msg: impl Into<String>) -> Self {
        AgmError::Already(msg.into())
    }
}

/// Convenience result type used throughout the workspace.
pub type Result<T> = std::result::Result<T, AgmError>;
