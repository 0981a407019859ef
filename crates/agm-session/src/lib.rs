//! Session layer of the Audio Graph Manager.
//!
//! This crate ties the lower layers together:
//!
//! - [`Session`]: the client-visible stream with its lifecycle state
//!   machine, audio interface attachments, owned graph, callback pool
//!   and loopback / echo-reference relationships
//! - [`SessionPool`]: process-wide id-to-session map with lazy
//!   creation
//! - [`AudioGraphManager`]: the public verb set, an explicit runtime
//!   object constructed from a [`ServiceConfig`], a graph engine and a
//!   PCM driver
//!
//! # Example
//!
//! ```rust,ignore
//! use agm_session::{AudioGraphManager, ServiceConfig};
//!
//! let manager = AudioGraphManager::new(&ServiceConfig::default(), engine, driver)?;
//! manager.session_set_metadata(10, &metadata_bytes)?;
//! manager.session_aif_connect(10, 3, true)?;
//! manager.session_open(10)?;
//! manager.session_prepare(10)?;
//! manager.session_start(10)?;
//! let written = manager.session_write(10, &buffer)?;
//! ```

mod aif;
mod callback;
mod manager;
mod pool;
mod service_config;
mod session;

pub use aif::AifState;
pub use callback::SessionEventCallback;
pub use manager::{AudioGraphManager, ServiceContext};
pub use pool::SessionPool;
pub use service_config::ServiceConfig;
pub use session::{Session, SessionState};
