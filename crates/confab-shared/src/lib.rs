//! # confab-shared
//!
//! Types shared by every layer of the Confab SDK: entity identifiers,
//! the JSON socket wire protocol, the error taxonomy, timing constants,
//! and the exponential-backoff helper used by both the online tracker
//! and the socket reconnect logic.

pub mod backoff;
pub mod constants;
pub mod ids;
pub mod protocol;

mod error;

pub use error::{ConfabError, IdError, Result, TransportFailure};
pub use ids::{EntityId, EntityKind};
