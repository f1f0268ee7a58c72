//! Error types for the tidefs core crate
//!
//! This module re-exports every public error type so callers have a single
//! import point for error handling.

pub use crate::block::BlockError;
pub use crate::folder::EngineError;
pub use crate::meta::{MetadataError, OpInvertError};
pub use crate::server::errors::{BlockServerError, KeyError, MdServerError, ResolverError};
pub use crate::sync::{CoalescingError, ContextError};
