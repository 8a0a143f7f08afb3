//! Shared types for the imageio data and control planes.
//!
//! This crate holds everything both the daemon and the client library need:
//! the unified error type, the ticket model and its JSON validation, extent
//! types, byte-range measurement, and the project-wide defaults.

pub mod defaults;
pub mod error;
pub mod extent;
pub mod measure;
pub mod ticket;
pub mod units;

pub use error::{Error, ImageResult};
pub use extent::{DirtyExtent, Extent};
pub use ticket::{TicketSpec, Verb};
