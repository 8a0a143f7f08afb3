//! imageio client library.
//!
//! High level entry points:
//! - [`api::upload`] — push a local image to a server ticket.
//! - [`api::download`] — pull a server ticket into a local image.
//! - [`api::checksum`] — content checksum of a local image.
//!
//! Lower layers are public for tools that need them: the per-image HTTP
//! client ([`http::ImageioClient`]), the control-plane client
//! ([`control::ControlClient`]), the qemu subprocess wrappers, and the
//! multi-worker copy engine ([`io::copy`]).

pub mod api;
pub mod control;
pub mod http;
pub mod io;
pub mod progress;
pub mod qemu_img;
pub mod qemu_nbd;

pub use api::{checksum, download, upload, TransferOptions};
pub use http::ImageioClient;
pub use progress::Progress;
