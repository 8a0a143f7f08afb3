//! Ticket model.
//!
//! A ticket authorizes byte-range operations on one image URL. Tickets are
//! installed by the control plane as JSON and held only in memory; this
//! module defines the installation schema and its validation. The runtime
//! state (connections, ongoing operations, cancellation) lives in the
//! daemon's ticket store.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ImageResult};

/// Operations a ticket may allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Read,
    Write,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verb::Read => write!(f, "read"),
            Verb::Write => write!(f, "write"),
        }
    }
}

/// URL schemes a ticket may reference.
const SUPPORTED_SCHEMES: &[&str] = &["file", "nbd", "nbd+unix", "https", "http"];

/// Ticket installation request, as sent by the orchestrator.
///
/// Unknown fields are rejected so that schema mistakes on the control plane
/// fail loudly instead of being silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketSpec {
    /// Opaque ticket id, typically a UUID.
    pub uuid: String,

    /// Virtual image size in bytes.
    pub size: u64,

    /// Backend locator: `file:///path`, `nbd:unix:/sock`, `nbd://host:port`,
    /// or `https://host:port/images/{id}` in proxy mode.
    pub url: String,

    /// Initial validity in seconds. Zero installs an already expired ticket.
    pub timeout: u64,

    /// Allowed verbs. "write" implies "read".
    pub ops: Vec<Verb>,

    /// Deallocate zeroed ranges where the backend supports it.
    #[serde(default)]
    pub sparse: bool,

    /// Permit `/extents?context=dirty` for incremental backup.
    #[serde(default)]
    pub dirty: bool,

    /// Seconds at zero connections after which the ticket expires. When
    /// unset the daemon default applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactivity_timeout: Option<u64>,

    /// Diagnostic label correlating the ticket with an orchestrator transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,

    /// Suggested download file name, reported via Content-Disposition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl TicketSpec {
    /// Validate fields that serde cannot express.
    pub fn validate(&self) -> ImageResult<()> {
        if self.uuid.is_empty() {
            return Err(Error::BadRequest("ticket uuid is empty".into()));
        }
        if !self.uuid.chars().all(|c| c.is_ascii_graphic()) {
            return Err(Error::BadRequest(format!(
                "ticket uuid {:?} is not printable",
                self.uuid
            )));
        }
        if self.size == 0 {
            return Err(Error::BadRequest("ticket size must be positive".into()));
        }
        if self.ops.is_empty() {
            return Err(Error::BadRequest("ticket ops is empty".into()));
        }
        let scheme = self
            .url
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .unwrap_or("");
        if !SUPPORTED_SCHEMES.contains(&scheme) {
            return Err(Error::BadRequest(format!(
                "unsupported url scheme {:?} in {:?}",
                scheme, self.url
            )));
        }
        Ok(())
    }

    /// True when `verb` is allowed. Write access implies read access so a
    /// writer can verify its own data.
    pub fn may(&self, verb: Verb) -> bool {
        match verb {
            Verb::Read => {
                self.ops.contains(&Verb::Read) || self.ops.contains(&Verb::Write)
            }
            Verb::Write => self.ops.contains(&Verb::Write),
        }
    }

    /// The transfer label used in logs: the orchestrator supplied id, or a
    /// derived one for tickets generated by older orchestrators.
    pub fn transfer_label(&self) -> String {
        match &self.transfer_id {
            Some(id) => id.clone(),
            None => {
                let n = self.uuid.len().min(18);
                format!("(ticket/{})", &self.uuid[..n])
            }
        }
    }
}
