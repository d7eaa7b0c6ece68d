//! lumen mDNS: the wire-facing edge of the controller mesh.
//!
//! - [`message`]: transport-neutral inbound message model and TXT decoding
//! - [`descriptor`]: one data-carrying announcement descriptor for every role
//! - [`MdnsDaemon`]: `mdns-sd` backed implementation of the two traits below
//!
//! The discovery engine only ever talks to [`QueryTransport`] and
//! [`AnnouncementSink`], so it runs unchanged against the real daemon or an
//! in-process simulation.

mod daemon;
pub mod descriptor;
pub mod error;
pub mod message;

pub use self::daemon::MdnsDaemon;
pub use self::descriptor::{Protocol, ServiceDescriptor};
pub use self::error::{MdnsError, Result};
pub use self::message::{Advertisement, Message, Record};

/// What a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// PTR/SRV browse for a service type (multicast).
    Service,
    /// A-record lookup for a single host name (direct query).
    Address,
}

/// Outbound query primitive. Fire-and-forget: answers arrive later as
/// inbound [`Message`]s.
pub trait QueryTransport: Send + Sync {
    /// Returns false if the query could not be queued.
    fn search(&self, name: &str, kind: QueryKind) -> bool;
}

/// Opaque handle to a published announcement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnouncementHandle(String);

impl AnnouncementHandle {
    pub fn new(fullname: impl Into<String>) -> Self {
        Self(fullname.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AnnouncementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Service announcement registration.
pub trait AnnouncementSink: Send + Sync {
    /// Publish `descriptor` under the host name `hostname` (no `.local`).
    fn register_announcement(
        &self,
        hostname: &str,
        descriptor: &ServiceDescriptor,
    ) -> Result<AnnouncementHandle>;

    fn withdraw_announcement(&self, handle: &AnnouncementHandle) -> Result<()>;
}
