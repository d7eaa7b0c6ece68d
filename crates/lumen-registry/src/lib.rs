//! Controller and group registry.
//!
//! Two tables with very different lifetimes:
//!
//! - [`Registry`]: persistent, per-device record of every controller ever
//!   discovered plus the administratively configured groups. Mutations go
//!   through a [`Transaction`] that touches disk only when something
//!   actually changed.
//! - [`LivenessTable`]: volatile TTL-decayed view of which controllers are
//!   currently reachable. Never persisted.
//!
//! Both are internally synchronized and hand out point-in-time copies, so
//! readers never hold references into live state.

pub mod error;
mod liveness;
mod store;
mod view;

pub use self::error::{RegistryError, Result};
pub use self::liveness::{
    DecayReport, LivenessEntry, LivenessTable, Refresh, DEFAULT_EXPIRY_FLOOR_SECS,
};
pub use self::store::{ControllerRecord, GroupRecord, Registry, Transaction, Upsert};
pub use self::view::{controller_info, hosts, ControllerInfo, ControllerState, HostFilter, HostList};
