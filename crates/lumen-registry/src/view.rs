use serde::{Deserialize, Serialize};

use lumen_common::types::ControllerId;

use crate::liveness::LivenessTable;
use crate::store::{ControllerRecord, Registry};

/// Combined registry + liveness state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    NotFound,
    Incomplete,
    Offline,
    Online,
}

/// Which controllers a host listing includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostFilter {
    All,
    /// Known id, hostname and address.
    #[default]
    ValidOnly,
    /// Currently online.
    VisibleOnly,
}

impl std::str::FromStr for HostFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(HostFilter::All),
            "valid" => Ok(HostFilter::ValidOnly),
            "visible" => Ok(HostFilter::VisibleOnly),
            other => Err(format!("unknown host filter '{other}' (all, valid, visible)")),
        }
    }
}

/// Point-in-time view of one controller for UI/API consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub id: ControllerId,
    pub hostname: String,
    pub ip_address: String,
    pub state: ControllerState,
    pub ttl: i64,
    pub ping_pending: bool,
}

impl ControllerInfo {
    fn from_record(record: ControllerRecord, liveness: &LivenessTable) -> Self {
        let (state, ttl, ping_pending) = match liveness.entry(record.id) {
            Some(entry) => (entry.state(), entry.ttl, entry.ping_pending),
            None if record.hostname.is_empty() || record.ip_address.is_empty() => {
                (ControllerState::Incomplete, 0, false)
            }
            None => (ControllerState::Offline, 0, false),
        };
        Self {
            id: record.id,
            hostname: record.hostname,
            ip_address: record.ip_address,
            state,
            ttl,
            ping_pending,
        }
    }

    fn passes(&self, filter: HostFilter) -> bool {
        match filter {
            HostFilter::All => true,
            HostFilter::ValidOnly => {
                self.id != ControllerId(0)
                    && !self.hostname.is_empty()
                    && !self.ip_address.is_empty()
            }
            HostFilter::VisibleOnly => self.state == ControllerState::Online,
        }
    }
}

/// JSON envelope for host listings: `{"hosts": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostList {
    pub hosts: Vec<ControllerInfo>,
}

/// View of a single controller. Unknown ids yield `NotFound`.
pub fn controller_info(
    registry: &Registry,
    liveness: &LivenessTable,
    id: ControllerId,
) -> ControllerInfo {
    match registry.controller(id) {
        Some(record) => ControllerInfo::from_record(record, liveness),
        None => ControllerInfo {
            id,
            hostname: String::new(),
            ip_address: String::new(),
            state: ControllerState::NotFound,
            ttl: 0,
            ping_pending: false,
        },
    }
}

/// All registered controllers passing `filter`, ordered by id.
pub fn hosts(registry: &Registry, liveness: &LivenessTable, filter: HostFilter) -> HostList {
    let mut hosts: Vec<ControllerInfo> = registry
        .controllers()
        .into_iter()
        .map(|record| ControllerInfo::from_record(record, liveness))
        .filter(|info| info.passes(filter))
        .collect();
    hosts.sort_by_key(|h| h.id);
    HostList { hosts }
}
