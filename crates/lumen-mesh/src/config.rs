//! Mesh tunables.
//!
//! Every knob has a default, so an absent or partial `config.toml` is
//! valid. Sections mirror the subsystems: `[node]`, `[discovery]`,
//! `[liveness]`, `[election]`, `[probe]`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use lumen_common::types::{ControllerId, ServiceType};

use crate::error::{MeshError, Result};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_BATCH_ROTATION: u32 = 5;
pub const DEFAULT_SERVICE_TYPE: &str = "_http._tcp.local.";
pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_LEADER_HOSTNAME: &str = "lumen-leader";
pub const DEFAULT_GROUP_HOSTNAME_PREFIX: &str = "lumen-group-";

pub const DEFAULT_MULTICAST_TTL_SECS: i64 = 60;
pub const DEFAULT_UNICAST_TTL_SECS: i64 = 90;
pub const DEFAULT_VERIFIED_TTL_SECS: i64 = 120;
pub const DEFAULT_EXPIRY_FLOOR_SECS: i64 = lumen_registry::DEFAULT_EXPIRY_FLOOR_SECS;
pub const DEFAULT_PENDING_RESOLUTION_SECS: u64 = 30;
pub const DEFAULT_PENDING_RESOLUTION_CAPACITY: usize = 64;

pub const DEFAULT_ELECTION_EVERY_TICKS: u64 = 3;
pub const DEFAULT_ELECTION_RECHECK_TICKS: u64 = 1;
pub const DEFAULT_LEADERSHIP_MAX_FAIL_COUNT: u32 = 5;
/// Two minutes at the default tick.
pub const DEFAULT_GROUP_CHECK_EVERY_TICKS: u64 = 12;

pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_PROBE_PATH: &str = "/ping";

const MACHINE_ID_PATH: &str = "/etc/machine-id";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeConfig,
    pub discovery: DiscoveryConfig,
    pub liveness: LivenessConfig,
    pub election: ElectionConfig,
    pub probe: ProbeConfig,
}

/// Identity overrides. Both are derived from the machine when unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: Option<u32>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub tick_interval_secs: u64,
    /// Ticks per full sweep of unicast queries over known controllers.
    pub batch_rotation: u32,
    pub service_type: String,
    pub port: u16,
    pub leader_hostname: String,
    pub group_hostname_prefix: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            batch_rotation: DEFAULT_BATCH_ROTATION,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            port: DEFAULT_PORT,
            leader_hostname: DEFAULT_LEADER_HOSTNAME.to_string(),
            group_hostname_prefix: DEFAULT_GROUP_HOSTNAME_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Initial ttl for controllers seen in a multicast browse reply.
    pub multicast_ttl_secs: i64,
    /// Initial ttl for controllers answering a direct host query.
    pub unicast_ttl_secs: i64,
    /// Ttl set by a successful verification probe.
    pub verified_ttl_secs: i64,
    /// Entries at or below this ttl are purged.
    pub expiry_floor_secs: i64,
    pub pending_resolution_secs: u64,
    pub pending_resolution_capacity: usize,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            multicast_ttl_secs: DEFAULT_MULTICAST_TTL_SECS,
            unicast_ttl_secs: DEFAULT_UNICAST_TTL_SECS,
            verified_ttl_secs: DEFAULT_VERIFIED_TTL_SECS,
            expiry_floor_secs: DEFAULT_EXPIRY_FLOOR_SECS,
            pending_resolution_secs: DEFAULT_PENDING_RESOLUTION_SECS,
            pending_resolution_capacity: DEFAULT_PENDING_RESOLUTION_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    pub election_every_ticks: u64,
    pub election_recheck_ticks: u64,
    pub leadership_max_fail_count: u32,
    pub group_check_every_ticks: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_every_ticks: DEFAULT_ELECTION_EVERY_TICKS,
            election_recheck_ticks: DEFAULT_ELECTION_RECHECK_TICKS,
            leadership_max_fail_count: DEFAULT_LEADERSHIP_MAX_FAIL_COUNT,
            group_check_every_ticks: DEFAULT_GROUP_CHECK_EVERY_TICKS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub enabled: bool,
    pub probe_timeout_secs: u64,
    pub probe_path: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            probe_path: DEFAULT_PROBE_PATH.to_string(),
        }
    }
}

impl MeshConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded mesh config");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| MeshError::Config(format!("Invalid config.toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.discovery;
        let l = &self.liveness;
        let e = &self.election;

        if d.tick_interval_secs == 0 {
            return Err(MeshError::Config("tick_interval_secs must be > 0".into()));
        }
        if d.batch_rotation == 0 {
            return Err(MeshError::Config("batch_rotation must be > 0".into()));
        }
        self.service_type()?;
        if d.leader_hostname.trim().is_empty() {
            return Err(MeshError::Config("leader_hostname is required".into()));
        }
        if !(0 < l.multicast_ttl_secs
            && l.multicast_ttl_secs < l.unicast_ttl_secs
            && l.unicast_ttl_secs < l.verified_ttl_secs)
        {
            return Err(MeshError::Config(format!(
                "ttls must satisfy 0 < multicast ({}) < unicast ({}) < verified ({})",
                l.multicast_ttl_secs, l.unicast_ttl_secs, l.verified_ttl_secs
            )));
        }
        if l.expiry_floor_secs > 0 {
            return Err(MeshError::Config("expiry_floor_secs must be <= 0".into()));
        }
        if l.pending_resolution_capacity == 0 {
            return Err(MeshError::Config("pending_resolution_capacity must be > 0".into()));
        }
        if e.election_every_ticks == 0 || e.election_recheck_ticks == 0 {
            return Err(MeshError::Config("election intervals must be > 0".into()));
        }
        if e.group_check_every_ticks == 0 {
            return Err(MeshError::Config("group_check_every_ticks must be > 0".into()));
        }
        if e.leadership_max_fail_count == 0 {
            return Err(MeshError::Config("leadership_max_fail_count must be > 0".into()));
        }
        if let Some(id) = self.node.id {
            if ControllerId(id).is_reserved() {
                return Err(MeshError::Config(format!("node id {id} is reserved")));
            }
        }
        Ok(())
    }

    pub fn service_type(&self) -> Result<ServiceType> {
        ServiceType::parse(&self.discovery.service_type)
            .map_err(|e| MeshError::Config(e.to_string()))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.tick_interval_secs)
    }

    /// Configured id, or one derived from the machine identity.
    pub fn node_id(&self) -> ControllerId {
        match self.node.id {
            Some(id) => ControllerId(id),
            None => derive_node_id(&machine_seed()),
        }
    }

    /// Configured hostname, or the system one reduced to a single mDNS label.
    pub fn hostname(&self) -> Result<String> {
        let raw = match &self.node.hostname {
            Some(name) => name.clone(),
            None => hostname::get()?.to_string_lossy().to_string(),
        };
        let label = host_label(&raw);
        if label.is_empty() {
            return Err(MeshError::Config(format!("unusable hostname '{raw}'")));
        }
        Ok(label)
    }
}

/// Hash `seed` into a controller id, stepping past the reserved values.
pub fn derive_node_id(seed: &str) -> ControllerId {
    let digest = Sha256::digest(seed.as_bytes());
    let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let id = ControllerId(raw);
    if id.is_reserved() {
        ControllerId(raw + 2)
    } else {
        id
    }
}

fn machine_seed() -> String {
    match std::fs::read_to_string(MACHINE_ID_PATH) {
        Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "lumen".to_string()),
    }
}

/// First DNS label, lowercased, with anything outside `[a-z0-9-]` replaced.
fn host_label(raw: &str) -> String {
    let first = raw.trim().split('.').next().unwrap_or_default();
    first
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
