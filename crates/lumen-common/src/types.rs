use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable numeric identity of a physical controller.
///
/// Derived from hardware identity, so two distinct devices never share
/// a value. `0` means "unknown" and `1` is reserved; neither is ever
/// admitted into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControllerId(pub u32);

impl ControllerId {
    /// Ids that must never be admitted.
    pub const RESERVED: [ControllerId; 2] = [ControllerId(0), ControllerId(1)];

    pub fn is_reserved(self) -> bool {
        Self::RESERVED.contains(&self)
    }

    /// Parse the decimal form carried in the `id` TXT key. Only ASCII
    /// digits are accepted: no sign, whitespace or radix prefix.
    pub fn parse(s: &str) -> Option<Self> {
        parse_decimal(s).map(ControllerId)
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a logical controller group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl GroupId {
    /// Entries of the `groups`/`leading` lists may be padded with spaces.
    pub fn parse(s: &str) -> Option<Self> {
        parse_decimal(s.trim()).map(GroupId)
    }
}

fn parse_decimal(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role advertised in the `type` TXT key of an announcement.
///
/// Decoded once at the message boundary. Only `Host` records describe
/// physical controllers; the others are virtual hostnames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Leader,
    Group,
    Unknown,
}

impl Role {
    pub fn from_txt(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("host") => Role::Host,
            Some("leader") => Role::Leader,
            Some("group") => Role::Group,
            _ => Role::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Leader => "leader",
            Role::Group => "group",
            Role::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum allowed length for DNS-SD service names (RFC 6763).
const SERVICE_NAME_MAX_LEN: usize = 15;

/// Validated DNS-SD service type in canonical `_name._proto.local.` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceType(String);

impl ServiceType {
    /// Accepts "http", "_http", "_http._tcp" or "_http._tcp.local.".
    pub fn parse(s: &str) -> Result<Self, ServiceTypeError> {
        let s = s.trim().trim_end_matches('.');
        let s = s.trim_end_matches(".local");

        let parts: Vec<&str> = s.split('.').collect();
        let (name, proto) = match parts.as_slice() {
            [name] => (name.strip_prefix('_').unwrap_or(name), "tcp"),
            [name, proto] => (
                name.strip_prefix('_').unwrap_or(name),
                proto.strip_prefix('_').unwrap_or(proto),
            ),
            _ => return Err(ServiceTypeError::Invalid(s.to_string())),
        };

        if proto != "tcp" && proto != "udp" {
            return Err(ServiceTypeError::Invalid(format!(
                "protocol must be tcp or udp, got '{proto}'"
            )));
        }
        if name.is_empty() || name.len() > SERVICE_NAME_MAX_LEN {
            return Err(ServiceTypeError::Invalid(format!(
                "service name must be 1-15 characters, got '{name}'"
            )));
        }

        let canonical = format!("_{name}._{proto}.local.");
        tracing::trace!("Normalized service type: \"{s}\" → \"{canonical}\"");
        Ok(ServiceType(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bare service name, e.g. "http".
    pub fn name(&self) -> &str {
        self.0
            .trim_start_matches('_')
            .split('.')
            .next()
            .unwrap_or_default()
    }

    /// "tcp" or "udp".
    pub fn protocol(&self) -> &str {
        self.0
            .split('.')
            .nth(1)
            .map(|p| p.trim_start_matches('_'))
            .unwrap_or("tcp")
    }

    /// True if a record name belongs to this service type, either the
    /// type itself or an instance under it.
    pub fn matches(&self, record_name: &str) -> bool {
        let want = self.0.trim_end_matches('.');
        let got = record_name.trim_end_matches('.');
        got.eq_ignore_ascii_case(want)
            || got
                .len()
                .checked_sub(want.len() + 1)
                .map(|split| {
                    got.as_bytes()[split] == b'.' && got[split + 1..].eq_ignore_ascii_case(want)
                })
                .unwrap_or(false)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.trim_end_matches(".local.").trim_end_matches('.'))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceTypeError {
    #[error("Invalid service type: {0}")]
    Invalid(String),
}

/// Suffix multicast DNS appends to every host name.
pub const LOCAL_SUFFIX: &str = ".local";

/// Strip a trailing ".local" / ".local." from a record name.
/// Returns `None` when the name is not under the local domain.
pub fn strip_local_suffix(name: &str) -> Option<&str> {
    let name = name.trim_end_matches('.');
    let stem = name.strip_suffix(LOCAL_SUFFIX)?;
    if stem.is_empty() {
        None
    } else {
        Some(stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_are_rejected() {
        assert!(ControllerId(0).is_reserved());
        assert!(ControllerId(1).is_reserved());
        assert!(!ControllerId(2).is_reserved());
    }

    #[test]
    fn controller_id_parses_decimal_only() {
        assert_eq!(ControllerId::parse("12345"), Some(ControllerId(12345)));
        assert_eq!(ControllerId::parse("007"), Some(ControllerId(7)));
        assert_eq!(ControllerId::parse(" 7 "), None);
        assert_eq!(ControllerId::parse("+7"), None);
        assert_eq!(ControllerId::parse("-7"), None);
        assert_eq!(ControllerId::parse("0x10"), None);
        assert_eq!(ControllerId::parse("4294967296"), None);
        assert_eq!(ControllerId::parse(""), None);
    }

    #[test]
    fn group_id_tolerates_list_padding_only() {
        assert_eq!(GroupId::parse(" 3 "), Some(GroupId(3)));
        assert_eq!(GroupId::parse("+3"), None);
        assert_eq!(GroupId::parse(""), None);
    }

    #[test]
    fn controller_id_serializes_as_number() {
        assert_eq!(serde_json::to_string(&ControllerId(42)).unwrap(), "42");
    }

    #[test]
    fn role_decoding_is_closed() {
        assert_eq!(Role::from_txt(Some("host")), Role::Host);
        assert_eq!(Role::from_txt(Some("leader")), Role::Leader);
        assert_eq!(Role::from_txt(Some("group")), Role::Group);
        assert_eq!(Role::from_txt(Some("HOST")), Role::Unknown);
        assert_eq!(Role::from_txt(None), Role::Unknown);
    }

    #[test]
    fn service_type_parse_forms() {
        for input in ["http", "_http", "_http._tcp", "_http._tcp.local."] {
            let st = ServiceType::parse(input).unwrap();
            assert_eq!(st.as_str(), "_http._tcp.local.", "input {input}");
        }
        assert_eq!(ServiceType::parse("http").unwrap().name(), "http");
        assert_eq!(ServiceType::parse("_x._udp").unwrap().protocol(), "udp");
    }

    #[test]
    fn service_type_rejects_bad_protocol_and_long_names() {
        assert!(ServiceType::parse("_http._sctp").is_err());
        assert!(ServiceType::parse("averyveryverylongname").is_err());
        assert!(ServiceType::parse("a.b.c").is_err());
    }

    #[test]
    fn service_type_matches_type_and_instances() {
        let st = ServiceType::parse("_http._tcp").unwrap();
        assert!(st.matches("_http._tcp.local."));
        assert!(st.matches("_http._tcp.local"));
        assert!(st.matches("kitchen._http._tcp.local."));
        assert!(!st.matches("kitchen._ipp._tcp.local."));
        assert!(!st.matches("x_http._tcp.local."));
    }

    #[test]
    fn strip_local_suffix_variants() {
        assert_eq!(strip_local_suffix("kitchen.local."), Some("kitchen"));
        assert_eq!(strip_local_suffix("kitchen.local"), Some("kitchen"));
        assert_eq!(strip_local_suffix("kitchen.lan"), None);
        assert_eq!(strip_local_suffix(".local"), None);
    }
}
