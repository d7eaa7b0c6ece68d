//! Inbound advertisement model.
//!
//! A [`Message`] is one reply as seen by the discovery engine: a bag of
//! typed records. The transport builds it; the engine classifies it.

use std::collections::BTreeMap;

use lumen_common::types::{ControllerId, GroupId, Role};

/// TXT keys understood by the mesh.
pub mod txt {
    pub const ID: &str = "id";
    pub const TYPE: &str = "type";
    pub const IS_LEADER: &str = "isLeader";
    pub const GROUPS: &str = "groups";
    pub const LEADING: &str = "leading";
    pub const GROUP: &str = "group";
    pub const FUNCTION: &str = "fn";
}

/// A (or AAAA) record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub name: String,
    pub ip: String,
    pub ttl: u32,
}

/// TXT record as key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRecord {
    pub name: String,
    pub ttl: u32,
    pub entries: BTreeMap<String, String>,
}

impl TextRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

/// SRV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub target: String,
    pub port: u16,
    pub ttl: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Address(AddressRecord),
    Text(TextRecord),
    Service(ServiceRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    reply: bool,
    records: Vec<Record>,
}

impl Message {
    pub fn reply() -> Self {
        Self {
            reply: true,
            records: Vec::new(),
        }
    }

    pub fn query() -> Self {
        Self::default()
    }

    pub fn is_reply(&self) -> bool {
        self.reply
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn with_address(mut self, name: &str, ip: &str, ttl: u32) -> Self {
        self.push(Record::Address(AddressRecord {
            name: name.to_string(),
            ip: ip.to_string(),
            ttl,
        }));
        self
    }

    pub fn with_text<'a, I>(mut self, name: &str, ttl: u32, entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.push(Record::Text(TextRecord {
            name: name.to_string(),
            ttl,
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }));
        self
    }

    pub fn with_service(mut self, name: &str, target: &str, port: u16, ttl: u32) -> Self {
        self.push(Record::Service(ServiceRecord {
            name: name.to_string(),
            target: target.to_string(),
            port,
            ttl,
        }));
        self
    }

    /// First address record, preferring IPv4.
    pub fn address(&self) -> Option<&AddressRecord> {
        let mut addresses = self.records.iter().filter_map(|r| match r {
            Record::Address(a) => Some(a),
            _ => None,
        });
        let first = addresses.next()?;
        if !first.ip.contains(':') {
            return Some(first);
        }
        addresses.find(|a| !a.ip.contains(':')).or(Some(first))
    }

    pub fn text(&self) -> Option<&TextRecord> {
        self.records.iter().find_map(|r| match r {
            Record::Text(t) => Some(t),
            _ => None,
        })
    }

    pub fn service(&self) -> Option<&ServiceRecord> {
        self.records.iter().find_map(|r| match r {
            Record::Service(s) => Some(s),
            _ => None,
        })
    }
}

/// Mesh metadata decoded from a TXT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: ControllerId,
    pub role: Role,
    pub is_leader: bool,
    pub groups: Vec<GroupId>,
    pub leading: Vec<GroupId>,
}

impl Advertisement {
    /// `None` when the record carries no numeric `id`.
    pub fn decode(text: &TextRecord) -> Option<Self> {
        let id = ControllerId::parse(text.get(txt::ID)?)?;
        Some(Self {
            id,
            role: Role::from_txt(text.get(txt::TYPE)),
            is_leader: text.get(txt::IS_LEADER) == Some("1"),
            groups: parse_group_list(text.get(txt::GROUPS)),
            leading: parse_group_list(text.get(txt::LEADING)),
        })
    }
}

fn parse_group_list(value: Option<&str>) -> Vec<GroupId> {
    value
        .unwrap_or_default()
        .split(',')
        .filter_map(GroupId::parse)
        .collect()
}

/// Comma-separated form used in the `groups`/`leading` keys.
pub fn format_group_list<'a, I>(groups: I) -> String
where
    I: IntoIterator<Item = &'a GroupId>,
{
    groups
        .into_iter()
        .map(|g| g.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
