use std::collections::BTreeMap;

use lumen_common::types::ServiceType;

use crate::error::{MdnsError, Result};
use crate::message::{Message, Record, ServiceRecord, TextRecord};

/// Transport protocol of an announced service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Everything needed to announce one service instance.
///
/// Host, leader and group-leader announcements all use this one type;
/// only the instance name and TXT pairs differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub instance: String,
    pub service: String,
    pub protocol: Protocol,
    pub port: u16,
    pub txt: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(instance: impl Into<String>, service_type: &ServiceType, port: u16) -> Self {
        let protocol = match service_type.protocol() {
            "udp" => Protocol::Udp,
            _ => Protocol::Tcp,
        };
        Self {
            instance: instance.into(),
            service: service_type.name().to_string(),
            protocol,
            port,
            txt: BTreeMap::new(),
        }
    }

    pub fn with_txt(mut self, key: &str, value: impl Into<String>) -> Self {
        self.txt.insert(key.to_string(), value.into());
        self
    }

    /// Fully qualified service type, e.g. `_http._tcp.local.`.
    pub fn service_type(&self) -> String {
        format!("_{}._{}.local.", self.service, self.protocol.as_str())
    }

    /// Fully qualified instance name, e.g. `porch._http._tcp.local.`.
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.instance, self.service_type())
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance.trim().is_empty() {
            return Err(MdnsError::InvalidAnnouncement("empty instance name".into()));
        }
        if self.instance.len() > 63 {
            return Err(MdnsError::InvalidAnnouncement(format!(
                "instance name longer than 63 bytes: {}",
                self.instance
            )));
        }
        ServiceType::parse(&self.service_type())
            .map_err(|e| MdnsError::InvalidAnnouncement(e.to_string()))?;
        Ok(())
    }

    /// The reply a peer would receive for this announcement when it is
    /// published under `hostname` at `ip`.
    pub fn to_reply(&self, hostname: &str, ip: &str, ttl: u32) -> Message {
        let host = format!("{hostname}.local.");
        let fullname = self.fullname();
        let mut message = Message::reply();
        message.push(Record::Service(ServiceRecord {
            name: fullname.clone(),
            target: host.clone(),
            port: self.port,
            ttl,
        }));
        message.push(Record::Text(TextRecord {
            name: fullname,
            ttl,
            entries: self.txt.clone(),
        }));
        message.with_address(&host, ip, ttl)
    }
}
