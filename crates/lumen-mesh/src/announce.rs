use std::collections::BTreeMap;
use std::sync::Arc;

use lumen_common::types::{ControllerId, GroupId, Role, ServiceType};
use lumen_mdns::message::{format_group_list, txt};
use lumen_mdns::{AnnouncementHandle, AnnouncementSink, Result, ServiceDescriptor};

/// Value of the `fn` key on host announcements.
pub const HOST_FUNCTION: &str = "LED Controller API";

/// Static inputs for building this node's announcements.
#[derive(Debug, Clone)]
pub struct AnnounceSettings {
    pub id: ControllerId,
    pub hostname: String,
    pub service_type: ServiceType,
    pub port: u16,
    pub leader_hostname: String,
    pub group_hostname_prefix: String,
}

/// Owns every announcement this node publishes.
///
/// One host record always, plus a leader record while globally leading
/// and one record per led group. Handles are kept so each can be
/// withdrawn independently.
pub struct Announcer {
    sink: Arc<dyn AnnouncementSink>,
    settings: AnnounceSettings,
    host: Option<AnnouncementHandle>,
    leader: Option<AnnouncementHandle>,
    groups: BTreeMap<GroupId, AnnouncementHandle>,
}

impl Announcer {
    pub fn new(sink: Arc<dyn AnnouncementSink>, settings: AnnounceSettings) -> Self {
        Self {
            sink,
            settings,
            host: None,
            leader: None,
            groups: BTreeMap::new(),
        }
    }

    pub fn settings(&self) -> &AnnounceSettings {
        &self.settings
    }

    // ── Descriptors ───────────────────────────────────────────────

    pub fn host_descriptor(
        &self,
        is_leader: bool,
        member_of: &[GroupId],
        leading: &[GroupId],
    ) -> ServiceDescriptor {
        let s = &self.settings;
        let mut descriptor = ServiceDescriptor::new(&s.hostname, &s.service_type, s.port)
            .with_txt(txt::ID, s.id.to_string())
            .with_txt(txt::TYPE, Role::Host.as_str())
            .with_txt(txt::FUNCTION, HOST_FUNCTION)
            .with_txt(txt::GROUPS, format_group_list(member_of))
            .with_txt(txt::LEADING, format_group_list(leading));
        if is_leader {
            descriptor = descriptor.with_txt(txt::IS_LEADER, "1");
        }
        descriptor
    }

    pub fn leader_descriptor(&self) -> ServiceDescriptor {
        let s = &self.settings;
        ServiceDescriptor::new(&s.leader_hostname, &s.service_type, s.port)
            .with_txt(txt::ID, s.id.to_string())
            .with_txt(txt::TYPE, Role::Leader.as_str())
            .with_txt(txt::IS_LEADER, "1")
    }

    /// Virtual host of a group record. The group id is always part of the
    /// label so groups whose names sanitize alike never share a record.
    pub fn group_hostname(&self, group_id: GroupId, name: &str) -> String {
        let prefix = &self.settings.group_hostname_prefix;
        let label = sanitize_group_name(name, group_id);
        if label == group_id.to_string() {
            format!("{prefix}{label}")
        } else {
            format!("{prefix}{label}-{group_id}")
        }
    }

    pub fn group_descriptor(&self, group_id: GroupId, name: &str) -> ServiceDescriptor {
        let s = &self.settings;
        ServiceDescriptor::new(self.group_hostname(group_id, name), &s.service_type, s.port)
            .with_txt(txt::ID, s.id.to_string())
            .with_txt(txt::TYPE, Role::Group.as_str())
            .with_txt(txt::GROUP, group_id.to_string())
    }

    // ── Host ──────────────────────────────────────────────────────

    /// (Re)publish the host record with current role metadata.
    pub fn publish_host(
        &mut self,
        is_leader: bool,
        member_of: &[GroupId],
        leading: &[GroupId],
    ) -> Result<()> {
        let descriptor = self.host_descriptor(is_leader, member_of, leading);
        let handle = self
            .sink
            .register_announcement(&self.settings.hostname, &descriptor)?;
        if let Some(previous) = self.host.replace(handle.clone()) {
            if previous != handle {
                self.withdraw(&previous);
            }
        }
        Ok(())
    }

    pub fn has_host(&self) -> bool {
        self.host.is_some()
    }

    // ── Global leader ─────────────────────────────────────────────

    pub fn announce_leader(&mut self) -> Result<()> {
        if self.leader.is_some() {
            return Ok(());
        }
        let descriptor = self.leader_descriptor();
        let handle = self
            .sink
            .register_announcement(&self.settings.leader_hostname, &descriptor)?;
        tracing::debug!(handle = %handle, "Leader announcement published");
        self.leader = Some(handle);
        Ok(())
    }

    pub fn withdraw_leader(&mut self) {
        if let Some(handle) = self.leader.take() {
            self.withdraw(&handle);
        }
    }

    pub fn has_leader(&self) -> bool {
        self.leader.is_some()
    }

    // ── Group leaders ─────────────────────────────────────────────

    pub fn announce_group(&mut self, group_id: GroupId, name: &str) -> Result<()> {
        if self.groups.contains_key(&group_id) {
            return Ok(());
        }
        let hostname = self.group_hostname(group_id, name);
        let descriptor = self.group_descriptor(group_id, name);
        let handle = self.sink.register_announcement(&hostname, &descriptor)?;
        self.groups.insert(group_id, handle);
        Ok(())
    }

    /// Returns false when the group was not being announced.
    pub fn withdraw_group(&mut self, group_id: GroupId) -> bool {
        match self.groups.remove(&group_id) {
            Some(handle) => {
                self.withdraw(&handle);
                true
            }
            None => false,
        }
    }

    pub fn leading_groups(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    pub fn is_leading_group(&self, group_id: GroupId) -> bool {
        self.groups.contains_key(&group_id)
    }

    /// Withdraw everything, host record included.
    pub fn withdraw_all(&mut self) {
        let groups: Vec<GroupId> = self.groups.keys().copied().collect();
        for group_id in groups {
            self.withdraw_group(group_id);
        }
        self.withdraw_leader();
        if let Some(handle) = self.host.take() {
            self.withdraw(&handle);
        }
    }

    fn withdraw(&self, handle: &AnnouncementHandle) {
        if let Err(e) = self.sink.withdraw_announcement(handle) {
            tracing::warn!(handle = %handle, error = %e, "Failed to withdraw announcement");
        }
    }
}

/// Reduce a group name to a host label.
///
/// Lowercase ASCII alphanumerics are kept, every other run of characters
/// becomes a single `-`, and edge dashes are trimmed. A name with nothing
/// usable falls back to the group id.
pub fn sanitize_group_name(name: &str, group_id: GroupId) -> String {
    let mut out = String::with_capacity(name.len());
    let mut dash = false;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            dash = false;
        } else if !dash {
            out.push('-');
            dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        group_id.to_string()
    } else {
        trimmed.to_string()
    }
}
