use std::sync::Arc;

use serde::Serialize;

use lumen_common::types::{ControllerId, GroupId};
use lumen_mdns::{AnnouncementSink, Message, QueryTransport};
use lumen_registry::{hosts, ControllerInfo, GroupRecord, HostFilter, HostList, LivenessTable, Registry};

use crate::announce::{AnnounceSettings, Announcer};
use crate::config::MeshConfig;
use crate::discovery::{DiscoveryEngine, PendingResolutions, Response, SourceTtls};
use crate::election::{Decision, ElectionState, GlobalElection};
use crate::error::{MeshError, Result};
use crate::events::{EventSink, MeshEvent};
use crate::groups;
use crate::pinger::{ProbeResult, Prober, VerificationPinger};

/// Who this node is on the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: ControllerId,
    pub hostname: String,
}

/// Collaborators handed to [`MeshCore::new`].
pub struct MeshDeps {
    pub registry: Arc<Registry>,
    pub liveness: Arc<LivenessTable>,
    pub transport: Arc<dyn QueryTransport>,
    pub announcements: Arc<dyn AnnouncementSink>,
    pub prober: Option<Arc<dyn Prober>>,
    pub events: EventSink,
}

/// Point-in-time summary of this node's mesh state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeshStatus {
    pub id: ControllerId,
    pub hostname: String,
    pub tick: u64,
    pub election: ElectionState,
    pub member_of: Vec<GroupId>,
    pub leading_groups: Vec<GroupId>,
    pub visible: usize,
    pub known: usize,
}

/// The discovery and election state machine.
///
/// Entirely synchronous: the runtime feeds it ticks, inbound messages
/// and probe completions one at a time, so no two mutations interleave.
pub struct MeshCore {
    identity: NodeIdentity,
    registry: Arc<Registry>,
    liveness: Arc<LivenessTable>,
    discovery: DiscoveryEngine,
    pinger: Option<VerificationPinger>,
    election: GlobalElection,
    announcer: Announcer,
    events: EventSink,
    member_of: Vec<GroupId>,
    tick: u64,
    recheck_at: Option<u64>,
    election_every: u64,
    recheck_after: u64,
    group_check_every: u64,
}

impl MeshCore {
    pub fn new(config: &MeshConfig, identity: NodeIdentity, deps: MeshDeps) -> Result<Self> {
        config.validate()?;
        let service_type = config.service_type()?;
        let l = &config.liveness;

        let discovery = DiscoveryEngine::new(
            identity.id,
            service_type.clone(),
            SourceTtls {
                multicast: l.multicast_ttl_secs,
                unicast: l.unicast_ttl_secs,
            },
            config.discovery.batch_rotation,
            PendingResolutions::new(l.pending_resolution_secs, l.pending_resolution_capacity),
            deps.registry.clone(),
            deps.liveness.clone(),
            deps.transport,
            deps.events.clone(),
        );

        let pinger = deps.prober.map(|prober| {
            VerificationPinger::new(
                prober,
                deps.registry.clone(),
                deps.liveness.clone(),
                deps.events.clone(),
                l.verified_ttl_secs,
            )
        });

        let announcer = Announcer::new(
            deps.announcements,
            AnnounceSettings {
                id: identity.id,
                hostname: identity.hostname.clone(),
                service_type,
                port: config.discovery.port,
                leader_hostname: config.discovery.leader_hostname.clone(),
                group_hostname_prefix: config.discovery.group_hostname_prefix.clone(),
            },
        );

        Ok(Self {
            election: GlobalElection::new(identity.id, config.election.leadership_max_fail_count),
            identity,
            registry: deps.registry,
            liveness: deps.liveness,
            discovery,
            pinger,
            announcer,
            events: deps.events,
            member_of: Vec::new(),
            tick: 0,
            recheck_at: None,
            election_every: config.election.election_every_ticks,
            recheck_after: config.election.election_recheck_ticks,
            group_check_every: config.election.group_check_every_ticks,
        })
    }

    /// Publish the host announcement. Failure is retried on later ticks.
    pub fn start(&mut self) {
        self.member_of = groups::plan(self.identity.id, &self.registry.groups(), &[]).member_of;
        self.refresh_host();
        tracing::info!(
            id = %self.identity.id,
            hostname = self.identity.hostname,
            "Mesh node started"
        );
    }

    // ── Scheduler ─────────────────────────────────────────────────

    /// One scheduler step. `elapsed_secs` is the time since the previous
    /// tick.
    ///
    /// Order is fixed: queries, decay, due leadership check, detection
    /// reset and re-arm, group recomputation. Checks therefore never see
    /// pre-decay liveness.
    pub fn tick(&mut self, elapsed_secs: u64) {
        self.tick += 1;
        let n = self.tick;

        let batch = self.discovery.tick();
        if let Some(pinger) = &mut self.pinger {
            pinger.probe_batch(&batch);
        }

        self.decay(elapsed_secs);

        if self.recheck_at.is_some_and(|at| n >= at) {
            self.recheck_at = None;
            self.check_for_leadership();
        }

        if n % self.election_every == 0 && !self.election.is_leader() {
            self.election.reset_detection();
            self.recheck_at = Some(n + self.recheck_after);
        }

        if n == 1 || n % self.group_check_every == 0 {
            self.check_group_leadership();
        }

        self.retry_announcements();
    }

    fn decay(&mut self, elapsed_secs: u64) {
        let elapsed = i64::try_from(elapsed_secs).unwrap_or(i64::MAX);
        let report = self.liveness.decay(elapsed);
        for id in report.went_offline {
            tracing::info!(%id, "Controller offline");
            self.events.emit(MeshEvent::HostOffline { id });
        }
        for id in report.purged {
            tracing::debug!(%id, "Controller expired from liveness table");
            self.events.emit(MeshEvent::HostExpired { id });
        }
        self.discovery.expire_pending(elapsed_secs);
    }

    fn retry_announcements(&mut self) {
        if !self.announcer.has_host() {
            self.refresh_host();
        }
        if self.election.is_leader() && !self.announcer.has_leader() {
            if let Err(e) = self.announcer.announce_leader() {
                tracing::warn!(error = %e, "Leader announcement failed, retrying next tick");
            }
        }
    }

    // ── Inbound ───────────────────────────────────────────────────

    pub fn on_message(&mut self, message: &Message) -> Response {
        let response = self.discovery.on_message(message);
        if response.leader_seen() {
            self.election.note_leader_seen();
        }
        response
    }

    pub fn on_probe_result(&mut self, result: &ProbeResult) -> Option<ControllerId> {
        self.pinger.as_mut()?.on_probe_result(result)
    }

    // ── Global election ───────────────────────────────────────────

    pub fn check_for_leadership(&mut self) -> Decision {
        let online = self.liveness.online_ids();
        let decision = self.election.check_for_leadership(&online);
        match decision {
            Decision::BecomeLeader { failsafe } => {
                tracing::info!(
                    id = %self.identity.id,
                    failsafe,
                    online = online.len(),
                    "Became mesh leader"
                );
                if let Err(e) = self.announcer.announce_leader() {
                    tracing::warn!(error = %e, "Leader announcement failed, retrying next tick");
                }
                self.refresh_host();
                self.events.emit(MeshEvent::LeadershipChanged { is_leader: true });
            }
            Decision::Retry => {
                tracing::debug!(
                    fail_counter = self.election.state().fail_counter,
                    "No leader yet, rechecking"
                );
                self.recheck_at = Some(self.tick + self.recheck_after);
            }
            Decision::Follow => tracing::debug!("Leader present, following"),
            Decision::AlreadyLeader => {}
        }
        decision
    }

    /// Step down and withdraw the leader announcement.
    pub fn relinquish_leadership(&mut self) -> bool {
        if !self.election.relinquish() {
            return false;
        }
        self.announcer.withdraw_leader();
        self.refresh_host();
        tracing::info!(id = %self.identity.id, "Relinquished mesh leadership");
        self.events.emit(MeshEvent::LeadershipChanged { is_leader: false });
        true
    }

    // ── Group election ────────────────────────────────────────────

    pub fn check_group_leadership(&mut self) {
        let groups = self.registry.groups();
        let plan = groups::plan(
            self.identity.id,
            &groups,
            &self.announcer.leading_groups(),
        );

        for group_id in &plan.relinquish {
            self.announcer.withdraw_group(*group_id);
            tracing::info!(group = %group_id, "Relinquished group leadership");
            self.events.emit(MeshEvent::GroupLeadershipChanged {
                group_id: *group_id,
                leading: false,
            });
        }

        for (group_id, name) in &plan.become_leader {
            match self.announcer.announce_group(*group_id, name) {
                Ok(()) => {
                    tracing::info!(group = %group_id, name, "Became group leader");
                    self.events.emit(MeshEvent::GroupLeadershipChanged {
                        group_id: *group_id,
                        leading: true,
                    });
                }
                Err(e) => {
                    tracing::warn!(group = %group_id, error = %e, "Group announcement failed")
                }
            }
        }

        self.member_of = plan.member_of;
        self.refresh_host();
    }

    fn refresh_host(&mut self) {
        let leading = self.announcer.leading_groups();
        if let Err(e) =
            self.announcer
                .publish_host(self.election.is_leader(), &self.member_of, &leading)
        {
            tracing::warn!(error = %e, "Host announcement failed");
        }
    }

    // ── Administration ────────────────────────────────────────────

    /// Create or replace a group and re-evaluate group leadership at once.
    pub fn set_group(&mut self, group: GroupRecord) -> Result<()> {
        if let Some(id) = group.controller_ids.iter().find(|id| id.is_reserved()) {
            return Err(MeshError::InvalidGroup(format!(
                "controller id {id} is reserved"
            )));
        }
        let group_id = group.id;
        self.registry.set_group(group)?;
        tracing::info!(group = %group_id, "Group saved");
        self.check_group_leadership();
        Ok(())
    }

    /// Delete a group; its announcement is withdrawn if this node led it.
    pub fn remove_group(&mut self, group_id: GroupId) -> Result<()> {
        self.registry.remove_group(group_id)?;
        tracing::info!(group = %group_id, "Group removed");
        self.check_group_leadership();
        Ok(())
    }

    /// Wipe every controller record together with the liveness table.
    pub fn forget_controllers(&mut self) -> Result<usize> {
        let removed = self.registry.forget_controllers()?;
        self.liveness.clear();
        if let Some(pinger) = &mut self.pinger {
            pinger.clear();
        }
        tracing::info!(removed, "Forgot all controllers");
        Ok(removed)
    }

    /// Withdraw every announcement.
    pub fn shutdown(&mut self) {
        self.announcer.withdraw_all();
        tracing::info!(id = %self.identity.id, "Mesh node stopped");
    }

    // ── Views ─────────────────────────────────────────────────────

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn election(&self) -> ElectionState {
        self.election.state()
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn leading_groups(&self) -> Vec<GroupId> {
        self.announcer.leading_groups()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn is_visible(&self, id: ControllerId) -> bool {
        self.liveness.entry(id).is_some_and(|e| e.is_online())
    }

    pub fn hosts(&self, filter: HostFilter) -> HostList {
        hosts(&self.registry, &self.liveness, filter)
    }

    pub fn controller(&self, id: ControllerId) -> ControllerInfo {
        lumen_registry::controller_info(&self.registry, &self.liveness, id)
    }

    pub fn groups(&self) -> Vec<GroupRecord> {
        self.registry.groups()
    }

    pub fn status(&self) -> MeshStatus {
        MeshStatus {
            id: self.identity.id,
            hostname: self.identity.hostname.clone(),
            tick: self.tick,
            election: self.election.state(),
            member_of: self.member_of.clone(),
            leading_groups: self.announcer.leading_groups(),
            visible: self.liveness.online_count(),
            known: self.registry.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_mdns::{AnnouncementHandle, QueryKind, ServiceDescriptor};

    struct Quiet;

    impl QueryTransport for Quiet {
        fn search(&self, _name: &str, _kind: QueryKind) -> bool {
            true
        }
    }

    impl AnnouncementSink for Quiet {
        fn register_announcement(
            &self,
            _hostname: &str,
            descriptor: &ServiceDescriptor,
        ) -> lumen_mdns::Result<AnnouncementHandle> {
            Ok(AnnouncementHandle::new(descriptor.fullname()))
        }

        fn withdraw_announcement(&self, _handle: &AnnouncementHandle) -> lumen_mdns::Result<()> {
            Ok(())
        }
    }

    /// Detection resets on tick 3 and the recheck is due on tick 5.
    fn node(id: u32) -> (MeshCore, Arc<LivenessTable>) {
        let mut config = MeshConfig::default();
        config.election.election_every_ticks = 3;
        config.election.election_recheck_ticks = 2;
        config.election.group_check_every_ticks = 100;
        let liveness = Arc::new(LivenessTable::default());
        let core = MeshCore::new(
            &config,
            NodeIdentity {
                id: ControllerId(id),
                hostname: "attic".into(),
            },
            MeshDeps {
                registry: Arc::new(Registry::in_memory()),
                liveness: liveness.clone(),
                transport: Arc::new(Quiet),
                announcements: Arc::new(Quiet),
                prober: None,
                events: EventSink::new(),
            },
        )
        .unwrap();
        (core, liveness)
    }

    #[test]
    fn due_recheck_sees_liveness_after_decay() {
        let (mut core, liveness) = node(5);
        core.start();
        // Five ticks of decay bring the only higher peer to exactly zero.
        liveness.refresh(ControllerId(9), 50);

        for _ in 0..4 {
            core.tick(10);
        }
        assert!(!core.is_leader());
        assert!(core.is_visible(ControllerId(9)));

        core.tick(10);
        assert!(!core.is_visible(ControllerId(9)));
        assert!(core.is_leader());
        assert_eq!(core.election().fail_counter, 0);
    }

    #[test]
    fn due_recheck_defers_to_a_higher_peer_still_online() {
        let (mut core, liveness) = node(5);
        core.start();
        liveness.refresh(ControllerId(9), 60);

        for _ in 0..5 {
            core.tick(10);
        }
        assert!(core.is_visible(ControllerId(9)));
        assert!(!core.is_leader());
        assert_eq!(core.election().fail_counter, 1);
    }
}
