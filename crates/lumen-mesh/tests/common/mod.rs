//! In-process network for driving several mesh nodes deterministically.
//!
//! Queries are queued per node and answered when the node's inbox is
//! drained, from whatever is announced at that moment. A round ticks
//! every node first and then drains every inbox, so replies reflect the
//! state after all nodes have acted.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use lumen_common::types::{strip_local_suffix, ControllerId, ServiceType};
use lumen_mdns::{
    AnnouncementHandle, AnnouncementSink, Message, QueryKind, QueryTransport, ServiceDescriptor,
};
use lumen_mesh::{
    EventSink, MeshConfig, MeshCore, MeshDeps, MeshEvent, NodeIdentity, ProbeResult, Prober,
};
use lumen_registry::{LivenessTable, Registry};
use tokio::sync::broadcast;

pub const REPLY_TTL: u32 = 120;
pub const TICK_SECS: u64 = 10;

#[derive(Debug, Clone)]
struct Published {
    hostname: String,
    descriptor: ServiceDescriptor,
}

#[derive(Debug, Clone)]
enum Query {
    Service(String),
    Address(String),
}

#[derive(Debug, Default)]
struct Host {
    online: bool,
    announcements: BTreeMap<String, Published>,
    queries: Vec<Query>,
    probes: Vec<String>,
}

#[derive(Default)]
pub struct SimNetwork {
    hosts: Mutex<BTreeMap<String, Host>>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a host at `ip` and return its endpoint.
    pub fn join(self: &Arc<Self>, ip: &str) -> Arc<SimEndpoint> {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.entry(ip.to_string()).or_default().online = true;
        Arc::new(SimEndpoint {
            net: Arc::clone(self),
            ip: ip.to_string(),
        })
    }

    /// Take a host off the network. Its announcements stop being answered.
    pub fn leave(&self, ip: &str) {
        if let Some(host) = self.hosts.lock().unwrap().get_mut(ip) {
            host.online = false;
        }
    }

    pub fn rejoin(&self, ip: &str) {
        if let Some(host) = self.hosts.lock().unwrap().get_mut(ip) {
            host.online = true;
        }
    }

    /// Live announcements of `ip`, by full name.
    pub fn announcements(&self, ip: &str) -> BTreeMap<String, ServiceDescriptor> {
        let hosts = self.hosts.lock().unwrap();
        hosts
            .get(ip)
            .map(|h| {
                h.announcements
                    .iter()
                    .map(|(k, v)| (k.clone(), v.descriptor.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Answer every query `ip` has queued since the last drain.
    pub fn drain_replies(&self, ip: &str) -> Vec<Message> {
        let mut hosts = self.hosts.lock().unwrap();
        let Some(queries) = hosts.get_mut(ip).map(|h| std::mem::take(&mut h.queries)) else {
            return Vec::new();
        };
        let asker_online = hosts.get(ip).is_some_and(|h| h.online);
        let visible: Vec<(&String, &Host)> = hosts
            .iter()
            .filter(|(other, h)| h.online && (asker_online || *other == ip))
            .collect();

        let mut replies = Vec::new();
        for query in queries {
            match query {
                Query::Service(service_type) => {
                    let Ok(wanted) = ServiceType::parse(&service_type) else {
                        continue;
                    };
                    for (owner_ip, host) in &visible {
                        for published in host.announcements.values() {
                            if wanted.matches(&published.descriptor.fullname()) {
                                replies.push(published.descriptor.to_reply(
                                    &published.hostname,
                                    owner_ip,
                                    REPLY_TTL,
                                ));
                            }
                        }
                    }
                }
                Query::Address(name) => {
                    let wanted = strip_local_suffix(&name).unwrap_or(&name).to_string();
                    let owner = visible.iter().find(|(_, host)| {
                        host.announcements
                            .values()
                            .any(|p| p.hostname.eq_ignore_ascii_case(&wanted))
                    });
                    if let Some((owner_ip, _)) = owner {
                        replies.push(Message::reply().with_address(
                            &format!("{wanted}.local."),
                            owner_ip,
                            REPLY_TTL,
                        ));
                    }
                }
            }
        }
        replies
    }

    /// Complete every probe `ip` has issued. Online targets succeed.
    pub fn drain_probes(&self, ip: &str) -> Vec<ProbeResult> {
        let mut hosts = self.hosts.lock().unwrap();
        let probes = hosts
            .get_mut(ip)
            .map(|h| std::mem::take(&mut h.probes))
            .unwrap_or_default();
        probes
            .into_iter()
            .map(|target| {
                let success = hosts.get(&target).is_some_and(|h| h.online);
                ProbeResult {
                    ip: target,
                    success,
                }
            })
            .collect()
    }
}

/// One host's view of the simulated network.
pub struct SimEndpoint {
    net: Arc<SimNetwork>,
    ip: String,
}

impl SimEndpoint {
    pub fn ip(&self) -> &str {
        &self.ip
    }

    fn with_host<T>(&self, f: impl FnOnce(&mut Host) -> T) -> T {
        let mut hosts = self.net.hosts.lock().unwrap();
        f(hosts.entry(self.ip.clone()).or_default())
    }

    /// Publish a record directly, bypassing any mesh node.
    pub fn publish(&self, hostname: &str, descriptor: ServiceDescriptor) {
        self.register_announcement(hostname, &descriptor).unwrap();
    }
}

impl QueryTransport for SimEndpoint {
    fn search(&self, name: &str, kind: QueryKind) -> bool {
        let query = match kind {
            QueryKind::Service => Query::Service(name.to_string()),
            QueryKind::Address => Query::Address(name.to_string()),
        };
        self.with_host(|h| h.queries.push(query));
        true
    }
}

impl AnnouncementSink for SimEndpoint {
    fn register_announcement(
        &self,
        hostname: &str,
        descriptor: &ServiceDescriptor,
    ) -> lumen_mdns::Result<AnnouncementHandle> {
        descriptor.validate()?;
        let fullname = descriptor.fullname();
        self.with_host(|h| {
            h.announcements.insert(
                fullname.clone(),
                Published {
                    hostname: hostname.to_string(),
                    descriptor: descriptor.clone(),
                },
            )
        });
        Ok(AnnouncementHandle::new(fullname))
    }

    fn withdraw_announcement(&self, handle: &AnnouncementHandle) -> lumen_mdns::Result<()> {
        self.with_host(|h| h.announcements.remove(handle.as_str()));
        Ok(())
    }
}

impl Prober for SimEndpoint {
    fn probe(&self, ip: &str) {
        self.with_host(|h| h.probes.push(ip.to_string()));
    }
}

// ── Nodes ─────────────────────────────────────────────────────────

pub struct SimNode {
    pub core: MeshCore,
    pub endpoint: Arc<SimEndpoint>,
    pub registry: Arc<Registry>,
    pub liveness: Arc<LivenessTable>,
    pub events: broadcast::Receiver<MeshEvent>,
}

impl SimNode {
    pub fn id(&self) -> ControllerId {
        self.core.identity().id
    }

    pub fn ip(&self) -> &str {
        self.endpoint.ip()
    }

    /// Deliver queued replies and probe results.
    pub fn drain(&mut self, net: &SimNetwork) {
        for message in net.drain_replies(self.endpoint.ip()) {
            self.core.on_message(&message);
        }
        for result in net.drain_probes(self.endpoint.ip()) {
            self.core.on_probe_result(&result);
        }
    }

    /// Everything emitted since the last call.
    pub fn take_events(&mut self) -> Vec<MeshEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Test config: fast election cycle, probes on.
pub fn test_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.election.election_every_ticks = 2;
    config.election.election_recheck_ticks = 1;
    config
}

pub fn spawn_node(
    net: &Arc<SimNetwork>,
    id: u32,
    hostname: &str,
    ip: &str,
    config: &MeshConfig,
    registry: Arc<Registry>,
    probes: bool,
) -> SimNode {
    let endpoint = net.join(ip);
    let liveness = Arc::new(LivenessTable::new(config.liveness.expiry_floor_secs));
    let events = EventSink::new();
    let rx = events.subscribe();
    let prober: Option<Arc<dyn Prober>> = if probes {
        Some(endpoint.clone())
    } else {
        None
    };
    let mut core = MeshCore::new(
        config,
        NodeIdentity {
            id: ControllerId(id),
            hostname: hostname.to_string(),
        },
        MeshDeps {
            registry: registry.clone(),
            liveness: liveness.clone(),
            transport: endpoint.clone(),
            announcements: endpoint.clone(),
            prober,
            events,
        },
    )
    .unwrap();
    core.start();
    SimNode {
        core,
        endpoint,
        registry,
        liveness,
        events: rx,
    }
}

pub fn node(net: &Arc<SimNetwork>, id: u32, hostname: &str, ip: &str) -> SimNode {
    spawn_node(
        net,
        id,
        hostname,
        ip,
        &test_config(),
        Arc::new(Registry::in_memory()),
        false,
    )
}

/// Tick every node, then drain every inbox.
pub fn round(net: &SimNetwork, nodes: &mut [SimNode]) {
    for node in nodes.iter_mut() {
        node.core.tick(TICK_SECS);
    }
    for node in nodes.iter_mut() {
        node.drain(net);
    }
}

pub fn leaders(nodes: &[SimNode]) -> Vec<ControllerId> {
    nodes
        .iter()
        .filter(|n| n.core.is_leader())
        .map(|n| n.id())
        .collect()
}
