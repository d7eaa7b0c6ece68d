//! Discovery engine.
//!
//! Issues the periodic multicast browse plus a rotating batch of direct
//! host queries, and turns every inbound reply into registry and
//! liveness updates. Replies are classified once, by shape:
//!
//! | shape                              | kind                 | ttl       |
//! |------------------------------------|----------------------|-----------|
//! | SRV for our service type (+TXT, A) | API-service response | multicast |
//! | bare A for `<host>.local`          | hostname address     | unicast   |
//! | A + TXT, no SRV                    | full hostname        | unicast   |
//! | TXT completing a buffered address  | pending completion   | unicast   |
//!
//! Only `type=host` records are admitted as controllers; leader and group
//! records name virtual hosts.

use std::collections::VecDeque;
use std::sync::Arc;

use lumen_common::types::{strip_local_suffix, ControllerId, Role, ServiceType};
use lumen_mdns::message::{Advertisement, Message, TextRecord};
use lumen_mdns::{QueryKind, QueryTransport};
use lumen_registry::{ControllerRecord, LivenessTable, Refresh, Registry, Upsert};

use crate::events::{EventSink, MeshEvent};

/// Liveness ttl granted per discovery source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceTtls {
    pub multicast: i64,
    pub unicast: i64,
}

/// How an inbound message was understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Not a mesh reply.
    Ignored,
    /// Our own announcement echoed back.
    Own,
    ApiService {
        advertisement: Option<Advertisement>,
        admission: Admission,
    },
    HostnameAddress {
        hostname: String,
        admission: Admission,
    },
    HostnameFull {
        advertisement: Advertisement,
        admission: Admission,
    },
}

impl Response {
    pub fn is_handled(&self) -> bool {
        !matches!(self, Response::Ignored)
    }

    /// A remote peer advertised `isLeader=1`.
    pub fn leader_seen(&self) -> bool {
        match self {
            Response::ApiService {
                advertisement: Some(adv),
                ..
            }
            | Response::HostnameFull {
                advertisement: adv, ..
            } => adv.is_leader,
            _ => false,
        }
    }

    pub fn admission(&self) -> Option<&Admission> {
        match self {
            Response::ApiService { admission, .. }
            | Response::HostnameAddress { admission, .. }
            | Response::HostnameFull { admission, .. } => Some(admission),
            Response::Ignored | Response::Own => None,
        }
    }
}

/// Outcome of [`DiscoveryEngine::add_or_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Nothing to admit (non-host role, or no id yet).
    Skipped,
    /// Buffered until a TXT record supplies the id.
    Pending,
    /// Reserved id; silently refused.
    Reserved,
    /// Registry write failed; dropped for this cycle.
    Failed,
    Admitted { record: Upsert, liveness: Refresh },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

// ── Pending hostname resolutions ──────────────────────────────────

#[derive(Debug, Clone)]
struct PendingHost {
    hostname: String,
    ip: String,
    age_secs: u64,
}

/// Addresses seen for host names the registry does not know yet.
///
/// At most one entry per host name, bounded by age and capacity.
#[derive(Debug)]
pub struct PendingResolutions {
    entries: VecDeque<PendingHost>,
    max_age_secs: u64,
    capacity: usize,
}

impl PendingResolutions {
    pub fn new(max_age_secs: u64, capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_age_secs,
            capacity: capacity.max(1),
        }
    }

    /// Replaces any earlier address for the same host name.
    pub fn insert(&mut self, hostname: &str, ip: &str) {
        self.entries
            .retain(|p| !p.hostname.eq_ignore_ascii_case(hostname));
        if self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::debug!(hostname = evicted.hostname, "Pending resolution evicted");
            }
        }
        self.entries.push_back(PendingHost {
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            age_secs: 0,
        });
    }

    pub fn take(&mut self, hostname: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|p| p.hostname.eq_ignore_ascii_case(hostname))?;
        self.entries.remove(index).map(|p| p.ip)
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.entries
            .iter()
            .any(|p| p.hostname.eq_ignore_ascii_case(hostname))
    }

    /// Age every entry and drop the ones past the limit.
    pub fn expire(&mut self, elapsed_secs: u64) -> usize {
        let before = self.entries.len();
        let max = self.max_age_secs;
        self.entries.retain_mut(|p| {
            p.age_secs = p.age_secs.saturating_add(elapsed_secs);
            p.age_secs <= max
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Engine ────────────────────────────────────────────────────────

pub struct DiscoveryEngine {
    own_id: ControllerId,
    service_type: ServiceType,
    ttls: SourceTtls,
    batch_rotation: usize,
    batch_cursor: usize,
    registry: Arc<Registry>,
    liveness: Arc<LivenessTable>,
    transport: Arc<dyn QueryTransport>,
    events: EventSink,
    pending: PendingResolutions,
}

impl DiscoveryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        own_id: ControllerId,
        service_type: ServiceType,
        ttls: SourceTtls,
        batch_rotation: u32,
        pending: PendingResolutions,
        registry: Arc<Registry>,
        liveness: Arc<LivenessTable>,
        transport: Arc<dyn QueryTransport>,
        events: EventSink,
    ) -> Self {
        Self {
            own_id,
            service_type,
            ttls,
            batch_rotation: batch_rotation.max(1) as usize,
            batch_cursor: 0,
            registry,
            liveness,
            transport,
            events,
            pending,
        }
    }

    /// Send this tick's queries and return the unicast batch.
    ///
    /// The batch is `ceil(N / batch_rotation)` controllers taken round
    /// robin, so every known controller is queried once per rotation.
    pub fn tick(&mut self) -> Vec<ControllerRecord> {
        if !self
            .transport
            .search(self.service_type.as_str(), QueryKind::Service)
        {
            tracing::debug!(service_type = %self.service_type, "Multicast query not sent");
        }

        let batch = self.next_batch();
        for record in &batch {
            if !self.transport.search(&record.hostname, QueryKind::Address) {
                tracing::debug!(hostname = record.hostname, "Host query not sent");
            }
        }
        batch
    }

    fn next_batch(&mut self) -> Vec<ControllerRecord> {
        let mut known: Vec<ControllerRecord> = self
            .registry
            .controllers()
            .into_iter()
            .filter(|c| c.id != self.own_id && !c.hostname.is_empty())
            .collect();
        if known.is_empty() {
            self.batch_cursor = 0;
            return Vec::new();
        }
        known.sort_by_key(|c| c.id);

        let n = known.len();
        let size = n.div_ceil(self.batch_rotation);
        let start = self.batch_cursor % n;
        self.batch_cursor = (start + size) % n;
        known.into_iter().cycle().skip(start).take(size).collect()
    }

    /// Age the pending host-name buffer.
    pub fn expire_pending(&mut self, elapsed_secs: u64) {
        let expired = self.pending.expire(elapsed_secs);
        if expired > 0 {
            tracing::debug!(expired, "Pending host resolutions expired");
        }
    }

    pub fn pending(&self) -> &PendingResolutions {
        &self.pending
    }

    // ── Inbound ───────────────────────────────────────────────────

    pub fn on_message(&mut self, message: &Message) -> Response {
        if !message.is_reply() {
            return Response::Ignored;
        }

        if let Some(service) = message.service() {
            if self.service_type.matches(&service.name) {
                return self.on_api_service(message);
            }
        }

        if message.service().is_some() {
            tracing::trace!("Reply for another service type ignored");
            return Response::Ignored;
        }

        match (message.address(), message.text()) {
            (Some(_), None) => self.on_hostname_address(message),
            (Some(_), Some(_)) => self.on_hostname_full(message),
            (None, Some(text)) => self.on_pending_text(text),
            (None, None) => Response::Ignored,
        }
    }

    fn on_api_service(&mut self, message: &Message) -> Response {
        let Some(advertisement) = message.text().and_then(Advertisement::decode) else {
            tracing::debug!("Service reply without a usable id");
            return Response::ApiService {
                advertisement: None,
                admission: Admission::Skipped,
            };
        };
        if advertisement.id == self.own_id {
            return Response::Own;
        }
        if advertisement.is_leader {
            tracing::debug!(id = %advertisement.id, "Leader advertisement seen");
        }

        let hostname = message
            .service()
            .and_then(|s| strip_local_suffix(&s.target))
            .or_else(|| message.address().and_then(|a| strip_local_suffix(&a.name)))
            .unwrap_or_default()
            .to_string();

        let admission = match advertisement.role {
            Role::Host => {
                let ip = self.address_for(message, &hostname);
                self.add_or_update(&hostname, &ip, self.ttls.multicast, advertisement.id)
            }
            role => {
                tracing::debug!(id = %advertisement.id, %role, "Non-host record not admitted");
                Admission::Skipped
            }
        };

        Response::ApiService {
            advertisement: Some(advertisement),
            admission,
        }
    }

    fn on_hostname_address(&mut self, message: &Message) -> Response {
        let Some(address) = message.address() else {
            return Response::Ignored;
        };
        let Some(hostname) = strip_local_suffix(&address.name) else {
            tracing::trace!(name = address.name, "Address outside .local ignored");
            return Response::Ignored;
        };
        let hostname = hostname.to_string();

        let admission = match self.registry.id_by_hostname(&hostname) {
            Some(id) if id == self.own_id => return Response::Own,
            Some(id) => self.add_or_update(&hostname, &address.ip, self.ttls.unicast, id),
            None => {
                tracing::debug!(hostname, ip = address.ip, "Address buffered until id is known");
                self.pending.insert(&hostname, &address.ip);
                Admission::Pending
            }
        };
        Response::HostnameAddress {
            hostname,
            admission,
        }
    }

    fn on_hostname_full(&mut self, message: &Message) -> Response {
        let (Some(address), Some(text)) = (message.address(), message.text()) else {
            return Response::Ignored;
        };
        let Some(advertisement) = Advertisement::decode(text) else {
            return self.on_hostname_address(message);
        };
        if advertisement.id == self.own_id {
            return Response::Own;
        }
        let Some(hostname) = strip_local_suffix(&address.name) else {
            return Response::Ignored;
        };
        let hostname = hostname.to_string();

        let admission = match advertisement.role {
            Role::Host => {
                self.pending.take(&hostname);
                self.add_or_update(&hostname, &address.ip, self.ttls.unicast, advertisement.id)
            }
            _ => Admission::Skipped,
        };
        Response::HostnameFull {
            advertisement,
            admission,
        }
    }

    /// A TXT record naming a host whose address was buffered earlier.
    fn on_pending_text(&mut self, text: &TextRecord) -> Response {
        let Some(hostname) = self.host_of(&text.name) else {
            return Response::Ignored;
        };
        if !self.pending.contains(&hostname) {
            return Response::Ignored;
        }
        let Some(advertisement) = Advertisement::decode(text) else {
            return Response::Ignored;
        };
        if advertisement.id == self.own_id {
            return Response::Own;
        }

        let admission = match advertisement.role {
            Role::Host => match self.pending.take(&hostname) {
                Some(ip) => self.add_or_update(&hostname, &ip, self.ttls.unicast, advertisement.id),
                None => Admission::Skipped,
            },
            _ => {
                self.pending.take(&hostname);
                Admission::Skipped
            }
        };
        Response::HostnameFull {
            advertisement,
            admission,
        }
    }

    /// Address for `hostname` from the message, else from the buffer.
    fn address_for(&mut self, message: &Message, hostname: &str) -> String {
        let buffered = self.pending.take(hostname);
        message
            .address()
            .map(|a| a.ip.clone())
            .or(buffered)
            .unwrap_or_default()
    }

    /// Host label of a record name: either `<host>.local` or an
    /// instance `<host>.<service type>`.
    fn host_of(&self, record_name: &str) -> Option<String> {
        if self.service_type.matches(record_name) {
            let instance = record_name.split("._").next()?;
            if instance.is_empty() || instance.starts_with('_') {
                return None;
            }
            return Some(instance.to_string());
        }
        strip_local_suffix(record_name).map(str::to_string)
    }

    // ── Admission ─────────────────────────────────────────────────

    /// Admit a controller into the registry and liveness table.
    ///
    /// The record is written only when hostname or address changed. A
    /// controller new to the liveness table starts at `ttl` and raises
    /// a [`MeshEvent::HostVisible`]; a known one is raised to `ttl` if
    /// that is higher.
    pub fn add_or_update(
        &mut self,
        hostname: &str,
        ip: &str,
        ttl: i64,
        id: ControllerId,
    ) -> Admission {
        if id.is_reserved() {
            return Admission::Reserved;
        }

        let record = match self
            .registry
            .update(|tx| tx.upsert_controller(id, hostname, ip))
        {
            Ok(upsert) => upsert,
            Err(e) => {
                tracing::warn!(%id, hostname, error = %e, "Registry update failed");
                return Admission::Failed;
            }
        };
        if record == Upsert::Created {
            tracing::info!(%id, hostname, ip, "Controller registered");
        }

        let liveness = self.liveness.refresh(id, ttl);
        if liveness == Refresh::Inserted {
            tracing::info!(%id, hostname, ip, ttl, "Controller visible");
            self.events.emit(MeshEvent::HostVisible {
                id,
                hostname: hostname.to_string(),
                ip: ip.to_string(),
            });
        }
        Admission::Admitted { record, liveness }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Queries(Mutex<Vec<(String, QueryKind)>>);

    impl QueryTransport for Queries {
        fn search(&self, name: &str, kind: QueryKind) -> bool {
            self.0.lock().unwrap().push((name.to_string(), kind));
            true
        }
    }

    struct Fixture {
        engine: DiscoveryEngine,
        registry: Arc<Registry>,
        liveness: Arc<LivenessTable>,
        queries: Arc<Queries>,
        events: EventSink,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::in_memory());
        let liveness = Arc::new(LivenessTable::default());
        let queries = Arc::new(Queries::default());
        let events = EventSink::new();
        let engine = DiscoveryEngine::new(
            ControllerId(12),
            ServiceType::parse("_http._tcp").unwrap(),
            SourceTtls {
                multicast: 60,
                unicast: 90,
            },
            5,
            PendingResolutions::new(30, 4),
            registry.clone(),
            liveness.clone(),
            queries.clone(),
            events.clone(),
        );
        Fixture {
            engine,
            registry,
            liveness,
            queries,
            events,
        }
    }

    fn service_reply(host: &str, ip: &str, txt: &[(&str, &str)]) -> Message {
        let fullname = format!("{host}._http._tcp.local.");
        let target = format!("{host}.local.");
        Message::reply()
            .with_service(&fullname, &target, 80, 120)
            .with_text(&fullname, 120, txt.iter().copied())
            .with_address(&target, ip, 120)
    }

    #[test]
    fn api_service_reply_admits_hosts() {
        let mut f = fixture();
        let mut rx = f.events.subscribe();
        let response = f.engine.on_message(&service_reply(
            "deck",
            "10.0.0.7",
            &[("id", "7"), ("type", "host")],
        ));

        assert!(response.admission().unwrap().is_admitted());
        assert!(!response.leader_seen());
        let record = f.registry.controller(ControllerId(7)).unwrap();
        assert_eq!(record.hostname, "deck");
        assert_eq!(record.ip_address, "10.0.0.7");
        assert_eq!(f.liveness.entry(ControllerId(7)).unwrap().ttl, 60);
        assert_eq!(
            rx.try_recv().unwrap(),
            MeshEvent::HostVisible {
                id: ControllerId(7),
                hostname: "deck".into(),
                ip: "10.0.0.7".into(),
            }
        );
    }

    #[test]
    fn leader_records_flag_but_are_not_admitted() {
        let mut f = fixture();
        let response = f.engine.on_message(&service_reply(
            "lumen-leader",
            "10.0.0.9",
            &[("id", "9"), ("type", "leader"), ("isLeader", "1")],
        ));
        assert!(response.leader_seen());
        assert_eq!(response.admission(), Some(&Admission::Skipped));
        assert!(f.registry.is_empty());
        assert!(f.liveness.is_empty());
    }

    #[test]
    fn group_and_untyped_records_are_not_admitted() {
        let mut f = fixture();
        f.engine.on_message(&service_reply(
            "lumen-group-deck",
            "10.0.0.9",
            &[("id", "9"), ("type", "group"), ("group", "2")],
        ));
        f.engine
            .on_message(&service_reply("mystery", "10.0.0.8", &[("id", "8")]));
        assert!(f.registry.is_empty());
    }

    #[test]
    fn own_announcements_are_recognised() {
        let mut f = fixture();
        let response = f.engine.on_message(&service_reply(
            "porch",
            "10.0.0.12",
            &[("id", "12"), ("type", "host"), ("isLeader", "1")],
        ));
        assert_eq!(response, Response::Own);
        assert!(!response.leader_seen());
        assert!(f.registry.is_empty());
    }

    #[test]
    fn other_service_types_are_ignored() {
        let mut f = fixture();
        let message = Message::reply().with_service("x._ipp._tcp.local.", "x.local.", 631, 120);
        assert_eq!(f.engine.on_message(&message), Response::Ignored);
        assert!(!f.engine.on_message(&Message::query()).is_handled());
    }

    #[test]
    fn reserved_id_is_never_admitted() {
        let mut f = fixture();
        assert_eq!(
            f.engine.add_or_update("ghost", "10.0.0.1", 60, ControllerId(1)),
            Admission::Reserved
        );
        assert!(f.registry.controller(ControllerId(1)).is_none());
        assert!(!f.liveness.contains(ControllerId(1)));
        assert_eq!(f.registry.write_count(), 0);
    }

    #[test]
    fn add_or_update_is_idempotent() {
        let mut f = fixture();
        f.engine.add_or_update("deck", "10.0.0.7", 60, ControllerId(7));
        let writes = f.registry.write_count();
        let again = f.engine.add_or_update("deck", "10.0.0.7", 60, ControllerId(7));
        assert_eq!(
            again,
            Admission::Admitted {
                record: Upsert::Unchanged,
                liveness: Refresh::Refreshed { was_online: true },
            }
        );
        assert_eq!(f.registry.write_count(), writes);
    }

    #[test]
    fn weaker_source_never_lowers_ttl() {
        let mut f = fixture();
        f.engine.add_or_update("deck", "10.0.0.7", 90, ControllerId(7));
        f.engine.add_or_update("deck", "10.0.0.7", 60, ControllerId(7));
        assert_eq!(f.liveness.entry(ControllerId(7)).unwrap().ttl, 90);
    }

    #[test]
    fn known_hostname_address_is_admitted_with_unicast_ttl() {
        let mut f = fixture();
        f.registry
            .update(|tx| tx.upsert_controller(ControllerId(7), "deck", "10.0.0.7"))
            .unwrap();
        let response = f
            .engine
            .on_message(&Message::reply().with_address("deck.local.", "10.0.0.70", 120));
        assert!(matches!(response, Response::HostnameAddress { .. }));
        assert_eq!(
            f.registry.controller(ControllerId(7)).unwrap().ip_address,
            "10.0.0.70"
        );
        assert_eq!(f.liveness.entry(ControllerId(7)).unwrap().ttl, 90);
    }

    #[test]
    fn unknown_hostname_waits_for_text_record() {
        let mut f = fixture();
        let response = f
            .engine
            .on_message(&Message::reply().with_address("attic.local.", "10.0.0.5", 120));
        assert_eq!(
            response.admission(),
            Some(&Admission::Pending),
            "address buffered"
        );
        assert!(f.registry.is_empty());
        assert_eq!(f.engine.pending().len(), 1);

        let text = Message::reply().with_text("attic.local.", 120, [("id", "5"), ("type", "host")]);
        let response = f.engine.on_message(&text);
        assert!(response.admission().unwrap().is_admitted());
        assert_eq!(
            f.registry.controller(ControllerId(5)).unwrap().ip_address,
            "10.0.0.5"
        );
        assert!(f.engine.pending().is_empty());
    }

    #[test]
    fn service_reply_without_address_uses_buffered_one() {
        let mut f = fixture();
        f.engine
            .on_message(&Message::reply().with_address("attic.local.", "10.0.0.5", 120));
        let message = Message::reply()
            .with_service("attic._http._tcp.local.", "attic.local.", 80, 120)
            .with_text(
                "attic._http._tcp.local.",
                120,
                [("id", "5"), ("type", "host")],
            );
        f.engine.on_message(&message);
        assert_eq!(
            f.registry.controller(ControllerId(5)).unwrap().ip_address,
            "10.0.0.5"
        );
        assert!(f.engine.pending().is_empty());
    }

    #[test]
    fn full_hostname_reply_respects_role() {
        let mut f = fixture();
        let host = Message::reply()
            .with_address("deck.local.", "10.0.0.7", 120)
            .with_text("deck.local.", 120, [("id", "7"), ("type", "host")]);
        let leader = Message::reply()
            .with_address("lumen-leader.local.", "10.0.0.9", 120)
            .with_text(
                "lumen-leader.local.",
                120,
                [("id", "9"), ("type", "leader"), ("isLeader", "1")],
            );

        assert!(f.engine.on_message(&host).admission().unwrap().is_admitted());
        let response = f.engine.on_message(&leader);
        assert!(response.leader_seen());
        assert!(f.registry.controller(ControllerId(9)).is_none());
    }

    #[test]
    fn pending_buffer_is_bounded() {
        let mut pending = PendingResolutions::new(30, 2);
        pending.insert("a", "10.0.0.1");
        pending.insert("b", "10.0.0.2");
        pending.insert("c", "10.0.0.3");
        assert_eq!(pending.len(), 2);
        assert!(!pending.contains("a"));

        pending.insert("b", "10.0.0.22");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.take("B").as_deref(), Some("10.0.0.22"));

        pending.expire(20);
        pending.insert("d", "10.0.0.4");
        assert_eq!(pending.expire(15), 1);
        assert!(!pending.contains("c"));
        assert!(pending.contains("d"));
    }

    #[test]
    fn batches_cover_every_controller_per_rotation() {
        let mut f = fixture();
        f.registry
            .update(|tx| {
                for n in 2..=13u32 {
                    tx.upsert_controller(ControllerId(n), &format!("node-{n}"), "10.0.0.1");
                }
            })
            .unwrap();

        // 11 peers (self excluded) over 5 ticks: batches of 3.
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..5 {
            let batch = f.engine.tick();
            assert_eq!(batch.len(), 3);
            seen.extend(batch.into_iter().map(|c| c.id));
        }
        assert_eq!(seen.len(), 11);
        assert!(!seen.contains(&ControllerId(12)));

        let queries = f.queries.0.lock().unwrap();
        let multicast = queries
            .iter()
            .filter(|(name, kind)| *kind == QueryKind::Service && name == "_http._tcp.local.")
            .count();
        assert_eq!(multicast, 5);
        assert_eq!(queries.len(), 5 + 15);
    }

    #[test]
    fn empty_registry_sends_only_multicast() {
        let mut f = fixture();
        assert!(f.engine.tick().is_empty());
        assert_eq!(f.queries.0.lock().unwrap().len(), 1);
    }
}
