use std::collections::HashSet;
use std::sync::Mutex;

use mdns_sd::{HostnameResolutionEvent, ResolvedService, ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::descriptor::ServiceDescriptor;
use crate::error::{MdnsError, Result};
use crate::message::{Message, Record, ServiceRecord, TextRecord};
use crate::{AnnouncementHandle, AnnouncementSink, QueryKind, QueryTransport};

/// mdns-sd does not surface record TTLs; peers use the RFC 6762 host default.
const DEFAULT_RECORD_TTL: u32 = 120;

/// How long a direct host-name lookup stays open.
const HOSTNAME_QUERY_TIMEOUT_MS: u64 = 3_000;

// ── Worker operations ─────────────────────────────────────────────

/// Operations serialized onto the dedicated mDNS worker thread, so the
/// bounded channel inside mdns-sd never blocks a tokio worker.
enum MdnsOp {
    Register(Box<ServiceInfo>),
    Unregister(String),
    Browse(String),
    ResolveHostname(String),
    Shutdown {
        reply: oneshot::Sender<std::result::Result<(), String>>,
    },
}

// ── MdnsDaemon ────────────────────────────────────────────────────

/// `mdns-sd` daemon behind a worker thread.
///
/// The only file that touches mdns_sd types. Every reply seen by a
/// browse or host-name lookup is converted into a [`Message`] and pushed
/// into the inbox supplied at construction.
pub struct MdnsDaemon {
    op_tx: Mutex<std::sync::mpsc::Sender<MdnsOp>>,
}

impl MdnsDaemon {
    /// Must be called from inside a tokio runtime: reply pumps are
    /// spawned onto it.
    pub fn new(inbox: mpsc::UnboundedSender<Message>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| MdnsError::NoRuntime)?;
        let daemon = ServiceDaemon::new().map_err(|e| MdnsError::Daemon(e.to_string()))?;
        let (op_tx, op_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("lumen-mdns-ops".into())
            .spawn(move || worker_loop(daemon, op_rx, runtime, inbox))
            .map_err(|e| MdnsError::Daemon(format!("Failed to spawn mDNS worker: {e}")))?;

        Ok(Self {
            op_tx: Mutex::new(op_tx),
        })
    }

    fn send(&self, op: MdnsOp) -> Result<()> {
        self.op_tx
            .lock()
            .unwrap()
            .send(op)
            .map_err(|_| MdnsError::Daemon("mDNS worker stopped".into()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(MdnsOp::Shutdown { reply: tx })?;
        rx.await
            .map_err(|_| MdnsError::Daemon("mDNS worker dropped reply".into()))?
            .map_err(MdnsError::Daemon)
    }
}

impl QueryTransport for MdnsDaemon {
    fn search(&self, name: &str, kind: QueryKind) -> bool {
        let op = match kind {
            QueryKind::Service => MdnsOp::Browse(name.to_string()),
            QueryKind::Address => {
                let host = if name.ends_with(".local.") {
                    name.to_string()
                } else {
                    format!("{}.local.", name.trim_end_matches('.'))
                };
                MdnsOp::ResolveHostname(host)
            }
        };
        self.send(op).is_ok()
    }
}

impl AnnouncementSink for MdnsDaemon {
    fn register_announcement(
        &self,
        hostname: &str,
        descriptor: &ServiceDescriptor,
    ) -> Result<AnnouncementHandle> {
        descriptor.validate()?;
        let host = format!("{hostname}.local.");
        let properties: Vec<(&str, &str)> = descriptor
            .txt
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let info = ServiceInfo::new(
            &descriptor.service_type(),
            &descriptor.instance,
            &host,
            "",
            descriptor.port,
            &properties[..],
        )
        .map_err(|e| MdnsError::Daemon(e.to_string()))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        tracing::debug!(fullname, host, "Queued mDNS register");
        self.send(MdnsOp::Register(Box::new(info)))?;
        Ok(AnnouncementHandle::new(fullname))
    }

    fn withdraw_announcement(&self, handle: &AnnouncementHandle) -> Result<()> {
        tracing::debug!(fullname = %handle, "Queued mDNS unregister");
        self.send(MdnsOp::Unregister(handle.as_str().to_string()))
    }
}

// ── Worker thread ─────────────────────────────────────────────────

fn worker_loop(
    daemon: ServiceDaemon,
    rx: std::sync::mpsc::Receiver<MdnsOp>,
    runtime: Handle,
    inbox: mpsc::UnboundedSender<Message>,
) {
    tracing::debug!("mDNS worker thread started");
    let mut browsing: HashSet<String> = HashSet::new();

    while let Ok(op) = rx.recv() {
        match op {
            MdnsOp::Register(info) => {
                let fullname = info.get_fullname().to_string();
                if let Err(e) = daemon.register(*info) {
                    tracing::warn!(fullname, error = %e, "mDNS register failed");
                }
            }
            MdnsOp::Unregister(fullname) => {
                if let Err(e) = daemon.unregister(&fullname) {
                    tracing::warn!(fullname, error = %e, "mDNS unregister failed");
                }
            }
            MdnsOp::Browse(service_type) => {
                // Restarting the browse sends a fresh query and replays
                // every cached instance, which is what keeps peers' TTLs up.
                if browsing.contains(&service_type) {
                    if let Err(e) = daemon.stop_browse(&service_type) {
                        tracing::debug!(service_type, error = %e, "mDNS stop_browse failed");
                    }
                }
                match daemon.browse(&service_type) {
                    Ok(receiver) => {
                        browsing.insert(service_type);
                        runtime.spawn(pump_browse(receiver, inbox.clone()));
                    }
                    Err(e) => tracing::debug!(service_type, error = %e, "mDNS browse failed"),
                }
            }
            MdnsOp::ResolveHostname(host) => {
                match daemon.resolve_hostname(&host, Some(HOSTNAME_QUERY_TIMEOUT_MS)) {
                    Ok(receiver) => {
                        runtime.spawn(pump_hostname(receiver, inbox.clone()));
                    }
                    Err(e) => tracing::debug!(host, error = %e, "mDNS hostname query failed"),
                }
            }
            MdnsOp::Shutdown { reply } => {
                let result = daemon.shutdown().map(|_| ()).map_err(|e| e.to_string());
                let _ = reply.send(result);
                break;
            }
        }
    }

    tracing::debug!("mDNS worker thread stopped");
}

async fn pump_browse(
    receiver: mdns_sd::Receiver<ServiceEvent>,
    inbox: mpsc::UnboundedSender<Message>,
) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            ServiceEvent::ServiceResolved(resolved) => {
                if inbox.send(resolved_to_message(&resolved)).is_err() {
                    break;
                }
            }
            ServiceEvent::SearchStopped(_) => break,
            _ => continue,
        }
    }
}

async fn pump_hostname(
    receiver: mdns_sd::Receiver<HostnameResolutionEvent>,
    inbox: mpsc::UnboundedSender<Message>,
) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            HostnameResolutionEvent::AddressesFound(host, addresses) => {
                let mut message = Message::reply();
                for addr in &addresses {
                    message = message.with_address(&host, &addr.to_string(), DEFAULT_RECORD_TTL);
                }
                if inbox.send(message).is_err() {
                    break;
                }
            }
            HostnameResolutionEvent::SearchTimeout(_)
            | HostnameResolutionEvent::SearchStopped(_) => break,
            _ => continue,
        }
    }
}

// ── Conversion ────────────────────────────────────────────────────

/// SRV + TXT + A for one resolved instance. Address records carry the
/// first IPv4 when the host has one.
fn resolved_to_message(resolved: &ResolvedService) -> Message {
    let fullname = resolved.get_fullname().to_string();
    let host = resolved.get_hostname().to_string();

    let mut message = Message::reply();
    message.push(Record::Service(ServiceRecord {
        name: fullname.clone(),
        target: host.clone(),
        port: resolved.get_port(),
        ttl: DEFAULT_RECORD_TTL,
    }));
    message.push(Record::Text(TextRecord {
        name: fullname,
        ttl: DEFAULT_RECORD_TTL,
        entries: resolved
            .get_properties()
            .iter()
            .map(|p| (p.key().to_string(), p.val_str().to_string()))
            .collect(),
    }));

    let addresses = resolved.get_addresses();
    let ip = addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addresses.iter().next())
        .map(|a| a.to_ip_addr().to_string());
    if let Some(ip) = ip {
        message = message.with_address(&host, &ip, DEFAULT_RECORD_TTL);
    }
    message
}
