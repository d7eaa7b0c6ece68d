//! lumen mesh: discovery, liveness and leader election.
//!
//! Controllers find each other over mDNS, keep a TTL-decayed view of
//! who is reachable, and elect one global leader plus one leader per
//! configured group, without any consensus round.
//!
//! [`MeshCore`] is the synchronous state machine; [`MeshBuilder`] wires
//! it to the real mDNS daemon and HTTP prober (or to caller supplied
//! transports) and runs it on a single tokio task.

pub mod announce;
pub mod config;
pub mod discovery;
pub mod election;
pub mod error;
pub mod events;
pub mod groups;
mod node;
pub mod pinger;
mod runtime;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lumen_common::types::{ControllerId, GroupId};
use lumen_mdns::{AnnouncementSink, MdnsDaemon, Message, QueryTransport};
use lumen_registry::{GroupRecord, HostFilter, HostList, LivenessTable, Registry};

pub use self::config::MeshConfig;
pub use self::error::{MeshError, Result};
pub use self::events::{EventSink, MeshEvent};
pub use self::node::{MeshCore, MeshDeps, MeshStatus, NodeIdentity};
pub use self::pinger::{HttpProber, ProbeResult, Prober};

use self::runtime::MeshCommand;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

pub struct MeshBuilder {
    config: MeshConfig,
    id: Option<ControllerId>,
    hostname: Option<String>,
    registry: Option<Arc<Registry>>,
    registry_path: Option<PathBuf>,
    transport: Option<Arc<dyn QueryTransport>>,
    announcements: Option<Arc<dyn AnnouncementSink>>,
    prober: Option<Arc<dyn Prober>>,
}

impl MeshBuilder {
    pub fn new() -> Self {
        Self {
            config: MeshConfig::default(),
            id: None,
            hostname: None,
            registry: None,
            registry_path: None,
            transport: None,
            announcements: None,
            prober: None,
        }
    }

    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    pub fn id(mut self, id: ControllerId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Share an already open registry.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Open the registry file at `path` instead of the default location.
    pub fn registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = Some(path.into());
        self
    }

    /// Replace the mDNS daemon for queries. Replies go to
    /// [`MeshHandle::message_sender`].
    pub fn transport(mut self, transport: Arc<dyn QueryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the mDNS daemon for announcements.
    pub fn announcements(mut self, sink: Arc<dyn AnnouncementSink>) -> Self {
        self.announcements = Some(sink);
        self
    }

    /// Replace the HTTP prober. Results go to [`MeshHandle::probe_sender`].
    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn build(self) -> Result<Mesh> {
        self.config.validate()?;
        if let Some(id) = self.id {
            if id.is_reserved() {
                return Err(MeshError::Config(format!("node id {id} is reserved")));
            }
        }
        Ok(Mesh { builder: self })
    }
}

impl Default for MeshBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured, not yet running mesh node.
pub struct Mesh {
    builder: MeshBuilder,
}

impl Mesh {
    pub async fn start(self) -> Result<MeshHandle> {
        let b = self.builder;
        let config = b.config;

        let identity = NodeIdentity {
            id: b.id.unwrap_or_else(|| config.node_id()),
            hostname: match b.hostname {
                Some(hostname) => hostname,
                None => config.hostname()?,
            },
        };

        let registry = match b.registry {
            Some(registry) => registry,
            None => {
                let path = b
                    .registry_path
                    .unwrap_or_else(lumen_common::paths::registry_path);
                Arc::new(Registry::open(path)?)
            }
        };
        let liveness = Arc::new(LivenessTable::new(config.liveness.expiry_floor_secs));
        let events = EventSink::new();

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let (transport, announcements, daemon) = match (b.transport, b.announcements) {
            (Some(transport), Some(sink)) => (transport, sink, None),
            (transport, sink) => {
                let daemon = Arc::new(MdnsDaemon::new(message_tx.clone())?);
                let transport: Arc<dyn QueryTransport> = match transport {
                    Some(transport) => transport,
                    None => daemon.clone(),
                };
                let sink: Arc<dyn AnnouncementSink> = match sink {
                    Some(sink) => sink,
                    None => daemon.clone(),
                };
                (transport, sink, Some(daemon))
            }
        };

        let prober: Option<Arc<dyn Prober>> = match b.prober {
            Some(prober) => Some(prober),
            None if config.probe.enabled => Some(Arc::new(HttpProber::new(
                &config.probe.probe_path,
                std::time::Duration::from_secs(config.probe.probe_timeout_secs),
                probe_tx.clone(),
            )?)),
            None => None,
        };

        let mut core = MeshCore::new(
            &config,
            identity.clone(),
            MeshDeps {
                registry: registry.clone(),
                liveness: liveness.clone(),
                transport,
                announcements,
                prober,
                events: events.clone(),
            },
        )?;
        core.start();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(runtime::run(
            core,
            config.tick_interval(),
            runtime::RuntimeChannels {
                messages: message_rx,
                probes: probe_rx,
                commands: command_rx,
            },
            cancel.clone(),
        ));

        Ok(MeshHandle {
            identity,
            registry,
            liveness,
            events,
            commands: command_tx,
            messages: message_tx,
            probes: probe_tx,
            daemon,
            cancel,
            task: Some(task),
        })
    }
}

/// Handle to a running mesh node.
pub struct MeshHandle {
    identity: NodeIdentity,
    registry: Arc<Registry>,
    liveness: Arc<LivenessTable>,
    events: EventSink,
    commands: mpsc::Sender<MeshCommand>,
    messages: mpsc::UnboundedSender<Message>,
    probes: mpsc::UnboundedSender<ProbeResult>,
    daemon: Option<Arc<MdnsDaemon>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MeshHandle {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Snapshot of known controllers.
    pub fn hosts(&self, filter: HostFilter) -> HostList {
        lumen_registry::hosts(&self.registry, &self.liveness, filter)
    }

    pub fn groups(&self) -> Vec<GroupRecord> {
        self.registry.groups()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Where custom transports deliver inbound replies.
    pub fn message_sender(&self) -> mpsc::UnboundedSender<Message> {
        self.messages.clone()
    }

    /// Where custom probers deliver completions.
    pub fn probe_sender(&self) -> mpsc::UnboundedSender<ProbeResult> {
        self.probes.clone()
    }

    pub async fn status(&self) -> Result<MeshStatus> {
        self.request(|reply| MeshCommand::Status { reply }).await
    }

    pub async fn relinquish_leadership(&self) -> Result<bool> {
        self.request(|reply| MeshCommand::RelinquishLeadership { reply })
            .await
    }

    pub async fn check_group_leadership(&self) -> Result<()> {
        self.request(|reply| MeshCommand::CheckGroupLeadership { reply })
            .await
    }

    pub async fn forget_controllers(&self) -> Result<usize> {
        self.request(|reply| MeshCommand::ForgetControllers { reply })
            .await?
    }

    /// Create or replace a group through the running node, which checks
    /// group leadership immediately.
    pub async fn set_group(&self, group: GroupRecord) -> Result<()> {
        self.request(|reply| MeshCommand::SetGroup { group, reply })
            .await?
    }

    pub async fn remove_group(&self, group_id: GroupId) -> Result<()> {
        self.request(|reply| MeshCommand::RemoveGroup { group_id, reply })
            .await?
    }

    async fn request<T, F>(&self, make: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> MeshCommand,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Stop the loop, withdraw announcements and shut the daemon down.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(daemon) = &self.daemon {
            daemon.shutdown().await?;
        }
        Ok(())
    }
}
