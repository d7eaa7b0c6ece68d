//! Verification pinger.
//!
//! Confirms liveness of the controllers in each discovery batch with a
//! direct HTTP request. Success upgrades the liveness ttl to the verified
//! value; failure is not an eviction signal and the ttl keeps decaying.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use lumen_common::types::ControllerId;
use lumen_registry::{ControllerRecord, LivenessTable, Refresh, Registry};

use crate::error::{MeshError, Result};
use crate::events::{EventSink, MeshEvent};

/// Address used by controllers that have not obtained a lease yet.
const PLACEHOLDER_IP: &str = "0.0.0.0";

/// Completion of one probe, keyed by the probed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub ip: String,
    pub success: bool,
}

/// Fire-and-forget reachability probe. Results arrive later as
/// [`ProbeResult`]s on whatever channel the implementation was built with.
pub trait Prober: Send + Sync {
    fn probe(&self, ip: &str);
}

/// `GET http://<ip><path>`; any 2xx counts as reachable.
pub struct HttpProber {
    client: reqwest::Client,
    path: String,
    results: mpsc::UnboundedSender<ProbeResult>,
    runtime: Handle,
}

impl HttpProber {
    /// Must be called from inside a tokio runtime.
    pub fn new(
        path: &str,
        timeout: Duration,
        results: mpsc::UnboundedSender<ProbeResult>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| MeshError::Probe("no tokio runtime for probes".into()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MeshError::Probe(e.to_string()))?;
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Ok(Self {
            client,
            path,
            results,
            runtime,
        })
    }

    pub fn url_for(&self, ip: &str) -> String {
        if ip.contains(':') {
            format!("http://[{ip}]{}", self.path)
        } else {
            format!("http://{ip}{}", self.path)
        }
    }
}

impl Prober for HttpProber {
    fn probe(&self, ip: &str) {
        let client = self.client.clone();
        let url = self.url_for(ip);
        let ip = ip.to_string();
        let results = self.results.clone();
        self.runtime.spawn(async move {
            let success = match client.get(&url).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    tracing::trace!(url, error = %e, "Probe failed");
                    false
                }
            };
            let _ = results.send(ProbeResult { ip, success });
        });
    }
}

/// Tracks outstanding probes and applies their results.
pub struct VerificationPinger {
    prober: Arc<dyn Prober>,
    registry: Arc<Registry>,
    liveness: Arc<LivenessTable>,
    events: EventSink,
    verified_ttl: i64,
    in_flight: HashSet<String>,
}

impl VerificationPinger {
    pub fn new(
        prober: Arc<dyn Prober>,
        registry: Arc<Registry>,
        liveness: Arc<LivenessTable>,
        events: EventSink,
        verified_ttl: i64,
    ) -> Self {
        Self {
            prober,
            registry,
            liveness,
            events,
            verified_ttl,
            in_flight: HashSet::new(),
        }
    }

    /// Probe every batch member with a usable address and no probe
    /// already outstanding. Returns the number of probes issued.
    pub fn probe_batch(&mut self, batch: &[ControllerRecord]) -> usize {
        let mut issued = 0;
        for record in batch {
            let ip = record.ip_address.trim();
            if ip.is_empty() || ip == PLACEHOLDER_IP || self.in_flight.contains(ip) {
                continue;
            }
            self.in_flight.insert(ip.to_string());
            self.liveness.set_ping_pending(record.id, true);
            self.prober.probe(ip);
            issued += 1;
        }
        issued
    }

    /// Apply a completed probe. Returns the id it resolved to, if any.
    pub fn on_probe_result(&mut self, result: &ProbeResult) -> Option<ControllerId> {
        self.in_flight.remove(&result.ip);
        let Some(id) = self.registry.id_by_ip(&result.ip) else {
            tracing::debug!(ip = result.ip, "Probe result for unknown address");
            return None;
        };

        if !result.success {
            self.liveness.set_ping_pending(id, false);
            tracing::debug!(%id, ip = result.ip, "Probe failed, ttl left to decay");
            return Some(id);
        }

        if self.liveness.verify(id, self.verified_ttl) == Refresh::Inserted {
            let hostname = self
                .registry
                .controller(id)
                .map(|c| c.hostname)
                .unwrap_or_default();
            tracing::info!(%id, hostname, ip = result.ip, "Controller visible (verified)");
            self.events.emit(MeshEvent::HostVisible {
                id,
                hostname,
                ip: result.ip.clone(),
            });
        }
        Some(id)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProber(Mutex<Vec<String>>);

    impl Prober for RecordingProber {
        fn probe(&self, ip: &str) {
            self.0.lock().unwrap().push(ip.to_string());
        }
    }

    fn record(id: u32, ip: &str) -> ControllerRecord {
        ControllerRecord {
            id: ControllerId(id),
            hostname: format!("node-{id}"),
            ip_address: ip.to_string(),
        }
    }

    fn setup() -> (
        VerificationPinger,
        Arc<RecordingProber>,
        Arc<Registry>,
        Arc<LivenessTable>,
    ) {
        let prober = Arc::new(RecordingProber::default());
        let registry = Arc::new(Registry::in_memory());
        let liveness = Arc::new(LivenessTable::default());
        registry
            .update(|tx| {
                tx.upsert_controller(ControllerId(5), "node-5", "10.0.0.5");
                tx.upsert_controller(ControllerId(6), "node-6", "10.0.0.6");
            })
            .unwrap();
        let pinger = VerificationPinger::new(
            prober.clone(),
            registry.clone(),
            liveness.clone(),
            EventSink::new(),
            120,
        );
        (pinger, prober, registry, liveness)
    }

    #[test]
    fn skips_placeholder_and_duplicate_addresses() {
        let (mut pinger, prober, _, liveness) = setup();
        liveness.refresh(ControllerId(5), 60);
        let batch = [
            record(5, "10.0.0.5"),
            record(7, ""),
            record(8, "0.0.0.0"),
            record(5, "10.0.0.5"),
        ];
        assert_eq!(pinger.probe_batch(&batch), 1);
        assert_eq!(*prober.0.lock().unwrap(), vec!["10.0.0.5".to_string()]);
        assert!(liveness.entry(ControllerId(5)).unwrap().ping_pending);

        assert_eq!(pinger.probe_batch(&batch), 0, "probe still outstanding");
    }

    #[test]
    fn success_upgrades_ttl_and_clears_pending() {
        let (mut pinger, _, _, liveness) = setup();
        liveness.refresh(ControllerId(5), 60);
        pinger.probe_batch(&[record(5, "10.0.0.5")]);

        let id = pinger.on_probe_result(&ProbeResult {
            ip: "10.0.0.5".into(),
            success: true,
        });
        assert_eq!(id, Some(ControllerId(5)));
        let entry = liveness.entry(ControllerId(5)).unwrap();
        assert_eq!(entry.ttl, 120);
        assert!(!entry.ping_pending);
        assert_eq!(pinger.in_flight(), 0);
    }

    #[test]
    fn failure_leaves_ttl_alone() {
        let (mut pinger, _, _, liveness) = setup();
        liveness.refresh(ControllerId(6), 60);
        liveness.decay(50);
        pinger.probe_batch(&[record(6, "10.0.0.6")]);
        pinger.on_probe_result(&ProbeResult {
            ip: "10.0.0.6".into(),
            success: false,
        });
        let entry = liveness.entry(ControllerId(6)).unwrap();
        assert_eq!(entry.ttl, 10);
        assert!(!entry.ping_pending);
    }

    #[test]
    fn verified_unknown_entry_becomes_visible() {
        let (mut pinger, _, _, liveness) = setup();
        let mut rx = pinger.events.subscribe();
        pinger.on_probe_result(&ProbeResult {
            ip: "10.0.0.6".into(),
            success: true,
        });
        assert!(liveness.entry(ControllerId(6)).unwrap().is_online());
        assert!(matches!(
            rx.try_recv().unwrap(),
            MeshEvent::HostVisible { id: ControllerId(6), .. }
        ));
    }

    #[test]
    fn unknown_address_is_ignored() {
        let (mut pinger, _, _, liveness) = setup();
        assert_eq!(
            pinger.on_probe_result(&ProbeResult {
                ip: "10.9.9.9".into(),
                success: true,
            }),
            None
        );
        assert!(liveness.is_empty());
    }

    #[tokio::test]
    async fn http_prober_builds_urls() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let prober = HttpProber::new("ping", Duration::from_secs(1), tx).unwrap();
        assert_eq!(prober.url_for("10.0.0.5"), "http://10.0.0.5/ping");
        assert_eq!(prober.url_for("fe80::1"), "http://[fe80::1]/ping");
    }

    #[tokio::test]
    async fn http_prober_reports_bad_addresses_as_failures() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let prober = HttpProber::new("/ping", Duration::from_millis(200), tx).unwrap();
        prober.probe("256.0.0.1");
        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.ip, "256.0.0.1");
        assert!(!result.success);
    }
}
