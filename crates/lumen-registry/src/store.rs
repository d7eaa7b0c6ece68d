use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use lumen_common::types::{ControllerId, GroupId};

use crate::error::{RegistryError, Result};

// ── Records ───────────────────────────────────────────────────────────

/// A controller that has been seen at least once.
///
/// `id` never changes after creation; `hostname` and `ip_address` track
/// the most recent discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRecord {
    pub id: ControllerId,
    pub hostname: String,
    pub ip_address: String,
}

/// An administratively configured group of controllers.
///
/// Members may reference ids the registry has never seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub controller_ids: BTreeSet<ControllerId>,
}

impl GroupRecord {
    pub fn has_member(&self, id: ControllerId) -> bool {
        self.controller_ids.contains(&id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RegistryData {
    #[serde(default)]
    controllers: Vec<ControllerRecord>,
    #[serde(default)]
    groups: Vec<GroupRecord>,
}

/// Outcome of [`Transaction::upsert_controller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
    Unchanged,
}

// ── Transaction ───────────────────────────────────────────────────────

/// Mutable view handed to [`Registry::update`].
///
/// Every setter reports whether it changed anything; the registry only
/// writes to disk when at least one did.
pub struct Transaction<'a> {
    data: &'a mut RegistryData,
    dirty: bool,
}

impl Transaction<'_> {
    pub fn controller(&self, id: ControllerId) -> Option<&ControllerRecord> {
        self.data.controllers.iter().find(|c| c.id == id)
    }

    pub fn add_controller(&mut self, record: ControllerRecord) {
        self.data.controllers.push(record);
        self.dirty = true;
    }

    pub fn set_hostname(&mut self, id: ControllerId, hostname: &str) -> bool {
        self.set_field(id, hostname, |c| &mut c.hostname)
    }

    pub fn set_ip_address(&mut self, id: ControllerId, ip: &str) -> bool {
        self.set_field(id, ip, |c| &mut c.ip_address)
    }

    /// Create the record, or update hostname/ip in place when they differ.
    /// Empty values never overwrite known ones.
    pub fn upsert_controller(&mut self, id: ControllerId, hostname: &str, ip: &str) -> Upsert {
        if self.controller(id).is_none() {
            self.add_controller(ControllerRecord {
                id,
                hostname: hostname.to_string(),
                ip_address: ip.to_string(),
            });
            return Upsert::Created;
        }

        let mut changed = false;
        if !ip.is_empty() {
            changed |= self.set_ip_address(id, ip);
        }
        if !hostname.is_empty() {
            changed |= self.set_hostname(id, hostname);
        }
        if changed {
            Upsert::Updated
        } else {
            Upsert::Unchanged
        }
    }

    pub fn remove_controller(&mut self, id: ControllerId) -> bool {
        let before = self.data.controllers.len();
        self.data.controllers.retain(|c| c.id != id);
        let removed = self.data.controllers.len() != before;
        self.dirty |= removed;
        removed
    }

    pub fn clear_controllers(&mut self) -> usize {
        let count = self.data.controllers.len();
        self.data.controllers.clear();
        self.dirty |= count > 0;
        count
    }

    /// Insert or replace a group by id.
    pub fn put_group(&mut self, group: GroupRecord) {
        match self.data.groups.iter().position(|g| g.id == group.id) {
            Some(i) if self.data.groups[i] == group => return,
            Some(i) => self.data.groups[i] = group,
            None => self.data.groups.push(group),
        }
        self.dirty = true;
    }

    pub fn remove_group(&mut self, id: GroupId) -> bool {
        let before = self.data.groups.len();
        self.data.groups.retain(|g| g.id != id);
        let removed = self.data.groups.len() != before;
        self.dirty |= removed;
        removed
    }

    fn set_field<F>(&mut self, id: ControllerId, value: &str, field: F) -> bool
    where
        F: FnOnce(&mut ControllerRecord) -> &mut String,
    {
        let Some(record) = self.data.controllers.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        let slot = field(record);
        if slot == value {
            return false;
        }
        *slot = value.to_string();
        self.dirty = true;
        true
    }
}

// ── Registry ──────────────────────────────────────────────────────────

/// Size and modification time of the backing file as last read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

struct Inner {
    data: RegistryData,
    stamp: Option<FileStamp>,
}

/// Persistent controller/group table.
///
/// Backed by a JSON file written atomically (tmp + rename). The file may
/// also be edited by another process (the CLI while a node runs), so reads
/// and transactions first reload it whenever its size or mtime moved. An
/// in-memory registry has no backing file and is used by tests and
/// embedders that bring their own persistence.
pub struct Registry {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
    writes: AtomicU64,
}

impl Registry {
    /// Open (or lazily create) the registry file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let stamp = FileStamp::of(&path);
        let data = if stamp.is_some() {
            read_file(&path)?
        } else {
            RegistryData::default()
        };
        tracing::debug!(
            path = %path.display(),
            controllers = data.controllers.len(),
            groups = data.groups.len(),
            "Registry opened"
        );
        Ok(Self {
            inner: Mutex::new(Inner { data, stamp }),
            path: Some(path),
            writes: AtomicU64::new(0),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: RegistryData::default(),
                stamp: None,
            }),
            path: None,
            writes: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside a transaction.
    ///
    /// Changes are applied to a copy of the current file contents and
    /// committed only if persisting that copy succeeds, so a failed write
    /// leaves the registry untouched.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> T,
    {
        let mut guard = self.current();
        let mut working = guard.data.clone();
        let mut tx = Transaction {
            data: &mut working,
            dirty: false,
        };
        let out = f(&mut tx);
        if tx.dirty {
            guard.stamp = self.persist(&working)?;
            guard.data = working;
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(out)
    }

    /// Number of committed writes since this registry was opened.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    // ── Snapshots ─────────────────────────────────────────────────────

    pub fn controllers(&self) -> Vec<ControllerRecord> {
        self.current().data.controllers.clone()
    }

    pub fn controller(&self, id: ControllerId) -> Option<ControllerRecord> {
        let inner = self.current();
        inner.data.controllers.iter().find(|c| c.id == id).cloned()
    }

    /// mDNS names are case-insensitive, so is this lookup.
    pub fn id_by_hostname(&self, hostname: &str) -> Option<ControllerId> {
        let inner = self.current();
        inner
            .data
            .controllers
            .iter()
            .find(|c| !c.hostname.is_empty() && c.hostname.eq_ignore_ascii_case(hostname))
            .map(|c| c.id)
    }

    pub fn id_by_ip(&self, ip: &str) -> Option<ControllerId> {
        let inner = self.current();
        inner
            .data
            .controllers
            .iter()
            .find(|c| !c.ip_address.is_empty() && c.ip_address == ip)
            .map(|c| c.id)
    }

    pub fn highest_id(&self) -> Option<ControllerId> {
        let inner = self.current();
        inner.data.controllers.iter().map(|c| c.id).max()
    }

    pub fn len(&self) -> usize {
        self.current().data.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn groups(&self) -> Vec<GroupRecord> {
        self.current().data.groups.clone()
    }

    pub fn group(&self, id: GroupId) -> Option<GroupRecord> {
        let inner = self.current();
        inner.data.groups.iter().find(|g| g.id == id).cloned()
    }

    // ── Administrative operations ─────────────────────────────────────

    pub fn set_group(&self, group: GroupRecord) -> Result<()> {
        self.update(|tx| tx.put_group(group))
    }

    pub fn remove_group(&self, id: GroupId) -> Result<()> {
        if self.update(|tx| tx.remove_group(id))? {
            Ok(())
        } else {
            Err(RegistryError::GroupNotFound(id))
        }
    }

    pub fn remove_controller(&self, id: ControllerId) -> Result<()> {
        if self.update(|tx| tx.remove_controller(id))? {
            Ok(())
        } else {
            Err(RegistryError::ControllerNotFound(id))
        }
    }

    /// Drop every controller record. Groups are kept.
    pub fn forget_controllers(&self) -> Result<usize> {
        self.update(|tx| tx.clear_controllers())
    }

    // ── File sync ─────────────────────────────────────────────────────

    /// Lock the table, first reloading the file if someone else wrote it.
    /// An unreadable file keeps the last good copy.
    fn current(&self) -> MutexGuard<'_, Inner> {
        let mut guard = self.inner.lock().unwrap();
        let Some(path) = &self.path else {
            return guard;
        };
        let stamp = FileStamp::of(path);
        if stamp == guard.stamp {
            return guard;
        }
        let reloaded = match stamp {
            Some(_) => read_file(path),
            None => Ok(RegistryData::default()),
        };
        match reloaded {
            Ok(data) => {
                tracing::debug!(
                    path = %path.display(),
                    controllers = data.controllers.len(),
                    groups = data.groups.len(),
                    "Registry reloaded after external change"
                );
                guard.data = data;
                guard.stamp = stamp;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Registry reload failed");
            }
        }
        guard
    }

    fn persist(&self, data: &RegistryData) -> Result<Option<FileStamp>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(data)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(FileStamp::of(path))
    }
}

fn read_file(path: &Path) -> Result<RegistryData> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| RegistryError::Corrupt(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────
