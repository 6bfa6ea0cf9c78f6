//! VM registry: enumeration, stable ids and name/id lookup.
//!
//! The registry is rebuilt by scanning the VM directory. A short-lived
//! cache avoids rescanning within a single command; it is invalidated after
//! create/delete and bypassed for cross-VM checks.
//!
//! A directory whose record fails to load still occupies its name, and
//! whatever id and port rules can be read from the raw file stay reserved.

use crate::error::{Error, ErrorKind, Result};
use crate::ports::{self, OwnedForward};
use crate::record::{validate_name, PortForward, VmRecord};
use crate::store::Store;
use parking_lot::Mutex;
use std::fs;
use std::time::{Duration, Instant};

/// One registered VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Stable id.
    pub id: u32,
    /// VM name.
    pub name: String,
}

/// A VM directory whose record could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unreadable {
    /// Directory name.
    pub name: String,
    /// Id read from the raw `ID=` line, if any.
    pub id: Option<u32>,
    /// Rules read from raw `PORT_FORWARD_<n>=` lines.
    pub port_forwards: Vec<PortForward>,
    /// Why loading failed.
    pub reason: String,
}

impl Unreadable {
    fn salvage(name: &str, path: &std::path::Path, reason: String) -> Self {
        let text = fs::read(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        let mut id = None;
        let mut port_forwards = Vec::new();
        for line in text.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            if key == "ID" {
                id = value.parse::<u32>().ok();
            } else if key.starts_with("PORT_FORWARD_") {
                if let Ok(rule) = value.parse::<PortForward>() {
                    port_forwards.push(rule);
                }
            }
        }
        Self {
            name: name.to_string(),
            id,
            port_forwards,
            reason,
        }
    }
}

/// Result of one directory scan.
#[derive(Debug, Clone, Default)]
pub struct Scan {
    /// Valid records in id order, ids resolved.
    pub records: Vec<VmRecord>,
    /// Directories whose record failed to load, in name order.
    pub unreadable: Vec<Unreadable>,
    /// Names whose id was assigned by this scan rather than read from disk.
    pub unpersisted: Vec<String>,
}

impl Scan {
    /// Number of VMs, readable or not.
    pub fn len(&self) -> usize {
        self.records.len() + self.unreadable.len()
    }

    /// True if no VM exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest id in use, counting ids salvaged from unreadable records.
    pub fn max_id(&self) -> u32 {
        self.records
            .iter()
            .filter_map(|r| r.id)
            .chain(self.unreadable.iter().filter_map(|u| u.id))
            .max()
            .unwrap_or(0)
    }

    /// Every forwarding rule in use, including salvaged ones.
    pub fn forwards(&self) -> Vec<OwnedForward> {
        let mut all = ports::all_forwards(&self.records);
        for u in &self.unreadable {
            all.extend(u.port_forwards.iter().map(|rule| OwnedForward {
                vm: u.name.clone(),
                rule: *rule,
            }));
        }
        all
    }
}

#[derive(Debug)]
struct Snapshot {
    taken: Instant,
    scan: Scan,
}

/// Scans and caches the set of VMs.
#[derive(Debug)]
pub struct Registry {
    store: Store,
    ttl: Duration,
    cache: Mutex<Option<Snapshot>>,
}

impl Registry {
    /// Registry over `store` with cache lifetime `ttl`.
    pub fn new(store: Store, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Drop the cache so the next query rescans.
    pub fn invalidate(&self) {
        *self.cache.lock() = None;
    }

    /// Rescan now.
    pub fn rescan(&self) -> Result<Scan> {
        let scan = self.scan()?;
        *self.cache.lock() = Some(Snapshot {
            taken: Instant::now(),
            scan: scan.clone(),
        });
        Ok(scan)
    }

    /// Rescan now and return every valid record, ids resolved, in id order.
    pub fn refresh(&self) -> Result<Vec<VmRecord>> {
        Ok(self.rescan()?.records)
    }

    fn cached(&self) -> Result<Scan> {
        if let Some(snapshot) = self.cache.lock().as_ref() {
            if snapshot.taken.elapsed() < self.ttl {
                return Ok(snapshot.scan.clone());
            }
        }
        self.rescan()
    }

    /// Every valid record in id order, from cache when fresh.
    pub fn records(&self) -> Result<Vec<VmRecord>> {
        Ok(self.cached()?.records)
    }

    /// Directories whose record failed to load, from cache when fresh.
    pub fn unreadable(&self) -> Result<Vec<Unreadable>> {
        Ok(self.cached()?.unreadable)
    }

    /// Registered VMs in id order.
    pub fn list(&self) -> Result<Vec<Entry>> {
        Ok(self
            .records()?
            .into_iter()
            .map(|r| Entry {
                id: r.id.unwrap_or_default(),
                name: r.name,
            })
            .collect())
    }

    /// Id of `name`.
    pub fn id_of(&self, name: &str) -> Result<u32> {
        self.list()?
            .into_iter()
            .find(|e| e.name == name)
            .map(|e| e.id)
            .ok_or_else(|| Error::vm_not_found(name))
    }

    /// Name of the VM with `id`.
    pub fn name_of(&self, id: u32) -> Result<String> {
        self.list()?
            .into_iter()
            .find(|e| e.id == id)
            .map(|e| e.name)
            .ok_or_else(|| Error::vm_not_found(id.to_string()))
    }

    /// Resolve a command-line reference: a VM name, or failing that a numeric id.
    ///
    /// VMs with unreadable records resolve too, so they can be inspected
    /// and deleted.
    pub fn resolve(&self, reference: &str) -> Result<String> {
        let scan = self.cached()?;
        let by_name = scan
            .records
            .iter()
            .map(|r| &r.name)
            .chain(scan.unreadable.iter().map(|u| &u.name))
            .find(|name| name.as_str() == reference);
        if let Some(name) = by_name {
            return Ok(name.clone());
        }
        if let Ok(id) = reference.parse::<u32>() {
            let by_id = scan
                .records
                .iter()
                .map(|r| (r.id, &r.name))
                .chain(scan.unreadable.iter().map(|u| (u.id, &u.name)))
                .find(|(rid, _)| *rid == Some(id));
            if let Some((_, name)) = by_id {
                return Ok(name.clone());
            }
        }
        Err(Error::vm_not_found(reference))
    }

    /// Next id to assign: one past the highest id in use.
    pub fn next_id(&self) -> Result<u32> {
        self.rescan()?
            .max_id()
            .checked_add(1)
            .ok_or_else(|| Error::invalid("vm id", "id space exhausted"))
    }

    fn scan(&self) -> Result<Scan> {
        let root = self.store.root();
        let dir = match fs::read_dir(root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Scan::default()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut unreadable = Vec::new();
        for entry in dir {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            if validate_name(&name).is_err() {
                tracing::debug!(dir = %name, "skipping directory with invalid vm name");
                continue;
            }
            match self.store.load(&name) {
                Ok(record) => records.push(record),
                Err(Error::VmNotFound { .. }) => {
                    tracing::debug!(dir = %name, "skipping directory without vm record");
                }
                Err(e) if e.kind() == ErrorKind::Corruption => {
                    tracing::warn!(vm = %name, error = %e, "unreadable vm record");
                    let path = self.store.layout(&name).config();
                    unreadable.push(Unreadable::salvage(&name, &path, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }
        unreadable.sort_by(|a, b| a.name.cmp(&b.name));

        // Records without a persisted id get ids after the current maximum, in name order.
        records.sort_by(|a, b| a.name.cmp(&b.name));
        let mut next = records
            .iter()
            .filter_map(|r| r.id)
            .chain(unreadable.iter().filter_map(|u| u.id))
            .max()
            .unwrap_or(0);
        let mut unpersisted = Vec::new();
        for record in records.iter_mut().filter(|r| r.id.is_none()) {
            next += 1;
            tracing::warn!(vm = %record.name, id = next, "vm record has no ID, assigning one");
            record.id = Some(next);
            unpersisted.push(record.name.clone());
        }
        records.sort_by_key(|r| r.id);
        Ok(Scan {
            records,
            unreadable,
            unpersisted,
        })
    }
}
