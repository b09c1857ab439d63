//! NAT flow table
//!
//! Assigns each local flow a 16-bit NAT id and keeps the mapping in both
//! directions. Ids are handed out sequentially per (address family,
//! protocol) namespace, wrap around after `0xFFFF`, skip ids still in use
//! and never use 0.
//!
//! The forward map is the source of truth. An id is claimed in the reverse
//! map while the forward entry is locked, so two racing `get_or_add` calls
//! for the same flow observe the same id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::flow::{FlowKey, FlowProtocol, IpVersion, KeyingMode};

pub const MIN_NAT_ID: u16 = 1;
pub const MAX_NAT_ID: u16 = 0xFFFF;

/// A mapped flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatEntry {
    /// The flow as keyed by the table's mode
    pub flow: FlowKey,
    pub nat_id: u16,
    pub last_used: Instant,
}

/// Idle limits used by [`NatTable::remove_idle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatTimeouts {
    pub tcp: Duration,
    pub udp: Duration,
    pub icmp: Duration,
}

impl Default for NatTimeouts {
    fn default() -> Self {
        Self {
            tcp: Duration::from_secs(15 * 60),
            udp: Duration::from_secs(5 * 60),
            icmp: Duration::from_secs(30),
        }
    }
}

impl NatTimeouts {
    pub fn for_protocol(&self, protocol: FlowProtocol) -> Duration {
        match protocol {
            FlowProtocol::Tcp => self.tcp,
            FlowProtocol::Udp => self.udp,
            FlowProtocol::Icmp => self.icmp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Namespace {
    ip_version: IpVersion,
    protocol: FlowProtocol,
}

impl Namespace {
    fn of(flow: &FlowKey) -> Self {
        Self {
            ip_version: flow.ip_version(),
            protocol: flow.protocol,
        }
    }
}

/// Bidirectional flow <-> NAT id table
#[derive(Debug)]
pub struct NatTable {
    mode: KeyingMode,
    forward: DashMap<FlowKey, NatEntry>,
    reverse: DashMap<(Namespace, u16), FlowKey>,
    // last id handed out per namespace
    cursors: Mutex<HashMap<Namespace, u16>>,
}

impl NatTable {
    pub fn new(mode: KeyingMode) -> Self {
        Self {
            mode,
            forward: DashMap::new(),
            reverse: DashMap::new(),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> KeyingMode {
        self.mode
    }

    /// Map a new flow. Fails with [`Error::Duplicate`] if it is already mapped.
    pub fn add(&self, flow: &FlowKey) -> Result<NatEntry> {
        let key = self.mode.normalize(flow);
        match self.forward.entry(key) {
            Entry::Occupied(entry) => Err(Error::Duplicate(entry.key().to_string())),
            Entry::Vacant(slot) => {
                let entry = self.allocate(slot.key())?;
                slot.insert(entry.clone());
                log::debug!("NAT {} -> id {}", entry.flow, entry.nat_id);
                Ok(entry)
            }
        }
    }

    /// Return the flow's entry, mapping it first if needed.
    ///
    /// Refreshes `last_used` on existing entries.
    pub fn get_or_add(&self, flow: &FlowKey) -> Result<NatEntry> {
        let key = self.mode.normalize(flow);
        match self.forward.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().last_used = Instant::now();
                Ok(entry.get().clone())
            }
            Entry::Vacant(slot) => {
                let entry = self.allocate(slot.key())?;
                slot.insert(entry.clone());
                log::debug!("NAT {} -> id {}", entry.flow, entry.nat_id);
                Ok(entry)
            }
        }
    }

    /// Look up a flow without mapping it
    pub fn get(&self, flow: &FlowKey) -> Option<NatEntry> {
        let key = self.mode.normalize(flow);
        self.forward.get(&key).map(|entry| entry.value().clone())
    }

    /// Reverse lookup of a NAT id
    ///
    /// A reply counts as traffic on the flow, so this refreshes `last_used`
    /// like [`NatTable::get_or_add`] does.
    pub fn resolve(&self, ip_version: IpVersion, protocol: FlowProtocol, nat_id: u16) -> Option<NatEntry> {
        let namespace = Namespace {
            ip_version,
            protocol,
        };
        // release the reverse shard before touching the forward map
        let flow = self.reverse.get(&(namespace, nat_id))?.value().clone();
        let mut entry = self.forward.get_mut(&flow)?;
        if entry.nat_id != nat_id {
            return None;
        }
        entry.last_used = Instant::now();
        Some(entry.value().clone())
    }

    /// Unmap a flow and free its id
    pub fn remove(&self, flow: &FlowKey) -> Option<NatEntry> {
        let key = self.mode.normalize(flow);
        let (_, entry) = self.forward.remove(&key)?;
        self.release(&entry);
        Some(entry)
    }

    /// Drop entries idle for longer than their protocol's timeout
    pub fn remove_idle(&self, timeouts: &NatTimeouts) -> usize {
        let now = Instant::now();
        let is_idle =
            |entry: &NatEntry| now.duration_since(entry.last_used) > timeouts.for_protocol(entry.flow.protocol);

        let candidates: Vec<FlowKey> = self
            .forward
            .iter()
            .filter(|entry| is_idle(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            // re-check: the flow may have been used since the snapshot
            if let Some((_, entry)) = self.forward.remove_if(&key, |_, entry| is_idle(entry)) {
                self.release(&entry);
                removed += 1;
            }
        }

        if removed > 0 {
            log::debug!("NAT table expired {} idle flows", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    fn allocate(&self, flow: &FlowKey) -> Result<NatEntry> {
        let namespace = Namespace::of(flow);
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let cursor = cursors.entry(namespace).or_insert(MAX_NAT_ID);

        for _ in MIN_NAT_ID..=MAX_NAT_ID {
            let candidate = if *cursor >= MAX_NAT_ID {
                MIN_NAT_ID
            } else {
                *cursor + 1
            };
            *cursor = candidate;

            if let Entry::Vacant(slot) = self.reverse.entry((namespace, candidate)) {
                slot.insert(flow.clone());
                return Ok(NatEntry {
                    flow: flow.clone(),
                    nat_id: candidate,
                    last_used: Instant::now(),
                });
            }
        }

        log::warn!(
            "NAT id space exhausted for {}/{}",
            namespace.protocol,
            namespace.ip_version
        );
        Err(Error::Overflow {
            ip_version: namespace.ip_version,
            protocol: namespace.protocol,
        })
    }

    fn release(&self, entry: &NatEntry) {
        let namespace = Namespace::of(&entry.flow);
        self.reverse
            .remove_if(&(namespace, entry.nat_id), |_, flow| flow == &entry.flow);
    }
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new(KeyingMode::default())
    }
}
