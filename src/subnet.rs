//! Per-subnet lease state: the dynamic pool, the lease and binding tables,
//! and reply-option composition.
//!
//! A subnet owns everything needed to answer a client inside one network:
//!
//! - the occupancy bitmap over `[active_start, active_end]`
//! - dynamic leases keyed by canonical MAC
//! - static MAC-to-IP bindings, which never consume a pool slot
//! - the subnet-level option set, stored as validated raw bytes
//! - a decline cool-down table for addresses clients reported in conflict
//!
//! All methods assume the caller holds the subnet's lock (see
//! [`crate::tracker::DataTracker`]). Mutating methods report through their
//! return value whether the change must be persisted; the tracker owns the
//! snapshot write so no save ever happens under a subnet lock.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{is_valid_mac, normalize_mac};
use crate::error::{Error, Result};
use crate::options::{self, OPT_REBINDING_TIME, OPT_RENEWAL_TIME};
use crate::pool::PoolBitmap;

/// How long a declined IP stays out of allocation (1 hour).
pub const DECLINE_COOLDOWN_SECONDS: i64 = 3600;

/// A dynamic MAC-to-IP allocation. `expire_time` is unset between the OFFER
/// and the first acknowledged REQUEST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time.is_some_and(|expiry| expiry < now)
    }
}

/// One administered option: RFC 2132 code plus its human string value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionEntry {
    pub id: u8,
    pub value: String,
}

/// A static MAC-to-IP reservation with optional per-client overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub ip: Ipv4Addr,
    pub mac: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_server: Option<Ipv4Addr>,
}

/// Wire/storage shape of a subnet: management API bodies and the persisted
/// snapshot both use this. The pool bitmap is never serialized; it is
/// rebuilt from the lease list on admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetDto {
    pub name: String,
    pub subnet: Ipv4Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_server: Option<Ipv4Addr>,
    pub active_start: Ipv4Addr,
    pub active_end: Ipv4Addr,
    pub active_lease_time: u32,
    pub reserved_lease_time: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leases: Vec<Lease>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionEntry>,
    #[serde(default)]
    pub ipxe: String,
    #[serde(default)]
    pub bootstrap: String,
}

#[derive(Debug, Clone)]
pub struct Subnet {
    pub name: String,
    pub cidr: Ipv4Net,
    pub next_server: Option<Ipv4Addr>,
    pub active_start: Ipv4Addr,
    pub active_end: Ipv4Addr,
    /// Lease durations in seconds for dynamic and bound clients.
    pub active_lease_time: u32,
    pub reserved_lease_time: u32,
    pub leases: HashMap<String, Lease>,
    pub bindings: HashMap<String, Binding>,
    /// Subnet-level options, validated and encoded at admission.
    pub options: BTreeMap<u8, Vec<u8>>,
    pub ipxe: String,
    pub bootstrap: String,
    pool: PoolBitmap,
    /// Declined IPs and when the decline arrived. In-memory only.
    declined: HashMap<Ipv4Addr, DateTime<Utc>>,
}

impl Subnet {
    /// Number of addresses in the active range.
    fn range_len(&self) -> usize {
        (u32::from(self.active_end) as u64 - u32::from(self.active_start) as u64 + 1) as usize
    }

    pub fn in_active_range(&self, ip: Ipv4Addr) -> bool {
        self.slot(ip).is_some()
    }

    /// Pool index for `ip`, or `None` when it lies outside the active range.
    fn slot(&self, ip: Ipv4Addr) -> Option<usize> {
        let ip = u32::from(ip);
        let start = u32::from(self.active_start);
        let end = u32::from(self.active_end);
        (ip >= start && ip <= end).then(|| (ip - start) as usize)
    }

    fn ip_at(&self, slot: usize) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.active_start) + slot as u32)
    }

    pub fn pool_bit(&self, ip: Ipv4Addr) -> bool {
        self.slot(ip).is_some_and(|slot| self.pool.get(slot))
    }

    pub fn free_slots(&self) -> usize {
        self.pool.len() - self.pool.count_set()
    }

    fn binding_claims(&self, ip: Ipv4Addr) -> bool {
        self.bindings.values().any(|binding| binding.ip == ip)
    }

    /// Rebuilds the occupancy bitmap from the lease table. Leases backed by
    /// a binding at the same address do not consume a slot.
    fn rebuild_pool(&mut self) {
        let slots: Vec<usize> = self
            .leases
            .iter()
            .filter_map(|(mac, lease)| {
                let slot = self.slot(lease.ip)?;
                let bound = self
                    .bindings
                    .get(mac)
                    .is_some_and(|binding| binding.ip == lease.ip);
                (!bound).then_some(slot)
            })
            .collect();

        self.pool = PoolBitmap::new(self.range_len());
        for slot in slots {
            self.pool.set(slot);
        }
    }

    /// Drops the lease for `mac`, releasing its pool slot when it held one.
    /// Returns whether anything changed (and therefore must be persisted).
    pub fn free_lease(&mut self, mac: &str) -> bool {
        match self.leases.remove(mac) {
            Some(lease) => {
                if let Some(slot) = self.slot(lease.ip) {
                    self.pool.clear(slot);
                }
                true
            }
            None => false,
        }
    }

    /// Pure lookup of whatever the tables hold for `mac`.
    pub fn find(&self, mac: &str) -> (Option<&Lease>, Option<&Binding>) {
        (self.leases.get(mac), self.bindings.get(mac))
    }

    /// Resolves `mac` to an address, allocating when needed.
    ///
    /// A binding is authoritative: its IP is returned and a matching lease
    /// is materialized without touching the pool. Otherwise an existing
    /// valid lease wins, then the advisory `suggest` address, then the
    /// lowest free pool slot (reaping expired leases when the scan comes up
    /// empty). The third return value is the persist flag.
    pub fn find_or_get(
        &mut self,
        mac: &str,
        suggest: Option<Ipv4Addr>,
    ) -> (Option<Lease>, Option<Binding>, bool) {
        if let Some(binding) = self.bindings.get(mac).cloned() {
            if let Some(lease) = self.leases.get(mac)
                && lease.ip == binding.ip
            {
                return (Some(lease.clone()), Some(binding), false);
            }
            // Stale lease at a different address: the binding wins.
            if let Some(old) = self.leases.remove(mac)
                && let Some(slot) = self.slot(old.ip)
            {
                self.pool.clear(slot);
            }
            let lease = Lease {
                ip: binding.ip,
                mac: mac.to_string(),
                valid: true,
                expire_time: None,
            };
            self.leases.insert(mac.to_string(), lease.clone());
            return (Some(lease), Some(binding), true);
        }

        if let Some(lease) = self.leases.get(mac)
            && lease.valid
        {
            return (Some(lease.clone()), None, false);
        }

        // An invalidated lease is released before allocating fresh.
        let mut persist = self.free_lease(mac);

        if let Some(ip) = suggest
            && let Some(slot) = self.slot(ip)
            && !self.pool.get(slot)
            && !self.declined.contains_key(&ip)
            && !self.binding_claims(ip)
        {
            self.pool.set(slot);
            let lease = Lease {
                ip,
                mac: mac.to_string(),
                valid: true,
                expire_time: None,
            };
            self.leases.insert(mac.to_string(), lease.clone());
            return (Some(lease), None, true);
        }

        let (ip, reaped) = self.get_free_ip();
        persist = persist || reaped;
        match ip {
            Some(ip) => {
                let lease = Lease {
                    ip,
                    mac: mac.to_string(),
                    valid: true,
                    expire_time: None,
                };
                self.leases.insert(mac.to_string(), lease.clone());
                (Some(lease), None, true)
            }
            None => (None, None, persist),
        }
    }

    /// Claims the lowest free slot. When the pool is saturated, runs one
    /// reaping pass over expired leases and retries. The second return value
    /// reports whether the reaping pass removed anything, so callers persist
    /// even when allocation still fails.
    pub fn get_free_ip(&mut self) -> (Option<Ipv4Addr>, bool) {
        let now = Utc::now();
        self.declined.retain(|_, declined_at| {
            now.signed_duration_since(*declined_at).num_seconds() < DECLINE_COOLDOWN_SECONDS
        });

        if let Some(ip) = self.scan_free() {
            return (Some(ip), false);
        }

        let expired: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.is_expired(now))
            .map(|(mac, _)| mac.clone())
            .collect();
        let reaped = !expired.is_empty();
        for mac in expired {
            if let Some(lease) = self.leases.remove(&mac)
                && let Some(slot) = self.slot(lease.ip)
            {
                self.pool.clear(slot);
            }
        }

        (self.scan_free(), reaped)
    }

    fn scan_free(&mut self) -> Option<Ipv4Addr> {
        let mut from = 0;
        while let Some(slot) = self.pool.first_clear_from(from) {
            let ip = self.ip_at(slot);
            // Bound addresses never carry a pool bit, so the scan has to
            // step over them explicitly, like cooling-down declines.
            if !self.declined.contains_key(&ip) && !self.binding_claims(ip) {
                self.pool.set(slot);
                return Some(ip);
            }
            from = slot + 1;
        }
        None
    }

    /// Advances the lease expiry to `now + seconds`. Returns the updated
    /// lease; the caller persists.
    pub fn update_lease_time(&mut self, mac: &str, seconds: u32) -> Option<Lease> {
        let lease = self.leases.get_mut(mac)?;
        lease.expire_time = Some(Utc::now() + TimeDelta::seconds(seconds as i64));
        Some(lease.clone())
    }

    /// Handles a client-reported address conflict: frees the matching lease
    /// and blocks the address from allocation for the cool-down window.
    /// Returns whether state changed.
    pub fn decline(&mut self, mac: &str, ip: Ipv4Addr) -> bool {
        if !self.leases.get(mac).is_some_and(|lease| lease.ip == ip) {
            return false;
        }
        self.free_lease(mac);
        self.declined.insert(ip, Utc::now());
        true
    }

    /// Installs a binding, evicting any dynamic lease squatting on its
    /// address. Re-binding an already-bound MAC replaces the old entry.
    pub fn add_binding(&mut self, binding: Binding) {
        if let Some(slot) = self.slot(binding.ip)
            && self.pool.get(slot)
        {
            self.pool.clear(slot);
            self.leases.retain(|_, lease| lease.ip != binding.ip);
        }
        self.bindings.insert(binding.mac.clone(), binding);
    }

    pub fn delete_binding(&mut self, mac: &str) -> bool {
        match self.bindings.remove(mac) {
            Some(binding) => {
                // A lease materialized for the binding survives unbinding,
                // and from here on it occupies its slot like any other.
                if let Some(lease) = self.leases.get(mac)
                    && lease.ip == binding.ip
                    && let Some(slot) = self.slot(lease.ip)
                {
                    self.pool.set(slot);
                }
                true
            }
            None => false,
        }
    }

    /// Routes a next-server assignment: a binding whose IP matches takes it;
    /// otherwise an in-subnet IP sets the subnet-level default.
    pub fn set_next_server(&mut self, ip: Ipv4Addr, next_server: Ipv4Addr) -> Result<()> {
        if let Some(binding) = self.bindings.values_mut().find(|binding| binding.ip == ip) {
            binding.next_server = Some(next_server);
            return Ok(());
        }
        if self.cidr.contains(&ip) {
            self.next_server = Some(next_server);
            return Ok(());
        }
        Err(Error::Validation(format!(
            "{} matches neither a binding nor the subnet {}",
            ip, self.cidr
        )))
    }

    /// Composes the option map for a reply and picks the lease duration.
    /// Merge order: T1/T2 defaults, then subnet options, then binding
    /// options; later writers win. A binding option that fails to encode is
    /// logged and skipped, never fatal to the reply.
    pub fn build_options(&self, binding: Option<&Binding>) -> (BTreeMap<u8, Vec<u8>>, u32) {
        let lease_time = if binding.is_none() {
            self.active_lease_time
        } else {
            self.reserved_lease_time
        };

        let mut merged = BTreeMap::new();
        merged.insert(OPT_RENEWAL_TIME, (lease_time / 2).to_be_bytes().to_vec());
        let rebinding = ((lease_time as u64 * 3) / 4) as u32;
        merged.insert(OPT_REBINDING_TIME, rebinding.to_be_bytes().to_vec());

        for (&code, data) in &self.options {
            merged.insert(code, data.clone());
        }

        if let Some(binding) = binding {
            for entry in &binding.options {
                match options::encode_value(entry.id, &entry.value) {
                    Ok(bytes) => {
                        merged.insert(entry.id, bytes);
                    }
                    Err(error) => {
                        warn!("Skipping option {} for {}: {}", entry.id, binding.mac, error);
                    }
                }
            }
        }

        (merged, lease_time)
    }

    /// Carries runtime state over from the subnet being replaced. Leases,
    /// bindings, and pool bits survive verbatim when the active range is
    /// unchanged; otherwise out-of-range leases are dropped and the pool is
    /// rebuilt from the survivors.
    pub fn adopt_runtime_state(&mut self, old: &Subnet) {
        self.bindings = old.bindings.clone();
        self.declined = old.declined.clone();

        if self.active_start == old.active_start && self.active_end == old.active_end {
            self.leases = old.leases.clone();
            self.pool = old.pool.clone();
        } else {
            self.leases = old
                .leases
                .iter()
                .filter(|(_, lease)| self.in_active_range(lease.ip))
                .map(|(mac, lease)| (mac.clone(), lease.clone()))
                .collect();
            self.rebuild_pool();
        }
    }

    pub fn to_dto(&self) -> SubnetDto {
        let mut leases: Vec<Lease> = self.leases.values().cloned().collect();
        leases.sort_by_key(|lease| u32::from(lease.ip));

        let mut bindings: Vec<Binding> = self.bindings.values().cloned().collect();
        bindings.sort_by(|a, b| a.mac.cmp(&b.mac));

        let options = self
            .options
            .iter()
            .map(|(&id, data)| OptionEntry {
                id,
                value: options::decode_value(id, data),
            })
            .collect();

        SubnetDto {
            name: self.name.clone(),
            subnet: self.cidr,
            next_server: self.next_server,
            active_start: self.active_start,
            active_end: self.active_end,
            active_lease_time: self.active_lease_time,
            reserved_lease_time: self.reserved_lease_time,
            leases,
            bindings,
            options,
            ipxe: self.ipxe.clone(),
            bootstrap: self.bootstrap.clone(),
        }
    }
}

impl TryFrom<SubnetDto> for Subnet {
    type Error = Error;

    /// Validates the wire shape and builds the runtime subnet, including the
    /// pool bitmap. All admission rules live here: range ordering and
    /// containment, positive lease durations, MAC syntax, option typing.
    fn try_from(dto: SubnetDto) -> Result<Self> {
        if dto.name.is_empty() {
            return Err(Error::Validation("subnet name must be non-empty".to_string()));
        }
        if u32::from(dto.active_start) > u32::from(dto.active_end) {
            return Err(Error::Validation(format!(
                "active range inverted: {} > {}",
                dto.active_start, dto.active_end
            )));
        }
        if !dto.subnet.contains(&dto.active_start) || !dto.subnet.contains(&dto.active_end) {
            return Err(Error::Validation(format!(
                "active range {}-{} not contained in {}",
                dto.active_start, dto.active_end, dto.subnet
            )));
        }
        if dto.active_lease_time == 0 || dto.reserved_lease_time == 0 {
            return Err(Error::Validation("lease times must be positive".to_string()));
        }

        let mut option_bytes = BTreeMap::new();
        for entry in &dto.options {
            option_bytes.insert(entry.id, options::encode_value(entry.id, &entry.value)?);
        }

        let mut bindings = HashMap::new();
        for binding in dto.bindings {
            if !is_valid_mac(&binding.mac) {
                return Err(Error::Validation(format!(
                    "invalid binding MAC: {:?}",
                    binding.mac
                )));
            }
            if !dto.subnet.contains(&binding.ip) {
                return Err(Error::Validation(format!(
                    "binding {} lies outside {}",
                    binding.ip, dto.subnet
                )));
            }
            for entry in &binding.options {
                options::encode_value(entry.id, &entry.value)?;
            }
            let mac = normalize_mac(&binding.mac);
            if bindings.contains_key(&mac) {
                return Err(Error::Validation(format!("duplicate binding for {}", mac)));
            }
            bindings.insert(mac.clone(), Binding { mac, ..binding });
        }

        let mut leases = HashMap::new();
        for lease in dto.leases {
            if !is_valid_mac(&lease.mac) {
                return Err(Error::Validation(format!("invalid lease MAC: {:?}", lease.mac)));
            }
            let mac = normalize_mac(&lease.mac);
            if leases.contains_key(&mac) {
                return Err(Error::Validation(format!("duplicate lease for {}", mac)));
            }
            leases.insert(mac.clone(), Lease { mac, ..lease });
        }

        let mut subnet = Subnet {
            name: dto.name,
            cidr: dto.subnet,
            next_server: dto.next_server,
            active_start: dto.active_start,
            active_end: dto.active_end,
            active_lease_time: dto.active_lease_time,
            reserved_lease_time: dto.reserved_lease_time,
            leases,
            bindings,
            options: option_bytes,
            ipxe: dto.ipxe,
            bootstrap: dto.bootstrap,
            pool: PoolBitmap::default(),
            declined: HashMap::new(),
        };
        subnet.rebuild_pool();
        Ok(subnet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_subnet() -> Subnet {
        let dto = SubnetDto {
            name: "lab".to_string(),
            subnet: "10.0.0.0/24".parse().unwrap(),
            next_server: None,
            active_start: Ipv4Addr::new(10, 0, 0, 10),
            active_end: Ipv4Addr::new(10, 0, 0, 12),
            active_lease_time: 3600,
            reserved_lease_time: 7200,
            leases: vec![],
            bindings: vec![],
            options: vec![],
            ipxe: "undionly.kpxe".to_string(),
            bootstrap: "bootstrap.ipxe".to_string(),
        };
        Subnet::try_from(dto).unwrap()
    }

    fn expire(subnet: &mut Subnet, mac: &str) {
        subnet.leases.get_mut(mac).unwrap().expire_time =
            Some(Utc::now() - TimeDelta::seconds(1));
    }

    #[test]
    fn test_allocation_order() {
        let mut subnet = test_subnet();

        let (lease, binding, persist) = subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 10));
        assert!(binding.is_none());
        assert!(persist);

        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:02", None);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 11));

        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:03", None);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 12));

        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:04", None);
        assert!(lease.is_none());
    }

    #[test]
    fn test_find_or_get_is_idempotent() {
        let mut subnet = test_subnet();

        let (first, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
        let first_ip = first.unwrap().ip;
        for _ in 0..3 {
            let (again, _, persist) = subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
            assert_eq!(again.unwrap().ip, first_ip);
            assert!(!persist);
        }
    }

    #[test]
    fn test_suggestion_honored_when_free() {
        let mut subnet = test_subnet();

        let suggest = Some(Ipv4Addr::new(10, 0, 0, 12));
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:01", suggest);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 12));
        assert!(subnet.pool_bit(Ipv4Addr::new(10, 0, 0, 12)));
    }

    #[test]
    fn test_suggestion_ignored_when_taken_or_outside() {
        let mut subnet = test_subnet();
        subnet.find_or_get("aa:bb:cc:dd:ee:01", None);

        // taken
        let suggest = Some(Ipv4Addr::new(10, 0, 0, 10));
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:02", suggest);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 11));

        // outside active range
        let suggest = Some(Ipv4Addr::new(10, 0, 0, 200));
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:03", suggest);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 12));
    }

    #[test]
    fn test_exhaustion_reaps_expired_leases() {
        let mut subnet = test_subnet();
        subnet.active_end = Ipv4Addr::new(10, 0, 0, 10);
        subnet.rebuild_pool();

        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
        let ip = lease.unwrap().ip;
        subnet.update_lease_time("aa:bb:cc:dd:ee:01", 1);
        expire(&mut subnet, "aa:bb:cc:dd:ee:01");

        let (lease, _, persist) = subnet.find_or_get("aa:bb:cc:dd:ee:02", None);
        assert_eq!(lease.unwrap().ip, ip);
        assert!(persist);
        assert!(!subnet.leases.contains_key("aa:bb:cc:dd:ee:01"));
    }

    #[test]
    fn test_exhaustion_without_reclaimable_leases_persists_reap_only() {
        let mut subnet = test_subnet();
        subnet.active_end = Ipv4Addr::new(10, 0, 0, 10);
        subnet.rebuild_pool();

        subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
        let (lease, _, persist) = subnet.find_or_get("aa:bb:cc:dd:ee:02", None);
        assert!(lease.is_none());
        assert!(!persist);
    }

    #[test]
    fn test_binding_is_authoritative_and_skips_pool() {
        let mut subnet = test_subnet();
        subnet.add_binding(Binding {
            ip: Ipv4Addr::new(10, 0, 0, 50),
            mac: "aa:bb:cc:dd:ee:05".to_string(),
            options: vec![],
            next_server: None,
        });

        let (lease, binding, persist) = subnet.find_or_get("aa:bb:cc:dd:ee:05", None);
        assert_eq!(lease.as_ref().unwrap().ip, Ipv4Addr::new(10, 0, 0, 50));
        assert!(binding.is_some());
        assert!(persist);
        assert_eq!(subnet.free_slots(), 3);

        // repeated resolution reuses the materialized lease
        let (_, _, persist) = subnet.find_or_get("aa:bb:cc:dd:ee:05", None);
        assert!(!persist);
    }

    #[test]
    fn test_binding_overrides_stale_dynamic_lease() {
        let mut subnet = test_subnet();
        subnet.find_or_get("aa:bb:cc:dd:ee:05", None);
        assert!(subnet.pool_bit(Ipv4Addr::new(10, 0, 0, 10)));

        subnet.add_binding(Binding {
            ip: Ipv4Addr::new(10, 0, 0, 50),
            mac: "aa:bb:cc:dd:ee:05".to_string(),
            options: vec![],
            next_server: None,
        });

        let (lease, _, persist) = subnet.find_or_get("aa:bb:cc:dd:ee:05", None);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 50));
        assert!(persist);
        assert!(!subnet.pool_bit(Ipv4Addr::new(10, 0, 0, 10)));
    }

    #[test]
    fn test_add_binding_evicts_conflicting_lease() {
        let mut subnet = test_subnet();
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:04", None);
        let taken = lease.unwrap().ip;
        assert_eq!(taken, Ipv4Addr::new(10, 0, 0, 10));

        subnet.add_binding(Binding {
            ip: taken,
            mac: "aa:bb:cc:dd:ee:05".to_string(),
            options: vec![],
            next_server: None,
        });

        assert!(!subnet.leases.contains_key("aa:bb:cc:dd:ee:04"));
        assert!(!subnet.pool_bit(taken));

        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:04", None);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 11));
    }

    #[test]
    fn test_pool_never_hands_out_bound_addresses() {
        let mut subnet = test_subnet();
        subnet.add_binding(Binding {
            ip: Ipv4Addr::new(10, 0, 0, 11),
            mac: "aa:bb:cc:dd:ee:05".to_string(),
            options: vec![],
            next_server: None,
        });

        // suggestions for the bound address are refused
        let suggest = Some(Ipv4Addr::new(10, 0, 0, 11));
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:01", suggest);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 10));

        // the free-slot scan steps over it too
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:02", None);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 12));
    }

    #[test]
    fn test_unbinding_keeps_surviving_lease_on_the_pool() {
        let mut subnet = test_subnet();
        subnet.add_binding(Binding {
            ip: Ipv4Addr::new(10, 0, 0, 11),
            mac: "aa:bb:cc:dd:ee:05".to_string(),
            options: vec![],
            next_server: None,
        });
        subnet.find_or_get("aa:bb:cc:dd:ee:05", None);
        assert!(!subnet.pool_bit(Ipv4Addr::new(10, 0, 0, 11)));

        assert!(subnet.delete_binding("aa:bb:cc:dd:ee:05"));
        assert!(subnet.pool_bit(Ipv4Addr::new(10, 0, 0, 11)));

        // nobody else is handed the still-leased address
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 10));
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:02", None);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 12));

        assert!(!subnet.delete_binding("aa:bb:cc:dd:ee:05"));
    }

    #[test]
    fn test_decline_blocks_reallocation() {
        let mut subnet = test_subnet();
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
        let declined = lease.unwrap().ip;

        assert!(subnet.decline("aa:bb:cc:dd:ee:01", declined));
        assert!(subnet.leases.is_empty());

        // neither the original client nor anyone else gets it back
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:01", Some(declined));
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 11));
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:02", None);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 12));
    }

    #[test]
    fn test_decline_requires_matching_lease() {
        let mut subnet = test_subnet();
        assert!(!subnet.decline("aa:bb:cc:dd:ee:01", Ipv4Addr::new(10, 0, 0, 10)));

        subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
        assert!(!subnet.decline("aa:bb:cc:dd:ee:01", Ipv4Addr::new(10, 0, 0, 99)));
        assert_eq!(subnet.leases.len(), 1);
    }

    #[test]
    fn test_decline_cooldown_expires() {
        let mut subnet = test_subnet();
        subnet.active_end = Ipv4Addr::new(10, 0, 0, 10);
        subnet.rebuild_pool();

        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
        let ip = lease.unwrap().ip;
        subnet.decline("aa:bb:cc:dd:ee:01", ip);

        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:02", None);
        assert!(lease.is_none());

        // age the decline past the cool-down
        subnet.declined.insert(
            ip,
            Utc::now() - TimeDelta::seconds(DECLINE_COOLDOWN_SECONDS + 1),
        );
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:02", None);
        assert_eq!(lease.unwrap().ip, ip);
    }

    #[test]
    fn test_free_lease_releases_slot() {
        let mut subnet = test_subnet();
        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
        let ip = lease.unwrap().ip;

        assert!(subnet.free_lease("aa:bb:cc:dd:ee:01"));
        assert!(!subnet.pool_bit(ip));
        assert!(!subnet.free_lease("aa:bb:cc:dd:ee:01"));

        let (lease, _, _) = subnet.find_or_get("aa:bb:cc:dd:ee:02", None);
        assert_eq!(lease.unwrap().ip, ip);
    }

    #[test]
    fn test_update_lease_time() {
        let mut subnet = test_subnet();
        subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
        assert!(subnet.leases["aa:bb:cc:dd:ee:01"].expire_time.is_none());

        let lease = subnet.update_lease_time("aa:bb:cc:dd:ee:01", 3600).unwrap();
        let remaining = lease.expire_time.unwrap() - Utc::now();
        assert!(remaining.num_seconds() > 3500);

        assert!(subnet.update_lease_time("aa:bb:cc:dd:ee:99", 3600).is_none());
    }

    #[test]
    fn test_build_options_lease_times() {
        let mut subnet = test_subnet();
        subnet.options.insert(6, vec![8, 8, 8, 8]);

        let (merged, lease_time) = subnet.build_options(None);
        assert_eq!(lease_time, 3600);
        assert_eq!(merged[&OPT_RENEWAL_TIME], 1800u32.to_be_bytes().to_vec());
        assert_eq!(merged[&OPT_REBINDING_TIME], 2700u32.to_be_bytes().to_vec());
        assert_eq!(merged[&6], vec![8, 8, 8, 8]);

        let binding = Binding {
            ip: Ipv4Addr::new(10, 0, 0, 50),
            mac: "aa:bb:cc:dd:ee:05".to_string(),
            options: vec![OptionEntry {
                id: 6,
                value: "1.1.1.1".to_string(),
            }],
            next_server: None,
        };
        let (merged, lease_time) = subnet.build_options(Some(&binding));
        assert_eq!(lease_time, 7200);
        // binding overlay wins over the subnet value
        assert_eq!(merged[&6], vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_build_options_skips_malformed_binding_option() {
        let subnet = test_subnet();
        let binding = Binding {
            ip: Ipv4Addr::new(10, 0, 0, 50),
            mac: "aa:bb:cc:dd:ee:05".to_string(),
            options: vec![
                OptionEntry {
                    id: 6,
                    value: "not-an-ip".to_string(),
                },
                OptionEntry {
                    id: 26,
                    value: "1500".to_string(),
                },
            ],
            next_server: None,
        };

        let (merged, _) = subnet.build_options(Some(&binding));
        assert!(!merged.contains_key(&6));
        assert_eq!(merged[&26], vec![5, 220]);
    }

    #[test]
    fn test_set_next_server_routing() {
        let mut subnet = test_subnet();
        subnet.add_binding(Binding {
            ip: Ipv4Addr::new(10, 0, 0, 50),
            mac: "aa:bb:cc:dd:ee:05".to_string(),
            options: vec![],
            next_server: None,
        });

        let tftp = Ipv4Addr::new(10, 0, 0, 2);
        subnet.set_next_server(Ipv4Addr::new(10, 0, 0, 50), tftp).unwrap();
        assert_eq!(
            subnet.bindings["aa:bb:cc:dd:ee:05"].next_server,
            Some(tftp)
        );
        assert_eq!(subnet.next_server, None);

        subnet.set_next_server(Ipv4Addr::new(10, 0, 0, 7), tftp).unwrap();
        assert_eq!(subnet.next_server, Some(tftp));

        assert!(subnet
            .set_next_server(Ipv4Addr::new(192, 168, 9, 9), tftp)
            .is_err());
    }

    #[test]
    fn test_dto_validation() {
        let mut dto = test_subnet().to_dto();
        dto.active_start = Ipv4Addr::new(10, 0, 0, 20);
        dto.active_end = Ipv4Addr::new(10, 0, 0, 10);
        assert!(matches!(Subnet::try_from(dto), Err(Error::Validation(_))));

        let mut dto = test_subnet().to_dto();
        dto.active_end = Ipv4Addr::new(10, 0, 1, 5);
        assert!(matches!(Subnet::try_from(dto), Err(Error::Validation(_))));

        let mut dto = test_subnet().to_dto();
        dto.active_lease_time = 0;
        assert!(matches!(Subnet::try_from(dto), Err(Error::Validation(_))));

        let mut dto = test_subnet().to_dto();
        dto.options.push(OptionEntry {
            id: 200,
            value: "zzz".to_string(),
        });
        assert!(matches!(Subnet::try_from(dto), Err(Error::Validation(_))));

        let mut dto = test_subnet().to_dto();
        dto.bindings.push(Binding {
            ip: Ipv4Addr::new(192, 168, 0, 1),
            mac: "aa:bb:cc:dd:ee:05".to_string(),
            options: vec![],
            next_server: None,
        });
        assert!(matches!(Subnet::try_from(dto), Err(Error::Validation(_))));
    }

    #[test]
    fn test_dto_roundtrip_rebuilds_pool() {
        let mut subnet = test_subnet();
        subnet.find_or_get("aa:bb:cc:dd:ee:01", None);
        subnet.find_or_get("aa:bb:cc:dd:ee:02", None);
        subnet.free_lease("aa:bb:cc:dd:ee:01");

        let restored = Subnet::try_from(subnet.to_dto()).unwrap();
        assert!(!restored.pool_bit(Ipv4Addr::new(10, 0, 0, 10)));
        assert!(restored.pool_bit(Ipv4Addr::new(10, 0, 0, 11)));

        // the freed slot is the next allocation, exactly as before the trip
        let mut restored = restored;
        let (lease, _, _) = restored.find_or_get("aa:bb:cc:dd:ee:03", None);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 10));
    }

    #[test]
    fn test_dto_roundtrip_keeps_bound_lease_off_pool() {
        let mut subnet = test_subnet();
        subnet.add_binding(Binding {
            ip: Ipv4Addr::new(10, 0, 0, 11),
            mac: "aa:bb:cc:dd:ee:05".to_string(),
            options: vec![],
            next_server: None,
        });
        subnet.find_or_get("aa:bb:cc:dd:ee:05", None);

        let restored = Subnet::try_from(subnet.to_dto()).unwrap();
        assert!(!restored.pool_bit(Ipv4Addr::new(10, 0, 0, 11)));
        assert_eq!(restored.free_slots(), 3);
    }

    #[test]
    fn test_replace_preserves_leases_when_range_unchanged() {
        let mut subnet = test_subnet();
        subnet.find_or_get("aa:bb:cc:dd:ee:06", None);

        let mut dto = subnet.to_dto();
        dto.leases.clear();
        dto.options = vec![OptionEntry {
            id: 6,
            value: "9.9.9.9".to_string(),
        }];
        let mut replacement = Subnet::try_from(dto).unwrap();
        replacement.adopt_runtime_state(&subnet);

        assert!(replacement.leases.contains_key("aa:bb:cc:dd:ee:06"));
        assert!(replacement.pool_bit(Ipv4Addr::new(10, 0, 0, 10)));
        let (merged, _) = replacement.build_options(None);
        assert_eq!(merged[&6], vec![9, 9, 9, 9]);
    }

    #[test]
    fn test_replace_drops_out_of_range_leases() {
        let mut subnet = test_subnet();
        subnet.find_or_get("aa:bb:cc:dd:ee:01", None); // .10
        subnet.find_or_get("aa:bb:cc:dd:ee:02", None); // .11

        let mut dto = subnet.to_dto();
        dto.active_start = Ipv4Addr::new(10, 0, 0, 11);
        dto.active_end = Ipv4Addr::new(10, 0, 0, 12);
        dto.leases.clear();
        let mut replacement = Subnet::try_from(dto).unwrap();
        replacement.adopt_runtime_state(&subnet);

        assert!(!replacement.leases.contains_key("aa:bb:cc:dd:ee:01"));
        assert!(replacement.leases.contains_key("aa:bb:cc:dd:ee:02"));
        assert!(replacement.pool_bit(Ipv4Addr::new(10, 0, 0, 11)));

        let (lease, _, _) = replacement.find_or_get("aa:bb:cc:dd:ee:03", None);
        assert_eq!(lease.unwrap().ip, Ipv4Addr::new(10, 0, 0, 12));
    }
}
