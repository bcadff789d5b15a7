//! The subnet registry: single coordinator of every mutation and the bridge
//! to persistence.
//!
//! Locking is two-level with a fixed order: the tracker's map lock first,
//! then at most one subnet's lock. Cross-subnet operations do not exist, so
//! no ordering between subnet locks is ever needed. Snapshots are captured
//! under read locks and handed to the store only after every lock is
//! released, keeping critical sections short.
//!
//! Administrative mutations propagate a save failure to the caller
//! (mapped to 500 at the API layer) while keeping the in-memory state; the
//! protocol path only logs it, since a DHCP client can do nothing with a
//! persistence error.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::error;

use crate::config::{is_valid_mac, normalize_mac};
use crate::error::{Error, Result};
use crate::options;
use crate::store::{Snapshot, Store};
use crate::subnet::{Binding, Lease, Subnet, SubnetDto};

pub type SharedSubnet = Arc<RwLock<Subnet>>;

pub struct DataTracker {
    subnets: RwLock<HashMap<String, SharedSubnet>>,
    store: Arc<dyn Store>,
}

impl DataTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            subnets: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Replaces the in-memory registry with the store's snapshot. Pool
    /// bitmaps come back implicitly: subnet admission rebuilds them from
    /// the lease lists.
    pub async fn load_data(&self) -> Result<()> {
        let snapshot = self.store.load()?;
        let mut loaded = HashMap::new();
        for (name, dto) in snapshot.subnets {
            let subnet = Subnet::try_from(dto)?;
            loaded.insert(name, Arc::new(RwLock::new(subnet)));
        }
        *self.subnets.write().await = loaded;
        Ok(())
    }

    async fn snapshot(&self) -> Snapshot {
        let subnets = self.subnets.read().await;
        let mut snapshot = Snapshot::default();
        for (name, shared) in subnets.iter() {
            snapshot
                .subnets
                .insert(name.clone(), shared.read().await.to_dto());
        }
        snapshot
    }

    /// Captures and writes a full snapshot. Every mutating operation calls
    /// this after releasing its subnet lock.
    pub async fn save_data(&self) -> Result<()> {
        let snapshot = self.snapshot().await;
        self.store
            .save(&snapshot)
            .map_err(|err| Error::Persistence(err.to_string()))
    }

    async fn save_or_log(&self) {
        if let Err(err) = self.save_data().await {
            error!("{}", err);
        }
    }

    pub async fn list_subnets(&self) -> Vec<SubnetDto> {
        let subnets = self.subnets.read().await;
        let mut dtos = Vec::with_capacity(subnets.len());
        for shared in subnets.values() {
            dtos.push(shared.read().await.to_dto());
        }
        dtos.sort_by(|a, b| a.name.cmp(&b.name));
        dtos
    }

    pub async fn get_subnet(&self, name: &str) -> Option<SubnetDto> {
        let subnets = self.subnets.read().await;
        match subnets.get(name) {
            Some(shared) => Some(shared.read().await.to_dto()),
            None => None,
        }
    }

    pub async fn add_subnet(&self, dto: SubnetDto) -> Result<()> {
        let subnet = Subnet::try_from(dto)?;
        {
            let mut subnets = self.subnets.write().await;
            if subnets.contains_key(&subnet.name) {
                return Err(Error::Conflict(format!(
                    "subnet {} already exists",
                    subnet.name
                )));
            }
            subnets.insert(subnet.name.clone(), Arc::new(RwLock::new(subnet)));
        }
        self.save_data().await
    }

    /// Swaps a subnet's definition in place. Runtime state carries over per
    /// [`Subnet::adopt_runtime_state`]: leases, bindings, and pool bits
    /// survive an unchanged active range; a changed range drops out-of-range
    /// leases and rebuilds the pool.
    pub async fn replace_subnet(&self, name: &str, mut dto: SubnetDto) -> Result<()> {
        dto.name = name.to_string();
        let mut replacement = Subnet::try_from(dto)?;
        {
            let subnets = self.subnets.read().await;
            let shared = subnets
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("no subnet named {}", name)))?;
            let mut subnet = shared.write().await;
            replacement.adopt_runtime_state(&subnet);
            *subnet = replacement;
        }
        self.save_data().await
    }

    pub async fn remove_subnet(&self, name: &str) -> Result<()> {
        {
            let mut subnets = self.subnets.write().await;
            if subnets.remove(name).is_none() {
                return Err(Error::NotFound(format!("no subnet named {}", name)));
            }
        }
        self.save_data().await
    }

    pub async fn add_binding(&self, name: &str, mut binding: Binding) -> Result<()> {
        if binding.mac.is_empty() {
            return Err(Error::Validation("binding MAC must be non-empty".to_string()));
        }
        if !is_valid_mac(&binding.mac) {
            return Err(Error::Validation(format!(
                "invalid binding MAC: {:?}",
                binding.mac
            )));
        }
        for entry in &binding.options {
            options::encode_value(entry.id, &entry.value)?;
        }
        binding.mac = normalize_mac(&binding.mac);

        {
            let subnets = self.subnets.read().await;
            let shared = subnets
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("no subnet named {}", name)))?;
            let mut subnet = shared.write().await;
            if !subnet.cidr.contains(&binding.ip) {
                return Err(Error::Validation(format!(
                    "binding {} lies outside {}",
                    binding.ip, subnet.cidr
                )));
            }
            subnet.add_binding(binding);
        }
        self.save_data().await
    }

    /// Removes a reservation. Any lease the bound client still holds stays
    /// untouched until it expires or is released.
    pub async fn delete_binding(&self, name: &str, mac: &str) -> Result<()> {
        let mac = normalize_mac(mac);
        {
            let subnets = self.subnets.read().await;
            let shared = subnets
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("no subnet named {}", name)))?;
            let mut subnet = shared.write().await;
            if !subnet.delete_binding(&mac) {
                return Err(Error::NotFound(format!("no binding for {}", mac)));
            }
        }
        self.save_data().await
    }

    pub async fn set_next_server(
        &self,
        name: &str,
        ip: Ipv4Addr,
        next_server: Ipv4Addr,
    ) -> Result<()> {
        {
            let subnets = self.subnets.read().await;
            let shared = subnets
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("no subnet named {}", name)))?;
            shared.write().await.set_next_server(ip, next_server)?;
        }
        self.save_data().await
    }

    /// Subnet whose CIDR contains `addr` — the giaddr for relayed packets,
    /// otherwise the server's interface address. The most specific prefix
    /// wins; ties break by name so the choice is deterministic.
    pub async fn find_subnet(&self, addr: Ipv4Addr) -> Option<SharedSubnet> {
        let subnets = self.subnets.read().await;
        let mut best: Option<(u8, String, SharedSubnet)> = None;
        for (name, shared) in subnets.iter() {
            let subnet = shared.read().await;
            if !subnet.cidr.contains(&addr) {
                continue;
            }
            let candidate = (subnet.cidr.prefix_len(), name.clone());
            let better = match &best {
                None => true,
                Some((prefix, best_name, _)) => {
                    candidate.0 > *prefix || (candidate.0 == *prefix && candidate.1 < *best_name)
                }
            };
            if better {
                best = Some((candidate.0, candidate.1, Arc::clone(shared)));
            }
        }
        best.map(|(_, _, shared)| shared)
    }

    /// Protocol-path allocation. Persists when the subnet reports a change,
    /// including reap-only passes that freed expired leases without finding
    /// a slot.
    pub async fn find_or_allocate(
        &self,
        subnet: &SharedSubnet,
        mac: &str,
        suggest: Option<Ipv4Addr>,
    ) -> (Option<Lease>, Option<Binding>) {
        let (lease, binding, persist) = subnet.write().await.find_or_get(mac, suggest);
        if persist {
            self.save_or_log().await;
        }
        (lease, binding)
    }

    pub async fn renew(&self, subnet: &SharedSubnet, mac: &str, seconds: u32) -> Option<Lease> {
        let lease = subnet.write().await.update_lease_time(mac, seconds);
        if lease.is_some() {
            self.save_or_log().await;
        }
        lease
    }

    pub async fn decline(&self, subnet: &SharedSubnet, mac: &str, ip: Ipv4Addr) -> bool {
        let changed = subnet.write().await.decline(mac, ip);
        if changed {
            self.save_or_log().await;
        }
        changed
    }

    pub async fn release(&self, subnet: &SharedSubnet, mac: &str) -> bool {
        let changed = subnet.write().await.free_lease(mac);
        if changed {
            self.save_or_log().await;
        }
        changed
    }
}
