//! StateStore — redb-backed persistence for vpcgrid.
//!
//! Provides typed CRUD over VPCs, tiers, VMs, routers, and public IPs, plus
//! the rule store operations (`upsert_rule`, `list_rules`, `mark_applied`,
//! `remove_rule`). All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).
//!
//! redb serializes write transactions, so every read-modify-write helper
//! here (`update_router`, `upsert_rule`, ...) is atomic with respect to
//! concurrent callers.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in [VPCS, NETWORKS, VMS, ROUTERS, RULES, PUBLIC_IPS] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.open_table(NAT_INDEX).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn scan_json<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete_key(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read, modify, and write back one record in a single transaction.
    ///
    /// Returns the updated value, or `None` if the key does not exist.
    fn update_json<T, F>(&self, def: JsonTable, key: &str, f: F) -> StateResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            match current {
                Some(bytes) => {
                    let mut value: T =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    f(&mut value);
                    let bytes = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
                    table
                        .insert(key, bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(value)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Sequences ──────────────────────────────────────────────────

    /// Allocate the next id in a named sequence, e.g. `router-7`.
    pub fn next_id(&self, prefix: &str) -> StateResult<String> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq = bump_seq(&txn, prefix)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(format!("{prefix}-{seq}"))
    }

    // ── VPCs ───────────────────────────────────────────────────────

    pub fn put_vpc(&self, vpc: &Vpc) -> StateResult<()> {
        self.put_json(VPCS, &vpc.id, vpc)?;
        debug!(vpc_id = %vpc.id, "vpc stored");
        Ok(())
    }

    pub fn get_vpc(&self, vpc_id: &str) -> StateResult<Option<Vpc>> {
        self.get_json(VPCS, vpc_id)
    }

    pub fn list_vpcs(&self) -> StateResult<Vec<Vpc>> {
        self.scan_json(VPCS, "")
    }

    pub fn update_vpc(&self, vpc_id: &str, f: impl FnOnce(&mut Vpc)) -> StateResult<Option<Vpc>> {
        self.update_json(VPCS, vpc_id, f)
    }

    // ── Networks ───────────────────────────────────────────────────

    pub fn put_network(&self, network: &Network) -> StateResult<()> {
        self.put_json(NETWORKS, &network.id, network)?;
        debug!(network_id = %network.id, vpc_id = %network.vpc_id, "network stored");
        Ok(())
    }

    pub fn get_network(&self, network_id: &str) -> StateResult<Option<Network>> {
        self.get_json(NETWORKS, network_id)
    }

    /// List the tiers of a VPC.
    pub fn list_networks_for_vpc(&self, vpc_id: &str) -> StateResult<Vec<Network>> {
        let all: Vec<Network> = self.scan_json(NETWORKS, "")?;
        Ok(all.into_iter().filter(|n| n.vpc_id == vpc_id).collect())
    }

    pub fn update_network(
        &self,
        network_id: &str,
        f: impl FnOnce(&mut Network),
    ) -> StateResult<Option<Network>> {
        self.update_json(NETWORKS, network_id, f)
    }

    /// Delete a tier together with its VMs and rules.
    pub fn delete_network(&self, network_id: &str) -> StateResult<bool> {
        let prefix = format!("{network_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut networks = txn.open_table(NETWORKS).map_err(map_err!(Table))?;
            existed = networks.remove(network_id).map_err(map_err!(Write))?.is_some();

            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            for key in prefixed_keys(&vms, &prefix)? {
                vms.remove(key.as_str()).map_err(map_err!(Write))?;
            }

            let mut rules = txn.open_table(RULES).map_err(map_err!(Table))?;
            let mut index = txn.open_table(NAT_INDEX).map_err(map_err!(Table))?;
            for key in prefixed_keys(&rules, &prefix)? {
                let removed = rules
                    .remove(key.as_str())
                    .map_err(map_err!(Write))?
                    .map(|guard| guard.value().to_vec());
                if let Some(bytes) = removed {
                    let record: RuleRecord =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    if let Some(nat) = record.nat() {
                        index
                            .remove(nat.public_key().as_str())
                            .map_err(map_err!(Write))?;
                    }
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%network_id, existed, "network deleted");
        Ok(existed)
    }

    // ── VMs ────────────────────────────────────────────────────────

    pub fn put_vm(&self, vm: &Vm) -> StateResult<()> {
        self.put_json(VMS, &vm.table_key(), vm)
    }

    pub fn list_vms_for_network(&self, network_id: &str) -> StateResult<Vec<Vm>> {
        self.scan_json(VMS, &format!("{network_id}:"))
    }

    // ── Routers ────────────────────────────────────────────────────

    pub fn put_router(&self, router: &Router) -> StateResult<()> {
        self.put_json(ROUTERS, &router.id, router)?;
        debug!(router_id = %router.id, state = %router.state, "router stored");
        Ok(())
    }

    pub fn get_router(&self, router_id: &str) -> StateResult<Option<Router>> {
        self.get_json(ROUTERS, router_id)
    }

    pub fn list_routers(&self) -> StateResult<Vec<Router>> {
        self.scan_json(ROUTERS, "")
    }

    /// All routers ever created for a VPC, oldest first.
    pub fn list_routers_for_vpc(&self, vpc_id: &str) -> StateResult<Vec<Router>> {
        let mut routers: Vec<Router> = self
            .list_routers()?
            .into_iter()
            .filter(|r| r.vpc_id == vpc_id)
            .collect();
        routers.sort_by_key(|r| r.created_at);
        Ok(routers)
    }

    /// The router currently serving a VPC, if any.
    pub fn active_router_for_vpc(&self, vpc_id: &str) -> StateResult<Option<Router>> {
        Ok(self
            .list_routers_for_vpc(vpc_id)?
            .into_iter()
            .rev()
            .find(|r| r.state.is_active()))
    }

    pub fn update_router(
        &self,
        router_id: &str,
        f: impl FnOnce(&mut Router),
    ) -> StateResult<Option<Router>> {
        self.update_json(ROUTERS, router_id, |router: &mut Router| {
            f(router);
            router.updated_at = epoch_millis();
        })
    }

    // ── Public IPs ─────────────────────────────────────────────────

    pub fn put_public_ip(&self, record: &PublicIpRecord) -> StateResult<()> {
        self.put_json(PUBLIC_IPS, &record.address.to_string(), record)
    }

    pub fn get_public_ip(&self, address: &str) -> StateResult<Option<PublicIpRecord>> {
        self.get_json(PUBLIC_IPS, address)
    }

    pub fn list_public_ips_for_vpc(&self, vpc_id: &str) -> StateResult<Vec<PublicIpRecord>> {
        let all: Vec<PublicIpRecord> = self.scan_json(PUBLIC_IPS, "")?;
        Ok(all.into_iter().filter(|ip| ip.vpc_id == vpc_id).collect())
    }

    pub fn delete_public_ip(&self, address: &str) -> StateResult<bool> {
        self.delete_key(PUBLIC_IPS, address)
    }

    // ── Rules ──────────────────────────────────────────────────────

    /// Insert a new rule, or replace the spec of `rule_id` in place.
    ///
    /// A replaced rule keeps its position and goes back to `Pending`.
    /// Fails with [`StateError::DuplicateRule`] if a NAT rule's public
    /// tuple is owned by a different rule.
    pub fn upsert_rule(
        &self,
        network_id: &str,
        rule_id: Option<&str>,
        spec: RuleSpec,
    ) -> StateResult<RuleId> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = {
            let mut rules = txn.open_table(RULES).map_err(map_err!(Table))?;
            let mut index = txn.open_table(NAT_INDEX).map_err(map_err!(Table))?;

            let (id, created_at, previous) = match rule_id {
                Some(id) => {
                    let bytes = rules
                        .get(id)
                        .map_err(map_err!(Read))?
                        .map(|guard| guard.value().to_vec())
                        .ok_or_else(|| StateError::NotFound(format!("rule {id}")))?;
                    let previous: RuleRecord =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    if previous.network_id != network_id {
                        return Err(StateError::NotFound(format!(
                            "rule {id} in network {network_id}"
                        )));
                    }
                    (id.to_string(), previous.created_at, Some(previous))
                }
                None => {
                    let seq = bump_seq(&txn, "rule")?;
                    (rule_key(network_id, seq), epoch_millis(), None)
                }
            };

            if let RuleSpec::Nat(nat) = &spec {
                let key = nat.public_key();
                let holder = index
                    .get(key.as_str())
                    .map_err(map_err!(Read))?
                    .map(|guard| guard.value().to_string());
                if let Some(existing) = holder.filter(|holder| *holder != id) {
                    return Err(StateError::DuplicateRule { key, existing });
                }
            }
            if let Some(old_nat) = previous.as_ref().and_then(RuleRecord::nat) {
                index
                    .remove(old_nat.public_key().as_str())
                    .map_err(map_err!(Write))?;
            }
            if let RuleSpec::Nat(nat) = &spec {
                index
                    .insert(nat.public_key().as_str(), id.as_str())
                    .map_err(map_err!(Write))?;
            }

            let record = RuleRecord {
                id: id.clone(),
                network_id: network_id.to_string(),
                spec,
                status: RuleStatus::Pending,
                applied_router: None,
                failures: 0,
                created_at,
            };
            let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            rules
                .insert(id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            id
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rule_id = %id, %network_id, "rule stored");
        Ok(id)
    }

    /// Rules of one network, in insertion order.
    pub fn list_rules(&self, network_id: &str) -> StateResult<Vec<RuleRecord>> {
        self.scan_json(RULES, &format!("{network_id}:"))
    }

    pub fn get_rule(&self, rule_id: &str) -> StateResult<Option<RuleRecord>> {
        self.get_json(RULES, rule_id)
    }

    /// Record that `rule_id` is live on `router_id`. Returns false if the
    /// rule was removed in the meantime.
    pub fn mark_applied(&self, rule_id: &str, router_id: &str) -> StateResult<bool> {
        let updated = self.update_json(RULES, rule_id, |rule: &mut RuleRecord| {
            rule.status = RuleStatus::Applied;
            rule.applied_router = Some(router_id.to_string());
            rule.failures = 0;
        })?;
        Ok(updated.is_some())
    }

    /// Record a failed push. Returns the new failure count.
    pub fn mark_pending(&self, rule_id: &str) -> StateResult<Option<u32>> {
        let updated = self.update_json(RULES, rule_id, |rule: &mut RuleRecord| {
            rule.status = RuleStatus::Pending;
            rule.failures += 1;
        })?;
        Ok(updated.map(|rule| rule.failures))
    }

    /// Delete a rule and its NAT index entry.
    pub fn remove_rule(&self, rule_id: &str) -> StateResult<Option<RuleRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut rules = txn.open_table(RULES).map_err(map_err!(Table))?;
            let bytes = rules
                .remove(rule_id)
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec());
            match bytes {
                Some(bytes) => {
                    let record: RuleRecord =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    if let Some(nat) = record.nat() {
                        let mut index = txn.open_table(NAT_INDEX).map_err(map_err!(Table))?;
                        index
                            .remove(nat.public_key().as_str())
                            .map_err(map_err!(Write))?;
                    }
                    Some(record)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%rule_id, existed = removed.is_some(), "rule removed");
        Ok(removed)
    }

    /// Ids of NAT rules whose public side uses `address`.
    pub fn nat_rules_for_ip(&self, address: &str) -> StateResult<Vec<RuleId>> {
        let prefix = format!("{address}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NAT_INDEX).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            results.push(value.value().to_string());
        }
        Ok(results)
    }

    /// Whether any rule of the VPC is waiting to be applied.
    pub fn has_pending_rules(&self, vpc_id: &str) -> StateResult<bool> {
        for network in self.list_networks_for_vpc(vpc_id)? {
            if self
                .list_rules(&network.id)?
                .iter()
                .any(|rule| rule.status == RuleStatus::Pending)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn bump_seq(txn: &WriteTransaction, name: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let current = table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn prefixed_keys(table: &impl ReadableTable<&'static str, &'static [u8]>, prefix: &str) -> StateResult<Vec<String>> {
    let mut keys = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let key = key.value().to_string();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn test_vpc(id: &str) -> Vpc {
        Vpc {
            id: id.to_string(),
            name: format!("{id}-name"),
            zone_id: "zone-1".to_string(),
            cidr: "10.1.1.1/16".to_string(),
            router_lost_at: None,
            failed_creates: 0,
            created_at: 1000,
        }
    }

    fn test_network(id: &str, vpc_id: &str) -> Network {
        Network {
            id: id.to_string(),
            vpc_id: vpc_id.to_string(),
            name: format!("NETWORK-{id}"),
            cidr: "10.1.1.0/24".to_string(),
            gateway: Ipv4Addr::new(10, 1, 1, 1),
            offering: NetworkOffering::default_vpc(),
            vm_ids: Vec::new(),
            status: NetworkStatus::Ready,
            pending_failures: 0,
            created_at: 1000,
        }
    }

    fn test_router(id: &str, vpc_id: &str, state: RouterState, created_at: u64) -> Router {
        Router {
            id: id.to_string(),
            vpc_id: vpc_id.to_string(),
            state,
            public_ip: Some(Ipv4Addr::new(192, 0, 2, 10)),
            agent_handle: None,
            last_health_at: None,
            provision_attempts: 0,
            ip_release_deferred: false,
            created_at,
            updated_at: created_at,
        }
    }

    fn nat(public_port: u16) -> RuleSpec {
        RuleSpec::Nat(NatRule {
            public_ip: Ipv4Addr::new(192, 0, 2, 20),
            public_port,
            private_ip: Ipv4Addr::new(10, 1, 1, 2),
            private_port: 22,
            protocol: Protocol::Tcp,
        })
    }

    fn acl(port: u16) -> RuleSpec {
        RuleSpec::Acl(AclEntry {
            direction: TrafficDirection::Ingress,
            protocol: Protocol::Tcp,
            start_port: port,
            end_port: port,
            cidr: "0.0.0.0/0".to_string(),
            action: AclAction::Allow,
        })
    }

    // ── Entities ───────────────────────────────────────────────────

    #[test]
    fn vpc_put_get_update() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_vpc(&test_vpc("vpc-1")).unwrap();

        let updated = store
            .update_vpc("vpc-1", |vpc| vpc.router_lost_at = Some(5))
            .unwrap()
            .unwrap();
        assert_eq!(updated.router_lost_at, Some(5));
        assert_eq!(store.get_vpc("vpc-1").unwrap(), Some(updated));
        assert!(store.update_vpc("nope", |_| {}).unwrap().is_none());
    }

    #[test]
    fn networks_are_listed_per_vpc() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_network(&test_network("net-1", "vpc-1")).unwrap();
        store.put_network(&test_network("net-2", "vpc-1")).unwrap();
        store.put_network(&test_network("net-3", "vpc-2")).unwrap();

        assert_eq!(store.list_networks_for_vpc("vpc-1").unwrap().len(), 2);
        assert_eq!(store.list_networks_for_vpc("vpc-2").unwrap().len(), 1);
    }

    #[test]
    fn active_router_is_newest_active() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_router(&test_router("router-1", "vpc-1", RouterState::Destroyed, 1))
            .unwrap();
        store
            .put_router(&test_router("router-2", "vpc-1", RouterState::Running, 2))
            .unwrap();

        let active = store.active_router_for_vpc("vpc-1").unwrap().unwrap();
        assert_eq!(active.id, "router-2");
        assert!(store.active_router_for_vpc("vpc-2").unwrap().is_none());
    }

    #[test]
    fn update_router_stamps_updated_at() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_router(&test_router("router-1", "vpc-1", RouterState::Provisioning, 1))
            .unwrap();

        let router = store
            .update_router("router-1", |r| r.state = RouterState::Running)
            .unwrap()
            .unwrap();
        assert_eq!(router.state, RouterState::Running);
        assert!(router.updated_at > 1);
    }

    #[test]
    fn sequences_are_monotonic() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.next_id("router").unwrap(), "router-1");
        assert_eq!(store.next_id("router").unwrap(), "router-2");
        assert_eq!(store.next_id("vpc").unwrap(), "vpc-1");
    }

    // ── Rules ──────────────────────────────────────────────────────

    #[test]
    fn rules_list_in_insertion_order() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.upsert_rule("net-1", None, acl(80)).unwrap();
        let b = store.upsert_rule("net-1", None, acl(22)).unwrap();
        let c = store.upsert_rule("net-1", None, acl(443)).unwrap();
        store.upsert_rule("net-2", None, acl(22)).unwrap();

        let ids: Vec<_> = store
            .list_rules("net-1")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[test]
    fn duplicate_nat_tuple_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.upsert_rule("net-1", None, nat(22)).unwrap();

        let err = store.upsert_rule("net-2", None, nat(22)).unwrap_err();
        match err {
            StateError::DuplicateRule { existing, .. } => assert_eq!(existing, first),
            other => panic!("expected DuplicateRule, got {other:?}"),
        }
        // The failed insert left nothing behind.
        assert!(store.list_rules("net-2").unwrap().is_empty());

        // Different port is fine.
        store.upsert_rule("net-1", None, nat(2222)).unwrap();
    }

    #[test]
    fn upsert_in_place_keeps_order_and_resets_status() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.upsert_rule("net-1", None, nat(22)).unwrap();
        let second = store.upsert_rule("net-1", None, acl(22)).unwrap();
        store.mark_applied(&first, "router-1").unwrap();

        let same = store.upsert_rule("net-1", Some(&first), nat(2022)).unwrap();
        assert_eq!(same, first);

        let rules = store.list_rules("net-1").unwrap();
        assert_eq!(rules[0].id, first);
        assert_eq!(rules[1].id, second);
        assert_eq!(rules[0].status, RuleStatus::Pending);
        assert_eq!(rules[0].nat().unwrap().public_port, 2022);

        // The old tuple was released.
        store.upsert_rule("net-1", None, nat(22)).unwrap();
    }

    #[test]
    fn mark_applied_and_pending() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.upsert_rule("net-1", None, nat(22)).unwrap();

        assert_eq!(store.mark_pending(&id).unwrap(), Some(1));
        assert_eq!(store.mark_pending(&id).unwrap(), Some(2));

        assert!(store.mark_applied(&id, "router-1").unwrap());
        let rule = store.get_rule(&id).unwrap().unwrap();
        assert_eq!(rule.status, RuleStatus::Applied);
        assert_eq!(rule.applied_router.as_deref(), Some("router-1"));
        assert_eq!(rule.failures, 0);

        assert!(!store.mark_applied("net-1:999", "router-1").unwrap());
    }

    #[test]
    fn remove_rule_frees_nat_tuple() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.upsert_rule("net-1", None, nat(22)).unwrap();
        assert_eq!(store.nat_rules_for_ip("192.0.2.20").unwrap(), vec![id.clone()]);

        let removed = store.remove_rule(&id).unwrap().unwrap();
        assert_eq!(removed.id, id);
        assert!(store.nat_rules_for_ip("192.0.2.20").unwrap().is_empty());
        assert!(store.remove_rule(&id).unwrap().is_none());

        store.upsert_rule("net-2", None, nat(22)).unwrap();
    }

    #[test]
    fn nat_lookup_does_not_match_longer_addresses() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_rule("net-1", None, nat(22)).unwrap();
        assert!(store.nat_rules_for_ip("192.0.2.2").unwrap().is_empty());
    }

    #[test]
    fn delete_network_drops_rules_and_vms() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_network(&test_network("net-1", "vpc-1")).unwrap();
        store
            .put_vm(&Vm {
                id: "vm-1".to_string(),
                network_id: "net-1".to_string(),
                name: "vm".to_string(),
                private_ip: Ipv4Addr::new(10, 1, 1, 2),
                created_at: 1,
            })
            .unwrap();
        store.upsert_rule("net-1", None, nat(22)).unwrap();
        store.upsert_rule("net-1", None, acl(22)).unwrap();

        assert!(store.delete_network("net-1").unwrap());
        assert!(store.get_network("net-1").unwrap().is_none());
        assert!(store.list_rules("net-1").unwrap().is_empty());
        assert!(store.list_vms_for_network("net-1").unwrap().is_empty());
        assert!(store.nat_rules_for_ip("192.0.2.20").unwrap().is_empty());
    }

    #[test]
    fn pending_rules_are_detected_per_vpc() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_network(&test_network("net-1", "vpc-1")).unwrap();
        let id = store.upsert_rule("net-1", None, nat(22)).unwrap();

        assert!(store.has_pending_rules("vpc-1").unwrap());
        store.mark_applied(&id, "router-1").unwrap();
        assert!(!store.has_pending_rules("vpc-1").unwrap());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn rules_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        let id = {
            let store = StateStore::open(&db_path).unwrap();
            store.upsert_rule("net-1", None, nat(22)).unwrap()
        };

        let store = StateStore::open(&db_path).unwrap();
        let rules = store.list_rules("net-1").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, id);
        // The uniqueness index survived too.
        assert!(store.upsert_rule("net-9", None, nat(22)).is_err());
    }
}
