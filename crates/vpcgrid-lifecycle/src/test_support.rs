//! Shared fixtures for lifecycle tests.

use std::net::Ipv4Addr;
use std::sync::Arc;

use vpcgrid_agent::{SimulatedAgent, ZonePool};
use vpcgrid_core::VpcGridConfig;
use vpcgrid_reconcile::Reconciler;
use vpcgrid_state::*;

use crate::manager::LifecycleManager;

pub(crate) struct Fixture {
    pub state: StateStore,
    pub agent: Arc<SimulatedAgent>,
    pub pool: Arc<ZonePool>,
    pub manager: LifecycleManager,
}

pub(crate) fn test_config(public_range: &str) -> VpcGridConfig {
    let toml = format!(
        r#"
[lifecycle]
provision_timeout = "200ms"
max_provision_attempts = 3
recreate_grace = "100ms"
supervise_interval = "20ms"

[health]
interval = "20ms"
timeout = "50ms"
unhealthy_threshold = 2
grace_period = "60ms"

[reconcile]
push_timeout = "200ms"

[[zones]]
id = "zone-1"
public_range = "{public_range}"
"#
    );
    VpcGridConfig::parse(&toml).unwrap()
}

pub(crate) fn fixture() -> Fixture {
    fixture_with_range("192.0.2.0/24")
}

pub(crate) fn fixture_with_range(public_range: &str) -> Fixture {
    let config = test_config(public_range);
    let state = StateStore::open_in_memory().unwrap();
    state
        .put_vpc(&Vpc {
            id: "vpc-1".to_string(),
            name: "vpc".to_string(),
            zone_id: "zone-1".to_string(),
            cidr: "10.1.1.1/16".to_string(),
            router_lost_at: None,
            failed_creates: 0,
            created_at: 1,
        })
        .unwrap();
    state
        .put_network(&Network {
            id: "network-1".to_string(),
            vpc_id: "vpc-1".to_string(),
            name: "NETWORK-10.1.1.1".to_string(),
            cidr: "10.1.1.0/24".to_string(),
            gateway: Ipv4Addr::new(10, 1, 1, 1),
            offering: NetworkOffering::default_vpc(),
            vm_ids: vec![],
            status: NetworkStatus::Ready,
            pending_failures: 0,
            created_at: 1,
        })
        .unwrap();

    let agent = Arc::new(SimulatedAgent::new());
    let pool = Arc::new(ZonePool::new(&config.zones).unwrap());
    let reconciler = Reconciler::new(state.clone(), agent.clone(), config.reconcile.clone());
    let manager = LifecycleManager::new(
        state.clone(),
        agent.clone(),
        pool.clone(),
        reconciler,
        &config,
    );
    Fixture {
        state,
        agent,
        pool,
        manager,
    }
}

pub(crate) fn nat_spec(public_ip: Ipv4Addr, port: u16) -> RuleSpec {
    RuleSpec::Nat(NatRule {
        public_ip,
        public_port: port,
        private_ip: Ipv4Addr::new(10, 1, 1, 2),
        private_port: port,
        protocol: Protocol::Tcp,
    })
}
