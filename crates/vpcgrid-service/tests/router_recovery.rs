//! End-to-end scenarios: a VPC with two tiers loses its router and gets
//! its NAT rules back on the replacement without the tenant re-adding them.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use vpcgrid_agent::{RouterConfig, SimulatedAgent, ZonePool};
use vpcgrid_core::VpcGridConfig;
use vpcgrid_service::{NetworkService, ServiceError};
use vpcgrid_state::*;

const WAIT: Duration = Duration::from_secs(5);

struct Env {
    svc: NetworkService,
    agent: Arc<SimulatedAgent>,
    shutdown: watch::Sender<bool>,
}

impl Drop for Env {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn env() -> Env {
    let config = VpcGridConfig::parse(
        r#"
[lifecycle]
provision_timeout = "300ms"
max_provision_attempts = 3
recreate_grace = "150ms"
supervise_interval = "25ms"

[health]
interval = "25ms"
timeout = "50ms"
unhealthy_threshold = 2
grace_period = "75ms"

[reconcile]
push_timeout = "200ms"

[[zones]]
id = "zone-1"
public_range = "192.0.2.0/24"
"#,
    )
    .unwrap();
    let state = StateStore::open_in_memory().unwrap();
    let agent = Arc::new(SimulatedAgent::new());
    let pool = Arc::new(ZonePool::new(&config.zones).unwrap());
    let svc = NetworkService::assemble(state, agent.clone(), pool, &config);

    let (shutdown, rx) = watch::channel(false);
    let lifecycle = svc.lifecycle().clone();
    tokio::spawn(async move { lifecycle.run(rx).await });
    Env {
        svc,
        agent,
        shutdown,
    }
}

struct Tier {
    network: Network,
    rule: RuleId,
}

/// VPC `10.1.1.1/16` with a default tier at `10.1.1.1` and a no-LB tier at
/// `10.1.2.1`, one VM and one SSH port-forward each.
async fn two_tier_vpc(svc: &NetworkService) -> (Vpc, Vec<Tier>) {
    let vpc = svc.create_vpc("vpc-router-test", "zone-1", "10.1.1.1/16").unwrap();
    let mut tiers = Vec::new();
    for (gateway, offering) in [
        ("10.1.1.1", NetworkOffering::default_vpc()),
        ("10.1.2.1", NetworkOffering::no_lb()),
    ] {
        let network = svc
            .create_network(&vpc.id, &format!("NETWORK-{gateway}"), gateway, "255.255.255.0", offering)
            .await
            .unwrap()
            .value;
        let vm = svc.deploy_vm(&network.id, "ssh-vm").await.unwrap().vm;
        let ip = svc.acquire_public_ip(&network.id).unwrap();
        let added = svc
            .add_nat_rule(
                &network.id,
                NatRule {
                    public_ip: ip.address,
                    public_port: 22,
                    private_ip: vm.private_ip,
                    private_port: 22,
                    protocol: Protocol::Tcp,
                },
            )
            .unwrap();
        let report = added.completion.wait().await.unwrap();
        assert!(report.converged(), "{report:?}");
        tiers.push(Tier {
            network,
            rule: added.value,
        });
    }
    (vpc, tiers)
}

async fn wait_for_config(agent: &SimulatedAgent, router_id: &str, expected: &RouterConfig) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if agent.config_for_router(router_id).as_ref() == Some(expected) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "router {router_id} never converged"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn destroyed_router_is_rebuilt_from_stored_rules() {
    let env = env();
    let svc = &env.svc;
    let (vpc, tiers) = two_tier_vpc(svc).await;

    let old = svc.wait_for_running_router(&vpc.id, WAIT).await.unwrap();
    let before = env.agent.config_for_router(&old.id).unwrap();
    assert_eq!(before.nat.len(), 2);

    let destroyed = svc.destroy_router(&old.id).await.unwrap();
    assert_eq!(destroyed.value.state, RouterState::Destroyed);
    for tier in &tiers {
        assert_eq!(svc.list_rules(&tier.network.id).unwrap().len(), 1);
    }

    // The supervisor replaces the router once the recreate grace passes.
    let deadline = tokio::time::Instant::now() + WAIT;
    let new = loop {
        let router = svc.wait_for_running_router(&vpc.id, WAIT).await.unwrap();
        if router.id != old.id {
            break router;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    wait_for_config(&env.agent, &new.id, &before).await;
    for tier in &tiers {
        let rules = svc.list_rules(&tier.network.id).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, tier.rule);
    }
}

#[tokio::test]
async fn lost_router_is_replaced_and_reconfigured() {
    let env = env();
    let svc = &env.svc;
    let (vpc, _) = two_tier_vpc(svc).await;
    let old = svc.wait_for_running_router(&vpc.id, WAIT).await.unwrap();
    let before = env.agent.config_for_router(&old.id).unwrap();

    env.agent.set_router_healthy(&old.id, false);

    let deadline = tokio::time::Instant::now() + WAIT;
    let new = loop {
        let router = svc.wait_for_running_router(&vpc.id, WAIT).await.unwrap();
        if router.id != old.id {
            break router;
        }
        assert!(tokio::time::Instant::now() < deadline, "router never replaced");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    wait_for_config(&env.agent, &new.id, &before).await;

    let routers = svc.list_routers(&vpc.id).unwrap();
    let active: Vec<_> = routers.iter().filter(|r| r.state.is_active()).collect();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn second_resync_is_a_no_op() {
    let env = env();
    let svc = &env.svc;
    let (vpc, _) = two_tier_vpc(svc).await;

    svc.reconciler().resync(&vpc.id).await.unwrap();
    let pushes = env.agent.push_count();
    let report = svc.reconciler().resync(&vpc.id).await.unwrap();
    assert_eq!(report.operations, 0);
    assert_eq!(env.agent.push_count(), pushes);
}

#[tokio::test]
async fn stopping_keeps_rules_and_restart_reapplies_them() {
    let env = env();
    let svc = &env.svc;
    let (vpc, tiers) = two_tier_vpc(svc).await;
    let router = svc.wait_for_running_router(&vpc.id, WAIT).await.unwrap();
    let before = env.agent.config_for_router(&router.id).unwrap();

    let stopped = svc.stop_router(&router.id).await.unwrap();
    assert_eq!(stopped.value.state, RouterState::Stopped);
    let again = svc.stop_router(&router.id).await.unwrap();
    assert_eq!(again.value.state, RouterState::Stopped);
    for tier in &tiers {
        assert_eq!(svc.list_rules(&tier.network.id).unwrap().len(), 1);
    }

    let ready = svc.start_router(&router.id).await.unwrap();
    ready.resync.wait().await.unwrap();
    assert_eq!(env.agent.config_for_router(&router.id).unwrap(), before);
}

#[tokio::test]
async fn concurrent_duplicate_nat_rules_admit_exactly_one() {
    let env = env();
    let svc = &env.svc;
    let vpc = svc.create_vpc("vpc", "zone-1", "10.1.1.1/16").unwrap();
    let network = svc
        .create_network(&vpc.id, "tier", "10.1.1.1", "255.255.255.0", NetworkOffering::default_vpc())
        .await
        .unwrap()
        .value;
    let vm = svc.deploy_vm(&network.id, "vm").await.unwrap().vm;
    let ip = svc.acquire_public_ip(&network.id).unwrap();
    let rule = NatRule {
        public_ip: ip.address,
        public_port: 2222,
        private_ip: vm.private_ip,
        private_port: 22,
        protocol: Protocol::Tcp,
    };

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let svc = svc.clone();
        let network_id = network.id.clone();
        let rule = rule.clone();
        tasks.push(tokio::spawn(async move {
            svc.add_nat_rule(&network_id, rule).map(|s| s.value)
        }));
    }
    let mut ok = 0;
    let mut dup = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(ServiceError::DuplicateRule { .. }) => dup += 1,
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!((ok, dup), (1, 3));
    assert_eq!(svc.list_rules(&network.id).unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_rules_degrade_only_their_tier() {
    let env = env();
    let svc = &env.svc;
    let (vpc, tiers) = two_tier_vpc(svc).await;
    let vm_ip = Ipv4Addr::new(10, 1, 1, 2);
    let ip = svc.acquire_public_ip(&tiers[0].network.id).unwrap();

    // Two more rules on the first tier, both refused by the router.
    let mut rejected = Vec::new();
    for port in [80, 443] {
        let added = svc
            .add_nat_rule(
                &tiers[0].network.id,
                NatRule {
                    public_ip: ip.address,
                    public_port: port,
                    private_ip: vm_ip,
                    private_port: port,
                    protocol: Protocol::Tcp,
                },
            )
            .unwrap();
        env.agent.reject_rule(&added.value);
        rejected.push(added);
    }
    for added in rejected {
        added.completion.wait().await.unwrap();
    }
    // Push the failure count past the threshold.
    for _ in 0..3 {
        svc.resync(&vpc.id).unwrap().wait().await.unwrap();
    }

    let degraded = svc.get_network(&tiers[0].network.id).unwrap();
    assert_eq!(degraded.status, NetworkStatus::Degraded);
    let healthy = svc.get_network(&tiers[1].network.id).unwrap();
    assert_eq!(healthy.status, NetworkStatus::Ready);

    env.agent.accept_all_rules();
    let report = svc.resync(&vpc.id).unwrap().wait().await.unwrap();
    assert!(report.converged());
    assert_eq!(
        svc.get_network(&tiers[0].network.id).unwrap().status,
        NetworkStatus::Ready
    );
}

fn ssh_to(public_ip: Ipv4Addr, private_ip: Ipv4Addr, port: u16) -> NatRule {
    NatRule {
        public_ip,
        public_port: port,
        private_ip,
        private_port: 22,
        protocol: Protocol::Tcp,
    }
}

#[tokio::test]
async fn stopped_then_destroyed_router_comes_back_for_a_new_vm() {
    let env = env();
    let svc = &env.svc;
    let (vpc, tiers) = two_tier_vpc(svc).await;
    let old = svc.wait_for_running_router(&vpc.id, WAIT).await.unwrap();

    svc.stop_router(&old.id).await.unwrap();
    let destroyed = svc.destroy_router(&old.id).await.unwrap();
    assert_eq!(destroyed.value.state, RouterState::Destroyed);

    // A new VM brings a router up without waiting out the recreate grace.
    let deployed = svc.deploy_vm(&tiers[0].network.id, "web-vm").await.unwrap();
    assert_eq!(deployed.router.state, RouterState::Running);
    assert_ne!(deployed.router.id, old.id);

    let replay = destroyed.completion.wait_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(replay.router_id.as_deref(), Some(deployed.router.id.as_str()));

    let ip = svc.acquire_public_ip(&tiers[0].network.id).unwrap();
    let added = svc
        .add_nat_rule(
            &tiers[0].network.id,
            ssh_to(ip.address, deployed.vm.private_ip, 2200),
        )
        .unwrap();
    let report = added.completion.wait().await.unwrap();
    assert!(report.converged(), "{report:?}");
    assert!(report.applied.contains(&added.value));

    let config = env.agent.config_for_router(&deployed.router.id).unwrap();
    for tier in &tiers {
        assert!(config.has_tier(&tier.network.id));
    }
    assert_eq!(config.nat.len(), 3);
    for tier in &tiers {
        let rules = svc.list_rules(&tier.network.id).unwrap();
        assert!(rules.iter().all(|r| r.status == RuleStatus::Applied));
    }
}

#[tokio::test]
async fn tier_created_after_router_is_attached() {
    let env = env();
    let svc = &env.svc;
    let (vpc, _) = two_tier_vpc(svc).await;
    let router = svc.wait_for_running_router(&vpc.id, WAIT).await.unwrap();

    let created = svc
        .create_network(&vpc.id, "NETWORK-10.1.3.1", "10.1.3.1", "255.255.255.0", NetworkOffering::no_lb())
        .await
        .unwrap();
    let network = created.value;
    let report = created.completion.wait().await.unwrap();
    assert_eq!(report.attached, vec![network.id.clone()]);

    let vm = svc.deploy_vm(&network.id, "db-vm").await.unwrap().vm;
    let ip = svc.acquire_public_ip(&network.id).unwrap();
    let added = svc
        .add_nat_rule(&network.id, ssh_to(ip.address, vm.private_ip, 22))
        .unwrap();
    let report = added.completion.wait().await.unwrap();
    assert!(report.converged(), "{report:?}");

    let config = env.agent.config_for_router(&router.id).unwrap();
    assert!(config.has_tier(&network.id));
    assert!(
        config
            .nat
            .iter()
            .any(|item| item.network_id == network.id && item.rule_id == added.value)
    );
}

#[tokio::test]
async fn permanent_provisioning_failure_leaves_router_failed() {
    let env = env();
    let svc = &env.svc;
    let vpc = svc.create_vpc("vpc", "zone-1", "10.1.1.1/16").unwrap();
    let network = svc
        .create_network(&vpc.id, "tier", "10.1.1.1", "255.255.255.0", NetworkOffering::default_vpc())
        .await
        .unwrap()
        .value;
    env.agent.fail_next_boots(u32::MAX);

    let err = svc.deploy_vm(&network.id, "vm").await.unwrap_err();
    assert!(matches!(err, ServiceError::Lifecycle(_)), "{err}");

    // The supervisor retries until the failed-create bound, then stops.
    let deadline = tokio::time::Instant::now() + WAIT;
    while svc.get_vpc(&vpc.id).unwrap().failed_creates < 3 {
        assert!(tokio::time::Instant::now() < deadline, "recreation never gave up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let boots = env.agent.boot_count();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(env.agent.boot_count(), boots);

    let routers = svc.list_routers(&vpc.id).unwrap();
    let failed: Vec<_> = routers
        .iter()
        .filter(|r| r.state == RouterState::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(routers.iter().all(|r| !r.state.is_active()));
    assert!(matches!(
        svc.wait_for_running_router(&vpc.id, Duration::from_millis(50)).await,
        Err(ServiceError::Timeout(_))
    ));
}
