//! vpcgrid-api — REST API for vpcgrid.
//!
//! Axum route handlers over [`NetworkService`]. Responses use a common
//! `{ success, data, error }` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/vpcs` | List VPCs |
//! | POST | `/api/v1/vpcs` | Create a VPC |
//! | GET | `/api/v1/vpcs/{id}` | Get a VPC |
//! | GET | `/api/v1/vpcs/{id}/networks` | List tiers |
//! | POST | `/api/v1/vpcs/{id}/networks` | Create a tier |
//! | GET | `/api/v1/vpcs/{id}/routers` | List routers, destroyed ones included |
//! | GET | `/api/v1/vpcs/{id}/public-ips` | List public IPs |
//! | POST | `/api/v1/vpcs/{id}/resync` | Request a resync |
//! | GET | `/api/v1/networks/{id}` | Get a tier |
//! | DELETE | `/api/v1/networks/{id}` | Delete a tier |
//! | GET | `/api/v1/networks/{id}/vms` | List VMs |
//! | POST | `/api/v1/networks/{id}/vms` | Deploy a VM |
//! | POST | `/api/v1/networks/{id}/public-ips` | Acquire a public IP |
//! | GET | `/api/v1/networks/{id}/rules` | List NAT rules and ACL entries |
//! | POST | `/api/v1/networks/{id}/nat-rules` | Add a NAT rule |
//! | POST | `/api/v1/networks/{id}/acl-entries` | Append an ACL entry |
//! | DELETE | `/api/v1/rules/{id}` | Remove a rule |
//! | DELETE | `/api/v1/public-ips/{address}` | Release a public IP |
//! | POST | `/api/v1/routers/{id}/stop` | Stop a router |
//! | POST | `/api/v1/routers/{id}/start` | Start a stopped router |
//! | DELETE | `/api/v1/routers/{id}` | Destroy a router |
//! | GET | `/health` | Liveness |
//!
//! Rule mutations accept `?wait=true` to hold the response until the
//! resync carrying the change has finished.

pub mod handlers;

use axum::Router;
use axum::routing::{delete, get, post};
use vpcgrid_service::NetworkService;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: NetworkService,
}

/// Build the complete API router.
pub fn build_router(service: NetworkService) -> Router {
    let api_state = ApiState { service };

    let api_routes = Router::new()
        .route("/vpcs", get(handlers::list_vpcs).post(handlers::create_vpc))
        .route("/vpcs/{id}", get(handlers::get_vpc))
        .route(
            "/vpcs/{id}/networks",
            get(handlers::list_networks).post(handlers::create_network),
        )
        .route("/vpcs/{id}/routers", get(handlers::list_routers))
        .route("/vpcs/{id}/public-ips", get(handlers::list_public_ips))
        .route("/vpcs/{id}/resync", post(handlers::resync_vpc))
        .route(
            "/networks/{id}",
            get(handlers::get_network).delete(handlers::delete_network),
        )
        .route("/networks/{id}/vms", get(handlers::list_vms).post(handlers::deploy_vm))
        .route("/networks/{id}/public-ips", post(handlers::acquire_public_ip))
        .route("/networks/{id}/rules", get(handlers::list_rules))
        .route("/networks/{id}/nat-rules", post(handlers::add_nat_rule))
        .route("/networks/{id}/acl-entries", post(handlers::add_acl_entry))
        .route("/rules/{id}", delete(handlers::remove_rule))
        .route("/public-ips/{address}", delete(handlers::release_public_ip))
        .route("/routers/{id}/stop", post(handlers::stop_router))
        .route("/routers/{id}/start", post(handlers::start_router))
        .route("/routers/{id}", delete(handlers::destroy_router))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health))
}
