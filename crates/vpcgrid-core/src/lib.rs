pub mod cidr;
pub mod config;
pub mod duration;

pub use cidr::{CidrError, TierCidr};
pub use config::VpcGridConfig;
pub use duration::parse_duration;
