//! # Armada Core
//!
//! Control plane for fleets of NAT'd hosts. Node agents dial out to the
//! relay and keep one authenticated tunnel open; callers submit commands
//! through the RBAC-gated fleet executor, which fans them out across the
//! resolved targets, aggregates per-node results, and persists every
//! execution to the pluggable store. The deployer orchestrates rolling,
//! canary, blue-green, serial and all-at-once rollouts on top of the
//! executor, and the HA coordinator partitions node ownership across relay
//! peers by consistent hashing.

pub mod config;
pub mod deploy;
pub mod fleet;
pub mod ha;
pub mod rbac;
pub mod relay;
pub mod store;

pub use config::{CoreConfig, RelayConfig, StoreBackend, StoreConfig};
pub use deploy::{DeployResult, DeploySpec, DeployState, DeployStrategy, Deployer};
pub use fleet::{FleetExecutor, NodeManager};
pub use ha::HaCoordinator;
pub use rbac::{AuditLogger, RbacEnforcer};
pub use relay::{NodeTransport, RelayServer, TransportError};
pub use store::{FleetStore, MemoryStore, PostgresStore, SqliteStore};
