//! Node discovery.
//!
//! Two independent strategies keep the [`Registry`](crate::registry::Registry)
//! populated:
//! - **Active scan** (coordinator): plan targets from known nodes, the ARP
//!   cache, configured ranges and local subnets, then probe each with
//!   `GET /health` and `GET /caps`
//! - **Passive registration** (worker): push `{id, address, slots, role}` to
//!   the coordinator on a fixed interval
//!
//! # Components
//!
//! - [`Scanner`]: runs scans, one at a time, guarded by a [`ScanCoordinator`]
//! - [`Prober`]: the two-stage HTTP probe
//! - [`targets`]: target enumeration and filtering
//! - [`Registrar`] / [`accept_registration`]: both ends of the push

pub mod probe;
pub mod registrar;
pub mod scanner;
pub mod targets;

pub use probe::{CapsResponse, HealthResponse, Prober};
pub use registrar::{accept_registration, RegisterRequest, Registrar, Registration};
pub use scanner::{ScanCoordinator, ScanGuard, ScanPhase, ScanStatus, ScanSummary, Scanner};
