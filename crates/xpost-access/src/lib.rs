//! Authorization for publish runs: short-lived guards and idempotency permits.

pub mod guard;
pub mod permit;

pub use guard::{
    Guard, GuardIssuer, GuardIssuerConfig, GuardOperation, GuardRejection, KillSwitches,
    DEFAULT_GUARD_TTL_MS,
};
pub use permit::{PermitError, PermitRegistry};
