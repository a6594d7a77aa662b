//! Primary-election registrar, service catalog, and discovery cache.
//!
//! A registrar process runs a [`election::RegistrarElection`] alongside
//! a [`catalog::ServiceCatalog`]: only the primary's catalog is
//! authoritative, but every process (primary or secondary) can run a
//! [`discovery::DiscoveryCache`] against whichever process currently
//! holds `/out`.

pub mod catalog;
pub mod discovery;
pub mod election;

pub use catalog::ServiceCatalog;
pub use discovery::{ChangeKind, DiscoveryCache};
pub use election::{ElectionEvent, RegistrarElection};
