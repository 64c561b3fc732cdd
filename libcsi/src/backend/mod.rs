//! Service implementations.
//!
//! * [`hostpath`]: the Node service: staging, publishing and hooks for
//!   pre-existing host directories.
//! * [`passthrough`]: the Controller service, which has nothing to provision.
//! * [`identity`]: plugin metadata shared by both deployments.

pub mod hostpath;
pub mod identity;
pub mod passthrough;

pub use hostpath::HostPathBackend;
pub use identity::DriverIdentity;
pub use passthrough::PassThroughController;
