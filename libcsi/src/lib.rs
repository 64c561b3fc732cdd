//! # libcsi: hook-driven bind-mount CSI plugin over QUIC
//!
//! `libcsi` implements a node-local [Container Storage Interface][csi]
//! plugin whose volumes are pre-existing host directories. Staging makes a
//! volume ready on a node by calling an optional HTTP hook, publishing
//! bind-mounts it read-only into a workload, and all staged volumes are
//! recorded in a durable JSON file so they are reactivated after a restart.
//! Requests travel over QUIC (via [`quinn`]) instead of gRPC.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum and its [`StatusCode`] mapping. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volume create/delete. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`validate`] | Request validation: capabilities, mount paths, hooks. |
//! | [`state`] | [`StateStore`]: durable record of staged volumes. |
//! | [`hook`] | [`HookInvoker`]: HTTP stage/unstage callbacks. |
//! | [`mount`] | [`Mounter`]: read-only bind mounts and mountinfo. |
//! | [`config`] | [`NodeConfig`] runtime settings. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | Service implementations (host path node, pass-through controller). |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod hook;
pub mod identity;
pub mod message;
pub mod mount;
pub mod node;
pub mod state;
pub mod transport;
pub mod types;
pub mod validate;

// Re-export the most commonly used items at crate root for convenience.
pub use config::NodeConfig;
pub use controller::CsiController;
pub use error::{CsiError, StatusCode};
pub use hook::{HookConfig, HookInvoker, HttpHook};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use mount::{Binding, HostMounter, Mounter};
pub use node::CsiNode;
pub use state::{StateStore, VolumeRecord};
pub use types::*;
