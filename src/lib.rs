//! dvrwatch — liveness monitoring for a fleet of cloud-registered DVRs.
//!
//! - `p2p`: signed datagram protocol, discovery resolver, device prober
//! - `scanner`: bounded, single-flight scan cycles and the interval scheduler
//! - `status`: copy-on-write status cache
//! - `inventory`: the fleet roster file
//! - `fleet`: inventory joined with status, as served by the API
//! - `server`: axum HTTP API

pub mod config;
pub mod fleet;
pub mod inventory;
pub mod p2p;
pub mod scanner;
pub mod server;
pub mod status;
