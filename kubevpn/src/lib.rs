//! Workstation VPN into a Kubernetes cluster, with an inverse data path
//! that pulls selected cluster traffic back to the workstation.
//!
//! A long-running daemon owns the tunnel and all cluster state; thin
//! foreground commands talk to it over a Unix socket. See
//! [`daemon::Daemon`] for the server and [`daemon::DaemonClient`] for the
//! command side.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
pub mod connect;
pub mod daemon;
pub mod logging;
pub mod platform;
pub mod reverse;
pub mod signals;
