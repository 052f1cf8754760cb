//! The narrow seam to the operating system.
//!
//! DNS wiring, firewall rules, TUN driver management and route programming
//! differ per platform and are mechanical; the controllers only ever see
//! this trait. The Linux implementation shells out to the usual tools,
//! best-effort. Tests use the no-op implementation.

use std::net::{IpAddr, Ipv4Addr};

use anyhow::Result;
use ip_network::IpNetwork;

use crate::config;

#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    async fn setup_dns(&self, tun_name: &str, nameservers: &[IpAddr], search: &[String])
    -> Result<()>;
    async fn cancel_dns(&self) -> Result<()>;

    async fn install_tun(&self) -> Result<()>;
    async fn uninstall_tun(&self) -> Result<()>;

    async fn allow_firewall(&self) -> Result<()>;
    async fn remove_firewall(&self) -> Result<()>;

    /// Assigns the tunnel address and routes to the device.
    async fn configure_tun(
        &self,
        name: &str,
        ip: Ipv4Addr,
        prefix: u8,
        routes: &[IpNetwork],
    ) -> Result<()>;

    /// Reports (and where possible disables) other TUN-class devices that
    /// would fight over the same routes.
    async fn disable_conflicting_devices(&self, keep: &str) -> Result<()>;
}

pub struct LinuxPlatform;

#[async_trait::async_trait]
impl Platform for LinuxPlatform {
    async fn setup_dns(
        &self,
        tun_name: &str,
        nameservers: &[IpAddr],
        search: &[String],
    ) -> Result<()> {
        let Some(server) = nameservers.first() else {
            tracing::warn!("No cluster nameserver known, leaving DNS alone");
            return Ok(());
        };

        run("resolvectl", &["dns", tun_name, &server.to_string()]).await;
        for domain in search {
            run("resolvectl", &["domain", tun_name, domain]).await;
        }

        Ok(())
    }

    async fn cancel_dns(&self) -> Result<()> {
        run("resolvectl", &["revert", &config::tun_name()]).await;

        Ok(())
    }

    async fn install_tun(&self) -> Result<()> {
        // The kernel module ships with every distribution we care about.
        Ok(())
    }

    async fn uninstall_tun(&self) -> Result<()> {
        Ok(())
    }

    async fn allow_firewall(&self) -> Result<()> {
        Ok(())
    }

    async fn remove_firewall(&self) -> Result<()> {
        Ok(())
    }

    async fn configure_tun(
        &self,
        name: &str,
        ip: Ipv4Addr,
        prefix: u8,
        routes: &[IpNetwork],
    ) -> Result<()> {
        run("ip", &["addr", "add", &format!("{ip}/{prefix}"), "dev", name]).await;
        run("ip", &["link", "set", name, "up"]).await;

        for route in routes {
            run("ip", &["route", "replace", &route.to_string(), "dev", name]).await;
        }

        Ok(())
    }

    async fn disable_conflicting_devices(&self, keep: &str) -> Result<()> {
        let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
            return Ok(());
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == keep || !entry.path().join("tun_flags").exists() {
                continue;
            }

            tracing::warn!(device = %name, "Disabling conflicting TUN device");
            run("ip", &["link", "set", &name, "down"]).await;
        }

        Ok(())
    }
}

/// Runs a system tool, logging instead of failing; the callers treat all
/// of this as best-effort.
async fn run(program: &str, args: &[&str]) {
    match tokio::process::Command::new(program).args(args).output().await {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            tracing::debug!(
                "`{program} {}` failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => tracing::debug!("failed to exec {program}: {e}"),
    }
}

/// Does nothing, successfully.
pub struct NoopPlatform;

#[async_trait::async_trait]
impl Platform for NoopPlatform {
    async fn setup_dns(&self, _: &str, _: &[IpAddr], _: &[String]) -> Result<()> {
        Ok(())
    }

    async fn cancel_dns(&self) -> Result<()> {
        Ok(())
    }

    async fn install_tun(&self) -> Result<()> {
        Ok(())
    }

    async fn uninstall_tun(&self) -> Result<()> {
        Ok(())
    }

    async fn allow_firewall(&self) -> Result<()> {
        Ok(())
    }

    async fn remove_firewall(&self) -> Result<()> {
        Ok(())
    }

    async fn configure_tun(&self, _: &str, _: Ipv4Addr, _: u8, _: &[IpNetwork]) -> Result<()> {
        Ok(())
    }

    async fn disable_conflicting_devices(&self, _: &str) -> Result<()> {
        Ok(())
    }
}
