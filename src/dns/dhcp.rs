//! 从系统网络配置发现 DHCP 下发的 DNS 服务器。
//!
//! `dhcp://<iface>` 形式的 nameserver 用这里的结果作为上游；
//! 各平台的获取途径不同：
//! - Linux: `resolvectl status <iface>`，退化为 /etc/resolv.conf
//! - macOS: `scutil --dns`
//! - Windows: `netsh interface ip show dns`

use std::net::IpAddr;

use anyhow::{bail, Result};
use tracing::debug;

/// 返回系统（或指定网卡）当前的 DNS 服务器列表
pub fn system_dns_servers(iface: Option<&str>) -> Result<Vec<IpAddr>> {
    let servers = discover(iface)?;
    if servers.is_empty() {
        bail!("no system DNS servers found");
    }
    debug!(count = servers.len(), iface = iface.unwrap_or("auto"), "system DNS discovered");
    Ok(servers)
}

#[cfg(target_os = "linux")]
fn discover(iface: Option<&str>) -> Result<Vec<IpAddr>> {
    // 优先 resolvectl（按接口过滤），失败退回 resolv.conf
    if let Some(iface) = iface {
        if let Ok(servers) = resolvectl_servers(iface) {
            if !servers.is_empty() {
                return Ok(servers);
            }
        }
    }
    resolv_conf_servers()
}

#[cfg(target_os = "linux")]
fn resolvectl_servers(iface: &str) -> Result<Vec<IpAddr>> {
    let output = std::process::Command::new("resolvectl")
        .args(["dns", iface])
        .output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut servers = Vec::new();
    for token in stdout.split_whitespace() {
        let candidate = token.split('%').next().unwrap_or(token);
        if let Ok(ip) = candidate.parse::<IpAddr>() {
            if !servers.contains(&ip) {
                servers.push(ip);
            }
        }
    }
    Ok(servers)
}

#[cfg(any(target_os = "linux", not(any(target_os = "windows", target_os = "macos"))))]
fn resolv_conf_servers() -> Result<Vec<IpAddr>> {
    let content = std::fs::read_to_string("/etc/resolv.conf").unwrap_or_default();
    let mut servers = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("nameserver") {
            let candidate = rest.trim();
            // 剥掉 IPv6 的 scope id
            let candidate = candidate.split('%').next().unwrap_or(candidate);
            if let Ok(ip) = candidate.parse::<IpAddr>() {
                if !servers.contains(&ip) {
                    servers.push(ip);
                }
            }
        }
    }
    Ok(servers)
}

#[cfg(target_os = "macos")]
fn discover(_iface: Option<&str>) -> Result<Vec<IpAddr>> {
    let output = std::process::Command::new("scutil").arg("--dns").output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut servers = Vec::new();
    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("nameserver[") {
            if let Some(pos) = trimmed.rfind(':') {
                if let Ok(ip) = trimmed[pos + 1..].trim().parse::<IpAddr>() {
                    if !servers.contains(&ip) {
                        servers.push(ip);
                    }
                }
            }
        }
    }
    Ok(servers)
}

#[cfg(target_os = "windows")]
fn discover(_iface: Option<&str>) -> Result<Vec<IpAddr>> {
    let output = std::process::Command::new("netsh")
        .args(["interface", "ip", "show", "dns"])
        .output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut servers = Vec::new();
    for line in stdout.lines() {
        let trimmed = line.trim();
        let candidate = trimmed
            .rsplit(|c: char| c.is_whitespace() || c == ':')
            .next()
            .unwrap_or("");
        if let Ok(ip) = candidate.parse::<IpAddr>() {
            if !servers.contains(&ip) {
                servers.push(ip);
            }
        }
    }
    Ok(servers)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn discover(_iface: Option<&str>) -> Result<Vec<IpAddr>> {
    resolv_conf_servers()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_does_not_panic() {
        // 环境里未必有可用配置，只要求不崩
        let _ = system_dns_servers(None);
        let _ = system_dns_servers(Some("auto"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resolv_conf_parse_smoke() {
        let _ = resolv_conf_servers();
    }
}
