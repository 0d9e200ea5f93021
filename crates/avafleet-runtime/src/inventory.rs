//! Ansible-style static inventory: one host per line,
//! `<inventory id> key=value ...`. Written for every cluster so operators
//! can point their own tooling at it; read back by the gateway.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};

use avafleet_core::node::{DEFAULT_API_PORT, Host};

const HOST_KEY: &str = "ansible_host";
const USER_KEY: &str = "ansible_user";
const KEY_FILE_KEY: &str = "ansible_ssh_private_key_file";
const COMMON_ARGS_KEY: &str = "ansible_ssh_common_args";
const API_PORT_KEY: &str = "avalanchego_http_port";

/// Render hosts as inventory text.
pub fn render(hosts: &[Host]) -> String {
    let mut out = String::new();
    for host in hosts {
        out.push_str(&host.node_id);
        out.push_str(&format!(" {}={}", HOST_KEY, host.ip));
        out.push_str(&format!(" {}={}", USER_KEY, host.ssh_user));
        if !host.ssh_private_key_path.is_empty() {
            out.push_str(&format!(" {}={}", KEY_FILE_KEY, host.ssh_private_key_path));
        }
        if !host.ssh_common_args.is_empty() {
            out.push_str(&format!(" {}='{}'", COMMON_ARGS_KEY, host.ssh_common_args));
        }
        if host.api_port != DEFAULT_API_PORT {
            out.push_str(&format!(" {}={}", API_PORT_KEY, host.api_port));
        }
        out.push('\n');
    }
    out
}

/// Parse inventory text back into hosts.
pub fn parse(content: &str) -> Result<Vec<Host>> {
    let mut hosts = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        let (node_id, rest) = line.split_once(' ').unwrap_or((line, ""));
        let vars = parse_vars(rest)
            .with_context(|| format!("Invalid inventory line {}: {}", lineno + 1, line))?;
        let ip = vars
            .get(HOST_KEY)
            .with_context(|| format!("Inventory host {} has no {}", node_id, HOST_KEY))?;
        let api_port = match vars.get(API_PORT_KEY) {
            Some(p) => p
                .parse()
                .with_context(|| format!("Invalid {} for {}: {}", API_PORT_KEY, node_id, p))?,
            None => DEFAULT_API_PORT,
        };
        hosts.push(Host {
            node_id: node_id.to_string(),
            ip: ip.clone(),
            ssh_user: vars.get(USER_KEY).cloned().unwrap_or_default(),
            ssh_private_key_path: vars.get(KEY_FILE_KEY).cloned().unwrap_or_default(),
            ssh_common_args: vars.get(COMMON_ARGS_KEY).cloned().unwrap_or_default(),
            api_port,
        });
    }
    Ok(hosts)
}

fn parse_vars(s: &str) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .with_context(|| format!("Expected key=value near {:?}", rest))?;
        let key = rest[..eq].trim().to_string();
        let after = &rest[eq + 1..];
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('\'') {
            let end = quoted
                .find('\'')
                .with_context(|| format!("Unterminated quote for {}", key))?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            let end = after.find(' ').unwrap_or(after.len());
            (&after[..end], &after[end..])
        };
        vars.insert(key, value.to_string());
        rest = remaining.trim_start();
    }
    Ok(vars)
}

/// Write an inventory file, creating its directory.
pub fn write(path: &Path, hosts: &[Host]) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create inventory dir: {}", dir.display()))?;
    }
    std::fs::write(path, render(hosts))
        .with_context(|| format!("Failed to write inventory: {}", path.display()))
}

/// Read an inventory file.
pub fn read(path: &Path) -> Result<Vec<Host>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read inventory: {}", path.display()))?;
    parse(&content)
}
