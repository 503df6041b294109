//! Network namespace provisioning through the `ip` tool

use std::process::Command;
use tracing::{debug, warn};

use crate::error::SetupError;

/// Operations needed to build a scenario's topology
pub trait NetworkTool {
    /// Create a fresh namespace with loopback up, replacing any leftover one
    fn add_namespace(&self, ns: &str) -> Result<(), SetupError>;

    /// Best-effort removal
    fn delete_namespace(&self, ns: &str);

    /// Link two namespaces with a veth pair named after them
    fn add_veth(&self, ns1: &str, ns2: &str) -> Result<(), SetupError>;

    fn add_address(&self, ns: &str, link: &str, address: &str) -> Result<(), SetupError>;

    /// Drop every outgoing IPv6 packet inside the namespace
    fn drop_outbound_ipv6(&self, ns: &str) -> Result<(), SetupError>;

    /// Command line running `command` inside the namespace
    fn exec_command(&self, ns: &str, command: Vec<String>) -> Vec<String>;
}

/// `ip`/`ip6tables` based implementation
#[derive(Debug, Clone)]
pub struct IpTool {
    ip: String,
    ip6tables: String,
}

impl Default for IpTool {
    fn default() -> Self {
        Self::with_programs("ip", "ip6tables")
    }
}

impl IpTool {
    pub fn with_programs(ip: impl Into<String>, ip6tables: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ip6tables: ip6tables.into(),
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<(), SetupError> {
        let command = format!("{} {}", program, args.join(" "));
        debug!("Running {}", command);

        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|source| SetupError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !status.success() {
            return Err(SetupError::CommandFailed {
                command,
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

impl NetworkTool for IpTool {
    fn add_namespace(&self, ns: &str) -> Result<(), SetupError> {
        self.delete_namespace(ns);
        self.run(&self.ip, &["netns", "add", ns])?;
        self.run(&self.ip, &["-n", ns, "link", "set", "lo", "up"])
    }

    fn delete_namespace(&self, ns: &str) {
        if let Err(e) = self.run(&self.ip, &["netns", "delete", ns]) {
            debug!("Ignoring namespace deletion failure: {}", e);
        }
    }

    fn add_veth(&self, ns1: &str, ns2: &str) -> Result<(), SetupError> {
        self.run(
            &self.ip,
            &["link", "add", "dev", ns1, "type", "veth", "peer", "name", ns2],
        )?;
        for (ns, link) in [(ns1, ns1), (ns2, ns2)] {
            self.run(&self.ip, &["link", "set", link, "netns", ns, "up"])?;
        }
        Ok(())
    }

    fn add_address(&self, ns: &str, link: &str, address: &str) -> Result<(), SetupError> {
        self.run(&self.ip, &["-n", ns, "address", "add", address, "dev", link])
    }

    fn drop_outbound_ipv6(&self, ns: &str) -> Result<(), SetupError> {
        self.run(
            &self.ip,
            &["netns", "exec", ns, &self.ip6tables, "-A", "OUTPUT", "-j", "DROP"],
        )
    }

    fn exec_command(&self, ns: &str, command: Vec<String>) -> Vec<String> {
        let mut full = vec![
            self.ip.clone(),
            "netns".to_string(),
            "exec".to_string(),
            ns.to_string(),
        ];
        full.extend(command);
        full
    }
}

/// Namespaces owned by one scenario run, deleted when dropped
pub struct Namespaces<'t> {
    tool: &'t dyn NetworkTool,
    names: Vec<String>,
}

impl<'t> Namespaces<'t> {
    pub fn new(tool: &'t dyn NetworkTool) -> Self {
        Self {
            tool,
            names: Vec::new(),
        }
    }

    /// Create a namespace; it is released on drop even if creation fails
    pub fn add(&mut self, ns: &str) -> Result<(), SetupError> {
        self.names.push(ns.to_string());
        self.tool.add_namespace(ns)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Drop for Namespaces<'_> {
    fn drop(&mut self) {
        for ns in self.names.drain(..) {
            self.tool.delete_namespace(&ns);
        }
        if std::thread::panicking() {
            warn!("Namespaces released while unwinding");
        }
    }
}
