// Shared fixtures for integration tests
//
// A data directory with role scripts, and a network tool that records
// its calls instead of touching the host's namespaces.

#![allow(dead_code)]

use sockprobe::config::{SuiteConfig, Timeouts};
use sockprobe::error::SetupError;
use sockprobe::netns::NetworkTool;
use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;

/// Network tool that runs commands unwrapped and logs every call
#[derive(Default)]
pub struct RecordingNetwork {
    pub calls: RefCell<Vec<String>>,
    pub fail_on_veth: bool,
}

impl RecordingNetwork {
    pub fn failing_veth() -> Self {
        Self {
            fail_on_veth: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn log(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }
}

impl NetworkTool for RecordingNetwork {
    fn add_namespace(&self, ns: &str) -> Result<(), SetupError> {
        self.log(format!("add {}", ns));
        Ok(())
    }

    fn delete_namespace(&self, ns: &str) {
        self.log(format!("delete {}", ns));
    }

    fn add_veth(&self, ns1: &str, ns2: &str) -> Result<(), SetupError> {
        self.log(format!("veth {} {}", ns1, ns2));
        if self.fail_on_veth {
            return Err(SetupError::CommandFailed {
                command: format!("ip link add dev {} type veth peer name {}", ns1, ns2),
                status: "exit status: 2".to_string(),
            });
        }
        Ok(())
    }

    fn add_address(&self, ns: &str, link: &str, address: &str) -> Result<(), SetupError> {
        self.log(format!("address {} {} {}", ns, link, address));
        Ok(())
    }

    fn drop_outbound_ipv6(&self, ns: &str) -> Result<(), SetupError> {
        self.log(format!("drop {}", ns));
        Ok(())
    }

    fn exec_command(&self, _ns: &str, command: Vec<String>) -> Vec<String> {
        command
    }
}

/// Data directory laid out as `testcases/client-server/<name>/<role>`
pub struct DataDir {
    pub dir: TempDir,
}

impl DataDir {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("testcases").join("client-server")).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn testcase(&self, name: &str) -> &Self {
        fs::create_dir_all(self.path().join("testcases").join("client-server").join(name)).unwrap();
        self
    }

    /// Write an executable shell script for one role
    pub fn script(&self, testcase: &str, role: &str, body: &str) -> &Self {
        self.testcase(testcase);
        let path = self
            .path()
            .join("testcases")
            .join("client-server")
            .join(testcase)
            .join(role);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        self
    }

    pub fn deps(&self, testcase: &str, deps: &str) -> &Self {
        self.testcase(testcase);
        fs::write(
            self.path()
                .join("testcases")
                .join("client-server")
                .join(testcase)
                .join("deps"),
            deps,
        )
        .unwrap();
        self
    }

    /// Configuration without a wrapper and with short deadlines
    pub fn config(&self) -> SuiteConfig {
        SuiteConfig {
            data_dir: self.path().to_path_buf(),
            wrapper: None,
            timeouts: Timeouts {
                server_listen: 0.5,
                second_listen: 0.2,
                client: 2.0,
            },
            ..SuiteConfig::default()
        }
    }
}
