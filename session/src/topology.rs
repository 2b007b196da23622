use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Result;
use crate::error::SessionError;

pub const KFD_SYSFS_TOPOLOGY_PATH: &str = "/sys/devices/virtual/kfd/kfd/topology";

/// Platform-wide facts published by the driver alongside the node list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemProperties {
    pub num_nodes: u32,
    pub platform_oem: u64,
    pub platform_id: u64,
    pub platform_rev: u64,
}

/// Source of the hardware node inventory.
pub trait Topology: Send + Sync {
    fn system_properties(&self) -> Result<SystemProperties>;
}

/// Reads the inventory from the driver's sysfs tree.
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl SysfsTopology {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_properties(&self) -> io::Result<SystemProperties> {
        let mut props = parse_system_properties(&fs::read_to_string(
            self.root.join("system_properties"),
        )?);
        props.num_nodes = count_nodes(&self.root.join("nodes"))?;
        Ok(props)
    }
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new(KFD_SYSFS_TOPOLOGY_PATH)
    }
}

impl Topology for SysfsTopology {
    fn system_properties(&self) -> Result<SystemProperties> {
        self.read_properties().map_err(SessionError::Topology)
    }
}

/// Parses `key value` lines. Unknown keys and malformed values are skipped.
fn parse_system_properties(contents: &str) -> SystemProperties {
    let mut props = SystemProperties::default();
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "platform_oem" => props.platform_oem = value,
            "platform_id" => props.platform_id = value,
            "platform_rev" => props.platform_rev = value,
            _ => {}
        }
    }
    props
}

fn count_nodes(nodes_dir: &Path) -> io::Result<u32> {
    let mut count = 0u32;
    for entry in fs::read_dir(nodes_dir)? {
        let entry = entry?;
        let is_node = entry
            .file_name()
            .to_str()
            .is_some_and(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()));
        if is_node {
            count += 1;
        }
    }
    Ok(count)
}
