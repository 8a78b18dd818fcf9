//! Device filesystem
//!
//! Synthetic root directory holding one vnode per character device. The
//! device list is fixed at construction and never changes afterwards,
//! so lookups are lock-free. Creating or truncating device nodes is not
//! permitted.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::fs::{VnodeInfo, VnodeKind};
use crate::fs::pty;

/// Inode number of the synthetic root directory
pub const DEVFS_ROOT_INODE: u32 = 1;

/// Registered character device kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Terminal,
}

struct Device {
    name: String,
    inode_num: u32,
    kind: DeviceKind,
}

pub struct DeviceFs {
    devices: Vec<Device>,
}

impl DeviceFs {
    /// Build the device list: inode 1 is the root, devices follow
    pub fn new() -> Self {
        Self {
            devices: alloc::vec![Device {
                name: String::from("tty"),
                inode_num: 2,
                kind: DeviceKind::Terminal,
            }],
        }
    }

    pub fn root_info(&self) -> VnodeInfo {
        VnodeInfo {
            inode_num: DEVFS_ROOT_INODE,
            kind: VnodeKind::Directory,
            size: 0,
            context: 0,
        }
    }

    /// Look a device up by name; only the root directory has entries
    pub fn find_in_directory(&self, dir_inode: u32, name: &str) -> Option<VnodeInfo> {
        assert!(dir_inode == DEVFS_ROOT_INODE, "devfs has a flat namespace");

        self.devices
            .iter()
            .enumerate()
            .find(|(_, device)| device.name == name)
            .map(|(index, device)| VnodeInfo {
                inode_num: device.inode_num,
                kind: VnodeKind::CharacterDevice,
                size: 0,
                context: index,
            })
    }

    fn device(&self, info: &VnodeInfo) -> &Device {
        &self.devices[info.context]
    }

    /// Read from a device (may block the calling task)
    pub fn read_device(&self, info: &VnodeInfo, buf: &mut [u8]) -> KernelResult<usize> {
        match self.device(info).kind {
            DeviceKind::Terminal => Ok(pty::read(buf)),
        }
    }

    /// Write to a device
    pub fn write_device(&self, info: &VnodeInfo, buf: &[u8]) -> KernelResult<usize> {
        match self.device(info).kind {
            DeviceKind::Terminal => Ok(pty::write(buf)),
        }
    }

    /// Devices cannot be created at runtime
    pub fn create(&self, _dir_inode: u32, _name: &str) -> KernelResult<VnodeInfo> {
        Err(KernelError::PermissionDenied)
    }

    /// Devices cannot be truncated
    pub fn truncate(&self, _info: &VnodeInfo) -> KernelResult<()> {
        Err(KernelError::PermissionDenied)
    }
}

impl Default for DeviceFs {
    fn default() -> Self {
        Self::new()
    }
}
