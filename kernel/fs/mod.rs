//! Filesystems
//!
//! Two filesystem implementations sit behind one tagged dispatch type:
//! the ext2 driver over the boot RAM disk, and the synthetic device
//! filesystem exposing character devices. The VFS layer addresses them
//! by `FsId` (their index in the process-wide filesystem table).

pub mod devfs;
pub mod ext2;
pub mod pty;
pub mod vfs;

use crate::error::KernelResult;

/// Index into the process-wide filesystem table
pub type FsId = usize;

/// What a vnode refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    Regular,
    Directory,
    CharacterDevice,
}

/// Raw material for constructing (or refreshing) a vnode
#[derive(Debug, Clone, Copy)]
pub struct VnodeInfo {
    pub inode_num: u32,
    pub kind: VnodeKind,
    pub size: u64,
    /// Driver-owned value (device index for the device fs)
    pub context: usize,
}

/// A mounted filesystem instance
pub enum FileSystem {
    Ext2(ext2::Ext2Fs),
    Device(devfs::DeviceFs),
}

impl FileSystem {
    /// The filesystem's root directory
    pub fn root_info(&self) -> VnodeInfo {
        match self {
            FileSystem::Ext2(fs) => fs.root_info(),
            FileSystem::Device(fs) => fs.root_info(),
        }
    }

    /// Look a name up in a directory
    pub fn find_in_directory(&self, dir_inode: u32, name: &str) -> Option<VnodeInfo> {
        match self {
            FileSystem::Ext2(fs) => fs.find_in_directory(dir_inode, name),
            FileSystem::Device(fs) => fs.find_in_directory(dir_inode, name),
        }
    }

    /// Read from a file at a byte offset
    pub fn read(&self, info: &VnodeInfo, buf: &mut [u8], offset: u64) -> KernelResult<usize> {
        match self {
            FileSystem::Ext2(fs) => Ok(fs.read(info.inode_num, buf, offset)),
            FileSystem::Device(fs) => fs.read_device(info, buf),
        }
    }

    /// Write to a file at a byte offset
    pub fn write(&self, info: &VnodeInfo, buf: &[u8], offset: u64) -> KernelResult<usize> {
        match self {
            FileSystem::Ext2(fs) => Ok(fs.write(info.inode_num, buf, offset)),
            FileSystem::Device(fs) => fs.write_device(info, buf),
        }
    }

    /// Create a regular file in a directory
    pub fn create(&self, dir_inode: u32, name: &str) -> KernelResult<VnodeInfo> {
        match self {
            FileSystem::Ext2(fs) => fs.create(dir_inode, name),
            FileSystem::Device(fs) => fs.create(dir_inode, name),
        }
    }

    /// Cut a regular file to zero length
    pub fn truncate(&self, info: &VnodeInfo) -> KernelResult<()> {
        match self {
            FileSystem::Ext2(fs) => {
                fs.truncate(info.inode_num);
                Ok(())
            }
            FileSystem::Device(fs) => fs.truncate(info),
        }
    }

    /// Current file size
    pub fn size_of(&self, info: &VnodeInfo) -> u64 {
        match self {
            FileSystem::Ext2(fs) => fs.size_of(info.inode_num),
            FileSystem::Device(_) => 0,
        }
    }
}
