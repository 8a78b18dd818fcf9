//! Virtual filesystem layer
//!
//! Path resolution is absolute-only: the longest-matching mount prefix
//! selects a filesystem, then components descend via the filesystem's
//! directory lookup. Vnodes live in a process-wide cache keyed by
//! `(inode_num, fs)`; per-task descriptor tables hold `Arc` references
//! into it. Descriptor numbers are slot indices and allocation always
//! takes the lowest free slot.

use ::core::sync::atomic::{AtomicU64, Ordering};

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Once;

use crate::arch::IrqSpinlock;
use crate::error::{KernelError, KernelResult};
use crate::fs::{FileSystem, FsId, VnodeInfo, VnodeKind};

bitflags! {
    /// Open flags (POSIX meanings)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Create a regular file in the final directory if missing
        const CREATE = 1 << 0;
        /// Cut a regular file to zero length before returning
        const TRUNCATE = 1 << 1;
        /// Position the descriptor at the end of the file
        const APPEND = 1 << 2;
        /// Permit both reading and writing
        const READ_WRITE = 1 << 3;
    }
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekType {
    Set,
    Cursor,
    End,
}

impl SeekType {
    pub fn from_raw(raw: u64) -> KernelResult<Self> {
        match raw {
            0 => Ok(SeekType::Set),
            1 => Ok(SeekType::Cursor),
            2 => Ok(SeekType::End),
            _ => Err(KernelError::IoError),
        }
    }
}

/// In-memory handle for a filesystem object
#[derive(Debug)]
pub struct Vnode {
    pub inode_num: u32,
    pub fs: FsId,
    pub kind: VnodeKind,
    /// Cached file size, refreshed on writes and seeks
    pub size: AtomicU64,
    /// Driver-owned value (device index for the device fs)
    pub context: usize,
}

impl Vnode {
    fn from_info(fs: FsId, info: VnodeInfo) -> Self {
        Self {
            inode_num: info.inode_num,
            fs,
            kind: info.kind,
            size: AtomicU64::new(info.size),
            context: info.context,
        }
    }

    /// Dispatch material for the owning filesystem
    pub fn info(&self) -> VnodeInfo {
        VnodeInfo {
            inode_num: self.inode_num,
            kind: self.kind,
            size: self.size.load(Ordering::Relaxed),
            context: self.context,
        }
    }
}

/// One open file: descriptor number is the slot index in the table
#[derive(Clone)]
pub struct FileDescriptor {
    pub offset: u64,
    pub vnode: Arc<Vnode>,
    pub flags: OpenFlags,
}

/// Per-task descriptor table; fork clones it by value, sharing vnode
/// references but nothing else
#[derive(Clone, Default)]
pub struct FdTable {
    entries: Vec<Option<FileDescriptor>>,
}

impl FdTable {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Claim the lowest free slot
    fn insert(&mut self, descriptor: FileDescriptor) -> usize {
        for (index, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(descriptor);
                return index;
            }
        }
        self.entries.push(Some(descriptor));
        self.entries.len() - 1
    }

    pub fn get(&self, fd: usize) -> KernelResult<&FileDescriptor> {
        self.entries
            .get(fd)
            .and_then(|slot| slot.as_ref())
            .ok_or(KernelError::BadFileDescriptor)
    }

    pub fn get_mut(&mut self, fd: usize) -> KernelResult<&mut FileDescriptor> {
        self.entries
            .get_mut(fd)
            .and_then(|slot| slot.as_mut())
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Release a slot; closing a closed descriptor is an error but has
    /// no other effect
    pub fn close(&mut self, fd: usize) -> KernelResult<()> {
        match self.entries.get_mut(fd) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(KernelError::BadFileDescriptor),
        }
    }
}

/// Stat output, written to a user buffer by the Stat/FStat syscalls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct StatRecord {
    pub inode_num: u64,
    /// 0 regular, 1 directory, 2 character device
    pub kind: u64,
    pub size: u64,
}

fn kind_code(kind: VnodeKind) -> u64 {
    match kind {
        VnodeKind::Regular => 0,
        VnodeKind::Directory => 1,
        VnodeKind::CharacterDevice => 2,
    }
}

/// Path resolution outcome
#[derive(Debug)]
pub enum Resolved {
    /// The full path exists
    Found(Arc<Vnode>),
    /// Everything but the last component exists
    MissingFinal {
        parent: Arc<Vnode>,
        name: String,
    },
    /// An intermediate component is missing
    MissingIntermediate,
}

struct Mount {
    prefix: String,
    fs: FsId,
}

/// Mount table and vnode cache
pub struct Vfs {
    mounts: Vec<Mount>,
    cache: Vec<Arc<Vnode>>,
}

impl Vfs {
    pub const fn new() -> Self {
        Self {
            mounts: Vec::new(),
            cache: Vec::new(),
        }
    }

    /// Register a filesystem at a path prefix
    pub fn mount(&mut self, prefix: &str, fs: FsId) {
        self.mounts.push(Mount {
            prefix: String::from(prefix),
            fs,
        });
    }

    /// Longest-prefix mount match; returns the filesystem and the path
    /// remainder below the mount point
    fn select_mount<'p>(&self, path: &'p str) -> Option<(FsId, &'p str)> {
        let mut best: Option<(&Mount, &str)> = None;
        for mount in &self.mounts {
            let matches = if mount.prefix == "/" {
                true
            } else if let Some(rest) = path.strip_prefix(mount.prefix.as_str()) {
                rest.is_empty() || rest.starts_with('/')
            } else {
                false
            };
            if matches {
                let rest = if mount.prefix == "/" {
                    path
                } else {
                    &path[mount.prefix.len()..]
                };
                match best {
                    Some((current, _)) if current.prefix.len() >= mount.prefix.len() => {}
                    _ => best = Some((mount, rest)),
                }
            }
        }
        best.map(|(mount, rest)| (mount.fs, rest))
    }

    /// Cache lookup by `(inode_num, fs)`
    pub fn search_in_cache(&self, inode_num: u32, fs: FsId) -> Option<Arc<Vnode>> {
        self.cache
            .iter()
            .find(|vnode| vnode.inode_num == inode_num && vnode.fs == fs)
            .cloned()
    }

    /// Insert on first lookup, return the cached handle otherwise
    fn lookup_vnode(&mut self, fs: FsId, info: VnodeInfo) -> Arc<Vnode> {
        if let Some(cached) = self.search_in_cache(info.inode_num, fs) {
            return cached;
        }
        let vnode = Arc::new(Vnode::from_info(fs, info));
        self.cache.push(vnode.clone());
        vnode
    }

    /// Resolve an absolute path
    ///
    /// A missing intermediate component resolves to
    /// `MissingIntermediate` with no side effects.
    pub fn traverse_path(
        &mut self,
        filesystems: &[FileSystem],
        path: &str,
    ) -> KernelResult<Resolved> {
        if !path.starts_with('/') {
            return Err(KernelError::InvalidPath);
        }
        let (fs_id, remaining) = self.select_mount(path).ok_or(KernelError::InvalidPath)?;
        let fs = &filesystems[fs_id];

        let mut current = self.lookup_vnode(fs_id, fs.root_info());
        let components: Vec<&str> = remaining.split('/').filter(|c| !c.is_empty()).collect();

        for (index, component) in components.iter().enumerate() {
            if current.kind != VnodeKind::Directory {
                return Err(KernelError::NotADirectory);
            }
            match fs.find_in_directory(current.inode_num, component) {
                Some(info) => current = self.lookup_vnode(fs_id, info),
                None => {
                    return Ok(if index + 1 == components.len() {
                        Resolved::MissingFinal {
                            parent: current,
                            name: component.to_string(),
                        }
                    } else {
                        Resolved::MissingIntermediate
                    });
                }
            }
        }

        Ok(Resolved::Found(current))
    }

    /// Open a path into the lowest free descriptor slot
    pub fn open(
        &mut self,
        filesystems: &[FileSystem],
        fds: &mut FdTable,
        path: &str,
        flags: OpenFlags,
    ) -> KernelResult<usize> {
        let vnode = match self.traverse_path(filesystems, path)? {
            Resolved::Found(vnode) => vnode,
            Resolved::MissingFinal { parent, name } => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(KernelError::NoSuchFile);
                }
                let info = filesystems[parent.fs].create(parent.inode_num, &name)?;
                self.lookup_vnode(parent.fs, info)
            }
            Resolved::MissingIntermediate => return Err(KernelError::NoSuchFile),
        };

        if flags.contains(OpenFlags::TRUNCATE) && vnode.kind == VnodeKind::Regular {
            filesystems[vnode.fs].truncate(&vnode.info())?;
            vnode.size.store(0, Ordering::Relaxed);
        }

        let offset = if flags.contains(OpenFlags::APPEND) {
            filesystems[vnode.fs].size_of(&vnode.info())
        } else {
            0
        };

        Ok(fds.insert(FileDescriptor {
            offset,
            vnode,
            flags,
        }))
    }

    /// Stat by path
    pub fn stat_path(
        &mut self,
        filesystems: &[FileSystem],
        path: &str,
    ) -> KernelResult<StatRecord> {
        match self.traverse_path(filesystems, path)? {
            Resolved::Found(vnode) => Ok(StatRecord {
                inode_num: vnode.inode_num as u64,
                kind: kind_code(vnode.kind),
                size: filesystems[vnode.fs].size_of(&vnode.info()),
            }),
            _ => Err(KernelError::NoSuchFile),
        }
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

// =========================================================================
// Descriptor-level operations
//
// These need only the task's own table and the immutable filesystem
// list, so they run without the VFS lock; a terminal read may suspend
// the calling task without stalling path resolution on other cores.
// =========================================================================

/// Read at the descriptor's offset, advancing it
pub fn read_with(
    filesystems: &[FileSystem],
    fds: &mut FdTable,
    fd: usize,
    buf: &mut [u8],
) -> KernelResult<usize> {
    let (vnode, offset) = {
        let descriptor = fds.get(fd)?;
        (descriptor.vnode.clone(), descriptor.offset)
    };

    let count = filesystems[vnode.fs].read(&vnode.info(), buf, offset)?;
    fds.get_mut(fd)?.offset += count as u64;
    Ok(count)
}

/// Write at the descriptor's offset, advancing it
pub fn write_with(
    filesystems: &[FileSystem],
    fds: &mut FdTable,
    fd: usize,
    buf: &[u8],
) -> KernelResult<usize> {
    let (vnode, offset) = {
        let descriptor = fds.get(fd)?;
        (descriptor.vnode.clone(), descriptor.offset)
    };

    let count = filesystems[vnode.fs].write(&vnode.info(), buf, offset)?;
    if vnode.kind == VnodeKind::Regular {
        vnode.size.store(
            filesystems[vnode.fs].size_of(&vnode.info()),
            Ordering::Relaxed,
        );
    }
    fds.get_mut(fd)?.offset += count as u64;
    Ok(count)
}

/// Reposition a descriptor; seeking a regular file past its end
/// zero-fill-extends it
pub fn seek_with(
    filesystems: &[FileSystem],
    fds: &mut FdTable,
    fd: usize,
    offset: i64,
    seek: SeekType,
) -> KernelResult<u64> {
    let (vnode, current) = {
        let descriptor = fds.get(fd)?;
        (descriptor.vnode.clone(), descriptor.offset)
    };
    let size = filesystems[vnode.fs].size_of(&vnode.info());

    let base = match seek {
        SeekType::Set => 0,
        SeekType::Cursor => current,
        SeekType::End => size,
    };
    let new_offset = base
        .checked_add_signed(offset)
        .ok_or(KernelError::IoError)?;

    if new_offset > size && vnode.kind == VnodeKind::Regular {
        filesystems[vnode.fs].write(&vnode.info(), &[], new_offset)?;
        vnode.size.store(new_offset, Ordering::Relaxed);
    }

    fds.get_mut(fd)?.offset = new_offset;
    Ok(new_offset)
}

/// Stat by descriptor
pub fn fstat_with(
    filesystems: &[FileSystem],
    fds: &FdTable,
    fd: usize,
) -> KernelResult<StatRecord> {
    let vnode = &fds.get(fd)?.vnode;
    Ok(StatRecord {
        inode_num: vnode.inode_num as u64,
        kind: kind_code(vnode.kind),
        size: filesystems[vnode.fs].size_of(&vnode.info()),
    })
}

// =========================================================================
// Process-wide instance
// =========================================================================

static FILESYSTEMS: Once<Vec<FileSystem>> = Once::new();
static VFS: IrqSpinlock<Vfs> = IrqSpinlock::new(Vfs::new());

/// The immutable filesystem table (populated once at boot)
pub fn filesystems() -> &'static [FileSystem] {
    FILESYSTEMS.get().expect("VFS not initialized")
}

/// Mount the boot filesystems: ext2 on `/`, devices on `/dev`
pub fn init(ramdisk_base: u64, ramdisk_size: u64) {
    FILESYSTEMS.call_once(|| {
        let mut list = Vec::new();
        list.push(FileSystem::Ext2(crate::fs::ext2::Ext2Fs::new(
            ramdisk_base,
            ramdisk_size,
        )));
        list.push(FileSystem::Device(crate::fs::devfs::DeviceFs::new()));
        list
    });

    let mut vfs = VFS.lock();
    vfs.mount("/", 0);
    vfs.mount("/dev", 1);
}

pub fn open(fds: &mut FdTable, path: &str, flags: OpenFlags) -> KernelResult<usize> {
    VFS.lock().open(filesystems(), fds, path, flags)
}

pub fn read(fds: &mut FdTable, fd: usize, buf: &mut [u8]) -> KernelResult<usize> {
    read_with(filesystems(), fds, fd, buf)
}

pub fn write(fds: &mut FdTable, fd: usize, buf: &[u8]) -> KernelResult<usize> {
    write_with(filesystems(), fds, fd, buf)
}

pub fn seek(fds: &mut FdTable, fd: usize, offset: i64, seek: SeekType) -> KernelResult<u64> {
    seek_with(filesystems(), fds, fd, offset, seek)
}

pub fn close(fds: &mut FdTable, fd: usize) -> KernelResult<()> {
    fds.close(fd)
}

pub fn stat(path: &str) -> KernelResult<StatRecord> {
    VFS.lock().stat_path(filesystems(), path)
}

pub fn fstat(fds: &FdTable, fd: usize) -> KernelResult<StatRecord> {
    fstat_with(filesystems(), fds, fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ext2::test_image::ImageBuilder;

    fn fixture() -> (Vec<FileSystem>, Vfs) {
        let mut filesystems = Vec::new();
        filesystems.push(FileSystem::Ext2(ImageBuilder::new(true).build()));
        filesystems.push(FileSystem::Device(crate::fs::devfs::DeviceFs::new()));
        let mut vfs = Vfs::new();
        vfs.mount("/", 0);
        vfs.mount("/dev", 1);
        (filesystems, vfs)
    }

    #[test]
    fn test_traverse_existing_path() {
        let (filesystems, mut vfs) = fixture();
        match vfs.traverse_path(&filesystems, "/subdirectory-bravo/bar.txt") {
            Ok(Resolved::Found(vnode)) => {
                assert_eq!(vnode.inode_num, 13);
                assert_eq!(vnode.kind, VnodeKind::Regular);
            }
            _ => panic!("expected the path to resolve"),
        }
    }

    #[test]
    fn test_traverse_missing_components() {
        let (filesystems, mut vfs) = fixture();
        assert!(matches!(
            vfs.traverse_path(&filesystems, "/nope.txt"),
            Ok(Resolved::MissingFinal { .. })
        ));
        assert!(matches!(
            vfs.traverse_path(&filesystems, "/missing-dir/bar.txt"),
            Ok(Resolved::MissingIntermediate)
        ));
        assert_eq!(
            vfs.traverse_path(&filesystems, "relative").unwrap_err(),
            KernelError::InvalidPath
        );
        assert_eq!(
            vfs.traverse_path(&filesystems, "/foo.txt/below").unwrap_err(),
            KernelError::NotADirectory
        );
    }

    #[test]
    fn test_mount_prefix_selection() {
        let (filesystems, mut vfs) = fixture();
        match vfs.traverse_path(&filesystems, "/dev/tty") {
            Ok(Resolved::Found(vnode)) => {
                assert_eq!(vnode.fs, 1);
                assert_eq!(vnode.kind, VnodeKind::CharacterDevice);
            }
            _ => panic!("expected /dev/tty to resolve"),
        }
    }

    #[test]
    fn test_open_read_full_file() {
        let (filesystems, mut vfs) = fixture();
        let mut fds = FdTable::new();

        let fd = vfs
            .open(&filesystems, &mut fds, "/subdirectory-bravo/bar.txt", OpenFlags::empty())
            .unwrap();
        let mut buf = [0u8; 99];
        let n = read_with(&filesystems, &mut fds, fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"bar contents\n");

        // Offset advanced to the end; another read returns nothing
        assert_eq!(read_with(&filesystems, &mut fds, fd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_lowest_slot_and_reuse_after_close() {
        let (filesystems, mut vfs) = fixture();
        let mut fds = FdTable::new();

        let a = vfs.open(&filesystems, &mut fds, "/foo.txt", OpenFlags::empty()).unwrap();
        let b = vfs.open(&filesystems, &mut fds, "/foo.txt", OpenFlags::empty()).unwrap();
        let c = vfs.open(&filesystems, &mut fds, "/foo.txt", OpenFlags::empty()).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        fds.close(b).unwrap();
        let again = vfs.open(&filesystems, &mut fds, "/foo.txt", OpenFlags::empty()).unwrap();
        assert_eq!(again, b);
    }

    #[test]
    fn test_close_is_an_error_when_already_closed() {
        let (filesystems, mut vfs) = fixture();
        let mut fds = FdTable::new();
        let fd = vfs.open(&filesystems, &mut fds, "/foo.txt", OpenFlags::empty()).unwrap();
        fds.close(fd).unwrap();
        assert_eq!(fds.close(fd).unwrap_err(), KernelError::BadFileDescriptor);
        assert_eq!(fds.close(99).unwrap_err(), KernelError::BadFileDescriptor);
    }

    #[test]
    fn test_create_flag() {
        let (filesystems, mut vfs) = fixture();
        let mut fds = FdTable::new();

        assert_eq!(
            vfs.open(&filesystems, &mut fds, "/new.txt", OpenFlags::empty())
                .unwrap_err(),
            KernelError::NoSuchFile
        );

        let fd = vfs
            .open(&filesystems, &mut fds, "/new.txt", OpenFlags::CREATE)
            .unwrap();
        write_with(&filesystems, &mut fds, fd, b"created").unwrap();

        // Resolves without CREATE afterwards
        let fd2 = vfs.open(&filesystems, &mut fds, "/new.txt", OpenFlags::empty()).unwrap();
        let mut buf = [0u8; 16];
        let n = read_with(&filesystems, &mut fds, fd2, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"created");

        // A missing intermediate directory cannot be created through
        assert_eq!(
            vfs.open(&filesystems, &mut fds, "/no-dir/new.txt", OpenFlags::CREATE)
                .unwrap_err(),
            KernelError::NoSuchFile
        );
    }

    #[test]
    fn test_truncate_flag() {
        let (filesystems, mut vfs) = fixture();
        let mut fds = FdTable::new();
        let fd = vfs
            .open(&filesystems, &mut fds, "/foo.txt", OpenFlags::TRUNCATE)
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(read_with(&filesystems, &mut fds, fd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_append_flag() {
        let (filesystems, mut vfs) = fixture();
        let mut fds = FdTable::new();
        let fd = vfs
            .open(&filesystems, &mut fds, "/foo.txt", OpenFlags::APPEND)
            .unwrap();
        write_with(&filesystems, &mut fds, fd, b"more").unwrap();

        seek_with(&filesystems, &mut fds, fd, 0, SeekType::Set).unwrap();
        let mut buf = [0u8; 32];
        let n = read_with(&filesystems, &mut fds, fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello from foo!\nmore");
    }

    #[test]
    fn test_seek_past_end_extends_with_zeros() {
        let (filesystems, mut vfs) = fixture();
        let mut fds = FdTable::new();
        let fd = vfs.open(&filesystems, &mut fds, "/foo.txt", OpenFlags::empty()).unwrap();

        let end = seek_with(&filesystems, &mut fds, fd, 4, SeekType::End).unwrap();
        assert_eq!(end, 20);
        let stat = fstat_with(&filesystems, &fds, fd).unwrap();
        assert_eq!(stat.size, 20);

        seek_with(&filesystems, &mut fds, fd, 16, SeekType::Set).unwrap();
        let mut buf = [0u8; 8];
        let n = read_with(&filesystems, &mut fds, fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_fork_clones_table_by_value() {
        let (filesystems, mut vfs) = fixture();
        let mut parent = FdTable::new();
        let fd = vfs.open(&filesystems, &mut parent, "/foo.txt", OpenFlags::empty()).unwrap();

        let mut child = parent.clone();

        // Vnode reference shared, offsets independent
        assert!(Arc::ptr_eq(
            &parent.get(fd).unwrap().vnode,
            &child.get(fd).unwrap().vnode
        ));
        let mut buf = [0u8; 5];
        read_with(&filesystems, &mut child, fd, &mut buf).unwrap();
        assert_eq!(child.get(fd).unwrap().offset, 5);
        assert_eq!(parent.get(fd).unwrap().offset, 0);
    }

    #[test]
    fn test_vnode_cache_deduplicates() {
        let (filesystems, mut vfs) = fixture();
        let mut fds = FdTable::new();
        let a = vfs.open(&filesystems, &mut fds, "/foo.txt", OpenFlags::empty()).unwrap();
        let b = vfs.open(&filesystems, &mut fds, "/foo.txt", OpenFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(
            &fds.get(a).unwrap().vnode,
            &fds.get(b).unwrap().vnode
        ));
        assert!(vfs.search_in_cache(11, 0).is_some());
        assert!(vfs.search_in_cache(99, 0).is_none());
    }

    #[test]
    fn test_stat_by_path() {
        let (filesystems, mut vfs) = fixture();
        let record = vfs.stat_path(&filesystems, "/foo.txt").unwrap();
        assert_eq!(record.inode_num, 11);
        assert_eq!(record.kind, 0);
        assert_eq!(record.size, 16);

        let dir = vfs.stat_path(&filesystems, "/subdirectory-bravo").unwrap();
        assert_eq!(dir.kind, 1);
    }
}
