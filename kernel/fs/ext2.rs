//! Ext2 driver over the boot RAM disk
//!
//! Read path plus in-place overwrite and grow-by-zero-fill. Block and
//! inode allocation work against the bitmaps inside the in-memory image;
//! nothing is journaled and nothing is written back to any other store.
//! A corrupted superblock is a fatal assertion at mount.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::IrqSpinlock;
use crate::error::{KernelError, KernelResult};
use crate::fs::{VnodeInfo, VnodeKind};

/// Superblock magic
const EXT2_SIGNATURE: u16 = 0xEF53;

/// Root directory inode number (inodes are indexed from 1)
pub const ROOT_INODE: u32 = 2;

/// Required-feature bit: directory entries carry a file type byte
const FEATURE_DIRENT_FILETYPE: u32 = 0x2;

/// Inode type bits
const TYPE_REGULAR: u16 = 0x8000;
const TYPE_DIRECTORY: u16 = 0x4000;
const TYPE_CHAR_DEVICE: u16 = 0x2000;

/// Direct block pointers per inode
const DIRECT_POINTERS: u64 = 12;

/// On-disk superblock, at byte offset 1024
#[derive(Clone, Copy)]
#[repr(C)]
#[allow(dead_code)]
struct Superblock {
    inodes_count: u32,
    blocks_count: u32,
    superuser_reserved_blocks_count: u32,
    unallocated_blocks_count: u32,
    unallocated_inodes_count: u32,
    /// Block containing the superblock (also the first data block)
    superblock_block: u32,
    /// 1024 << n = block size
    block_size_log2_minus_10: u32,
    fragment_size_log2_minus_10: u32,
    blocks_per_block_group: u32,
    fragments_per_block_group: u32,
    inodes_per_block_group: u32,
    last_mount_time: u32,
    last_written_time: u32,
    volume_mounted_count: u16,
    mounts_allowed_before_consistency_check: u16,
    ext2_signature: u16,
    file_system_state: u16,
    error_handling_method: u16,
    minor_version: u16,
    last_consistency_check_time: u32,
    forced_consistency_checks_interval: u32,
    origin_operating_system_id: u32,
    major_version: u32,
    reserved_blocks_user_id: u16,
    reserved_blocks_group_id: u16,

    // Extended superblock fields
    first_non_reserved_inode: u32,
    inode_size: u16,
    superblock_block_group: u16,
    optional_features: u32,
    required_features: u32,
    read_only_features: u32,
}

/// On-disk block group descriptor
#[derive(Clone, Copy)]
#[repr(C)]
#[allow(dead_code)]
struct BlockGroupDescriptor {
    block_usage_bitmap_block: u32,
    inode_usage_bitmap_block: u32,
    inode_table_start_block: u32,
    unallocated_blocks_count: u16,
    unallocated_inodes_count: u16,
    directories_count: u16,
    unused: [u8; 14],
}

/// On-disk inode
#[derive(Clone, Copy)]
#[repr(C)]
#[allow(dead_code)]
struct Inode {
    type_permissions: u16,
    user_id: u16,
    size0: u32,
    last_access_time: u32,
    creation_time: u32,
    last_modification_time: u32,
    deletion_time: u32,
    group_id: u16,
    hard_link_count: u16,
    disk_sector_count: u32,
    flags: u32,
    os_specific1: u32,
    block_ptrs: [u32; 15],
    generation: u32,
    extended_attribute_block: u32,
    size1_or_dir_acl: u32,
    fragment_block: u32,
    os_specific2: [u8; 12],
}

/// Fixed leading part of a directory entry; the name follows inline
#[derive(Clone, Copy)]
#[repr(C)]
struct DirectoryEntryHead {
    inode_num: u32,
    entry_size: u16,
    /// Name length least-significant 8 bits
    name_length: u8,
    /// Type indicator, or name length most-significant 8 bits when the
    /// filetype feature is not set
    type_indicator: u8,
}

/// The ext2 filesystem over a contiguous memory image
pub struct Ext2Fs {
    base: u64,
    size: u64,
    block_size: u64,
    inodes_per_group: u32,
    blocks_per_group: u32,
    inode_size: u64,
    first_data_block: u32,
    block_group_count: u32,
    bgdt_offset: u64,
    dirent_has_filetype: bool,
    lock: IrqSpinlock<()>,
}

// Safety: all image access is serialized by `lock`; the raw base pointer
// is valid for the kernel's lifetime.
unsafe impl Send for Ext2Fs {}
unsafe impl Sync for Ext2Fs {}

impl Ext2Fs {
    /// Mount the image at `base`
    ///
    /// # Panics
    /// Bad magic or a dirty filesystem state halts the kernel; there
    /// is no recovery path for a corrupt superblock.
    pub fn new(base: u64, size: u64) -> Self {
        assert!(size >= 2048, "ext2 image too small for a superblock");
        let sb: Superblock =
            unsafe { ::core::ptr::read_unaligned((base + 1024) as *const Superblock) };

        assert!(sb.ext2_signature == EXT2_SIGNATURE, "invalid ext2 signature");
        assert!(sb.file_system_state == 1, "ext2 filesystem state is not clean");

        let block_size = 1024u64 << sb.block_size_log2_minus_10;

        let block_group_count =
            sb.blocks_count / sb.blocks_per_block_group
                + if sb.blocks_count % sb.blocks_per_block_group > 0 {
                    1
                } else {
                    0
                };
        let check = sb.inodes_count / sb.inodes_per_block_group
            + if sb.inodes_count % sb.inodes_per_block_group > 0 {
                1
            } else {
                0
            };
        assert!(
            block_group_count == check,
            "ext2 block group count could not be calculated"
        );

        // Version 1+ has the extended superblock; older images fix the
        // inode size at 128
        let inode_size = if sb.major_version >= 1 {
            sb.inode_size as u64
        } else {
            128
        };

        let fs = Self {
            base,
            size,
            block_size,
            inodes_per_group: sb.inodes_per_block_group,
            blocks_per_group: sb.blocks_per_block_group,
            inode_size,
            first_data_block: sb.superblock_block,
            block_group_count,
            bgdt_offset: block_size * if block_size == 1024 { 2 } else { 1 },
            dirent_has_filetype: sb.required_features & FEATURE_DIRENT_FILETYPE != 0,
            lock: IrqSpinlock::new(()),
        };

        printkln!(
            "ext2: {} inodes, {} blocks, block size {}",
            sb.inodes_count,
            sb.blocks_count,
            block_size
        );

        fs
    }

    // =====================================================================
    // Raw image access
    // =====================================================================

    fn read_raw(&self, offset: u64, buf: &mut [u8]) {
        assert!(offset + buf.len() as u64 <= self.size, "ext2 read past image");
        unsafe {
            ::core::ptr::copy_nonoverlapping(
                (self.base + offset) as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    fn write_raw(&self, offset: u64, buf: &[u8]) {
        assert!(offset + buf.len() as u64 <= self.size, "ext2 write past image");
        unsafe {
            ::core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                (self.base + offset) as *mut u8,
                buf.len(),
            );
        }
    }

    fn u32_at(&self, offset: u64) -> u32 {
        assert!(offset + 4 <= self.size);
        unsafe { ::core::ptr::read_unaligned((self.base + offset) as *const u32) }
    }

    fn put_u32(&self, offset: u64, value: u32) {
        assert!(offset + 4 <= self.size);
        unsafe { ::core::ptr::write_unaligned((self.base + offset) as *mut u32, value) }
    }

    fn group_desc(&self, group: u32) -> BlockGroupDescriptor {
        assert!(group < self.block_group_count, "ext2 group out of range");
        let offset = self.bgdt_offset + group as u64 * 32;
        unsafe { ::core::ptr::read_unaligned((self.base + offset) as *const BlockGroupDescriptor) }
    }

    fn write_group_desc(&self, group: u32, desc: &BlockGroupDescriptor) {
        let offset = self.bgdt_offset + group as u64 * 32;
        unsafe {
            ::core::ptr::write_unaligned(
                (self.base + offset) as *mut BlockGroupDescriptor,
                *desc,
            )
        }
    }

    fn inode_offset(&self, inode_num: u32) -> u64 {
        assert!(inode_num >= 1, "ext2 inodes are indexed from 1");
        let group = (inode_num - 1) / self.inodes_per_group;
        let index = (inode_num - 1) % self.inodes_per_group;
        let desc = self.group_desc(group);
        desc.inode_table_start_block as u64 * self.block_size + index as u64 * self.inode_size
    }

    fn read_inode(&self, inode_num: u32) -> Inode {
        let offset = self.inode_offset(inode_num);
        unsafe { ::core::ptr::read_unaligned((self.base + offset) as *const Inode) }
    }

    fn write_inode(&self, inode_num: u32, inode: &Inode) {
        let offset = self.inode_offset(inode_num);
        unsafe { ::core::ptr::write_unaligned((self.base + offset) as *mut Inode, *inode) }
    }

    // =====================================================================
    // Block mapping: 12 direct pointers, then one level of indirection
    // per pointer 12/13/14
    // =====================================================================

    fn indirect_entry(&self, block: u32, index: u64) -> u32 {
        if block == 0 {
            return 0;
        }
        self.u32_at(block as u64 * self.block_size + index * 4)
    }

    /// Resolve a logical block index to an on-disk block (0 = hole)
    fn get_block(&self, inode: &Inode, logical: u64) -> u32 {
        let p = self.block_size / 4;

        if logical < DIRECT_POINTERS {
            return inode.block_ptrs[logical as usize];
        }
        let logical = logical - DIRECT_POINTERS;
        if logical < p {
            return self.indirect_entry(inode.block_ptrs[12], logical);
        }
        let logical = logical - p;
        if logical < p * p {
            let level1 = self.indirect_entry(inode.block_ptrs[13], logical / p);
            return self.indirect_entry(level1, logical % p);
        }
        let logical = logical - p * p;
        let level1 = self.indirect_entry(inode.block_ptrs[14], logical / (p * p));
        let level2 = self.indirect_entry(level1, (logical / p) % p);
        self.indirect_entry(level2, logical % p)
    }

    /// Like `get_block` but allocates the data block (and any missing
    /// indirect blocks) on the way down
    fn ensure_block(&self, inode: &mut Inode, logical: u64) -> u32 {
        let p = self.block_size / 4;

        if logical < DIRECT_POINTERS {
            if inode.block_ptrs[logical as usize] == 0 {
                inode.block_ptrs[logical as usize] = self.alloc_block();
            }
            return inode.block_ptrs[logical as usize];
        }

        let logical = logical - DIRECT_POINTERS;
        if logical < p {
            if inode.block_ptrs[12] == 0 {
                inode.block_ptrs[12] = self.alloc_block();
            }
            return self.ensure_indirect_entry(inode.block_ptrs[12], logical);
        }

        let logical = logical - p;
        if logical < p * p {
            if inode.block_ptrs[13] == 0 {
                inode.block_ptrs[13] = self.alloc_block();
            }
            let level1 = self.ensure_indirect_entry(inode.block_ptrs[13], logical / p);
            return self.ensure_indirect_entry(level1, logical % p);
        }

        let logical = logical - p * p;
        if inode.block_ptrs[14] == 0 {
            inode.block_ptrs[14] = self.alloc_block();
        }
        let level1 = self.ensure_indirect_entry(inode.block_ptrs[14], logical / (p * p));
        let level2 = self.ensure_indirect_entry(level1, (logical / p) % p);
        self.ensure_indirect_entry(level2, logical % p)
    }

    fn ensure_indirect_entry(&self, block: u32, index: u64) -> u32 {
        let offset = block as u64 * self.block_size + index * 4;
        let mut entry = self.u32_at(offset);
        if entry == 0 {
            entry = self.alloc_block();
            self.put_u32(offset, entry);
        }
        entry
    }

    /// Take a free block from the group bitmaps (zeroed before return)
    ///
    /// # Panics
    /// Panics when the image is full.
    fn alloc_block(&self) -> u32 {
        for group in 0..self.block_group_count {
            let mut desc = self.group_desc(group);
            let bitmap_offset = desc.block_usage_bitmap_block as u64 * self.block_size;
            let group_base = group * self.blocks_per_group + self.first_data_block;

            let bits = self.blocks_per_group.min(
                self.u32_blocks_count().saturating_sub(group_base),
            );
            for bit in 0..bits {
                let byte_offset = bitmap_offset + bit as u64 / 8;
                let mut byte = [0u8; 1];
                self.read_raw(byte_offset, &mut byte);
                if byte[0] & 1 << (bit % 8) == 0 {
                    byte[0] |= 1 << (bit % 8);
                    self.write_raw(byte_offset, &byte);
                    desc.unallocated_blocks_count = desc.unallocated_blocks_count.saturating_sub(1);
                    self.write_group_desc(group, &desc);

                    let block = group_base + bit;
                    let zeros = alloc::vec![0u8; self.block_size as usize];
                    self.write_raw(block as u64 * self.block_size, &zeros);
                    return block;
                }
            }
        }
        panic!("ext2: no free blocks");
    }

    fn u32_blocks_count(&self) -> u32 {
        // blocks_count lives at superblock offset 4
        self.u32_at(1024 + 4)
    }

    /// Take a free inode from the group bitmaps and initialize it as an
    /// empty regular file
    fn alloc_inode(&self) -> u32 {
        for group in 0..self.block_group_count {
            let mut desc = self.group_desc(group);
            let bitmap_offset = desc.inode_usage_bitmap_block as u64 * self.block_size;

            for bit in 0..self.inodes_per_group {
                let byte_offset = bitmap_offset + bit as u64 / 8;
                let mut byte = [0u8; 1];
                self.read_raw(byte_offset, &mut byte);
                if byte[0] & 1 << (bit % 8) == 0 {
                    byte[0] |= 1 << (bit % 8);
                    self.write_raw(byte_offset, &byte);
                    desc.unallocated_inodes_count = desc.unallocated_inodes_count.saturating_sub(1);
                    self.write_group_desc(group, &desc);

                    let inode_num = group * self.inodes_per_group + bit + 1;
                    let mut inode: Inode = unsafe { ::core::mem::zeroed() };
                    inode.type_permissions = TYPE_REGULAR | 0o644;
                    inode.hard_link_count = 1;
                    self.write_inode(inode_num, &inode);
                    return inode_num;
                }
            }
        }
        panic!("ext2: no free inodes");
    }

    // =====================================================================
    // File contents
    // =====================================================================

    /// Read up to `buf.len()` bytes at `offset`, clipped to the file size
    pub fn read(&self, inode_num: u32, buf: &mut [u8], offset: u64) -> usize {
        let _guard = self.lock.lock();
        let inode = self.read_inode(inode_num);
        let size = inode.size0 as u64;
        if offset >= size {
            return 0;
        }

        let count = buf.len().min((size - offset) as usize);
        let mut done = 0usize;
        while done < count {
            let position = offset + done as u64;
            let logical = position / self.block_size;
            let in_block = position % self.block_size;
            let chunk = count.min(done + (self.block_size - in_block) as usize) - done;

            let block = self.get_block(&inode, logical);
            if block == 0 {
                // Hole; never written by this driver, reads as zero
                buf[done..done + chunk].fill(0);
            } else {
                let block_offset = block as u64 * self.block_size + in_block;
                self.read_raw(block_offset, &mut buf[done..done + chunk]);
            }
            done += chunk;
        }
        count
    }

    /// Write `buf` at `offset`, extending the file if needed
    ///
    /// Every block between the old end and the write target is allocated
    /// and zero-filled so the file never grows via holes.
    pub fn write(&self, inode_num: u32, buf: &[u8], offset: u64) -> usize {
        let _guard = self.lock.lock();
        let mut inode = self.read_inode(inode_num);
        let end = offset + buf.len() as u64;

        // Zero-fill blocks in the gap between the old size and the
        // write offset (fresh blocks come back zeroed from alloc_block)
        if offset > inode.size0 as u64 {
            let first_gap_block = inode.size0 as u64 / self.block_size;
            let last_gap_block = offset / self.block_size;
            for logical in first_gap_block..=last_gap_block {
                self.ensure_block(&mut inode, logical);
            }
        }

        let mut done = 0usize;
        while done < buf.len() {
            let position = offset + done as u64;
            let logical = position / self.block_size;
            let in_block = position % self.block_size;
            let chunk = buf.len().min(done + (self.block_size - in_block) as usize) - done;

            let block = self.ensure_block(&mut inode, logical);
            let block_offset = block as u64 * self.block_size + in_block;
            self.write_raw(block_offset, &buf[done..done + chunk]);
            done += chunk;
        }

        if end > inode.size0 as u64 {
            inode.size0 = end as u32;
        }
        self.write_inode(inode_num, &inode);
        buf.len()
    }

    /// Cut the file to zero length; data blocks stay allocated
    pub fn truncate(&self, inode_num: u32) {
        let _guard = self.lock.lock();
        let mut inode = self.read_inode(inode_num);
        inode.size0 = 0;
        self.write_inode(inode_num, &inode);
    }

    /// Current file size in bytes
    pub fn size_of(&self, inode_num: u32) -> u64 {
        let _guard = self.lock.lock();
        self.read_inode(inode_num).size0 as u64
    }

    fn kind_of(type_permissions: u16) -> VnodeKind {
        if type_permissions & TYPE_DIRECTORY != 0 {
            VnodeKind::Directory
        } else if type_permissions & TYPE_CHAR_DEVICE != 0 && type_permissions & TYPE_REGULAR == 0 {
            VnodeKind::CharacterDevice
        } else {
            VnodeKind::Regular
        }
    }

    fn info_for(&self, inode_num: u32) -> VnodeInfo {
        let inode = self.read_inode(inode_num);
        VnodeInfo {
            inode_num,
            kind: Self::kind_of(inode.type_permissions),
            size: inode.size0 as u64,
            context: 0,
        }
    }

    /// The root directory
    pub fn root_info(&self) -> VnodeInfo {
        let _guard = self.lock.lock();
        self.info_for(ROOT_INODE)
    }

    // =====================================================================
    // Directories
    // =====================================================================

    /// Name length of an entry, honoring the filetype feature: with the
    /// feature the high byte is a type indicator, without it both bytes
    /// form a 16-bit length
    fn entry_name_length(&self, head: &DirectoryEntryHead) -> usize {
        if self.dirent_has_filetype {
            head.name_length as usize
        } else {
            head.name_length as usize | (head.type_indicator as usize) << 8
        }
    }

    fn read_entry_head(&self, inode: &Inode, offset: u64) -> DirectoryEntryHead {
        let mut bytes = [0u8; 8];
        self.read_inode_bytes(inode, offset, &mut bytes);
        unsafe { ::core::ptr::read_unaligned(bytes.as_ptr() as *const DirectoryEntryHead) }
    }

    /// Read file content without taking the lock (directory walks hold it)
    fn read_inode_bytes(&self, inode: &Inode, offset: u64, buf: &mut [u8]) {
        let mut done = 0usize;
        while done < buf.len() {
            let position = offset + done as u64;
            let logical = position / self.block_size;
            let in_block = position % self.block_size;
            let chunk = buf.len().min(done + (self.block_size - in_block) as usize) - done;

            let block = self.get_block(inode, logical);
            assert!(block != 0, "directory entry in a hole");
            self.read_raw(block as u64 * self.block_size + in_block, &mut buf[done..done + chunk]);
            done += chunk;
        }
    }

    /// Walk a directory, calling `visit(entry_offset, head, name)` for
    /// every live entry; deleted placeholders (inode 0) are skipped
    fn walk_directory(
        &self,
        dir_inode: u32,
        mut visit: impl FnMut(u64, &DirectoryEntryHead, &str) -> bool,
    ) {
        let dir = self.read_inode(dir_inode);
        assert!(
            dir.type_permissions & TYPE_DIRECTORY != 0,
            "walking a non-directory inode"
        );

        let mut parsed = 0u64;
        while parsed < dir.size0 as u64 {
            let head = self.read_entry_head(&dir, parsed);
            let entry_size = head.entry_size as u64;
            assert!(entry_size >= 8, "corrupt directory entry");

            if head.inode_num != 0 {
                let name_length = self.entry_name_length(&head);
                let mut name_bytes = alloc::vec![0u8; name_length];
                self.read_inode_bytes(&dir, parsed + 8, &mut name_bytes);
                let name = String::from_utf8_lossy(&name_bytes);
                if !visit(parsed, &head, &name) {
                    return;
                }
            }

            parsed += entry_size;
        }
    }

    /// Look a name up in a directory
    pub fn find_in_directory(&self, dir_inode: u32, name: &str) -> Option<VnodeInfo> {
        let _guard = self.lock.lock();
        let mut found = None;
        self.walk_directory(dir_inode, |_, head, entry_name| {
            if entry_name == name {
                found = Some(head.inode_num);
                false
            } else {
                true
            }
        });
        found.map(|inode_num| self.info_for(inode_num))
    }

    /// All live entries of a directory
    pub fn directory_listing(&self, dir_inode: u32) -> Vec<(String, u32)> {
        let _guard = self.lock.lock();
        let mut entries = Vec::new();
        self.walk_directory(dir_inode, |_, head, name| {
            entries.push((String::from(name), head.inode_num));
            true
        });
        entries
    }

    /// Create an empty regular file in a directory
    pub fn create(&self, dir_inode: u32, name: &str) -> KernelResult<VnodeInfo> {
        if name.is_empty() || name.len() > 255 {
            return Err(KernelError::InvalidPath);
        }
        let _guard = self.lock.lock();

        let inode_num = self.alloc_inode();
        self.append_directory_entry(dir_inode, inode_num, name);

        Ok(VnodeInfo {
            inode_num,
            kind: VnodeKind::Regular,
            size: 0,
            context: 0,
        })
    }

    /// On-disk record size of an entry with an `n`-byte name
    fn record_size(name_length: usize) -> u64 {
        (8 + name_length as u64 + 3) & !3
    }

    fn write_dirent(&self, dir: &mut Inode, offset: u64, inode_num: u32, entry_size: u16, name: &str) {
        let logical = offset / self.block_size;
        let in_block = offset % self.block_size;
        // Entries never straddle a block boundary
        assert!(in_block + entry_size as u64 <= self.block_size);

        let block = self.ensure_block(dir, logical);
        let base = block as u64 * self.block_size + in_block;

        let type_indicator = if self.dirent_has_filetype { 1u8 } else { 0 };
        let head = [
            inode_num.to_le_bytes().as_slice(),
            entry_size.to_le_bytes().as_slice(),
            &[name.len() as u8],
            &[type_indicator],
        ]
        .concat();
        self.write_raw(base, &head);
        self.write_raw(base + 8, name.as_bytes());
    }

    /// Append a directory entry, extending the directory by one block
    /// when the last block has no room
    fn append_directory_entry(&self, dir_inode: u32, inode_num: u32, name: &str) {
        let mut dir = self.read_inode(dir_inode);
        let needed = Self::record_size(name.len());

        if dir.size0 == 0 {
            // Empty directory: the new entry spans a whole fresh block
            self.write_dirent(&mut dir, 0, inode_num, self.block_size as u16, name);
            dir.size0 = self.block_size as u32;
            self.write_inode(dir_inode, &dir);
            return;
        }

        // Find the final entry (its record runs to the end of the file)
        let mut offset = dir.size0 as u64 - self.block_size;
        loop {
            let head = self.read_entry_head(&dir, offset);
            assert!(head.entry_size >= 8);
            if offset + head.entry_size as u64 >= dir.size0 as u64 {
                let used = if head.inode_num == 0 {
                    0
                } else {
                    Self::record_size(self.entry_name_length(&head))
                };
                let available = dir.size0 as u64 - offset - used;

                if available >= needed {
                    if used > 0 {
                        // Shrink the final entry to its real size
                        let shrunk = (used as u16).to_le_bytes();
                        let logical = offset / self.block_size;
                        let block = self.get_block(&dir, logical);
                        self.write_raw(
                            block as u64 * self.block_size + offset % self.block_size + 4,
                            &shrunk,
                        );
                    }
                    let new_offset = offset + used;
                    let span = dir.size0 as u64 - new_offset;
                    self.write_dirent(&mut dir, new_offset, inode_num, span as u16, name);
                    self.write_inode(dir_inode, &dir);
                    return;
                }

                // No room: the new entry spans a whole fresh block
                let new_offset = dir.size0 as u64;
                self.write_dirent(&mut dir, new_offset, inode_num, self.block_size as u16, name);
                dir.size0 += self.block_size as u32;
                self.write_inode(dir_inode, &dir);
                return;
            }
            offset += head.entry_size as u64;
        }
    }
}

/// Miniature image builder shared by filesystem tests
#[cfg(test)]
pub(crate) mod test_image {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    pub(crate) const BLOCK: usize = 1024;

    pub(crate) struct ImageBuilder {
        pub(crate) bytes: Vec<u8>,
        dirent_filetype: bool,
    }

    impl ImageBuilder {
        pub(crate) fn new(dirent_filetype: bool) -> Self {
            Self {
                bytes: vec![0u8; 256 * BLOCK],
                dirent_filetype,
            }
        }

        pub(crate) fn put_u16(&mut self, offset: usize, value: u16) {
            self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        }

        fn put_u32(&mut self, offset: usize, value: u32) {
            self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }

        pub(crate) fn superblock(&mut self) {
            let sb = 1024;
            self.put_u32(sb, 32); // inodes_count
            self.put_u32(sb + 4, 256); // blocks_count
            self.put_u32(sb + 20, 1); // superblock_block / first data block
            self.put_u32(sb + 24, 0); // block size log2 - 10
            self.put_u32(sb + 32, 8192); // blocks_per_block_group
            self.put_u32(sb + 40, 32); // inodes_per_block_group
            self.put_u16(sb + 56, 0xEF53); // signature
            self.put_u16(sb + 58, 1); // state: clean
            self.put_u32(sb + 76, 1); // major version
            self.put_u32(sb + 84, 11); // first non-reserved inode
            self.put_u16(sb + 88, 128); // inode size
            if self.dirent_filetype {
                self.put_u32(sb + 96, 0x2); // required features
            }
        }

        fn group_descriptors(&mut self) {
            let gd = 2 * BLOCK;
            self.put_u32(gd, 3); // block usage bitmap block
            self.put_u32(gd + 4, 4); // inode usage bitmap block
            self.put_u32(gd + 8, 5); // inode table start block
            self.put_u16(gd + 12, 243); // unallocated blocks
            self.put_u16(gd + 14, 18); // unallocated inodes
        }

        fn bitmaps(&mut self) {
            // Blocks 1..=12 in use (bits 0..=11 relative to block 1)
            let bb = 3 * BLOCK;
            self.bytes[bb] = 0xFF;
            self.bytes[bb + 1] = 0x0F;
            // Inodes 1..=14 in use
            let ib = 4 * BLOCK;
            self.bytes[ib] = 0xFF;
            self.bytes[ib + 1] = 0x3F;
        }

        fn inode(&mut self, inode_num: u32, type_permissions: u16, size: u32, block0: u32) {
            let offset = 5 * BLOCK + (inode_num as usize - 1) * 128;
            self.put_u16(offset, type_permissions);
            self.put_u32(offset + 4, size);
            self.put_u16(offset + 26, 1); // hard links
            self.put_u32(offset + 40, block0);
        }

        fn dirent(&mut self, offset: usize, inode: u32, entry_size: u16, name: &str, kind: u8) {
            self.put_u32(offset, inode);
            self.put_u16(offset + 4, entry_size);
            self.bytes[offset + 6] = name.len() as u8;
            self.bytes[offset + 7] = if self.dirent_filetype { kind } else { 0 };
            self.bytes[offset + 8..offset + 8 + name.len()].copy_from_slice(name.as_bytes());
        }

        /// Standard fixture: /foo.txt and /subdirectory-bravo/bar.txt
        pub(crate) fn build(self) -> Ext2Fs {
            let (base, size) = self.build_leaked();
            Ext2Fs::new(base, size)
        }

        /// Leak the fixture image and return its `(base, size)`, for
        /// tests that mount it through the process-wide VFS
        pub(crate) fn build_leaked(mut self) -> (u64, u64) {
            self.superblock();
            self.group_descriptors();
            self.bitmaps();

            // Root (inode 2), block 9
            self.inode(2, 0x4000 | 0o755, BLOCK as u32, 9);
            let root = 9 * BLOCK;
            self.dirent(root, 2, 12, ".", 2);
            self.dirent(root + 12, 2, 12, "..", 2);
            self.dirent(root + 24, 11, 16, "foo.txt", 1);
            // A deleted placeholder that walkers must skip
            self.dirent(root + 40, 0, 16, "gone", 1);
            self.dirent(root + 56, 12, (BLOCK - 56) as u16, "subdirectory-bravo", 2);

            // /foo.txt (inode 11), block 10
            let foo = "Hello from foo!\n";
            self.inode(11, 0x8000 | 0o644, foo.len() as u32, 10);
            self.bytes[10 * BLOCK..10 * BLOCK + foo.len()].copy_from_slice(foo.as_bytes());

            // /subdirectory-bravo (inode 12), block 11
            self.inode(12, 0x4000 | 0o755, BLOCK as u32, 11);
            let sub = 11 * BLOCK;
            self.dirent(sub, 12, 12, ".", 2);
            self.dirent(sub + 12, 2, 12, "..", 2);
            self.dirent(sub + 24, 13, (BLOCK - 24) as u16, "bar.txt", 1);

            // /subdirectory-bravo/bar.txt (inode 13), block 12
            let bar = "bar contents\n";
            self.inode(13, 0x8000 | 0o644, bar.len() as u32, 12);
            self.bytes[12 * BLOCK..12 * BLOCK + bar.len()].copy_from_slice(bar.as_bytes());

            let leaked: &'static mut [u8] = Box::leak(self.bytes.into_boxed_slice());
            (leaked.as_mut_ptr() as u64, leaked.len() as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_image::ImageBuilder;
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    #[test]
    fn test_mount_parses_superblock() {
        let fs = ImageBuilder::new(true).build();
        assert_eq!(fs.block_size, 1024);
        assert_eq!(fs.inodes_per_group, 32);
        assert_eq!(fs.block_group_count, 1);
        assert!(fs.dirent_has_filetype);
    }

    #[test]
    #[should_panic]
    fn test_bad_signature_is_fatal() {
        let mut builder = ImageBuilder::new(true);
        builder.superblock();
        builder.put_u16(1024 + 56, 0x1234);
        let leaked: &'static mut [u8] = Box::leak(builder.bytes.into_boxed_slice());
        Ext2Fs::new(leaked.as_mut_ptr() as u64, leaked.len() as u64);
    }

    #[test]
    fn test_find_in_directory() {
        let fs = ImageBuilder::new(true).build();
        let foo = fs.find_in_directory(ROOT_INODE, "foo.txt").unwrap();
        assert_eq!(foo.inode_num, 11);
        assert_eq!(foo.kind, VnodeKind::Regular);
        assert_eq!(foo.size, 16);

        let sub = fs.find_in_directory(ROOT_INODE, "subdirectory-bravo").unwrap();
        assert_eq!(sub.kind, VnodeKind::Directory);
        let bar = fs.find_in_directory(sub.inode_num, "bar.txt").unwrap();
        assert_eq!(bar.inode_num, 13);

        assert!(fs.find_in_directory(ROOT_INODE, "missing").is_none());
    }

    #[test]
    fn test_listing_skips_deleted_entries() {
        let fs = ImageBuilder::new(true).build();
        let names: Vec<String> = fs
            .directory_listing(ROOT_INODE)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert!(names.contains(&String::from("foo.txt")));
        assert!(names.contains(&String::from("subdirectory-bravo")));
        assert!(!names.contains(&String::from("gone")));
    }

    #[test]
    fn test_dirent_name_length_without_filetype_feature() {
        let fs = ImageBuilder::new(false).build();
        let foo = fs.find_in_directory(ROOT_INODE, "foo.txt").unwrap();
        assert_eq!(foo.inode_num, 11);
        // With the feature off the high byte belongs to the length; the
        // builder wrote 0 there, so names still resolve
        let listing = fs.directory_listing(ROOT_INODE);
        assert_eq!(listing.len(), 4);
    }

    #[test]
    fn test_read_round_trip() {
        let fs = ImageBuilder::new(true).build();
        let mut buf = [0u8; 99];
        let n = fs.read(11, &mut buf, 0);
        assert_eq!(&buf[..n], b"Hello from foo!\n");
    }

    #[test]
    fn test_read_clips_to_size_and_offset() {
        let fs = ImageBuilder::new(true).build();
        let mut buf = [0u8; 8];
        let n = fs.read(11, &mut buf, 6);
        assert_eq!(n, 8);
        assert_eq!(&buf[..n], b"from foo");
        assert_eq!(fs.read(11, &mut buf, 100), 0);
    }

    #[test]
    fn test_overwrite_in_place() {
        let fs = ImageBuilder::new(true).build();
        fs.write(11, b"HELLO", 0);
        let mut buf = [0u8; 16];
        let n = fs.read(11, &mut buf, 0);
        assert_eq!(&buf[..n], b"HELLO from foo!\n");
        assert_eq!(fs.size_of(11), 16);
    }

    #[test]
    fn test_extend_with_zero_fill() {
        let fs = ImageBuilder::new(true).build();
        // Write far past the end, crossing a block boundary
        fs.write(11, b"tail", 2000);
        assert_eq!(fs.size_of(11), 2004);

        let mut buf = alloc::vec![0xAAu8; 2004];
        let n = fs.read(11, &mut buf, 0);
        assert_eq!(n, 2004);
        assert_eq!(&buf[..16], b"Hello from foo!\n");
        assert!(buf[16..2000].iter().all(|&b| b == 0), "gap must be zero-filled");
        assert_eq!(&buf[2000..], b"tail");
    }

    #[test]
    fn test_indirect_blocks_via_large_write() {
        let fs = ImageBuilder::new(true).build();
        // 20 KiB needs 20 blocks: 12 direct + 8 through the single
        // indirect pointer
        let data: Vec<u8> = (0..20 * 1024).map(|i| (i % 251) as u8).collect();
        fs.write(11, &data, 0);
        assert_eq!(fs.size_of(11), 20 * 1024);

        let mut back = alloc::vec![0u8; 20 * 1024];
        let n = fs.read(11, &mut back, 0);
        assert_eq!(n, data.len());
        assert_eq!(back, data);

        let inode = fs.read_inode(11);
        assert!(inode.block_ptrs[12] != 0, "single indirect pointer in use");
    }

    #[test]
    fn test_create_and_reopen() {
        let fs = ImageBuilder::new(true).build();
        let created = fs.create(ROOT_INODE, "new.txt").unwrap();
        assert_eq!(created.kind, VnodeKind::Regular);
        assert_eq!(created.size, 0);

        fs.write(created.inode_num, b"fresh", 0);

        let found = fs.find_in_directory(ROOT_INODE, "new.txt").unwrap();
        assert_eq!(found.inode_num, created.inode_num);
        assert_eq!(found.size, 5);

        // A second mount over the same image still resolves the file
        let remount = Ext2Fs::new(fs.base, fs.size);
        let again = remount.find_in_directory(ROOT_INODE, "new.txt").unwrap();
        assert_eq!(again.inode_num, created.inode_num);
        let mut buf = [0u8; 8];
        let n = remount.read(again.inode_num, &mut buf, 0);
        assert_eq!(&buf[..n], b"fresh");
    }

    #[test]
    fn test_create_in_subdirectory() {
        let fs = ImageBuilder::new(true).build();
        let sub = fs.find_in_directory(ROOT_INODE, "subdirectory-bravo").unwrap();
        let created = fs.create(sub.inode_num, ".mock").unwrap();
        fs.write(created.inode_num, b".mock contents!\n", 0);

        let found = fs.find_in_directory(sub.inode_num, ".mock").unwrap();
        assert_eq!(found.inode_num, created.inode_num);
        // The old final entry still resolves after being shrunk
        assert!(fs.find_in_directory(sub.inode_num, "bar.txt").is_some());
    }

    #[test]
    fn test_truncate() {
        let fs = ImageBuilder::new(true).build();
        fs.truncate(11);
        assert_eq!(fs.size_of(11), 0);
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(11, &mut buf, 0), 0);
    }
}
