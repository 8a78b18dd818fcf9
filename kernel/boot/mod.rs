//! Stivale2-style boot handoff
//!
//! The bootloader hands the kernel a pointer to a structure holding a
//! linked list of tags. The kernel consumes the memory map (frame
//! allocator), the SMP table (AP bring-up), and the first module (the
//! ext2 RAM disk). The framebuffer tag is ignored by the core.

use ::core::sync::atomic::{AtomicU64, Ordering};

/// Memory map tag identifier
pub const TAG_MEMMAP: u64 = 0x2187f79e8612de07;
/// SMP tag identifier
pub const TAG_SMP: u64 = 0x34d1d96339647025;
/// Modules tag identifier
pub const TAG_MODULES: u64 = 0x4b6fe466aade04ce;

/// Usable RAM in the memory map
pub const MEMMAP_USABLE: u32 = 1;

/// Root structure passed by the bootloader
#[repr(C, packed)]
pub struct Stivale2Struct {
    pub bootloader_brand: [u8; 64],
    pub bootloader_version: [u8; 64],
    pub tags: u64,
}

/// Common tag header
#[repr(C, packed)]
pub struct Stivale2Tag {
    pub identifier: u64,
    pub next: u64,
}

/// Memory map tag
#[repr(C, packed)]
pub struct Stivale2MemmapTag {
    pub tag: Stivale2Tag,
    pub entry_count: u64,
    // entries follow inline
}

/// One memory map entry
#[repr(C, packed)]
pub struct Stivale2MemmapEntry {
    pub base: u64,
    pub length: u64,
    pub entry_type: u32,
    pub unused: u32,
}

/// SMP tag
#[repr(C, packed)]
pub struct Stivale2SmpTag {
    pub tag: Stivale2Tag,
    pub flags: u64,
    pub bsp_lapic_id: u32,
    pub unused: u32,
    pub cpu_count: u64,
    // per-CPU info follows inline
}

/// Per-CPU SMP info; `target_stack` and `goto_address` are written by the
/// BSP and polled by the bootloader-parked AP.
#[repr(C, packed)]
pub struct Stivale2SmpInfo {
    pub processor_id: u32,
    pub lapic_id: u32,
    pub target_stack: u64,
    pub goto_address: u64,
    pub extra_argument: u64,
}

/// Modules tag
#[repr(C, packed)]
pub struct Stivale2ModulesTag {
    pub tag: Stivale2Tag,
    pub module_count: u64,
    // modules follow inline
}

/// One boot module (the kernel expects exactly one: the ext2 image)
#[repr(C, packed)]
pub struct Stivale2Module {
    pub begin: u64,
    pub end: u64,
    pub string: [u8; 128],
}

/// Boot info pointer stashed at entry
static BOOT_INFO: AtomicU64 = AtomicU64::new(0);

/// Record the boot structure pointer for later tag lookups
pub fn init(info: *const Stivale2Struct) {
    BOOT_INFO.store(info as u64, Ordering::SeqCst);
}

/// Find a tag by identifier
pub fn tag(identifier: u64) -> Option<*const Stivale2Tag> {
    let info = BOOT_INFO.load(Ordering::SeqCst) as *const Stivale2Struct;
    assert!(!info.is_null(), "boot info not initialized");

    unsafe {
        let mut current = (*info).tags as *const Stivale2Tag;
        while !current.is_null() {
            let id = (*current).identifier;
            if id == identifier {
                return Some(current);
            }
            current = (*current).next as *const Stivale2Tag;
        }
    }
    None
}

/// Walk every usable memory map entry
pub fn for_each_usable_region(mut f: impl FnMut(u64, u64)) {
    let memmap = tag(TAG_MEMMAP).expect("boot info has no memory map") as *const Stivale2MemmapTag;

    unsafe {
        let count = (*memmap).entry_count;
        let entries = memmap.add(1) as *const Stivale2MemmapEntry;
        for i in 0..count {
            let entry = entries.add(i as usize);
            let entry_type = (*entry).entry_type;
            if entry_type == MEMMAP_USABLE {
                f((*entry).base, (*entry).length);
            }
        }
    }
}

/// SMP tag, mutable so AP `target_stack`/`goto_address` can be written
pub fn smp() -> Option<*mut Stivale2SmpTag> {
    tag(TAG_SMP).map(|t| t as *mut Stivale2SmpTag)
}

/// Per-CPU info array of an SMP tag
///
/// # Safety
/// `smp_tag` must point at a live SMP tag from the boot structure.
pub unsafe fn smp_info_array(smp_tag: *mut Stivale2SmpTag) -> *mut Stivale2SmpInfo {
    unsafe { smp_tag.add(1) as *mut Stivale2SmpInfo }
}

/// RAM disk region `(begin, end)` from the first boot module
pub fn ramdisk() -> Option<(u64, u64)> {
    let modules = tag(TAG_MODULES)? as *const Stivale2ModulesTag;
    unsafe {
        if (*modules).module_count == 0 {
            return None;
        }
        let first = modules.add(1) as *const Stivale2Module;
        Some(((*first).begin, (*first).end))
    }
}
