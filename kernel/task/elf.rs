//! ELF64 loader
//!
//! Maps a program's `PT_LOAD` segments into a task's address space,
//! follows `PT_INTERP` to load the runtime dynamic linker when one is
//! requested, and builds the initial user stack with the auxiliary
//! vector the runtime expects.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::fs::vfs::{self, FdTable, OpenFlags, SeekType};
use crate::mm::paging::AddressSpace;
use crate::mm::{PAGE_SIZE, frame_alloc, higher_half};

/// Load bias for `Shared` images (the dynamic linker)
pub const RTDL_BASE: u64 = 0x4000_0000;

/// Top of the initial user stack
pub const USER_STACK_BASE: u64 = 0x0000_8000_0000_0000 - 0x1000;

/// Initial user stack size (two pages)
pub const USER_STACK_SIZE: u64 = 0x2000;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LITTLE_ENDIAN: u8 = 1;

/// Image kinds the loader accepts
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;
const PT_PHDR: u32 = 6;

// Auxiliary vector keys
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_ENTRY: u64 = 9;

/// ELF64 file header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ElfHeader {
    pub ident_magic: [u8; 4],
    pub ident_class: u8,
    pub ident_data: u8,
    pub ident_version: u8,
    pub ident_os_abi: u8,
    pub ident_abi_version: u8,
    pub ident_padding: [u8; 7],
    pub elf_type: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub program_header_offset: u64,
    pub section_header_offset: u64,
    pub flags: u32,
    pub header_size: u16,
    pub program_header_entry_size: u16,
    pub program_header_count: u16,
    pub section_header_entry_size: u16,
    pub section_header_count: u16,
    pub section_name_index: u16,
}

/// ELF64 program header
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ProgramHeader {
    pub header_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub virt_addr: u64,
    pub phys_addr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub alignment: u64,
}

/// Parse and validate an ELF64 header
///
/// Anything other than a little-endian 64-bit `Executable` or `Shared`
/// image is rejected.
pub fn parse_header(bytes: &[u8]) -> KernelResult<ElfHeader> {
    if bytes.len() < ::core::mem::size_of::<ElfHeader>() {
        return Err(KernelError::IoError);
    }
    let header: ElfHeader =
        unsafe { ::core::ptr::read_unaligned(bytes.as_ptr() as *const ElfHeader) };

    if header.ident_magic != ELF_MAGIC
        || header.ident_class != ELF_CLASS_64
        || header.ident_data != ELF_DATA_LITTLE_ENDIAN
    {
        return Err(KernelError::IoError);
    }
    if header.elf_type != ET_EXEC && header.elf_type != ET_DYN {
        return Err(KernelError::IoError);
    }
    if header.program_header_entry_size as usize != ::core::mem::size_of::<ProgramHeader>() {
        return Err(KernelError::IoError);
    }
    Ok(header)
}

/// Parse one program header out of the table bytes
pub fn parse_program_header(table: &[u8], index: usize, entry_size: usize) -> ProgramHeader {
    let offset = index * entry_size;
    unsafe { ::core::ptr::read_unaligned(table[offset..].as_ptr() as *const ProgramHeader) }
}

/// Load the program at `path` into `space`
///
/// Returns `(entry, stack_ptr)`. The auxv-carrying startup stack is
/// built only for `Executable` images entered directly; with an
/// interpreter the entry moves to the interpreter and `stack_ptr` is 0,
/// as it is for the recursive `Shared` load.
pub fn load(path: &str, space: &mut AddressSpace) -> KernelResult<(u64, u64)> {
    let mut fds = FdTable::new();
    let file = vfs::open(&mut fds, path, OpenFlags::empty())?;

    let mut header_bytes = [0u8; ::core::mem::size_of::<ElfHeader>()];
    if vfs::read(&mut fds, file, &mut header_bytes)? != header_bytes.len() {
        return Err(KernelError::IoError);
    }
    let header = parse_header(&header_bytes)?;
    let is_shared = header.elf_type == ET_DYN;

    let entry_size = header.program_header_entry_size as usize;
    let table_size = header.program_header_count as usize * entry_size;
    let mut table = alloc::vec![0u8; table_size];
    vfs::seek(&mut fds, file, header.program_header_offset as i64, SeekType::Set)?;
    if vfs::read(&mut fds, file, &mut table)? != table_size {
        return Err(KernelError::IoError);
    }

    let mut phdr_addr = 0u64;
    let mut interpreter_entry = None;

    for index in 0..header.program_header_count as usize {
        let program_header = parse_program_header(&table, index, entry_size);
        match program_header.header_type {
            PT_LOAD => load_segment(&mut fds, file, &program_header, is_shared, space)?,
            PT_PHDR => phdr_addr = program_header.virt_addr,
            PT_INTERP => {
                let mut path_bytes = alloc::vec![0u8; program_header.file_size as usize];
                vfs::seek(&mut fds, file, program_header.offset as i64, SeekType::Set)?;
                vfs::read(&mut fds, file, &mut path_bytes)?;
                while path_bytes.last() == Some(&0) {
                    path_bytes.pop();
                }
                let interpreter_path = String::from_utf8_lossy(&path_bytes).into_owned();
                let (entry, _) = load(&interpreter_path, space)?;
                interpreter_entry = Some(entry);
            }
            _ => {}
        }
    }

    vfs::close(&mut fds, file)?;

    if is_shared {
        return Ok((RTDL_BASE + header.entry, 0));
    }

    match interpreter_entry {
        // The interpreter owns startup; no stack is prepared for it
        Some(entry) => Ok((entry, 0)),
        None => {
            let stack_ptr = build_user_stack(space, &header, phdr_addr);
            Ok((header.entry, stack_ptr))
        }
    }
}

/// Map one `PT_LOAD` segment and read its file bytes into place
///
/// Frames are zero-filled through the higher-half alias before the
/// file content lands in them, so `mem_size > file_size` tails (BSS)
/// read as zero.
fn load_segment(
    fds: &mut FdTable,
    file: usize,
    program_header: &ProgramHeader,
    is_shared: bool,
    space: &mut AddressSpace,
) -> KernelResult<()> {
    assert!(program_header.mem_size > 0, "empty PT_LOAD segment");
    let page_count = (program_header.mem_size - 1) / PAGE_SIZE + 1;

    let base = program_header.virt_addr + if is_shared { RTDL_BASE } else { 0 };
    let page_base = base & !(PAGE_SIZE - 1);
    let lead = base - page_base;

    vfs::seek(fds, file, program_header.offset as i64, SeekType::Set)?;

    let mut file_remaining = program_header.file_size;
    for page in 0..page_count {
        let phys = frame_alloc::request_frame();
        let alias = higher_half(phys);
        unsafe {
            ::core::ptr::write_bytes(alias as *mut u8, 0, PAGE_SIZE as usize);
        }
        space.map(page_base + page * PAGE_SIZE, phys, true);

        // The first page starts at the segment's in-page offset
        let start = if page == 0 { lead } else { 0 };
        let room = PAGE_SIZE - start;
        let read_count = file_remaining.min(room);
        if read_count > 0 {
            let target = unsafe {
                ::core::slice::from_raw_parts_mut((alias + start) as *mut u8, read_count as usize)
            };
            if vfs::read(fds, file, target)? != read_count as usize {
                return Err(KernelError::IoError);
            }
            file_remaining -= read_count;
        }
    }

    Ok(())
}

/// Map the initial user stack and write the startup contract onto it:
/// auxv (terminated), empty environment, empty argv, `argc = 0`
fn build_user_stack(space: &mut AddressSpace, header: &ElfHeader, phdr_addr: u64) -> u64 {
    let stack_lowest = USER_STACK_BASE - USER_STACK_SIZE;
    let page_count = (USER_STACK_SIZE / PAGE_SIZE) as usize;
    let phys = frame_alloc::request_frames(page_count);
    for page in 0..page_count as u64 {
        unsafe {
            ::core::ptr::write_bytes(
                higher_half(phys + page * PAGE_SIZE) as *mut u8,
                0,
                PAGE_SIZE as usize,
            );
        }
        space.map(stack_lowest + page * PAGE_SIZE, phys + page * PAGE_SIZE, true);
    }

    let mut words: Vec<u64> = Vec::new();
    // argc, argv terminator, environment terminator
    words.push(0);
    words.push(0);
    words.push(0);
    // Auxiliary vector, terminator last
    words.push(AT_ENTRY);
    words.push(header.entry);
    words.push(AT_PHNUM);
    words.push(header.program_header_count as u64);
    words.push(AT_PHENT);
    words.push(header.program_header_entry_size as u64);
    words.push(AT_PHDR);
    words.push(phdr_addr);
    words.push(0);
    words.push(0);

    let byte_count = words.len() as u64 * 8;
    let stack_ptr = USER_STACK_BASE - byte_count;
    let alias = higher_half(phys) + (stack_ptr - stack_lowest);
    for (index, word) in words.iter().enumerate() {
        unsafe {
            ::core::ptr::write_unaligned((alias + index as u64 * 8) as *mut u64, *word);
        }
    }

    stack_ptr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ext2::test_image::ImageBuilder;
    use crate::fs::ext2::{Ext2Fs, ROOT_INODE};
    use crate::mm::frame_alloc;

    fn header_bytes(elf_type: u16, class: u8, endian: u8, phnum: u16) -> Vec<u8> {
        let mut bytes = alloc::vec![0u8; 64];
        bytes[0..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = class;
        bytes[5] = endian;
        bytes[16..18].copy_from_slice(&elf_type.to_le_bytes());
        bytes[18..20].copy_from_slice(&62u16.to_le_bytes()); // x86_64
        bytes[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // entry
        bytes[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        bytes[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        bytes[56..58].copy_from_slice(&phnum.to_le_bytes());
        bytes
    }

    #[test]
    fn test_parse_accepts_executable_and_shared() {
        let exec = parse_header(&header_bytes(ET_EXEC, 2, 1, 2)).unwrap();
        assert_eq!(exec.entry, 0x40_1000);
        assert_eq!(exec.program_header_count, 2);

        assert!(parse_header(&header_bytes(ET_DYN, 2, 1, 1)).is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_images() {
        // Relocatable object
        assert!(parse_header(&header_bytes(1, 2, 1, 0)).is_err());
        // 32-bit class
        assert!(parse_header(&header_bytes(ET_EXEC, 1, 1, 0)).is_err());
        // Big endian
        assert!(parse_header(&header_bytes(ET_EXEC, 2, 2, 0)).is_err());
        // Truncated
        assert!(parse_header(&[0x7F, b'E', b'L', b'F']).is_err());
        // Bad magic
        let mut bytes = header_bytes(ET_EXEC, 2, 1, 0);
        bytes[0] = 0;
        assert!(parse_header(&bytes).is_err());
    }

    #[test]
    fn test_program_header_parse() {
        let mut table = alloc::vec![0u8; 112];
        // Entry 1: PT_LOAD at vaddr 0x40_0000, 0x123 file bytes, 0x2000 in memory
        table[56..60].copy_from_slice(&PT_LOAD.to_le_bytes());
        table[64..72].copy_from_slice(&0x80u64.to_le_bytes());
        table[72..80].copy_from_slice(&0x40_0000u64.to_le_bytes());
        table[88..96].copy_from_slice(&0x123u64.to_le_bytes());
        table[96..104].copy_from_slice(&0x2000u64.to_le_bytes());

        let ph = parse_program_header(&table, 1, 56);
        assert_eq!(ph.header_type, PT_LOAD);
        assert_eq!(ph.offset, 0x80);
        assert_eq!(ph.virt_addr, 0x40_0000);
        assert_eq!(ph.file_size, 0x123);
        assert_eq!(ph.mem_size, 0x2000);
    }

    // =====================================================================
    // End-to-end loads over an ext2 fixture mounted through the VFS
    // =====================================================================

    fn put_program_header(
        image: &mut [u8],
        index: usize,
        header_type: u32,
        offset: u64,
        virt_addr: u64,
        file_size: u64,
        mem_size: u64,
    ) {
        let base = 64 + index * 56;
        image[base..base + 4].copy_from_slice(&header_type.to_le_bytes());
        image[base + 8..base + 16].copy_from_slice(&offset.to_le_bytes());
        image[base + 16..base + 24].copy_from_slice(&virt_addr.to_le_bytes());
        image[base + 32..base + 40].copy_from_slice(&file_size.to_le_bytes());
        image[base + 40..base + 48].copy_from_slice(&mem_size.to_le_bytes());
    }

    /// An executable with one 16-byte load segment (32 bytes in memory)
    /// and a PT_PHDR record; optionally requesting `/rtdl`
    fn program_image(with_interpreter: bool) -> Vec<u8> {
        let phnum = if with_interpreter { 3 } else { 2 };
        let mut image = header_bytes(ET_EXEC, 2, 1, phnum);
        image.resize(0x400, 0);
        put_program_header(&mut image, 0, PT_LOAD, 0x200, 0x40_0000, 16, 0x20);
        put_program_header(&mut image, 1, PT_PHDR, 0, 0x40_0040, 0, 0);
        if with_interpreter {
            put_program_header(&mut image, 2, PT_INTERP, 0x300, 0, 6, 6);
            image[0x300..0x306].copy_from_slice(b"/rtdl\0");
        }
        image[0x200..0x210].copy_from_slice(b"payload-sixteen!");
        image
    }

    /// A `Shared` interpreter image, entry 0x500, one load segment
    fn interpreter_image() -> Vec<u8> {
        let mut image = header_bytes(ET_DYN, 2, 1, 1);
        image[24..32].copy_from_slice(&0x500u64.to_le_bytes());
        image.resize(0x400, 0);
        put_program_header(&mut image, 0, PT_LOAD, 0x200, 0x1000, 8, 0x10);
        image[0x200..0x208].copy_from_slice(b"ldsoexec");
        image
    }

    /// Mount an image carrying /init, /dyninit and /rtdl through the
    /// process-wide VFS (once per test process)
    fn mount_programs() {
        static SETUP: std::sync::Once = std::sync::Once::new();
        SETUP.call_once(|| {
            frame_alloc::init_test_arena();
            let (base, size) = ImageBuilder::new(true).build_leaked();
            {
                let fs = Ext2Fs::new(base, size);
                for (name, image) in [
                    ("init", program_image(false)),
                    ("dyninit", program_image(true)),
                    ("rtdl", interpreter_image()),
                ] {
                    let info = fs.create(ROOT_INODE, name).unwrap();
                    fs.write(info.inode_num, &image, 0);
                }
            }
            crate::fs::vfs::init(base, size);
        });
    }

    #[test]
    fn test_load_builds_stack_for_direct_executable() {
        mount_programs();
        let mut space = AddressSpace::new();
        let (entry, stack_ptr) = load("/init", &mut space).unwrap();
        assert_eq!(entry, 0x40_1000);
        assert_eq!(stack_ptr, USER_STACK_BASE - 13 * 8);

        // Segment content landed, with the memory tail reading zero
        let segment = space.translate(0x40_0000).unwrap();
        let content = unsafe { ::core::slice::from_raw_parts(segment as *const u8, 17) };
        assert_eq!(&content[..16], b"payload-sixteen!");
        assert_eq!(content[16], 0);

        // The startup words, bottom-up: argc, argv and environment
        // terminators, then the auxv pairs ending in the terminator
        let stack = space.translate(stack_ptr).unwrap();
        let words = unsafe { ::core::slice::from_raw_parts(stack as *const u64, 13) };
        assert_eq!(words[0], 0);
        assert_eq!(words[1], 0);
        assert_eq!(words[2], 0);
        assert_eq!(words[3], AT_ENTRY);
        assert_eq!(words[4], 0x40_1000);
        assert_eq!(words[5], AT_PHNUM);
        assert_eq!(words[6], 2);
        assert_eq!(words[7], AT_PHENT);
        assert_eq!(words[8], 56);
        assert_eq!(words[9], AT_PHDR);
        assert_eq!(words[10], 0x40_0040);
        assert_eq!(words[11], 0);
        assert_eq!(words[12], 0);
    }

    #[test]
    fn test_load_with_interpreter_enters_it_and_skips_the_stack() {
        mount_programs();
        let mut space = AddressSpace::new();
        let (entry, stack_ptr) = load("/dyninit", &mut space).unwrap();

        // The interpreter's (rebased) entry wins and no startup stack
        // is prepared
        assert_eq!(entry, RTDL_BASE + 0x500);
        assert_eq!(stack_ptr, 0);
        assert!(space.translate(USER_STACK_BASE - 0x1000).is_none());

        // Both the program and the interpreter segments are mapped
        assert!(space.translate(0x40_0000).is_some());
        let interp = space.translate(RTDL_BASE + 0x1000).unwrap();
        let content = unsafe { ::core::slice::from_raw_parts(interp as *const u8, 8) };
        assert_eq!(content, b"ldsoexec");
    }
}
