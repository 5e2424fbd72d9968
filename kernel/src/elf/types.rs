//! ELF64 on-disk structures
//!
//! Parsed field-by-field from little-endian bytes rather than cast, so
//! validation happens in one place and unaligned inputs are harmless.

use bitflags::bitflags;

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_X86_64: u16 = 62;
pub const PT_LOAD: u32 = 1;

bitflags! {
    /// Program header `p_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXEC  = 0x1;
        const WRITE = 0x2;
        const READ  = 0x4;
    }
}

/// Why an image was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    TooShort,
    BadMagic,
    NotElf64,
    NotLittleEndian,
    NotExecutable,
    WrongMachine,
    BadProgramHeader,
}

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn u64_at(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes([
        b[off],
        b[off + 1],
        b[off + 2],
        b[off + 3],
        b[off + 4],
        b[off + 5],
        b[off + 6],
        b[off + 7],
    ])
}

/// ELF64 file header, already validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    pub const SIZE: usize = 64;

    /// Validate the identification bytes and the executable class, then
    /// pull out the program-header geometry.
    pub fn parse(bytes: &[u8]) -> Result<Self, ElfError> {
        if bytes.len() < Self::SIZE {
            return Err(ElfError::TooShort);
        }
        if bytes[0..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if bytes[4] != ELFCLASS64 {
            return Err(ElfError::NotElf64);
        }
        if bytes[5] != ELFDATA2LSB {
            return Err(ElfError::NotLittleEndian);
        }
        if u16_at(bytes, 16) != ET_EXEC {
            return Err(ElfError::NotExecutable);
        }
        if u16_at(bytes, 18) != EM_X86_64 {
            return Err(ElfError::WrongMachine);
        }
        Ok(Self {
            entry: u64_at(bytes, 24),
            phoff: u64_at(bytes, 32),
            phentsize: u16_at(bytes, 54),
            phnum: u16_at(bytes, 56),
        })
    }
}

/// One program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: SegmentFlags,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

impl ProgramHeader {
    pub const SIZE: usize = 56;

    pub fn parse(bytes: &[u8]) -> Result<Self, ElfError> {
        if bytes.len() < Self::SIZE {
            return Err(ElfError::BadProgramHeader);
        }
        Ok(Self {
            p_type: u32_at(bytes, 0),
            flags: SegmentFlags::from_bits_truncate(u32_at(bytes, 4)),
            offset: u64_at(bytes, 8),
            vaddr: u64_at(bytes, 16),
            filesz: u64_at(bytes, 32),
            memsz: u64_at(bytes, 40),
        })
    }

    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
}

/// All program headers of a validated image.
pub fn program_headers(
    image: &[u8],
    header: &ElfHeader,
) -> Result<alloc::vec::Vec<ProgramHeader>, ElfError> {
    if header.phentsize as usize != ProgramHeader::SIZE && header.phnum > 0 {
        return Err(ElfError::BadProgramHeader);
    }
    let mut out = alloc::vec::Vec::with_capacity(header.phnum as usize);
    for i in 0..header.phnum as usize {
        let off = header.phoff as usize + i * ProgramHeader::SIZE;
        let end = off.checked_add(ProgramHeader::SIZE).ok_or(ElfError::BadProgramHeader)?;
        if end > image.len() {
            return Err(ElfError::BadProgramHeader);
        }
        out.push(ProgramHeader::parse(&image[off..end])?);
    }
    Ok(out)
}
