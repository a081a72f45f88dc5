//! PE header and export table parsing over remote memory.
//!
//! Only the pieces needed to find the target's machine type and to look up
//! exported functions by name are parsed. Everything goes through a
//! [`MemoryReader`] so the same code works on a live process and on a buffer.

use std::cmp::Ordering;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

// Machine type constant for current architecture
#[cfg(target_arch = "x86_64")]
pub const IMAGE_FILE_MACHINE_CURRENT: u16 = IMAGE_FILE_MACHINE_AMD64;
#[cfg(target_arch = "x86")]
pub const IMAGE_FILE_MACHINE_CURRENT: u16 = IMAGE_FILE_MACHINE_I386;
#[cfg(target_arch = "aarch64")]
pub const IMAGE_FILE_MACHINE_CURRENT: u16 = 0xAA64;

const PE32_PLUS_MAGIC: u16 = 0x20B;
const EXPORT_DIRECTORY_SIZE: usize = 40;
const MAX_EXPORT_NAMES: u32 = 0x10000;
const MAX_EXPORT_NAME_LEN: usize = 512;
const PAGE_SIZE: usize = 0x1000;

/// Source of bytes at absolute addresses.
pub trait MemoryReader {
    /// Copy bytes at `address` into `buf`, returning how many were read.
    fn read_at(&self, address: u64, buf: &mut [u8]) -> usize;
}

fn read_exact<R: MemoryReader>(reader: &R, address: u64, buf: &mut [u8]) -> Option<()> {
    (reader.read_at(address, buf) == buf.len()).then_some(())
}

fn u16_at(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2)
        .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn u32_at(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4)
        .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// The header fields we care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeHeaders {
    pub machine: u16,
    pub is_pe32_plus: bool,
    pub export_rva: u32,
    pub export_size: u32,
}

/// Read the headers of the image mapped at `base`.
pub fn read_headers<R: MemoryReader>(reader: &R, base: u64) -> Option<PeHeaders> {
    let mut dos_header = [0u8; 64];
    read_exact(reader, base, &mut dos_header)?;
    if dos_header[0] != b'M' || dos_header[1] != b'Z' {
        return None;
    }

    let e_lfanew = u32_at(&dos_header, 0x3C)?;
    if !(64..=1024).contains(&e_lfanew) {
        return None;
    }

    // Signature, COFF header and the optional header through DataDirectory[0]
    let mut pe_header = [0u8; 264];
    read_exact(reader, base + e_lfanew as u64, &mut pe_header)?;
    if &pe_header[..4] != b"PE\0\0" {
        return None;
    }

    let machine = u16_at(&pe_header, 4)?;
    let opt_header_offset = 24;
    let is_pe32_plus = u16_at(&pe_header, opt_header_offset)? == PE32_PLUS_MAGIC;

    // DataDirectory is at 112 (PE32+) or 96 (PE32) into the optional header
    let data_dir_offset = opt_header_offset + if is_pe32_plus { 112 } else { 96 };

    Some(PeHeaders {
        machine,
        is_pe32_plus,
        export_rva: u32_at(&pe_header, data_dir_offset)?,
        export_size: u32_at(&pe_header, data_dir_offset + 4)?,
    })
}

/// Machine type from the COFF header of the image at `base`.
pub fn read_machine_type<R: MemoryReader>(reader: &R, base: u64) -> Option<u16> {
    read_headers(reader, base).map(|headers| headers.machine)
}

/// Read a NUL-terminated string of at most `max` bytes.
fn read_c_string<R: MemoryReader>(reader: &R, address: u64, max: usize) -> Option<Vec<u8>> {
    let mut result = Vec::new();
    let mut chunk = [0u8; 64];

    while result.len() < max {
        let current = address + result.len() as u64;
        // never cross a page boundary in one read
        let len = chunk.len().min(PAGE_SIZE - (current as usize & (PAGE_SIZE - 1)));
        let read = reader.read_at(current, &mut chunk[..len]);
        if read == 0 {
            return None;
        }
        if let Some(end) = chunk[..read].iter().position(|b| *b == 0) {
            result.extend_from_slice(&chunk[..end]);
            return Some(result);
        }
        result.extend_from_slice(&chunk[..read]);
    }

    None
}

/// Address of the export `symbol` of the image at `base`.
///
/// Forwarded exports have no code in the image and are reported as absent.
pub fn find_export<R: MemoryReader>(reader: &R, base: u64, symbol: &str) -> Option<u64> {
    let headers = read_headers(reader, base)?;
    if headers.export_rva == 0 {
        return None;
    }

    let mut export_dir = [0u8; EXPORT_DIRECTORY_SIZE];
    read_exact(reader, base + headers.export_rva as u64, &mut export_dir)?;

    let number_of_functions = u32_at(&export_dir, 20)?;
    let number_of_names = u32_at(&export_dir, 24)?.min(MAX_EXPORT_NAMES) as usize;
    let functions_rva = u32_at(&export_dir, 28)? as u64;
    let names_rva = u32_at(&export_dir, 32)? as u64;
    let ordinals_rva = u32_at(&export_dir, 36)? as u64;

    let mut names = vec![0u8; number_of_names * 4];
    read_exact(reader, base + names_rva, &mut names)?;

    // The name table is sorted lexically
    let (mut low, mut high) = (0usize, number_of_names);
    let index = loop {
        if low >= high {
            return None;
        }
        let mid = low + (high - low) / 2;
        let name_rva = u32_at(&names, mid * 4)? as u64;
        let name = read_c_string(reader, base + name_rva, MAX_EXPORT_NAME_LEN)?;
        match name.as_slice().cmp(symbol.as_bytes()) {
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
            Ordering::Equal => break mid,
        }
    };

    let mut ordinal = [0u8; 2];
    read_exact(reader, base + ordinals_rva + index as u64 * 2, &mut ordinal)?;
    let ordinal = u16::from_le_bytes(ordinal) as u32;
    if ordinal >= number_of_functions {
        return None;
    }

    let mut function = [0u8; 4];
    read_exact(reader, base + functions_rva + ordinal as u64 * 4, &mut function)?;
    let function_rva = u32::from_le_bytes(function);

    let export_end = headers.export_rva.saturating_add(headers.export_size);
    if function_rva == 0 || (headers.export_rva..export_end).contains(&function_rva) {
        return None;
    }

    Some(base + function_rva as u64)
}
