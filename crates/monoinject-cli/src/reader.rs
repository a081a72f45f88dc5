//! Remote memory access through `ReadProcessMemory`/`WriteProcessMemory`.

use std::ffi::c_void;

use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};

use crate::pe::MemoryReader;

/// A reader over a remote process's address space.
///
/// Borrows the handle; the owner must keep it open while the reader is used.
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemoryReader {
    /// Handle to the process (must have PROCESS_VM_READ access)
    handle: HANDLE,
}

impl ProcessMemoryReader {
    pub fn new(handle: HANDLE) -> Self {
        Self { handle }
    }

    /// Read exactly `buf.len()` bytes.
    pub fn read(&self, address: u64, buf: &mut [u8]) -> windows::core::Result<()> {
        let mut bytes_read = 0usize;
        unsafe {
            ReadProcessMemory(
                self.handle,
                address as usize as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                Some(&mut bytes_read),
            )
        }?;
        if bytes_read != buf.len() {
            return Err(windows::core::Error::from_win32());
        }
        Ok(())
    }

    /// Write all of `bytes` at `address`.
    pub fn write(&self, address: u64, bytes: &[u8]) -> windows::core::Result<()> {
        unsafe {
            WriteProcessMemory(
                self.handle,
                address as usize as *const c_void,
                bytes.as_ptr() as *const c_void,
                bytes.len(),
                None,
            )
        }
    }

    pub fn read_u32(&self, address: u64) -> windows::core::Result<u32> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, address: u64) -> windows::core::Result<u64> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl MemoryReader for ProcessMemoryReader {
    fn read_at(&self, address: u64, buf: &mut [u8]) -> usize {
        let mut bytes_read = 0usize;
        let result = unsafe {
            ReadProcessMemory(
                self.handle,
                address as usize as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                Some(&mut bytes_read),
            )
        };

        if result.is_err() {
            // Unmapped page, access denied, etc. Report nothing read.
            return 0;
        }

        bytes_read
    }
}
