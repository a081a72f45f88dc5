//! Windows implementation of the process collaborator.
//!
//! Processes are found with a ToolHelp snapshot, modules with
//! `EnumProcessModulesEx`, exports by parsing the remote export table, and
//! remote calls run on the process's main thread through [`CallFrame`].

use std::time::Duration;

use tracing::{debug, trace, warn};
use windows::Win32::Foundation::{CloseHandle, FILETIME, HANDLE, HMODULE};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW, TH32CS_SNAPPROCESS,
    TH32CS_SNAPTHREAD, THREADENTRY32, Thread32First, Thread32Next,
};
use windows::Win32::System::ProcessStatus::{
    EnumProcessModulesEx, GetModuleBaseNameW, LIST_MODULES_ALL,
};
use windows::Win32::System::SystemInformation::{IMAGE_FILE_MACHINE, IMAGE_FILE_MACHINE_UNKNOWN};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, GetThreadTimes, IsWow64Process2, OpenProcess, OpenThread,
    PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ, PROCESS_VM_WRITE,
    THREAD_QUERY_LIMITED_INFORMATION,
};
use windows::core::HRESULT;

use monoinject_shared::{
    CallOutcome, CallStatus, Error, ModuleRef, MonoFunction, ProcessProvider, RemoteAddress,
    RemoteArg, RemoteProcess, Result, ThreadRef,
};

use crate::hijack::CallFrame;
use crate::pe;
use crate::reader::ProcessMemoryReader;

const STILL_ACTIVE: u32 = 259;

// =============================================================================
// Handle RAII Wrapper
// =============================================================================

/// RAII wrapper for Windows handles.
/// Automatically closes the handle when dropped.
pub(crate) struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub fn new(handle: HANDLE) -> Self {
        Self(handle)
    }

    /// Get the raw handle for Windows API calls.
    pub fn as_raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.0).ok() };
    }
}

fn wide_to_string(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

fn filetime_to_u64(time: FILETIME) -> u64 {
    ((time.dwHighDateTime as u64) << 32) | time.dwLowDateTime as u64
}

// =============================================================================
// Provider
// =============================================================================

/// Finds and attaches to local processes.
pub struct WindowsProcesses {
    call_timeout: Option<Duration>,
}

impl WindowsProcesses {
    pub fn new(call_timeout: Option<Duration>) -> Self {
        Self { call_timeout }
    }
}

impl ProcessProvider for WindowsProcesses {
    type Process = TargetProcess;

    fn enumerate_by_name(&self, name: &str) -> Result<Vec<u32>> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
            .map(OwnedHandle::new)
            .map_err(|e| Error::Attach {
                pid: 0,
                reason: format!("Failed to snapshot processes: {}", e.message()),
            })?;

        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };

        let mut pids = Vec::new();
        let mut more = unsafe { Process32FirstW(snapshot.as_raw(), &mut entry) }.is_ok();
        while more {
            if wide_to_string(&entry.szExeFile).eq_ignore_ascii_case(name) {
                pids.push(entry.th32ProcessID);
            }
            more = unsafe { Process32NextW(snapshot.as_raw(), &mut entry) }.is_ok();
        }

        Ok(pids)
    }

    fn attach(&self, pid: u32) -> Result<TargetProcess> {
        TargetProcess::open(pid, self.call_timeout)
    }
}

// =============================================================================
// Attached Process
// =============================================================================

/// An attached process with read, write and allocation rights.
pub struct TargetProcess {
    pid: u32,
    handle: OwnedHandle,
    call_timeout: Option<Duration>,
}

impl TargetProcess {
    /// Open `pid` and check that it runs the same architecture as we do.
    pub fn open(pid: u32, call_timeout: Option<Duration>) -> Result<Self> {
        let handle = unsafe {
            OpenProcess(
                PROCESS_QUERY_INFORMATION | PROCESS_VM_OPERATION | PROCESS_VM_READ | PROCESS_VM_WRITE,
                false,
                pid,
            )
        }
        .map_err(|e| Error::Attach {
            pid,
            reason: e.message(),
        })?;

        let process = Self {
            pid,
            handle: OwnedHandle::new(handle),
            call_timeout,
        };

        // module enumeration fails across architectures, so ask the loader first
        let machine = match process_machine(process.handle.as_raw()) {
            Ok(machine) => machine,
            Err(e) => {
                debug!(target: "monoinject::target", pid, error = %e, "IsWow64Process2 failed, reading the PE header");
                process.main_module_machine()?
            }
        };

        debug!(
            target: "monoinject::target",
            pid,
            machine = format!("{:#06x}", machine),
            "Read target machine type"
        );
        if machine != pe::IMAGE_FILE_MACHINE_CURRENT {
            return Err(Error::ArchitectureMismatch);
        }

        Ok(process)
    }

    fn main_module_machine(&self) -> Result<u16> {
        let main_module = self.module_handles().into_iter().next().ok_or_else(|| {
            Error::Attach {
                pid: self.pid,
                reason: "Unable to enumerate process modules.".into(),
            }
        })?;
        pe::read_machine_type(&self.reader(), main_module.0 as u64).ok_or_else(|| Error::Attach {
            pid: self.pid,
            reason: "Unable to read the main module's PE header.".into(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn reader(&self) -> ProcessMemoryReader {
        ProcessMemoryReader::new(self.handle.as_raw())
    }

    fn module_handles(&self) -> Vec<HMODULE> {
        let mut modules = vec![HMODULE::default(); 1024];
        loop {
            let mut needed = 0u32;
            let result = unsafe {
                EnumProcessModulesEx(
                    self.handle.as_raw(),
                    modules.as_mut_ptr(),
                    (modules.len() * std::mem::size_of::<HMODULE>()) as u32,
                    &mut needed,
                    LIST_MODULES_ALL,
                )
            };
            if let Err(e) = result {
                warn!(target: "monoinject::target", pid = self.pid, error = %e, "EnumProcessModulesEx failed");
                return Vec::new();
            }

            let count = needed as usize / std::mem::size_of::<HMODULE>();
            if count <= modules.len() {
                modules.truncate(count);
                return modules;
            }
            modules.resize(count, HMODULE::default());
        }
    }

    fn module_name(&self, module: HMODULE) -> Option<String> {
        let mut name_buf = [0u16; 260];
        let len = unsafe { GetModuleBaseNameW(self.handle.as_raw(), Some(module), &mut name_buf) };
        (len > 0).then(|| String::from_utf16_lossy(&name_buf[..len as usize]))
    }

    /// Every loaded module, main executable first.
    pub fn modules(&self) -> Vec<ModuleRef> {
        self.module_handles()
            .into_iter()
            .filter_map(|module| {
                self.module_name(module).map(|name| ModuleRef {
                    name,
                    base: RemoteAddress(module.0 as u64),
                })
            })
            .collect()
    }

    /// The thread with the earliest creation time.
    pub fn main_thread(&self) -> Option<u32> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }
            .map(OwnedHandle::new)
            .ok()?;

        let mut entry = THREADENTRY32 {
            dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };

        let mut earliest: Option<(u64, u32)> = None;
        let mut more = unsafe { Thread32First(snapshot.as_raw(), &mut entry) }.is_ok();
        while more {
            if entry.th32OwnerProcessID == self.pid {
                if let Some(created) = thread_creation_time(entry.th32ThreadID) {
                    if earliest.is_none_or(|(time, _)| created < time) {
                        earliest = Some((created, entry.th32ThreadID));
                    }
                }
            }
            more = unsafe { Thread32Next(snapshot.as_raw(), &mut entry) }.is_ok();
        }

        earliest.map(|(_, id)| id)
    }
}

/// Machine type the process runs as, which differs from the native one under WOW64.
fn process_machine(process: HANDLE) -> windows::core::Result<u16> {
    let mut emulated = IMAGE_FILE_MACHINE::default();
    let mut native = IMAGE_FILE_MACHINE::default();
    unsafe { IsWow64Process2(process, &mut emulated, Some(&mut native)) }?;
    if emulated == IMAGE_FILE_MACHINE_UNKNOWN {
        Ok(native.0)
    } else {
        Ok(emulated.0)
    }
}

fn thread_creation_time(thread_id: u32) -> Option<u64> {
    let thread = unsafe { OpenThread(THREAD_QUERY_LIMITED_INFORMATION, false, thread_id) }
        .map(OwnedHandle::new)
        .ok()?;

    let mut creation = FILETIME::default();
    let mut exit = FILETIME::default();
    let mut kernel = FILETIME::default();
    let mut user = FILETIME::default();
    unsafe {
        GetThreadTimes(
            thread.as_raw(),
            &mut creation,
            &mut exit,
            &mut kernel,
            &mut user,
        )
    }
    .ok()?;

    Some(filetime_to_u64(creation))
}

impl RemoteProcess for TargetProcess {
    type Frame = CallFrame;

    fn is_valid(&self) -> bool {
        let mut exit_code = 0u32;
        unsafe { GetExitCodeProcess(self.handle.as_raw(), &mut exit_code) }.is_ok()
            && exit_code == STILL_ACTIVE
    }

    fn find_module(&self, name: &str) -> Option<ModuleRef> {
        self.modules()
            .into_iter()
            .find(|module| module.name.eq_ignore_ascii_case(name))
    }

    fn find_export(&self, module: &ModuleRef, symbol: &str) -> RemoteAddress {
        let address = pe::find_export(&self.reader(), module.base.0, symbol)
            .map(RemoteAddress)
            .unwrap_or(RemoteAddress::NULL);
        trace!(target: "monoinject::target", module = %module.name, symbol, %address, "Export lookup");
        address
    }

    fn live_thread(&self) -> Option<ThreadRef> {
        self.main_thread().map(|id| ThreadRef { id })
    }

    fn prepare_call(&self, address: RemoteAddress, function: MonoFunction) -> Result<CallFrame> {
        debug!(target: "monoinject::target", %function, %address, "Allocating call frame");
        CallFrame::allocate(self.handle.as_raw(), address, self.call_timeout).map_err(|e| {
            Error::Marshal(format!(
                "Failed to allocate a call frame for {}: {}",
                function,
                e.message()
            ))
        })
    }

    fn call(&self, frame: &mut CallFrame, args: &mut [RemoteArg], thread: &ThreadRef) -> CallOutcome {
        frame.call(args, thread)
    }

    fn status_message(&self, status: CallStatus) -> String {
        let message = HRESULT(status.0).message();
        let message = message.trim();
        if message.is_empty() {
            format!("remote call failed with status {}", status)
        } else {
            format!("{} ({})", message, status)
        }
    }
}
