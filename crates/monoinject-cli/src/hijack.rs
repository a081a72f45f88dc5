//! Remote calls by hijacking an existing thread.
//!
//! The thread is suspended, its instruction pointer is redirected to the call
//! stub in our frame with the original one pushed as a return address, and it
//! is resumed. We then poll the frame's completion flag. No thread is ever
//! created in the target.

use std::ffi::c_void;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Diagnostics::Debug::{
    CONTEXT, FlushInstructionCache, GetThreadContext, SetThreadContext,
};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, VirtualAllocEx, VirtualFreeEx,
};
use windows::Win32::System::Threading::{
    OpenThread, ResumeThread, SuspendThread, THREAD_GET_CONTEXT, THREAD_SET_CONTEXT,
    THREAD_SUSPEND_RESUME,
};

use monoinject_shared::{CallOutcome, CallStatus, RemoteAddress, RemoteArg, ThreadRef};

use crate::reader::ProcessMemoryReader;
use crate::stub::{self, DONE_OFFSET, FRAME_SIZE, RESULT_OFFSET, StateSave};
use crate::target::OwnedHandle;

/// `HRESULT_FROM_WIN32(WAIT_TIMEOUT)`
const STATUS_TIMEOUT: CallStatus = CallStatus(0x8007_0102u32 as i32);
/// `E_INVALIDARG`
const STATUS_INVALID_ARG: CallStatus = CallStatus(0x8007_0057u32 as i32);

const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Bytes left untouched below the interrupted stack pointer.
const STACK_GAP: u64 = 0x80;

#[cfg(target_arch = "x86_64")]
mod arch {
    use windows::Win32::System::Diagnostics::Debug::{CONTEXT, CONTEXT_FLAGS, CONTEXT_FULL_AMD64};

    use crate::stub::StateSave;

    pub const CONTEXT_FULL: CONTEXT_FLAGS = CONTEXT_FULL_AMD64;
    pub const POINTER_SIZE: u64 = 8;

    pub fn instruction_pointer(context: &CONTEXT) -> u64 {
        context.Rip
    }

    pub fn stack_pointer(context: &CONTEXT) -> u64 {
        context.Rsp
    }

    pub fn redirect(context: &mut CONTEXT, ip: u64, sp: u64) {
        context.Rip = ip;
        context.Rsp = sp;
    }

    pub fn build_stub(frame: u64, target: u64, args: &[u64], save: StateSave) -> Vec<u8> {
        crate::stub::x64(frame, target, args, save)
    }
}

#[cfg(target_arch = "x86")]
mod arch {
    use windows::Win32::System::Diagnostics::Debug::{CONTEXT, CONTEXT_FLAGS, CONTEXT_FULL_X86};

    use crate::stub::StateSave;

    pub const CONTEXT_FULL: CONTEXT_FLAGS = CONTEXT_FULL_X86;
    pub const POINTER_SIZE: u64 = 4;

    pub fn instruction_pointer(context: &CONTEXT) -> u64 {
        context.Eip as u64
    }

    pub fn stack_pointer(context: &CONTEXT) -> u64 {
        context.Esp as u64
    }

    pub fn redirect(context: &mut CONTEXT, ip: u64, sp: u64) {
        context.Eip = ip as u32;
        context.Esp = sp as u32;
    }

    pub fn build_stub(frame: u64, target: u64, args: &[u64], save: StateSave) -> Vec<u8> {
        let args: Vec<u32> = args.iter().map(|value| *value as u32).collect();
        crate::stub::x86(frame as u32, target as u32, &args, save)
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
compile_error!("monoinject can only hijack threads on x86 and x86_64");

/// `xsave` when the CPU and OS support it; the target runs on this same machine.
fn state_save() -> StateSave {
    if std::arch::is_x86_feature_detected!("xsave") {
        StateSave::X
    } else {
        StateSave::Fx
    }
}

fn status(error: windows::core::Error) -> CallStatus {
    CallStatus(error.code().0)
}

/// A suspended thread, resumed on drop.
struct Suspended<'a> {
    thread: &'a OwnedHandle,
}

impl<'a> Suspended<'a> {
    fn new(thread: &'a OwnedHandle) -> Result<Self, CallStatus> {
        if unsafe { SuspendThread(thread.as_raw()) } == u32::MAX {
            return Err(status(windows::core::Error::from_win32()));
        }
        Ok(Self { thread })
    }

    fn context(&self) -> Result<Box<CONTEXT>, CallStatus> {
        // CONTEXT needs 16-byte alignment, which the box's allocation keeps
        let mut context = Box::<CONTEXT>::default();
        context.ContextFlags = arch::CONTEXT_FULL;
        unsafe { GetThreadContext(self.thread.as_raw(), context.as_mut()) }.map_err(status)?;
        Ok(context)
    }
}

impl Drop for Suspended<'_> {
    fn drop(&mut self) {
        unsafe { ResumeThread(self.thread.as_raw()) };
    }
}

/// Remote storage and code for one proxy.
///
/// Owns an allocation in the target, released on drop unless a call was left
/// running in it.
pub struct CallFrame {
    process: HANDLE,
    base: u64,
    target: RemoteAddress,
    timeout: Option<Duration>,
    abandoned: bool,
}

impl CallFrame {
    /// Allocate a frame in `process` for calls to `target`.
    pub fn allocate(
        process: HANDLE,
        target: RemoteAddress,
        timeout: Option<Duration>,
    ) -> windows::core::Result<Self> {
        let base = unsafe {
            VirtualAllocEx(
                process,
                None,
                FRAME_SIZE,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if base.is_null() {
            return Err(windows::core::Error::from_win32());
        }

        trace!(target: "monoinject::hijack", base = format!("{:#x}", base as usize), "Allocated call frame");
        Ok(Self {
            process,
            base: base as usize as u64,
            target,
            timeout,
            abandoned: false,
        })
    }

    fn memory(&self) -> ProcessMemoryReader {
        ProcessMemoryReader::new(self.process)
    }

    fn contains(&self, address: u64) -> bool {
        (self.base..self.base + FRAME_SIZE as u64).contains(&address)
    }

    /// Run the call on `thread` and wait for it to finish.
    pub fn call(&mut self, args: &mut [RemoteArg], thread: &ThreadRef) -> CallOutcome {
        match self.execute(args, thread) {
            Ok(value) => CallOutcome::success(value),
            Err(status) => {
                warn!(target: "monoinject::hijack", thread = thread.id, %status, "Remote call failed");
                CallOutcome::failure(status)
            }
        }
    }

    fn execute(&mut self, args: &mut [RemoteArg], thread: &ThreadRef) -> Result<u64, CallStatus> {
        if self.abandoned {
            return Err(STATUS_TIMEOUT);
        }

        let marshalled = stub::marshal(self.base, args).map_err(|e| {
            warn!(target: "monoinject::hijack", error = %e, "Unable to marshal call arguments");
            STATUS_INVALID_ARG
        })?;
        let memory = self.memory();
        for (address, bytes) in &marshalled.writes {
            memory.write(*address, bytes).map_err(status)?;
        }
        memory
            .write(self.base + RESULT_OFFSET, &[0u8; 12])
            .map_err(status)?;

        let handle = unsafe {
            OpenThread(
                THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT | THREAD_SET_CONTEXT,
                false,
                thread.id,
            )
        }
        .map(OwnedHandle::new)
        .map_err(status)?;

        self.hijack(&handle, &marshalled.values)?;
        self.wait_for_completion()?;
        self.wait_for_exit(&handle)?;

        let value = if arch::POINTER_SIZE == 8 {
            memory.read_u64(self.base + RESULT_OFFSET).map_err(status)?
        } else {
            memory.read_u32(self.base + RESULT_OFFSET).map_err(status)? as u64
        };

        for (index, address) in &marshalled.out_slots {
            let raw = memory.read_u32(*address).map_err(status)?;
            if let Some(slot) = args.get_mut(*index) {
                *slot = RemoteArg::OutInt32(raw as i32);
            }
        }

        Ok(value)
    }

    /// Point the suspended thread at the stub.
    fn hijack(&self, handle: &OwnedHandle, values: &[u64]) -> Result<(), CallStatus> {
        let suspended = Suspended::new(handle)?;
        let mut context = suspended.context()?;

        let original_ip = arch::instruction_pointer(&context);
        let original_sp = arch::stack_pointer(&context);
        let sp = original_sp - STACK_GAP - arch::POINTER_SIZE;

        let code = arch::build_stub(self.base, self.target.0, values, state_save());
        let memory = self.memory();
        memory.write(self.base, &code).map_err(status)?;
        unsafe {
            FlushInstructionCache(
                self.process,
                Some(self.base as usize as *const c_void),
                code.len(),
            )
        }
        .map_err(status)?;

        let return_address = original_ip.to_le_bytes();
        memory
            .write(sp, &return_address[..arch::POINTER_SIZE as usize])
            .map_err(status)?;

        arch::redirect(&mut context, self.base, sp);
        unsafe { SetThreadContext(handle.as_raw(), context.as_ref()) }.map_err(status)?;

        debug!(
            target: "monoinject::hijack",
            original_ip = format!("{:#x}", original_ip),
            stub = format!("{:#x}", self.base),
            "Thread hijacked"
        );
        Ok(())
    }

    fn timed_out(&mut self, started: Instant) -> bool {
        let expired = self
            .timeout
            .is_some_and(|timeout| started.elapsed() >= timeout);
        if expired {
            // the stub may still run later; keep its memory alive
            self.abandoned = true;
        }
        expired
    }

    fn wait_for_completion(&mut self) -> Result<(), CallStatus> {
        let memory = self.memory();
        let started = Instant::now();
        loop {
            if memory.read_u32(self.base + DONE_OFFSET).map_err(status)? != 0 {
                return Ok(());
            }
            if self.timed_out(started) {
                return Err(STATUS_TIMEOUT);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Wait until the thread has run the stub's epilogue and left the frame.
    fn wait_for_exit(&mut self, handle: &OwnedHandle) -> Result<(), CallStatus> {
        let started = Instant::now();
        loop {
            let ip = {
                let suspended = Suspended::new(handle)?;
                arch::instruction_pointer(&suspended.context()?)
            };
            if !self.contains(ip) {
                return Ok(());
            }
            if self.timed_out(started) {
                return Err(STATUS_TIMEOUT);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for CallFrame {
    fn drop(&mut self) {
        if self.abandoned {
            warn!(
                target: "monoinject::hijack",
                base = format!("{:#x}", self.base),
                "Leaving call frame allocated, a call may still be running in it"
            );
            return;
        }
        unsafe {
            let _ = VirtualFreeEx(self.process, self.base as usize as *mut c_void, 0, MEM_RELEASE);
        }
    }
}
