//! Process-manipulation collaborator interface.
//!
//! The bridge never touches the operating system directly. Everything it needs
//! from the foreign process goes through [`RemoteProcess`], and the driver
//! finds and attaches to processes through [`ProcessProvider`].

use std::ffi::CString;
use std::fmt;

use crate::Result;
use crate::mono::{ArgKind, MonoFunction};

/// A pointer-sized value in the foreign process. Zero is null.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteAddress(pub u64);

impl RemoteAddress {
    pub const NULL: RemoteAddress = RemoteAddress(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// A module loaded in the foreign process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub name: String,
    pub base: RemoteAddress,
}

/// A live thread of the foreign process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef {
    pub id: u32,
}

/// Status reported by the remote call primitive.
///
/// Uses the `HRESULT`/`NTSTATUS` convention: negative values are failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStatus(pub i32);

impl CallStatus {
    pub const SUCCESS: CallStatus = CallStatus(0);

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0 as u32)
    }
}

/// Result of one remote call: the call status plus the raw return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOutcome {
    pub status: CallStatus,
    pub value: u64,
}

impl CallOutcome {
    pub fn success(value: u64) -> Self {
        Self {
            status: CallStatus::SUCCESS,
            value,
        }
    }

    pub fn failure(status: CallStatus) -> Self {
        Self { status, value: 0 }
    }
}

/// One argument bound to a remote function proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteArg {
    Pointer(RemoteAddress),
    Int32(i32),
    CStr(CString),
    /// Initial value on the way in, value written by the callee on the way out.
    OutInt32(i32),
}

impl RemoteArg {
    pub fn kind(&self) -> ArgKind {
        match self {
            RemoteArg::Pointer(_) => ArgKind::Pointer,
            RemoteArg::Int32(_) => ArgKind::Int32,
            RemoteArg::CStr(_) => ArgKind::CStr,
            RemoteArg::OutInt32(_) => ArgKind::OutInt32,
        }
    }

    /// Build a string argument, rejecting interior NULs.
    pub fn c_str(value: &str) -> Result<Self> {
        CString::new(value)
            .map(RemoteArg::CStr)
            .map_err(|_| crate::Error::Marshal(format!("string contains a NUL byte: {:?}", value)))
    }

    pub fn null() -> Self {
        RemoteArg::Pointer(RemoteAddress::NULL)
    }
}

/// An attached foreign process.
///
/// Implementations must not create threads in the foreign process: every call
/// runs on the thread passed to [`RemoteProcess::call`].
pub trait RemoteProcess {
    /// Per-proxy remote call storage. Dropping it releases whatever the
    /// implementation allocated in the foreign process.
    type Frame;

    /// Whether the process is still running and the handle usable.
    fn is_valid(&self) -> bool;

    /// Find a loaded module by file name (case-insensitive).
    fn find_module(&self, name: &str) -> Option<ModuleRef>;

    /// Address of an exported symbol, or [`RemoteAddress::NULL`] if absent.
    fn find_export(&self, module: &ModuleRef, symbol: &str) -> RemoteAddress;

    /// An existing thread suitable for running remote calls.
    fn live_thread(&self) -> Option<ThreadRef>;

    /// Prepare storage for calling `function` at `address`.
    fn prepare_call(&self, address: RemoteAddress, function: MonoFunction) -> Result<Self::Frame>;

    /// Synchronously execute the call on `thread`.
    ///
    /// `OutInt32` arguments are updated in place with the values the callee
    /// wrote.
    fn call(&self, frame: &mut Self::Frame, args: &mut [RemoteArg], thread: &ThreadRef)
    -> CallOutcome;

    /// Human-readable reason for a status code.
    fn status_message(&self, status: CallStatus) -> String {
        format!("remote call failed with status {}", status)
    }
}

/// Finds and attaches to foreign processes.
pub trait ProcessProvider {
    type Process: RemoteProcess;

    /// Process ids whose executable file name matches `name` (case-insensitive).
    fn enumerate_by_name(&self, name: &str) -> Result<Vec<u32>>;

    /// Attach to a process, checking that its architecture matches ours.
    fn attach(&self, pid: u32) -> Result<Self::Process>;
}
