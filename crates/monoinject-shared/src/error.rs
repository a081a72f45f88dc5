//! Error types for monoinject.

use thiserror::Error;

use crate::mono::{ArgKind, ImageOpenStatus, MonoFunction};
use crate::process::CallStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Configuration(String),

    #[error("Unable to find target module \"{0}\" in remote process.")]
    ModuleNotFound(String),

    #[error("Unable to get required remote procedure \"{0}\".")]
    MissingExport(String),

    #[error("Target process is no longer valid.")]
    ProcessInvalid,

    #[error("Unable to retrieve main thread.")]
    NoLiveThread,

    #[error("{context}: remote call to {function} failed: {reason}")]
    StageCall {
        context: String,
        function: MonoFunction,
        status: CallStatus,
        reason: String,
    },

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("Unable to find unique process with the executable name \"{0}\".")]
    ProcessNotFound(String),

    #[error("Found {count} processes with the executable name \"{name}\", expected exactly one.")]
    AmbiguousProcess { name: String, count: usize },

    #[error("Failed to attach to process {pid}: {reason}")]
    Attach { pid: u32, reason: String },

    #[error("Process mode mismatch. Both processes must be either 32-bit or both 64-bit.")]
    ArchitectureMismatch,

    #[error("Remote injection is not supported on this platform.")]
    UnsupportedPlatform,

    #[error("{function} argument {index} was bound as {bound:?}, cannot rebind as {given:?}")]
    SignatureMismatch {
        function: MonoFunction,
        index: usize,
        bound: ArgKind,
        given: ArgKind,
    },

    #[error("{0}")]
    Marshal(String),
}

/// The call succeeded but its result is not usable by the next stage.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("Unable to acquire root mono domain: {reason}")]
    DomainUnavailable { reason: String },

    #[error("Unable to retrieve assembly: {status}")]
    AssemblyLoad { status: ImageOpenStatus },

    #[error("Unable to generate image from assembly: Returned image is null.")]
    ImageUnavailable,

    #[error("Unable to retrieve class \"{qualified_name}\": Class could not be found.")]
    ClassNotFound { qualified_name: String },

    #[error("Unable to retrieve the method \"{method}\": Method could not be found.")]
    MethodNotFound { method: String },
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    BridgeConstruction,
    ProcessInvalid,
    StageCall,
    StageSemantic,
    Attach,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::ModuleNotFound(_) | Error::MissingExport(_) => ErrorKind::BridgeConstruction,
            Error::ProcessInvalid | Error::NoLiveThread => ErrorKind::ProcessInvalid,
            Error::StageCall { .. } => ErrorKind::StageCall,
            Error::Stage(_) => ErrorKind::StageSemantic,
            Error::ProcessNotFound(_)
            | Error::AmbiguousProcess { .. }
            | Error::Attach { .. }
            | Error::ArchitectureMismatch
            | Error::UnsupportedPlatform => ErrorKind::Attach,
            Error::SignatureMismatch { .. } | Error::Marshal(_) => ErrorKind::Internal,
        }
    }
}

impl PartialEq<StageError> for Error {
    fn eq(&self, other: &StageError) -> bool {
        matches!(self, Error::Stage(inner) if inner == other)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
