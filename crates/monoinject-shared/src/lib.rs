//! Shared core of monoinject
//!
//! Drives the Mono embedding API inside a foreign process to load a managed
//! assembly and call one static method in it.
//!
//! # Architecture
//!
//! - [`SymbolTable`] - Resolves the required Mono exports in the target
//! - [`ProxyCache`] - One reusable remote call binding per Mono function
//! - [`MonoBridge`] - The six-stage domain → method pipeline
//! - [`inject`] - End-to-end driver over a [`ProcessProvider`]
//!
//! Operating-system access lives behind [`RemoteProcess`] and
//! [`ProcessProvider`]; the CLI crate provides the Windows implementation.

pub mod bridge;
pub mod driver;
pub mod error;
pub mod exports;
pub mod mono;
pub mod process;
pub mod proxy;
pub mod request;

#[cfg(test)]
mod testing;

pub use bridge::MonoBridge;
pub use driver::{InjectionFailure, inject};
pub use error::{Error, ErrorKind, Result, StageError};
pub use exports::SymbolTable;
pub use mono::{
    ArgKind, CallingConvention, ImageOpenStatus, MonoAssembly, MonoClass, MonoDomain,
    MonoFunction, MonoImage, MonoMethod, MonoObject,
};
pub use process::{
    CallOutcome, CallStatus, ModuleRef, ProcessProvider, RemoteAddress, RemoteArg, RemoteProcess,
    ThreadRef,
};
pub use proxy::{ProxyCache, RemoteFunction};
pub use request::{
    DEFAULT_RUNTIME_MODULES, InjectionRequest, InvocationResult, ProcessTarget, executable_name,
};
