//! End-to-end injection for one request.

use thiserror::Error;
use tracing::{debug, info};

use crate::bridge::MonoBridge;
use crate::process::{ProcessProvider, RemoteProcess};
use crate::request::{InjectionRequest, InvocationResult, ProcessTarget};
use crate::{Error, Result};

/// The injection could not be completed.
#[derive(Debug, Error)]
#[error("{cause}")]
pub struct InjectionFailure {
    #[source]
    pub cause: Error,
}

impl From<Error> for InjectionFailure {
    fn from(cause: Error) -> Self {
        Self { cause }
    }
}

/// Find the target, attach, and run the whole pipeline.
///
/// The process handle and the bridge live only for this call.
pub fn inject<R: ProcessProvider>(
    provider: &R,
    request: &InjectionRequest,
) -> std::result::Result<InvocationResult, InjectionFailure> {
    let pid = resolve_pid(provider, request)?;
    let process = provider.attach(pid)?;
    info!(target: "monoinject::driver", pid, "Attached to target process");

    let module = select_runtime_module(&process, request)?;
    let mut bridge = MonoBridge::new(&process, &module)?;
    info!(
        target: "monoinject::driver",
        module = bridge.symbols().module(),
        "Resolved Mono exports"
    );

    Ok(bridge.resolve_and_invoke(request)?)
}

/// Resolve the request's target to a single pid.
pub fn resolve_pid<R: ProcessProvider>(provider: &R, request: &InjectionRequest) -> Result<u32> {
    match &request.target {
        Some(ProcessTarget::Pid(pid)) => Ok(*pid),
        Some(ProcessTarget::Name(name)) => {
            let pids = provider.enumerate_by_name(name)?;
            debug!(target: "monoinject::driver", name = %name, ?pids, "Enumerated processes");
            match pids.as_slice() {
                [pid] => {
                    info!(target: "monoinject::driver", name = %name, pid, "Found target process");
                    Ok(*pid)
                }
                [] => Err(Error::ProcessNotFound(name.clone())),
                many => Err(Error::AmbiguousProcess {
                    name: name.clone(),
                    count: many.len(),
                }),
            }
        }
        None => Err(Error::Configuration(
            "Must specify either --exe or --pid".into(),
        )),
    }
}

/// First runtime module candidate that is loaded in the target.
pub fn select_runtime_module<P: RemoteProcess>(
    process: &P,
    request: &InjectionRequest,
) -> Result<String> {
    let candidates = request.runtime_module_candidates();
    candidates
        .iter()
        .find_map(|name| process.find_module(name).map(|module| module.name))
        .ok_or_else(|| {
            Error::ModuleNotFound(candidates.first().copied().unwrap_or_default().to_string())
        })
}
