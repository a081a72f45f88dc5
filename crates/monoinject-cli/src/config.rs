//! Validation of command-line options into an injection request.

use std::path::Path;
use std::time::Duration;

use monoinject_shared::{Error, InjectionRequest, ProcessTarget, Result, executable_name};

use crate::Cli;

/// Everything the run needs, validated.
#[derive(Debug)]
pub struct Settings {
    pub request: InjectionRequest,
    pub call_timeout: Option<Duration>,
}

impl Settings {
    /// Target as shown to the user.
    pub fn target_label(&self) -> String {
        match &self.request.target {
            Some(ProcessTarget::Name(name)) => name.clone(),
            Some(ProcessTarget::Pid(pid)) => format!("PID {}", pid),
            None => "<no target>".to_string(),
        }
    }
}

fn require_non_empty(values: &[Option<&str>]) -> Result<()> {
    if values.iter().flatten().any(|value| value.is_empty()) {
        return Err(Error::Configuration(
            "Arguments must be non-empty strings".into(),
        ));
    }
    Ok(())
}

/// Check the options and build the request.
pub fn load(cli: &Cli) -> Result<Settings> {
    require_non_empty(&[
        Some(cli.dll.as_str()),
        Some(cli.namespace.as_str()),
        Some(cli.class.as_str()),
        Some(cli.method.as_str()),
        cli.exe.as_deref(),
        cli.module.as_deref(),
    ])?;

    let assembly_path = std::path::absolute(Path::new(&cli.dll)).map_err(|e| {
        Error::Configuration(format!("Unable to resolve the DLL path \"{}\": {}", cli.dll, e))
    })?;
    if !assembly_path.is_file() {
        return Err(Error::Configuration(format!(
            "The DLL path \"{}\" does not exist!",
            assembly_path.display()
        )));
    }

    let target = match (&cli.exe, cli.pid) {
        (_, Some(pid)) => ProcessTarget::Pid(pid),
        (Some(exe), None) => ProcessTarget::Name(executable_name(exe).ok_or_else(|| {
            Error::Configuration(format!("The executable name \"{}\" is invalid.", exe))
        })?),
        (None, None) => {
            return Err(Error::Configuration(
                "Must specify either --exe or --pid".into(),
            ));
        }
    };

    let call_timeout = match cli.call_timeout_ms {
        Some(0) => {
            return Err(Error::Configuration(
                "--call-timeout-ms must be greater than zero".into(),
            ));
        }
        other => other.map(Duration::from_millis),
    };

    let mut request = InjectionRequest::new(assembly_path, &cli.namespace, &cli.class, &cli.method)
        .with_target(target);
    if let Some(module) = &cli.module {
        request = request.with_runtime_module(module);
    }

    Ok(Settings {
        request,
        call_timeout,
    })
}
