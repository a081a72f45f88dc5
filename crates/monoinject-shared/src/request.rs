//! Injection request and result types.

use std::path::{Path, PathBuf};

use crate::mono::{MonoAssembly, MonoClass, MonoDomain, MonoImage, MonoMethod, MonoObject};
use crate::{Error, Result};

/// Runtime module names tried, in order, when the request does not name one.
pub const DEFAULT_RUNTIME_MODULES: &[&str] =
    &["mono.dll", "mono-2.0-bdwgc.dll", "mono-2.0-sgen.dll"];

/// Which process to inject into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessTarget {
    /// Executable file name; must match exactly one running process.
    Name(String),
    Pid(u32),
}

/// Everything needed for one injection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionRequest {
    pub assembly_path: PathBuf,
    pub namespace: String,
    pub class_name: String,
    pub method_name: String,
    pub target: Option<ProcessTarget>,
    /// Runtime module to resolve the Mono exports from.
    pub runtime_module: Option<String>,
}

impl InjectionRequest {
    pub fn new(
        assembly_path: impl Into<PathBuf>,
        namespace: impl Into<String>,
        class_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            assembly_path: assembly_path.into(),
            namespace: namespace.into(),
            class_name: class_name.into(),
            method_name: method_name.into(),
            target: None,
            runtime_module: None,
        }
    }

    pub fn with_target(mut self, target: ProcessTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_runtime_module(mut self, module: impl Into<String>) -> Self {
        self.runtime_module = Some(module.into());
        self
    }

    /// The assembly path as UTF-8, which is what Mono expects.
    pub fn assembly_path_str(&self) -> Result<&str> {
        self.assembly_path.to_str().ok_or_else(|| {
            Error::Configuration(format!(
                "The DLL path \"{}\" is not valid UTF-8.",
                self.assembly_path.display()
            ))
        })
    }

    /// File name of the assembly, for display.
    pub fn assembly_file_name(&self) -> String {
        self.assembly_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.assembly_path.display().to_string())
    }

    /// `Namespace::Class.Method()`
    pub fn entry_point(&self) -> String {
        format!(
            "{}::{}.{}()",
            self.namespace, self.class_name, self.method_name
        )
    }

    /// Runtime modules to try, in order.
    pub fn runtime_module_candidates(&self) -> Vec<&str> {
        match &self.runtime_module {
            Some(module) => vec![module.as_str()],
            None => DEFAULT_RUNTIME_MODULES.to_vec(),
        }
    }
}

/// Every link resolved by a successful pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationResult {
    pub domain: MonoDomain,
    pub assembly: MonoAssembly,
    pub image: MonoImage,
    pub class: MonoClass,
    pub method: MonoMethod,
    /// Boxed return value; `None` for `void` methods or when the method threw.
    pub returned: Option<MonoObject>,
}

/// Final path component of `path`, as the process enumeration expects.
pub fn executable_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}
