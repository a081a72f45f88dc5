//! The remote Mono resolution pipeline.
//!
//! [`MonoBridge`] walks `root domain → assembly → image → class → method` in
//! the foreign process and finally invokes the method. Each stage is one
//! remote call through the [`ProxyCache`]; any failure ends the pipeline.

use tracing::info;

use crate::exports::SymbolTable;
use crate::mono::{
    ImageOpenStatus, MonoAssembly, MonoClass, MonoDomain, MonoFunction, MonoImage, MonoMethod,
    MonoObject,
};
use crate::process::{CallOutcome, RemoteAddress, RemoteArg, RemoteProcess};
use crate::proxy::ProxyCache;
use crate::request::{InjectionRequest, InvocationResult};
use crate::{Error, Result, StageError};

/// Only parameterless entry points can be invoked.
const ENTRY_POINT_PARAM_COUNT: i32 = 0;

/// Bridge to the Mono runtime of one attached process, for one injection attempt.
///
/// Dropping the bridge releases every cached proxy.
pub struct MonoBridge<'p, P: RemoteProcess> {
    process: &'p P,
    symbols: SymbolTable,
    proxies: ProxyCache<P::Frame>,
    root_domain: Option<MonoDomain>,
}

impl<'p, P: RemoteProcess> MonoBridge<'p, P> {
    /// Resolve the required exports of `module_name` and build the bridge.
    pub fn new(process: &'p P, module_name: &str) -> Result<Self> {
        let symbols = SymbolTable::resolve(process, module_name)?;
        Ok(Self {
            process,
            symbols,
            proxies: ProxyCache::new(),
            root_domain: None,
        })
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Number of proxies constructed so far.
    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    /// Root domain from the cache, if it has been fetched.
    pub fn cached_root_domain(&self) -> Option<MonoDomain> {
        self.root_domain
    }

    fn call(
        &mut self,
        function: MonoFunction,
        args: Vec<RemoteArg>,
    ) -> Result<(CallOutcome, &[RemoteArg])> {
        let address = self.symbols.address(function);
        self.proxies.call(self.process, function, address, args)
    }

    fn call_failed(&self, context: String, function: MonoFunction, outcome: CallOutcome) -> Error {
        Error::StageCall {
            context,
            function,
            status: outcome.status,
            reason: self.process.status_message(outcome.status),
        }
    }

    /// Get the root domain, fetching it remotely only the first time.
    pub fn get_root_domain(&mut self) -> Result<MonoDomain> {
        if let Some(domain) = self.root_domain {
            return Ok(domain);
        }

        let (outcome, _) = self.call(MonoFunction::GetRootDomain, Vec::new())?;
        if !outcome.status.is_success() {
            let reason = self.process.status_message(outcome.status);
            return Err(StageError::DomainUnavailable { reason }.into());
        }
        let domain = MonoDomain::new(RemoteAddress(outcome.value)).ok_or_else(|| {
            StageError::DomainUnavailable {
                reason: "Returned domain is null.".to_string(),
            }
        })?;

        self.root_domain = Some(domain);
        Ok(domain)
    }

    /// Load the assembly at `path` into the target's runtime.
    pub fn open_assembly(&mut self, path: &str) -> Result<MonoAssembly> {
        let args = vec![
            RemoteArg::c_str(path)?,
            RemoteArg::OutInt32(ImageOpenStatus::Ok.raw()),
        ];
        let (outcome, args) = self.call(MonoFunction::AssemblyOpen, args)?;
        let status = match args.get(1) {
            Some(RemoteArg::OutInt32(raw)) => ImageOpenStatus::from_raw(*raw),
            _ => ImageOpenStatus::Ok,
        };

        if !outcome.status.is_success() {
            return Err(self.call_failed(
                "Unable to load assembly".into(),
                MonoFunction::AssemblyOpen,
                outcome,
            ));
        }
        if !status.is_ok() {
            return Err(StageError::AssemblyLoad { status }.into());
        }
        MonoAssembly::new(RemoteAddress(outcome.value)).ok_or_else(|| {
            // a null assembly with an OK status is still a failed load
            StageError::AssemblyLoad {
                status: ImageOpenStatus::Unknown(status.raw()),
            }
            .into()
        })
    }

    /// Get the metadata image of a loaded assembly.
    pub fn assembly_image(&mut self, assembly: MonoAssembly) -> Result<MonoImage> {
        let args = vec![RemoteArg::Pointer(assembly.address())];
        let (outcome, _) = self.call(MonoFunction::AssemblyGetImage, args)?;
        if !outcome.status.is_success() {
            return Err(self.call_failed(
                "Unable to generate image from assembly".into(),
                MonoFunction::AssemblyGetImage,
                outcome,
            ));
        }
        MonoImage::new(RemoteAddress(outcome.value))
            .ok_or_else(|| StageError::ImageUnavailable.into())
    }

    /// Find `namespace.class_name` in an image.
    pub fn class_from_name(
        &mut self,
        image: MonoImage,
        namespace: &str,
        class_name: &str,
    ) -> Result<MonoClass> {
        let args = vec![
            RemoteArg::Pointer(image.address()),
            RemoteArg::c_str(namespace)?,
            RemoteArg::c_str(class_name)?,
        ];
        let (outcome, _) = self.call(MonoFunction::ClassFromName, args)?;
        if !outcome.status.is_success() {
            let context = format!(
                "Unable to retrieve class \"{}\"",
                qualified_name(namespace, class_name)
            );
            return Err(self.call_failed(context, MonoFunction::ClassFromName, outcome));
        }
        MonoClass::new(RemoteAddress(outcome.value)).ok_or_else(|| {
            StageError::ClassNotFound {
                qualified_name: qualified_name(namespace, class_name),
            }
            .into()
        })
    }

    /// Find a method by name and parameter count.
    pub fn method_from_name(
        &mut self,
        class: MonoClass,
        method_name: &str,
        param_count: i32,
    ) -> Result<MonoMethod> {
        let args = vec![
            RemoteArg::Pointer(class.address()),
            RemoteArg::c_str(method_name)?,
            RemoteArg::Int32(param_count),
        ];
        let (outcome, _) = self.call(MonoFunction::ClassGetMethodFromName, args)?;
        if !outcome.status.is_success() {
            let context = format!("Unable to retrieve the method \"{}\"", method_name);
            return Err(self.call_failed(context, MonoFunction::ClassGetMethodFromName, outcome));
        }
        MonoMethod::new(RemoteAddress(outcome.value)).ok_or_else(|| {
            StageError::MethodNotFound {
                method: method_name.to_string(),
            }
            .into()
        })
    }

    /// Invoke a static, parameterless method.
    ///
    /// No instance, no arguments and no exception slot are passed. A null
    /// return is normal for `void` methods and for methods that threw.
    pub fn runtime_invoke(&mut self, method: MonoMethod) -> Result<Option<MonoObject>> {
        let args = vec![
            RemoteArg::Pointer(method.address()),
            RemoteArg::null(),
            RemoteArg::null(),
            RemoteArg::null(),
        ];
        let (outcome, _) = self.call(MonoFunction::RuntimeInvoke, args)?;
        if !outcome.status.is_success() {
            return Err(self.call_failed(
                "Unable to invoke the given method".into(),
                MonoFunction::RuntimeInvoke,
                outcome,
            ));
        }
        Ok(MonoObject::new(RemoteAddress(outcome.value)))
    }

    /// Run all six stages for `request`.
    pub fn resolve_and_invoke(&mut self, request: &InjectionRequest) -> Result<InvocationResult> {
        let domain = self.get_root_domain()?;
        log_address("Mono Domain", domain.address());

        let assembly_path = request.assembly_path_str()?;
        let assembly = self.open_assembly(assembly_path)?;
        log_address("Assembly", assembly.address());

        let image = self.assembly_image(assembly)?;
        log_address("Image", image.address());

        let class = self.class_from_name(image, &request.namespace, &request.class_name)?;
        log_address("Class", class.address());

        let method =
            self.method_from_name(class, &request.method_name, ENTRY_POINT_PARAM_COUNT)?;
        log_address("Method", method.address());

        let returned = self.runtime_invoke(method)?;

        Ok(InvocationResult {
            domain,
            assembly,
            image,
            class,
            method,
            returned,
        })
    }
}

fn qualified_name(namespace: &str, class_name: &str) -> String {
    if namespace.is_empty() {
        class_name.to_string()
    } else {
        format!("{}.{}", namespace, class_name)
    }
}

fn log_address(name: &str, address: RemoteAddress) {
    info!(target: "monoinject::bridge", "{}: {}", name, address);
}
