//! Mono embedding API surface used by the bridge.
//!
//! Every remote function the bridge calls is described by a [`MonoFunction`]
//! variant. The descriptor carries the exported symbol name, the calling
//! convention and the marshalling rule of each parameter, so the proxy layer
//! can dispatch all six calls through one generic operation.

use std::fmt;

use crate::process::RemoteAddress;

/// How a single parameter is passed to the remote function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// Pointer-sized value passed inline.
    Pointer,
    /// 32-bit integer passed inline.
    Int32,
    /// NUL-terminated UTF-8 string, copied into remote memory and passed by pointer.
    CStr,
    /// 32-bit out parameter, passed by pointer and read back after the call.
    OutInt32,
}

/// Calling convention of a remote function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// Mono is a plain C library; on x64 this is the platform ABI.
    Cdecl,
}

/// The closed set of Mono functions the bridge calls remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MonoFunction {
    /// `MonoDomain* mono_get_root_domain(void)`
    GetRootDomain,
    /// `MonoAssembly* mono_assembly_open(const char* filename, MonoImageOpenStatus* status)`
    AssemblyOpen,
    /// `MonoImage* mono_assembly_get_image(MonoAssembly* assembly)`
    AssemblyGetImage,
    /// `MonoClass* mono_class_from_name(MonoImage* image, const char* name_space, const char* name)`
    ClassFromName,
    /// `MonoMethod* mono_class_get_method_from_name(MonoClass* klass, const char* name, int param_count)`
    ClassGetMethodFromName,
    /// `MonoObject* mono_runtime_invoke(MonoMethod* method, void* obj, void** params, MonoObject** exc)`
    RuntimeInvoke,
}

impl MonoFunction {
    /// All functions in resolution order.
    pub const ALL: [MonoFunction; 6] = [
        MonoFunction::GetRootDomain,
        MonoFunction::AssemblyOpen,
        MonoFunction::AssemblyGetImage,
        MonoFunction::ClassFromName,
        MonoFunction::ClassGetMethodFromName,
        MonoFunction::RuntimeInvoke,
    ];

    /// Exported symbol name in the Mono runtime module.
    pub fn symbol(self) -> &'static str {
        match self {
            MonoFunction::GetRootDomain => "mono_get_root_domain",
            MonoFunction::AssemblyOpen => "mono_assembly_open",
            MonoFunction::AssemblyGetImage => "mono_assembly_get_image",
            MonoFunction::ClassFromName => "mono_class_from_name",
            MonoFunction::ClassGetMethodFromName => "mono_class_get_method_from_name",
            MonoFunction::RuntimeInvoke => "mono_runtime_invoke",
        }
    }

    pub fn convention(self) -> CallingConvention {
        CallingConvention::Cdecl
    }

    /// Marshalling rule for each parameter, in order.
    pub fn params(self) -> &'static [ArgKind] {
        match self {
            MonoFunction::GetRootDomain => &[],
            MonoFunction::AssemblyOpen => &[ArgKind::CStr, ArgKind::OutInt32],
            MonoFunction::AssemblyGetImage => &[ArgKind::Pointer],
            MonoFunction::ClassFromName => &[ArgKind::Pointer, ArgKind::CStr, ArgKind::CStr],
            MonoFunction::ClassGetMethodFromName => {
                &[ArgKind::Pointer, ArgKind::CStr, ArgKind::Int32]
            }
            MonoFunction::RuntimeInvoke => &[
                ArgKind::Pointer,
                ArgKind::Pointer,
                ArgKind::Pointer,
                ArgKind::Pointer,
            ],
        }
    }
}

impl fmt::Display for MonoFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(RemoteAddress);

        impl $name {
            /// Wrap a remote pointer, rejecting null.
            pub fn new(address: RemoteAddress) -> Option<Self> {
                (!address.is_null()).then_some(Self(address))
            }

            pub fn address(self) -> RemoteAddress {
                self.0
            }
        }
    };
}

opaque_handle!(
    /// `MonoDomain*` in the foreign process.
    MonoDomain
);
opaque_handle!(
    /// `MonoAssembly*` in the foreign process.
    MonoAssembly
);
opaque_handle!(
    /// `MonoImage*` in the foreign process.
    MonoImage
);
opaque_handle!(
    /// `MonoClass*` in the foreign process.
    MonoClass
);
opaque_handle!(
    /// `MonoMethod*` in the foreign process.
    MonoMethod
);
opaque_handle!(
    /// `MonoObject*` returned by an invocation.
    MonoObject
);

/// `MonoImageOpenStatus` as written by `mono_assembly_open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOpenStatus {
    Ok,
    ErrorErrno,
    MissingAssemblyRef,
    ImageInvalid,
    Unknown(i32),
}

impl ImageOpenStatus {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ImageOpenStatus::Ok,
            1 => ImageOpenStatus::ErrorErrno,
            2 => ImageOpenStatus::MissingAssemblyRef,
            3 => ImageOpenStatus::ImageInvalid,
            other => ImageOpenStatus::Unknown(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            ImageOpenStatus::Ok => 0,
            ImageOpenStatus::ErrorErrno => 1,
            ImageOpenStatus::MissingAssemblyRef => 2,
            ImageOpenStatus::ImageInvalid => 3,
            ImageOpenStatus::Unknown(raw) => raw,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ImageOpenStatus::Ok
    }

    /// Human-readable reason for the status.
    pub fn reason(self) -> &'static str {
        match self {
            ImageOpenStatus::Ok => "Success",
            // errno lives in the target process; we can only say what kind of failure it was
            ImageOpenStatus::ErrorErrno => "The runtime could not read the assembly file",
            ImageOpenStatus::MissingAssemblyRef => {
                "Assembly has a dependency that is not yet loaded"
            }
            ImageOpenStatus::ImageInvalid => "Invalid .NET assembly",
            ImageOpenStatus::Unknown(_) => "Unknown",
        }
    }
}

impl fmt::Display for ImageOpenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}
