//! In-memory stand-in for an attached process running Mono.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::mono::MonoFunction;
use crate::process::{
    CallOutcome, CallStatus, ModuleRef, ProcessProvider, RemoteAddress, RemoteArg, RemoteProcess,
    ThreadRef,
};
use crate::{Error, Result};

pub const MAIN_THREAD_ID: u32 = 4242;
pub const FAKE_PID: u32 = 1337;

pub const ASSEMBLY_PATH: &str = "C:\\payload\\ExampleAssembly.dll";
const NAMESPACE: &str = "ExampleAssembly";
const CLASS: &str = "Example";

const MODULE_BASE: u64 = 0x7FF8_0000_0000;
const ROOT_DOMAIN: u64 = 0x0000_0200_0000_1000;
const ASSEMBLY: u64 = 0x0000_0200_0000_2000;
const IMAGE: u64 = 0x0000_0200_0000_3000;
const CLASS_HANDLE: u64 = 0x0000_0200_0000_4000;
const ON_LOAD: u64 = 0x0000_0200_0000_5000;
const ON_UNLOAD: u64 = 0x0000_0200_0000_5010;

struct State {
    alive: Cell<bool>,
    has_thread: Cell<bool>,
    module_name: RefCell<String>,
    exports: RefCell<Vec<(&'static str, RemoteAddress)>>,
    probed: RefCell<Vec<String>>,
    prepares: RefCell<HashMap<MonoFunction, usize>>,
    calls: RefCell<Vec<(MonoFunction, u32)>>,
    invoked: RefCell<Vec<RemoteAddress>>,
    failures: RefCell<HashMap<MonoFunction, CallStatus>>,
    live_frames: Rc<Cell<usize>>,
    root_domain: Cell<u64>,
    open_status: Cell<i32>,
    null_assembly: Cell<bool>,
    null_image: Cell<bool>,
    invoke_result: Cell<u64>,
}

/// Clones share state, so a test can keep inspecting a process it handed away.
#[derive(Clone)]
pub struct FakeProcess {
    state: Rc<State>,
}

pub struct FakeFrame {
    function: MonoFunction,
    live: Rc<Cell<usize>>,
}

impl Drop for FakeFrame {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

impl FakeProcess {
    /// A live process with `mono.dll` loaded and exporting every required symbol.
    pub fn mono() -> Self {
        let exports = MonoFunction::ALL
            .iter()
            .enumerate()
            .map(|(index, function)| {
                let address = MODULE_BASE + 0x1000 + index as u64 * 0x40;
                (function.symbol(), RemoteAddress(address))
            })
            .collect();

        Self {
            state: Rc::new(State {
                alive: Cell::new(true),
                has_thread: Cell::new(true),
                module_name: RefCell::new("mono.dll".to_string()),
                exports: RefCell::new(exports),
                probed: RefCell::new(Vec::new()),
                prepares: RefCell::new(HashMap::new()),
                calls: RefCell::new(Vec::new()),
                invoked: RefCell::new(Vec::new()),
                failures: RefCell::new(HashMap::new()),
                live_frames: Rc::new(Cell::new(0)),
                root_domain: Cell::new(ROOT_DOMAIN),
                open_status: Cell::new(0),
                null_assembly: Cell::new(false),
                null_image: Cell::new(false),
                invoke_result: Cell::new(0),
            }),
        }
    }

    pub fn with_module_name(self, name: &str) -> Self {
        *self.state.module_name.borrow_mut() = name.to_string();
        self
    }

    pub fn without_export(self, symbol: &str) -> Self {
        self.state
            .exports
            .borrow_mut()
            .retain(|(name, _)| *name != symbol);
        self
    }

    pub fn without_thread(self) -> Self {
        self.state.has_thread.set(false);
        self
    }

    pub fn with_null_root_domain(self) -> Self {
        self.state.root_domain.set(0);
        self
    }

    pub fn with_call_failure(self, function: MonoFunction, status: CallStatus) -> Self {
        self.state.failures.borrow_mut().insert(function, status);
        self
    }

    /// Make `mono_assembly_open` report `status` and return null.
    pub fn with_open_status(self, status: i32) -> Self {
        self.state.open_status.set(status);
        self
    }

    /// Make `mono_assembly_open` return null while reporting success.
    pub fn with_null_assembly(self) -> Self {
        self.state.null_assembly.set(true);
        self
    }

    pub fn with_null_image(self) -> Self {
        self.state.null_image.set(true);
        self
    }

    pub fn with_invoke_result(self, value: u64) -> Self {
        self.state.invoke_result.set(value);
        self
    }

    pub fn kill(&self) {
        self.state.alive.set(false);
    }

    pub fn export_address(&self, symbol: &str) -> RemoteAddress {
        self.state
            .exports
            .borrow()
            .iter()
            .find(|(name, _)| *name == symbol)
            .map(|(_, address)| *address)
            .unwrap_or(RemoteAddress::NULL)
    }

    pub fn root_domain(&self) -> RemoteAddress {
        RemoteAddress(self.state.root_domain.get())
    }

    pub fn probed_symbols(&self) -> Vec<String> {
        self.state.probed.borrow().clone()
    }

    pub fn prepare_count(&self, function: MonoFunction) -> usize {
        self.state
            .prepares
            .borrow()
            .get(&function)
            .copied()
            .unwrap_or(0)
    }

    pub fn call_count(&self, function: MonoFunction) -> usize {
        self.state
            .calls
            .borrow()
            .iter()
            .filter(|(called, _)| *called == function)
            .count()
    }

    pub fn call_order(&self) -> Vec<MonoFunction> {
        self.state.calls.borrow().iter().map(|(f, _)| *f).collect()
    }

    pub fn call_threads(&self) -> Vec<u32> {
        self.state.calls.borrow().iter().map(|(_, t)| *t).collect()
    }

    pub fn invoked_methods(&self) -> Vec<RemoteAddress> {
        self.state.invoked.borrow().clone()
    }

    pub fn live_frames(&self) -> usize {
        self.state.live_frames.get()
    }

    fn emulate(&self, function: MonoFunction, args: &mut [RemoteArg]) -> u64 {
        let state = &self.state;
        match function {
            MonoFunction::GetRootDomain => state.root_domain.get(),
            MonoFunction::AssemblyOpen => {
                let forced = state.open_status.get();
                let (status, assembly) = if forced != 0 {
                    (forced, 0)
                } else if state.null_assembly.get() {
                    (0, 0)
                } else if c_str_arg(args, 0) == Some(ASSEMBLY_PATH) {
                    (0, ASSEMBLY)
                } else {
                    (1, 0)
                };
                if let Some(slot) = args.get_mut(1) {
                    *slot = RemoteArg::OutInt32(status);
                }
                assembly
            }
            MonoFunction::AssemblyGetImage => {
                if pointer_arg(args, 0) == ASSEMBLY && !state.null_image.get() {
                    IMAGE
                } else {
                    0
                }
            }
            MonoFunction::ClassFromName => {
                let found = pointer_arg(args, 0) == IMAGE
                    && c_str_arg(args, 1) == Some(NAMESPACE)
                    && c_str_arg(args, 2) == Some(CLASS);
                if found { CLASS_HANDLE } else { 0 }
            }
            MonoFunction::ClassGetMethodFromName => {
                if pointer_arg(args, 0) != CLASS_HANDLE
                    || !matches!(args.get(2), Some(RemoteArg::Int32(0)))
                {
                    return 0;
                }
                match c_str_arg(args, 1) {
                    Some("OnLoad") => ON_LOAD,
                    Some("OnUnload") => ON_UNLOAD,
                    _ => 0,
                }
            }
            MonoFunction::RuntimeInvoke => {
                state
                    .invoked
                    .borrow_mut()
                    .push(RemoteAddress(pointer_arg(args, 0)));
                state.invoke_result.get()
            }
        }
    }
}

fn pointer_arg(args: &[RemoteArg], index: usize) -> u64 {
    match args.get(index) {
        Some(RemoteArg::Pointer(address)) => address.0,
        _ => 0,
    }
}

fn c_str_arg(args: &[RemoteArg], index: usize) -> Option<&str> {
    match args.get(index) {
        Some(RemoteArg::CStr(value)) => value.to_str().ok(),
        _ => None,
    }
}

impl RemoteProcess for FakeProcess {
    type Frame = FakeFrame;

    fn is_valid(&self) -> bool {
        self.state.alive.get()
    }

    fn find_module(&self, name: &str) -> Option<ModuleRef> {
        let module_name = self.state.module_name.borrow();
        module_name.eq_ignore_ascii_case(name).then(|| ModuleRef {
            name: module_name.clone(),
            base: RemoteAddress(MODULE_BASE),
        })
    }

    fn find_export(&self, _module: &ModuleRef, symbol: &str) -> RemoteAddress {
        self.state.probed.borrow_mut().push(symbol.to_string());
        self.export_address(symbol)
    }

    fn live_thread(&self) -> Option<ThreadRef> {
        self.state
            .has_thread
            .get()
            .then_some(ThreadRef { id: MAIN_THREAD_ID })
    }

    fn prepare_call(&self, _address: RemoteAddress, function: MonoFunction) -> Result<FakeFrame> {
        *self.state.prepares.borrow_mut().entry(function).or_insert(0) += 1;
        let live = Rc::clone(&self.state.live_frames);
        live.set(live.get() + 1);
        Ok(FakeFrame { function, live })
    }

    fn call(&self, frame: &mut FakeFrame, args: &mut [RemoteArg], thread: &ThreadRef) -> CallOutcome {
        self.state.calls.borrow_mut().push((frame.function, thread.id));
        if let Some(status) = self.state.failures.borrow().get(&frame.function) {
            return CallOutcome::failure(*status);
        }
        CallOutcome::success(self.emulate(frame.function, args))
    }
}

/// Provider handing out [`FakeProcess`]es.
pub struct FakeProvider {
    pids: Vec<u32>,
    module_name: String,
    missing_exports: Vec<String>,
    fail_attach: bool,
    enumerated: RefCell<Vec<String>>,
    attached: RefCell<Option<FakeProcess>>,
}

impl FakeProvider {
    /// Exactly one matching process.
    pub fn single() -> Self {
        Self::with_pids(vec![FAKE_PID])
    }

    pub fn with_pids(pids: Vec<u32>) -> Self {
        Self {
            pids,
            module_name: "mono.dll".to_string(),
            missing_exports: Vec::new(),
            fail_attach: false,
            enumerated: RefCell::new(Vec::new()),
            attached: RefCell::new(None),
        }
    }

    pub fn with_module_name(mut self, name: &str) -> Self {
        self.module_name = name.to_string();
        self
    }

    pub fn without_export(mut self, symbol: &str) -> Self {
        self.missing_exports.push(symbol.to_string());
        self
    }

    pub fn failing_attach(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    /// Names passed to `enumerate_by_name`.
    pub fn enumerated(&self) -> Vec<String> {
        self.enumerated.borrow().clone()
    }

    pub fn last_attached(&self) -> Option<FakeProcess> {
        self.attached.borrow().clone()
    }
}

impl ProcessProvider for FakeProvider {
    type Process = FakeProcess;

    fn enumerate_by_name(&self, name: &str) -> Result<Vec<u32>> {
        self.enumerated.borrow_mut().push(name.to_string());
        Ok(self.pids.clone())
    }

    fn attach(&self, pid: u32) -> Result<FakeProcess> {
        if self.fail_attach {
            return Err(Error::Attach {
                pid,
                reason: "Access is denied.".to_string(),
            });
        }
        let process = self
            .missing_exports
            .iter()
            .fold(FakeProcess::mono().with_module_name(&self.module_name), |p, s| {
                p.without_export(s)
            });
        *self.attached.borrow_mut() = Some(process.clone());
        Ok(process)
    }
}
