//! Remote function proxies and their cache.
//!
//! A [`RemoteFunction`] binds a remote address, a call descriptor and the
//! collaborator's call frame. Creating one can be expensive (the frame usually
//! lives in the foreign process), so the [`ProxyCache`] creates at most one per
//! [`MonoFunction`] and only rebinds arguments afterwards.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::mono::MonoFunction;
use crate::process::{CallOutcome, RemoteAddress, RemoteArg, RemoteProcess, ThreadRef};
use crate::{Error, Result};

/// A reusable binding between a remote function and its argument storage.
pub struct RemoteFunction<F> {
    function: MonoFunction,
    address: RemoteAddress,
    frame: F,
    args: Vec<RemoteArg>,
}

impl<F> RemoteFunction<F> {
    /// Prepare a frame for `function` and bind the initial arguments.
    pub fn bind<P>(
        process: &P,
        function: MonoFunction,
        address: RemoteAddress,
        args: Vec<RemoteArg>,
    ) -> Result<Self>
    where
        P: RemoteProcess<Frame = F>,
    {
        check_signature(function, &args)?;
        let frame = process.prepare_call(address, function)?;
        Ok(Self {
            function,
            address,
            frame,
            args,
        })
    }

    /// Replace one argument, keeping the kind it was originally bound with.
    pub fn set_arg(&mut self, index: usize, arg: RemoteArg) -> Result<()> {
        let slot = self.args.get_mut(index).ok_or_else(|| {
            Error::Marshal(format!(
                "{} has no argument {} to rebind",
                self.function, index
            ))
        })?;
        if slot.kind() != arg.kind() {
            return Err(Error::SignatureMismatch {
                function: self.function,
                index,
                bound: slot.kind(),
                given: arg.kind(),
            });
        }
        *slot = arg;
        Ok(())
    }

    /// Rebind every argument for the next call.
    ///
    /// All kinds are checked before anything is replaced, so a rejected
    /// rebind leaves the previous arguments bound.
    pub fn rebind(&mut self, args: Vec<RemoteArg>) -> Result<()> {
        if args.len() != self.args.len() {
            return Err(Error::Marshal(format!(
                "{} takes {} arguments, got {}",
                self.function,
                self.args.len(),
                args.len()
            )));
        }
        for (index, (bound, given)) in self.args.iter().zip(&args).enumerate() {
            if bound.kind() != given.kind() {
                return Err(Error::SignatureMismatch {
                    function: self.function,
                    index,
                    bound: bound.kind(),
                    given: given.kind(),
                });
            }
        }
        self.args = args;
        Ok(())
    }

    /// Execute the call with the currently bound arguments.
    pub fn invoke<P>(&mut self, process: &P, thread: &ThreadRef) -> CallOutcome
    where
        P: RemoteProcess<Frame = F>,
    {
        trace!(
            target: "monoinject::proxy",
            function = %self.function,
            address = %self.address,
            thread = thread.id,
            "Calling remote function"
        );
        process.call(&mut self.frame, &mut self.args, thread)
    }

    pub fn function(&self) -> MonoFunction {
        self.function
    }

    pub fn address(&self) -> RemoteAddress {
        self.address
    }

    /// Currently bound arguments, including values written back by the last call.
    pub fn args(&self) -> &[RemoteArg] {
        &self.args
    }
}

fn check_signature(function: MonoFunction, args: &[RemoteArg]) -> Result<()> {
    let params = function.params();
    if params.len() != args.len() {
        return Err(Error::Marshal(format!(
            "{} takes {} arguments, got {}",
            function,
            params.len(),
            args.len()
        )));
    }
    for (index, (expected, arg)) in params.iter().zip(args).enumerate() {
        if *expected != arg.kind() {
            return Err(Error::SignatureMismatch {
                function,
                index,
                bound: *expected,
                given: arg.kind(),
            });
        }
    }
    Ok(())
}

/// Owns one proxy per remote function kind until dropped.
pub struct ProxyCache<F> {
    proxies: HashMap<MonoFunction, RemoteFunction<F>>,
}

impl<F> Default for ProxyCache<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> ProxyCache<F> {
    pub fn new() -> Self {
        Self {
            proxies: HashMap::new(),
        }
    }

    /// Get the proxy for `function`, constructing it on first use and
    /// rebinding `args` otherwise.
    pub fn get_proxy<P>(
        &mut self,
        process: &P,
        function: MonoFunction,
        address: RemoteAddress,
        args: Vec<RemoteArg>,
    ) -> Result<&mut RemoteFunction<F>>
    where
        P: RemoteProcess<Frame = F>,
    {
        use std::collections::hash_map::Entry;

        match self.proxies.entry(function) {
            Entry::Occupied(entry) => {
                let proxy = entry.into_mut();
                proxy.rebind(args)?;
                debug!(target: "monoinject::proxy", function = %function, "Rebound cached proxy");
                Ok(proxy)
            }
            Entry::Vacant(entry) => {
                let proxy = RemoteFunction::bind(process, function, address, args)?;
                debug!(
                    target: "monoinject::proxy",
                    function = %function,
                    address = %address,
                    "Constructed proxy"
                );
                Ok(entry.insert(proxy))
            }
        }
    }

    /// Validate the process, bind the proxy and run the call on the live thread.
    ///
    /// Returns the outcome together with the proxy's arguments as they stand
    /// after the call, so out parameters can be read.
    pub fn call<P>(
        &mut self,
        process: &P,
        function: MonoFunction,
        address: RemoteAddress,
        args: Vec<RemoteArg>,
    ) -> Result<(CallOutcome, &[RemoteArg])>
    where
        P: RemoteProcess<Frame = F>,
    {
        if !process.is_valid() {
            return Err(Error::ProcessInvalid);
        }
        let thread = process.live_thread().ok_or(Error::NoLiveThread)?;

        let proxy = self.get_proxy(process, function, address, args)?;
        let outcome = proxy.invoke(process, &thread);
        Ok((outcome, proxy.args()))
    }

    pub fn contains(&self, function: MonoFunction) -> bool {
        self.proxies.contains_key(&function)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Drop every proxy, releasing their frames.
    pub fn clear(&mut self) {
        self.proxies.clear();
    }
}
