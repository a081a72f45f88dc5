//! Required symbol resolution.

use tracing::debug;

use crate::mono::MonoFunction;
use crate::process::{RemoteAddress, RemoteProcess};
use crate::{Error, Result};

/// Resolved addresses of every Mono function the bridge calls.
///
/// Only constructed by [`SymbolTable::resolve`], so every entry is non-null.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    module: String,
    addresses: [RemoteAddress; MonoFunction::ALL.len()],
}

impl SymbolTable {
    /// Locate `module_name` in the target and resolve all required symbols.
    ///
    /// Fails on the first missing symbol; no partial table is ever returned.
    pub fn resolve<P: RemoteProcess>(process: &P, module_name: &str) -> Result<Self> {
        let module = process
            .find_module(module_name)
            .ok_or_else(|| Error::ModuleNotFound(module_name.to_string()))?;

        debug!(
            target: "monoinject::exports",
            module = %module.name,
            base = %module.base,
            "Found runtime module"
        );

        let mut addresses = [RemoteAddress::NULL; MonoFunction::ALL.len()];
        for (slot, function) in addresses.iter_mut().zip(MonoFunction::ALL) {
            let address = process.find_export(&module, function.symbol());
            if address.is_null() {
                return Err(Error::MissingExport(function.symbol().to_string()));
            }
            debug!(target: "monoinject::exports", symbol = function.symbol(), address = %address);
            *slot = address;
        }

        Ok(Self {
            module: module.name,
            addresses,
        })
    }

    pub fn address(&self, function: MonoFunction) -> RemoteAddress {
        self.addresses[function as usize]
    }

    /// Name of the module the symbols were resolved from.
    pub fn module(&self) -> &str {
        &self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProcess;

    #[test]
    fn test_resolves_all_symbols() {
        let process = FakeProcess::mono();
        let table = SymbolTable::resolve(&process, "MONO.DLL").unwrap();

        assert_eq!(table.module(), "mono.dll");
        for function in MonoFunction::ALL {
            assert_eq!(
                table.address(function),
                process.export_address(function.symbol())
            );
        }
    }

    #[test]
    fn test_missing_module_probes_nothing() {
        let process = FakeProcess::mono();
        let err = SymbolTable::resolve(&process, "mono-2.0-bdwgc.dll").unwrap_err();

        assert!(matches!(err, Error::ModuleNotFound(ref name) if name == "mono-2.0-bdwgc.dll"));
        assert!(process.probed_symbols().is_empty());
    }

    #[test]
    fn test_missing_symbol_is_named_and_stops_probing() {
        let process = FakeProcess::mono().without_export("mono_assembly_get_image");
        let err = SymbolTable::resolve(&process, "mono.dll").unwrap_err();

        assert!(matches!(err, Error::MissingExport(ref s) if s == "mono_assembly_get_image"));
        assert_eq!(
            process.probed_symbols(),
            vec![
                "mono_get_root_domain",
                "mono_assembly_open",
                "mono_assembly_get_image"
            ]
        );
    }
}
