// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use stack_tape::program::Program;
use stack_tape::value::{FuncId, NativeId};
use std::collections::HashMap;
use std::string::String;

/// Optional label resolver for profiling scopes.
///
/// Return `None` to fall back to the default id-based labels.
pub trait LabelResolver {
    /// Resolve a label for a call-frame scope.
    fn call_frame_label(&mut self, _func: FuncId, _program: &Program) -> Option<String> {
        None
    }

    /// Resolve a label for a native-call scope.
    fn native_call_label(
        &mut self,
        _native: NativeId,
        _table_index: u16,
        _program: &Program,
    ) -> Option<String> {
        None
    }
}

/// Default resolver that keeps stable id-based labels.
#[derive(Default, Debug)]
pub struct DefaultLabelResolver;

impl LabelResolver for DefaultLabelResolver {}

/// Resolver that uses function names recorded in the `Program` and embedder-supplied native
/// names.
///
/// The native pool carries no names, so native labels come from [`Self::name_native`].
#[derive(Default, Debug)]
pub struct ProgramSymbolResolver {
    native_names: HashMap<u16, String>,
    call_frame_cache: HashMap<FuncId, String>,
}

impl ProgramSymbolResolver {
    /// Names the native implementation at `table_index` (e.g. `"print"`).
    pub fn name_native(&mut self, table_index: u16, name: impl Into<String>) -> &mut Self {
        self.native_names.insert(table_index, name.into());
        self
    }
}

impl LabelResolver for ProgramSymbolResolver {
    fn call_frame_label(&mut self, func: FuncId, program: &Program) -> Option<String> {
        if let Some(label) = self.call_frame_cache.get(&func) {
            return Some(label.clone());
        }
        let name = program.function_name(func)?;
        let label = format!("func:{name}");
        self.call_frame_cache.insert(func, label.clone());
        Some(label)
    }

    fn native_call_label(
        &mut self,
        _native: NativeId,
        table_index: u16,
        _program: &Program,
    ) -> Option<String> {
        let name = self.native_names.get(&table_index)?;
        Some(format!("native:{name}"))
    }
}

pub(crate) fn default_call_frame_label(func: FuncId) -> String {
    format!("func:{}", func.0)
}

pub(crate) fn default_native_call_label(native: NativeId, table_index: u16) -> String {
    format!("native:{} table={table_index}", native.0)
}
