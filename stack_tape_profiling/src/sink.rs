// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::resolver::{
    DefaultLabelResolver, LabelResolver, default_call_frame_label, default_native_call_label,
};
use stack_tape::program::Program;
use stack_tape::trace::{ScopeKind, TraceMask, TraceOutcome, TraceSink};
use stack_tape::value::FuncId;
use std::format;
use std::string::String;
use std::vec::Vec;

/// One profiling span per live VM scope.
struct OpenScope {
    kind: ScopeKind,
    /// Interpreted frames live while this scope is open.
    depth: usize,
    // Held for its `Drop`, which ends the Tracy zone.
    _span: Option<tracy_client::Span>,
}

impl OpenScope {
    fn matches(&self, kind: ScopeKind, depth: usize) -> bool {
        self.kind == kind && self.depth == depth
    }
}

/// A [`TraceSink`] that mirrors VM call frames and native calls as Tracy spans.
///
/// Faulting runs are reported as Tracy messages carrying the fault location. A sink can be
/// reused across runs; any scope a run leaves open is closed when the next run starts or ends.
pub struct ProfilingTraceSink<R = DefaultLabelResolver> {
    resolver: R,
    open: Vec<OpenScope>,
    faulted_runs: u64,
}

impl ProfilingTraceSink<DefaultLabelResolver> {
    /// Creates a sink with id-based labels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: LabelResolver> ProfilingTraceSink<R> {
    /// Creates a sink with a custom label resolver.
    #[must_use]
    pub fn with_resolver(resolver: R) -> Self {
        Self {
            resolver,
            open: Vec::new(),
            faulted_runs: 0,
        }
    }

    /// Number of scopes currently open.
    #[must_use]
    pub fn open_scopes(&self) -> usize {
        self.open.len()
    }

    /// Number of observed runs that ended with a fault.
    #[must_use]
    pub fn faulted_runs(&self) -> u64 {
        self.faulted_runs
    }

    fn label(&mut self, program: &Program, kind: ScopeKind) -> String {
        match kind {
            ScopeKind::CallFrame { func } => self
                .resolver
                .call_frame_label(func, program)
                .unwrap_or_else(|| default_call_frame_label(func)),
            ScopeKind::NativeCall {
                native,
                table_index,
            } => self
                .resolver
                .native_call_label(native, table_index, program)
                .unwrap_or_else(|| default_native_call_label(native, table_index)),
        }
    }

    fn start_span(kind: ScopeKind, label: &str, pc: usize) -> Option<tracy_client::Span> {
        let client = tracy_client::Client::running()?;
        let function = match kind {
            ScopeKind::CallFrame { .. } => "stack_tape.call_frame",
            ScopeKind::NativeCall { .. } => "stack_tape.native_call",
        };
        // Tracy's source-line slot carries the bytecode offset of the scope boundary.
        let line = u32::try_from(pc).unwrap_or(u32::MAX);
        let span = client.span_alloc(Some(label), function, "stack_tape", line, 0);
        if let ScopeKind::NativeCall { table_index, .. } = kind {
            span.emit_value(u64::from(table_index));
        }
        Some(span)
    }

    /// Closes spans innermost first, down to `len` remaining.
    fn close_to(&mut self, len: usize) {
        while self.open.len() > len {
            drop(self.open.pop());
        }
    }
}

impl<R: LabelResolver> TraceSink for ProfilingTraceSink<R> {
    fn mask(&self) -> TraceMask {
        TraceMask::RUN | TraceMask::CALL | TraceMask::NATIVE
    }

    fn run_start(&mut self, _program: &Program, _entry: FuncId, _arg_count: usize) {
        self.close_to(0);
    }

    fn scope_enter(
        &mut self,
        program: &Program,
        kind: ScopeKind,
        depth: usize,
        _func: FuncId,
        pc: usize,
    ) {
        let label = self.label(program, kind);
        let span = Self::start_span(kind, &label, pc);
        self.open.push(OpenScope {
            kind,
            depth,
            _span: span,
        });
    }

    fn scope_exit(
        &mut self,
        _program: &Program,
        kind: ScopeKind,
        depth: usize,
        _func: FuncId,
        _pc: usize,
    ) {
        // Anything opened inside the exiting scope closes with it. An exit for a scope we
        // never saw is ignored.
        if let Some(at) = self.open.iter().rposition(|s| s.matches(kind, depth)) {
            self.close_to(at);
        }
    }

    fn run_end(&mut self, _program: &Program, outcome: TraceOutcome<'_>) {
        if let TraceOutcome::Fault(info) = outcome {
            self.faulted_runs += 1;
            if let Some(client) = tracy_client::Client::running() {
                client.message(&format!("stack_tape: {info}"), 0);
            }
        }
        self.close_to(0);
    }
}

impl<R> Default for ProfilingTraceSink<R>
where
    R: LabelResolver + Default,
{
    fn default() -> Self {
        Self::with_resolver(R::default())
    }
}

impl<R> std::fmt::Debug for ProfilingTraceSink<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfilingTraceSink")
            .field("open_scopes", &self.open.len())
            .field("faulted_runs", &self.faulted_runs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::ProfilingTraceSink;
    use crate::ProgramSymbolResolver;
    use stack_tape::asm::{Asm, ProgramBuilder};
    use stack_tape::native::{NativeContext, NativeError, NativeTable};
    use stack_tape::program::Program;
    use stack_tape::trace::{ScopeKind, TraceSink};
    use stack_tape::value::{FuncId, NativeId, Value};
    use stack_tape::vm::{ArithError, Fault, Limits, Vm};

    #[test]
    fn native_span_without_profiler_does_not_panic() {
        let kind = ScopeKind::NativeCall {
            native: NativeId(0),
            table_index: 3,
        };
        let _span = ProfilingTraceSink::<crate::DefaultLabelResolver>::start_span(kind, "n", 7);
    }

    fn one(_: &mut NativeContext<'_>, _: &[Value]) -> Result<Value, NativeError> {
        Ok(Value::Int(1))
    }

    #[test]
    fn scopes_balance_over_a_run() {
        let mut pb = ProgramBuilder::new();
        let main = pb.declare_function(0, 0).unwrap();
        let leaf = pb.declare_function(0, 0).unwrap();
        let n = pb.native(0, 0).unwrap();
        let mut a = Asm::new();
        a.invokestatic(leaf).invokestatic(leaf).iadd().ret();
        pb.define_function(main, a).unwrap();
        let mut a = Asm::new();
        a.invokenative(n).ret();
        pb.define_function(leaf, a).unwrap();
        pb.set_function_name(leaf, "leaf").unwrap();
        let program = pb.build().unwrap();

        let mut table = NativeTable::new();
        table.register(0, one);
        let mut vm = Vm::new(table, Limits::default());
        let mut sink = ProfilingTraceSink::with_resolver(ProgramSymbolResolver::default());
        let mask = sink.mask();
        assert_eq!(vm.run(&program, mask, Some(&mut sink)), Ok(2));
        assert_eq!(sink.open_scopes(), 0);
        assert_eq!(sink.faulted_runs(), 0);
    }

    #[test]
    fn reused_sink_stays_balanced_across_faulting_runs() {
        // main calls f; f divides by zero two frames deep.
        let mut pb = ProgramBuilder::new();
        let main = pb.declare_function(0, 0).unwrap();
        let f = pb.declare_function(0, 0).unwrap();
        let mut a = Asm::new();
        a.invokestatic(f).ret();
        pb.define_function(main, a).unwrap();
        let mut a = Asm::new();
        a.bipush(1).bipush(0).idiv().ret();
        pb.define_function(f, a).unwrap();
        let program = pb.build().unwrap();

        let mut sink = ProfilingTraceSink::new();
        let mut vm = Vm::new(stack_tape::native::NoNatives, Limits::default());
        for round in 1..=3 {
            let mask = sink.mask();
            let err = vm.run(&program, mask, Some(&mut sink)).unwrap_err();
            assert_eq!(err.fault, Fault::Arithmetic(ArithError::DivByZero));
            assert_eq!(sink.open_scopes(), 0);
            assert_eq!(sink.faulted_runs(), round);
        }
    }

    #[test]
    fn exit_closes_scopes_opened_inside_it() {
        let program = Program::default();
        let mut sink = ProfilingTraceSink::new();
        let outer = ScopeKind::CallFrame { func: FuncId(0) };
        let inner = ScopeKind::CallFrame { func: FuncId(1) };
        let native = ScopeKind::NativeCall {
            native: NativeId(0),
            table_index: 0,
        };
        sink.scope_enter(&program, outer, 1, FuncId(0), 0);
        sink.scope_enter(&program, inner, 2, FuncId(1), 0);
        sink.scope_enter(&program, native, 2, FuncId(1), 3);
        assert_eq!(sink.open_scopes(), 3);

        // Unknown scopes leave the stack alone.
        sink.scope_exit(&program, inner, 5, FuncId(1), 0);
        assert_eq!(sink.open_scopes(), 3);

        sink.scope_exit(&program, inner, 2, FuncId(1), 6);
        assert_eq!(sink.open_scopes(), 1);

        // A new run discards whatever an abandoned one left behind.
        sink.run_start(&program, FuncId(0), 0);
        assert_eq!(sink.open_scopes(), 0);
    }
}
