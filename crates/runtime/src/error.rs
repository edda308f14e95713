//! Runtime error taxonomy and the stack-trace logger the VM drains whenever
//! a running context unwinds because of a set error.

use element_core::heap::ExecutionContext;
use element_core::value::Value;

/// Accumulates formatted `<file>:<line> in <function>` trace lines across
/// every frame of every live context as the interpreter unwinds. One logger
/// per public-API call (`eval_source`, `call_function`, ...); its contents
/// are printed by the caller once the call returns an Error value.
#[derive(Default)]
pub struct Logger {
    lines: Vec<String>,
}

impl Logger {
    pub fn new() -> Self {
        Logger::default()
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn join(&self) -> String {
        self.lines.join("\n")
    }
}

/// Logs one trace line per frame of `ctx`, innermost first, and recurses
/// into `ctx.parent` so a coroutine's suspended caller chain is fully
/// represented.
pub fn log_context_trace(logger: &mut Logger, ctx: &ExecutionContext, filename: &str) {
    for frame in ctx.frames.iter().rev() {
        let line = frame.function.as_ref().code.line_for(frame.ip);
        let name = &frame.function.as_ref().code.name;
        let display_name = if name.is_empty() { "<anonymous>" } else { name.as_str() };
        logger.push(format!("{filename}:{line} in {display_name}"));
    }
    if let Some(parent) = ctx.parent.get() {
        // Safety: a context's parent, while set, always points at a live
        // context further up the call chain (I4).
        let parent_ctx = unsafe { parent.as_ref() };
        log_context_trace(logger, parent_ctx, filename);
    }
}

/// The fixed error-value messages the interpreter produces itself (host and
/// runtime errors); `make_error` lets user code mint arbitrary ones.
pub mod messages {
    pub const RUNTIME_ERROR: &str = "runtime-error";
    pub const DEAD_COROUTINE: &str = "dead-coroutine";
    pub const DIVISION_BY_ZERO: &str = "Division by 0";
    pub const NOT_ITERABLE: &str = "Value not iterable";
    pub const FILE_NOT_FOUND: &str = "file-not-found";
}

/// True for any `Value::Error`, used by the `is_error` native and by the
/// module loader when it wants to tell a real result apart from a load
/// failure.
pub fn is_error(v: &Value) -> bool {
    matches!(v, Value::Error(_))
}
