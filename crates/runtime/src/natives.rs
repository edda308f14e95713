//! The native function catalog (§6): everything `LoadNative` can resolve.
//!
//! `NATIVE_NAMES` is the single source of truth for both sides of the
//! boundary: `element_compiler::compile_source` classifies a bare
//! identifier as `SemanticType::Native` by position in this slice, and the
//! VM's `LoadNative(A)` indexes `NATIVE_FNS` at that same position. The two
//! arrays must stay in lockstep; a native is "added" by appending to both.

use element_core::value::{NativeFn, Value};
use element_core::NativeContext;

use crate::vm::Vm;

pub const NATIVE_NAMES: &[&str] = &[
    "range",
    "make_coroutine",
    "make_error",
    "is_error",
    "garbage_collect",
    "memory_stats",
    "add_search_path",
    "load_element",
    "print",
];

pub const NATIVE_FNS: &[NativeFn] = &[
    native_range,
    native_make_coroutine,
    native_make_error,
    native_is_error,
    native_garbage_collect,
    native_memory_stats,
    native_add_search_path,
    native_load_element,
    native_print,
];

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).copied().unwrap_or(Value::Nil)
}

fn as_int(v: Value, default: i32) -> i32 {
    match v {
        Value::Int(i) => i,
        Value::Float(f) => f as i32,
        _ => default,
    }
}

/// `range(to)` or `range(from, to)` or `range(from, to, step)`: builds a
/// Range iterator, not an Array — ranges are lazily stepped (§4.6).
fn native_range(ctx: &mut dyn NativeContext, _this: Value, args: &[Value]) -> Value {
    let vm = ctx.as_any().downcast_mut::<Vm>().expect("NativeContext is always Vm");
    let (from, to, step) = match args.len() {
        0 => (0, 0, 1),
        1 => (0, as_int(arg(args, 0), 0), 1),
        2 => (as_int(arg(args, 0), 0), as_int(arg(args, 1), 0), 1),
        _ => (as_int(arg(args, 0), 0), as_int(arg(args, 1), 0), as_int(arg(args, 2), 1)),
    };
    vm.make_range_iterator(from, to, step)
}

/// `make_coroutine(fn)`: wraps an existing Function template/closure as a
/// coroutine instance with its own persistent, not-yet-started context.
fn native_make_coroutine(ctx: &mut dyn NativeContext, _this: Value, args: &[Value]) -> Value {
    let vm = ctx.as_any().downcast_mut::<Vm>().expect("NativeContext is always Vm");
    match arg(args, 0).as_function() {
        Some(f) => vm.make_coroutine_from(f),
        None => vm.make_runtime_error("make_coroutine requires a function"),
    }
}

fn native_make_error(ctx: &mut dyn NativeContext, _this: Value, args: &[Value]) -> Value {
    let vm = ctx.as_any().downcast_mut::<Vm>().expect("NativeContext is always Vm");
    let message = vm.value_to_display_string(arg(args, 0));
    ctx.alloc_error(message)
}

fn native_is_error(_ctx: &mut dyn NativeContext, _this: Value, args: &[Value]) -> Value {
    Value::Bool(crate::error::is_error(&arg(args, 0)))
}

/// `garbage_collect(full)`: runs a bounded incremental slice, or a full
/// cycle when `full` is truthy (§5).
fn native_garbage_collect(ctx: &mut dyn NativeContext, _this: Value, args: &[Value]) -> Value {
    let vm = ctx.as_any().downcast_mut::<Vm>().expect("NativeContext is always Vm");
    let full = arg(args, 0).is_truthy();
    vm.run_gc(full);
    Value::Nil
}

/// `memory_stats()`: returns an Object with one `(kind name, live count)`
/// member per heap-object kind, for introspection and tests.
fn native_memory_stats(ctx: &mut dyn NativeContext, _this: Value, args: &[Value]) -> Value {
    let vm = ctx.as_any().downcast_mut::<Vm>().expect("NativeContext is always Vm");
    vm.memory_stats_object()
}

fn native_add_search_path(ctx: &mut dyn NativeContext, _this: Value, args: &[Value]) -> Value {
    let vm = ctx.as_any().downcast_mut::<Vm>().expect("NativeContext is always Vm");
    let path = vm.value_to_display_string(arg(args, 0));
    vm.add_search_path(path);
    Value::Nil
}

/// `load_element(path)`: resolves `path` against the search paths, compiles
/// and runs it once (cached thereafter), and returns its result value.
fn native_load_element(ctx: &mut dyn NativeContext, _this: Value, args: &[Value]) -> Value {
    let vm = ctx.as_any().downcast_mut::<Vm>().expect("NativeContext is always Vm");
    let path = vm.value_to_display_string(arg(args, 0));
    vm.load_module(&path)
}

fn native_print(ctx: &mut dyn NativeContext, _this: Value, args: &[Value]) -> Value {
    let vm = ctx.as_any().downcast_mut::<Vm>().expect("NativeContext is always Vm");
    let rendered = vm.value_to_display_string(arg(args, 0));
    println!("{rendered}");
    Value::Nil
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_fns_stay_in_lockstep() {
        assert_eq!(NATIVE_NAMES.len(), NATIVE_FNS.len());
    }
}
