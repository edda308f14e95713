//! `element-core`: the value model, heap, incremental GC, symbol/constant
//! pool, and bytecode instruction set shared by the compiler and the VM.
//!
//! See `SPEC_FULL.md` §3, §4.1 and §4.4 for the design this implements.

pub mod blob;
pub mod bytecode;
pub mod gc;
pub mod heap;
pub mod module;
pub mod symbol;
pub mod value;

pub use blob::{decode_blob, encode_blob, merge_symbols, BlobError, CompiledBlob, DecodedBlob};
pub use bytecode::{CodeObject, Constant, Instruction, Opcode, SourceLine};
pub use gc::{GcRoots, Heap, KindCounts};
pub use heap::{
    ArrayObj, BoxObj, Color, ContextState, ErrorObj, ExecutionContext, FunctionObj, GcHeader,
    GcRef, HeapObject, IteratorObj, IteratorState, ObjectKind, ObjectObj, StackFrame, StringObj,
};
pub use module::Module;
pub use symbol::{PROTO_HASH, SymbolTable};
pub use value::{NativeFn, Value};

/// The minimal surface a native function body needs from its host VM.
/// Kept in `element-core` because `NativeFn` (and therefore every native's
/// signature) is defined here; `element-runtime`'s `Vm` implements it.
/// Natives that need VM-specific behavior beyond plain allocation (module
/// loading, coroutine creation) downcast via `as_any`.
pub trait NativeContext {
    fn alloc_string(&mut self, bytes: Vec<u8>) -> Value;
    fn alloc_array(&mut self, elements: Vec<Value>) -> Value;
    fn alloc_object(&mut self, members: Vec<(u32, Value)>) -> Value;
    fn alloc_error(&mut self, message: String) -> Value;
    fn intern(&mut self, name: &str) -> u32;
    fn set_error(&mut self, error: Value);
    fn as_any(&mut self) -> &mut dyn std::any::Any;
}
