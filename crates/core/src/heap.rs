//! Heap object model (§3): the common header every managed value carries,
//! the concrete object kinds, and the typed pointer wrapper (`GcRef<T>`)
//! `Value` stores for each of them.
//!
//! Every concrete object type puts `GcHeader` as its first field (`repr(C)`
//! guarantees this gives it the same address as the whole object), so the
//! collector can walk the intrusive list as untyped `GcHeader`s and only
//! needs `header.kind` to safely cast back to the concrete type when it
//! needs to trace children.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::bytecode::CodeObject;
use crate::value::Value;

/// Tri-color + Static, per §4.4. `Static` objects (constant-pool Function
/// templates) are never freed and never recolored (I6).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Color {
    White0,
    White1,
    Gray,
    Black,
    Static,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    String,
    Array,
    Object,
    Function,
    Box,
    Iterator,
    Error,
}

/// Every heap object's common header: intrusive list link, color, kind tag.
pub struct GcHeader {
    pub next: Cell<Option<NonNull<GcHeader>>>,
    pub color: Cell<Color>,
    pub kind: ObjectKind,
}

impl GcHeader {
    fn new(kind: ObjectKind, color: Color) -> Self {
        GcHeader {
            next: Cell::new(None),
            color: Cell::new(color),
            kind,
        }
    }
}

/// A typed, pointer-identity-comparable reference to a heap object. Copy
/// because the GC never moves objects; equality is by address, matching
/// the language's "managed types compare by pointer identity" rule (§4.5).
pub struct GcRef<T> {
    ptr: NonNull<T>,
}

impl<T> GcRef<T> {
    /// # Safety
    /// `ptr` must point to a live, heap-allocated `T` owned by a `Heap`.
    pub unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        GcRef { ptr }
    }

    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn as_ref(&self) -> &T {
        // Safety: the heap keeps every allocation alive until swept, and a
        // live `GcRef` is only ever handed out for unswept objects.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Copy for GcRef<T> {}
impl<T> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> PartialEq for GcRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}
impl<T> Eq for GcRef<T> {}
impl<T> std::fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GcRef({:p})", self.ptr.as_ptr())
    }
}

/// A trait every concrete heap object implements so generic heap code
/// (allocation bookkeeping, header access) doesn't need seven copies.
pub trait HeapObject {
    fn header(&self) -> &GcHeader;
}

macro_rules! impl_heap_object {
    ($t:ty) => {
        impl HeapObject for $t {
            fn header(&self) -> &GcHeader {
                &self.header
            }
        }
    };
}

#[repr(C)]
pub struct StringObj {
    pub header: GcHeader,
    pub bytes: Vec<u8>,
}
impl_heap_object!(StringObj);

impl StringObj {
    pub fn new(bytes: Vec<u8>, color: Color) -> Self {
        StringObj {
            header: GcHeader::new(ObjectKind::String, color),
            bytes,
        }
    }
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

#[repr(C)]
pub struct ArrayObj {
    pub header: GcHeader,
    pub elements: RefCell<Vec<Value>>,
}
impl_heap_object!(ArrayObj);

impl ArrayObj {
    pub fn new(elements: Vec<Value>, color: Color) -> Self {
        ArrayObj {
            header: GcHeader::new(ObjectKind::Array, color),
            elements: RefCell::new(elements),
        }
    }
}

/// Object members, sorted by hash (I2): slot 0 is always `proto`.
#[repr(C)]
pub struct ObjectObj {
    pub header: GcHeader,
    pub members: RefCell<Vec<(u32, Value)>>,
}
impl_heap_object!(ObjectObj);

impl ObjectObj {
    pub fn new(members: Vec<(u32, Value)>, color: Color) -> Self {
        debug_assert!(members.windows(2).all(|w| w[0].0 < w[1].0));
        ObjectObj {
            header: GcHeader::new(ObjectKind::Object, color),
            members: RefCell::new(members),
        }
    }

    /// Binary search by hash; returns the index of an exact match.
    pub fn find(&self, hash: u32) -> Result<usize, usize> {
        self.members.borrow().binary_search_by_key(&hash, |(h, _)| *h)
    }
}

#[repr(C)]
pub struct BoxObj {
    pub header: GcHeader,
    pub value: RefCell<Value>,
}
impl_heap_object!(BoxObj);

impl BoxObj {
    pub fn new(value: Value, color: Color) -> Self {
        BoxObj {
            header: GcHeader::new(ObjectKind::Box, color),
            value: RefCell::new(value),
        }
    }
}

#[repr(C)]
pub struct ErrorObj {
    pub header: GcHeader,
    pub message: String,
}
impl_heap_object!(ErrorObj);

impl ErrorObj {
    pub fn new(message: String, color: Color) -> Self {
        ErrorObj {
            header: GcHeader::new(ObjectKind::Error, color),
            message,
        }
    }
}

/// One stack frame (§3): owning function reference, instruction pointer,
/// locals, the anonymous-parameter array, and `this`.
pub struct StackFrame {
    pub function: GcRef<FunctionObj>,
    pub ip: usize,
    pub locals: Vec<Value>,
    pub anonymous_parameters: GcRef<ArrayObj>,
    pub this_value: Value,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContextState {
    NotStarted,
    Started,
    Finished,
}

/// The unit of suspendable control (§3): a root context per top-level
/// invocation, or a coroutine's persistent context linked to its Function.
pub struct ExecutionContext {
    pub state: Cell<ContextState>,
    pub parent: Cell<Option<NonNull<ExecutionContext>>>,
    pub last_object: RefCell<Value>,
    pub frames: VecDeque<StackFrame>,
    pub stack: Vec<Value>,
}

impl ExecutionContext {
    pub fn new_root() -> Self {
        ExecutionContext {
            state: Cell::new(ContextState::Started),
            parent: Cell::new(None),
            last_object: RefCell::new(Value::Nil),
            frames: VecDeque::new(),
            stack: Vec::new(),
        }
    }

    pub fn new_coroutine() -> Self {
        ExecutionContext {
            state: Cell::new(ContextState::NotStarted),
            parent: Cell::new(None),
            last_object: RefCell::new(Value::Nil),
            frames: VecDeque::new(),
            stack: Vec::new(),
        }
    }
}

#[repr(C)]
pub struct FunctionObj {
    pub header: GcHeader,
    pub code: Rc<CodeObject>,
    pub free_variables: Vec<GcRef<BoxObj>>,
    /// Present only for coroutine instances (I4); owned here so the
    /// context's lifetime exactly matches the owning Function's.
    pub execution_context: RefCell<Option<Box<ExecutionContext>>>,
}
impl_heap_object!(FunctionObj);

impl FunctionObj {
    pub fn new_template(code: Rc<CodeObject>) -> Self {
        FunctionObj {
            header: GcHeader::new(ObjectKind::Function, Color::Static),
            code,
            free_variables: Vec::new(),
            execution_context: RefCell::new(None),
        }
    }

    pub fn new_closure(code: Rc<CodeObject>, free_variables: Vec<GcRef<BoxObj>>, color: Color) -> Self {
        FunctionObj {
            header: GcHeader::new(ObjectKind::Function, color),
            code,
            free_variables,
            execution_context: RefCell::new(None),
        }
    }

    pub fn new_coroutine(code: Rc<CodeObject>, free_variables: Vec<GcRef<BoxObj>>, color: Color) -> Self {
        FunctionObj {
            header: GcHeader::new(ObjectKind::Function, color),
            code,
            free_variables,
            execution_context: RefCell::new(Some(Box::new(ExecutionContext::new_coroutine()))),
        }
    }

    pub fn is_coroutine(&self) -> bool {
        self.execution_context.borrow().is_some()
    }
}

/// §4.6: the variant-specific bookkeeping an Iterator carries. Array/String
/// iteration is step-atomic; Object iteration dispatches to user-supplied
/// callables; Coroutine iteration is a genuine suspension point.
pub enum IteratorState {
    Array {
        array: GcRef<ArrayObj>,
        index: Cell<usize>,
    },
    Str {
        string: GcRef<StringObj>,
        index: Cell<usize>,
    },
    Object {
        this_object: Value,
        has_next: Value,
        get_next: Value,
    },
    Coroutine {
        function: GcRef<FunctionObj>,
        cached: RefCell<Option<Value>>,
        primed: Cell<bool>,
    },
    Range {
        current: Cell<i32>,
        to: i32,
        step: i32,
    },
}

#[repr(C)]
pub struct IteratorObj {
    pub header: GcHeader,
    pub state: IteratorState,
}
impl_heap_object!(IteratorObj);

impl IteratorObj {
    pub fn new(state: IteratorState, color: Color) -> Self {
        IteratorObj {
            header: GcHeader::new(ObjectKind::Iterator, color),
            state,
        }
    }
}
