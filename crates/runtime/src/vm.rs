//! The bytecode interpreter: the driving loop, calling convention, member
//! lookup, iterator protocol, and error propagation (§4.5).
//!
//! Execution contexts form a dynamic chain linked by `ExecutionContext::parent`
//! (a root context at the base, a coroutine's own context pushed on top of
//! whichever context resumed it). `Vm::current` always points at the
//! context actively being stepped; `drive` keeps stepping until control
//! returns to the specific `(context, frame depth)` pair it was asked to
//! wait for, which lets an ordinary call (pushes a frame onto the same
//! context) and a coroutine call (switches `current` away and back) share
//! one dispatch loop without the two cases needing separate code paths.

use std::cell::Cell;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::rc::Rc;

use element_core::blob::CompiledBlob;
use element_core::bytecode::{Constant, Opcode};
use element_core::heap::{
    ContextState, ExecutionContext, FunctionObj, GcRef, HeapObject, IteratorState, ObjectKind, StackFrame,
};
use element_core::symbol::PROTO_HASH;
use element_core::{GcRoots, Heap, Module, NativeContext, SymbolTable, Value};

use crate::arithmetic::{self, ArithError, Ordering3};
use crate::error::{log_context_trace, messages, Logger};
use crate::module_loader::ModuleLoader;
use crate::natives;

/// Instructions run between each check of the `garbage_collect(false)`
/// step budget (§5) — arbitrary but small enough that a REPL line never
/// stalls waiting on a large collection.
const GC_STEP_BUDGET: u32 = 1024;

pub struct Vm {
    pub heap: Heap,
    pub symbols: SymbolTable,
    modules: Vec<Rc<Module>>,
    loader: ModuleLoader,
    root_context: Box<ExecutionContext>,
    current: Cell<NonNull<ExecutionContext>>,
    pending_error: Cell<Option<Value>>,
}

impl Vm {
    pub fn new(entry_dir: PathBuf) -> Self {
        let mut root_context = Box::new(ExecutionContext::new_root());
        let current = Cell::new(NonNull::from(root_context.as_mut()));
        Vm {
            heap: Heap::new(),
            symbols: SymbolTable::new(),
            modules: Vec::new(),
            loader: ModuleLoader::new(entry_dir),
            root_context,
            current,
            pending_error: Cell::new(None),
        }
    }

    // ---- public API --------------------------------------------------

    /// Compiles and runs a complete source string as a new module, returning
    /// its entry point's result (§4.5, §6).
    pub fn eval_source(&mut self, source: &str, filename: &str) -> Value {
        match element_compiler::compile_source(source, natives::NATIVE_NAMES) {
            Ok(blob) => self.run_blob(blob, filename.to_string()),
            Err(e) => Value::Error(self.heap.alloc_error(e.to_string())),
        }
    }

    /// Calls an already-obtained callable `Value` (a REPL result, a
    /// closure stored by the host, ...) with plain arguments and no
    /// `this` binding.
    pub fn call_function(&mut self, callee: Value, args: Vec<Value>) -> Value {
        self.call_sync(callee, Value::Nil, args)
    }

    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.loader.add_search_path(path.into());
    }

    /// Resolves, compiles, and runs `path` as a module, memoizing the
    /// result so a second `load_element` of the same file is a cache hit
    /// (§6, §9).
    pub fn load_module(&mut self, path: &str) -> Value {
        let resolved = match self.loader.resolve(path) {
            Some(p) => p,
            None => return self.raise_error(messages::FILE_NOT_FOUND),
        };
        if let Some(cached) = self.loader.cached_result(&resolved) {
            return cached;
        }
        let source = match std::fs::read_to_string(&resolved) {
            Ok(s) => s,
            Err(_) => return self.raise_error(messages::FILE_NOT_FOUND),
        };
        self.loader.push_directory_for(&resolved);
        let filename = resolved.display().to_string();
        let result = self.eval_source(&source, &filename);
        self.loader.pop_directory();
        self.loader.cache_result(&resolved, result);
        result
    }

    /// Runs one incremental slice (or, if `full`, a complete cycle) of the
    /// collector, rooted at this VM's live modules and active context
    /// chain (§4.4, §5).
    pub fn run_gc(&mut self, full: bool) {
        if full {
            self.heap.collect_garbage_full(self);
        } else {
            self.heap.collect_garbage(GC_STEP_BUDGET, self);
        }
    }

    pub fn memory_stats_object(&mut self) -> Value {
        let stats = self.heap.stats();
        let mut members = Vec::new();
        for (kind, counts) in stats {
            let hash = self.symbols.intern(kind_name(kind));
            members.push((hash, Value::Int(counts.live as i32)));
        }
        members.sort_by_key(|(h, _)| *h);
        if members.binary_search_by_key(&PROTO_HASH, |(h, _)| *h).is_err() {
            members.insert(0, (PROTO_HASH, Value::Nil));
        }
        Value::Object(self.heap.alloc_object(members))
    }

    pub fn make_runtime_error(&mut self, message: &str) -> Value {
        self.raise_error(message)
    }

    pub fn make_range_iterator(&mut self, from: i32, to: i32, step: i32) -> Value {
        let it = self.heap.alloc_iterator(IteratorState::Range {
            current: Cell::new(from),
            to,
            step: if step == 0 { 1 } else { step },
        });
        Value::Iterator(it)
    }

    pub fn make_coroutine_from(&mut self, template: GcRef<FunctionObj>) -> Value {
        let code = template.as_ref().code.clone();
        let free_vars = template.as_ref().free_variables.clone();
        let coro = self.heap.alloc_coroutine(code, free_vars);
        Value::Function(coro)
    }

    /// Renders a value for `print`, `~`/`UnaryConcatenate`, and error
    /// messages. Not a user-facing `to_string` protocol (§4.5 doesn't
    /// define one) — just the interpreter's own debug rendering.
    pub fn value_to_display_string(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Hash(h) => self.symbols.name_from_hash(h).unwrap_or("<hash>").to_string(),
            Value::NativeFunction(_) => "<native function>".to_string(),
            Value::String(s) => s.as_ref().as_str().into_owned(),
            Value::Array(a) => {
                let elems = a.as_ref().elements.borrow();
                let parts: Vec<String> = elems.iter().map(|e| self.value_to_display_string(*e)).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Object(o) => {
                let members = o.as_ref().members.borrow();
                let parts: Vec<String> = members
                    .iter()
                    .filter(|(h, _)| *h != PROTO_HASH)
                    .map(|(h, v)| {
                        let name = self.symbols.name_from_hash(*h).unwrap_or("?");
                        format!("{name}: {}", self.value_to_display_string(*v))
                    })
                    .collect();
                format!("[={}]", parts.join(", "))
            }
            Value::Function(_) => "<function>".to_string(),
            Value::Box(b) => self.value_to_display_string(*b.as_ref().value.borrow()),
            Value::Iterator(_) => "<iterator>".to_string(),
            Value::Error(e) => e.as_ref().message.clone(),
        }
    }

    // ---- module loading ------------------------------------------------

    fn run_blob(&mut self, blob: CompiledBlob, filename: String) -> Value {
        for (hash, name) in &blob.symbols {
            self.symbols.insert_resolved(*hash, name);
        }
        let module = Rc::new(Module::new(filename));
        for constant in &blob.constants {
            if let Constant::CodeObject(code) = constant {
                *code.module.borrow_mut() = Rc::downgrade(&module);
            }
        }
        *module.constants.borrow_mut() = blob.constants;
        self.modules.push(module.clone());

        let entry_code = match &module.constants.borrow()[element_compiler::ENTRY_CONSTANT_INDEX as usize] {
            Constant::CodeObject(code) => code.clone(),
            _ => unreachable!("constant 3 is always the module's entry-point CodeObject"),
        };
        let entry = self.heap.alloc_function_template(entry_code);
        let result = self.call_sync(Value::Function(entry), Value::Nil, vec![]);
        *module.result.borrow_mut() = result;
        result
    }

    // ---- calling convention ---------------------------------------------

    /// Invokes `callee` and drives execution to completion (recursing into
    /// the dispatch loop), for call sites that need the result immediately:
    /// the public API, and the iterator protocol's Object/Coroutine steps.
    /// Ordinary element-level `FunctionCall` opcodes do *not* go through
    /// this path — they extend the same flat driving loop instead, so
    /// element call depth never grows the Rust stack.
    fn call_sync(&mut self, callee: Value, this_value: Value, args: Vec<Value>) -> Value {
        match callee {
            Value::NativeFunction(f) => f(self, this_value, &args),
            Value::Function(func) => {
                let stop_ctx = self.current.get();
                let stop_depth = self.current_ctx().frames.len();
                if func.as_ref().is_coroutine() {
                    self.call_coroutine(func, args, this_value);
                } else {
                    self.push_frame_into(stop_ctx, func, args, this_value);
                }
                self.drive(stop_ctx, stop_depth)
            }
            _ => self.raise_error("value not callable"),
        }
    }

    /// Steps the VM until `stop_ctx` is current again with exactly
    /// `stop_depth` frames, then pops and returns the value left on its
    /// stack by whichever `EndFunction`/`Yield` got it there.
    fn drive(&mut self, stop_ctx: NonNull<ExecutionContext>, stop_depth: usize) -> Value {
        loop {
            if self.current.get() == stop_ctx {
                let ctx = self.current_ctx();
                if ctx.frames.len() == stop_depth {
                    return ctx.stack.pop().unwrap_or(Value::Nil);
                }
            }
            if let Some(err) = self.pending_error.take() {
                return err;
            }
            self.execute_one();
        }
    }

    fn push_frame_into(&mut self, mut ctx_ptr: NonNull<ExecutionContext>, func: GcRef<FunctionObj>, mut args: Vec<Value>, this_value: Value) {
        let code = func.as_ref().code.clone();
        let local_count = code.local_variables_count.max(0) as usize;
        let named_count = (code.named_parameters_count.max(0) as usize).min(args.len());
        // Only the excess tail beyond the named parameters becomes the
        // anonymous-parameter array (`$`/`LoadArgument`) — the original's
        // `anonymousCount = argumentsCount - namedParametersCount`.
        let anonymous = args.split_off(named_count);
        let mut locals = vec![Value::Nil; local_count];
        locals[..named_count].copy_from_slice(&args[..named_count]);
        let anonymous_parameters = self.heap.alloc_array(anonymous);
        let frame = StackFrame {
            function: func,
            ip: 0,
            locals,
            anonymous_parameters,
            this_value,
        };
        // Safety: `ctx_ptr` is either `self.current` or a coroutine's own
        // context freshly borrowed from its owning `FunctionObj`, both live
        // for the duration of this call.
        unsafe { ctx_ptr.as_mut() }.frames.push_back(frame);
    }

    fn call_coroutine(&mut self, func: GcRef<FunctionObj>, args: Vec<Value>, this_value: Value) {
        let caller_ctx = self.current.get();
        let mut borrow = func.as_ref().execution_context.borrow_mut();
        let ec = borrow.as_mut().expect("is_coroutine() implies Some");
        match ec.state.get() {
            ContextState::Finished => {
                drop(borrow);
                self.raise_error(messages::DEAD_COROUTINE);
            }
            ContextState::NotStarted => {
                ec.parent.set(Some(caller_ctx));
                ec.state.set(ContextState::Started);
                let ctx_ptr = NonNull::from(ec.as_mut());
                drop(borrow);
                self.push_frame_into(ctx_ptr, func, args, this_value);
                self.current.set(ctx_ptr);
            }
            ContextState::Started => {
                ec.parent.set(Some(caller_ctx));
                let ctx_ptr = NonNull::from(ec.as_mut());
                drop(borrow);
                // A=0 sends nil, A=1 sends the sole value, A>=2 packs into
                // a fresh Array — same arity rule as an ordinary call.
                let resume_value = match args.len() {
                    0 => Value::Nil,
                    1 => args[0],
                    _ => Value::Array(self.heap.alloc_array(args)),
                };
                self.current.set(ctx_ptr);
                self.current_ctx().stack.push(resume_value);
            }
        }
    }

    // ---- frame/stack helpers --------------------------------------------

    /// Safety note: every access goes through a raw `NonNull<ExecutionContext>`
    /// rather than a borrow of `self`, the same aliasing discipline
    /// `element-core`'s `GcRef::as_ref` already uses for heap objects — the
    /// pointee is either `self.root_context` or a coroutine's context boxed
    /// inside a live `FunctionObj`, both stable for the VM's lifetime.
    fn current_ctx(&self) -> &mut ExecutionContext {
        let mut ptr = self.current.get();
        unsafe { ptr.as_mut() }
    }

    fn current_frame(&self) -> &mut StackFrame {
        self.current_ctx().frames.back_mut().expect("opcode dispatch always has an active frame")
    }

    fn push(&self, v: Value) {
        self.current_ctx().stack.push(v);
    }

    fn pop(&self) -> Value {
        self.current_ctx().stack.pop().unwrap_or(Value::Nil)
    }

    fn peek(&self) -> Value {
        *self.current_ctx().stack.last().unwrap_or(&Value::Nil)
    }

    fn swap_top2(&self) {
        let stack = &mut self.current_ctx().stack;
        let n = stack.len();
        stack.swap(n - 1, n - 2);
    }

    /// `MoveToTOS2`: copies TOS over the element two below it, then pops —
    /// net effect, the element two below is replaced by TOS and the stack
    /// shrinks by one (§4.3).
    fn move_to_tos2(&self) {
        let stack = &mut self.current_ctx().stack;
        let n = stack.len();
        stack[n - 3] = stack[n - 1];
        stack.pop();
    }

    // ---- error raising ---------------------------------------------------

    /// Logs a stack trace across every frame of every context in the
    /// active chain, clears those contexts' frames so none of them can be
    /// resumed, and returns the `runtime-error` value every such unwind
    /// produces (§4.5, §7). The caller still needs to stop dispatching —
    /// `drive`'s pending-error check does that on its next iteration.
    fn raise_error(&mut self, message: &str) -> Value {
        let mut logger = Logger::new();
        logger.push(message.to_string());
        let ctx = unsafe { self.current.get().as_ref() };
        let filename = self.current_filename();
        log_context_trace(&mut logger, ctx, &filename);
        eprintln!("{}", logger.join());
        let mut ptr = Some(self.current.get());
        while let Some(mut p) = ptr {
            let c = unsafe { p.as_mut() };
            let next = c.parent.get();
            c.frames.clear();
            c.stack.clear();
            ptr = next;
        }
        let err = Value::Error(self.heap.alloc_error(messages::RUNTIME_ERROR.to_string()));
        self.pending_error.set(Some(err));
        err
    }

    fn current_filename(&self) -> String {
        self.current_frame()
            .function
            .as_ref()
            .code
            .module
            .borrow()
            .upgrade()
            .map(|m| m.filename.clone())
            .unwrap_or_default()
    }

    // ---- member/prototype lookup ------------------------------------------

    /// Walks the prototype chain, own members first at each link, stopping
    /// (and yielding `nil`) if the chain would revisit the object lookup
    /// started on (pointer identity, §9).
    fn lookup_member(&self, target: Value, hash: u32) -> Value {
        let origin = target;
        let mut current = target;
        loop {
            let obj = match current.as_object() {
                Some(o) => o,
                None => return Value::Nil,
            };
            if let Ok(i) = obj.as_ref().find(hash) {
                return obj.as_ref().members.borrow()[i].1;
            }
            let proto = match obj.as_ref().find(PROTO_HASH) {
                Ok(i) => obj.as_ref().members.borrow()[i].1,
                Err(_) => Value::Nil,
            };
            if proto.is_nil() || proto.ptr_eq(&origin) {
                return Value::Nil;
            }
            current = proto;
        }
    }

    fn set_member(&mut self, target: Value, hash: u32, value: Value) {
        match target.as_object() {
            Some(o) => {
                {
                    let mut members = o.as_ref().members.borrow_mut();
                    match members.binary_search_by_key(&hash, |(h, _)| *h) {
                        Ok(i) => members[i].1 = value,
                        Err(i) => members.insert(i, (hash, value)),
                    }
                }
                self.heap.write_barrier_value(o.as_ref().header(), value);
            }
            None => {
                self.raise_error("cannot set a member on a non-object value");
            }
        }
    }

    fn normalize_index(len: usize, idx: i32) -> Option<usize> {
        let i = if idx < 0 { idx + len as i32 } else { idx };
        if i < 0 || i as usize >= len {
            None
        } else {
            Some(i as usize)
        }
    }

    // ---- opcode dispatch ---------------------------------------------------

    fn execute_one(&mut self) {
        let (opcode, a) = {
            let frame = self.current_frame();
            let instr = frame.function.as_ref().code.instructions[frame.ip];
            frame.ip += 1;
            (instr.opcode, instr.a)
        };
        match opcode {
            Opcode::Pop => {
                self.pop();
            }
            Opcode::PopN => {
                for _ in 0..a {
                    self.pop();
                }
            }
            Opcode::Rotate2 => self.swap_top2(),
            Opcode::MoveToTos2 => self.move_to_tos2(),
            Opcode::Duplicate => {
                let v = self.peek();
                self.push(v);
            }
            Opcode::Unpack => self.op_unpack(a),

            Opcode::LoadConstant => self.op_load_constant(a),
            Opcode::LoadLocal => {
                let v = self.current_frame().locals[a as usize];
                self.push(v);
            }
            Opcode::LoadGlobal => self.op_load_global(a),
            Opcode::LoadNative => self.push(Value::NativeFunction(natives::NATIVE_FNS[a as usize])),
            Opcode::LoadArgument => self.op_load_argument(a),
            Opcode::LoadArgsArray => {
                let arr = self.current_frame().anonymous_parameters;
                self.push(Value::Array(arr));
            }
            Opcode::LoadThis => {
                let v = self.current_frame().this_value;
                self.push(v);
            }

            Opcode::StoreLocal => {
                let v = self.peek();
                self.current_frame().locals[a as usize] = v;
            }
            Opcode::StoreGlobal => {
                let v = self.peek();
                self.op_store_global(a, v);
            }
            Opcode::PopStoreLocal => {
                let v = self.pop();
                self.current_frame().locals[a as usize] = v;
            }
            Opcode::PopStoreGlobal => {
                let v = self.pop();
                self.op_store_global(a, v);
            }

            Opcode::MakeArray => self.op_make_array(a),
            Opcode::LoadElement => self.op_load_element(),
            Opcode::StoreElement => self.op_store_element(false),
            Opcode::PopStoreElement => self.op_store_element(true),
            Opcode::ArrayPushBack => self.op_array_push_back(),
            Opcode::ArrayPopBack => self.op_array_pop_back(),
            Opcode::MakeObject => self.op_make_object(a),
            Opcode::MakeEmptyObject => self.op_make_object(0),
            Opcode::LoadHash => self.push(Value::Hash(a as u32)),
            Opcode::LoadMember => {
                let target = self.pop();
                let v = self.lookup_member(target, a as u32);
                self.push(v);
            }
            Opcode::StoreMember => self.op_store_member(a as u32, false),
            Opcode::PopStoreMember => self.op_store_member(a as u32, true),

            Opcode::MakeIterator => self.op_make_iterator(),
            Opcode::IteratorHasNext => self.op_iterator_has_next(),
            Opcode::IteratorGetNext => self.op_iterator_get_next(),

            Opcode::MakeBox => {
                let v = self.pop();
                let b = self.heap.alloc_box(v);
                self.push(Value::Box(b));
            }
            Opcode::LoadFromBox => {
                let v = self.pop();
                match v.as_box() {
                    Some(b) => self.push(*b.as_ref().value.borrow()),
                    None => {
                        self.raise_error("value is not a box");
                    }
                }
            }
            Opcode::StoreToBox => self.op_store_to_box(false),
            Opcode::PopStoreToBox => self.op_store_to_box(true),
            Opcode::MakeClosure => self.op_make_closure(a),
            Opcode::LoadFromClosure => {
                let b = self.current_frame().function.as_ref().free_variables[a as usize];
                self.push(*b.as_ref().value.borrow());
            }
            Opcode::StoreToClosure => {
                let v = self.peek();
                self.do_store_to_closure(a, v);
            }
            Opcode::PopStoreToClosure => {
                let v = self.pop();
                self.do_store_to_closure(a, v);
            }

            Opcode::Jump => self.current_frame().ip = a as usize,
            Opcode::JumpIfFalse => {
                if !self.peek().is_truthy() {
                    self.current_frame().ip = a as usize;
                }
            }
            Opcode::PopJumpIfFalse => {
                let v = self.pop();
                if !v.is_truthy() {
                    self.current_frame().ip = a as usize;
                }
            }
            Opcode::JumpIfFalseOrPop => {
                if !self.peek().is_truthy() {
                    self.current_frame().ip = a as usize;
                } else {
                    self.pop();
                }
            }
            Opcode::JumpIfTrueOrPop => {
                if self.peek().is_truthy() {
                    self.current_frame().ip = a as usize;
                } else {
                    self.pop();
                }
            }
            Opcode::FunctionCall => self.op_function_call(a as usize),
            Opcode::Yield => self.op_yield(),
            Opcode::EndFunction => self.op_end_function(),

            Opcode::Add => {
                let b = self.pop();
                let av = self.pop();
                self.finish_arith(self.add_values(av, b));
            }
            Opcode::Subtract => {
                let b = self.pop();
                let av = self.pop();
                self.finish_arith(arithmetic::subtract(av, b));
            }
            Opcode::Multiply => {
                let b = self.pop();
                let av = self.pop();
                self.finish_arith(arithmetic::multiply(av, b));
            }
            Opcode::Divide => {
                let b = self.pop();
                let av = self.pop();
                self.finish_arith(arithmetic::divide(av, b));
            }
            Opcode::Power => {
                let b = self.pop();
                let av = self.pop();
                self.finish_arith(arithmetic::power(av, b));
            }
            Opcode::Modulo => {
                let b = self.pop();
                let av = self.pop();
                self.finish_arith(arithmetic::modulo(av, b));
            }
            Opcode::Concatenate => {
                let b = self.pop();
                let av = self.pop();
                let sa = self.value_to_display_string(av);
                let sb = self.value_to_display_string(b);
                let s = self.heap.alloc_string(format!("{sa}{sb}").into_bytes());
                self.push(Value::String(s));
            }
            Opcode::Xor => {
                let b = self.pop();
                let av = self.pop();
                self.push(arithmetic::xor(av, b));
            }
            Opcode::Equal => {
                let b = self.pop();
                let av = self.pop();
                let eq = self.values_equal(av, b);
                self.push(Value::Bool(eq));
            }
            Opcode::NotEqual => {
                let b = self.pop();
                let av = self.pop();
                let eq = self.values_equal(av, b);
                self.push(Value::Bool(!eq));
            }
            Opcode::Less => self.op_ordering(|o| matches!(o, Ordering3::Less)),
            Opcode::Greater => self.op_ordering(|o| matches!(o, Ordering3::Greater)),
            Opcode::LessEqual => self.op_ordering(|o| matches!(o, Ordering3::Less | Ordering3::Equal)),
            Opcode::GreaterEqual => self.op_ordering(|o| matches!(o, Ordering3::Greater | Ordering3::Equal)),

            Opcode::UnaryPlus => {
                let v = self.pop();
                self.finish_arith(arithmetic::unary_plus(v));
            }
            Opcode::UnaryMinus => {
                let v = self.pop();
                self.finish_arith(arithmetic::unary_minus(v));
            }
            Opcode::UnaryNot => {
                let v = self.pop();
                self.push(arithmetic::unary_not(v));
            }
            Opcode::UnaryConcatenate => {
                let v = self.pop();
                let s = self.value_to_display_string(v);
                let r = self.heap.alloc_string(s.into_bytes());
                self.push(Value::String(r));
            }
            Opcode::UnarySizeOf => {
                let v = self.pop();
                self.finish_arith(self.size_of(v));
            }
        }
    }

    fn finish_arith(&mut self, result: Result<Value, ArithError>) {
        match result {
            Ok(v) => self.push(v),
            Err(e) => {
                self.raise_error(&e.message());
            }
        }
    }

    fn add_values(&mut self, a: Value, b: Value) -> Result<Value, ArithError> {
        match (a, b) {
            (Value::Array(x), Value::Array(y)) => {
                let merged = arithmetic::concat_arrays(x.as_ref(), y.as_ref());
                Ok(Value::Array(self.heap.alloc_array(merged)))
            }
            (Value::Object(x), Value::Object(y)) => {
                let merged = arithmetic::merge_objects(x.as_ref(), y.as_ref());
                Ok(Value::Object(self.heap.alloc_object(merged)))
            }
            _ => arithmetic::add_numeric(a, b),
        }
    }

    fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::String(x), Value::String(y)) => x.as_ref().bytes == y.as_ref().bytes,
            (Value::Error(x), Value::Error(y)) => x.as_ref().message == y.as_ref().message,
            _ => arithmetic::values_equal(a, b),
        }
    }

    fn compare_values(&self, a: Value, b: Value) -> Ordering3 {
        if let (Value::String(x), Value::String(y)) = (a, b) {
            return match x.as_ref().bytes.cmp(&y.as_ref().bytes) {
                std::cmp::Ordering::Less => Ordering3::Less,
                std::cmp::Ordering::Equal => Ordering3::Equal,
                std::cmp::Ordering::Greater => Ordering3::Greater,
            };
        }
        arithmetic::compare(a, b)
    }

    fn op_ordering(&mut self, accept: impl Fn(Ordering3) -> bool) {
        let b = self.pop();
        let a = self.pop();
        match self.compare_values(a, b) {
            Ordering3::Unordered => {
                self.raise_error("values are not ordered");
            }
            ord => self.push(Value::Bool(accept(ord))),
        }
    }

    fn size_of(&self, v: Value) -> Result<Value, ArithError> {
        match v {
            Value::String(s) => Ok(Value::Int(s.as_ref().bytes.len() as i32)),
            Value::Array(a) => Ok(Value::Int(a.as_ref().elements.borrow().len() as i32)),
            Value::Object(o) => Ok(Value::Int(o.as_ref().members.borrow().len() as i32)),
            _ => Err(ArithError::TypeMismatch("sizeof")),
        }
    }

    fn op_unpack(&mut self, a: i32) {
        let n = a as usize;
        let v = self.pop();
        let elems: Vec<Value> = match v.as_array() {
            Some(arr) => {
                let src = arr.as_ref().elements.borrow();
                (0..n).map(|i| src.get(i).copied().unwrap_or(Value::Nil)).collect()
            }
            None if n == 0 => Vec::new(),
            None => {
                let mut out = vec![Value::Nil; n - 1];
                out.push(v);
                out
            }
        };
        for e in elems {
            self.push(e);
        }
    }

    fn op_load_constant(&mut self, a: i32) {
        let module = self
            .current_frame()
            .function
            .as_ref()
            .code
            .module
            .borrow()
            .upgrade()
            .expect("a running CodeObject's module is always alive");
        let constants = module.constants.borrow();
        let v = match &constants[a as usize] {
            Constant::Nil => Value::Nil,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::String(s) => {
                let bytes = s.clone().into_bytes();
                drop(constants);
                let r = self.heap.alloc_string(bytes);
                self.push(Value::String(r));
                return;
            }
            Constant::CodeObject(_) => unreachable!("MakeClosure addresses CodeObject constants directly, never via LoadConstant"),
        };
        self.push(v);
    }

    fn op_load_global(&mut self, a: i32) {
        let module = self
            .current_frame()
            .function
            .as_ref()
            .code
            .module
            .borrow()
            .upgrade()
            .expect("a running CodeObject's module is always alive");
        let v = module.load_global(a as usize);
        self.push(v);
    }

    fn op_store_global(&mut self, a: i32, value: Value) {
        let module = self
            .current_frame()
            .function
            .as_ref()
            .code
            .module
            .borrow()
            .upgrade()
            .expect("a running CodeObject's module is always alive");
        module.store_global(a as usize, value);
    }

    fn op_load_argument(&mut self, a: i32) {
        let arr = self.current_frame().anonymous_parameters;
        let v = arr.as_ref().elements.borrow().get(a as usize).copied().unwrap_or(Value::Nil);
        self.push(v);
    }

    fn op_make_array(&mut self, a: i32) {
        let n = a as usize;
        let mut elems = Vec::with_capacity(n);
        for _ in 0..n {
            elems.push(self.pop());
        }
        elems.reverse();
        let arr = self.heap.alloc_array(elems);
        self.push(Value::Array(arr));
    }

    fn op_load_element(&mut self) {
        let index_v = self.pop();
        let target = self.pop();
        let idx = match index_v {
            Value::Int(i) => i,
            Value::Float(f) => f as i32,
            _ => {
                self.raise_error("index must be a number");
                return;
            }
        };
        match target {
            Value::Array(arr) => {
                let elems = arr.as_ref().elements.borrow();
                match Self::normalize_index(elems.len(), idx) {
                    Some(i) => {
                        let v = elems[i];
                        drop(elems);
                        self.push(v);
                    }
                    None => {
                        drop(elems);
                        self.raise_error("array index out of bounds");
                    }
                }
            }
            Value::String(s) => {
                let bytes = &s.as_ref().bytes;
                match Self::normalize_index(bytes.len(), idx) {
                    Some(i) => {
                        let byte = bytes[i];
                        let ch = self.heap.alloc_string(vec![byte]);
                        self.push(Value::String(ch));
                    }
                    None => self.raise_error("string index out of bounds"),
                }
            }
            _ => {
                self.raise_error("value is not indexable");
            }
        }
    }

    fn op_store_element(&mut self, is_pop_variant: bool) {
        let value = self.pop();
        let index_v = self.pop();
        let target = self.pop();
        let idx = match index_v {
            Value::Int(i) => i,
            Value::Float(f) => f as i32,
            _ => {
                self.raise_error("index must be a number");
                return;
            }
        };
        match target.as_array() {
            Some(arr) => {
                let len = arr.as_ref().elements.borrow().len();
                match Self::normalize_index(len, idx) {
                    Some(i) => {
                        arr.as_ref().elements.borrow_mut()[i] = value;
                        self.heap.write_barrier_value(arr.as_ref().header(), value);
                    }
                    None => {
                        self.raise_error("array index out of bounds");
                        return;
                    }
                }
            }
            None => {
                self.raise_error("value is not indexable");
                return;
            }
        }
        if !is_pop_variant {
            self.push(value);
        }
    }

    fn op_array_push_back(&mut self) {
        let value = self.pop();
        let target = self.pop();
        match target.as_array() {
            Some(arr) => {
                arr.as_ref().elements.borrow_mut().push(value);
                self.heap.write_barrier_value(arr.as_ref().header(), value);
                self.push(target);
            }
            None => {
                self.raise_error("cannot push onto a non-array value");
            }
        }
    }

    fn op_array_pop_back(&mut self) {
        let target = self.pop();
        match target.as_array() {
            Some(arr) => {
                let v = arr.as_ref().elements.borrow_mut().pop().unwrap_or(Value::Nil);
                self.push(v);
            }
            None => {
                self.raise_error("cannot pop from a non-array value");
            }
        }
    }

    fn op_make_object(&mut self, a: i32) {
        let n = a as usize;
        let mut raw = Vec::with_capacity(n);
        for _ in 0..n {
            let value = self.pop();
            let hash_v = self.pop();
            raw.push((hash_v, value));
        }
        raw.reverse();
        let mut members: Vec<(u32, Value)> = Vec::with_capacity(n + 1);
        for (hash_v, value) in raw {
            let hash = match hash_v {
                Value::Hash(h) => h,
                _ => 0,
            };
            match members.binary_search_by_key(&hash, |(h, _)| *h) {
                Ok(i) => members[i].1 = value,
                Err(i) => members.insert(i, (hash, value)),
            }
        }
        if members.binary_search_by_key(&PROTO_HASH, |(h, _)| *h).is_err() {
            members.insert(0, (PROTO_HASH, Value::Nil));
        }
        let obj = self.heap.alloc_object(members);
        self.push(Value::Object(obj));
    }

    fn op_store_member(&mut self, hash: u32, is_pop_variant: bool) {
        let value = self.pop();
        let target = self.pop();
        self.set_member(target, hash, value);
        if !is_pop_variant {
            self.push(value);
        }
    }

    fn op_store_to_box(&mut self, is_pop_variant: bool) {
        let value = self.pop();
        let box_v = self.pop();
        match box_v.as_box() {
            Some(b) => {
                *b.as_ref().value.borrow_mut() = value;
                self.heap.write_barrier_value(b.as_ref().header(), value);
            }
            None => {
                self.raise_error("value is not a box");
                return;
            }
        }
        if !is_pop_variant {
            self.push(value);
        }
    }

    fn do_store_to_closure(&mut self, idx: i32, value: Value) {
        let b = self.current_frame().function.as_ref().free_variables[idx as usize];
        *b.as_ref().value.borrow_mut() = value;
        self.heap.write_barrier_value(b.as_ref().header(), value);
    }

    /// `MakeClosure(A)`: `A` is the target `CodeObject`'s index directly
    /// in the module's constant pool (codegen never emits an intervening
    /// `LoadConstant`). Builds the closure's `free_variables` from
    /// `closure_mapping`: a non-negative entry copies the enclosing
    /// frame's local-as-box at that index; `-i-1` copies the enclosing
    /// frame's own free variable `i` (§4.2 step 4).
    fn op_make_closure(&mut self, a: i32) {
        let module = self
            .current_frame()
            .function
            .as_ref()
            .code
            .module
            .borrow()
            .upgrade()
            .expect("a running CodeObject's module is always alive");
        let target_code = match &module.constants.borrow()[a as usize] {
            Constant::CodeObject(c) => c.clone(),
            _ => unreachable!("MakeClosure's operand always addresses a CodeObject constant"),
        };
        let enclosing = self.current_frame().function;
        let mut free_vars = Vec::with_capacity(target_code.closure_mapping.len());
        for &entry in &target_code.closure_mapping {
            let b = if entry >= 0 {
                match self.current_frame().locals[entry as usize].as_box() {
                    Some(b) => b,
                    None => {
                        self.raise_error("closure capture expects a boxed local");
                        return;
                    }
                }
            } else {
                let i = (-entry - 1) as usize;
                enclosing.as_ref().free_variables[i]
            };
            free_vars.push(b);
        }
        let closure = self.heap.alloc_closure(target_code, free_vars);
        self.push(Value::Function(closure));
    }

    fn op_function_call(&mut self, argc: usize) {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop());
        }
        args.reverse();
        let callee = self.pop();
        match callee {
            Value::NativeFunction(f) => {
                let result = f(self, Value::Nil, &args);
                self.push(result);
            }
            Value::Function(func) => {
                if func.as_ref().is_coroutine() {
                    self.call_coroutine(func, args, Value::Nil);
                } else {
                    let current = self.current.get();
                    self.push_frame_into(current, func, args, Value::Nil);
                }
            }
            _ => {
                self.raise_error("value is not callable");
            }
        }
    }

    fn op_yield(&mut self) {
        let value = self.pop();
        let ctx_ptr = self.current.get();
        let parent = unsafe { ctx_ptr.as_ref() }.parent.get();
        if let Some(parent_ptr) = parent {
            self.current.set(parent_ptr);
        }
        self.push(value);
    }

    fn op_end_function(&mut self) {
        let value = self.pop();
        let mut ctx_ptr = self.current.get();
        let ctx = unsafe { ctx_ptr.as_mut() };
        ctx.frames.pop_back();
        if ctx.frames.is_empty() {
            ctx.state.set(ContextState::Finished);
            if let Some(parent_ptr) = ctx.parent.take() {
                self.current.set(parent_ptr);
            }
        }
        self.push(value);
    }

    fn op_make_iterator(&mut self) {
        let target = self.pop();
        let state = match target {
            Value::Array(array) => IteratorState::Array { array, index: Cell::new(0) },
            Value::String(string) => IteratorState::Str { string, index: Cell::new(0) },
            Value::Object(_) => {
                let has_next = self.lookup_member(target, self.symbols.has_next_hash);
                let get_next = self.lookup_member(target, self.symbols.get_next_hash);
                IteratorState::Object {
                    this_object: target,
                    has_next,
                    get_next,
                }
            }
            Value::Function(function) => IteratorState::Coroutine {
                function,
                cached: std::cell::RefCell::new(None),
                primed: Cell::new(false),
            },
            Value::Iterator(_) => {
                self.push(target);
                return;
            }
            _ => {
                self.raise_error(messages::NOT_ITERABLE);
                return;
            }
        };
        let it = self.heap.alloc_iterator(state);
        self.push(Value::Iterator(it));
    }

    fn op_iterator_has_next(&mut self) {
        let v = self.pop();
        let it = match v {
            Value::Iterator(it) => it,
            _ => {
                self.raise_error("value is not an iterator");
                return;
            }
        };
        let result = match &it.as_ref().state {
            IteratorState::Array { array, index } => index.get() < array.as_ref().elements.borrow().len(),
            IteratorState::Str { string, index } => index.get() < string.as_ref().bytes.len(),
            IteratorState::Range { current, to, step } => {
                if *step >= 0 {
                    current.get() < *to
                } else {
                    current.get() > *to
                }
            }
            IteratorState::Object { this_object, has_next, .. } => {
                let r = self.call_sync(*has_next, *this_object, vec![]);
                r.is_truthy()
            }
            IteratorState::Coroutine { function, cached, primed } => {
                if !primed.get() {
                    let f = *function;
                    let result = self.call_sync(Value::Function(f), Value::Nil, vec![]);
                    let finished = f
                        .as_ref()
                        .execution_context
                        .borrow()
                        .as_ref()
                        .map(|c| c.state.get() == ContextState::Finished)
                        .unwrap_or(true);
                    *cached.borrow_mut() = if finished { None } else { Some(result) };
                    primed.set(true);
                }
                cached.borrow().is_some()
            }
        };
        self.push(Value::Bool(result));
    }

    fn op_iterator_get_next(&mut self) {
        let v = self.pop();
        let it = match v {
            Value::Iterator(it) => it,
            _ => {
                self.raise_error("value is not an iterator");
                return;
            }
        };
        let result = match &it.as_ref().state {
            IteratorState::Array { array, index } => {
                let i = index.get();
                let v = array.as_ref().elements.borrow().get(i).copied().unwrap_or(Value::Nil);
                index.set(i + 1);
                v
            }
            IteratorState::Str { string, index } => {
                let i = index.get();
                let v = string
                    .as_ref()
                    .bytes
                    .get(i)
                    .copied()
                    .map(|b| Value::String(self.heap.alloc_string(vec![b])))
                    .unwrap_or(Value::Nil);
                index.set(i + 1);
                v
            }
            IteratorState::Range { current, step, .. } => {
                let v = Value::Int(current.get());
                current.set(current.get() + *step);
                v
            }
            IteratorState::Object { this_object, get_next, .. } => {
                let this = *this_object;
                let get_next = *get_next;
                self.call_sync(get_next, this, vec![])
            }
            IteratorState::Coroutine { cached, primed, .. } => {
                primed.set(false);
                cached.borrow_mut().take().unwrap_or(Value::Nil)
            }
        };
        self.push(result);
    }
}

fn kind_name(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::String => "string",
        ObjectKind::Array => "array",
        ObjectKind::Object => "object",
        ObjectKind::Function => "function",
        ObjectKind::Box => "box",
        ObjectKind::Iterator => "iterator",
        ObjectKind::Error => "error",
    }
}

impl GcRoots for Vm {
    fn for_each_module_globals(&self, f: &mut dyn FnMut(&[Value])) {
        for m in &self.modules {
            f(&m.globals.borrow());
            let result = *m.result.borrow();
            f(&[result]);
        }
    }

    /// The active call chain (current context plus every ancestor reached
    /// via `parent`) is the only execution-context root: any *other* live
    /// coroutine context is reachable through its owning `Function` value,
    /// which the collector already traces (`mark_step`'s `Function` arm
    /// marks a coroutine's context transitively), so it is never a root in
    /// its own right (§4.4).
    fn for_each_execution_context(&self, f: &mut dyn FnMut(&ExecutionContext)) {
        let mut ptr = Some(self.current.get());
        while let Some(p) = ptr {
            let ctx = unsafe { p.as_ref() };
            f(ctx);
            ptr = ctx.parent.get();
        }
    }
}

impl NativeContext for Vm {
    fn alloc_string(&mut self, bytes: Vec<u8>) -> Value {
        Value::String(self.heap.alloc_string(bytes))
    }

    fn alloc_array(&mut self, elements: Vec<Value>) -> Value {
        Value::Array(self.heap.alloc_array(elements))
    }

    fn alloc_object(&mut self, members: Vec<(u32, Value)>) -> Value {
        Value::Object(self.heap.alloc_object(members))
    }

    fn alloc_error(&mut self, message: String) -> Value {
        Value::Error(self.heap.alloc_error(message))
    }

    fn intern(&mut self, name: &str) -> u32 {
        self.symbols.intern(name)
    }

    fn set_error(&mut self, error: Value) {
        self.pending_error.set(Some(error));
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
