//! Incremental tri-color mark-sweep collector (§4.4), ported field-for-field
//! from `memory.cpp`'s `MemoryManager`: the same five-phase state machine,
//! the same alternating-white scheme, the same write barrier.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::rc::Rc;

use crate::bytecode::CodeObject;
use crate::heap::{
    ArrayObj, BoxObj, Color, ContextState, ErrorObj, ExecutionContext, FunctionObj, GcHeader,
    GcRef, HeapObject, IteratorObj, IteratorState, ObjectKind, ObjectObj, StringObj,
};
use crate::value::Value;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Ready,
    MarkRoots,
    Mark,
    SweepHead,
    SweepRest,
}

/// Per-kind live/freed counters, surfaced to the `memory_stats` native.
#[derive(Default, Clone, Copy, Debug)]
pub struct KindCounts {
    pub live: u64,
    pub freed: u64,
}

/// Anything the collector needs to treat as a root set, implemented by the
/// VM (`element-runtime`) so `element-core` doesn't need to know about
/// module caches or the context tree's ownership.
pub trait GcRoots {
    fn for_each_module_globals(&self, f: &mut dyn FnMut(&[Value]));
    fn for_each_execution_context(&self, f: &mut dyn FnMut(&ExecutionContext));
}

pub struct Heap {
    head: Cell<Option<NonNull<GcHeader>>>,
    counts: RefCell<HashMap<ObjectKind, KindCounts>>,
    current_white: Cell<Color>,
    next_white: Cell<Color>,
    phase: Cell<Phase>,
    gray: RefCell<VecDeque<NonNull<GcHeader>>>,
    sweep_prev: Cell<Option<NonNull<GcHeader>>>,
    sweep_curr: Cell<Option<NonNull<GcHeader>>>,
    cycles_completed: Cell<u64>,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            head: Cell::new(None),
            counts: RefCell::new(HashMap::new()),
            current_white: Cell::new(Color::White0),
            next_white: Cell::new(Color::White1),
            phase: Cell::new(Phase::Ready),
            gray: RefCell::new(VecDeque::new()),
            sweep_prev: Cell::new(None),
            sweep_curr: Cell::new(None),
            cycles_completed: Cell::new(0),
        }
    }

    fn next_white(&self) -> Color {
        self.next_white.get()
    }

    fn bump_live(&self, kind: ObjectKind) {
        self.counts.borrow_mut().entry(kind).or_default().live += 1;
    }

    fn bump_freed(&self, kind: ObjectKind) {
        let mut counts = self.counts.borrow_mut();
        let entry = counts.entry(kind).or_default();
        entry.live = entry.live.saturating_sub(1);
        entry.freed += 1;
    }

    pub fn stats(&self) -> HashMap<ObjectKind, KindCounts> {
        self.counts.borrow().clone()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.get()
    }

    fn link<T: HeapObject>(&self, raw: *mut T) -> GcRef<T> {
        let header_ptr = unsafe { NonNull::new_unchecked(raw as *mut GcHeader) };
        unsafe {
            header_ptr.as_ref().next.set(self.head.get());
        }
        self.head.set(Some(header_ptr));
        self.bump_live(unsafe { header_ptr.as_ref().kind });
        unsafe { GcRef::from_raw(NonNull::new_unchecked(raw)) }
    }

    pub fn alloc_string(&self, bytes: Vec<u8>) -> GcRef<StringObj> {
        let obj = Box::into_raw(Box::new(StringObj::new(bytes, self.next_white())));
        self.link(obj)
    }

    pub fn alloc_array(&self, elements: Vec<Value>) -> GcRef<ArrayObj> {
        let obj = Box::into_raw(Box::new(ArrayObj::new(elements, self.next_white())));
        self.link(obj)
    }

    pub fn alloc_object(&self, members: Vec<(u32, Value)>) -> GcRef<ObjectObj> {
        let obj = Box::into_raw(Box::new(ObjectObj::new(members, self.next_white())));
        self.link(obj)
    }

    pub fn alloc_box(&self, value: Value) -> GcRef<BoxObj> {
        let obj = Box::into_raw(Box::new(BoxObj::new(value, self.next_white())));
        self.link(obj)
    }

    pub fn alloc_error(&self, message: String) -> GcRef<ErrorObj> {
        let obj = Box::into_raw(Box::new(ErrorObj::new(message, self.next_white())));
        self.link(obj)
    }

    pub fn alloc_iterator(&self, state: IteratorState) -> GcRef<IteratorObj> {
        let obj = Box::into_raw(Box::new(IteratorObj::new(state, self.next_white())));
        self.link(obj)
    }

    pub fn alloc_closure(&self, code: Rc<CodeObject>, free_variables: Vec<GcRef<BoxObj>>) -> GcRef<FunctionObj> {
        let obj = Box::into_raw(Box::new(FunctionObj::new_closure(code, free_variables, self.next_white())));
        self.link(obj)
    }

    pub fn alloc_coroutine(&self, code: Rc<CodeObject>, free_variables: Vec<GcRef<BoxObj>>) -> GcRef<FunctionObj> {
        let obj = Box::into_raw(Box::new(FunctionObj::new_coroutine(code, free_variables, self.next_white())));
        self.link(obj)
    }

    /// Constant-pool Function templates: `Static`, linked into the same
    /// list as everything else, but sweep never touches `Static` objects
    /// (I6), so this is simply "allocate and never recolor".
    pub fn alloc_function_template(&self, code: Rc<CodeObject>) -> GcRef<FunctionObj> {
        let obj = Box::into_raw(Box::new(FunctionObj::new_template(code)));
        self.link(obj)
    }

    /// The write barrier (§4.4): called whenever a managed child is placed
    /// into a managed parent. If the parent is already Black and the child
    /// is current-white, turn the child Gray and enqueue it so the
    /// in-progress mark phase won't miss it (I5 / P4).
    pub fn write_barrier(&self, parent: &GcHeader, child: &GcHeader) {
        if parent.color.get() == Color::Black && child.color.get() == self.current_white.get() {
            child.color.set(Color::Gray);
            self.gray
                .borrow_mut()
                .push_back(unsafe { NonNull::new_unchecked(child as *const GcHeader as *mut GcHeader) });
        }
    }

    /// Same as `write_barrier` but takes `Value`s directly, since most call
    /// sites are storing a `Value` into an array/object/box.
    pub fn write_barrier_value(&self, parent: &GcHeader, child: Value) {
        if let Some(ptr) = header_of(child) {
            self.write_barrier(parent, unsafe { ptr.as_ref() });
        }
    }

    /// Runs up to `steps` units of collection work, resuming wherever the
    /// previous call left off. Mirrors `MemoryManager::collectGarbage`'s
    /// switch-with-fallthrough exactly.
    pub fn collect_garbage(&self, steps: u32, roots: &dyn GcRoots) {
        let mut remaining = steps;
        loop {
            match self.phase.get() {
                Phase::Ready => {
                    self.begin_cycle();
                    self.phase.set(Phase::MarkRoots);
                }
                Phase::MarkRoots => {
                    self.mark_roots(roots);
                    self.phase.set(Phase::Mark);
                }
                Phase::Mark => {
                    while remaining > 0 {
                        if !self.mark_step() {
                            self.phase.set(Phase::SweepHead);
                            break;
                        }
                        remaining -= 1;
                    }
                    if remaining == 0 {
                        return;
                    }
                    continue;
                }
                Phase::SweepHead => {
                    self.sweep_head();
                    self.phase.set(Phase::SweepRest);
                }
                Phase::SweepRest => {
                    while remaining > 0 {
                        if !self.sweep_step() {
                            self.finish_cycle();
                            self.phase.set(Phase::Ready);
                            return;
                        }
                        remaining -= 1;
                    }
                    if remaining == 0 {
                        return;
                    }
                }
            }
            if remaining == 0 {
                return;
            }
        }
    }

    /// Runs a full collection cycle to completion, regardless of the step
    /// budget — used by tests and by `garbage_collect(true)`. A single
    /// `collect_garbage` call with an effectively unbounded budget drains
    /// every phase in turn and returns once back at `Ready`, whatever
    /// phase the collector happened to be resuming from.
    pub fn collect_garbage_full(&self, roots: &dyn GcRoots) {
        self.collect_garbage(u32::MAX, roots);
    }

    fn begin_cycle(&self) {
        self.gray.borrow_mut().clear();
        self.sweep_prev.set(None);
        self.sweep_curr.set(None);
    }

    fn finish_cycle(&self) {
        // Swap whites: this cycle's survivors are already painted
        // next-white during sweep, so swapping avoids a repaint pass.
        let (cw, nw) = (self.current_white.get(), self.next_white.get());
        self.current_white.set(nw);
        self.next_white.set(cw);
        self.cycles_completed.set(self.cycles_completed.get() + 1);
    }

    fn mark_roots(&self, roots: &dyn GcRoots) {
        roots.for_each_module_globals(&mut |globals| {
            for v in globals {
                self.mark_value_gray(*v);
            }
        });
        roots.for_each_execution_context(&mut |ctx| {
            for frame in &ctx.frames {
                for local in &frame.locals {
                    self.mark_value_gray(*local);
                }
                self.mark_gray(frame.anonymous_parameters.as_ref().header());
                self.mark_value_gray(frame.this_value);
            }
            for v in &ctx.stack {
                self.mark_value_gray(*v);
            }
        });
    }

    fn mark_value_gray(&self, value: Value) {
        if let Some(ptr) = header_of(value) {
            self.mark_gray(unsafe { ptr.as_ref() });
        }
    }

    fn mark_gray(&self, header: &GcHeader) {
        if header.color.get() == self.current_white.get() {
            header.color.set(Color::Gray);
            self.gray
                .borrow_mut()
                .push_back(unsafe { NonNull::new_unchecked(header as *const GcHeader as *mut GcHeader) });
        }
    }

    /// Pops one gray object, blackens it, and grays its unmarked children.
    /// Returns false once the gray deque is empty (mark phase complete).
    fn mark_step(&self) -> bool {
        let Some(ptr) = self.gray.borrow_mut().pop_front() else {
            return false;
        };
        let header = unsafe { ptr.as_ref() };
        header.color.set(Color::Black);
        match header.kind {
            ObjectKind::String | ObjectKind::Error => {}
            ObjectKind::Array => {
                let array = unsafe { &*(ptr.as_ptr() as *const ArrayObj) };
                for v in array.elements.borrow().iter() {
                    self.mark_value_gray(*v);
                }
            }
            ObjectKind::Object => {
                let object = unsafe { &*(ptr.as_ptr() as *const ObjectObj) };
                for (_, v) in object.members.borrow().iter() {
                    self.mark_value_gray(*v);
                }
            }
            ObjectKind::Box => {
                let b = unsafe { &*(ptr.as_ptr() as *const BoxObj) };
                self.mark_value_gray(*b.value.borrow());
            }
            ObjectKind::Function => {
                let f = unsafe { &*(ptr.as_ptr() as *const FunctionObj) };
                for fv in &f.free_variables {
                    self.mark_gray(fv.as_ref().header());
                }
                if let Some(ctx) = f.execution_context.borrow().as_ref() {
                    self.mark_execution_context(ctx);
                }
            }
            ObjectKind::Iterator => {
                let it = unsafe { &*(ptr.as_ptr() as *const IteratorObj) };
                match &it.state {
                    IteratorState::Array { array, .. } => self.mark_gray(array.as_ref().header()),
                    IteratorState::Str { string, .. } => self.mark_gray(string.as_ref().header()),
                    IteratorState::Object {
                        this_object,
                        has_next,
                        get_next,
                    } => {
                        self.mark_value_gray(*this_object);
                        self.mark_value_gray(*has_next);
                        self.mark_value_gray(*get_next);
                    }
                    IteratorState::Coroutine { function, cached, .. } => {
                        self.mark_gray(function.as_ref().header());
                        if let Some(v) = *cached.borrow() {
                            self.mark_value_gray(v);
                        }
                    }
                    IteratorState::Range { .. } => {}
                }
            }
        }
        true
    }

    fn mark_execution_context(&self, ctx: &ExecutionContext) {
        for frame in &ctx.frames {
            for local in &frame.locals {
                self.mark_value_gray(*local);
            }
            self.mark_gray(frame.anonymous_parameters.as_ref().header());
            self.mark_value_gray(frame.this_value);
        }
        for v in &ctx.stack {
            self.mark_value_gray(*v);
        }
    }

    fn sweep_head(&self) {
        loop {
            let Some(head) = self.head.get() else { return };
            let header = unsafe { head.as_ref() };
            if header.color.get() == Color::Static {
                self.sweep_prev.set(Some(head));
                self.sweep_curr.set(header.next.get());
                return;
            }
            if header.color.get() == self.current_white.get() {
                self.head.set(header.next.get());
                free_object(head, self);
                continue;
            }
            header.color.set(self.next_white.get());
            self.sweep_prev.set(Some(head));
            self.sweep_curr.set(header.next.get());
            return;
        }
    }

    /// Advances the sweep cursor by one object. Returns false once the list
    /// is exhausted (sweep phase complete).
    fn sweep_step(&self) -> bool {
        let Some(curr) = self.sweep_curr.get() else {
            return false;
        };
        let header = unsafe { curr.as_ref() };
        let next = header.next.get();
        if header.color.get() != Color::Static && header.color.get() == self.current_white.get() {
            if let Some(prev) = self.sweep_prev.get() {
                unsafe { prev.as_ref().next.set(next) };
            }
            free_object(curr, self);
        } else {
            if header.color.get() != Color::Static {
                header.color.set(self.next_white.get());
            }
            self.sweep_prev.set(Some(curr));
        }
        self.sweep_curr.set(next);
        true
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the raw header pointer from a managed `Value` without tying a
/// borrow to this function's stack frame (the referent is heap-owned and
/// outlives this call; callers dereference it through their own, properly
/// scoped `unsafe` block).
fn header_of(value: Value) -> Option<NonNull<GcHeader>> {
    let ptr = match value {
        Value::String(r) => r.as_ptr() as *mut GcHeader,
        Value::Array(r) => r.as_ptr() as *mut GcHeader,
        Value::Object(r) => r.as_ptr() as *mut GcHeader,
        Value::Function(r) => r.as_ptr() as *mut GcHeader,
        Value::Box(r) => r.as_ptr() as *mut GcHeader,
        Value::Iterator(r) => r.as_ptr() as *mut GcHeader,
        Value::Error(r) => r.as_ptr() as *mut GcHeader,
        _ => return None,
    };
    Some(unsafe { NonNull::new_unchecked(ptr) })
}

/// Frees a swept heap object, downcasting by `header.kind` the same way
/// `freeGC`'s `switch (value.type)` does. A `Function` with a live
/// coroutine execution context drops that context (and transitively its
/// frames/locals) along with it.
fn free_object(ptr: NonNull<GcHeader>, heap: &Heap) {
    let kind = unsafe { ptr.as_ref().kind };
    heap.bump_freed(kind);
    unsafe {
        match kind {
            ObjectKind::String => drop(Box::from_raw(ptr.as_ptr() as *mut StringObj)),
            ObjectKind::Array => drop(Box::from_raw(ptr.as_ptr() as *mut ArrayObj)),
            ObjectKind::Object => drop(Box::from_raw(ptr.as_ptr() as *mut ObjectObj)),
            ObjectKind::Box => drop(Box::from_raw(ptr.as_ptr() as *mut BoxObj)),
            ObjectKind::Error => drop(Box::from_raw(ptr.as_ptr() as *mut ErrorObj)),
            ObjectKind::Iterator => drop(Box::from_raw(ptr.as_ptr() as *mut IteratorObj)),
            ObjectKind::Function => drop(Box::from_raw(ptr.as_ptr() as *mut FunctionObj)),
        }
    }
}

/// Convenience used by the VM when transferring control into a coroutine:
/// the coroutine's own context is rooted for as long as its owning
/// Function is reachable (see `mark_step`'s `Function` arm), so nothing
/// extra is required here — this just documents the invariant (I4).
pub fn assert_coroutine_invariant(function: &FunctionObj) {
    debug_assert!(
        function.execution_context.borrow().is_none()
            || function
                .execution_context
                .borrow()
                .as_ref()
                .unwrap()
                .state
                .get()
                != ContextState::NotStarted
            || function.execution_context.borrow().as_ref().unwrap().parent.get().is_none()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRoots;
    impl GcRoots for NoRoots {
        fn for_each_module_globals(&self, _f: &mut dyn FnMut(&[Value])) {}
        fn for_each_execution_context(&self, _f: &mut dyn FnMut(&ExecutionContext)) {}
    }

    #[test]
    fn unreachable_array_is_collected() {
        let heap = Heap::new();
        let _ = heap.alloc_array(vec![Value::Int(1), Value::Int(2)]);
        heap.collect_garbage_full(&NoRoots);
        let stats = heap.stats();
        assert_eq!(stats.get(&ObjectKind::Array).map(|c| c.live).unwrap_or(0), 0);
    }

    #[test]
    fn rooted_array_survives_collection() {
        struct OneGlobal(Vec<Value>);
        impl GcRoots for OneGlobal {
            fn for_each_module_globals(&self, f: &mut dyn FnMut(&[Value])) {
                f(&self.0);
            }
            fn for_each_execution_context(&self, _f: &mut dyn FnMut(&ExecutionContext)) {}
        }
        let heap = Heap::new();
        let array = heap.alloc_array(vec![Value::Int(1)]);
        let roots = OneGlobal(vec![Value::Array(array)]);
        heap.collect_garbage_full(&roots);
        assert_eq!(heap.stats().get(&ObjectKind::Array).unwrap().live, 1);
    }

    #[test]
    fn write_barrier_protects_child_linked_into_black_parent() {
        // S6: mark `a` Black manually, then push `o` into `a` via the
        // write barrier, then finish the cycle — `o` must survive.
        let heap = Heap::new();
        let array = heap.alloc_array(vec![]);
        let object = heap.alloc_object(vec![]);
        array.as_ref().header().color.set(Color::Black);
        heap.write_barrier(array.as_ref().header(), object.as_ref().header());
        array.as_ref().elements.borrow_mut().push(Value::Object(object));
        assert_eq!(object.as_ref().header().color.get(), Color::Gray);

        // Drain the already-gray object before a fresh cycle would reset it.
        while heap.mark_step() {}
        assert_eq!(heap.stats().get(&ObjectKind::Object).unwrap().live, 1);
    }
}
