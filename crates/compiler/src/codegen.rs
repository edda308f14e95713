//! Bytecode compiler (§4.3): walks a resolved AST and emits one
//! `CodeObject` per function into a single, module-wide constant pool.
//!
//! Every expression-producing helper (`compile_expr`) leaves exactly one
//! value on the VM operand stack; every statement helper (`compile_stmt`)
//! leaves none. `If`/`While`/`For`/`Block` can be compiled in either mode
//! (`keep: bool`) since they can appear as either a statement or the tail
//! expression of an enclosing block.

use std::rc::Rc;

use element_core::bytecode::{CodeObject, Constant, Instruction, Opcode, SourceLine};
use element_core::symbol::SymbolTable;

use crate::ast::{BinOp, Block, FunctionNode, Node, SemanticType, UnaryOp, VariableKind, VariableNode};

struct LoopCg {
    break_patches: Vec<usize>,
    continue_target: usize,
    /// Extra values a for-loop keeps live on the operand stack across its
    /// whole body (its iterator); `break`/`return` must `PopN` this many
    /// values before leaving, since they skip the loop's own natural-exit
    /// cleanup.
    own_garbage: i32,
    /// Whether this loop is being compiled as an expression (so `break`'s
    /// value should survive) or a statement (so it gets popped).
    keep: bool,
}

struct FnCg {
    instructions: Vec<Instruction>,
    lines: Vec<SourceLine>,
    last_line: i32,
    loops: Vec<LoopCg>,
}

impl FnCg {
    fn new() -> Self {
        FnCg { instructions: Vec::new(), lines: Vec::new(), last_line: -1, loops: Vec::new() }
    }

    fn emit(&mut self, opcode: Opcode, a: i32, line: i32) -> usize {
        if line != self.last_line {
            self.lines.push(SourceLine { line, instruction_index: self.instructions.len() as i32 });
            self.last_line = line;
        }
        self.instructions.push(Instruction::new(opcode, a));
        self.instructions.len() - 1
    }

    fn here(&self) -> usize {
        self.instructions.len()
    }

    fn patch_jump(&mut self, at: usize, target: usize) {
        self.instructions[at].a = target as i32;
    }

    fn total_loop_garbage(&self) -> i32 {
        self.loops.iter().map(|l| l.own_garbage).sum()
    }
}

pub struct Codegen<'a> {
    symbols: &'a mut SymbolTable,
    constants: Vec<Constant>,
}

impl<'a> Codegen<'a> {
    pub fn new(symbols: &'a mut SymbolTable) -> Self {
        // Slots 0/1/2 are the fixed Nil/true/false constants (§4.1); slot 3
        // is reserved for the module's entry point and overwritten by
        // `compile_program` once the body has been compiled (nested
        // function literals are compiled first and land after it).
        Codegen { symbols, constants: vec![Constant::Nil, Constant::Bool(true), Constant::Bool(false), Constant::Nil] }
    }

    pub fn compile_program(&mut self, program: &FunctionNode) -> u32 {
        let code = self.compile_function_into_code(program, "main".to_string());
        self.constants[3] = Constant::CodeObject(Rc::new(code));
        3
    }

    pub fn into_constants(self) -> Vec<Constant> {
        self.constants
    }

    fn compile_function_body(&mut self, f: &FunctionNode) -> u32 {
        let code = self.compile_function_into_code(f, String::new());
        let idx = self.constants.len() as u32;
        self.constants.push(Constant::CodeObject(Rc::new(code)));
        idx
    }

    fn compile_function_into_code(&mut self, f: &FunctionNode, name: String) -> CodeObject {
        let mut fc = FnCg::new();
        for &pidx in f.parameters_to_box.borrow().iter() {
            fc.emit(Opcode::LoadLocal, pidx as i32, f.line);
            fc.emit(Opcode::MakeBox, 0, f.line);
            fc.emit(Opcode::PopStoreLocal, pidx as i32, f.line);
        }
        // The function body is compiled keeping its last expression's value
        // (the original's `buildFuncStmt` always calls `buildBlockStmt` with
        // `keepValue = true`), so a function with no explicit `return`
        // implicitly returns whatever its last statement evaluates to.
        self.compile_block_as_expr(&f.body, &mut fc);
        fc.emit(Opcode::EndFunction, 0, f.line);
        CodeObject::new(
            name,
            fc.instructions,
            fc.lines,
            f.local_variables_count.get(),
            f.parameters.len() as i32,
            f.closure_mapping.borrow().clone(),
        )
    }

    // ---- constant pool dedup (§4.1: linear scan from slot 3 onward) ----

    fn const_int(&mut self, v: i32) -> i32 {
        for (i, c) in self.constants.iter().enumerate().skip(3) {
            if let Constant::Int(x) = c {
                if *x == v {
                    return i as i32;
                }
            }
        }
        self.constants.push(Constant::Int(v));
        (self.constants.len() - 1) as i32
    }

    fn const_float(&mut self, v: f32) -> i32 {
        for (i, c) in self.constants.iter().enumerate().skip(3) {
            if let Constant::Float(x) = c {
                if *x == v {
                    return i as i32;
                }
            }
        }
        self.constants.push(Constant::Float(v));
        (self.constants.len() - 1) as i32
    }

    fn const_str(&mut self, v: &str) -> i32 {
        for (i, c) in self.constants.iter().enumerate().skip(3) {
            if let Constant::String(x) = c {
                if x == v {
                    return i as i32;
                }
            }
        }
        self.constants.push(Constant::String(v.to_string()));
        (self.constants.len() - 1) as i32
    }

    fn member_hash(&mut self, node: &Node) -> u32 {
        match node {
            Node::Variable(v) => self.symbols.intern(&v.name),
            _ => unreachable!("member/key position must hold a name"),
        }
    }

    // ---- statements (net stack effect zero) ----

    fn compile_block_as_statement(&mut self, block: &Block, fc: &mut FnCg) {
        for s in &block.statements {
            self.compile_stmt(s, fc);
        }
    }

    fn compile_stmt(&mut self, node: &Node, fc: &mut FnCg) {
        match node {
            Node::Assign { target, value, line } => self.compile_assign(target, value, false, fc, *line),
            Node::Call { callee, args, line } => {
                self.compile_expr(callee, fc);
                for a in args {
                    self.compile_expr(a, fc);
                }
                fc.emit(Opcode::FunctionCall, args.len() as i32, *line);
                fc.emit(Opcode::Pop, 0, *line);
            }
            Node::Pipe { value, call, line } => {
                self.compile_pipe(value, call, *line, fc);
                fc.emit(Opcode::Pop, 0, *line);
            }
            Node::If { cond, then_branch, else_branch, line } => {
                self.compile_if(cond, then_branch, else_branch.as_ref(), *line, fc, false)
            }
            Node::While { cond, body, line } => self.compile_while(cond, body, *line, fc, false),
            Node::For { binding, iterable, body, line } => self.compile_for(binding, iterable, body, *line, fc, false),
            Node::Block(b) => self.compile_block_as_statement(b, fc),
            Node::Break(v, line) => self.compile_break(v.as_deref(), *line, fc),
            Node::Continue(v, line) => self.compile_continue(v.as_deref(), *line, fc),
            Node::Return(v, line) => self.compile_return(v.as_deref(), *line, fc),
            Node::Yield(v, line) => {
                self.compile_expr(v, fc);
                fc.emit(Opcode::Yield, 0, *line);
                fc.emit(Opcode::Pop, 0, *line);
            }
            other => {
                let line = other.line();
                self.compile_expr(other, fc);
                fc.emit(Opcode::Pop, 0, line);
            }
        }
    }

    // ---- expressions (net stack effect +1) ----

    fn compile_block_as_expr(&mut self, block: &Block, fc: &mut FnCg) {
        let n = block.statements.len();
        if n == 0 {
            fc.emit(Opcode::LoadConstant, 0, 0);
            return;
        }
        for s in &block.statements[..n - 1] {
            self.compile_stmt(s, fc);
        }
        let last = &block.statements[n - 1];
        match last {
            Node::Break(..) | Node::Continue(..) | Node::Return(..) => self.compile_stmt(last, fc),
            _ => self.compile_expr(last, fc),
        }
    }

    fn compile_expr(&mut self, node: &Node, fc: &mut FnCg) {
        let line = node.line();
        match node {
            Node::Nil(_) => {
                fc.emit(Opcode::LoadConstant, 0, line);
            }
            Node::Bool(true, _) => {
                fc.emit(Opcode::LoadConstant, 1, line);
            }
            Node::Bool(false, _) => {
                fc.emit(Opcode::LoadConstant, 2, line);
            }
            Node::Int(v, _) => {
                let idx = self.const_int(*v);
                fc.emit(Opcode::LoadConstant, idx, line);
            }
            Node::Float(v, _) => {
                let idx = self.const_float(*v);
                fc.emit(Opcode::LoadConstant, idx, line);
            }
            Node::Str(s, _) => {
                let idx = self.const_str(s);
                fc.emit(Opcode::LoadConstant, idx, line);
            }
            Node::Variable(v) => self.compile_variable_load(v, fc, line),
            Node::Array(elems, _) => {
                for e in elems {
                    self.compile_expr(e, fc);
                }
                fc.emit(Opcode::MakeArray, elems.len() as i32, line);
            }
            Node::Object(members, _) => {
                if members.is_empty() {
                    fc.emit(Opcode::MakeEmptyObject, 0, line);
                } else {
                    for (key, value) in members {
                        let hash = self.symbols.intern(&key.name);
                        fc.emit(Opcode::LoadHash, hash as i32, line);
                        self.compile_expr(value, fc);
                    }
                    fc.emit(Opcode::MakeObject, members.len() as i32, line);
                }
            }
            Node::Function(f) => {
                let idx = self.compile_function_body(f);
                fc.emit(Opcode::MakeClosure, idx as i32, line);
            }
            Node::Unary(op, operand, _) => {
                self.compile_expr(operand, fc);
                fc.emit(unary_opcode(*op), 0, line);
            }
            Node::Binary(BinOp::And, lhs, rhs, _) => {
                self.compile_expr(lhs, fc);
                let j = fc.emit(Opcode::JumpIfFalseOrPop, -1, line);
                self.compile_expr(rhs, fc);
                let end = fc.here();
                fc.patch_jump(j, end);
            }
            Node::Binary(BinOp::Or, lhs, rhs, _) => {
                self.compile_expr(lhs, fc);
                let j = fc.emit(Opcode::JumpIfTrueOrPop, -1, line);
                self.compile_expr(rhs, fc);
                let end = fc.here();
                fc.patch_jump(j, end);
            }
            Node::Binary(BinOp::Index, lhs, index, _) => {
                self.compile_expr(lhs, fc);
                self.compile_expr(index, fc);
                fc.emit(Opcode::LoadElement, 0, line);
            }
            Node::Binary(BinOp::Member, lhs, member, _) => {
                self.compile_expr(lhs, fc);
                let hash = self.member_hash(member);
                fc.emit(Opcode::LoadMember, hash as i32, line);
            }
            Node::Binary(BinOp::ArrayPushBack, lhs, rhs, _) => {
                self.compile_expr(lhs, fc);
                self.compile_expr(rhs, fc);
                fc.emit(Opcode::ArrayPushBack, 0, line);
            }
            Node::Binary(op, lhs, rhs, _) => {
                self.compile_expr(lhs, fc);
                self.compile_expr(rhs, fc);
                fc.emit(binary_opcode(*op), 0, line);
            }
            Node::Assign { target, value, line } => self.compile_assign(target, value, true, fc, *line),
            Node::ArrayDestructure(..) => unreachable!("destructure only valid as an assignment target"),
            Node::Call { callee, args, line } => {
                self.compile_expr(callee, fc);
                for a in args {
                    self.compile_expr(a, fc);
                }
                fc.emit(Opcode::FunctionCall, args.len() as i32, *line);
            }
            Node::Pipe { value, call, line } => self.compile_pipe(value, call, *line, fc),
            Node::If { cond, then_branch, else_branch, line } => {
                self.compile_if(cond, then_branch, else_branch.as_ref(), *line, fc, true)
            }
            Node::While { cond, body, line } => self.compile_while(cond, body, *line, fc, true),
            Node::For { binding, iterable, body, line } => self.compile_for(binding, iterable, body, *line, fc, true),
            Node::Block(b) => self.compile_block_as_expr(b, fc),
            Node::Break(v, line) => self.compile_break(v.as_deref(), *line, fc),
            Node::Continue(v, line) => self.compile_continue(v.as_deref(), *line, fc),
            Node::Return(v, line) => self.compile_return(v.as_deref(), *line, fc),
            Node::Yield(v, line) => {
                self.compile_expr(v, fc);
                fc.emit(Opcode::Yield, 0, *line);
            }
        }
    }

    fn compile_variable_load(&mut self, v: &VariableNode, fc: &mut FnCg, line: i32) {
        match v.kind {
            VariableKind::This => {
                fc.emit(Opcode::LoadThis, 0, line);
                return;
            }
            VariableKind::DollarDollar => {
                fc.emit(Opcode::LoadArgsArray, 0, line);
                return;
            }
            VariableKind::Positional(n) => {
                fc.emit(Opcode::LoadArgument, n as i32, line);
                return;
            }
            VariableKind::Discard => {
                fc.emit(Opcode::LoadConstant, 0, line);
                return;
            }
            VariableKind::Named => {}
        }
        match v.semantic_type.get() {
            SemanticType::Local => {
                fc.emit(Opcode::LoadLocal, v.index.get(), line);
            }
            SemanticType::LocalBoxed => {
                fc.emit(Opcode::LoadLocal, v.index.get(), line);
                fc.emit(Opcode::LoadFromBox, 0, line);
            }
            SemanticType::Global => {
                fc.emit(Opcode::LoadGlobal, v.index.get(), line);
            }
            SemanticType::Native => {
                fc.emit(Opcode::LoadNative, v.index.get(), line);
            }
            SemanticType::FreeVariable => {
                fc.emit(Opcode::LoadFromClosure, v.index.get(), line);
            }
            SemanticType::Unresolved => unreachable!("every named variable is resolved before codegen"),
        };
    }

    // ---- assignment targets ----

    fn compile_assign(&mut self, target: &Node, value: &Node, keep: bool, fc: &mut FnCg, line: i32) {
        match target {
            Node::Variable(v) => self.compile_assign_variable(v, value, keep, fc, line),
            Node::Binary(BinOp::Index, lhs, index, _) => {
                self.compile_expr(lhs, fc);
                self.compile_expr(index, fc);
                self.compile_expr(value, fc);
                if keep {
                    fc.emit(Opcode::StoreElement, 0, line);
                } else {
                    fc.emit(Opcode::PopStoreElement, 0, line);
                }
            }
            Node::Binary(BinOp::Member, lhs, member, _) => {
                let hash = self.member_hash(member);
                self.compile_expr(lhs, fc);
                self.compile_expr(value, fc);
                if keep {
                    fc.emit(Opcode::StoreMember, hash as i32, line);
                } else {
                    fc.emit(Opcode::PopStoreMember, hash as i32, line);
                }
            }
            Node::ArrayDestructure(targets, _) => {
                self.compile_expr(value, fc);
                fc.emit(Opcode::Unpack, targets.len() as i32, line);
                for t in targets.iter().rev() {
                    self.compile_assign_from_stack(t, fc, line);
                }
                if keep {
                    fc.emit(Opcode::LoadConstant, 0, line);
                }
            }
            _ => unreachable!("resolver rejects non-assignable targets"),
        }
    }

    fn compile_assign_variable(&mut self, v: &VariableNode, value: &Node, keep: bool, fc: &mut FnCg, line: i32) {
        if v.kind == VariableKind::Discard {
            self.compile_expr(value, fc);
            if !keep {
                fc.emit(Opcode::Pop, 0, line);
            }
            return;
        }
        match v.semantic_type.get() {
            SemanticType::Local => {
                self.compile_expr(value, fc);
                if keep {
                    fc.emit(Opcode::StoreLocal, v.index.get(), line);
                } else {
                    fc.emit(Opcode::PopStoreLocal, v.index.get(), line);
                }
            }
            SemanticType::LocalBoxed if v.first_occurrence.get() => {
                self.compile_expr(value, fc);
                fc.emit(Opcode::Duplicate, 0, line);
                fc.emit(Opcode::MakeBox, 0, line);
                fc.emit(Opcode::PopStoreLocal, v.index.get(), line);
                if !keep {
                    fc.emit(Opcode::Pop, 0, line);
                }
            }
            SemanticType::LocalBoxed => {
                self.compile_expr(value, fc);
                fc.emit(Opcode::LoadLocal, v.index.get(), line);
                fc.emit(Opcode::Rotate2, 0, line);
                if keep {
                    fc.emit(Opcode::StoreToBox, 0, line);
                } else {
                    fc.emit(Opcode::PopStoreToBox, 0, line);
                }
            }
            SemanticType::Global => {
                self.compile_expr(value, fc);
                if keep {
                    fc.emit(Opcode::StoreGlobal, v.index.get(), line);
                } else {
                    fc.emit(Opcode::PopStoreGlobal, v.index.get(), line);
                }
            }
            SemanticType::FreeVariable => {
                self.compile_expr(value, fc);
                if keep {
                    fc.emit(Opcode::StoreToClosure, v.index.get(), line);
                } else {
                    fc.emit(Opcode::PopStoreToClosure, v.index.get(), line);
                }
            }
            SemanticType::Native | SemanticType::Unresolved => unreachable!("not a valid assignment target"),
        }
    }

    /// Same as `compile_assign_variable` but the value is already on top of
    /// the stack (used for array-destructuring targets, after `Unpack`).
    fn compile_assign_from_stack(&mut self, target: &Node, fc: &mut FnCg, line: i32) {
        match target {
            Node::Variable(v) if v.kind == VariableKind::Discard => {
                fc.emit(Opcode::Pop, 0, line);
            }
            Node::Variable(v) => match v.semantic_type.get() {
                SemanticType::Local => {
                    fc.emit(Opcode::PopStoreLocal, v.index.get(), line);
                }
                SemanticType::LocalBoxed if v.first_occurrence.get() => {
                    fc.emit(Opcode::MakeBox, 0, line);
                    fc.emit(Opcode::PopStoreLocal, v.index.get(), line);
                }
                SemanticType::LocalBoxed => {
                    fc.emit(Opcode::LoadLocal, v.index.get(), line);
                    fc.emit(Opcode::Rotate2, 0, line);
                    fc.emit(Opcode::PopStoreToBox, 0, line);
                }
                SemanticType::Global => {
                    fc.emit(Opcode::PopStoreGlobal, v.index.get(), line);
                }
                SemanticType::FreeVariable => {
                    fc.emit(Opcode::PopStoreToClosure, v.index.get(), line);
                }
                SemanticType::Native | SemanticType::Unresolved => unreachable!("not a valid assignment target"),
            },
            Node::Binary(BinOp::Index, lhs, index, _) => {
                self.compile_expr(lhs, fc);
                self.compile_expr(index, fc);
                fc.emit(Opcode::MoveToTos2, 0, line);
                fc.emit(Opcode::PopStoreElement, 0, line);
            }
            Node::Binary(BinOp::Member, lhs, member, _) => {
                let hash = self.member_hash(member);
                self.compile_expr(lhs, fc);
                fc.emit(Opcode::Rotate2, 0, line);
                fc.emit(Opcode::PopStoreMember, hash as i32, line);
            }
            _ => unreachable!("resolver rejects non-assignable destructure targets"),
        }
    }

    fn compile_pipe(&mut self, value: &Node, call: &Node, line: i32, fc: &mut FnCg) {
        match call {
            Node::Call { callee, args, .. } => {
                self.compile_expr(callee, fc);
                self.compile_expr(value, fc);
                for a in args {
                    self.compile_expr(a, fc);
                }
                fc.emit(Opcode::FunctionCall, (args.len() + 1) as i32, line);
            }
            _ => {
                self.compile_expr(call, fc);
                self.compile_expr(value, fc);
                fc.emit(Opcode::FunctionCall, 1, line);
            }
        }
    }

    // ---- control flow ----

    fn compile_if(&mut self, cond: &Node, then_b: &Block, else_b: Option<&Block>, line: i32, fc: &mut FnCg, keep: bool) {
        self.compile_expr(cond, fc);
        let jf = fc.emit(Opcode::PopJumpIfFalse, -1, line);
        if keep {
            self.compile_block_as_expr(then_b, fc);
        } else {
            self.compile_block_as_statement(then_b, fc);
        }
        let jend = fc.emit(Opcode::Jump, -1, line);
        let else_start = fc.here();
        fc.patch_jump(jf, else_start);
        match else_b {
            Some(eb) if keep => self.compile_block_as_expr(eb, fc),
            Some(eb) => self.compile_block_as_statement(eb, fc),
            None if keep => {
                fc.emit(Opcode::LoadConstant, 0, line);
            }
            None => {}
        }
        let end = fc.here();
        fc.patch_jump(jend, end);
    }

    /// A value-producing `while` carries a running accumulator one slot
    /// below the condition check, seeded with nil and replaced by each
    /// iteration's body value (§4.3): `Rotate2; Pop` discards the stale
    /// accumulator and leaves the fresh one in its place. A statement
    /// `while` carries no accumulator at all.
    fn compile_while(&mut self, cond: &Node, body: &Block, line: i32, fc: &mut FnCg, keep: bool) {
        if keep {
            fc.emit(Opcode::LoadConstant, 0, line);
        }
        fc.loops.push(LoopCg {
            break_patches: Vec::new(),
            continue_target: 0,
            own_garbage: if keep { 1 } else { 0 },
            keep,
        });
        let check = fc.here();
        fc.loops.last_mut().unwrap().continue_target = check;
        self.compile_expr(cond, fc);
        let jf = fc.emit(Opcode::PopJumpIfFalse, -1, line);
        if keep {
            self.compile_block_as_expr(body, fc);
            fc.emit(Opcode::Rotate2, 0, line);
            fc.emit(Opcode::Pop, 0, line);
        } else {
            self.compile_block_as_statement(body, fc);
        }
        fc.emit(Opcode::Jump, check as i32, line);
        let end = fc.here();
        fc.patch_jump(jf, end);
        let loop_cg = fc.loops.pop().unwrap();
        for p in loop_cg.break_patches {
            fc.patch_jump(p, end);
        }
    }

    /// Same accumulator scheme as `while`, with the iterator kept one slot
    /// above it so `Duplicate`/`IteratorHasNext`/`IteratorGetNext` always
    /// operate on TOS; `MoveToTos2` slides each iteration's fresh value
    /// underneath the iterator before jumping back (§4.3).
    fn compile_for(&mut self, binding: &VariableNode, iterable: &Node, body: &Block, line: i32, fc: &mut FnCg, keep: bool) {
        if keep {
            fc.emit(Opcode::LoadConstant, 0, line);
        }
        self.compile_expr(iterable, fc);
        fc.emit(Opcode::MakeIterator, 0, line);
        fc.loops.push(LoopCg {
            break_patches: Vec::new(),
            continue_target: 0,
            own_garbage: if keep { 2 } else { 1 },
            keep,
        });

        let check = fc.here();
        fc.loops.last_mut().unwrap().continue_target = check;
        fc.emit(Opcode::Duplicate, 0, line);
        fc.emit(Opcode::IteratorHasNext, 0, line);
        let jf = fc.emit(Opcode::PopJumpIfFalse, -1, line);
        fc.emit(Opcode::Duplicate, 0, line);
        fc.emit(Opcode::IteratorGetNext, 0, line);

        let boxed = binding.semantic_type.get() == SemanticType::LocalBoxed;
        if boxed {
            fc.emit(Opcode::MakeBox, 0, line);
        }
        fc.emit(Opcode::PopStoreLocal, binding.index.get(), line);

        if keep {
            self.compile_block_as_expr(body, fc);
            fc.emit(Opcode::MoveToTos2, 0, line);
        } else {
            self.compile_block_as_statement(body, fc);
        }
        fc.emit(Opcode::Jump, check as i32, line);

        let natural_exit = fc.here();
        fc.patch_jump(jf, natural_exit);
        fc.emit(Opcode::PopN, 1, line);
        let end = fc.here();
        let loop_cg = fc.loops.pop().unwrap();
        for p in loop_cg.break_patches {
            fc.patch_jump(p, end);
        }
    }

    fn compile_break(&mut self, value: Option<&Node>, line: i32, fc: &mut FnCg) {
        let (garbage, keep) = {
            let l = fc.loops.last().expect("resolver guarantees break is inside a loop");
            (l.own_garbage, l.keep)
        };
        if garbage > 0 {
            fc.emit(Opcode::PopN, garbage, line);
        }
        match value {
            Some(v) => self.compile_expr(v, fc),
            None => {
                fc.emit(Opcode::LoadConstant, 0, line);
            }
        }
        if !keep {
            fc.emit(Opcode::Pop, 0, line);
        }
        let jmp = fc.emit(Opcode::Jump, -1, line);
        fc.loops.last_mut().unwrap().break_patches.push(jmp);
    }

    fn compile_continue(&mut self, value: Option<&Node>, line: i32, fc: &mut FnCg) {
        if let Some(v) = value {
            self.compile_expr(v, fc);
            fc.emit(Opcode::Pop, 0, line);
        }
        let target = fc.loops.last().expect("resolver guarantees continue is inside a loop").continue_target;
        fc.emit(Opcode::Jump, target as i32, line);
    }

    fn compile_return(&mut self, value: Option<&Node>, line: i32, fc: &mut FnCg) {
        let garbage = fc.total_loop_garbage();
        if garbage > 0 {
            fc.emit(Opcode::PopN, garbage, line);
        }
        match value {
            Some(v) => self.compile_expr(v, fc),
            None => {
                fc.emit(Opcode::LoadConstant, 0, line);
            }
        }
        fc.emit(Opcode::EndFunction, 0, line);
    }
}

fn unary_opcode(op: UnaryOp) -> Opcode {
    match op {
        UnaryOp::Plus => Opcode::UnaryPlus,
        UnaryOp::Minus => Opcode::UnaryMinus,
        UnaryOp::Not => Opcode::UnaryNot,
        UnaryOp::Concatenate => Opcode::UnaryConcatenate,
        UnaryOp::SizeOf => Opcode::UnarySizeOf,
    }
}

fn binary_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Subtract => Opcode::Subtract,
        BinOp::Multiply => Opcode::Multiply,
        BinOp::Divide => Opcode::Divide,
        BinOp::Power => Opcode::Power,
        BinOp::Modulo => Opcode::Modulo,
        BinOp::Concatenate => Opcode::Concatenate,
        BinOp::Xor => Opcode::Xor,
        BinOp::Equal => Opcode::Equal,
        BinOp::NotEqual => Opcode::NotEqual,
        BinOp::Less => Opcode::Less,
        BinOp::Greater => Opcode::Greater,
        BinOp::LessEqual => Opcode::LessEqual,
        BinOp::GreaterEqual => Opcode::GreaterEqual,
        BinOp::And | BinOp::Or | BinOp::Index | BinOp::Member | BinOp::ArrayPushBack => {
            unreachable!("handled by dedicated match arms in compile_expr")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> Vec<Constant> {
        let program = crate::parser::Parser::parse_program(src).unwrap();
        crate::resolver::analyze(&program, &["print"]).unwrap();
        let mut symbols = SymbolTable::new();
        let mut cg = Codegen::new(&mut symbols);
        cg.compile_program(&program);
        cg.into_constants()
    }

    fn entry_instructions(constants: &[Constant]) -> &[Instruction] {
        match &constants[crate::ENTRY_CONSTANT_INDEX as usize] {
            Constant::CodeObject(c) => &c.instructions,
            _ => panic!("entry slot is not a CodeObject"),
        }
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        // Trailing `nil;` keeps the arithmetic expression out of the
        // implicit-return position so it still compiles as a discarded
        // statement (with its own trailing `Pop`).
        let constants = compile("1 + 2 * 3; nil;");
        let code = entry_instructions(&constants);
        assert!(code.iter().any(|i| i.opcode == Opcode::Multiply));
        assert!(code.iter().any(|i| i.opcode == Opcode::Add));
        assert!(code.iter().any(|i| i.opcode == Opcode::Pop));
    }

    #[test]
    fn global_assignment_round_trips_through_shared_table() {
        let constants = compile("x = 1; x = x + 1; nil;");
        let code = entry_instructions(&constants);
        assert!(code.iter().any(|i| i.opcode == Opcode::StoreGlobal || i.opcode == Opcode::PopStoreGlobal));
        assert!(code.iter().any(|i| i.opcode == Opcode::LoadGlobal));
    }

    #[test]
    fn closures_capture_enclosing_locals_as_boxed() {
        let constants = compile(
            r#"
            make_counter = :() {
                count = 0;
                return :() {
                    count = count + 1;
                    return count;
                };
            };
            "#,
        );
        let mut saw_closure = false;
        let mut saw_box = false;
        for c in &constants {
            if let Constant::CodeObject(code) = c {
                if code.instructions.iter().any(|i| i.opcode == Opcode::MakeClosure) {
                    saw_closure = true;
                }
                if code.instructions.iter().any(|i| i.opcode == Opcode::LoadFromClosure || i.opcode == Opcode::StoreToClosure) {
                    saw_box = true;
                }
            }
        }
        assert!(saw_closure, "expected a MakeClosure instruction somewhere in the compiled program");
        assert!(saw_box, "expected the inner function to address its free variable through the closure table");
    }

    #[test]
    fn for_loop_over_array_uses_iterator_protocol() {
        // A trailing `nil;` keeps the `for` out of the implicit-return
        // (last-expression) position, so it compiles in plain statement
        // mode (keepValue = false), matching ordinary `for`-as-statement use.
        let constants = compile("for (x in [1, 2, 3]) { print(x); } nil;");
        let code = entry_instructions(&constants);
        assert!(code.iter().any(|i| i.opcode == Opcode::MakeIterator));
        assert!(code.iter().any(|i| i.opcode == Opcode::IteratorHasNext));
        assert!(code.iter().any(|i| i.opcode == Opcode::IteratorGetNext));
    }

    #[test]
    fn break_inside_for_loop_pops_the_iterator_before_jumping() {
        let constants = compile("for (x in [1, 2, 3]) { if (x == 2) { break; } } nil;");
        let code = entry_instructions(&constants);
        assert!(code.iter().any(|i| i.opcode == Opcode::PopN && i.a == 1));
    }
}
