//! Semantic Analyzer (§4.2): scope/closure resolution over the AST the
//! parser produced. Walks the tree once, resolving every `VariableNode` to
//! a `SemanticType`/index pair and recording each `FunctionNode`'s
//! `closure_mapping`/`free_variables`/`parameters_to_box`, and validates
//! `break`/`continue`/`return`/`yield` placement and assignment targets
//! along the way.
//!
//! Scoping differs from most stack languages in one respect: names that
//! resolve at module (global) scope live in a flat, shared table rather
//! than a stack slot, so any nested function can read or write them
//! directly (`LoadGlobal`/`StoreGlobal`) without going through the
//! closure-capture machinery below.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{BinOp, Block, FunctionNode, Node, SemanticType, VariableKind, VariableNode};

#[derive(Debug, Clone)]
pub struct SemanticError {
    pub line: i32,
    pub message: String,
}

fn err(line: i32, message: impl Into<String>) -> SemanticError {
    SemanticError { line, message: message.into() }
}

/// One local binding (a parameter or a block-declared variable). Shared
/// (`Rc`) because every `VariableNode` reference that resolves to it needs
/// to know, retroactively, if it later gets boxed (§4.2 "makeBoxed").
struct Local {
    index: i32,
    boxed: Cell<bool>,
    refs: RefCell<Vec<Rc<VariableNode>>>,
}

impl Local {
    fn new(index: i32) -> Rc<Local> {
        Rc::new(Local {
            index,
            boxed: Cell::new(false),
            refs: RefCell::new(Vec::new()),
        })
    }

    fn record(&self, var: &Rc<VariableNode>, boxed_type: SemanticType, plain_type: SemanticType) {
        var.index.set(self.index);
        var.semantic_type.set(if self.boxed.get() { boxed_type } else { plain_type });
        self.refs.borrow_mut().push(var.clone());
    }

    /// First capture of this local promotes every reference seen so far
    /// (and every one seen from now on) from `Local` to `LocalBoxed`.
    fn promote_to_boxed(&self) {
        if self.boxed.replace(true) {
            return;
        }
        for v in self.refs.borrow().iter() {
            if v.semantic_type.get() == SemanticType::Local {
                v.semantic_type.set(SemanticType::LocalBoxed);
            }
        }
    }
}

struct BlockScope {
    locals: HashMap<String, Rc<Local>>,
}

impl BlockScope {
    fn new() -> Self {
        BlockScope { locals: HashMap::new() }
    }
}

/// A free variable this function captures from an enclosing scope. `index`
/// is this function's own slot for it (used by `LoadFromClosure` et al);
/// `closure_mapping[index]` (on the `FunctionNode`) records where it comes
/// from in the immediately enclosing frame.
struct FreeVar {
    index: i32,
    local: Rc<Local>,
}

struct FuncCtx<'a> {
    node: &'a FunctionNode,
    is_global: bool,
    params: HashMap<String, Rc<Local>>,
    blocks: Vec<BlockScope>,
    free_vars: HashMap<String, FreeVar>,
    next_local: i32,
    loop_depth: u32,
    literal_depth: u32,
}

impl<'a> FuncCtx<'a> {
    fn new(node: &'a FunctionNode, is_global: bool) -> Self {
        let mut params = HashMap::new();
        for (i, name) in node.parameters.iter().enumerate() {
            params.insert(name.clone(), Local::new(i as i32));
        }
        let next_local = node.parameters.len() as i32;
        FuncCtx {
            node,
            is_global,
            params,
            blocks: vec![BlockScope::new()],
            free_vars: HashMap::new(),
            next_local,
            loop_depth: 0,
            literal_depth: 0,
        }
    }

    fn declare_local(&mut self, name: &str) -> Rc<Local> {
        let local = Local::new(self.next_local);
        self.next_local += 1;
        self.blocks.last_mut().unwrap().locals.insert(name.to_string(), local.clone());
        local
    }

    fn find_own_binding(&self, name: &str) -> Option<Rc<Local>> {
        for block in self.blocks.iter().rev() {
            if let Some(l) = block.locals.get(name) {
                return Some(l.clone());
            }
        }
        self.params.get(name).cloned()
    }

    fn finish(self) {
        self.node.local_variables_count.set(self.next_local);
        let mut names: Vec<(i32, String)> = self.free_vars.into_iter().map(|(n, fv)| (fv.index, n)).collect();
        names.sort_by_key(|(i, _)| *i);
        *self.node.free_variables.borrow_mut() = names.into_iter().map(|(_, n)| n).collect();
    }
}

pub struct Resolver<'a> {
    stack: Vec<FuncCtx<'a>>,
    globals: HashMap<String, i32>,
    natives: HashMap<&'a str, i32>,
    errors: Vec<SemanticError>,
}

pub fn analyze(program: &FunctionNode, natives: &[&str]) -> Result<(), Vec<SemanticError>> {
    let mut natives_map = HashMap::new();
    for (i, name) in natives.iter().enumerate() {
        natives_map.insert(*name, i as i32);
    }
    let mut r = Resolver {
        stack: Vec::new(),
        globals: HashMap::new(),
        natives: natives_map,
        errors: Vec::new(),
    };
    r.stack.push(FuncCtx::new(program, true));
    r.resolve_statements(&program.body.statements);
    let ctx = r.stack.pop().unwrap();
    ctx.finish();
    if r.errors.is_empty() {
        Ok(())
    } else {
        Err(r.errors)
    }
}

enum Origin {
    Local(usize, Rc<Local>),
    FreeVar(usize, i32, Rc<Local>),
}

impl<'a> Resolver<'a> {
    fn cur(&mut self) -> &mut FuncCtx<'a> {
        self.stack.last_mut().unwrap()
    }

    fn push_block(&mut self) {
        self.cur().blocks.push(BlockScope::new());
    }
    fn pop_block(&mut self) {
        self.cur().blocks.pop();
    }

    fn resolve_statements(&mut self, statements: &'a [Node]) {
        for stmt in statements {
            self.resolve_node(stmt);
        }
    }

    fn resolve_block(&mut self, block: &'a Block) {
        if block.explicit_function_block {
            self.resolve_statements(&block.statements);
        } else {
            self.push_block();
            self.resolve_statements(&block.statements);
            self.pop_block();
        }
    }

    fn resolve_node(&mut self, node: &'a Node) {
        match node {
            Node::Nil(_) | Node::Bool(..) | Node::Int(..) | Node::Float(..) | Node::Str(..) => {}
            Node::Variable(v) => self.resolve_variable(v),
            Node::Array(elems, _) => {
                self.cur().literal_depth += 1;
                for e in elems {
                    self.resolve_node(e);
                }
                self.cur().literal_depth -= 1;
            }
            Node::Object(members, _) => {
                self.cur().literal_depth += 1;
                for (_key, value) in members {
                    self.resolve_node(value);
                }
                self.cur().literal_depth -= 1;
            }
            Node::Function(f) => self.resolve_function(f),
            Node::Unary(_, operand, line) => {
                self.check_not_control_flow_operand(operand, *line);
                self.resolve_node(operand);
            }
            Node::Binary(BinOp::Member, lhs, _member_name, line) => {
                // the rhs is a pseudo-variable naming a hash; never resolved.
                self.check_not_primitive_or_control_flow_operand(lhs, *line);
                self.resolve_node(lhs);
            }
            Node::Binary(BinOp::Index, lhs, rhs, line) => {
                self.check_not_primitive_or_control_flow_operand(lhs, *line);
                self.resolve_node(lhs);
                self.resolve_node(rhs);
            }
            Node::Binary(BinOp::And, lhs, rhs, _) | Node::Binary(BinOp::Or, lhs, rhs, _) => {
                self.resolve_node(lhs);
                self.resolve_node(rhs);
            }
            Node::Binary(_, lhs, rhs, line) => {
                self.check_not_control_flow_operand(lhs, *line);
                self.check_not_control_flow_operand(rhs, *line);
                self.resolve_node(lhs);
                self.resolve_node(rhs);
            }
            Node::Assign { target, value, line } => {
                self.resolve_node(value);
                self.resolve_assign_target(target, *line);
            }
            Node::ArrayDestructure(targets, line) => {
                for t in targets {
                    self.resolve_assign_target(t, *line);
                }
            }
            Node::Call { callee, args, .. } => {
                self.resolve_node(callee);
                for a in args {
                    self.resolve_node(a);
                }
            }
            Node::Pipe { value, call, .. } => {
                self.resolve_node(value);
                self.resolve_node(call);
            }
            Node::If { cond, then_branch, else_branch, .. } => {
                self.resolve_node(cond);
                self.resolve_block(then_branch);
                if let Some(b) = else_branch {
                    self.resolve_block(b);
                }
            }
            Node::While { cond, body, .. } => {
                self.resolve_node(cond);
                self.cur().loop_depth += 1;
                self.resolve_block(body);
                self.cur().loop_depth -= 1;
            }
            Node::For { binding, iterable, body, .. } => {
                self.resolve_node(iterable);
                self.push_block();
                let local = self.cur().declare_local(&binding.name);
                local.record(binding, SemanticType::LocalBoxed, SemanticType::Local);
                self.cur().loop_depth += 1;
                self.resolve_statements(&body.statements);
                self.cur().loop_depth -= 1;
                self.pop_block();
            }
            Node::Block(b) => self.resolve_block(b),
            Node::Break(value, line) => {
                self.check_loop_context(*line, "break");
                if let Some(v) = value {
                    self.resolve_node(v);
                }
            }
            Node::Continue(value, line) => {
                self.check_loop_context(*line, "continue");
                if let Some(v) = value {
                    self.resolve_node(v);
                }
            }
            Node::Return(value, line) => {
                self.check_not_in_literal(*line, "return");
                if let Some(v) = value {
                    self.resolve_node(v);
                }
            }
            Node::Yield(value, line) => {
                self.check_not_in_literal(*line, "yield");
                self.resolve_node(value);
            }
        }
    }

    fn check_loop_context(&mut self, line: i32, what: &str) {
        let ctx = self.cur();
        if ctx.literal_depth > 0 {
            self.errors.push(err(line, format!("'{what}' is not valid inside an array or object literal")));
        } else if ctx.loop_depth == 0 {
            self.errors.push(err(line, format!("'{what}' used outside of a loop")));
        }
    }

    fn check_not_in_literal(&mut self, line: i32, what: &str) {
        if self.cur().literal_depth > 0 {
            self.errors.push(err(line, format!("'{what}' is not valid inside an array or object literal")));
        }
    }

    /// `break`/`continue`/`return` may only appear as the RHS of `and`/`or`
    /// (the short-circuit "or fail" idiom), never as an operand of
    /// arithmetic, comparison, or unary operators (§4.2 validation rules).
    fn check_not_control_flow_operand(&mut self, node: &Node, line: i32) {
        let what = match node {
            Node::Break(..) => "break",
            Node::Continue(..) => "continue",
            Node::Return(..) => "return",
            _ => return,
        };
        self.errors.push(err(line, format!("'{what}' cannot be used as an operand here")));
    }

    /// Indexing (`[]`) and member access (`.`) reject a primitive literal
    /// or a control-flow node as their left-hand operand (§4.2 validation
    /// rules).
    fn check_not_primitive_or_control_flow_operand(&mut self, node: &Node, line: i32) {
        let what = match node {
            Node::Nil(_) => "nil",
            Node::Bool(..) => "a boolean",
            Node::Int(..) => "an integer",
            Node::Float(..) => "a float",
            Node::Break(..) => "break",
            Node::Continue(..) => "continue",
            Node::Return(..) => "return",
            _ => return,
        };
        self.errors.push(err(line, format!("cannot index or access a member of {what}")));
    }

    fn resolve_assign_target(&mut self, target: &'a Node, line: i32) {
        match target {
            Node::Variable(v) => {
                match v.kind {
                    VariableKind::This | VariableKind::DollarDollar | VariableKind::Positional(_) => {
                        self.errors.push(err(line, "'this', '$$', and positional '$N' are not assignable"));
                    }
                    VariableKind::Named | VariableKind::Discard => {}
                }
                self.resolve_variable(v);
            }
            Node::Binary(BinOp::Index, lhs, index, _) => {
                self.resolve_node(lhs);
                self.resolve_node(index);
            }
            Node::Binary(BinOp::Member, lhs, _member_name, _) => {
                self.resolve_node(lhs);
            }
            Node::ArrayDestructure(targets, l) => {
                for t in targets {
                    self.resolve_assign_target(t, *l);
                }
            }
            other => {
                let _ = other;
                self.errors.push(err(line, "invalid assignment target"));
            }
        }
    }

    fn resolve_function(&mut self, f: &'a Rc<FunctionNode>) {
        self.stack.push(FuncCtx::new(f, false));
        self.resolve_block(&f.body);
        let ctx = self.stack.pop().unwrap();
        ctx.finish();
    }

    fn resolve_variable(&mut self, var: &'a Rc<VariableNode>) {
        match var.kind {
            VariableKind::This | VariableKind::DollarDollar | VariableKind::Positional(_) | VariableKind::Discard => {
                var.semantic_type.set(SemanticType::Unresolved);
                return;
            }
            VariableKind::Named => {}
        }

        let name = var.name.as_str();
        let cur = self.stack.len() - 1;

        if let Some(local) = self.stack[cur].find_own_binding(name) {
            local.record(var, SemanticType::LocalBoxed, SemanticType::Local);
            return;
        }
        if let Some(fv) = self.stack[cur].free_vars.get(name) {
            var.semantic_type.set(SemanticType::FreeVariable);
            var.index.set(fv.index);
            fv.local.refs.borrow_mut().push(var.clone());
            return;
        }

        // Rule 1 (§4.2) only treats the global function as a flat, block-free
        // scope when no nested block has been pushed yet; a plain block
        // inside the global function (if/while/for bodies) shadows a
        // first-occurrence assignment into a block-local rather than a
        // module global (§9 "Global-assign in nested blocks").
        let at_global_top_scope = self.stack[cur].is_global && self.stack[cur].blocks.len() == 1;

        if !at_global_top_scope {
            if let Some(idx) = self.capture_from_enclosing(cur, name) {
                var.semantic_type.set(SemanticType::FreeVariable);
                var.index.set(idx);
                return;
            }
        }

        if let Some(&idx) = self.globals.get(name) {
            var.semantic_type.set(SemanticType::Global);
            var.index.set(idx);
            return;
        }
        if let Some(&idx) = self.natives.get(name) {
            var.semantic_type.set(SemanticType::Native);
            var.index.set(idx);
            return;
        }

        if at_global_top_scope {
            let idx = self.globals.len() as i32;
            self.globals.insert(name.to_string(), idx);
            var.semantic_type.set(SemanticType::Global);
            var.index.set(idx);
            var.first_occurrence.set(true);
        } else {
            var.first_occurrence.set(true);
            let local = self.stack[cur].declare_local(name);
            local.record(var, SemanticType::LocalBoxed, SemanticType::Local);
        }
    }

    /// Walks outward from `requester` looking for `name` as an existing
    /// binding (own local/parameter) or an already-captured free variable
    /// in some enclosing function, then threads a free-variable chain back
    /// in through every intervening function (§4.2 closure capture).
    /// Returns the requester's own free-variable index for `name`, if found.
    fn capture_from_enclosing(&mut self, requester: usize, name: &str) -> Option<i32> {
        if requester == 0 {
            return None;
        }
        let mut lvl = requester - 1;
        let origin = loop {
            if lvl == 0 {
                return None;
            }
            if let Some(fv) = self.stack[lvl].free_vars.get(name) {
                break Origin::FreeVar(lvl, fv.index, fv.local.clone());
            }
            if let Some(local) = self.stack[lvl].find_own_binding(name) {
                local.promote_to_boxed();
                if (local.index as usize) < self.stack[lvl].node.parameters.len() {
                    let param_idx = local.index as usize;
                    let mut boxed = self.stack[lvl].node.parameters_to_box.borrow_mut();
                    if !boxed.contains(&param_idx) {
                        boxed.push(param_idx);
                    }
                }
                break Origin::Local(lvl, local);
            }
            lvl -= 1;
        };

        let (found_level, mut mapping_entry, local) = match origin {
            Origin::Local(lvl, local) => (lvl, local.index, local),
            Origin::FreeVar(lvl, idx, local) => (lvl, -(idx) - 1, local),
        };

        let mut last_idx = -1;
        for l in (found_level + 1)..=requester {
            let ctx = &mut self.stack[l];
            let idx = ctx.free_vars.len() as i32;
            ctx.free_vars.insert(name.to_string(), FreeVar { index: idx, local: local.clone() });
            ctx.node.closure_mapping.borrow_mut().push(mapping_entry);
            mapping_entry = -(idx) - 1;
            last_idx = idx;
        }
        Some(last_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn find_first_assign_target<'a>(node: &'a Node) -> Option<&'a VariableNode> {
        match node {
            Node::Assign { target, .. } => match target.as_ref() {
                Node::Variable(v) => Some(v),
                _ => None,
            },
            Node::Block(b) => b.statements.iter().find_map(find_first_assign_target),
            Node::If { then_branch, else_branch, .. } => then_branch
                .statements
                .iter()
                .find_map(find_first_assign_target)
                .or_else(|| {
                    else_branch
                        .as_ref()
                        .and_then(|b| b.statements.iter().find_map(find_first_assign_target))
                }),
            Node::While { body, .. } => body.statements.iter().find_map(find_first_assign_target),
            _ => None,
        }
    }

    #[test]
    fn global_assign_inside_nested_block_is_local_not_global() {
        // §9 "Global-assign in nested blocks": a first-occurrence assignment
        // inside a plain block (here, an `if` body) at module scope creates
        // a block-local, not a module global.
        let program = Parser::parse_program("if (true) { x = 1; }").unwrap();
        analyze(&program, &[]).unwrap();
        let stmt = &program.body.statements[0];
        let target = find_first_assign_target(stmt).expect("assign target");
        assert_eq!(target.semantic_type.get(), SemanticType::Local);
        assert!(target.first_occurrence.get());
    }

    #[test]
    fn global_assign_at_module_top_scope_resolves_global() {
        let program = Parser::parse_program("x = 1;").unwrap();
        analyze(&program, &[]).unwrap();
        let stmt = &program.body.statements[0];
        let target = find_first_assign_target(stmt).expect("assign target");
        assert_eq!(target.semantic_type.get(), SemanticType::Global);
        assert!(target.first_occurrence.get());
    }

    #[test]
    fn assigning_to_this_is_rejected() {
        let program = Parser::parse_program("this = 1;").unwrap();
        let errors = analyze(&program, &[]).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("not assignable")));
    }

    #[test]
    fn assigning_to_positional_parameter_is_rejected() {
        let program = Parser::parse_program("$0 = 1;").unwrap();
        let errors = analyze(&program, &[]).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("not assignable")));
    }

    #[test]
    fn return_as_arithmetic_operand_is_rejected() {
        let program = Parser::parse_program("f = :() { return 1 + return 2; };").unwrap();
        let errors = analyze(&program, &[]).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("cannot be used as an operand")));
    }

    #[test]
    fn return_as_short_circuit_rhs_is_accepted() {
        let program = Parser::parse_program("f = :(x) { x > 0 or return -1; return x; };").unwrap();
        assert!(analyze(&program, &[]).is_ok());
    }

    #[test]
    fn indexing_an_integer_literal_is_rejected() {
        let program = Parser::parse_program("x = 1[0];").unwrap();
        let errors = analyze(&program, &[]).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("cannot index")));
    }
}
