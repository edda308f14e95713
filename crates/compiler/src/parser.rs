//! Recursive-descent parser over the token stream from `lexer.rs`,
//! producing the `ast` this crate's analyzer and compiler operate on. Out
//! of scope per the spec beyond delivering a well-formed AST.

use std::rc::Rc;

use crate::ast::{BinOp, Block, FunctionNode, Node, UnaryOp, VariableKind, VariableNode};
use crate::lexer::{Lexer, Tok, Token};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

pub type ParseResult<T> = Result<T, String>;

impl Parser {
    pub fn parse_program(source: &str) -> ParseResult<FunctionNode> {
        let tokens = Lexer::new(source).tokenize()?;
        let mut p = Parser { tokens, pos: 0 };
        let mut statements = Vec::new();
        while !p.check(&Tok::Eof) {
            statements.push(p.statement()?);
        }
        Ok(FunctionNode {
            parameters: Vec::new(),
            body: Block {
                statements,
                explicit_function_block: true,
            },
            line: 1,
            local_variables_count: std::cell::Cell::new(0),
            closure_mapping: std::cell::RefCell::new(Vec::new()),
            parameters_to_box: std::cell::RefCell::new(Vec::new()),
            free_variables: std::cell::RefCell::new(Vec::new()),
        })
    }

    fn cur(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }
    fn line(&self) -> i32 {
        self.tokens[self.pos].line
    }
    fn check(&self, t: &Tok) -> bool {
        self.cur() == t
    }
    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }
    fn eat(&mut self, t: &Tok) -> ParseResult<Token> {
        if self.check(t) {
            Ok(self.advance())
        } else {
            Err(format!("expected {:?}, found {:?} at line {}", t, self.cur(), self.line()))
        }
    }

    fn block(&mut self) -> ParseResult<Block> {
        self.eat(&Tok::LBrace)?;
        let mut statements = Vec::new();
        while !self.check(&Tok::RBrace) {
            statements.push(self.statement()?);
        }
        self.eat(&Tok::RBrace)?;
        Ok(Block {
            statements,
            explicit_function_block: false,
        })
    }

    fn statement(&mut self) -> ParseResult<Node> {
        let node = self.expr()?;
        if self.check(&Tok::Semi) {
            self.advance();
        }
        Ok(node)
    }

    fn expr(&mut self) -> ParseResult<Node> {
        self.assignment()
    }

    fn assignment(&mut self) -> ParseResult<Node> {
        let target = self.pipe()?;
        if self.check(&Tok::Assign) {
            let line = self.line();
            self.advance();
            let value = self.assignment()?;
            return Ok(Node::Assign {
                target: Box::new(target),
                value: Box::new(value),
                line,
            });
        }
        Ok(target)
    }

    fn pipe(&mut self) -> ParseResult<Node> {
        let mut node = self.logical_or()?;
        while self.check(&Tok::Arrow) {
            let line = self.line();
            self.advance();
            let call = self.logical_or()?;
            node = Node::Pipe {
                value: Box::new(node),
                call: Box::new(call),
                line,
            };
        }
        Ok(node)
    }

    fn logical_or(&mut self) -> ParseResult<Node> {
        let mut node = self.logical_and()?;
        while self.check(&Tok::Or) {
            let line = self.line();
            self.advance();
            let rhs = self.logical_and()?;
            node = Node::Binary(BinOp::Or, Box::new(node), Box::new(rhs), line);
        }
        Ok(node)
    }

    fn logical_and(&mut self) -> ParseResult<Node> {
        let mut node = self.equality()?;
        while self.check(&Tok::And) {
            let line = self.line();
            self.advance();
            let rhs = self.equality()?;
            node = Node::Binary(BinOp::And, Box::new(node), Box::new(rhs), line);
        }
        Ok(node)
    }

    fn equality(&mut self) -> ParseResult<Node> {
        let mut node = self.comparison()?;
        loop {
            let op = match self.cur() {
                Tok::Eq => BinOp::Equal,
                Tok::NotEq => BinOp::NotEqual,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.comparison()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs), line);
        }
        Ok(node)
    }

    fn comparison(&mut self) -> ParseResult<Node> {
        let mut node = self.concat()?;
        loop {
            let op = match self.cur() {
                Tok::Lt => BinOp::Less,
                Tok::Gt => BinOp::Greater,
                Tok::LtEq => BinOp::LessEqual,
                Tok::GtEq => BinOp::GreaterEqual,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.concat()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs), line);
        }
        Ok(node)
    }

    fn concat(&mut self) -> ParseResult<Node> {
        let mut node = self.push_back()?;
        while self.check(&Tok::Tilde) {
            let line = self.line();
            self.advance();
            let rhs = self.push_back()?;
            node = Node::Binary(BinOp::Concatenate, Box::new(node), Box::new(rhs), line);
        }
        Ok(node)
    }

    fn push_back(&mut self) -> ParseResult<Node> {
        let mut node = self.additive()?;
        while self.check(&Tok::PushBack) {
            let line = self.line();
            self.advance();
            let rhs = self.additive()?;
            node = Node::Binary(BinOp::ArrayPushBack, Box::new(node), Box::new(rhs), line);
        }
        Ok(node)
    }

    fn additive(&mut self) -> ParseResult<Node> {
        let mut node = self.multiplicative()?;
        loop {
            let op = match self.cur() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Subtract,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.multiplicative()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs), line);
        }
        Ok(node)
    }

    fn multiplicative(&mut self) -> ParseResult<Node> {
        let mut node = self.power()?;
        loop {
            let op = match self.cur() {
                Tok::Star => BinOp::Multiply,
                Tok::Slash => BinOp::Divide,
                Tok::Percent => BinOp::Modulo,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.power()?;
            node = Node::Binary(op, Box::new(node), Box::new(rhs), line);
        }
        Ok(node)
    }

    fn power(&mut self) -> ParseResult<Node> {
        let node = self.unary()?;
        if self.check(&Tok::Caret) {
            let line = self.line();
            self.advance();
            let rhs = self.power()?; // right-associative
            return Ok(Node::Binary(BinOp::Power, Box::new(node), Box::new(rhs), line));
        }
        Ok(node)
    }

    fn unary(&mut self) -> ParseResult<Node> {
        let op = match self.cur() {
            Tok::Plus => Some(UnaryOp::Plus),
            Tok::Minus => Some(UnaryOp::Minus),
            Tok::Bang => Some(UnaryOp::Not),
            Tok::Tilde => Some(UnaryOp::Concatenate),
            _ => None,
        };
        if let Some(op) = op {
            let line = self.line();
            self.advance();
            let operand = self.unary()?;
            return Ok(Node::Unary(op, Box::new(operand), line));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseResult<Node> {
        let mut node = self.primary()?;
        loop {
            match self.cur() {
                Tok::LParen => {
                    let line = self.line();
                    self.advance();
                    let args = self.call_args()?;
                    node = Node::Call {
                        callee: Box::new(node),
                        args,
                        line,
                    };
                }
                Tok::LBracket => {
                    let line = self.line();
                    self.advance();
                    let index = self.expr()?;
                    self.eat(&Tok::RBracket)?;
                    node = Node::Binary(BinOp::Index, Box::new(node), Box::new(index), line);
                }
                Tok::Dot => {
                    let line = self.line();
                    self.advance();
                    let name = self.ident_name()?;
                    let member = Node::Variable(Rc::new(VariableNode::named(name, line)));
                    node = Node::Binary(BinOp::Member, Box::new(node), Box::new(member), line);
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn call_args(&mut self) -> ParseResult<Vec<Node>> {
        let mut args = Vec::new();
        if !self.check(&Tok::RParen) {
            loop {
                args.push(self.expr()?);
                if self.check(&Tok::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.eat(&Tok::RParen)?;
        Ok(args)
    }

    fn ident_name(&mut self) -> ParseResult<String> {
        match self.cur().clone() {
            Tok::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(format!("expected identifier, found {:?} at line {}", other, self.line())),
        }
    }

    fn primary(&mut self) -> ParseResult<Node> {
        let line = self.line();
        match self.cur().clone() {
            Tok::Int(n) => {
                self.advance();
                Ok(Node::Int(n, line))
            }
            Tok::Float(f) => {
                self.advance();
                Ok(Node::Float(f, line))
            }
            Tok::Str(s) => {
                self.advance();
                Ok(Node::Str(s, line))
            }
            Tok::True => {
                self.advance();
                Ok(Node::Bool(true, line))
            }
            Tok::False => {
                self.advance();
                Ok(Node::Bool(false, line))
            }
            Tok::Nil => {
                self.advance();
                Ok(Node::Nil(line))
            }
            Tok::This => {
                self.advance();
                Ok(Node::Variable(Rc::new(VariableNode::special(VariableKind::This, line))))
            }
            Tok::DollarDollar => {
                self.advance();
                Ok(Node::Variable(Rc::new(VariableNode::special(
                    VariableKind::DollarDollar,
                    line,
                ))))
            }
            Tok::Positional(k) => {
                self.advance();
                Ok(Node::Variable(Rc::new(VariableNode::special(
                    VariableKind::Positional(k),
                    line,
                ))))
            }
            Tok::Discard => {
                self.advance();
                Ok(Node::Variable(Rc::new(VariableNode::special(VariableKind::Discard, line))))
            }
            Tok::Ident(name) => {
                self.advance();
                Ok(Node::Variable(Rc::new(VariableNode::named(name, line))))
            }
            Tok::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.eat(&Tok::RParen)?;
                Ok(inner)
            }
            Tok::LBracket => self.array_literal(),
            Tok::ObjOpen => self.object_literal(),
            Tok::Colon => self.function_literal(),
            Tok::DoubleColon => self.zero_arg_closure(),
            Tok::If => self.if_expr(),
            Tok::While => self.while_expr(),
            Tok::For => self.for_expr(),
            Tok::Break => {
                self.advance();
                let value = self.optional_paren_expr()?;
                Ok(Node::Break(value.map(Box::new), line))
            }
            Tok::Continue => {
                self.advance();
                let value = self.optional_paren_expr()?;
                Ok(Node::Continue(value.map(Box::new), line))
            }
            Tok::Return => {
                self.advance();
                let value = self.optional_expr_before_terminator()?;
                Ok(Node::Return(value.map(Box::new), line))
            }
            Tok::Yield => {
                self.advance();
                let value = self.expr()?;
                Ok(Node::Yield(Box::new(value), line))
            }
            Tok::LBrace => Ok(Node::Block(self.block()?)),
            other => Err(format!("unexpected token {:?} at line {}", other, line)),
        }
    }

    fn optional_paren_expr(&mut self) -> ParseResult<Option<Node>> {
        if self.check(&Tok::LParen) {
            self.advance();
            let e = self.expr()?;
            self.eat(&Tok::RParen)?;
            Ok(Some(e))
        } else {
            Ok(None)
        }
    }

    fn optional_expr_before_terminator(&mut self) -> ParseResult<Option<Node>> {
        if matches!(self.cur(), Tok::Semi | Tok::RBrace | Tok::Eof) {
            Ok(None)
        } else {
            Ok(Some(self.expr()?))
        }
    }

    fn array_literal(&mut self) -> ParseResult<Node> {
        let line = self.line();
        self.advance(); // `[`
        let mut items = Vec::new();
        if !self.check(&Tok::RBracket) {
            loop {
                items.push(self.expr()?);
                if self.check(&Tok::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.eat(&Tok::RBracket)?;
        Ok(Node::Array(items, line))
    }

    fn object_literal(&mut self) -> ParseResult<Node> {
        let line = self.line();
        self.advance(); // `[=`
        let mut pairs = Vec::new();
        if !self.check(&Tok::RBracket) {
            loop {
                let key_line = self.line();
                let name = self.ident_name()?;
                self.eat(&Tok::Assign)?;
                let value = self.expr()?;
                pairs.push((Rc::new(VariableNode::named(name, key_line)), value));
                if self.check(&Tok::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.eat(&Tok::RBracket)?;
        Ok(Node::Object(pairs, line))
    }

    fn function_literal(&mut self) -> ParseResult<Node> {
        let line = self.line();
        self.advance(); // `:`
        self.eat(&Tok::LParen)?;
        let mut parameters = Vec::new();
        if !self.check(&Tok::RParen) {
            loop {
                parameters.push(self.ident_name()?);
                if self.check(&Tok::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.eat(&Tok::RParen)?;
        let body = if self.check(&Tok::LBrace) {
            self.block()?
        } else {
            let expr = self.expr()?;
            Block {
                statements: vec![expr],
                explicit_function_block: true,
            }
        };
        Ok(Node::Function(Rc::new(FunctionNode {
            parameters,
            body,
            line,
            local_variables_count: std::cell::Cell::new(0),
            closure_mapping: std::cell::RefCell::new(Vec::new()),
            parameters_to_box: std::cell::RefCell::new(Vec::new()),
            free_variables: std::cell::RefCell::new(Vec::new()),
        })))
    }

    fn zero_arg_closure(&mut self) -> ParseResult<Node> {
        let line = self.line();
        self.advance(); // `::`
        let expr = self.expr()?;
        Ok(Node::Function(Rc::new(FunctionNode {
            parameters: Vec::new(),
            body: Block {
                statements: vec![expr],
                explicit_function_block: true,
            },
            line,
            local_variables_count: std::cell::Cell::new(0),
            closure_mapping: std::cell::RefCell::new(Vec::new()),
            parameters_to_box: std::cell::RefCell::new(Vec::new()),
            free_variables: std::cell::RefCell::new(Vec::new()),
        })))
    }

    fn if_expr(&mut self) -> ParseResult<Node> {
        let line = self.line();
        self.advance(); // `if`
        self.eat(&Tok::LParen)?;
        let cond = self.expr()?;
        self.eat(&Tok::RParen)?;
        let then_branch = self.block()?;
        let else_branch = if self.check(&Tok::Else) {
            self.advance();
            Some(self.block()?)
        } else {
            None
        };
        Ok(Node::If {
            cond: Box::new(cond),
            then_branch,
            else_branch,
            line,
        })
    }

    fn while_expr(&mut self) -> ParseResult<Node> {
        let line = self.line();
        self.advance(); // `while`
        self.eat(&Tok::LParen)?;
        let cond = self.expr()?;
        self.eat(&Tok::RParen)?;
        let body = self.block()?;
        Ok(Node::While {
            cond: Box::new(cond),
            body,
            line,
        })
    }

    fn for_expr(&mut self) -> ParseResult<Node> {
        let line = self.line();
        self.advance(); // `for`
        self.eat(&Tok::LParen)?;
        let binding_line = self.line();
        let binding_name = self.ident_name()?;
        self.eat(&Tok::In)?;
        let iterable = self.expr()?;
        self.eat(&Tok::RParen)?;
        let body = self.block()?;
        Ok(Node::For {
            binding: Rc::new(VariableNode::named(binding_name, binding_line)),
            iterable: Box::new(iterable),
            body,
            line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fibonacci() {
        let src = "fib = :(n) { if (n < 2) { n } else { fib(n-1) + fib(n-2) } }; fib(10)";
        let program = Parser::parse_program(src).expect("parses");
        assert_eq!(program.body.statements.len(), 2);
    }

    #[test]
    fn parses_object_literal_and_member_call() {
        let src = r#"base = [= greet = :() "hi" ]; child = [= proto = base ]; child.greet()"#;
        let program = Parser::parse_program(src).expect("parses");
        assert_eq!(program.body.statements.len(), 3);
    }

    #[test]
    fn parses_for_and_push_back() {
        let src = "makers = []; for (i in range(3)) { makers << :: i }";
        Parser::parse_program(src).expect("parses");
    }
}
