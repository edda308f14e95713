//! `element` — command-line interpreter and REPL (§6).
//!
//! A thin front end over `element-compiler`/`element-runtime`: parses the
//! flat (non-subcommand) option set the spec calls for, drives either a
//! single file or an interactive `rustyline` session, and (with `-d`)
//! dumps the intermediate AST/symbol-table/constant-pool artifacts the way
//! the original `apfeltee/element` CLI's `-d{a,s,c,r}` flags do.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use element_compiler::ast::{BinOp, Block, FunctionNode, Node, UnaryOp, VariableKind};
use element_compiler::{codegen, parser, resolver};
use element_core::bytecode::Constant;
use element_core::symbol::SymbolTable;
use element_runtime::{is_error, Vm};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const VERSION_BANNER: &str = "element interpreter version 0.0.5";

#[derive(Parser, Debug)]
#[command(
    name = "element",
    disable_help_flag = true,
    disable_version_flag = true,
    about = "element scripting language interpreter"
)]
struct Cli {
    /// Print usage and exit.
    #[arg(short = 'h', long = "help", action = clap::ArgAction::SetTrue)]
    help: bool,

    /// Print the interpreter's version banner and exit.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::SetTrue)]
    version: bool,

    /// Debug dump flags: any subset of `a` (AST), `s` (symbol table),
    /// `c` (constant pool), `r` (also run after printing) — e.g. `-dasr`.
    #[arg(short = 'd', value_name = "FLAGS")]
    debug: Option<String>,

    /// Source file to interpret. Enters the REPL if omitted.
    file: Option<PathBuf>,
}

#[derive(Default, Clone, Copy)]
struct DebugFlags {
    ast: bool,
    symbols: bool,
    constants: bool,
    also_run: bool,
}

impl DebugFlags {
    fn parse(raw: &str) -> Self {
        let mut flags = DebugFlags::default();
        for c in raw.chars() {
            match c {
                'a' => flags.ast = true,
                's' => flags.symbols = true,
                'c' => flags.constants = true,
                'r' => flags.also_run = true,
                other => eprintln!("warning: unknown debug flag '{other}', ignoring"),
            }
        }
        flags
    }

    fn any_dump_requested(&self) -> bool {
        self.ast || self.symbols || self.constants
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("element=info".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    // `-?` is a synonym for `--help` the spec calls for (§6) but isn't a
    // character clap's derive macro accepts as a short flag, so it's
    // special-cased here before normal argument parsing.
    if std::env::args().skip(1).any(|a| a == "-?") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let cli = Cli::parse();

    if cli.help {
        print_usage();
        return ExitCode::SUCCESS;
    }
    if cli.version {
        println!("{VERSION_BANNER}");
        return ExitCode::SUCCESS;
    }

    let debug_flags = cli.debug.as_deref().map(DebugFlags::parse).unwrap_or_default();

    match cli.file {
        Some(path) => run_file(&path, debug_flags),
        None => run_repl(),
    }
}

fn print_usage() {
    println!("Usage: element [OPTIONS] [FILE]");
    println!();
    println!("Options:");
    println!("  -h, -?, --help        Print this help and exit");
    println!("  -v, --version         Print version and exit");
    println!("  -d<FLAGS>             Debug dump: a=AST, s=symbols, c=constants, r=also run");
    println!();
    println!("With no FILE, enters the REPL.");
}

fn run_file(path: &PathBuf, debug_flags: DebugFlags) -> ExitCode {
    info!("running {}", path.display());
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot read {}: {e}", path.display());
            eprintln!("element: cannot read {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };
    let filename = path.display().to_string();

    if debug_flags.any_dump_requested() {
        dump_compile_artifacts(&source, &debug_flags);
        if !debug_flags.also_run {
            return ExitCode::SUCCESS;
        }
    }

    let entry_dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("."));
    let config = config::ProjectConfig::load_near(&entry_dir).unwrap_or_default();
    debug!("search paths: {:?}", config.search_paths);
    let mut vm = Vm::new(entry_dir);
    for extra in &config.search_paths {
        vm.add_search_path(extra.clone());
    }

    let result = vm.eval_source(&source, &filename);
    if is_error(&result) {
        let message = vm.value_to_display_string(result);
        warn!("{filename}: unhandled error: {message}");
        eprintln!("ERROR: {message}");
    }
    vm.run_gc(true);
    ExitCode::SUCCESS
}

fn run_repl() -> ExitCode {
    info!("entering REPL");
    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(rl) => rl,
        Err(_) => {
            error!("no readline support available");
            eprintln!("no readline support");
            return ExitCode::FAILURE;
        }
    };

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config = config::ProjectConfig::load_near(&cwd).unwrap_or_default();
    let mut vm = Vm::new(cwd);
    for extra in &config.search_paths {
        vm.add_search_path(extra.clone());
    }

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(trimmed);
                let result = vm.eval_source(trimmed, "");
                if is_error(&result) {
                    println!("ERROR: {}", vm.value_to_display_string(result));
                } else {
                    println!("= {}", vm.value_to_display_string(result));
                }
                vm.run_gc(false);
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                warn!("readline error: {e}");
                eprintln!("readline error: {e}");
                break;
            }
        }
    }
    ExitCode::SUCCESS
}

/// Parses and (if it type-checks) resolves+compiles `source` once, then
/// prints whichever of the AST/symbol-table/constant-pool artifacts the
/// caller's debug flags asked for. Kept independent of
/// `element_compiler::compile_source` (which discards the AST) because
/// `-da` needs the parsed tree itself, not just the blob it lowers to.
fn dump_compile_artifacts(source: &str, flags: &DebugFlags) {
    let program = match parser::Parser::parse_program(source) {
        Ok(p) => p,
        Err(e) => {
            debug!("parse error: {e}");
            eprintln!("parse error: {e}");
            return;
        }
    };

    if flags.ast {
        println!("=== AST ===");
        print_function_node(&program, 0, "<module>");
        println!();
    }

    if let Err(errors) = resolver::analyze(&program, element_runtime::natives::NATIVE_NAMES) {
        for e in &errors {
            eprintln!("line {}: {}", e.line, e.message);
        }
        return;
    }

    if flags.symbols || flags.constants {
        let mut symbols = SymbolTable::new();
        let mut cg = codegen::Codegen::new(&mut symbols);
        cg.compile_program(&program);
        let constants = cg.into_constants();

        if flags.symbols {
            println!("=== Symbol table ===");
            for (hash, name) in symbols.iter_from(0) {
                println!("  {hash:#010x}  {name}");
            }
            println!();
        }
        if flags.constants {
            println!("=== Constant pool ===");
            for (i, c) in constants.iter().enumerate() {
                println!("  [{i}] {}", describe_constant(c));
            }
            println!();
        }
    }
}

fn describe_constant(c: &Constant) -> String {
    match c {
        Constant::Nil => "Nil".to_string(),
        Constant::Bool(b) => format!("Bool {b}"),
        Constant::Int(i) => format!("Int {i}"),
        Constant::Float(f) => format!("Float {f}"),
        Constant::String(s) => format!("String {s:?}"),
        Constant::CodeObject(code) => format!(
            "CodeObject {:?} (locals={}, named_params={}, instructions={})",
            code.name,
            code.local_variables_count,
            code.named_parameters_count,
            code.instructions.len()
        ),
    }
}

fn print_function_node(f: &FunctionNode, indent: usize, label: &str) {
    let pad = "  ".repeat(indent);
    println!(
        "{pad}Function {label} (params={:?}, line={})",
        f.parameters, f.line
    );
    print_block(&f.body, indent + 1);
}

fn print_block(b: &Block, indent: usize) {
    let pad = "  ".repeat(indent);
    println!("{pad}Block (explicit_function_block={})", b.explicit_function_block);
    for stmt in &b.statements {
        print_node(stmt, indent + 1);
    }
}

fn print_node(n: &Node, indent: usize) {
    let pad = "  ".repeat(indent);
    match n {
        Node::Nil(_) => println!("{pad}Nil"),
        Node::Bool(b, _) => println!("{pad}Bool {b}"),
        Node::Int(i, _) => println!("{pad}Int {i}"),
        Node::Float(f, _) => println!("{pad}Float {f}"),
        Node::Str(s, _) => println!("{pad}Str {s:?}"),
        Node::Variable(v) => println!(
            "{pad}Variable {:?} name={:?} semantic={:?} index={}",
            variable_kind_label(v.kind),
            v.name,
            v.semantic_type.get(),
            v.index.get()
        ),
        Node::Array(items, _) => {
            println!("{pad}Array");
            for item in items {
                print_node(item, indent + 1);
            }
        }
        Node::Object(pairs, _) => {
            println!("{pad}Object");
            for (key, value) in pairs {
                println!("{}  key={:?}", "  ".repeat(indent), key.name);
                print_node(value, indent + 2);
            }
        }
        Node::Function(func) => print_function_node(func, indent, "<closure>"),
        Node::Unary(op, operand, _) => {
            println!("{pad}Unary {}", unary_op_label(*op));
            print_node(operand, indent + 1);
        }
        Node::Binary(op, lhs, rhs, _) => {
            println!("{pad}Binary {}", binary_op_label(*op));
            print_node(lhs, indent + 1);
            print_node(rhs, indent + 1);
        }
        Node::Assign { target, value, .. } => {
            println!("{pad}Assign");
            print_node(target, indent + 1);
            print_node(value, indent + 1);
        }
        Node::ArrayDestructure(items, _) => {
            println!("{pad}ArrayDestructure");
            for item in items {
                print_node(item, indent + 1);
            }
        }
        Node::Call { callee, args, .. } => {
            println!("{pad}Call");
            print_node(callee, indent + 1);
            for a in args {
                print_node(a, indent + 1);
            }
        }
        Node::Pipe { value, call, .. } => {
            println!("{pad}Pipe");
            print_node(value, indent + 1);
            print_node(call, indent + 1);
        }
        Node::If { cond, then_branch, else_branch, .. } => {
            println!("{pad}If");
            print_node(cond, indent + 1);
            print_block(then_branch, indent + 1);
            if let Some(else_b) = else_branch {
                print_block(else_b, indent + 1);
            }
        }
        Node::While { cond, body, .. } => {
            println!("{pad}While");
            print_node(cond, indent + 1);
            print_block(body, indent + 1);
        }
        Node::For { binding, iterable, body, .. } => {
            println!("{pad}For binding={:?}", binding.name);
            print_node(iterable, indent + 1);
            print_block(body, indent + 1);
        }
        Node::Block(b) => print_block(b, indent),
        Node::Break(v, _) => {
            println!("{pad}Break");
            if let Some(v) = v {
                print_node(v, indent + 1);
            }
        }
        Node::Continue(v, _) => {
            println!("{pad}Continue");
            if let Some(v) = v {
                print_node(v, indent + 1);
            }
        }
        Node::Return(v, _) => {
            println!("{pad}Return");
            if let Some(v) = v {
                print_node(v, indent + 1);
            }
        }
        Node::Yield(v, _) => {
            println!("{pad}Yield");
            print_node(v, indent + 1);
        }
    }
}

fn variable_kind_label(kind: VariableKind) -> &'static str {
    match kind {
        VariableKind::Named => "named",
        VariableKind::This => "this",
        VariableKind::DollarDollar => "$$",
        VariableKind::Positional(_) => "positional",
        VariableKind::Discard => "_",
    }
}

fn unary_op_label(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Plus => "+",
        UnaryOp::Minus => "-",
        UnaryOp::Not => "!",
        UnaryOp::Concatenate => "~",
        UnaryOp::SizeOf => "#",
    }
}

fn binary_op_label(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Subtract => "-",
        BinOp::Multiply => "*",
        BinOp::Divide => "/",
        BinOp::Power => "^",
        BinOp::Modulo => "%",
        BinOp::Concatenate => "~",
        BinOp::Xor => "xor",
        BinOp::Equal => "==",
        BinOp::NotEqual => "!=",
        BinOp::Less => "<",
        BinOp::Greater => ">",
        BinOp::LessEqual => "<=",
        BinOp::GreaterEqual => ">=",
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::Index => "[]",
        BinOp::Member => ".",
        BinOp::ArrayPushBack => "<<",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flags_parse_any_subset() {
        let f = DebugFlags::parse("asr");
        assert!(f.ast && f.symbols && f.also_run && !f.constants);
    }

    #[test]
    fn debug_flags_default_to_nothing() {
        let f = DebugFlags::default();
        assert!(!f.any_dump_requested());
    }
}
