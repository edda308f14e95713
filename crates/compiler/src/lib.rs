//! Lexer, parser, semantic analyzer and bytecode compiler for the element
//! language. The lexer and parser produce an untyped `ast::Node` tree; the
//! resolver annotates it in place (`VariableNode::semantic_type`/`index`,
//! `FunctionNode::closure_mapping`/`free_variables`); the codegen walks the
//! annotated tree and emits one `element_core::bytecode::CodeObject` per
//! function, collected into a `element_core::blob::CompiledBlob`.

pub mod ast;
pub mod codegen;
pub mod lexer;
pub mod parser;
pub mod resolver;

use element_core::blob::CompiledBlob;
use element_core::symbol::SymbolTable;

#[derive(Debug)]
pub enum CompileError {
    Parse(String),
    Semantic(Vec<resolver::SemanticError>),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Parse(msg) => write!(f, "parse error: {msg}"),
            CompileError::Semantic(errs) => {
                for (i, e) in errs.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "line {}: {}", e.line, e.message)?;
                }
                Ok(())
            }
        }
    }
}
impl std::error::Error for CompileError {}

/// Parse, resolve and compile a complete source string. Native function
/// names are looked up in `natives` so the resolver can classify bare
/// identifiers as `SemanticType::Native` (§4.2); the indices in `natives`
/// must match the order the runtime registers them in, and the returned
/// blob's constant at index 3 is always the module's entry-point function.
pub fn compile_source(source: &str, natives: &[&str]) -> Result<CompiledBlob, CompileError> {
    let program = parser::Parser::parse_program(source).map_err(CompileError::Parse)?;
    resolver::analyze(&program, natives).map_err(CompileError::Semantic)?;

    let mut symbols = SymbolTable::new();
    let mut cg = codegen::Codegen::new(&mut symbols);
    cg.compile_program(&program);
    let constants = cg.into_constants();

    Ok(CompiledBlob {
        symbols: symbols.iter_from(0).map(|(h, n)| (h, n.to_string())).collect(),
        symbol_offset: 0,
        constants,
        constant_offset: 0,
    })
}

/// Constant-pool index of a freshly compiled module's entry-point function
/// (reserved up front so it never collides with a nested function literal's
/// own slot, regardless of compile order).
pub const ENTRY_CONSTANT_INDEX: u32 = 3;
