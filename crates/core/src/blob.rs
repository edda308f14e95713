//! The hand-packed bytecode blob format (§6): a single contiguous buffer,
//! little-endian, host-width unsigneds — deliberately not run through
//! `serde`/`bincode` since the layout is part of the language's on-disk
//! contract, not an internal Rust type.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::bytecode::{CodeObject, Constant, Instruction, Opcode, SourceLine};
use crate::symbol::SymbolTable;

fn opcode_to_u8(op: Opcode) -> u8 {
    op as u8
}

const OPCODE_TABLE: &[Opcode] = &[
    Opcode::Pop,
    Opcode::PopN,
    Opcode::Rotate2,
    Opcode::MoveToTos2,
    Opcode::Duplicate,
    Opcode::Unpack,
    Opcode::LoadConstant,
    Opcode::LoadLocal,
    Opcode::LoadGlobal,
    Opcode::LoadNative,
    Opcode::LoadArgument,
    Opcode::LoadArgsArray,
    Opcode::LoadThis,
    Opcode::StoreLocal,
    Opcode::StoreGlobal,
    Opcode::PopStoreLocal,
    Opcode::PopStoreGlobal,
    Opcode::MakeArray,
    Opcode::LoadElement,
    Opcode::StoreElement,
    Opcode::PopStoreElement,
    Opcode::ArrayPushBack,
    Opcode::ArrayPopBack,
    Opcode::MakeObject,
    Opcode::MakeEmptyObject,
    Opcode::LoadHash,
    Opcode::LoadMember,
    Opcode::StoreMember,
    Opcode::PopStoreMember,
    Opcode::MakeIterator,
    Opcode::IteratorHasNext,
    Opcode::IteratorGetNext,
    Opcode::MakeBox,
    Opcode::LoadFromBox,
    Opcode::StoreToBox,
    Opcode::PopStoreToBox,
    Opcode::MakeClosure,
    Opcode::LoadFromClosure,
    Opcode::StoreToClosure,
    Opcode::PopStoreToClosure,
    Opcode::Jump,
    Opcode::JumpIfFalse,
    Opcode::PopJumpIfFalse,
    Opcode::JumpIfFalseOrPop,
    Opcode::JumpIfTrueOrPop,
    Opcode::FunctionCall,
    Opcode::Yield,
    Opcode::EndFunction,
    Opcode::Add,
    Opcode::Subtract,
    Opcode::Multiply,
    Opcode::Divide,
    Opcode::Power,
    Opcode::Modulo,
    Opcode::Concatenate,
    Opcode::Xor,
    Opcode::Equal,
    Opcode::NotEqual,
    Opcode::Less,
    Opcode::Greater,
    Opcode::LessEqual,
    Opcode::GreaterEqual,
    Opcode::UnaryPlus,
    Opcode::UnaryMinus,
    Opcode::UnaryNot,
    Opcode::UnaryConcatenate,
    Opcode::UnarySizeOf,
];

fn opcode_from_u8(byte: u8) -> Result<Opcode, BlobError> {
    OPCODE_TABLE
        .get(byte as usize)
        .copied()
        .ok_or(BlobError::Truncated)
}

#[derive(Debug)]
pub enum BlobError {
    Truncated,
    BadUtf8,
    BadConstantKind(u8),
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobError::Truncated => write!(f, "bytecode blob truncated"),
            BlobError::BadUtf8 => write!(f, "bytecode blob contains invalid utf-8"),
            BlobError::BadConstantKind(k) => write!(f, "bytecode blob has unknown constant kind {k}"),
        }
    }
}

impl std::error::Error for BlobError {}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { buf: Vec::new() }
    }
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }
    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }
    fn u8(&mut self) -> Result<u8, BlobError> {
        let v = *self.buf.get(self.pos).ok_or(BlobError::Truncated)?;
        self.pos += 1;
        Ok(v)
    }
    fn u32(&mut self) -> Result<u32, BlobError> {
        let end = self.pos + 4;
        let slice = self.buf.get(self.pos..end).ok_or(BlobError::Truncated)?;
        self.pos = end;
        Ok(u32::from_le_bytes(slice.try_into().unwrap()))
    }
    fn i32(&mut self) -> Result<i32, BlobError> {
        self.u32().map(|v| v as i32)
    }
    fn f32(&mut self) -> Result<f32, BlobError> {
        self.u32().map(f32::from_bits)
    }
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], BlobError> {
        let end = self.pos + n;
        let slice = self.buf.get(self.pos..end).ok_or(BlobError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }
    fn string(&mut self) -> Result<String, BlobError> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BlobError::BadUtf8)
    }
}

/// Everything emitted for one compiled module: the new symbols it
/// introduced (beyond whatever the target symbol table already had) and
/// its constant pool.
pub struct CompiledBlob {
    pub symbols: Vec<(u32, String)>,
    pub symbol_offset: u32,
    pub constants: Vec<Constant>,
    pub constant_offset: u32,
}

pub fn encode_blob(blob: &CompiledBlob) -> Vec<u8> {
    let mut symbols_writer = Writer::new();
    for (hash, name) in &blob.symbols {
        symbols_writer.u32(*hash);
        symbols_writer.string(name);
    }

    let mut constants_writer = Writer::new();
    for constant in &blob.constants {
        encode_constant(&mut constants_writer, constant);
    }

    let mut w = Writer::new();
    w.u32(symbols_writer.buf.len() as u32);
    w.u32(blob.symbols.len() as u32);
    w.u32(blob.symbol_offset);
    w.bytes(&symbols_writer.buf);
    w.u32(constants_writer.buf.len() as u32);
    w.u32(blob.constants.len() as u32);
    w.u32(blob.constant_offset);
    w.bytes(&constants_writer.buf);
    w.buf
}

fn encode_constant(w: &mut Writer, constant: &Constant) {
    match constant {
        Constant::Nil => w.u8(0),
        Constant::Bool(b) => {
            w.u8(1);
            w.u8(*b as u8);
        }
        Constant::Int(i) => {
            w.u8(2);
            w.i32(*i);
        }
        Constant::Float(f) => {
            w.u8(3);
            w.f32(*f);
        }
        Constant::String(s) => {
            w.u8(4);
            w.string(s);
        }
        Constant::CodeObject(code) => {
            w.u8(5);
            w.i32(code.local_variables_count);
            w.i32(code.named_parameters_count);
            w.u32(code.closure_mapping.len() as u32);
            for m in &code.closure_mapping {
                w.i32(*m);
            }
            w.u32(code.instructions.len() as u32);
            for inst in &code.instructions {
                w.u8(opcode_to_u8(inst.opcode));
                w.i32(inst.a);
            }
            w.u32(code.lines.len() as u32);
            for line in &code.lines {
                w.i32(line.line);
                w.i32(line.instruction_index);
            }
        }
    }
}

/// A module's constant pool and the new symbols it introduced, decoded
/// from a blob and ready to be appended to a VM's in-memory pools at
/// `*_offset` (R1).
pub struct DecodedBlob {
    pub symbols: Vec<(u32, String)>,
    pub symbol_offset: u32,
    pub constants: Vec<Constant>,
    pub constant_offset: u32,
}

pub fn decode_blob(bytes: &[u8]) -> Result<DecodedBlob, BlobError> {
    let mut r = Reader::new(bytes);
    let symbols_bytes = r.u32()? as usize;
    let symbol_count = r.u32()?;
    let symbol_offset = r.u32()?;
    let symbols_slice = r.bytes(symbols_bytes)?;
    let mut sr = Reader::new(symbols_slice);
    let mut symbols = Vec::with_capacity(symbol_count as usize);
    for _ in 0..symbol_count {
        let hash = sr.u32()?;
        let name = sr.string()?;
        symbols.push((hash, name));
    }

    let constants_bytes = r.u32()? as usize;
    let constant_count = r.u32()?;
    let constant_offset = r.u32()?;
    let constants_slice = r.bytes(constants_bytes)?;
    let mut cr = Reader::new(constants_slice);
    let mut constants = Vec::with_capacity(constant_count as usize);
    for _ in 0..constant_count {
        constants.push(decode_constant(&mut cr)?);
    }

    Ok(DecodedBlob {
        symbols,
        symbol_offset,
        constants,
        constant_offset,
    })
}

fn decode_constant(r: &mut Reader) -> Result<Constant, BlobError> {
    let kind = r.u8()?;
    match kind {
        0 => Ok(Constant::Nil),
        1 => Ok(Constant::Bool(r.u8()? != 0)),
        2 => Ok(Constant::Int(r.i32()?)),
        3 => Ok(Constant::Float(r.f32()?)),
        4 => Ok(Constant::String(r.string()?)),
        5 => {
            let local_variables_count = r.i32()?;
            let named_parameters_count = r.i32()?;
            let mapping_len = r.u32()? as usize;
            let mut closure_mapping = Vec::with_capacity(mapping_len);
            for _ in 0..mapping_len {
                closure_mapping.push(r.i32()?);
            }
            let instruction_count = r.u32()? as usize;
            let mut instructions = Vec::with_capacity(instruction_count);
            for _ in 0..instruction_count {
                let opcode = opcode_from_u8(r.u8()?)?;
                let a = r.i32()?;
                instructions.push(Instruction::new(opcode, a));
            }
            let line_count = r.u32()? as usize;
            let mut lines = Vec::with_capacity(line_count);
            for _ in 0..line_count {
                let line = r.i32()?;
                let instruction_index = r.i32()?;
                lines.push(SourceLine { line, instruction_index });
            }
            Ok(Constant::CodeObject(Rc::new(CodeObject {
                name: String::new(),
                instructions,
                lines,
                local_variables_count,
                named_parameters_count,
                closure_mapping,
                module: RefCell::new(Weak::new()),
            })))
        }
        other => Err(BlobError::BadConstantKind(other)),
    }
}

/// Merges a decoded blob's symbols into `table` by direct insertion
/// (never re-probing): this is what makes R1 hold — the VM's table after
/// loading agrees entry-for-entry with the compiler's.
pub fn merge_symbols(table: &mut SymbolTable, decoded: &DecodedBlob) {
    for (hash, name) in &decoded.symbols {
        table.insert_resolved(*hash, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Instruction, Opcode, SourceLine};

    #[test]
    fn round_trips_scalar_constants() {
        let blob = CompiledBlob {
            symbols: vec![(42, "foo".to_string())],
            symbol_offset: 0,
            constants: vec![
                Constant::Nil,
                Constant::Bool(true),
                Constant::Bool(false),
                Constant::Int(-7),
                Constant::Float(3.5),
                Constant::String("hi".to_string()),
            ],
            constant_offset: 0,
        };
        let bytes = encode_blob(&blob);
        let decoded = decode_blob(&bytes).unwrap();
        assert_eq!(decoded.symbols, vec![(42, "foo".to_string())]);
        assert_eq!(decoded.constants.len(), 6);
        match &decoded.constants[3] {
            Constant::Int(-7) => {}
            other => panic!("expected Int(-7), got constant at index 3: {:?}", other.kind_name()),
        }
    }

    #[test]
    fn round_trips_code_object() {
        let code = CodeObject::new(
            "fib".to_string(),
            vec![Instruction::new(Opcode::LoadLocal, 0), Instruction::new(Opcode::EndFunction, 0)],
            vec![SourceLine { line: 1, instruction_index: 0 }],
            2,
            1,
            vec![0, -1],
        );
        let blob = CompiledBlob {
            symbols: vec![],
            symbol_offset: 0,
            constants: vec![Constant::CodeObject(Rc::new(code))],
            constant_offset: 3,
        };
        let bytes = encode_blob(&blob);
        let decoded = decode_blob(&bytes).unwrap();
        match &decoded.constants[0] {
            Constant::CodeObject(c) => {
                assert_eq!(c.local_variables_count, 2);
                assert_eq!(c.named_parameters_count, 1);
                assert_eq!(c.closure_mapping, vec![0, -1]);
                assert_eq!(c.instructions.len(), 2);
                assert_eq!(c.instructions[0].opcode, Opcode::LoadLocal);
                assert_eq!(c.instructions[1].opcode, Opcode::EndFunction);
            }
            _ => panic!("expected CodeObject"),
        }
    }
}

impl Constant {
    fn kind_name(&self) -> &'static str {
        match self {
            Constant::Nil => "nil",
            Constant::Bool(_) => "bool",
            Constant::Int(_) => "int",
            Constant::Float(_) => "float",
            Constant::String(_) => "string",
            Constant::CodeObject(_) => "code-object",
        }
    }
}
