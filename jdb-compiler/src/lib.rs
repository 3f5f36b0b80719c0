//! Front end of the interpreter: lexing, two-pass compilation to flat
//! bytecode, the numbered error registry, and the UDT/function tables the
//! runtime needs to execute a compiled program.

pub mod bytecode;
pub mod compiler;
pub mod errors;
pub mod function;
pub mod lexer;
pub mod token;
pub mod udt;

pub use bytecode::{Chunk, Cursor, OpCode};
pub use compiler::{compile_module, compile_program, CompiledModule, ModuleResolver, NoModules};
pub use errors::ScriptError;
pub use function::FunctionInfo;
pub use token::{Keyword, Op, Token};
pub use udt::{DeclaredType, TypeInfo, TypeRegistry};
