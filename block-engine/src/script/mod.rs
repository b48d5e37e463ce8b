// Block Script Module
// The interpreted language behind script-family functions

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use evaluator::{EvalError, Evaluator};
pub use functions::BuiltinFunctions;
pub use lexer::{LexError, Lexer, Token};
pub use parser::{BinaryOp, Expr, ParseError, Program, ScriptParser, Statement, UnaryOp};
