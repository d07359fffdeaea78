pub mod ast;
pub mod diagnostics;
pub mod errors;
pub mod lexer;
pub mod parser;

pub use ast::Program;
pub use errors::ExprError;
pub use parser::parse;

/// Returns true when `src` parses under the expression grammar.
pub fn is_valid(src: &str) -> bool {
    parse(src).is_ok()
}
