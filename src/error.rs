// Unified error taxonomy for the compiler and the VM.
//
// Every fallible operation returns Result<T>; the one place that recovers
// from NotFound (type_or_new_ident in the driver) inspects the carried
// identifier to tell a fresh declaration from a genuine resolution
// failure.

use thiserror::Error;


pub type Result<T> = core::result::Result<T, Error>;


#[derive(Clone, Debug, PartialEq, Error)]
pub enum Error {
    // Compile-time invariant violation, identified by a numeric code.
    #[error("Internal error #{0}")]
    Internal(i32),

    #[error("Duplicate identifier '{0}'")]
    Duplicate(String),

    // Carries the identifier so the driver can tell "unknown ident at the
    // start of a declaration" from a genuinely unresolved name.
    #[error("{file}({line}): Error: Unknown identifier '{entry}'")]
    NotFound {
        file: String,
        line: i32,
        entry: String,
    },

    #[error("{file}({line}): Error: {msg}")]
    Parser { file: String, line: i32, msg: String },

    #[error("Error: {msg} ({file})")]
    System { file: String, msg: String },

    #[error("Invalid subrange for {0}")]
    InvalidSubrange(String),

    // Codegen needed a host scope but none was given (e.g. inside typeof).
    #[error("Variable access is not allowed in this context")]
    NoContext,

    #[error("{file}({line}): Assertion failed")]
    RuntimeAssert { file: String, line: i32 },

    #[error("{file}({line}): Division by zero")]
    DivByZero { file: String, line: i32 },

    #[error("Index out of range")]
    IndexOutOfRange,

    #[error("Illegal opcode")]
    IllegalOpcode,

    #[error("Feature not implemented")]
    NotImplemented,
}


impl Error {
    pub fn internal(code: i32) -> Error {
        Error::Internal(code)
    }
}
