use thiserror::Error;

/// Primary error type for Flounder operations.
///
/// Everything a user can induce from malformed SQL is a recoverable `Err`
/// that the executor packages into the query result; code-generator bugs and
/// runtime faults inside generated code are allowed to abort the process
/// (see `flounder-runtime`).
#[derive(Error, Debug)]
pub enum FlounderError {
    // === Parse / semantic errors ===
    /// SQL syntax error.
    #[error("near \"{token}\": syntax error")]
    SyntaxError { token: String },

    /// No such table.
    #[error("no such table: {name}")]
    NoSuchTable { name: String },

    /// No such attribute.
    #[error("no such attribute: {name}")]
    NoSuchAttribute { name: String },

    /// Table already exists.
    #[error("table {name} already exists")]
    TableExists { name: String },

    /// Incompatible operand types in an expression.
    #[error("incompatible types: {detail}")]
    IncompatibleTypes { detail: String },

    /// Unsupported datatype or datatype combination.
    #[error("unsupported datatype: {detail}")]
    UnsupportedType { detail: String },

    // === Resource errors ===
    /// A single tuple does not fit into a data block.
    #[error("tuple size {tuple} exceeds block capacity {capacity}")]
    TupleTooLarge { tuple: usize, capacity: usize },

    /// Out of memory (hash table or block allocation).
    #[error("out of memory: {what}")]
    OutOfMemory { what: String },

    // === I/O errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A referenced file could not be opened.
    #[error("could not open file: '{path}'")]
    CannotOpen { path: String },

    /// A delimited input line does not match the target schema.
    #[error("bulk load error in {file} line {line}: {detail}")]
    BulkLoad {
        file: String,
        line: usize,
        detail: String,
    },

    // === Codegen errors ===
    /// The code generator reached an unimplemented emission branch.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Translation of the IR to machine code failed.
    #[error("code generation error: {0}")]
    Codegen(String),

    /// The external assembler failed.
    #[error("assembler error: {0}")]
    Assembler(String),

    // === Network errors ===
    /// A client message exceeded the framing limit.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    // === Internal errors ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl FlounderError {
    /// Whether the session can continue after reporting this error.
    pub const fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SyntaxError { .. }
                | Self::NoSuchTable { .. }
                | Self::NoSuchAttribute { .. }
                | Self::TableExists { .. }
                | Self::IncompatibleTypes { .. }
                | Self::UnsupportedType { .. }
                | Self::CannotOpen { .. }
                | Self::BulkLoad { .. }
                | Self::NotImplemented(_)
        )
    }

    /// Create a syntax error.
    pub fn syntax(token: impl Into<String>) -> Self {
        Self::SyntaxError {
            token: token.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a not-implemented error.
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented(feature.into())
    }

    /// Create an incompatible-types error.
    pub fn types(detail: impl Into<String>) -> Self {
        Self::IncompatibleTypes {
            detail: detail.into(),
        }
    }

    /// Create a codegen error.
    pub fn codegen(msg: impl Into<String>) -> Self {
        Self::Codegen(msg.into())
    }
}

/// Result type alias using `FlounderError`.
pub type Result<T> = std::result::Result<T, FlounderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = FlounderError::syntax("SELEC");
        assert_eq!(err.to_string(), r#"near "SELEC": syntax error"#);
    }

    #[test]
    fn user_recoverable() {
        assert!(FlounderError::syntax("x").is_user_recoverable());
        assert!(FlounderError::NoSuchTable {
            name: "lineitem".to_owned()
        }
        .is_user_recoverable());
        assert!(!FlounderError::internal("bug").is_user_recoverable());
        assert!(!FlounderError::codegen("bad operand").is_user_recoverable());
    }

    #[test]
    fn convenience_constructors() {
        let err = FlounderError::not_implemented("decimal division");
        assert!(matches!(err, FlounderError::NotImplemented(msg) if msg == "decimal division"));

        let err = FlounderError::types("LIKE requires string operands");
        assert!(matches!(err, FlounderError::IncompatibleTypes { .. }));
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: FlounderError = io_err.into();
        assert!(matches!(err, FlounderError::Io(_)));
    }
}
