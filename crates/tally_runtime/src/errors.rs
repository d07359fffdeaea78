use tally_expr::ExprError;
use tally_expr::diagnostics::SourceSpan;
use tally_ir::EntityClass;
use thiserror::Error;

/// Failure of a single expression evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("syntax error: {message}")]
    Syntax { message: String, span: SourceSpan },
    #[error("invalid expression: {0}")]
    InvalidExpression(String),
    #[error("name '{0}' is not defined")]
    NameNotDefined(String),
    #[error("attribute '{0}' does not exist")]
    AttributeDoesNotExist(String),
    #[error("function '{0}' is not defined")]
    FunctionNotDefined(String),
    #[error("evaluation error: {0}")]
    Eval(String),
    #[error("execution exceeded time limit")]
    TimeLimitExceeded,
}

impl EvalError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EvalError::InvalidExpression(msg.into())
    }

    pub fn eval(msg: impl Into<String>) -> Self {
        EvalError::Eval(msg.into())
    }

    /// Category tag reported next to the message.
    pub fn category(&self) -> &'static str {
        match self {
            EvalError::Syntax { .. } => "SyntaxError",
            EvalError::InvalidExpression(_) => "InvalidExpression",
            EvalError::NameNotDefined(_) => "NameNotDefined",
            EvalError::AttributeDoesNotExist(_) => "AttributeDoesNotExist",
            EvalError::FunctionNotDefined(_) => "FunctionNotDefined",
            EvalError::Eval(_) => "EvalError",
            EvalError::TimeLimitExceeded => "TimeLimitExceeded",
        }
    }

    /// Errors that terminate the whole run instead of one field.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EvalError::TimeLimitExceeded)
    }

    pub fn span(&self) -> Option<SourceSpan> {
        match self {
            EvalError::Syntax { span, .. } => Some(*span),
            _ => None,
        }
    }
}

impl From<ExprError> for EvalError {
    fn from(err: ExprError) -> Self {
        EvalError::Syntax {
            message: err.message().to_string(),
            span: err.span(),
        }
    }
}

impl From<PersistenceError> for EvalError {
    fn from(err: PersistenceError) -> Self {
        EvalError::Eval(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PersistenceError {
    #[error("{class} '{key}' not found")]
    NotFound { class: EntityClass, key: String },
    #[error("unique constraint violated: {key} = '{value}'")]
    Conflict { key: String, value: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("complex transaction {0} is locked")]
    Locked(i64),
    #[error("run was cancelled before commit")]
    Cancelled,
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl PersistenceError {
    pub fn not_found(class: EntityClass, key: impl Into<String>) -> Self {
        PersistenceError::NotFound { class, key: key.into() }
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        PersistenceError::Backend(err.to_string())
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        PersistenceError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Backend(err.to_string())
    }
}

/// Umbrella error for the public operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("invalid transaction type: {0}")]
    Schema(String),
    #[error("invalid request: {0}")]
    Request(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Text recorded against a field or input whose expression failed.
pub fn expression_failure(expr: &str, err: &EvalError) -> String {
    format!("Invalid expression \"{}\". {}: {}", expr.trim(), err.category(), err)
}
