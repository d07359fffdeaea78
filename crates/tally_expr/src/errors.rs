use miette::Diagnostic;
use thiserror::Error;

use crate::diagnostics::SourceSpan;

#[derive(Error, Debug, Clone, Diagnostic)]
pub enum ExprError {
    #[error("syntax error: {message}")]
    #[diagnostic(code(tally::syntax_error))]
    Syntax {
        #[source_code]
        src: String,
        #[label("here")]
        span: miette::SourceSpan,
        message: String,
    },

    #[error("syntax error: {message}")]
    #[diagnostic(code(tally::indentation_error))]
    Indentation {
        #[source_code]
        src: String,
        #[label("here")]
        span: miette::SourceSpan,
        message: String,
    },
}

impl ExprError {
    pub fn syntax(src: &str, span: SourceSpan, message: impl Into<String>) -> Self {
        ExprError::Syntax {
            src: src.to_string(),
            span: (span.offset(), span.len()).into(),
            message: message.into(),
        }
    }

    pub fn indentation(src: &str, span: SourceSpan, message: impl Into<String>) -> Self {
        ExprError::Indentation {
            src: src.to_string(),
            span: (span.offset(), span.len()).into(),
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ExprError::Syntax { message, .. } | ExprError::Indentation { message, .. } => message,
        }
    }

    pub fn span(&self) -> SourceSpan {
        match self {
            ExprError::Syntax { span, .. } | ExprError::Indentation { span, .. } => (*span).into(),
        }
    }
}
