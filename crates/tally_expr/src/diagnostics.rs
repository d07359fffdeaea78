use annotate_snippets::{AnnotationKind, Level, Renderer, Snippet};

use crate::errors::ExprError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SourceSpan {
    offset: usize,
    length: usize,
}

impl SourceSpan {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }
    pub fn offset(&self) -> usize {
        self.offset
    }
    pub fn len(&self) -> usize {
        self.length
    }
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Smallest span covering both `self` and `other`.
    pub fn to(&self, other: SourceSpan) -> SourceSpan {
        let start = self.offset.min(other.offset);
        let end = self.end().max(other.end());
        SourceSpan::new(start, end - start)
    }
}

impl From<miette::SourceSpan> for SourceSpan {
    fn from(span: miette::SourceSpan) -> Self {
        Self::new(span.offset(), span.len())
    }
}

impl From<(usize, usize)> for SourceSpan {
    fn from(value: (usize, usize)) -> Self {
        Self::new(value.0, value.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiagnosticLevel {
    #[default]
    Error,
    Warning,
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub span: SourceSpan,
    pub code: Option<String>,
    pub hints: Vec<String>,
}

impl From<&ExprError> for Diagnostic {
    fn from(err: &ExprError) -> Self {
        let code = match err {
            ExprError::Syntax { .. } => "syntax_error",
            ExprError::Indentation { .. } => "indentation_error",
        };
        Diagnostic {
            level: DiagnosticLevel::Error,
            message: err.message().to_string(),
            span: err.span(),
            code: Some(code.to_string()),
            hints: Vec::new(),
        }
    }
}

/// Renders diagnostics against the expression source with annotate_snippets.
pub struct ErrorFormatter {
    pub use_colors: bool,
}

impl Default for ErrorFormatter {
    fn default() -> Self {
        ErrorFormatter { use_colors: true }
    }
}

impl ErrorFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plain() -> Self {
        ErrorFormatter { use_colors: false }
    }

    fn level<'a>(&self, diag: &Diagnostic) -> Level<'a> {
        match diag.level {
            DiagnosticLevel::Error => Level::ERROR,
            DiagnosticLevel::Warning => Level::WARNING,
        }
    }

    pub fn format_diagnostic(&self, diag: &Diagnostic, src: &str, origin: &str) -> String {
        let renderer = if self.use_colors {
            Renderer::styled()
        } else {
            Renderer::plain()
        };

        let start = diag.span.offset().min(src.len());
        let end = diag.span.end().min(src.len());

        let snippet = Snippet::source(src)
            .line_start(1)
            .path(origin)
            .fold(true)
            .annotation(AnnotationKind::Primary.span(start..end).label(&diag.message));

        let mut title = self.level(diag).primary_title(&diag.message);
        if let Some(code) = &diag.code {
            title = title.id(code);
        }

        let mut group = title.element(snippet);
        for hint in &diag.hints {
            group = group.element(Level::HELP.message(hint));
        }

        let report = vec![group];
        renderer.render(&report).to_string()
    }

    pub fn format_error(&self, err: &ExprError, src: &str, origin: &str) -> String {
        self.format_diagnostic(&Diagnostic::from(err), src, origin)
    }
}
