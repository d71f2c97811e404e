use std::fmt;

use thiserror::Error;

use crate::language::token::Token;

/// Fatal-for-the-task error: type mismatches, missing identifiers, bounds,
/// arity. Caught by `recover`, otherwise fails the task.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub token: Option<Token>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Raised by `fail(...)`, I/O built-ins and cancellation. Caught by
/// `recover`; never fails the process on its own.
#[derive(Debug, Clone)]
pub struct RecoverableError {
    pub message: String,
    pub kind: String,
    pub token: Option<Token>,
}

impl fmt::Display for RecoverableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Produced by `exit(...)`. Bypasses `recover` and terminates the program
/// with the requested code.
#[derive(Debug, Clone)]
pub struct ExitError {
    pub message: String,
    pub code: i32,
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "exit")
        } else {
            write!(f, "exit: {}", self.message)
        }
    }
}

/// Aggregate surfaced at end of program when tasks failed with nobody
/// awaiting them. Messages are already formatted (they may point into
/// different source files), so callers print `to_string()` verbatim instead
/// of re-wrapping through `format_runtime_error`.
#[derive(Debug, Clone, Default)]
pub struct UnhandledTaskError {
    pub messages: Vec<String>,
}

impl fmt::Display for UnhandledTaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.messages.is_empty() {
            write!(f, "unhandled task failure")
        } else {
            write!(f, "unhandled task failures:\n\n{}", self.messages.join("\n\n"))
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("{0}")]
    Runtime(RuntimeError),
    #[error("{0}")]
    Recoverable(RecoverableError),
    #[error("{0}")]
    Exit(ExitError),
    #[error("{0}")]
    UnhandledTasks(UnhandledTaskError),
    /// Pre-formatted module load or parse failure; printed verbatim and not
    /// caught by `recover`.
    #[error("{0}")]
    Module(String),
}

impl Error {
    pub fn runtime(message: impl Into<String>) -> Error {
        Error::Runtime(RuntimeError {
            message: message.into(),
            token: None,
        })
    }

    pub fn recoverable(kind: &str, message: impl Into<String>) -> Error {
        Error::Recoverable(RecoverableError {
            message: message.into(),
            kind: kind.to_string(),
            token: None,
        })
    }

    pub fn canceled() -> Error {
        Error::recoverable("canceled", "task canceled")
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Recoverable(e) if e.kind == "canceled")
    }

    /// Whether a `recover { … } with { … }` expression handles this error.
    pub fn is_recover_catchable(&self) -> bool {
        matches!(self, Error::Runtime(_) | Error::Recoverable(_))
    }

    pub fn token(&self) -> Option<&Token> {
        match self {
            Error::Runtime(e) => e.token.as_ref(),
            Error::Recoverable(e) => e.token.as_ref(),
            _ => None,
        }
    }

    /// Attach a source position to a token-less runtime or recoverable
    /// error; errors that already point somewhere keep their position.
    pub fn with_token(mut self, token: &Token) -> Error {
        match &mut self {
            Error::Runtime(e) if e.token.is_none() => e.token = Some(token.clone()),
            Error::Recoverable(e) if e.token.is_none() => e.token = Some(token.clone()),
            _ => {}
        }
        self
    }
}

/// Render an error with a caret into the offending source line:
///
/// ```text
/// runtime error: <message>
///   at <file>:<line>:<col>
///   <line> | <source line>
///     | <caret>
/// ```
///
/// Falls back to the message alone when the error carries no position or the
/// source text is unavailable.
pub fn format_runtime_error(err: &Error, source: &str, filename: &str) -> String {
    match err {
        Error::Runtime(e) => format_pointed(&e.message, e.token.as_ref(), source, filename),
        Error::Recoverable(e) => format_pointed(&e.message, e.token.as_ref(), source, filename),
        other => other.to_string(),
    }
}

fn format_pointed(message: &str, token: Option<&Token>, source: &str, filename: &str) -> String {
    let token = match token {
        Some(t) if t.is_positioned() && !source.is_empty() => t,
        _ => return format!("runtime error: {}", message),
    };
    let lines: Vec<&str> = source.split('\n').collect();
    if token.line < 1 || token.line > lines.len() {
        return format!("runtime error: {}", message);
    }
    let line_text = lines[token.line - 1].trim_end_matches('\r');
    let mut col = token.column.max(1);
    if col > line_text.len() + 1 {
        col = line_text.len() + 1;
    }
    let caret = format!("{}^", " ".repeat(col - 1));
    let location = if filename.is_empty() {
        format!("{}:{}", token.line, token.column)
    } else {
        format!("{}:{}:{}", filename, token.line, token.column)
    };
    format!(
        "runtime error: {}\n  at {}\n  {} | {}\n    | {}",
        message, location, token.line, line_text, caret
    )
}
