//! Error context and chaining utilities
//!
//! Registry failures are usually layered: a hook or the driver fails, the
//! registry wraps it as an initialization error, and a caller may add its
//! own context on top. These helpers build and flatten such chains so they
//! can be logged on a single line.

use super::Error;
use std::error::Error as StdError;
use std::fmt;

/// Trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to the error
    fn context<C>(self, context: C) -> Result<T, Error>
    where
        C: Into<String>;

    /// Add context with lazy evaluation
    fn with_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<Error>,
{
    fn context<C>(self, context: C) -> Result<T, Error>
    where
        C: Into<String>,
    {
        self.map_err(|e| Into::<Error>::into(e).with_context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| Into::<Error>::into(e).with_context(f()))
    }
}

/// Flattened view of an error and every cause below it
pub struct ErrorChain<'a> {
    error: &'a Error,
    chain: Vec<String>,
}

impl<'a> ErrorChain<'a> {
    pub fn new(error: &'a Error) -> Self {
        let mut chain = vec![error.to_string()];
        let mut cause = error.source();
        while let Some(current) = cause {
            chain.push(current.to_string());
            cause = current.source();
        }
        Self { error, chain }
    }

    /// Get the full error chain as a vector
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// Innermost registry error, skipping context wrappers
    pub fn root_cause(&self) -> &Error {
        let mut current = self.error;
        while let Error::WithContext { source, .. } = current {
            current = source;
        }
        current
    }

    pub fn format_for_log(&self) -> String {
        self.chain.join(" -> ")
    }

    pub fn format_for_display(&self) -> String {
        if self.chain.len() == 1 {
            self.chain[0].clone()
        } else {
            format!(
                "{}\n\nCaused by:\n{}",
                self.chain[0],
                self.chain[1..]
                    .iter()
                    .enumerate()
                    .map(|(i, msg)| format!("  {}. {}", i + 1, msg))
                    .collect::<Vec<_>>()
                    .join("\n")
            )
        }
    }
}

impl<'a> fmt::Display for ErrorChain<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_for_display())
    }
}

/// Extension trait for Option types
pub trait OptionExt<T> {
    /// Convert None to a configuration error
    fn or_configuration<C>(self, message: C) -> Result<T, Error>
    where
        C: Into<String>;

    /// Convert None to a configuration error built lazily
    fn or_configuration_with<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> OptionExt<T> for Option<T> {
    fn or_configuration<C>(self, message: C) -> Result<T, Error>
    where
        C: Into<String>,
    {
        self.ok_or_else(|| Error::configuration(message))
    }

    fn or_configuration_with<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::configuration(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain_follows_initialization_source() {
        let error = Error::initialization("tenant-7", Error::database_pool("pool closed"))
            .with_context("opening session");

        let chain = ErrorChain::new(&error);

        assert_eq!(chain.chain().len(), 3);
        assert_eq!(chain.chain()[0], "opening session");
        assert!(chain.format_for_log().ends_with("Database pool error: pool closed"));
        assert!(matches!(chain.root_cause(), Error::Initialization { .. }));
    }

    #[test]
    fn test_display_lists_causes() {
        let error = Error::configuration("missing url").with_context("building 'reports'");
        let shown = ErrorChain::new(&error).to_string();

        assert!(shown.starts_with("building 'reports'"));
        assert!(shown.contains("  1. Configuration error: missing url"));
    }

    #[test]
    fn test_result_context_converts_io() {
        let result: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));

        let err = result.context("reading mapper").unwrap_err();
        assert_eq!(err.error_code(), "E_IO");
        assert_eq!(ErrorChain::new(&err).chain().len(), 3);
    }

    #[test]
    fn test_option_configuration() {
        let url: Option<&str> = None;
        let err = url.or_configuration("no url for 'primary'").unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: no url for 'primary'");
    }
}
