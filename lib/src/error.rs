//! Classified errors.
//!
//! Operations return [`color_eyre::Report`] like everything else in this crate,
//! but failures that callers need to branch on carry an [`Error`] at the root of the chain.
//! Use [`ErrorKind::of`] to recover the classification from a report,
//! regardless of how much context was layered on top of it.

use color_eyre::eyre;
use derive_more::{Display, Error as DeriveError};

/// The classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    /// Two pieces of content were expected to agree and did not.
    #[display("mismatch")]
    Mismatch,

    /// A required annotation is absent.
    #[display("missing annotation")]
    MissingAnnotation,

    /// A search produced no results.
    #[display("not found")]
    NotFound,

    /// Content could not be parsed or failed verification.
    #[display("parsing failed")]
    ParsingFailed,

    /// The operation requires an image manifest.
    #[display("not an image")]
    NotImage,

    /// The operation requires an index.
    #[display("not a list")]
    NotList,

    /// The media type is not supported.
    #[display("unsupported media type")]
    UnsupportedMediaType,

    /// The operation was canceled.
    #[display("canceled")]
    Canceled,
}

impl ErrorKind {
    /// Find the classification of the first [`Error`] in the chain of the report.
    ///
    /// ```
    /// # use ocimod_lib::error::ErrorKind;
    /// # use color_eyre::eyre::WrapErr;
    /// let report = Err::<(), _>(ErrorKind::Mismatch.report("layers differ"))
    ///     .context("rebase image")
    ///     .unwrap_err();
    /// assert_eq!(ErrorKind::of(&report), Some(ErrorKind::Mismatch));
    /// ```
    pub fn of(report: &eyre::Report) -> Option<ErrorKind> {
        report
            .chain()
            .find_map(|err| err.downcast_ref::<Error>())
            .map(Error::kind)
    }

    /// Create a report of this kind with the provided message.
    pub fn report(self, message: impl Into<String>) -> eyre::Report {
        Error::new(self, message).into()
    }
}

/// An error with a classification.
#[derive(Debug, Clone, PartialEq, Eq, Display, DeriveError)]
#[display("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    /// Create a new instance.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The classification of the error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The message describing the error.
    pub fn message(&self) -> &str {
        &self.message
    }
}
