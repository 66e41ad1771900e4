use thiserror::Error;

/// Errors raised while reading tail sampling configuration.
///
/// These never reach the span hot path: a malformed entry is reported through
/// internal logs and skipped, leaving the default in place.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The category name is not one of `default`, `update`, `packet` or `worldscript`.
    #[error("unknown span category: {0}")]
    UnknownCategory(String),

    /// The entry is not of the form `category=value`.
    #[error("malformed configuration entry: {0}")]
    MalformedEntry(String),

    /// The value could not be parsed as a number.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Category or variable the value was given for.
        key: String,
        /// The raw value.
        value: String,
    },
}
