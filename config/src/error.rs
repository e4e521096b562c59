use thiserror::Error;

/// Failure loading or resolving a [`crate::FetcherConfig`].
///
/// Unlike [`fetchcore_types::FetchError`], this is allowed to propagate directly — config
/// loading happens before a fetcher context exists, so there is no `FetchResult` to wrap it in.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("invalid URL in field `{field}`: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("no writable config directory is available on this platform")]
    NoConfigDir,
}
