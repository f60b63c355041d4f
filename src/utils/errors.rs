#![forbid(unsafe_code)]

use thiserror::Error;

/// Error enumerates the errors returned by this application.
#[derive(Error, Debug)]
pub enum Errors {
    /// Input parameter logging.
    #[error("hello_server input parameters:\n{}", .0)]
    InputParms(String),

    /// Inaccessible logger configuration file.
    #[error("Unable to access the Log4rs configuration file: {}", .0)]
    Log4rsInitialization(String),

    #[error("Reading application configuration file: {}", .0)]
    ReadingConfigFile(String),

    #[error("Unable to parse TOML file: {}", .0)]
    TOMLParseError(String),

    /// The local API could not be reached or the exchange failed mid-flight.
    #[error("local API transport error: {}", .0)]
    Transport(String),

    /// The local API answered with a non-200 status.
    #[error("HTTP {}: {}", .0, .1)]
    Status(String, String),

    /// The whois body was not a WhoIsResponse; carries a bounded, quoted prefix.
    #[error("failed to parse JSON WhoIsResponse from {}", .0)]
    Decode(String),

    /// No loopback port and token could be found for the local API.
    #[error("no local API port and token found: {}", .0)]
    Broker(String),

    #[error("template error: {}", .0)]
    Template(String),

    #[error("embedded template is empty")]
    EmptyTemplate,

    #[error("no remote addr: {}", .0)]
    Address(String),
}

impl From<hyper::Error> for Errors {
    fn from(e: hyper::Error) -> Self {
        Errors::Transport(e.to_string())
    }
}

impl From<http::Error> for Errors {
    fn from(e: http::Error) -> Self {
        Errors::Transport(e.to_string())
    }
}

impl From<tera::Error> for Errors {
    fn from(e: tera::Error) -> Self {
        Errors::Template(crate::utils::hello_utils::error_chain(&e))
    }
}
