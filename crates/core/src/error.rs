//! Error types for the transport session library.

use std::fmt;

/// Errors that can occur while opening or reconfiguring a session.
///
/// Variants fall into the failure classes the session distinguishes:
///
/// - **Configuration**: [`Config`](Self::Config),
///   [`PortRangeExhausted`](Self::PortRangeExhausted): rejected before any
///   socket is opened.
/// - **Acquisition**: [`EndpointOpen`](Self::EndpointOpen),
///   [`DestinationUnresolved`](Self::DestinationUnresolved): everything opened
///   in the same call has already been rolled back.
/// - **Contract**: [`NotSingleEndpoint`](Self::NotSingleEndpoint).
/// - **Session-fatal**: [`FecInit`](Self::FecInit),
///   [`ReopenFailed`](Self::ReopenFailed), and [`Failed`](Self::Failed) for
///   every later use of a session that hit one. See [`is_fatal`](Self::is_fatal).
#[derive(Debug, thiserror::Error)]
pub enum RxtxError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration, detected before any resource was acquired.
    #[error("configuration error: {kind}")]
    Config { kind: ConfigErrorKind },

    /// Port assignment for a destination index left the `u16` range.
    #[error("port range exhausted (tried to allocate beyond u16 range)")]
    PortRangeExhausted,

    /// The destination host name did not resolve to an address of the
    /// requested family.
    #[error("destination {0} did not resolve to a usable address")]
    DestinationUnresolved(String),

    /// Opening the endpoint for one destination failed. Every endpoint
    /// opened earlier in the same call has been closed.
    #[error("unable to open endpoint #{index} towards {destination}: {source}")]
    EndpointOpen {
        index: usize,
        destination: String,
        #[source]
        source: Box<RxtxError>,
    },

    /// Change-destination was requested while the session does not have
    /// exactly one endpoint open.
    #[error("change of destination requires exactly one endpoint, {open} open")]
    NotSingleEndpoint { open: usize },

    /// The FEC encoder could not be constructed from a valid configuration.
    #[error("unable to initialize FEC encoder from '{config}'")]
    FecInit { config: String },

    /// Reopening the endpoint set at a new send port failed. The session is
    /// left without endpoints.
    #[error("changing send port to {port} failed: {source}")]
    ReopenFailed {
        port: u16,
        #[source]
        source: Box<RxtxError>,
    },

    /// The session hit a session-fatal error earlier and no longer transmits.
    #[error("session failed: {reason}")]
    Failed { reason: String },

    /// The control path is gone; no more messages can be delivered.
    #[error("control path stopped")]
    ControlStopped,
}

impl RxtxError {
    /// Whether the error must terminate the owning session.
    ///
    /// A session that failed to rebuild its endpoints or its FEC encoder
    /// cannot keep transmitting without corrupting the stream.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FecInit { .. } | Self::ReopenFailed { .. } | Self::Failed { .. }
        )
    }

    pub(crate) fn config(kind: ConfigErrorKind) -> Self {
        Self::Config { kind }
    }
}

/// Specific kind of configuration failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigErrorKind {
    /// The destination list contained no addresses.
    EmptyDestinationList,
    /// Requested MTU is outside the range the RTP layer can carry.
    MtuOutOfRange { requested: usize, max: usize },
    /// FEC grammar did not start with `percents ` or `cfg `.
    UnknownFecGrammar(String),
    /// `percents` grammar did not have exactly three parameters.
    FecArity { found: usize },
    /// A `percents` parameter did not parse as a number.
    FecParameter(String),
    /// A control command line could not be parsed.
    InvalidCommand(String),
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyDestinationList => write!(f, "empty destination list"),
            Self::MtuOutOfRange { requested, max } => {
                write!(f, "requested MTU {requested} outside allowed range (max {max})")
            }
            Self::UnknownFecGrammar(cfg) => write!(f, "unknown FEC configuration '{cfg}'"),
            Self::FecArity { found } => {
                write!(f, "'percents' expects 3 parameters, got {found}")
            }
            Self::FecParameter(token) => write!(f, "invalid FEC parameter '{token}'"),
            Self::InvalidCommand(line) => write!(f, "invalid control command '{line}'"),
        }
    }
}

/// Convenience alias for `Result<T, RxtxError>`.
pub type Result<T> = std::result::Result<T, RxtxError>;
