use std::fmt;

/// A basic error type from this library.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Like a classic EAGAIN. The receiver should retry.
    Again,

    /// A generic error message.
    Msg(String),

    /// The NetBIOS name is not valid, e.g. too long or containing control characters.
    InvalidName(String),

    /// The name table is full. The request was aborted.
    TableFull,

    /// The adapter table cannot hold all the interfaces of the host.
    CapacityExceeded,

    /// Another host already owns the name.
    NameConflict,

    /// The name is being released on at least one adapter.
    NameBeingReleased,

    /// The name was not registered by this host.
    NotRegistered,

    /// A name server or the network answered that the name does not exist.
    NameNotFound,

    /// No response after all retries.
    Timeout,

    /// An incoming frame could not be decoded.
    MalformedFrame(String),

    /// A socket operation failed.
    Transport(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Msg(s) => write!(f, "{}", s),
            Error::Again => write!(f, "try again"),
            Error::InvalidName(s) => write!(f, "invalid NetBIOS name: {}", s),
            Error::TableFull => write!(f, "name table is full"),
            Error::CapacityExceeded => write!(f, "too many network adapters"),
            Error::NameConflict => write!(f, "name is owned by another host"),
            Error::NameBeingReleased => write!(f, "name is being released"),
            Error::NotRegistered => write!(f, "name is not registered"),
            Error::NameNotFound => write!(f, "name not found"),
            Error::Timeout => write!(f, "no response"),
            Error::MalformedFrame(s) => write!(f, "malformed frame: {}", s),
            Error::Transport(s) => write!(f, "transport error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

/// One and only `Result` type from this library crate.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;
    use test_log::test;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::TableFull.to_string(), "name table is full");
        assert_eq!(
            Error::InvalidName("A.B".to_string()).to_string(),
            "invalid NetBIOS name: A.B"
        );
        assert_eq!(e_fmt!("no {} adapter", "network").to_string(), "no network adapter");
    }
}
