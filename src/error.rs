//! D-Bus error values.
//!
//! An [`Error`] is a plain value: a kind, the D-Bus error name it maps to and
//! a human readable message. A value of kind [`ErrorKind::NoError`] stands for
//! "no error", which is what an interface's last error holds after a
//! successful operation.

use crate::codec::CodecError;

/// The error classes known to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoError,
    /// A remote error whose name is not in the table below.
    Other,
    Failed,
    NoMemory,
    ServiceUnknown,
    NoReply,
    NotSupported,
    AccessDenied,
    Timeout,
    Disconnected,
    InvalidArgs,
    UnknownMethod,
    InvalidSignature,
    UnknownInterface,
    UnknownObject,
    UnknownProperty,
    PropertyReadOnly,
    InternalError,
    InvalidService,
    InvalidObjectPath,
    InvalidInterface,
    InvalidMember,
}

const ERROR_NAMES: &[(ErrorKind, &str)] = &[
    (ErrorKind::Failed, "org.freedesktop.DBus.Error.Failed"),
    (ErrorKind::NoMemory, "org.freedesktop.DBus.Error.NoMemory"),
    (ErrorKind::ServiceUnknown, "org.freedesktop.DBus.Error.ServiceUnknown"),
    (ErrorKind::NoReply, "org.freedesktop.DBus.Error.NoReply"),
    (ErrorKind::NotSupported, "org.freedesktop.DBus.Error.NotSupported"),
    (ErrorKind::AccessDenied, "org.freedesktop.DBus.Error.AccessDenied"),
    (ErrorKind::Timeout, "org.freedesktop.DBus.Error.Timeout"),
    (ErrorKind::Disconnected, "org.freedesktop.DBus.Error.Disconnected"),
    (ErrorKind::InvalidArgs, "org.freedesktop.DBus.Error.InvalidArgs"),
    (ErrorKind::UnknownMethod, "org.freedesktop.DBus.Error.UnknownMethod"),
    (ErrorKind::InvalidSignature, "org.freedesktop.DBus.Error.InvalidSignature"),
    (ErrorKind::UnknownInterface, "org.freedesktop.DBus.Error.UnknownInterface"),
    (ErrorKind::UnknownObject, "org.freedesktop.DBus.Error.UnknownObject"),
    (ErrorKind::UnknownProperty, "org.freedesktop.DBus.Error.UnknownProperty"),
    (ErrorKind::PropertyReadOnly, "org.freedesktop.DBus.Error.PropertyReadOnly"),
    (ErrorKind::InternalError, "org.dbus_remote.Error.InternalError"),
    (ErrorKind::InvalidService, "org.dbus_remote.Error.InvalidService"),
    (ErrorKind::InvalidObjectPath, "org.dbus_remote.Error.InvalidObjectPath"),
    (ErrorKind::InvalidInterface, "org.dbus_remote.Error.InvalidInterface"),
    (ErrorKind::InvalidMember, "org.dbus_remote.Error.InvalidMember"),
    // only for locally made errors, remote ones keep their own name
    (ErrorKind::Other, "org.dbus_remote.Error.Other"),
];

impl ErrorKind {
    /// The D-Bus error name for this kind. `NoError` has none.
    pub fn name(self) -> Option<&'static str> {
        ERROR_NAMES
            .iter()
            .find(|(k, _)| *k == self)
            .map(|(_, n)| *n)
    }

    /// Map a D-Bus error name back to its kind. Unknown names are `Other`.
    pub fn from_name(name: &str) -> ErrorKind {
        if name.is_empty() {
            return ErrorKind::NoError;
        }
        ERROR_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(k, _)| *k)
            .unwrap_or(ErrorKind::Other)
    }
}

/// A D-Bus error, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct Error {
    kind: ErrorKind,
    name: String,
    message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Default for Error {
    fn default() -> Self {
        Error::none()
    }
}

impl Error {
    /// The "no error" value.
    pub fn none() -> Self {
        Error {
            kind: ErrorKind::NoError,
            name: String::new(),
            message: String::new(),
        }
    }

    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let name = kind.name().unwrap_or("").to_string();
        Error {
            kind,
            name,
            message: message.into(),
        }
    }

    /// Build an error from a D-Bus error name as received from a remote peer.
    pub fn with_name(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        Error {
            kind: ErrorKind::from_name(&name),
            name,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True unless this is the "no error" value.
    pub fn is_error(&self) -> bool {
        self.kind != ErrorKind::NoError
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::TypeMismatch { .. } => Error::new(ErrorKind::InvalidSignature, e.to_string()),
            e => Error::new(ErrorKind::Failed, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for (kind, name) in ERROR_NAMES {
            assert_eq!(ErrorKind::from_name(name), *kind);
            assert_eq!(kind.name(), Some(*name));
        }
        assert_eq!(ErrorKind::from_name(""), ErrorKind::NoError);
        assert_eq!(ErrorKind::from_name("com.example.Oops"), ErrorKind::Other);
    }

    #[test]
    fn remote_names_are_kept() {
        let e = Error::with_name("com.example.Oops", "it broke");
        assert_eq!(e.kind(), ErrorKind::Other);
        assert_eq!(e.name(), "com.example.Oops");
        assert!(e.is_error());
        assert_eq!(e.to_string(), "com.example.Oops: it broke");
    }

    #[test]
    fn local_errors_always_have_a_name() {
        let e = Error::new(ErrorKind::Other, "odd");
        assert_eq!(e.name(), "org.dbus_remote.Error.Other");
        assert_eq!(Error::with_name(e.name(), e.message()), e);
    }

    #[test]
    fn default_is_no_error() {
        let e = Error::default();
        assert!(!e.is_error());
        assert_eq!(e.name(), "");
    }
}
