//! Messages exchanged with a connection.

use crate::codec::DBusType;
use crate::error::Error;
use crate::value::{argument_to_string, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// No message; also the "not finished yet" marker of a pending call.
    Invalid,
    MethodCall,
    Reply,
    Error,
    Signal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: MessageType,
    // destination of a call, sender of anything else
    service: String,
    path: String,
    interface: String,
    member: String,
    error_name: String,
    arguments: Vec<Value>,
    no_reply: bool,
}

impl Default for Message {
    fn default() -> Self {
        Message::invalid()
    }
}

impl Message {
    fn empty(kind: MessageType) -> Self {
        Message {
            kind,
            service: String::new(),
            path: String::new(),
            interface: String::new(),
            member: String::new(),
            error_name: String::new(),
            arguments: Vec::new(),
            no_reply: false,
        }
    }

    pub fn invalid() -> Self {
        Message::empty(MessageType::Invalid)
    }

    pub fn method_call(
        service: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Message {
            service: service.into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            ..Message::empty(MessageType::MethodCall)
        }
    }

    pub fn signal(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Message {
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            ..Message::empty(MessageType::Signal)
        }
    }

    pub fn reply(arguments: Vec<Value>) -> Self {
        Message {
            arguments,
            ..Message::empty(MessageType::Reply)
        }
    }

    /// A reply to this call, sent by its destination.
    pub fn create_reply(&self, arguments: Vec<Value>) -> Self {
        Message {
            service: self.service.clone(),
            arguments,
            ..Message::empty(MessageType::Reply)
        }
    }

    /// An error reply carrying `error`. A "no error" value yields an
    /// invalid message.
    pub fn error(error: &Error) -> Self {
        if !error.is_error() {
            return Message::invalid();
        }
        Message {
            error_name: error.name().to_string(),
            arguments: vec![Value::Str(error.message().to_string())],
            ..Message::empty(MessageType::Error)
        }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn error_name(&self) -> &str {
        &self.error_name
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    pub fn into_arguments(self) -> Vec<Value> {
        self.arguments
    }

    pub fn set_arguments(&mut self, arguments: Vec<Value>) {
        self.arguments = arguments;
    }

    pub fn push_argument(&mut self, v: impl Into<Value>) {
        self.arguments.push(v.into());
    }

    pub fn with_argument(mut self, v: impl Into<Value>) -> Self {
        self.push_argument(v);
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.service = sender.into();
        self
    }

    pub fn no_reply(&self) -> bool {
        self.no_reply
    }

    pub fn set_no_reply(&mut self, no_reply: bool) {
        self.no_reply = no_reply;
    }

    /// Concatenated signatures of all arguments.
    pub fn signature(&self) -> String {
        self.arguments.iter().map(|a| a.signature()).collect()
    }

    /// Argument `i` converted to `T`, if it has exactly that type.
    pub fn argument<T: DBusType>(&self, i: usize) -> Option<T> {
        self.arguments.get(i).and_then(T::from_value)
    }
}

impl From<&Message> for Error {
    fn from(m: &Message) -> Self {
        match m.kind {
            MessageType::Error => {
                let text = m
                    .arguments
                    .first()
                    .and_then(|a| a.as_str())
                    .unwrap_or("")
                    .to_string();
                Error::with_name(m.error_name.clone(), text)
            }
            _ => Error::none(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if !self.service.is_empty() {
            write!(f, " service={}", self.service)?;
        }
        if !self.path.is_empty() {
            write!(f, " path={}", self.path)?;
        }
        if !self.interface.is_empty() {
            write!(f, " interface={}", self.interface)?;
        }
        if !self.member.is_empty() {
            write!(f, " member={}", self.member)?;
        }
        if !self.error_name.is_empty() {
            write!(f, " error={}", self.error_name)?;
        }
        write!(f, " signature=\"{}\" (", self.signature())?;
        for (i, a) in self.arguments.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&argument_to_string(a))?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn error_round_trip() {
        let e = Error::new(ErrorKind::InvalidSignature, "nope");
        let m = Message::error(&e);
        assert_eq!(m.kind(), MessageType::Error);
        assert_eq!(m.signature(), "s");
        assert_eq!(Error::from(&m), e);

        let e = Error::new(ErrorKind::Other, "odd");
        let back = Error::from(&Message::error(&e));
        assert_eq!(back.kind(), ErrorKind::Other);
        assert!(back.is_error());
    }

    #[test]
    fn replies_are_not_errors() {
        let m = Message::reply(vec![Value::from("y")]);
        assert!(!Error::from(&m).is_error());
        assert_eq!(m.argument::<String>(0).as_deref(), Some("y"));
        assert_eq!(m.argument::<i32>(0), None);
        assert_eq!(Message::error(&Error::none()).kind(), MessageType::Invalid);
    }

    #[test]
    fn signature_concatenates_arguments() {
        let m = Message::method_call("org.example.Foo", "/obj", "org.example.Iface", "Method")
            .with_argument("x")
            .with_argument(3u32)
            .with_argument(Value::variant(true.into()));
        assert_eq!(m.signature(), "suv");
        let shown = m.to_string();
        assert!(shown.starts_with("MethodCall service=org.example.Foo path=/obj"));
        assert!(shown.contains("member=Method"));
    }
}
