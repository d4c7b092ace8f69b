//! Remote interfaces over D-Bus.
//!
//! The crate is organized bottom up:
//!
//! - [`validate`] checks bus, path, interface and member names.
//! - [`value`] and [`codec`] hold D-Bus values and the argument
//!   marshaller that turns typed Rust values into them and back.
//! - [`types`] keeps the registry of named types used when building
//!   method tables from introspection data.
//! - [`pending`] is the pending call state machine and its watchers.
//! - [`connection`] is the transport contract, [`bus`] its libdbus
//!   implementation.
//! - [`introspect`] turns introspection XML into method tables.
//! - [`interface`] is the client side view of one remote interface.
#[macro_use]
extern crate serde_derive;

pub mod bus;
pub mod codec;
pub mod connection;
pub mod error;
pub mod event;
pub mod interface;
pub mod introspect;
pub mod message;
pub mod pending;
pub mod types;
pub mod validate;
pub mod value;
mod xml;

pub use connection::{CallMode, Connection, ConnectionMode};
pub use error::{Error, ErrorKind, Result};
pub use event::EventQueue;
pub use interface::{AbstractInterface, InterfaceKind};
pub use message::{Message, MessageType};
pub use pending::{PendingCall, PendingCallWatcher, ReplyCallback};
pub use value::Value;
