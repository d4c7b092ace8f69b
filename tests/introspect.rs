mod common;

use common::MockConnection;
use dbus_remote::{
    connection::Connection,
    error::{Error, ErrorKind},
    introspect::{find_method_table, InterfaceRegistry, MERGED_INTERFACE},
    message::Message,
};

const TWO: &str = r#"
<node>
  <interface name="org.example.A">
    <method name="foo"/>
  </interface>
  <interface name="org.example.B">
    <method name="bar"/>
  </interface>
  <interface name="local.Hidden">
    <method name="baz"/>
  </interface>
</node>
"#;

#[test]
fn merged_tables_are_never_cached() {
    let registry = InterfaceRegistry::new();
    let merged = registry.table_from_xml("", TWO).unwrap();
    assert_eq!(merged.interface(), MERGED_INTERFACE);
    assert!(merged.member("foo()").is_some());
    assert!(merged.member("bar()").is_some());
    assert!(registry.cached(MERGED_INTERFACE).is_none());
    assert!(registry.cached("org.example.A").is_some());
    assert!(registry.cached("org.example.B").is_some());
    assert!(registry.cached("local.Hidden").is_none());
    let n = registry.generation_count();

    let again = registry.table_from_xml("", TWO).unwrap();
    assert!(again.member("foo()").is_some());
    // the merge and the local interface are generated again, A and B are not
    assert_eq!(registry.generation_count(), n + 2);
}

#[test]
fn named_lookups() {
    let registry = InterfaceRegistry::new();
    let a = registry.table_from_xml("org.example.A", TWO).unwrap();
    assert!(a.member("foo()").is_some());
    assert!(a.member("bar()").is_none());
    let n = registry.generation_count();
    let b = registry.table_from_xml("org.example.B", TWO).unwrap();
    assert!(b.find_method("bar").is_some());
    assert_eq!(registry.generation_count(), n + 1);

    let e = registry.table_from_xml("org.example.C", TWO).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::UnknownInterface);

    let empty = registry.table_from_xml("org.example.C", "").unwrap();
    assert!(empty.is_empty());
    assert!(registry.cached("org.example.C").is_none());
}

#[test]
fn introspection_over_a_connection() {
    let conn = MockConnection::new();
    conn.reply_to("Introspect", Message::reply(vec![TWO.into()]));
    let t = find_method_table(&conn, ":1.7", "/obj", "org.example.A").unwrap();
    assert!(t.member("foo()").is_some());
    let (sent, _) = conn.calls()[0].clone();
    assert_eq!(sent.interface(), "org.freedesktop.DBus.Introspectable");
    assert_eq!(sent.member(), "Introspect");

    // cached now, no second round trip
    find_method_table(&conn, ":1.7", "/obj", "org.example.B").unwrap();
    assert_eq!(conn.calls().len(), 1);
}

#[test]
fn objects_that_cannot_introspect() {
    let conn = MockConnection::new();
    // the mock answers unknown members with UnknownMethod
    let t = find_method_table(&conn, ":1.7", "/obj", "org.example.A").unwrap();
    assert!(t.is_empty());

    conn.reply_to(
        "Introspect",
        Message::error(&Error::new(ErrorKind::AccessDenied, "go away")),
    );
    let e = find_method_table(&conn, ":1.7", "/obj", "org.example.A").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::AccessDenied);
}

#[test]
fn introspection_replies_must_be_one_string() {
    let conn = MockConnection::new();
    conn.reply_to("Introspect", Message::reply(vec![TWO.into(), 1i32.into()]));
    let e = find_method_table(&conn, ":1.7", "/obj", "org.example.A").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidSignature);
    assert!(conn.registry().cached("org.example.A").is_none());

    conn.reply_to("Introspect", Message::reply(vec![]));
    let e = find_method_table(&conn, ":1.7", "/obj", "org.example.A").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidSignature);
}
