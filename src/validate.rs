//! Validation of bus names, object paths, interface and member names and
//! type signatures.
//!
//! Every predicate here is pure and total: malformed input yields `false`,
//! never a panic.

use crate::error::{Error, ErrorKind, Result};

pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_SIGNATURE_LENGTH: usize = 255;
const MAX_ARRAY_DEPTH: usize = 32;
const MAX_STRUCT_DEPTH: usize = 32;

/// Whether an empty string passes a `check_*` function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowEmpty {
    EmptyAllowed,
    EmptyNotAllowed,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_bus_name_char(c: char) -> bool {
    is_name_char(c) || c == '-'
}

/// True for `:`-prefixed names assigned by the bus.
pub fn is_valid_unique_connection_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    match name.strip_prefix(':') {
        None => false,
        Some(rest) => rest
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(is_bus_name_char)),
    }
}

pub fn is_valid_bus_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    if name.starts_with(':') {
        return is_valid_unique_connection_name(name);
    }
    name.split('.').all(|part| {
        !part.is_empty()
            && !part.starts_with(|c: char| c.is_ascii_digit())
            && part.chars().all(is_bus_name_char)
    })
}

pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    match path.strip_prefix('/') {
        None => false,
        Some(rest) => rest
            .split('/')
            .all(|seg| !seg.is_empty() && seg.chars().all(is_name_char)),
    }
}

pub fn is_valid_member_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(is_name_char)
}

pub fn is_valid_interface_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let mut parts = 0;
    for part in name.split('.') {
        if !is_valid_member_name(part) {
            return false;
        }
        parts += 1;
    }
    parts >= 2
}

/// Error names share the interface name grammar.
pub fn is_valid_error_name(name: &str) -> bool {
    is_valid_interface_name(name)
}

pub fn is_basic_type(c: u8) -> bool {
    matches!(
        c,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g' | b'h'
    )
}

pub fn is_fixed_type(c: u8) -> bool {
    is_basic_type(c) && !matches!(c, b's' | b'o' | b'g')
}

fn complete_type(sig: &[u8], arrays: usize, structs: usize) -> Option<usize> {
    let c = *sig.first()?;
    match c {
        b'v' => Some(1),
        c if is_basic_type(c) => Some(1),
        b'a' => {
            if arrays >= MAX_ARRAY_DEPTH {
                return None;
            }
            if *sig.get(1)? == b'{' {
                if structs >= MAX_STRUCT_DEPTH || !is_basic_type(*sig.get(2)?) {
                    return None;
                }
                let value = complete_type(sig.get(3..)?, arrays + 1, structs + 1)?;
                match sig.get(3 + value) {
                    Some(b'}') => Some(4 + value),
                    _ => None,
                }
            } else {
                Some(1 + complete_type(&sig[1..], arrays + 1, structs)?)
            }
        }
        b'(' => {
            if structs >= MAX_STRUCT_DEPTH {
                return None;
            }
            let mut pos = 1;
            while *sig.get(pos)? != b')' {
                pos += complete_type(&sig[pos..], arrays, structs + 1)?;
            }
            if pos == 1 {
                None
            } else {
                Some(pos + 1)
            }
        }
        _ => None,
    }
}

/// Length in bytes of the complete type starting at the front of `sig`.
pub fn single_type_len(sig: &str) -> Option<usize> {
    complete_type(sig.as_bytes(), 0, 0)
}

/// Split a signature into its complete types. `None` if it is malformed.
pub fn split_signature(sig: &str) -> Option<Vec<&str>> {
    if sig.len() > MAX_SIGNATURE_LENGTH {
        return None;
    }
    let mut out = Vec::new();
    let mut rest = sig;
    while !rest.is_empty() {
        let n = single_type_len(rest)?;
        out.push(&rest[..n]);
        rest = &rest[n..];
    }
    Some(out)
}

/// Zero or more complete types, back to back, with nothing left over.
pub fn is_valid_signature(sig: &str) -> bool {
    split_signature(sig).is_some()
}

/// Exactly one complete type.
pub fn is_valid_single_signature(sig: &str) -> bool {
    sig.len() <= MAX_SIGNATURE_LENGTH && single_type_len(sig) == Some(sig.len())
}

fn check(
    value: &str,
    policy: AllowEmpty,
    valid: fn(&str) -> bool,
    kind: ErrorKind,
    what: &str,
) -> Result<()> {
    if value.is_empty() {
        return match policy {
            AllowEmpty::EmptyAllowed => Ok(()),
            AllowEmpty::EmptyNotAllowed => Err(Error::new(kind, format!("{} cannot be empty", what))),
        };
    }
    if valid(value) {
        Ok(())
    } else {
        Err(Error::new(kind, format!("Invalid {}: {}", what.to_lowercase(), value)))
    }
}

pub fn check_bus_name(name: &str, policy: AllowEmpty) -> Result<()> {
    check(name, policy, is_valid_bus_name, ErrorKind::InvalidService, "Service name")
}

pub fn check_object_path(path: &str, policy: AllowEmpty) -> Result<()> {
    check(path, policy, is_valid_object_path, ErrorKind::InvalidObjectPath, "Object path")
}

pub fn check_interface_name(name: &str, policy: AllowEmpty) -> Result<()> {
    check(name, policy, is_valid_interface_name, ErrorKind::InvalidInterface, "Interface name")
}

pub fn check_member_name(name: &str, policy: AllowEmpty) -> Result<()> {
    check(name, policy, is_valid_member_name, ErrorKind::InvalidMember, "Member name")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_names() {
        for good in [
            "org.example.Foo",
            "org.example.Foo-Bar",
            "com.example._private",
            "single",
            ":1.42",
            ":1.42.a-b",
        ] {
            assert!(is_valid_bus_name(good), "{good}");
        }
        for bad in [
            "",
            "org..example",
            ".org.example",
            "org.example.",
            "org.9example",
            "org.ex ample",
            "org.exa$mple",
            ":",
            ":1..2",
        ] {
            assert!(!is_valid_bus_name(bad), "{bad}");
        }
    }

    #[test]
    fn bus_name_length_boundary() {
        let at_limit = format!("a.{}", "b".repeat(MAX_NAME_LENGTH - 2));
        assert_eq!(at_limit.len(), 255);
        assert!(is_valid_bus_name(&at_limit));
        let over = format!("a.{}", "b".repeat(MAX_NAME_LENGTH - 1));
        assert_eq!(over.len(), 256);
        assert!(!is_valid_bus_name(&over));
    }

    #[test]
    fn unique_names() {
        assert!(is_valid_unique_connection_name(":1.5"));
        assert!(is_valid_unique_connection_name(":1.5-x.9"));
        assert!(!is_valid_unique_connection_name("org.example"));
        assert!(!is_valid_unique_connection_name(":1."));
    }

    #[test]
    fn object_paths() {
        for good in ["/", "/obj", "/org/example/Obj_1", "/a/b/c"] {
            assert!(is_valid_object_path(good), "{good}");
        }
        for bad in ["", "not-absolute", "obj", "/obj/", "//", "/a//b", "/a-b", "/a.b"] {
            assert!(!is_valid_object_path(bad), "{bad}");
        }
    }

    #[test]
    fn interface_and_member_names() {
        assert!(is_valid_interface_name("org.example.Iface"));
        assert!(is_valid_interface_name("a.b"));
        assert!(!is_valid_interface_name("single"));
        assert!(!is_valid_interface_name("org.9example"));
        assert!(!is_valid_interface_name("org.ex-ample"));
        assert!(!is_valid_interface_name("org..example"));
        assert!(is_valid_error_name("org.freedesktop.DBus.Error.Failed"));

        assert!(is_valid_member_name("Method"));
        assert!(is_valid_member_name("_get_2"));
        assert!(!is_valid_member_name(""));
        assert!(!is_valid_member_name("2fast"));
        assert!(!is_valid_member_name("a.b"));
        assert!(!is_valid_member_name(&"m".repeat(256)));
        assert!(is_valid_member_name(&"m".repeat(255)));
    }

    #[test]
    fn signatures() {
        let cases = [
            ("", true, false),
            ("i", true, true),
            ("ii", true, false),
            ("a{sv}", true, true),
            ("a{is}", true, true),
            ("a{s", false, false),
            ("a{vs}", false, false),
            ("a{(i)s}", false, false),
            ("{sv}", false, false),
            ("a", false, false),
            ("()", false, false),
            ("(i", false, false),
            ("(ii)", true, true),
            ("a(sa{sv})", true, true),
            ("aai", true, true),
            ("v", true, true),
            ("sv", true, false),
            ("z", false, false),
            ("a{sv}i", true, false),
        ];
        for (sig, valid, single) in cases {
            assert_eq!(is_valid_signature(sig), valid, "is_valid_signature({sig:?})");
            assert_eq!(is_valid_single_signature(sig), single, "is_valid_single_signature({sig:?})");
        }
    }

    #[test]
    fn signature_depth_limits() {
        let deep_ok = format!("{}i", "a".repeat(32));
        assert!(is_valid_single_signature(&deep_ok));
        let too_deep = format!("{}i", "a".repeat(33));
        assert!(!is_valid_single_signature(&too_deep));
        let structs = format!("{}i{}", "(".repeat(33), ")".repeat(33));
        assert!(!is_valid_signature(&structs));
    }

    #[test]
    fn split() {
        assert_eq!(split_signature("ia{sv}(ss)"), Some(vec!["i", "a{sv}", "(ss)"]));
        assert_eq!(split_signature("i{"), None);
    }

    #[test]
    fn check_policies() {
        assert!(check_bus_name("", AllowEmpty::EmptyAllowed).is_ok());
        let e = check_bus_name("", AllowEmpty::EmptyNotAllowed).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidService);
        let e = check_object_path("not-absolute", AllowEmpty::EmptyAllowed).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidObjectPath);
        assert!(e.message().contains("not-absolute"));
        let e = check_interface_name("bad", AllowEmpty::EmptyAllowed).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidInterface);
        assert!(check_member_name("Ok", AllowEmpty::EmptyNotAllowed).is_ok());
    }
}
