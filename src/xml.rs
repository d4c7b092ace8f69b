// This code is based on zbus::xml, but it has been significantly
// modified

use anyhow::Result;
use serde_xml_rs::from_str;

macro_rules! get_vec {
    ($vec:expr, $kind:path) => {
        $vec.iter()
            .filter_map(|e| if let $kind(m) = e { Some(m) } else { None })
            .collect()
    };
}

/// Annotations are generic key/value pairs of metadata.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}

/// An argument
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Arg {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub typ: String,
    pub direction: Option<String>,
    #[serde(rename = "annotation", default)]
    pub annotations: Vec<Annotation>,
}

impl Arg {
    /// Method arguments default to "in", signal arguments are always "out".
    pub fn is_output(&self) -> bool {
        self.direction.as_deref() == Some("out")
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
enum MemberElement {
    Arg(Arg),
    Annotation(Annotation),
}

/// A method or a signal
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Member {
    pub name: String,

    #[serde(rename = "$value", default)]
    elems: Vec<MemberElement>,
}

impl Member {
    pub fn args(&self) -> Vec<&Arg> {
        get_vec!(self.elems, MemberElement::Arg)
    }

    pub fn annotations(&self) -> Vec<&Annotation> {
        get_vec!(self.elems, MemberElement::Annotation)
    }
}

/// A property
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Property {
    pub name: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub access: String,
    #[serde(rename = "annotation", default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
enum InterfaceElement {
    Method(Member),
    Signal(Member),
    Property(Property),
    Annotation(Annotation),
}

/// An interface
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Interface {
    pub name: String,

    #[serde(rename = "$value", default)]
    elems: Vec<InterfaceElement>,
}

impl Interface {
    pub fn methods(&self) -> Vec<&Member> {
        get_vec!(self.elems, InterfaceElement::Method)
    }

    pub fn signals(&self) -> Vec<&Member> {
        get_vec!(self.elems, InterfaceElement::Signal)
    }

    pub fn properties(&self) -> Vec<&Property> {
        get_vec!(self.elems, InterfaceElement::Property)
    }

    pub fn annotations(&self) -> Vec<&Annotation> {
        get_vec!(self.elems, InterfaceElement::Annotation)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
enum NodeElement {
    Node(Node),
    Interface(Interface),
}

/// A node in the introspection tree
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Node {
    pub name: Option<String>,

    #[serde(rename = "$value", default)]
    elems: Vec<NodeElement>,
}

impl Node {
    /// Returns the interfaces on this node.
    pub fn interfaces(&self) -> Vec<&Interface> {
        get_vec!(self.elems, NodeElement::Interface)
    }
}

impl std::str::FromStr for Node {
    type Err = anyhow::Error;

    /// Parse the introspection XML document from `s`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
<node name="/org/example/Obj">
  <interface name="org.example.Iface">
    <method name="Frobnicate">
      <arg name="what" type="s" direction="in"/>
      <arg name="count" type="i" direction="out"/>
      <annotation name="org.freedesktop.DBus.Method.NoReply" value="true"/>
    </method>
    <signal name="Changed">
      <arg name="value" type="v"/>
    </signal>
    <property name="Label" type="s" access="readwrite"/>
  </interface>
  <node name="child"/>
</node>
"#;

    #[test]
    fn parses_members() {
        let node: Node = DOC.parse().unwrap();
        assert_eq!(node.name.as_deref(), Some("/org/example/Obj"));
        let ifaces = node.interfaces();
        assert_eq!(ifaces.len(), 1);
        let iface = ifaces[0];
        assert_eq!(iface.name, "org.example.Iface");

        let methods = iface.methods();
        assert_eq!(methods.len(), 1);
        let args = methods[0].args();
        assert_eq!(args.len(), 2);
        assert!(!args[0].is_output());
        assert!(args[1].is_output());
        assert_eq!(methods[0].annotations()[0].value, "true");

        assert_eq!(iface.signals()[0].args()[0].typ, "v");
        let props = iface.properties();
        assert_eq!(props[0].access, "readwrite");
    }
}
