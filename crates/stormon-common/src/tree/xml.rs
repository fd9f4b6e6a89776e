use super::Node;
use crate::error::{PollError, Result};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

fn parse_err(e: impl std::fmt::Display) -> PollError {
    PollError::Parse(e.to_string())
}

fn start_node(start: &BytesStart<'_>) -> Result<Node> {
    let mut node = Node::new(&String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(parse_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value().map_err(parse_err)?;
        node.attrs.push((key, value.to_string()));
    }
    Ok(node)
}

fn attach(stack: &mut [Node], root: &mut Option<Node>, node: Node) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => *root = Some(node),
    }
}

/// Parses an XML document into a tree. Whitespace-only text is dropped.
pub fn load_xml(data: &[u8]) -> Result<Node> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_err)? {
            Event::Start(e) => stack.push(start_node(&e)?),
            Event::Empty(e) => {
                let node = start_node(&e)?;
                attach(&mut stack, &mut root, node);
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| PollError::Parse("unbalanced closing tag".to_string()))?;
                attach(&mut stack, &mut root, node);
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.content.push_str(&t.unescape().map_err(parse_err)?);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.content.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(PollError::Parse("unexpected end of document".to_string()));
    }
    root.ok_or_else(|| PollError::Parse("empty XML document".to_string()))
}

/// Serializes a tree as XML without a declaration.
pub fn to_xml(node: &Node) -> String {
    let mut out = String::new();
    write_node(node, &mut out);
    out
}

fn write_node(node: &Node, out: &mut String) {
    out.push('<');
    out.push_str(&node.name);
    for (k, v) in &node.attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&escape(v.as_str()));
        out.push('"');
    }
    if node.children.is_empty() && node.content.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    out.push_str(&escape(node.content.as_str()));
    for child in &node.children {
        write_node(child, out);
    }
    out.push_str("</");
    out.push_str(&node.name);
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_response_with_attributes() {
        let body = br#"<?xml version='1.0' encoding='UTF-8' ?>
<netapp version='1.3' xmlns='http://www.netapp.com/filer/admin'>
  <results status="passed">
    <attributes-list>
      <volume-attributes><name>vol&amp;1</name></volume-attributes>
    </attributes-list>
    <next-tag>abc</next-tag>
    <num-records>1</num-records>
  </results>
</netapp>"#;
        let root = load_xml(body).unwrap();
        assert_eq!(root.name, "netapp");
        let results = root.child("results").unwrap();
        assert_eq!(results.attr("status"), Some("passed"));
        assert_eq!(results.child_content("next-tag"), "abc");
        assert_eq!(
            results.path_content("attributes-list.volume-attributes.name"),
            "vol&1"
        );
    }

    #[test]
    fn should_serialize_and_escape() {
        let mut req = Node::new("volume-get-iter");
        req.set_attr("xmlns", "urn:x");
        req.new_child("max-records", "500");
        req.new_child("query", "").new_child("name", "a<b");
        req.new_child("empty", "");
        assert_eq!(
            to_xml(&req),
            "<volume-get-iter xmlns=\"urn:x\"><max-records>500</max-records><query><name>a&lt;b</name></query><empty/></volume-get-iter>"
        );
        let again = load_xml(to_xml(&req).as_bytes()).unwrap();
        assert_eq!(again, req);
    }

    #[test]
    fn should_fail_on_truncated_document() {
        assert!(load_xml(b"<netapp><results>").is_err());
    }
}
