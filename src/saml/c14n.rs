//! Exclusive XML Canonicalization 1.0 (without comments).
//!
//! Walks a [`roxmltree`] subtree. Namespace declarations are emitted only
//! where visibly utilized and not already in effect in the output, plus any
//! prefixes named in an `InclusiveNamespaces` list.

use std::collections::BTreeMap;

use roxmltree::{Node, NodeType};

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Canonicalize the subtree rooted at `node`.
///
/// `skip` names a node to omit together with its descendants (the enveloped
/// signature transform). `inclusive_prefixes` uses `#default` for the
/// default namespace.
pub fn canonicalize<'a, 'input>(
    node: Node<'a, 'input>,
    skip: Option<Node<'a, 'input>>,
    inclusive_prefixes: &[String],
) -> String {
    let mut out = String::new();
    let rendered = BTreeMap::new();
    render(node, skip, inclusive_prefixes, &rendered, &mut out);
    out
}

fn render<'a, 'input>(
    node: Node<'a, 'input>,
    skip: Option<Node<'a, 'input>>,
    inclusive_prefixes: &[String],
    rendered: &BTreeMap<String, String>,
    out: &mut String,
) {
    if Some(node) == skip {
        return;
    }

    match node.node_type() {
        NodeType::Element => {}
        NodeType::Text => {
            escape_text(node.text().unwrap_or(""), out);
            return;
        }
        // Comments and processing instructions.
        _ => return,
    }

    let scope: BTreeMap<String, String> = node
        .namespaces()
        .map(|ns| (ns.name().unwrap_or("").to_string(), ns.uri().to_string()))
        .collect();

    let prefix = element_prefix(node).unwrap_or("");
    let mut utilized: BTreeMap<String, String> = BTreeMap::new();
    utilized.insert(
        prefix.to_string(),
        node.tag_name().namespace().unwrap_or("").to_string(),
    );

    // (namespace, local, qualified name, value)
    let mut attributes: Vec<(&str, &str, String, &str)> = Vec::new();
    for attr in node.attributes() {
        let (namespace, qname) = match attr.namespace() {
            Some(XML_NAMESPACE) => (XML_NAMESPACE, format!("xml:{}", attr.name())),
            Some(uri) => {
                let attr_prefix = attribute_prefix(node, uri).unwrap_or("");
                utilized.insert(attr_prefix.to_string(), uri.to_string());
                (uri, format!("{attr_prefix}:{}", attr.name()))
            }
            None => ("", attr.name().to_string()),
        };
        attributes.push((namespace, attr.name(), qname, attr.value()));
    }
    attributes.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    for listed in inclusive_prefixes {
        let key = if listed == "#default" { "" } else { listed.as_str() };
        if let Some(uri) = scope.get(key) {
            utilized.entry(key.to_string()).or_insert_with(|| uri.clone());
        }
    }

    let mut now_rendered = rendered.clone();
    let mut declarations = Vec::new();
    for (declared, uri) in utilized {
        if declared == "xml" {
            continue;
        }
        let current = rendered.get(&declared);
        let needs_output = if declared.is_empty() && uri.is_empty() {
            // xmlns="" only to cancel a non-empty default already in the output.
            current.map(|c| !c.is_empty()).unwrap_or(false)
        } else {
            current != Some(&uri)
        };
        if needs_output {
            now_rendered.insert(declared.clone(), uri.clone());
            declarations.push((declared, uri));
        }
    }

    let name = if prefix.is_empty() {
        node.tag_name().name().to_string()
    } else {
        format!("{prefix}:{}", node.tag_name().name())
    };
    out.push('<');
    out.push_str(&name);
    for (declared, uri) in &declarations {
        if declared.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(declared);
            out.push_str("=\"");
        }
        escape_attribute(uri, out);
        out.push('"');
    }
    for (_, _, qname, value) in &attributes {
        out.push(' ');
        out.push_str(qname);
        out.push_str("=\"");
        escape_attribute(value, out);
        out.push('"');
    }
    out.push('>');

    for child in node.children() {
        render(child, skip, inclusive_prefixes, &now_rendered, out);
    }

    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}

/// The prefix the element was written with, read back from the source.
fn element_prefix<'a>(node: Node<'a, '_>) -> Option<&'a str> {
    let source = node.document().input_text().get(node.range())?;
    let qname = source
        .trim_start_matches('<')
        .split(|c: char| c.is_whitespace() || c == '/' || c == '>')
        .next()?;
    qname.split_once(':').map(|(prefix, _)| prefix)
}

/// A non-default prefix bound to `uri` in scope at `node`.
fn attribute_prefix<'a>(node: Node<'a, '_>, uri: &str) -> Option<&'a str> {
    node.namespaces()
        .filter(|ns| ns.uri() == uri)
        .find_map(|ns| ns.name())
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}
