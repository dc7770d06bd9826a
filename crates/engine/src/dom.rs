//! DOM snapshot parser
//!
//! Turns a serialized page snapshot into a queryable element tree. Parsing
//! is best-effort: unclosed tags are auto-closed, stray close tags are
//! skipped, comments and doctype are ignored. The only hard failure is a
//! snapshot above the size bound, which is rejected outright rather than
//! silently truncated so the caller can decide to re-capture.

use selfheal_common::{Error, Result};
use std::collections::BTreeMap;

/// Maximum accepted snapshot size: 2 MiB
pub const MAX_SNAPSHOT_BYTES: usize = 2 * 1024 * 1024;

/// Elements that never have children and need no close tag
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// A single element in the parsed snapshot
#[derive(Debug, Clone)]
pub struct DomNode {
    /// Pre-order index in the tree; doubles as document position
    pub index: usize,
    pub parent: Option<usize>,
    pub tag: String,
    pub id: Option<String>,
    /// Ordered, deduplicated class list
    pub classes: Vec<String>,
    pub attrs: BTreeMap<String, String>,
    /// Direct text content, whitespace-collapsed
    pub text: String,
    pub depth: usize,
    /// Position among the parent's element children
    pub sibling_index: usize,
    pub children: Vec<usize>,
}

impl DomNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|s| s.as_str())
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }
}

/// Parsed element tree. Nodes are stored in document (pre-order) order.
#[derive(Debug, Clone, Default)]
pub struct DomTree {
    nodes: Vec<DomNode>,
}

impl DomTree {
    /// Parse a serialized markup snapshot.
    ///
    /// Never fails on malformed markup; only on inputs above
    /// [`MAX_SNAPSHOT_BYTES`].
    pub fn parse(snapshot: &str) -> Result<DomTree> {
        if snapshot.len() > MAX_SNAPSHOT_BYTES {
            return Err(Error::SnapshotTooLarge {
                size: snapshot.len(),
                limit: MAX_SNAPSHOT_BYTES,
            });
        }

        let mut parser = Parser::new(snapshot);
        parser.run();
        Ok(DomTree {
            nodes: parser.nodes,
        })
    }

    pub fn nodes(&self) -> &[DomNode] {
        &self.nodes
    }

    pub fn get(&self, index: usize) -> Option<&DomNode> {
        self.nodes.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Root path of a node: one `tag[i]` segment per ancestor, i being the
    /// sibling index. Stable across identical snapshots.
    pub fn path(&self, index: usize) -> Vec<String> {
        let mut segments = Vec::new();
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            let node = &self.nodes[i];
            segments.push(format!("{}[{}]", node.tag, node.sibling_index));
            cursor = node.parent;
        }
        segments.reverse();
        segments
    }

    /// Count elements carrying every class in `classes`. Used to check
    /// whether a class combination uniquely identifies one element.
    pub fn count_with_classes(&self, classes: &[String]) -> usize {
        if classes.is_empty() {
            return 0;
        }
        self.nodes
            .iter()
            .filter(|n| classes.iter().all(|c| n.has_class(c)))
            .count()
    }
}

/// Hand-rolled tolerant markup parser. Kept deliberately small: it only
/// needs to recover tags, attributes, and direct text for scoring.
struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<DomNode>,
    /// Open element stack (indices into nodes)
    stack: Vec<usize>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            nodes: Vec::new(),
            stack: Vec::new(),
        }
    }

    fn run(&mut self) {
        while self.pos < self.input.len() {
            if self.peek() == b'<' {
                if self.starts_with("<!--") {
                    self.skip_comment();
                } else if self.starts_with("</") {
                    self.close_tag();
                } else if self.starts_with("<!") || self.starts_with("<?") {
                    self.skip_until(b'>');
                } else if self
                    .input
                    .get(self.pos + 1)
                    .map(|c| c.is_ascii_alphabetic())
                    .unwrap_or(false)
                {
                    self.open_tag();
                } else {
                    // Lone '<' in text
                    self.append_text("<");
                    self.pos += 1;
                }
            } else {
                self.text_run();
            }
        }
        // Unclosed tags auto-close at end of input
        self.stack.clear();
    }

    fn peek(&self) -> u8 {
        self.input[self.pos]
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.input[self.pos..].starts_with(prefix.as_bytes())
    }

    fn skip_until(&mut self, byte: u8) {
        while self.pos < self.input.len() && self.input[self.pos] != byte {
            self.pos += 1;
        }
        if self.pos < self.input.len() {
            self.pos += 1;
        }
    }

    fn skip_comment(&mut self) {
        self.pos += 4;
        while self.pos < self.input.len() && !self.starts_with("-->") {
            self.pos += 1;
        }
        self.pos = (self.pos + 3).min(self.input.len());
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn read_name(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.input.len() {
            let c = self.input[self.pos];
            if c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b':' {
                self.pos += 1;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).to_lowercase()
    }

    fn open_tag(&mut self) {
        self.pos += 1; // consume '<'
        let tag = self.read_name();
        let mut attrs = BTreeMap::new();
        let mut self_closing = false;

        loop {
            self.skip_whitespace();
            if self.pos >= self.input.len() {
                break;
            }
            match self.peek() {
                b'>' => {
                    self.pos += 1;
                    break;
                }
                b'/' => {
                    self_closing = true;
                    self.pos += 1;
                }
                _ => {
                    let name = self.read_name();
                    if name.is_empty() {
                        // Junk byte inside the tag; skip it
                        self.pos += 1;
                        continue;
                    }
                    let value = self.read_attr_value();
                    attrs.entry(name).or_insert(value);
                }
            }
        }

        self.push_element(tag, attrs, self_closing);
    }

    fn read_attr_value(&mut self) -> String {
        self.skip_whitespace();
        if self.pos >= self.input.len() || self.peek() != b'=' {
            return String::new(); // boolean attribute
        }
        self.pos += 1;
        self.skip_whitespace();
        if self.pos >= self.input.len() {
            return String::new();
        }
        match self.peek() {
            q @ (b'"' | b'\'') => {
                self.pos += 1;
                let start = self.pos;
                while self.pos < self.input.len() && self.input[self.pos] != q {
                    self.pos += 1;
                }
                let value = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
                if self.pos < self.input.len() {
                    self.pos += 1;
                }
                decode_entities(&value)
            }
            _ => {
                let start = self.pos;
                while self.pos < self.input.len() {
                    let c = self.input[self.pos];
                    if c.is_ascii_whitespace() || c == b'>' || c == b'/' {
                        break;
                    }
                    self.pos += 1;
                }
                decode_entities(&String::from_utf8_lossy(&self.input[start..self.pos]))
            }
        }
    }

    fn push_element(&mut self, tag: String, mut attrs: BTreeMap<String, String>, self_closing: bool) {
        let parent = self.stack.last().copied();
        let depth = self.stack.len();
        let index = self.nodes.len();
        let sibling_index = match parent {
            Some(p) => self.nodes[p].children.len(),
            None => self
                .nodes
                .iter()
                .filter(|n| n.parent.is_none())
                .count(),
        };

        let id = attrs.remove("id").filter(|v| !v.is_empty());
        let classes = attrs
            .remove("class")
            .map(|v| {
                let mut seen = Vec::new();
                for c in v.split_ascii_whitespace() {
                    if !seen.iter().any(|s: &String| s == c) {
                        seen.push(c.to_string());
                    }
                }
                seen
            })
            .unwrap_or_default();

        let node = DomNode {
            index,
            parent,
            tag: tag.clone(),
            id,
            classes,
            attrs,
            text: String::new(),
            depth,
            sibling_index,
            children: Vec::new(),
        };
        if let Some(p) = parent {
            self.nodes[p].children.push(index);
        }
        self.nodes.push(node);

        let is_void = VOID_ELEMENTS.contains(&tag.as_str());
        if !self_closing && !is_void {
            self.stack.push(index);
            if tag == "script" || tag == "style" {
                self.skip_raw_text(&tag);
            }
        }
    }

    /// Consume raw text content of script/style without treating '<' as markup
    fn skip_raw_text(&mut self, tag: &str) {
        let close = format!("</{}", tag);
        while self.pos < self.input.len() && !self.starts_with(&close) {
            self.pos += 1;
        }
        // The close tag itself is handled by the main loop
    }

    fn close_tag(&mut self) {
        self.pos += 2; // consume '</'
        let tag = self.read_name();
        self.skip_until(b'>');

        // Pop to the nearest matching open element; a stray close tag with
        // no match on the stack is skipped.
        if let Some(at) = self
            .stack
            .iter()
            .rposition(|&i| self.nodes[i].tag == tag)
        {
            self.stack.truncate(at);
        }
    }

    fn text_run(&mut self) {
        let start = self.pos;
        while self.pos < self.input.len() && self.input[self.pos] != b'<' {
            self.pos += 1;
        }
        let raw = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        let decoded = decode_entities(&raw);
        self.append_text(&decoded);
    }

    fn append_text(&mut self, text: &str) {
        let Some(&current) = self.stack.last() else {
            return; // text outside any element
        };
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            return;
        }
        let node = &mut self.nodes[current];
        if !node.text.is_empty() {
            node.text.push(' ');
        }
        node.text.push_str(&collapsed);
    }
}

/// Decode the handful of entities that matter for text comparison
fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_structure() {
        let tree = DomTree::parse(
            r#"<html><body><div id="main" class="wrap outer">
                 <button data-testid="login-btn" class="btn btn">Login</button>
               </div></body></html>"#,
        )
        .unwrap();

        assert_eq!(tree.len(), 4);
        let button = tree.nodes().iter().find(|n| n.tag == "button").unwrap();
        assert_eq!(button.attr("data-testid"), Some("login-btn"));
        assert_eq!(button.text, "Login");
        assert_eq!(button.classes, vec!["btn"]); // deduped
        assert_eq!(button.depth, 3);

        let div = tree.get(button.parent.unwrap()).unwrap();
        assert_eq!(div.id.as_deref(), Some("main"));
        assert_eq!(div.classes, vec!["wrap", "outer"]);
    }

    #[test]
    fn auto_closes_unclosed_tags() {
        let tree = DomTree::parse("<div><span>one<p>two").unwrap();
        assert_eq!(tree.len(), 3);
        let p = tree.nodes().iter().find(|n| n.tag == "p").unwrap();
        assert_eq!(p.text, "two");
    }

    #[test]
    fn ignores_stray_close_and_comments() {
        let tree = DomTree::parse("<div></span><!-- note --><b>x</b></div>").unwrap();
        assert_eq!(tree.len(), 2);
        let b = tree.nodes().iter().find(|n| n.tag == "b").unwrap();
        assert_eq!(tree.get(b.parent.unwrap()).unwrap().tag, "div");
    }

    #[test]
    fn void_and_self_closing_elements_take_no_children() {
        let tree = DomTree::parse("<div><img src=\"a.png\"><br/><span>t</span></div>").unwrap();
        let span = tree.nodes().iter().find(|n| n.tag == "span").unwrap();
        assert_eq!(tree.get(span.parent.unwrap()).unwrap().tag, "div");
        assert_eq!(span.sibling_index, 2);
    }

    #[test]
    fn script_content_is_not_markup() {
        let tree =
            DomTree::parse("<div><script>if (a < b) { x(); }</script><p>after</p></div>").unwrap();
        assert!(tree.nodes().iter().any(|n| n.tag == "p"));
        assert_eq!(tree.nodes().iter().filter(|n| n.tag == "if").count(), 0);
    }

    #[test]
    fn paths_are_stable_and_preorder_holds() {
        let html = "<div><a>1</a><a>2</a></div>";
        let t1 = DomTree::parse(html).unwrap();
        let t2 = DomTree::parse(html).unwrap();
        let second_a = t1.nodes().iter().filter(|n| n.tag == "a").nth(1).unwrap();
        assert_eq!(t1.path(second_a.index), vec!["div[0]", "a[1]"]);
        assert_eq!(t1.path(second_a.index), t2.path(second_a.index));
        // Pre-order: parent index < child index
        for n in t1.nodes() {
            if let Some(p) = n.parent {
                assert!(p < n.index);
            }
        }
    }

    #[test]
    fn rejects_oversized_snapshot() {
        let big = format!("<div>{}</div>", "x".repeat(MAX_SNAPSHOT_BYTES));
        let err = DomTree::parse(&big).unwrap_err();
        assert!(matches!(err, Error::SnapshotTooLarge { .. }));
    }

    #[test]
    fn decodes_entities_in_text_and_attrs() {
        let tree =
            DomTree::parse(r#"<a title="a &amp; b">Fish &amp; Chips</a>"#).unwrap();
        let a = &tree.nodes()[0];
        assert_eq!(a.text, "Fish & Chips");
        assert_eq!(a.attr("title"), Some("a & b"));
    }

    #[test]
    fn count_with_classes_checks_whole_combination() {
        let tree = DomTree::parse(
            r#"<div class="card featured"></div><div class="card"></div>"#,
        )
        .unwrap();
        assert_eq!(tree.count_with_classes(&["card".into()]), 2);
        assert_eq!(
            tree.count_with_classes(&["card".into(), "featured".into()]),
            1
        );
        assert_eq!(tree.count_with_classes(&[]), 0);
    }
}
