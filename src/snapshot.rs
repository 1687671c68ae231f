//! Configuration snapshots.
//!
//! A controller's configuration is a tree of named nodes. Block nodes carry
//! an optional argument list plus children (`CRATE("main") { ... }`), scalar
//! nodes carry a list of values (`threshold = (0x10, 0x10, 0x20)`). Every node
//! remembers whether the running readout actually consumed it ("touched").
//!
//! Besides the tree, a snapshot can be viewed as an ordered mapping from
//! hierarchical keys to values. Keys are lower-cased node names joined by
//! `.`, and block segments carry their ordinal among same-named siblings:
//!
//! ```text
//! crate.0                        = "main"
//! crate.0.caen_v775.0            = 0x00010000
//! crate.0.caen_v775.0.threshold  = (0x10, 0x10)
//! ```

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deepest configuration tree that can cross the wire, counting top-level
/// nodes as level 1.
pub const MAX_CONFIG_DEPTH: usize = 64;

/// Node flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigKind {
    /// `name = value(s)`
    Scalar,
    /// `name(args) { children }`
    Block,
}

/// A single configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    /// `()`
    Empty,
    /// Floating point value with an optional unit.
    Double {
        /// Numeric value.
        value: f64,
        /// Unit symbol, empty if dimensionless.
        unit: String,
    },
    /// Integer value with an optional unit.
    Integer {
        /// Numeric value.
        value: i32,
        /// Unit symbol, empty if dimensionless.
        unit: String,
    },
    /// A configuration keyword, e.g. `true` or `ECL`.
    Keyword(String),
    /// Inclusive channel range `first..last`.
    Range {
        /// First element.
        first: u8,
        /// Last element.
        last: u8,
    },
    /// Quoted string.
    String(String),
}

impl ScalarValue {
    /// Dimensionless integer.
    #[must_use]
    pub fn int(value: i32) -> Self {
        Self::Integer {
            value,
            unit: String::new(),
        }
    }

    /// Keyword value.
    pub fn keyword(word: impl Into<String>) -> Self {
        Self::Keyword(word.into())
    }

    /// String value.
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "()"),
            Self::Double { value, unit } => {
                write!(f, "{value:.6}")?;
                if !unit.is_empty() {
                    write!(f, " {unit}")?;
                }
                Ok(())
            }
            Self::Integer { value, unit } => {
                // Hex width follows magnitude.
                let u = *value as u32;
                if u < 0x100 {
                    write!(f, "0x{u:02x}")?;
                } else if u < 0x1_0000 {
                    write!(f, "0x{u:04x}")?;
                } else {
                    write!(f, "0x{u:08x}")?;
                }
                if !unit.is_empty() {
                    write!(f, " {unit}")?;
                }
                Ok(())
            }
            Self::Keyword(word) => f.write_str(word),
            Self::Range { first, last } => write!(f, "{first}..{last}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

/// A value together with its position in the node's value vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigScalar {
    /// Position in the value vector.
    pub vector_index: u16,
    /// The value.
    pub value: ScalarValue,
}

/// One node of the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigNode {
    /// Node name as written in the configuration.
    pub name: String,
    /// Scalar or block.
    pub kind: ConfigKind,
    /// Whether the readout consumed this node.
    pub touched: bool,
    /// Position among earlier same-named sibling blocks, see [`number_blocks`].
    pub ordinal: u16,
    /// Values (scalars) or arguments (blocks).
    pub values: Vec<ConfigScalar>,
    /// Children, blocks only.
    pub children: Vec<ConfigNode>,
}

impl ConfigNode {
    /// Scalar node; vector indices are assigned in order.
    pub fn scalar(name: impl Into<String>, values: impl IntoIterator<Item = ScalarValue>) -> Self {
        Self {
            name: name.into(),
            kind: ConfigKind::Scalar,
            touched: true,
            ordinal: 0,
            values: indexed(values),
            children: Vec::new(),
        }
    }

    /// Block node with arguments and children.
    pub fn block(
        name: impl Into<String>,
        args: impl IntoIterator<Item = ScalarValue>,
        children: Vec<ConfigNode>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ConfigKind::Block,
            touched: true,
            ordinal: 0,
            values: indexed(args),
            children,
        }
    }

    /// Marks the node as not consumed by the readout.
    #[must_use]
    pub fn untouched(mut self) -> Self {
        self.touched = false;
        self
    }

    /// Plain values without vector indices.
    pub fn scalar_values(&self) -> impl Iterator<Item = &ScalarValue> {
        self.values.iter().map(|s| &s.value)
    }

    /// Applies `f` to this node and all descendants.
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut ConfigNode)) {
        f(self);
        for child in &mut self.children {
            child.visit_mut(f);
        }
    }

    fn count_leaves(&self) -> usize {
        match self.kind {
            ConfigKind::Scalar => 1,
            ConfigKind::Block => self.children.iter().map(Self::count_leaves).sum(),
        }
    }
}

/// Numbers blocks by their position among same-named siblings, recursively.
///
/// Must run on the complete tree: the numbers become part of the flattened
/// keys and stay put when a prefix filter later drops siblings.
pub fn number_blocks(nodes: &mut [ConfigNode]) {
    let mut seen: HashMap<String, u16> = HashMap::new();
    for node in nodes.iter_mut() {
        if node.kind == ConfigKind::Block {
            let count = seen.entry(node.name.to_ascii_lowercase()).or_insert(0);
            node.ordinal = *count;
            *count = count.saturating_add(1);
            number_blocks(&mut node.children);
        }
    }
}

/// Number of levels in `nodes`, without recursing.
#[must_use]
pub fn tree_depth(nodes: &[ConfigNode]) -> usize {
    let mut deepest = 0;
    let mut pending = vec![(nodes, 1)];
    while let Some((level, depth)) = pending.pop() {
        if level.is_empty() {
            continue;
        }
        deepest = deepest.max(depth);
        for node in level {
            pending.push((&node.children, depth + 1));
        }
    }
    deepest
}

// Lists past `u16::MAX` saturate here; the encoder refuses them anyway.
fn indexed(values: impl IntoIterator<Item = ScalarValue>) -> Vec<ConfigScalar> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, value)| ConfigScalar {
            vector_index: u16::try_from(i).unwrap_or(u16::MAX),
            value,
        })
        .collect()
}

/// One row of the flattened view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfigEntry<'a> {
    /// Hierarchical key.
    pub key: &'a str,
    /// Node flavour.
    pub kind: ConfigKind,
    /// Whether the readout consumed the node.
    pub touched: bool,
    /// Values, or block arguments.
    pub values: &'a [ConfigScalar],
}

/// Point-in-time dump of a controller's configuration tree.
///
/// Produced whole by one request and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    captured_at: DateTime<Utc>,
    prefix: Option<String>,
    nodes: Vec<ConfigNode>,
    #[serde(skip)]
    keys: Vec<(String, Vec<usize>)>,
}

impl ConfigSnapshot {
    /// Takes a copy of the complete tree: numbers its blocks, then applies
    /// the prefix filter, if any.
    #[must_use]
    pub fn capture(
        captured_at: DateTime<Utc>,
        prefix: Option<String>,
        mut tree: Vec<ConfigNode>,
    ) -> Self {
        number_blocks(&mut tree);
        let nodes = match prefix.as_deref() {
            Some(p) => filter_prefix(&tree, p),
            None => tree,
        };
        Self::new(captured_at, prefix, nodes)
    }

    /// Wraps an already numbered (and possibly filtered) tree.
    #[must_use]
    pub fn new(captured_at: DateTime<Utc>, prefix: Option<String>, nodes: Vec<ConfigNode>) -> Self {
        let mut keys = Vec::new();
        flatten(&nodes, "", &mut Vec::new(), &mut keys);
        Self {
            captured_at,
            prefix,
            nodes,
            keys,
        }
    }

    /// Controller time at which the tree was captured.
    #[must_use]
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Prefix filter the snapshot was requested with.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Top-level nodes.
    #[must_use]
    pub fn nodes(&self) -> &[ConfigNode] {
        &self.nodes
    }

    /// Flattened view, in tree order.
    pub fn entries(&self) -> impl Iterator<Item = ConfigEntry<'_>> {
        self.keys.iter().filter_map(|(key, path)| {
            let node = resolve(&self.nodes, path)?;
            Some(ConfigEntry {
                key,
                kind: node.kind,
                touched: node.touched,
                values: &node.values,
            })
        })
    }

    /// All hierarchical keys, in tree order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(k, _)| k.as_str())
    }

    /// Values of the node at `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[ConfigScalar]> {
        let (_, path) = self.keys.iter().find(|(k, _)| k == key)?;
        resolve(&self.nodes, path).map(|n| n.values.as_slice())
    }

    /// Number of scalar leaves.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.iter().map(ConfigNode::count_leaves).sum()
    }

    /// Returns `true` if the snapshot has no scalar leaves.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders the flattened view, one `key = values` line per entry.
    #[must_use]
    pub fn to_flat_string(&self) -> String {
        let mut out = String::new();
        for entry in self.entries() {
            if entry.kind == ConfigKind::Block && entry.values.is_empty() {
                continue;
            }
            out.push_str(entry.key);
            if !entry.touched {
                out.push('*');
            }
            out.push_str(" = ");
            out.push_str(&format_values(entry.values, false));
            out.push('\n');
        }
        out
    }
}

fn flatten(
    nodes: &[ConfigNode],
    parent: &str,
    path: &mut Vec<usize>,
    out: &mut Vec<(String, Vec<usize>)>,
) {
    for (i, node) in nodes.iter().enumerate() {
        let key = node_key(parent, node);
        path.push(i);
        out.push((key.clone(), path.clone()));
        if node.kind == ConfigKind::Block {
            flatten(&node.children, &key, path, out);
        }
        path.pop();
    }
}

fn node_key(parent: &str, node: &ConfigNode) -> String {
    let name = node.name.to_ascii_lowercase();
    let segment = match node.kind {
        ConfigKind::Scalar => name,
        ConfigKind::Block => format!("{name}.{}", node.ordinal),
    };
    if parent.is_empty() {
        segment
    } else {
        format!("{parent}.{segment}")
    }
}

fn resolve<'a>(nodes: &'a [ConfigNode], path: &[usize]) -> Option<&'a ConfigNode> {
    let (first, rest) = path.split_first()?;
    let node = nodes.get(*first)?;
    if rest.is_empty() {
        Some(node)
    } else {
        resolve(&node.children, rest)
    }
}

/// Prunes a numbered tree to the nodes whose flattened key starts with
/// `prefix`.
///
/// Matching blocks are kept whole; non-matching blocks are kept only as
/// ancestors of matching descendants. An empty prefix keeps everything.
#[must_use]
pub fn filter_prefix(nodes: &[ConfigNode], prefix: &str) -> Vec<ConfigNode> {
    if prefix.is_empty() {
        return nodes.to_vec();
    }
    let prefix = prefix.to_ascii_lowercase();
    filter_level(nodes, "", &prefix)
}

fn filter_level(nodes: &[ConfigNode], parent: &str, prefix: &str) -> Vec<ConfigNode> {
    let mut kept = Vec::new();
    for node in nodes {
        let key = node_key(parent, node);
        if key.starts_with(prefix) {
            kept.push(node.clone());
        } else if node.kind == ConfigKind::Block && prefix.starts_with(&format!("{key}.")) {
            let children = filter_level(&node.children, &key, prefix);
            if !children.is_empty() {
                kept.push(ConfigNode {
                    children,
                    ..node.clone()
                });
            }
        }
    }
    kept
}

fn format_values(values: &[ConfigScalar], force_parens: bool) -> String {
    let body = values
        .iter()
        .map(|s| s.value.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if values.len() > 1 || force_parens {
        format!("({body})")
    } else {
        body
    }
}

fn write_nodes(f: &mut fmt::Formatter<'_>, nodes: &[ConfigNode], level: usize) -> fmt::Result {
    for node in nodes {
        let indent = "\t".repeat(level);
        write!(f, "{indent}{}", node.name)?;
        if !node.touched {
            write!(f, "*")?;
        }
        match node.kind {
            ConfigKind::Block => {
                writeln!(f, "{} {{", format_values(&node.values, true))?;
                write_nodes(f, &node.children, level + 1)?;
                writeln!(f, "{indent}}}")?;
            }
            ConfigKind::Scalar => {
                writeln!(f, " = {}", format_values(&node.values, false))?;
            }
        }
    }
    Ok(())
}

impl fmt::Display for ConfigSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_nodes(f, &self.nodes, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Vec<ConfigNode> {
        vec![
            ConfigNode::block(
                "CRATE",
                [ScalarValue::string("main")],
                vec![
                    ConfigNode::scalar("acvt", [ScalarValue::int(500)]),
                    ConfigNode::block(
                        "CAEN_V775",
                        [ScalarValue::int(0x0001_0000)],
                        vec![ConfigNode::scalar(
                            "threshold",
                            [ScalarValue::int(16), ScalarValue::int(32)],
                        )],
                    ),
                    ConfigNode::block(
                        "CAEN_V775",
                        [ScalarValue::int(0x0002_0000)],
                        vec![ConfigNode::scalar("threshold", [ScalarValue::int(8)]).untouched()],
                    ),
                ],
            ),
            ConfigNode::scalar("log_level", [ScalarValue::keyword("info")]),
        ]
    }

    #[test]
    fn flattened_keys_follow_tree_order() {
        let snap = ConfigSnapshot::capture(Utc::now(), None, tree());
        let keys: Vec<&str> = snap.keys().collect();
        assert_eq!(
            keys,
            vec![
                "crate.0",
                "crate.0.acvt",
                "crate.0.caen_v775.0",
                "crate.0.caen_v775.0.threshold",
                "crate.0.caen_v775.1",
                "crate.0.caen_v775.1.threshold",
                "log_level",
            ]
        );
        assert_eq!(snap.len(), 4);
        let threshold = snap.get("crate.0.caen_v775.1.threshold").unwrap();
        assert_eq!(threshold[0].value, ScalarValue::int(8));
    }

    #[test]
    fn prefix_filter_keeps_ancestors() {
        let mut full = tree();
        number_blocks(&mut full);
        let filtered = filter_prefix(&full, "crate.0.caen_v775.1");
        assert_eq!(filtered.len(), 1);
        let crate_node = &filtered[0];
        assert_eq!(crate_node.name, "CRATE");
        assert_eq!(crate_node.children.len(), 1);
        assert_eq!(crate_node.children[0].values[0].value, ScalarValue::int(0x0002_0000));

        let snap = ConfigSnapshot::capture(Utc::now(), Some("crate.0.caen_v775.1".into()), tree());
        assert_eq!(snap.len(), 1);
        // The surviving block keeps its key from the full tree.
        let keys: Vec<&str> = snap.keys().collect();
        assert_eq!(
            keys,
            vec![
                "crate.0",
                "crate.0.caen_v775.1",
                "crate.0.caen_v775.1.threshold"
            ]
        );
    }

    #[test]
    fn numbering_counts_names_per_level() {
        let mut nodes = tree();
        nodes.push(ConfigNode::block("crate", [], vec![]));
        number_blocks(&mut nodes);
        assert_eq!(nodes[0].ordinal, 0);
        assert_eq!(nodes[2].ordinal, 1);
        assert_eq!(nodes[0].children[1].ordinal, 0);
        assert_eq!(nodes[0].children[2].ordinal, 1);
    }

    #[test]
    fn every_key_selects_itself_as_prefix() {
        let full = ConfigSnapshot::capture(Utc::now(), None, tree());
        for key in full.keys() {
            let filtered = ConfigSnapshot::capture(Utc::now(), Some(key.to_string()), tree());
            assert!(filtered.keys().any(|k| k == key), "{key} lost by its own filter");
            assert!(filtered.keys().all(|k| k.starts_with(key) || key.starts_with(k)));
            assert_eq!(filtered.get(key), full.get(key));
        }
    }

    #[test]
    fn depth_counts_levels() {
        assert_eq!(tree_depth(&[]), 0);
        assert_eq!(tree_depth(&tree()), 3);

        let mut chain = vec![ConfigNode::block("b", [], vec![])];
        for _ in 1..200 {
            chain = vec![ConfigNode::block("b", [], chain)];
        }
        assert_eq!(tree_depth(&chain), 200);
    }

    #[test]
    fn prefix_filter_without_match_is_empty() {
        assert!(filter_prefix(&tree(), "nope").is_empty());
        assert_eq!(filter_prefix(&tree(), "").len(), 2);
        assert_eq!(filter_prefix(&tree(), "LOG").len(), 1);
    }

    #[test]
    fn render_tree_and_flat() {
        let snap = ConfigSnapshot::capture(Utc::now(), None, tree());
        let text = snap.to_string();
        assert!(text.starts_with("CRATE(\"main\") {\n"));
        assert!(text.contains("\t\tthreshold = (0x10, 0x20)\n"));
        assert!(text.contains("\t\tthreshold* = 0x08\n"));

        let flat = snap.to_flat_string();
        assert!(flat.contains("crate.0.caen_v775.0 = 0x00010000\n"));
        assert!(flat.contains("log_level = info\n"));
    }

    #[test]
    fn integer_formatting_tracks_magnitude() {
        assert_eq!(ScalarValue::int(0x12).to_string(), "0x12");
        assert_eq!(ScalarValue::int(0x1234).to_string(), "0x1234");
        assert_eq!(ScalarValue::int(-1).to_string(), "0xffffffff");
        let timed = ScalarValue::Double {
            value: 1.5,
            unit: "us".into(),
        };
        assert_eq!(timed.to_string(), "1.500000 us");
    }
}
