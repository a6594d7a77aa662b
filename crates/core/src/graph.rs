//! Ordered DAG of named nodes with successor lists
//!
//! Built from a list of sub-graph S-expressions such as `"(A B (C D))"`,
//! meaning `A -> B`, `A -> C`, `C -> D`. Construction is two-pass: every
//! token encountered is first inserted as a node, then every successor
//! reference is validated against the resulting node set. Iteration
//! order is depth-first from the declared head nodes, each node visited
//! exactly once.

use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};

/// One node in the graph: the element name it refers to and its
/// successors, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct GraphNode {
    pub successors: Vec<String>,
}

/// An ordered DAG of named nodes, as built from a pipeline definition's
/// list of sub-graph S-expressions.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: HashMap<String, GraphNode>,
    /// Head nodes (first token of each sub-graph), in declaration order.
    heads: Vec<String>,
}

impl Graph {
    /// Build a graph from a list of sub-graph S-expression strings.
    ///
    /// Each sub-graph is parsed as a whitespace/parenthesis tree: the
    /// first token is the parent, and each subsequent sibling token (or
    /// nested `(...)` sub-tree) is a direct successor whose own children
    /// become *its* successors recursively. Duplicate node names across
    /// sub-graphs are allowed only as forward references — the first
    /// definition that gives a node explicit successors wins; later
    /// mentions of the same name with no children of their own are
    /// treated as references, not redefinitions.
    pub fn from_subgraphs(subgraphs: &[String]) -> Result<Self> {
        let mut nodes: HashMap<String, GraphNode> = HashMap::new();
        let mut heads = Vec::new();

        for (index, subgraph) in subgraphs.iter().enumerate() {
            let tree = parse_tree(subgraph)?;
            let head = tree
                .first()
                .ok_or_else(|| Error::Graph(format!("sub-graph #{index} is empty")))?;
            let head_name = head.name.clone();
            if !nodes.contains_key(&head_name) {
                nodes.insert(head_name.clone(), GraphNode::default());
            }
            heads.push(head_name);

            for token in &tree {
                insert_token(&mut nodes, token)?;
            }
        }

        validate_successors(&nodes)?;

        Ok(Graph { nodes, heads })
    }

    /// Head nodes, in declaration order.
    pub fn heads(&self) -> &[String] {
        &self.heads
    }

    /// Successors of a node, or an empty slice if the node has none.
    pub fn successors(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.successors.as_slice())
            .unwrap_or(&[])
    }

    /// All node names.
    pub fn node_names(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Depth-first iteration order from the heads, each node yielded
    /// exactly once (first visit wins).
    pub fn iter_order(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        for head in &self.heads {
            self.visit(head, &mut visited, &mut order);
        }
        order
    }

    fn visit(&self, name: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        if !visited.insert(name.to_string()) {
            return;
        }
        order.push(name.to_string());
        for successor in self.successors(name) {
            self.visit(successor, visited, order);
        }
    }
}

/// One node of a parsed sub-graph tree: its own name, plus the names of
/// its direct children (which become graph successors).
struct TreeNode {
    name: String,
    children: Vec<String>,
}

/// Parse a sub-graph expression like `"(A B (C D))"` into a flat list of
/// `TreeNode`s: the head plus every nested node, each carrying its own
/// direct children.
fn parse_tree(subgraph: &str) -> Result<Vec<TreeNode>> {
    let tokens = lex(subgraph)?;
    let mut pos = 0;
    let mut flat = Vec::new();
    parse_list(&tokens, &mut pos, &mut flat)?;
    if pos != tokens.len() {
        return Err(Error::Graph(format!(
            "trailing tokens after sub-graph: {subgraph}"
        )));
    }
    Ok(flat)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Open,
    Close,
    Atom(String),
}

fn lex(input: &str) -> Result<Vec<Tok>> {
    let mut tokens = Vec::new();
    for raw in input.split_whitespace() {
        let mut word = raw;
        while let Some(rest) = word.strip_prefix('(') {
            tokens.push(Tok::Open);
            word = rest;
        }
        let mut trailing_closes = 0;
        while let Some(rest) = word.strip_suffix(')') {
            trailing_closes += 1;
            word = rest;
        }
        if !word.is_empty() {
            tokens.push(Tok::Atom(word.to_string()));
        }
        for _ in 0..trailing_closes {
            tokens.push(Tok::Close);
        }
    }
    Ok(tokens)
}

/// Parse `(name child child (nested...))` starting at `*pos`, which must
/// point at the `Open` token. Appends every node encountered (head and
/// nested) to `flat` and advances `*pos` past the matching `Close`.
fn parse_list(tokens: &[Tok], pos: &mut usize, flat: &mut Vec<TreeNode>) -> Result<String> {
    if tokens.get(*pos) != Some(&Tok::Open) {
        return Err(Error::Graph("expected '(' at start of sub-graph".into()));
    }
    *pos += 1;

    let name = match tokens.get(*pos) {
        Some(Tok::Atom(name)) => name.clone(),
        _ => return Err(Error::Graph("sub-graph is missing a head node name".into())),
    };
    *pos += 1;

    let mut children = Vec::new();
    loop {
        match tokens.get(*pos) {
            Some(Tok::Atom(child)) => {
                children.push(child.clone());
                *pos += 1;
            }
            Some(Tok::Open) => {
                let child_name = parse_list(tokens, pos, flat)?;
                children.push(child_name);
            }
            Some(Tok::Close) => {
                *pos += 1;
                break;
            }
            None => return Err(Error::Graph("unterminated sub-graph".into())),
        }
    }

    flat.push(TreeNode {
        name: name.clone(),
        children,
    });
    Ok(name)
}

/// Every successor named by any node must itself be a node. The
/// two-pass construction in `from_subgraphs` makes this unreachable in
/// practice (every child token is inserted as a node on the spot), but
/// a definition built some other way — a manifest format added later,
/// say — could still produce a dangling reference, so the check stays.
fn validate_successors(nodes: &HashMap<String, GraphNode>) -> Result<()> {
    let defined: HashSet<&String> = nodes.keys().collect();
    for (name, node) in nodes {
        for successor in &node.successors {
            if !defined.contains(successor) {
                return Err(Error::Graph(format!(
                    "node '{name}' references undefined successor '{successor}'"
                )));
            }
        }
    }
    Ok(())
}

fn insert_token(nodes: &mut HashMap<String, GraphNode>, token: &TreeNode) -> Result<()> {
    let entry = nodes.entry(token.name.clone()).or_default();
    if entry.successors.is_empty() {
        entry.successors = token.children.clone();
    }
    for child in &token.children {
        nodes.entry(child.clone()).or_default();
    }
    Ok(())
}
