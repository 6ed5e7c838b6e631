use std::collections::HashMap;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Symbol {
    #[default]
    Unset,
    /// Exact terminal.
    Last,
    /// Matches any deeper labels.
    Wildcard,
}

#[derive(Debug, Clone)]
struct Node<V> {
    symbol: Symbol,
    mark: Option<V>,
    children: HashMap<Box<str>, Node<V>>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            symbol: Symbol::Unset,
            mark: None,
            children: HashMap::new(),
        }
    }
}

/// Label trie for exact (`example.com`), wildcard (`*.example.com`) and
/// top-level wildcard (`example.*`) domain patterns.
#[derive(Debug, Clone)]
pub struct DomainTrie<V> {
    /// `example.com`, `example.*`
    root: Node<V>,
    /// `*.example.com`, `*.example.*`
    wildcard_root: Node<V>,
    len: usize,
}

impl<V> Default for DomainTrie<V> {
    fn default() -> Self {
        Self {
            root: Node::default(),
            wildcard_root: Node::default(),
            len: 0,
        }
    }
}

impl<V> DomainTrie<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, domain: &str, mark: V) {
        let domain = normalize(domain);
        if domain.is_empty() {
            return;
        }
        if domain == "*" {
            warn!(target = "matcher", "bare `*` domain pattern ignored");
            return;
        }
        let labels = reversed_labels(&domain);
        let root = if domain.starts_with('*') {
            &mut self.wildcard_root
        } else {
            &mut self.root
        };
        insert_into(root, &labels, mark);
        self.len += 1;
    }

    pub fn search(&self, domain: &str) -> Option<&V> {
        let domain = normalize(domain);
        if domain.is_empty() {
            return None;
        }
        let labels = reversed_labels(&domain);
        search_in(&self.root, &labels).or_else(|| search_in(&self.wildcard_root, &labels))
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.search(domain).is_some()
    }

    /// Number of insert calls since the last clear.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn reversed_labels(domain: &str) -> Vec<&str> {
    domain.rsplit('.').collect()
}

fn insert_into<V>(mut node: &mut Node<V>, labels: &[&str], mark: V) {
    let n = labels.len();
    for (i, label) in labels.iter().enumerate() {
        let last = i + 1 == n;
        if last && *label == "*" {
            node.symbol = Symbol::Wildcard;
            node.mark = Some(mark);
            node.children.clear();
            return;
        }

        node = node.children.entry(Box::from(*label)).or_default();

        if last {
            node.symbol = Symbol::Last;
            node.mark = Some(mark);
            return;
        }
    }
}

fn search_in<'a, V>(root: &'a Node<V>, labels: &[&str]) -> Option<&'a V> {
    let mut node = root;
    let mut best = None;
    let mut first = true;
    let mut asterisk = false;
    let mut i = 0;

    while i < labels.len() {
        let Some(child) = node.children.get(labels[i]) else {
            if !first {
                return best;
            }
            // Unknown top-level label: try `*` once, then skip labels until one matches.
            if !asterisk {
                node = node.children.get("*")?;
                asterisk = true;
            } else {
                i += 1;
            }
            continue;
        };

        node = child;
        match child.symbol {
            Symbol::Wildcard => best = child.mark.as_ref(),
            Symbol::Last if i + 1 == labels.len() => return child.mark.as_ref(),
            _ => {}
        }
        first = false;
        i += 1;
    }

    best
}
