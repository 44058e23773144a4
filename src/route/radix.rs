//! Compressed trie over byte strings with longest-prefix lookup.
//!
//! A standard textbook implementation, as used by e.g. HashiCorp's
//! `go-radix`, rather than a transliteration of any specific source file.

/// One edge-compressed node. `label` is the byte span from the parent node
/// to this one; `value` is set only on nodes that terminate a stored
/// prefix.
struct Node {
    label: Vec<u8>,
    value: Option<String>,
    children: Vec<Node>,
}

impl Node {
    fn new(label: Vec<u8>) -> Self {
        Self {
            label,
            value: None,
            children: Vec::new(),
        }
    }

    fn is_leaf_without_value(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// `Insert`/`Delete`/`LongestPrefix` over arbitrary string keys. Not
/// internally thread-safe; callers (`RuleTable`) hold their own lock.
#[derive(Default)]
pub struct RadixTree {
    root: Node,
}

impl Default for Node {
    fn default() -> Self {
        Node::new(Vec::new())
    }
}

impl RadixTree {
    pub fn new() -> Self {
        Self { root: Node::new(Vec::new()) }
    }

    /// Splits or creates nodes so `prefix` becomes a distinct path.
    /// Overwrites the value if `prefix` was already stored.
    pub fn insert(&mut self, prefix: &str, value: String) {
        Self::insert_at(&mut self.root, prefix.as_bytes(), value);
    }

    fn insert_at(node: &mut Node, key: &[u8], value: String) {
        if key.is_empty() {
            node.value = Some(value);
            return;
        }

        for idx in 0..node.children.len() {
            let common = common_prefix_len(&node.children[idx].label, key);
            if common == 0 {
                continue;
            }
            if common == node.children[idx].label.len() {
                Self::insert_at(&mut node.children[idx], &key[common..], value);
                return;
            }

            // The new key diverges partway through an existing edge: split
            // it into a shared mid node plus the old and new tails.
            let mut child = std::mem::replace(&mut node.children[idx], Node::new(Vec::new()));
            let shared = key[..common].to_vec();
            child.label = child.label[common..].to_vec();

            let mut mid = Node::new(shared);
            if common == key.len() {
                mid.value = Some(value);
                mid.children.push(child);
            } else {
                let mut new_leaf = Node::new(key[common..].to_vec());
                new_leaf.value = Some(value);
                mid.children.push(child);
                mid.children.push(new_leaf);
            }
            node.children[idx] = mid;
            return;
        }

        node.children.push({
            let mut leaf = Node::new(key.to_vec());
            leaf.value = Some(value);
            leaf
        });
    }

    /// Removes the value stored at the exact node for `prefix`, merging any
    /// resulting only-child chain back together. No-op if `prefix` was
    /// never inserted.
    pub fn delete(&mut self, prefix: &str) {
        Self::delete_at(&mut self.root, prefix.as_bytes());
    }

    fn delete_at(node: &mut Node, key: &[u8]) {
        let mut remove_idx = None;
        for idx in 0..node.children.len() {
            let label_len = node.children[idx].label.len();
            if key.len() >= label_len && &key[..label_len] == node.children[idx].label.as_slice() {
                if key.len() == label_len {
                    node.children[idx].value = None;
                } else {
                    Self::delete_at(&mut node.children[idx], &key[label_len..]);
                }

                if node.children[idx].is_leaf_without_value() {
                    remove_idx = Some(idx);
                } else if node.children[idx].value.is_none() && node.children[idx].children.len() == 1 {
                    let mut only = node.children[idx].children.pop().unwrap();
                    let mut merged_label = node.children[idx].label.clone();
                    merged_label.extend_from_slice(&only.label);
                    only.label = merged_label;
                    node.children[idx] = only;
                }
                break;
            }
        }
        if let Some(idx) = remove_idx {
            node.children.remove(idx);
        }
    }

    /// `LongestPrefix(key)`: the deepest node along the matching path that
    /// holds a value. Returns `(matchedPrefix, value)`.
    pub fn longest_prefix(&self, key: &str) -> Option<(String, String)> {
        let key = key.as_bytes();
        let mut node = &self.root;
        let mut matched: Vec<u8> = Vec::new();
        let mut remaining = key;
        let mut best: Option<(Vec<u8>, String)> = node.value.clone().map(|v| (matched.clone(), v));

        loop {
            let mut advanced = false;
            for child in &node.children {
                if !child.label.is_empty() && remaining.starts_with(child.label.as_slice()) {
                    matched.extend_from_slice(&child.label);
                    remaining = &remaining[child.label.len()..];
                    node = child;
                    if let Some(v) = &node.value {
                        best = Some((matched.clone(), v.clone()));
                    }
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                break;
            }
        }

        best.map(|(bytes, v)| (String::from_utf8_lossy(&bytes).into_owned(), v))
    }
}
