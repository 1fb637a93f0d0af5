use crate::{
    child_storage_key,
    nibbles::{bytes_to_nibbles, common_prefix_len, nibbles_to_bytes},
    node::{Node, NodeKind},
    TrieError,
};
use rivet_primitives::{blake2_256, Hash256};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, OnceLock},
};

/// An in-memory Merkle-Patricia trie over byte keys.
///
/// Nodes are shared copy-on-write: cloning a trie is O(1) and mutations never touch
/// nodes reachable from older clones, which is what makes per-block snapshots and
/// changed-node tracking cheap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trie {
    root: Option<Arc<Node>>,
}

impl Trie {
    /// Creates an empty trie.
    pub const fn new() -> Self {
        Self { root: None }
    }

    /// Returns `true` if the trie holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let path = bytes_to_nibbles(key);
        let mut node = self.root.as_deref()?;
        let mut rest = path.as_slice();
        loop {
            if !rest.starts_with(&node.partial) {
                return None;
            }
            rest = &rest[node.partial.len()..];
            match &node.kind {
                NodeKind::Leaf { value } => {
                    return rest.is_empty().then_some(value.as_slice());
                }
                NodeKind::Branch { children, value } => {
                    let Some((&index, tail)) = rest.split_first() else {
                        return value.as_deref();
                    };
                    node = children[index as usize].as_deref()?;
                    rest = tail;
                }
            }
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) {
        let path = bytes_to_nibbles(key);
        let root = self.root.take();
        self.root = Some(insert_at(root, &path, value));
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let path = bytes_to_nibbles(key);
        let root = self.root.take();
        let (root, removed) = remove_at(root, &path);
        self.root = root;
        removed
    }

    /// The smallest key strictly greater than `key`, in lexicographic byte order.
    pub fn next_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        let target = bytes_to_nibbles(key);
        let root = self.root.as_deref()?;
        next_after(root, &[], &target).map(|nibbles| nibbles_to_bytes(&nibbles))
    }

    /// All entries in ascending key order.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        if let Some(root) = self.root.as_deref() {
            collect_entries(root, Vec::new(), &mut out);
        }
        out
    }

    /// All keys starting with `prefix`, in ascending order.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.entries().into_iter().map(|(key, _)| key).filter(|key| key.starts_with(prefix)).collect()
    }

    /// Removes every key starting with `prefix`. Returns the number of removed entries.
    pub fn clear_prefix(&mut self, prefix: &[u8]) -> u32 {
        let (deleted, _) = self.clear_prefix_limit(prefix, None);
        deleted
    }

    /// Removes up to `limit` keys starting with `prefix`, in ascending key order.
    ///
    /// Returns the number of removed entries and whether every matching key was removed.
    pub fn clear_prefix_limit(&mut self, prefix: &[u8], limit: Option<u32>) -> (u32, bool) {
        let matching = self.keys_with_prefix(prefix);
        let total = matching.len() as u32;
        let take = limit.map_or(total, |limit| limit.min(total));
        let mut deleted = 0u32;
        for key in matching.into_iter().take(take as usize) {
            self.remove(&key);
            deleted += 1;
        }
        (deleted, deleted == total)
    }

    /// The merkle root of the trie.
    pub fn root_hash(&self) -> Hash256 {
        match self.root.as_deref() {
            Some(root) => root.hash(),
            None => empty_trie_root(),
        }
    }

    /// The hashes of every node reachable from the root.
    pub fn node_hashes(&self) -> HashSet<Hash256> {
        let mut out = HashSet::new();
        if let Some(root) = self.root.as_deref() {
            collect_node_hashes(root, &mut out);
        }
        out
    }

    /// Visits every node with its merkle hash and canonical encoding.
    pub(crate) fn for_each_node(&self, f: &mut impl FnMut(Hash256, Vec<u8>)) {
        fn walk(node: &Node, f: &mut impl FnMut(Hash256, Vec<u8>)) {
            f(node.hash(), node.encoded());
            if let NodeKind::Branch { children, .. } = &node.kind {
                for child in children.iter().flatten() {
                    walk(child, f);
                }
            }
        }
        if let Some(root) = self.root.as_deref() {
            walk(root, f);
        }
    }
}

/// The root hash of an empty trie.
pub fn empty_trie_root() -> Hash256 {
    static EMPTY: OnceLock<Hash256> = OnceLock::new();
    *EMPTY.get_or_init(|| Hash256::from(blake2_256(&[])))
}

fn insert_at(node: Option<Arc<Node>>, path: &[u8], value: Vec<u8>) -> Arc<Node> {
    let Some(node) = node else {
        return Arc::new(Node::leaf(path.to_vec(), value));
    };
    let common = common_prefix_len(&node.partial, path);

    match &node.kind {
        NodeKind::Leaf { value: old_value } => {
            if common == node.partial.len() && common == path.len() {
                return Arc::new(Node::leaf(path.to_vec(), value));
            }

            // The paths diverge: split into a branch at the common prefix.
            let mut children: [Option<Arc<Node>>; 16] = Default::default();
            let mut branch_value = None;
            if common == node.partial.len() {
                branch_value = Some(old_value.clone());
            } else {
                let slot = node.partial[common] as usize;
                children[slot] =
                    Some(Arc::new(Node::leaf(node.partial[common + 1..].to_vec(), old_value.clone())));
            }
            if common == path.len() {
                branch_value = Some(value);
            } else {
                let slot = path[common] as usize;
                children[slot] = Some(Arc::new(Node::leaf(path[common + 1..].to_vec(), value)));
            }
            Arc::new(Node::branch(path[..common].to_vec(), children, branch_value))
        }
        NodeKind::Branch { children, value: branch_value } => {
            if common < node.partial.len() {
                // The new path leaves the branch's partial early: split the branch.
                let lower = Arc::new(Node::branch(
                    node.partial[common + 1..].to_vec(),
                    children.clone(),
                    branch_value.clone(),
                ));
                let mut new_children: [Option<Arc<Node>>; 16] = Default::default();
                new_children[node.partial[common] as usize] = Some(lower);
                let mut new_value = None;
                if common == path.len() {
                    new_value = Some(value);
                } else {
                    let slot = path[common] as usize;
                    new_children[slot] =
                        Some(Arc::new(Node::leaf(path[common + 1..].to_vec(), value)));
                }
                Arc::new(Node::branch(path[..common].to_vec(), new_children, new_value))
            } else if common == path.len() {
                Arc::new(Node::branch(node.partial.clone(), children.clone(), Some(value)))
            } else {
                let slot = path[common] as usize;
                let mut children = children.clone();
                let child = children[slot].take();
                children[slot] = Some(insert_at(child, &path[common + 1..], value));
                Arc::new(Node::branch(node.partial.clone(), children, branch_value.clone()))
            }
        }
    }
}

fn remove_at(node: Option<Arc<Node>>, path: &[u8]) -> (Option<Arc<Node>>, bool) {
    let Some(node) = node else { return (None, false) };
    if !path.starts_with(&node.partial) {
        return (Some(node), false);
    }
    let rest = &path[node.partial.len()..];

    match &node.kind {
        NodeKind::Leaf { .. } => {
            if rest.is_empty() {
                (None, true)
            } else {
                (Some(node), false)
            }
        }
        NodeKind::Branch { children, value } => {
            if rest.is_empty() {
                if value.is_none() {
                    return (Some(node), false);
                }
                (normalize(node.partial.clone(), children.clone(), None), true)
            } else {
                let slot = rest[0] as usize;
                let Some(child) = children[slot].clone() else { return (Some(node), false) };
                let (new_child, removed) = remove_at(Some(child), &rest[1..]);
                if !removed {
                    return (Some(node), false);
                }
                let mut children = children.clone();
                children[slot] = new_child;
                (normalize(node.partial.clone(), children, value.clone()), true)
            }
        }
    }
}

/// Rebuilds a branch after a removal: an empty branch vanishes, a value-only branch
/// becomes a leaf, and a single-child valueless branch merges into its child.
fn normalize(
    partial: Vec<u8>,
    children: [Option<Arc<Node>>; 16],
    value: Option<Vec<u8>>,
) -> Option<Arc<Node>> {
    let occupied = children.iter().filter(|child| child.is_some()).count();
    if occupied == 0 {
        return value.map(|value| Arc::new(Node::leaf(partial, value)));
    }
    if occupied == 1 && value.is_none() {
        let (slot, child) = children
            .iter()
            .enumerate()
            .find_map(|(slot, child)| child.as_ref().map(|child| (slot, child)))
            .expect("exactly one child is occupied");
        let mut merged = partial;
        merged.push(slot as u8);
        merged.extend_from_slice(&child.partial);
        let node = match &child.kind {
            NodeKind::Leaf { value } => Node::leaf(merged, value.clone()),
            NodeKind::Branch { children, value } => {
                Node::branch(merged, children.clone(), value.clone())
            }
        };
        return Some(Arc::new(node));
    }
    Some(Arc::new(Node::branch(partial, children, value)))
}

fn collect_entries(node: &Node, mut prefix: Vec<u8>, out: &mut Vec<(Vec<u8>, Vec<u8>)>) {
    prefix.extend_from_slice(&node.partial);
    match &node.kind {
        NodeKind::Leaf { value } => out.push((nibbles_to_bytes(&prefix), value.clone())),
        NodeKind::Branch { children, value } => {
            if let Some(value) = value {
                out.push((nibbles_to_bytes(&prefix), value.clone()));
            }
            for (slot, child) in children.iter().enumerate() {
                if let Some(child) = child {
                    let mut child_prefix = prefix.clone();
                    child_prefix.push(slot as u8);
                    collect_entries(child, child_prefix, out);
                }
            }
        }
    }
}

fn collect_node_hashes(node: &Node, out: &mut HashSet<Hash256>) {
    out.insert(node.hash());
    if let NodeKind::Branch { children, .. } = &node.kind {
        for child in children.iter().flatten() {
            collect_node_hashes(child, out);
        }
    }
}

/// The smallest key in `node`'s subtree strictly greater than `target`, as nibbles.
/// `prefix` is the nibble path leading to `node`, excluding its partial.
fn next_after(node: &Node, prefix: &[u8], target: &[u8]) -> Option<Vec<u8>> {
    let mut full = Vec::with_capacity(prefix.len() + node.partial.len());
    full.extend_from_slice(prefix);
    full.extend_from_slice(&node.partial);

    if full.as_slice() > target {
        // Every key below this node is greater than the target.
        return Some(leftmost_from(node, full));
    }
    if !target.starts_with(&full) {
        // The whole subtree sorts at or before the target.
        return None;
    }

    match &node.kind {
        NodeKind::Leaf { .. } => None,
        NodeKind::Branch { children, .. } => {
            let rest = &target[full.len()..];
            let start = match rest.first() {
                // The target is exactly this node's path: every child is greater.
                None => 0usize,
                Some(&index) => {
                    let slot = index as usize;
                    if let Some(child) = children[slot].as_deref() {
                        let mut child_prefix = full.clone();
                        child_prefix.push(index);
                        if let Some(found) = next_after(child, &child_prefix, target) {
                            return Some(found);
                        }
                    }
                    slot + 1
                }
            };
            for slot in start..16 {
                if let Some(child) = children[slot].as_deref() {
                    let mut child_full = full.clone();
                    child_full.push(slot as u8);
                    child_full.extend_from_slice(&child.partial);
                    return Some(leftmost_from(child, child_full));
                }
            }
            None
        }
    }
}

/// The smallest key in `node`'s subtree. `full` is the nibble path of `node` itself,
/// including its partial.
fn leftmost_from(node: &Node, mut full: Vec<u8>) -> Vec<u8> {
    let mut node = node;
    loop {
        match &node.kind {
            NodeKind::Leaf { .. } => return full,
            NodeKind::Branch { children, value } => {
                if value.is_some() {
                    return full;
                }
                let (slot, child) = children
                    .iter()
                    .enumerate()
                    .find_map(|(slot, child)| child.as_deref().map(|child| (slot, child)))
                    .expect("a valueless branch has at least two children");
                full.push(slot as u8);
                full.extend_from_slice(&child.partial);
                node = child;
            }
        }
    }
}

/// The committed state: the main trie plus the child tries addressed through it.
///
/// Child tries are kept separate; their roots are folded into a clone of the main trie
/// under [`CHILD_STORAGE_PREFIX`](crate::CHILD_STORAGE_PREFIX) when the state root is
/// computed, so main-trie reads never observe the folded keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateTrie {
    main: Trie,
    children: BTreeMap<Vec<u8>, Trie>,
}

impl StateTrie {
    /// Creates an empty state.
    pub const fn new() -> Self {
        Self { main: Trie::new(), children: BTreeMap::new() }
    }

    /// The main trie.
    pub fn main(&self) -> &Trie {
        &self.main
    }

    /// Returns the value stored under `key` in the main trie.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.main.get(key)
    }

    /// Stores `value` under `key` in the main trie.
    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) {
        self.main.insert(key, value);
    }

    /// Removes `key` from the main trie. Returns `true` if it was present.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        self.main.remove(key)
    }

    /// The smallest main-trie key strictly greater than `key`.
    pub fn next_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.main.next_key(key)
    }

    /// All main-trie entries in ascending key order.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.main.entries()
    }

    /// Removes up to `limit` main-trie keys starting with `prefix`, ascending.
    pub fn clear_prefix_limit(&mut self, prefix: &[u8], limit: Option<u32>) -> (u32, bool) {
        self.main.clear_prefix_limit(prefix, limit)
    }

    /// The child tries, keyed by child key.
    pub fn children(&self) -> impl Iterator<Item = (&Vec<u8>, &Trie)> {
        self.children.iter()
    }

    /// The child trie at `child_key`, if it exists.
    pub fn child(&self, child_key: &[u8]) -> Option<&Trie> {
        self.children.get(child_key)
    }

    /// Returns `true` if a child trie exists at `child_key`.
    pub fn has_child(&self, child_key: &[u8]) -> bool {
        self.children.contains_key(child_key)
    }

    /// Stores `value` under `key` in the child trie at `child_key`, creating the child
    /// trie if absent.
    pub fn set_child_value(&mut self, child_key: &[u8], key: &[u8], value: Vec<u8>) {
        self.children.entry(child_key.to_vec()).or_default().insert(key, value);
    }

    /// Returns the value under `key` in the child trie at `child_key`.
    pub fn get_child_value(&self, child_key: &[u8], key: &[u8]) -> Result<Option<&[u8]>, TrieError> {
        let child = self.children.get(child_key).ok_or_else(|| TrieError::missing_child(child_key))?;
        Ok(child.get(key))
    }

    /// Removes `key` from the child trie at `child_key`.
    pub fn remove_child_value(&mut self, child_key: &[u8], key: &[u8]) -> Result<bool, TrieError> {
        let child =
            self.children.get_mut(child_key).ok_or_else(|| TrieError::missing_child(child_key))?;
        Ok(child.remove(key))
    }

    /// The child trie at `child_key`, for mutation.
    pub(crate) fn child_trie_mut(&mut self, child_key: &[u8]) -> Option<&mut Trie> {
        self.children.get_mut(child_key)
    }

    /// Destroys the child trie at `child_key` with all its content. Returns `true` if
    /// it existed.
    pub fn remove_child(&mut self, child_key: &[u8]) -> bool {
        self.children.remove(child_key).is_some()
    }

    /// The merkle root of the child trie at `child_key`.
    pub fn child_root(&self, child_key: &[u8]) -> Result<Hash256, TrieError> {
        let child = self.children.get(child_key).ok_or_else(|| TrieError::missing_child(child_key))?;
        Ok(child.root_hash())
    }

    /// The state root: the main trie's root with every child root folded in.
    pub fn root_hash(&self) -> Hash256 {
        self.materialize().root_hash()
    }

    /// The hashes of every node reachable from the materialized main trie and the child
    /// tries.
    pub fn node_hashes(&self) -> HashSet<Hash256> {
        let mut out = self.materialize().node_hashes();
        for child in self.children.values() {
            out.extend(child.node_hashes());
        }
        out
    }

    /// Visits every node of the materialized main trie and the child tries.
    pub(crate) fn for_each_node(&self, f: &mut impl FnMut(Hash256, Vec<u8>)) {
        self.materialize().for_each_node(f);
        for child in self.children.values() {
            child.for_each_node(f);
        }
    }

    /// A clone of the main trie with each child trie's root written under its child
    /// storage key.
    fn materialize(&self) -> Trie {
        let mut main = self.main.clone();
        for (child_key, child) in &self.children {
            main.insert(&child_storage_key(child_key), child.root_hash().as_bytes().to_vec());
        }
        main
    }
}
