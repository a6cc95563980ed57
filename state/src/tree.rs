//! Authenticated AVL+ tree
//!
//! An immutable height-balanced search tree over 32-byte keys. Values
//! live in the leaves; internal nodes route on the largest key of their
//! left subtree. Every node carries a BLAKE3 label over its serialized
//! form, and the tree digest is the root label plus the tree height —
//! the 33-byte state commitment headers carry.
//!
//! Nodes are shared through `Arc`, so every mutation returns a new root
//! while committed roots keep their exact digests alive for rollback.

use std::sync::Arc;

use obelisk_consensus::StateDigest;

use crate::error::{StateError, StateResult};

/// Tree key: a box identifier
pub type Key = [u8; 32];

/// Serialization prefix for leaf nodes
pub const LEAF_PREFIX: u8 = 0;
/// Serialization prefix for internal nodes
pub const INTERNAL_PREFIX: u8 = 1;
/// Proof prefix standing in for a pruned subtree
pub const LABEL_PREFIX: u8 = 2;

/// A tree node
#[derive(Debug)]
pub enum Node {
    Leaf {
        key: Key,
        value: Vec<u8>,
        label: [u8; 32],
    },
    Internal {
        /// Largest key reachable in the left subtree (routing bound)
        router: Key,
        height: u8,
        left: Arc<Node>,
        right: Arc<Node>,
        label: [u8; 32],
    },
}

impl Node {
    /// Node label
    pub fn label(&self) -> &[u8; 32] {
        match self {
            Node::Leaf { label, .. } | Node::Internal { label, .. } => label,
        }
    }

    /// Subtree height; leaves are height zero
    pub fn height(&self) -> u8 {
        match self {
            Node::Leaf { .. } => 0,
            Node::Internal { height, .. } => *height,
        }
    }

    /// Persistence format: a self-contained record per node, children
    /// referenced by label.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Node::Leaf { key, value, .. } => {
                let mut out = Vec::with_capacity(33 + value.len());
                out.push(LEAF_PREFIX);
                out.extend_from_slice(key);
                out.extend_from_slice(value);
                out
            }
            Node::Internal {
                router,
                height,
                left,
                right,
                ..
            } => {
                let mut out = Vec::with_capacity(2 + 32 + 32 + 32);
                out.push(INTERNAL_PREFIX);
                out.push(*height);
                out.extend_from_slice(router);
                out.extend_from_slice(left.label());
                out.extend_from_slice(right.label());
                out
            }
        }
    }
}

/// Build a leaf node
pub fn leaf(key: Key, value: Vec<u8>) -> Arc<Node> {
    let label = obelisk_hash::hash_many(&[&[LEAF_PREFIX], &key, &value]);
    Arc::new(Node::Leaf { key, value, label })
}

/// Build an internal node over two subtrees; the router must bound the
/// left subtree from above and exclude the right.
fn internal(router: Key, left: Arc<Node>, right: Arc<Node>) -> Arc<Node> {
    let height = 1 + left.height().max(right.height());
    let label = obelisk_hash::hash_many(&[
        &[INTERNAL_PREFIX],
        &[height],
        &router,
        left.label(),
        right.label(),
    ]);
    Arc::new(Node::Internal {
        router,
        height,
        left,
        right,
        label,
    })
}

/// Digest of an empty tree
pub fn empty_digest() -> StateDigest {
    StateDigest::new(obelisk_hash::hash(b"obelisk.avl.empty"), 0)
}

/// Digest of a tree root
pub fn digest(root: &Option<Arc<Node>>) -> StateDigest {
    match root {
        Some(node) => StateDigest::new(*node.label(), node.height()),
        None => empty_digest(),
    }
}

/// Look up a key
pub fn lookup(root: &Option<Arc<Node>>, key: &Key) -> Option<Vec<u8>> {
    let mut node = root.as_deref()?;
    loop {
        match node {
            Node::Leaf {
                key: leaf_key,
                value,
                ..
            } => return (leaf_key == key).then(|| value.clone()),
            Node::Internal {
                router,
                left,
                right,
                ..
            } => {
                node = if key <= router { left } else { right };
            }
        }
    }
}

/// Insert a key; duplicate keys are an error
pub fn insert(root: &Option<Arc<Node>>, key: Key, value: Vec<u8>) -> StateResult<Arc<Node>> {
    match root {
        None => Ok(leaf(key, value)),
        Some(node) => insert_at(node, key, value),
    }
}

fn insert_at(node: &Arc<Node>, key: Key, value: Vec<u8>) -> StateResult<Arc<Node>> {
    match &**node {
        Node::Leaf { key: leaf_key, .. } => {
            if *leaf_key == key {
                return Err(StateError::DuplicateKey(hex::encode(key)));
            }
            let new_leaf = leaf(key, value);
            if key < *leaf_key {
                Ok(internal(key, new_leaf, node.clone()))
            } else {
                Ok(internal(*leaf_key, node.clone(), new_leaf))
            }
        }
        Node::Internal {
            router,
            left,
            right,
            ..
        } => {
            if key <= *router {
                let new_left = insert_at(left, key, value)?;
                Ok(balance(*router, new_left, right.clone()))
            } else {
                let new_right = insert_at(right, key, value)?;
                Ok(balance(*router, left.clone(), new_right))
            }
        }
    }
}

/// Remove a key; absent keys are an error
pub fn remove(root: &Option<Arc<Node>>, key: &Key) -> StateResult<Option<Arc<Node>>> {
    match root {
        None => Err(StateError::KeyNotFound(hex::encode(key))),
        Some(node) => remove_at(node, key),
    }
}

fn remove_at(node: &Arc<Node>, key: &Key) -> StateResult<Option<Arc<Node>>> {
    match &**node {
        Node::Leaf { key: leaf_key, .. } => {
            if leaf_key == key {
                Ok(None)
            } else {
                Err(StateError::KeyNotFound(hex::encode(key)))
            }
        }
        Node::Internal {
            router,
            left,
            right,
            ..
        } => {
            if key <= router {
                match remove_at(left, key)? {
                    None => Ok(Some(right.clone())),
                    Some(new_left) => Ok(Some(balance(*router, new_left, right.clone()))),
                }
            } else {
                match remove_at(right, key)? {
                    None => Ok(Some(left.clone())),
                    Some(new_right) => Ok(Some(balance(*router, left.clone(), new_right))),
                }
            }
        }
    }
}

/// Rebuild an internal node, rotating if the height invariant broke.
/// Routers travel with their subtrees through the rotations, so the
/// routing bound stays correct without recomputing subtree maxima.
fn balance(router: Key, left: Arc<Node>, right: Arc<Node>) -> Arc<Node> {
    let skew = right.height() as i16 - left.height() as i16;

    if skew > 1 {
        let Node::Internal {
            router: right_router,
            left: right_left,
            right: right_right,
            ..
        } = &*right
        else {
            unreachable!("height >= 2 subtree is internal");
        };
        if right_left.height() > right_right.height() {
            let Node::Internal {
                router: pivot_router,
                left: pivot_left,
                right: pivot_right,
                ..
            } = &**right_left
            else {
                unreachable!("taller child of an internal node is internal");
            };
            return internal(
                *pivot_router,
                internal(router, left, pivot_left.clone()),
                internal(*right_router, pivot_right.clone(), right_right.clone()),
            );
        }
        return internal(
            *right_router,
            internal(router, left, right_left.clone()),
            right_right.clone(),
        );
    }

    if skew < -1 {
        let Node::Internal {
            router: left_router,
            left: left_left,
            right: left_right,
            ..
        } = &*left
        else {
            unreachable!("height >= 2 subtree is internal");
        };
        if left_right.height() > left_left.height() {
            let Node::Internal {
                router: pivot_router,
                left: pivot_left,
                right: pivot_right,
                ..
            } = &**left_right
            else {
                unreachable!("taller child of an internal node is internal");
            };
            return internal(
                *pivot_router,
                internal(*left_router, left_left.clone(), pivot_left.clone()),
                internal(router, pivot_right.clone(), right),
            );
        }
        return internal(
            *left_router,
            left_left.clone(),
            internal(router, left_right.clone(), right),
        );
    }

    internal(router, left, right)
}

/// Serialize the pruned pre-batch tree along the paths to the touched
/// keys: visited leaves in full, unvisited subtrees as bare labels. The
/// touched slice must be sorted.
pub fn serialize_pruned(root: &Option<Arc<Node>>, touched: &[Key], out: &mut Vec<u8>) {
    match root {
        None => {
            out.push(LABEL_PREFIX);
            out.extend_from_slice(&empty_digest().root);
        }
        Some(node) => serialize_pruned_at(node, touched, out),
    }
}

fn serialize_pruned_at(node: &Arc<Node>, touched: &[Key], out: &mut Vec<u8>) {
    if touched.is_empty() {
        out.push(LABEL_PREFIX);
        out.extend_from_slice(node.label());
        return;
    }
    match &**node {
        Node::Leaf { key, value, .. } => {
            out.push(LEAF_PREFIX);
            out.extend_from_slice(key);
            out.extend_from_slice(&(value.len() as u32).to_be_bytes());
            out.extend_from_slice(value);
        }
        Node::Internal {
            router,
            height,
            left,
            right,
            ..
        } => {
            out.push(INTERNAL_PREFIX);
            out.push(*height);
            out.extend_from_slice(router);
            let split = touched.partition_point(|key| key <= router);
            serialize_pruned_at(left, &touched[..split], out);
            serialize_pruned_at(right, &touched[split..], out);
        }
    }
}

/// Reconstruct a subtree from content-addressed node records
pub fn load(label: &[u8; 32], fetch: &dyn Fn(&[u8; 32]) -> StateResult<Vec<u8>>) -> StateResult<Arc<Node>> {
    let bytes = fetch(label)?;
    match bytes.first() {
        Some(&LEAF_PREFIX) => {
            if bytes.len() < 33 {
                return Err(StateError::CorruptedNode(hex::encode(label)));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes[1..33]);
            let node = leaf(key, bytes[33..].to_vec());
            if node.label() != label {
                return Err(StateError::CorruptedNode(hex::encode(label)));
            }
            Ok(node)
        }
        Some(&INTERNAL_PREFIX) => {
            if bytes.len() != 2 + 32 * 3 {
                return Err(StateError::CorruptedNode(hex::encode(label)));
            }
            let mut router = [0u8; 32];
            router.copy_from_slice(&bytes[2..34]);
            let mut left_label = [0u8; 32];
            left_label.copy_from_slice(&bytes[34..66]);
            let mut right_label = [0u8; 32];
            right_label.copy_from_slice(&bytes[66..98]);
            let node = internal(router, load(&left_label, fetch)?, load(&right_label, fetch)?);
            if node.label() != label {
                return Err(StateError::CorruptedNode(hex::encode(label)));
            }
            Ok(node)
        }
        _ => Err(StateError::CorruptedNode(hex::encode(label))),
    }
}
