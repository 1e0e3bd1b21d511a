// Copyright 2023-2025 The Ledger Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The persistent b-tree holding a page's entries.
//!
//! Nodes are immutable pieces; every mutation produces a new chain of nodes
//! up to a new root. The level of the node holding a key is derived from a
//! hash of the key, which makes the tree shape a pure function of its
//! content: two devices holding the same entries produce byte-identical
//! trees and therefore identical root digests, regardless of the order the
//! entries were written in.

use std::cmp::Ordering;
use std::ops::ControlFlow;

use blake2::Blake2b512;
use digest::Digest as _;
use prost::Message as _;

use crate::commit::CommitId;
use crate::object_id::ObjectId as _;
use crate::object_id::id_type;
use crate::object_store::ObjectStore;
use crate::piece::ObjectDigest;
use crate::piece::ObjectIdentifier;
use crate::piece::PieceType;
use crate::protos;
use crate::status::Status;
use crate::status::StatusResult;

id_type!(
    /// Content-derived identifier of an [`Entry`], equal across devices for
    /// identical independently-made edits.
    pub EntryId
);

/// Download priority of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyPriority {
    /// Fetched eagerly during synchronization.
    Eager,
    /// Only fetched on demand.
    Lazy,
}

impl KeyPriority {
    fn to_proto(self) -> protos::store::KeyPriority {
        match self {
            Self::Eager => protos::store::KeyPriority::Eager,
            Self::Lazy => protos::store::KeyPriority::Lazy,
        }
    }

    fn from_proto(value: i32) -> StatusResult<Self> {
        match protos::store::KeyPriority::try_from(value) {
            Ok(protos::store::KeyPriority::Eager) => Ok(Self::Eager),
            Ok(protos::store::KeyPriority::Lazy) => Ok(Self::Lazy),
            Err(_) => Err(Status::DataIntegrity(format!(
                "unknown key priority tag {value}"
            ))),
        }
    }
}

/// One key/value mapping stored in the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// The client-visible key.
    pub key: Vec<u8>,
    /// Identifier of the stored value.
    pub value: ObjectIdentifier,
    /// Download priority of the value.
    pub priority: KeyPriority,
    /// Content-derived entry identifier.
    pub entry_id: EntryId,
}

fn hash_fields(fields: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Blake2b512::new();
    for field in fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    hasher.finalize()[..32].to_vec()
}

/// Entry id for an entry created by a plain Put. Depends only on the key,
/// value and priority, so identical concurrent edits collide by design.
pub fn entry_id_for_insert(
    key: &[u8],
    value: &ObjectIdentifier,
    priority: KeyPriority,
) -> EntryId {
    let key_index = value.key_index().to_be_bytes();
    EntryId::new(hash_fields(&[
        b"insert",
        key,
        &key_index,
        value.digest().as_bytes(),
        &[priority.to_proto() as u8],
    ]))
}

/// Entry id for an entry produced by conflict resolution. Mixing in the
/// ordered parent pair and a per-conflict discriminator keeps ids of merged
/// entries distinct from plain inserts while remaining equal for the same
/// merge performed on any device.
pub fn entry_id_for_merge(
    left_parent: &CommitId,
    right_parent: &CommitId,
    discriminator: u64,
    key: &[u8],
    value: &ObjectIdentifier,
    priority: KeyPriority,
) -> EntryId {
    let key_index = value.key_index().to_be_bytes();
    EntryId::new(hash_fields(&[
        b"merge",
        left_parent.as_bytes(),
        right_parent.as_bytes(),
        &discriminator.to_be_bytes(),
        key,
        &key_index,
        value.digest().as_bytes(),
        &[priority.to_proto() as u8],
    ]))
}

const MAX_NODE_LEVEL: u8 = 64;
// One level per zero nibble keeps the expected fanout at 16.
const LEVEL_BITS: u32 = 4;

// The level at which a key is stored, derived from a hash of the key.
fn key_level(key: &[u8]) -> u8 {
    let mut hasher = Blake2b512::new();
    hasher.update(key);
    let hash = hasher.finalize();
    let mut level: u8 = 0;
    for byte in hash.iter() {
        for shift in [4u32, 0] {
            let nibble = (byte >> shift) & ((1 << LEVEL_BITS) - 1) as u8;
            if nibble != 0 || level >= MAX_NODE_LEVEL {
                return level;
            }
            level += 1;
        }
    }
    level
}

// In-memory node under mutation. Children are either untouched stored
// subtrees or freshly built nodes; `children.len() == entries.len() + 1`.
struct WorkNode {
    level: u8,
    entries: Vec<Entry>,
    children: Vec<Option<Link>>,
}

enum Link {
    Stored(ObjectDigest),
    Built(Box<WorkNode>),
}

/// A change to apply to the tree.
#[derive(Clone, Debug)]
pub struct TreeChange {
    /// The key being changed.
    pub key: Vec<u8>,
    /// What happens to it.
    pub op: TreeOp,
}

/// The operation part of a [`TreeChange`].
#[derive(Clone, Debug)]
pub enum TreeOp {
    /// Insert or replace the entry for the key.
    Put {
        /// New value identifier.
        value: ObjectIdentifier,
        /// New priority.
        priority: KeyPriority,
        /// Entry id for the resulting entry.
        entry_id: EntryId,
    },
    /// Remove the entry for the key. Removing an absent key is a no-op.
    Delete,
}

/// A difference between two trees for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryChange {
    /// The entry in the base tree, if present.
    pub base: Option<Entry>,
    /// The entry in the target tree, if present.
    pub target: Option<Entry>,
}

impl EntryChange {
    /// The key this change is about.
    pub fn key(&self) -> &[u8] {
        self.base
            .as_ref()
            .or(self.target.as_ref())
            .map(|entry| entry.key.as_slice())
            .expect("EntryChange must have at least one side")
    }
}

fn decode_node(bytes: &[u8]) -> StatusResult<(u8, Vec<Entry>, Vec<Option<ObjectDigest>>)> {
    let proto = protos::store::TreeNode::decode(bytes)
        .map_err(|err| Status::DataIntegrity(format!("malformed tree node: {err}")))?;
    if proto.level > u32::from(MAX_NODE_LEVEL) {
        return Err(Status::DataIntegrity(format!(
            "tree node level {} out of range",
            proto.level
        )));
    }
    let mut entries = Vec::with_capacity(proto.entries.len());
    for entry in proto.entries {
        let value = entry
            .value
            .ok_or_else(|| Status::DataIntegrity("tree entry has no value".to_string()))?;
        entries.push(Entry {
            key: entry.key,
            value: ObjectIdentifier::untracked(
                value.key_index,
                ObjectDigest::from_bytes(&value.digest)?,
            ),
            priority: KeyPriority::from_proto(entry.priority)?,
            entry_id: EntryId::new(entry.entry_id),
        });
    }
    if !entries.is_sorted_by(|a, b| a.key < b.key) {
        return Err(Status::DataIntegrity(
            "tree node entries are not strictly sorted".to_string(),
        ));
    }
    let mut children = vec![None; entries.len() + 1];
    for child in proto.children {
        let position = child.position as usize;
        if position >= children.len() {
            return Err(Status::DataIntegrity(format!(
                "tree node child position {position} out of range"
            )));
        }
        if children[position].is_some() {
            return Err(Status::DataIntegrity(format!(
                "duplicate tree node child at position {position}"
            )));
        }
        children[position] = Some(ObjectDigest::from_bytes(&child.digest)?);
    }
    Ok((proto.level as u8, entries, children))
}

fn encode_node(node: &WorkNode, children: &[Option<ObjectDigest>]) -> Vec<u8> {
    let proto = protos::store::TreeNode {
        level: u32::from(node.level),
        entries: node
            .entries
            .iter()
            .map(|entry| protos::store::TreeEntry {
                key: entry.key.clone(),
                value: Some(protos::store::ObjectIdentifier {
                    key_index: entry.value.key_index(),
                    digest: entry.value.digest().to_bytes(),
                }),
                priority: entry.priority.to_proto() as i32,
                entry_id: entry.entry_id.to_bytes(),
            })
            .collect(),
        children: children
            .iter()
            .enumerate()
            .filter_map(|(position, digest)| {
                digest.as_ref().map(|digest| protos::store::ChildPointer {
                    position: position as u32,
                    digest: digest.to_bytes(),
                })
            })
            .collect(),
    };
    proto.encode_to_vec()
}

/// Splits an encoded node's references into child nodes and the values
/// that sync should fetch eagerly (LAZY values are skipped).
pub(crate) fn node_fetch_targets(
    bytes: &[u8],
) -> StatusResult<(Vec<ObjectDigest>, Vec<ObjectDigest>)> {
    let proto = protos::store::TreeNode::decode(bytes)
        .map_err(|err| Status::DataIntegrity(format!("malformed tree node: {err}")))?;
    let mut children = vec![];
    for child in &proto.children {
        children.push(ObjectDigest::from_bytes(&child.digest)?);
    }
    let mut eager_values = vec![];
    for entry in &proto.entries {
        if KeyPriority::from_proto(entry.priority)? == KeyPriority::Eager
            && let Some(value) = &entry.value
        {
            eager_values.push(ObjectDigest::from_bytes(&value.digest)?);
        }
    }
    Ok((children, eager_values))
}

/// Digests referenced by an encoded node: child subtrees and entry values.
/// Used by garbage collection to cascade deletes.
pub(crate) fn node_references(bytes: &[u8]) -> StatusResult<Vec<ObjectDigest>> {
    let proto = protos::store::TreeNode::decode(bytes)
        .map_err(|err| Status::DataIntegrity(format!("malformed tree node: {err}")))?;
    let mut references = vec![];
    for child in &proto.children {
        references.push(ObjectDigest::from_bytes(&child.digest)?);
    }
    for entry in &proto.entries {
        if let Some(value) = &entry.value {
            references.push(ObjectDigest::from_bytes(&value.digest)?);
        }
    }
    Ok(references)
}

fn load_node(store: &ObjectStore, digest: &ObjectDigest) -> StatusResult<WorkNode> {
    let bytes = store.read_piece_bytes(digest)?;
    let (level, entries, children) = decode_node(&bytes)?;
    Ok(WorkNode {
        level,
        entries,
        children: children.into_iter().map(|c| c.map(Link::Stored)).collect(),
    })
}

fn resolve(store: &ObjectStore, link: Link) -> StatusResult<Box<WorkNode>> {
    match link {
        Link::Stored(digest) => Ok(Box::new(load_node(store, &digest)?)),
        Link::Built(node) => Ok(node),
    }
}

/// Writes the empty tree and returns its root identifier.
pub fn write_empty_root(store: &ObjectStore) -> StatusResult<ObjectIdentifier> {
    let node = WorkNode {
        level: 0,
        entries: vec![],
        children: vec![None],
    };
    persist_node(store, &node)
}

fn persist_link(store: &ObjectStore, link: Link) -> StatusResult<ObjectDigest> {
    match link {
        Link::Stored(digest) => Ok(digest),
        Link::Built(node) => Ok(persist_node(store, &node)?.digest().clone()),
    }
}

fn persist_node(store: &ObjectStore, node: &WorkNode) -> StatusResult<ObjectIdentifier> {
    // This is only reached on the freshly-built path, so recursion depth is
    // bounded by the tree height.
    let mut child_digests = Vec::with_capacity(node.children.len());
    let mut references = vec![];
    for child in &node.children {
        match child {
            None => child_digests.push(None),
            Some(Link::Stored(digest)) => {
                references.push(digest.clone());
                child_digests.push(Some(digest.clone()));
            }
            Some(Link::Built(_)) => unreachable!("children are persisted before parents"),
        }
    }
    for entry in &node.entries {
        references.push(entry.value.digest().clone());
    }
    let bytes = encode_node(node, &child_digests);
    let piece_type = if node.level == 0 {
        PieceType::TreeNodeLeaf
    } else {
        PieceType::TreeNodeInternal
    };
    store.write_piece(piece_type, &bytes, false, &references)
}

// Persists all built descendants of `link`, turning it into a stored link.
fn freeze(store: &ObjectStore, link: Link) -> StatusResult<Link> {
    match link {
        Link::Stored(digest) => Ok(Link::Stored(digest)),
        Link::Built(mut node) => {
            for child in &mut node.children {
                if let Some(c) = child.take() {
                    *child = Some(freeze(store, c)?);
                }
            }
            let digest = persist_node(store, &node)?.digest().clone();
            Ok(Link::Stored(digest))
        }
    }
}

/// Applies `changes` to the tree rooted at `base_root` and returns the new
/// root identifier. Changes are applied in the given order.
pub fn apply_changes(
    store: &ObjectStore,
    base_root: &ObjectIdentifier,
    changes: &[TreeChange],
) -> StatusResult<ObjectIdentifier> {
    let mut root: Option<Link> = Some(Link::Stored(base_root.digest().clone()));
    for change in changes {
        root = match &change.op {
            TreeOp::Put {
                value,
                priority,
                entry_id,
            } => {
                let entry = Entry {
                    key: change.key.clone(),
                    value: value.clone(),
                    priority: *priority,
                    entry_id: entry_id.clone(),
                };
                Some(insert_at(store, root, entry, key_level(&change.key))?)
            }
            TreeOp::Delete => remove(store, root, &change.key)?,
        };
        // An emptied tree collapses back to the canonical empty root below.
    }
    match root {
        None => write_empty_root(store),
        Some(link) => {
            let link = prune_empty_root(store, link)?;
            match link {
                None => write_empty_root(store),
                Some(link) => {
                    let digest = persist_link(store, freeze(store, link)?)?;
                    Ok(store.make_identifier(0, digest))
                }
            }
        }
    }
}

// Collapses a root that lost all entries into its single child chain.
fn prune_empty_root(store: &ObjectStore, link: Link) -> StatusResult<Option<Link>> {
    match link {
        Link::Stored(digest) => Ok(Some(Link::Stored(digest))),
        Link::Built(node) => {
            if node.entries.is_empty() {
                debug_assert_eq!(node.children.len(), 1);
                let mut node = node;
                match node.children[0].take() {
                    None => Ok(None),
                    Some(child) => prune_empty_root(store, child),
                }
            } else {
                Ok(Some(Link::Built(node)))
            }
        }
    }
}

fn insert_at(
    store: &ObjectStore,
    link: Option<Link>,
    entry: Entry,
    level: u8,
) -> StatusResult<Link> {
    let Some(link) = link else {
        return Ok(Link::Built(Box::new(WorkNode {
            level,
            entries: vec![entry],
            children: vec![None, None],
        })));
    };
    let mut node = resolve(store, link)?;
    match level.cmp(&node.level) {
        Ordering::Greater => {
            let (left, right) = split(store, Some(Link::Built(node)), &entry.key)?;
            Ok(Link::Built(Box::new(WorkNode {
                level,
                entries: vec![entry],
                children: vec![left, right],
            })))
        }
        Ordering::Equal => {
            match node
                .entries
                .binary_search_by(|existing| existing.key.as_slice().cmp(&entry.key))
            {
                Ok(i) => {
                    node.entries[i] = entry;
                }
                Err(i) => {
                    let (left, right) = split(store, node.children[i].take(), &entry.key)?;
                    node.entries.insert(i, entry);
                    node.children[i] = left;
                    node.children.insert(i + 1, right);
                }
            }
            Ok(Link::Built(node))
        }
        Ordering::Less => {
            let i = match node
                .entries
                .binary_search_by(|existing| existing.key.as_slice().cmp(&entry.key))
            {
                Ok(_) => {
                    return Err(Status::IllegalState(
                        "key stored above its derived level".to_string(),
                    ));
                }
                Err(i) => i,
            };
            let child = insert_at(store, node.children[i].take(), entry, level)?;
            node.children[i] = Some(child);
            Ok(Link::Built(node))
        }
    }
}

fn split(
    store: &ObjectStore,
    link: Option<Link>,
    key: &[u8],
) -> StatusResult<(Option<Link>, Option<Link>)> {
    let Some(link) = link else {
        return Ok((None, None));
    };
    let node = resolve(store, link)?;
    let i = match node
        .entries
        .binary_search_by(|existing| existing.key.as_slice().cmp(key))
    {
        Ok(_) => {
            return Err(Status::IllegalState(
                "split key already present below its level".to_string(),
            ));
        }
        Err(i) => i,
    };
    let WorkNode {
        level,
        mut entries,
        mut children,
    } = *node;
    let right_entries = entries.split_off(i);
    let mut right_children = children.split_off(i + 1);
    let middle_child = children.pop().unwrap();
    let (left_split, right_split) = split(store, middle_child, key)?;

    children.push(left_split);
    let left = if entries.is_empty() {
        children.pop().unwrap()
    } else {
        Some(Link::Built(Box::new(WorkNode {
            level,
            entries,
            children,
        })))
    };

    right_children.insert(0, right_split);
    let right = if right_entries.is_empty() {
        right_children.remove(0)
    } else {
        Some(Link::Built(Box::new(WorkNode {
            level,
            entries: right_entries,
            children: right_children,
        })))
    };
    Ok((left, right))
}

fn remove(store: &ObjectStore, link: Option<Link>, key: &[u8]) -> StatusResult<Option<Link>> {
    let Some(link) = link else {
        return Ok(None);
    };
    let mut node = resolve(store, link)?;
    let level = key_level(key);
    if level > node.level {
        return Ok(Some(Link::Built(node)));
    }
    if level == node.level {
        match node
            .entries
            .binary_search_by(|existing| existing.key.as_slice().cmp(key))
        {
            Ok(i) => {
                node.entries.remove(i);
                let left = node.children.remove(i);
                let right = node.children.remove(i);
                let merged = merge_links(store, left, right)?;
                node.children.insert(i, merged);
                if node.entries.is_empty() {
                    return Ok(node.children.remove(0));
                }
                return Ok(Some(Link::Built(node)));
            }
            Err(_) => return Ok(Some(Link::Built(node))),
        }
    }
    let i = match node
        .entries
        .binary_search_by(|existing| existing.key.as_slice().cmp(key))
    {
        Ok(_) => {
            return Err(Status::IllegalState(
                "key stored above its derived level".to_string(),
            ));
        }
        Err(i) => i,
    };
    let child = remove(store, node.children[i].take(), key)?;
    node.children[i] = child;
    Ok(Some(Link::Built(node)))
}

fn merge_links(
    store: &ObjectStore,
    left: Option<Link>,
    right: Option<Link>,
) -> StatusResult<Option<Link>> {
    let Some(left) = left else {
        return Ok(right);
    };
    let Some(right) = right else {
        return Ok(Some(left));
    };
    let mut left_node = resolve(store, left)?;
    let mut right_node = resolve(store, right)?;
    match left_node.level.cmp(&right_node.level) {
        Ordering::Equal => {
            let middle_left = left_node.children.pop().unwrap();
            let middle_right = right_node.children.remove(0);
            let merged = merge_links(store, middle_left, middle_right)?;
            left_node.entries.append(&mut right_node.entries);
            left_node.children.push(merged);
            left_node.children.append(&mut right_node.children);
            Ok(Some(Link::Built(left_node)))
        }
        Ordering::Greater => {
            let last = left_node.children.pop().unwrap();
            let merged = merge_links(store, last, Some(Link::Built(right_node)))?;
            left_node.children.push(merged);
            Ok(Some(Link::Built(left_node)))
        }
        Ordering::Less => {
            let first = right_node.children.remove(0);
            let merged = merge_links(store, Some(Link::Built(left_node)), first)?;
            right_node.children.insert(0, merged);
            Ok(Some(Link::Built(right_node)))
        }
    }
}

/// Finds the entry for `key`, or `None`.
pub fn lookup(
    store: &ObjectStore,
    root: &ObjectIdentifier,
    key: &[u8],
) -> StatusResult<Option<Entry>> {
    let mut digest = root.digest().clone();
    loop {
        let bytes = store.read_piece_bytes(&digest)?;
        let (_, entries, children) = decode_node(&bytes)?;
        match entries.binary_search_by(|entry| entry.key.as_slice().cmp(key)) {
            Ok(i) => return Ok(Some(entries[i].clone())),
            Err(i) => match &children[i] {
                Some(child) => digest = child.clone(),
                None => return Ok(None),
            },
        }
    }
}

/// Visits entries with key >= `start` in ascending key order until the
/// callback breaks.
pub fn for_each_entry<F>(
    store: &ObjectStore,
    root: &ObjectIdentifier,
    start: &[u8],
    f: &mut F,
) -> StatusResult<()>
where
    F: FnMut(&Entry) -> ControlFlow<()>,
{
    visit_subtree(store, root.digest(), start, f)?;
    Ok(())
}

fn visit_subtree<F>(
    store: &ObjectStore,
    digest: &ObjectDigest,
    start: &[u8],
    f: &mut F,
) -> StatusResult<ControlFlow<()>>
where
    F: FnMut(&Entry) -> ControlFlow<()>,
{
    let bytes = store.read_piece_bytes(digest)?;
    let (_, entries, children) = decode_node(&bytes)?;
    // First entry with key >= start; the child before it may still contain
    // keys in range.
    let first = match entries.binary_search_by(|entry| entry.key.as_slice().cmp(start)) {
        Ok(i) | Err(i) => i,
    };
    if let Some(child) = &children[first] {
        if visit_subtree(store, child, start, f)?.is_break() {
            return Ok(ControlFlow::Break(()));
        }
    }
    for (i, entry) in entries.iter().enumerate().skip(first) {
        if f(entry).is_break() {
            return Ok(ControlFlow::Break(()));
        }
        if let Some(child) = &children[i + 1] {
            if visit_subtree(store, child, start, f)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Collects all entries whose key starts with `prefix`.
pub fn entries_with_prefix(
    store: &ObjectStore,
    root: &ObjectIdentifier,
    prefix: &[u8],
) -> StatusResult<Vec<Entry>> {
    let mut entries = vec![];
    for_each_entry(store, root, prefix, &mut |entry| {
        if !entry.key.starts_with(prefix) {
            return ControlFlow::Break(());
        }
        entries.push(entry.clone());
        ControlFlow::Continue(())
    })?;
    Ok(entries)
}

/// Computes the key-sorted difference from `base_root` to `target_root`.
///
/// Entries are considered changed when their value identifier or priority
/// differs.
pub fn diff(
    store: &ObjectStore,
    base_root: &ObjectIdentifier,
    target_root: &ObjectIdentifier,
) -> StatusResult<Vec<EntryChange>> {
    if base_root.digest() == target_root.digest() {
        return Ok(vec![]);
    }
    // TODO: skip shared subtrees instead of flattening both sides.
    let base = entries_with_prefix(store, base_root, b"")?;
    let target = entries_with_prefix(store, target_root, b"")?;

    let mut changes = vec![];
    let mut base_iter = base.into_iter().peekable();
    let mut target_iter = target.into_iter().peekable();
    loop {
        match (base_iter.peek(), target_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => {
                changes.push(EntryChange {
                    base: base_iter.next(),
                    target: None,
                });
            }
            (None, Some(_)) => {
                changes.push(EntryChange {
                    base: None,
                    target: target_iter.next(),
                });
            }
            (Some(b), Some(t)) => match b.key.cmp(&t.key) {
                Ordering::Less => changes.push(EntryChange {
                    base: base_iter.next(),
                    target: None,
                }),
                Ordering::Greater => changes.push(EntryChange {
                    base: None,
                    target: target_iter.next(),
                }),
                Ordering::Equal => {
                    let b = base_iter.next().unwrap();
                    let t = target_iter.next().unwrap();
                    if b.value != t.value || b.priority != t.priority {
                        changes.push(EntryChange {
                            base: Some(b),
                            target: Some(t),
                        });
                    }
                }
            },
        }
    }
    Ok(changes)
}
