//! Denormalized service tree.
//!
//! The store hands out records in nested-include shape, where every child
//! collection is an array. The console wants the same data with each array
//! re-keyed by id so a mutation result can be spliced in without scanning.
//! [`build`] and [`flatten`] convert between the two shapes; [`ServiceTree`]
//! owns a built tree plus an id index and applies [`Mutation`]s to it.

use crate::error::TreeError;
use crate::model::{Collection, EntityKind, Schema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

pub type Fields = Map<String, Value>;

/// A record with its child collections keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TreeNode {
    /// Scalar fields and to-one includes, verbatim.
    #[serde(flatten)]
    pub fields: Fields,
    /// Collection key → child id → child.
    #[serde(flatten)]
    pub children: BTreeMap<String, BTreeMap<String, TreeNode>>,
}

impl TreeNode {
    pub fn id(&self) -> Option<&str> {
        self.fields.get("id").and_then(Value::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(Value::as_str)
    }

    pub fn collection(&self, key: &str) -> Option<&BTreeMap<String, TreeNode>> {
        self.children.get(key)
    }

    fn node_at(&self, path: &[PathSegment]) -> Option<&TreeNode> {
        path.iter()
            .try_fold(self, |node, seg| node.children.get(&seg.collection)?.get(&seg.id))
    }

    fn node_at_mut(&mut self, path: &[PathSegment]) -> Option<&mut TreeNode> {
        let mut node = self;
        for seg in path {
            node = node.children.get_mut(&seg.collection)?.get_mut(&seg.id)?;
        }
        Some(node)
    }
}

/// One step from a parent into one of its collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSegment {
    pub kind: EntityKind,
    pub collection: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

/// Route from the root to a node. Empty for the root itself.
pub type TreePath = Vec<PathSegment>;

/// Convert a nested record of `kind` into a [`TreeNode`].
///
/// Arrays under the schema's collection keys become id-keyed maps. A `null`
/// collection has no children and stays a plain `null` field. Siblings must have distinct ids, and
/// distinct names on name-keyed collections.
pub fn build(schema: &Schema, kind: EntityKind, record: Value) -> Result<TreeNode, TreeError> {
    let Value::Object(mut fields) = record else {
        return Err(TreeError::NotAnObject { kind });
    };

    let mut children = BTreeMap::new();
    for collection in schema.collections(kind) {
        let items = match fields.remove(collection.key) {
            None => continue,
            Some(Value::Null) => {
                fields.insert(collection.key.to_string(), Value::Null);
                continue;
            }
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(TreeError::InvalidCollection {
                    kind,
                    key: collection.key.to_string(),
                })
            }
        };
        children.insert(
            collection.key.to_string(),
            build_collection(schema, collection, items)?,
        );
    }

    Ok(TreeNode { fields, children })
}

fn build_collection(
    schema: &Schema,
    collection: &Collection,
    items: Vec<Value>,
) -> Result<BTreeMap<String, TreeNode>, TreeError> {
    let mut nodes = BTreeMap::new();
    let mut names: HashMap<String, String> = HashMap::new();

    for item in items {
        let mut node = build(schema, collection.child, item)?;
        node.fields.remove(collection.parent_field);

        let id = node
            .id()
            .ok_or(TreeError::MissingId {
                kind: collection.child,
            })?
            .to_string();
        if nodes.contains_key(&id) {
            return Err(TreeError::DuplicateId {
                kind: collection.child,
                id,
            });
        }
        if let Some(name) = node.name().filter(|_| collection.unique_name) {
            if names.insert(name.to_string(), id.clone()).is_some() {
                return Err(TreeError::DuplicateName {
                    key: collection.key.to_string(),
                    name: name.to_string(),
                });
            }
        }
        nodes.insert(id, node);
    }

    Ok(nodes)
}

/// Inverse of [`build`]: every id-keyed map becomes an array again, in id order.
pub fn flatten(node: &TreeNode) -> Value {
    let mut fields = node.fields.clone();
    for (key, children) in &node.children {
        fields.insert(
            key.clone(),
            Value::Array(children.values().map(flatten).collect()),
        );
    }
    Value::Object(fields)
}

/// A change reported by the store after a successful write.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Mutation {
    /// A created or updated record, optionally carrying its own subtree and
    /// its included parent.
    Upsert { kind: EntityKind, record: Value },
    /// A deleted record.
    Remove { kind: EntityKind, id: String },
    /// The whole root record, as returned by operations that re-read it.
    Replace { record: Value },
}

/// Where a mutation landed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOutcome {
    pub kind: EntityKind,
    pub id: String,
    pub path: TreePath,
    pub created: bool,
}

/// A built tree plus an index from `(kind, id)` to the node's path.
#[derive(Debug, Clone)]
pub struct ServiceTree {
    schema: Arc<Schema>,
    root_id: String,
    root: TreeNode,
    index: HashMap<(EntityKind, String), TreePath>,
}

impl ServiceTree {
    /// Build a tree from a root record in nested-include shape.
    pub fn new(schema: Arc<Schema>, record: Value) -> Result<Self, TreeError> {
        let root = build(&schema, schema.root(), record)?;
        let root_id = root
            .id()
            .ok_or(TreeError::MissingId {
                kind: schema.root(),
            })?
            .to_string();

        let mut index = HashMap::new();
        index_children(&schema, &root, schema.root(), &mut Vec::new(), &mut index)?;

        info!(
            "Built {} tree {} ({} nodes)",
            schema.root(),
            root_id,
            index.len() + 1
        );

        Ok(Self {
            schema,
            root_id,
            root,
            index,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    /// The tree in nested-include (array) shape.
    pub fn records(&self) -> Value {
        flatten(&self.root)
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&TreeNode> {
        if kind == self.schema.root() {
            return (id == self.root_id).then_some(&self.root);
        }
        let path = self.index.get(&(kind, id.to_string()))?;
        self.root.node_at(path)
    }

    pub fn path_of(&self, kind: EntityKind, id: &str) -> Option<&[PathSegment]> {
        if kind == self.schema.root() {
            return (id == self.root_id).then_some(&[] as &[PathSegment]);
        }
        self.index.get(&(kind, id.to_string())).map(Vec::as_slice)
    }

    /// The node of `ancestor` kind above (or at) `kind`/`id`.
    pub fn ancestor(&self, kind: EntityKind, id: &str, ancestor: EntityKind) -> Option<&TreeNode> {
        let path = self.path_of(kind, id)?;
        if ancestor == self.schema.root() {
            return Some(&self.root);
        }
        let depth = path.iter().position(|seg| seg.kind == ancestor)?;
        self.root.node_at(&path[..=depth])
    }

    /// All nodes of one kind, in id order.
    pub fn nodes(&self, kind: EntityKind) -> Vec<&TreeNode> {
        if kind == self.schema.root() {
            return vec![&self.root];
        }
        let mut paths: Vec<_> = self
            .index
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .collect();
        paths.sort_by(|a, b| a.0 .1.cmp(&b.0 .1));
        paths
            .into_iter()
            .filter_map(|(_, path)| self.root.node_at(path))
            .collect()
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        if kind == self.schema.root() {
            return 1;
        }
        self.index.keys().filter(|(k, _)| *k == kind).count()
    }

    /// `{ value, label }` pairs for one collection of a node, in label order.
    pub fn children(
        &self,
        kind: EntityKind,
        id: &str,
        collection: &str,
    ) -> Option<Vec<SelectOption>> {
        let node = self.get(kind, id)?;
        let mut options: Vec<SelectOption> = node
            .collection(collection)
            .map(|children| {
                children
                    .iter()
                    .map(|(child_id, child)| SelectOption {
                        value: child_id.clone(),
                        label: child.name().unwrap_or(child_id).to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        options.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.value.cmp(&b.value)));
        Some(options)
    }

    /// Hex sha256 of the canonical flattened tree.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(&self.records()).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Apply a mutation. On error the tree is left exactly as it was.
    pub fn apply(&mut self, mutation: Mutation) -> Result<MutationOutcome, TreeError> {
        match mutation {
            Mutation::Upsert { kind, record } if kind == self.schema.root() => {
                self.upsert_root(record)
            }
            Mutation::Upsert { kind, record } => self.upsert(kind, record),
            Mutation::Remove { kind, id } => self.remove(kind, &id),
            Mutation::Replace { record } => self.replace(record),
        }
    }

    fn upsert(&mut self, kind: EntityKind, record: Value) -> Result<MutationOutcome, TreeError> {
        let edge = self
            .schema
            .edge_to(kind)
            .ok_or(TreeError::UnknownKind { kind })?
            .clone();
        let parent_id = parent_reference(&edge, &record);

        let mut node = build(&self.schema, kind, record)?;
        node.fields.remove(edge.parent_field);
        let id = node.id().ok_or(TreeError::MissingId { kind })?.to_string();
        let parent_id = parent_id.ok_or_else(|| TreeError::MissingParent {
            kind,
            id: id.clone(),
            foreign_key: edge.foreign_key.to_string(),
        })?;

        let mut path = self.parent_path(edge.parent, &parent_id)?;
        path.push(PathSegment {
            kind,
            collection: edge.key.to_string(),
            id,
        });
        self.splice(&path, node)
    }

    /// Put `node` at `path`, replacing whatever node of the same kind and id
    /// sits anywhere in the tree. The parent at `path[..len - 1]` must exist.
    ///
    /// Collections `node` leaves out keep the children already cached. On
    /// error the tree is left exactly as it was.
    pub fn splice(
        &mut self,
        path: &[PathSegment],
        mut node: TreeNode,
    ) -> Result<MutationOutcome, TreeError> {
        let Some((last, parent_path)) = path.split_last() else {
            return self.splice_root(node);
        };
        let kind = last.kind;
        let id = last.id.clone();
        let edge = self
            .schema
            .edge_to(kind)
            .ok_or(TreeError::UnknownKind { kind })?
            .clone();
        let parent_kind = parent_path.last().map_or(self.schema.root(), |seg| seg.kind);
        if edge.key != last.collection || edge.parent != parent_kind {
            return Err(TreeError::InvalidCollection {
                kind: parent_kind,
                key: last.collection.clone(),
            });
        }
        node.fields.insert("id".to_string(), Value::String(id.clone()));

        let parent_id = parent_path
            .last()
            .map_or(self.root_id.as_str(), |seg| seg.id.as_str())
            .to_string();
        let parent = self
            .root
            .node_at(parent_path)
            .ok_or_else(|| TreeError::AncestorNotFound {
                kind: edge.parent,
                id: parent_id.clone(),
            })?;
        check_name(parent, &edge, &id, &node)?;

        // Collections the result leaves out keep the children already cached.
        let old_path = self.index.get(&(kind, id.clone())).cloned();
        if let Some(old) = old_path.as_ref().and_then(|p| self.root.node_at(p)) {
            for (key, children) in &old.children {
                if !node.children.contains_key(key) {
                    node.fields.remove(key);
                    node.children.insert(key.clone(), children.clone());
                }
            }
        }

        let path = path.to_vec();
        let mut fresh = HashMap::new();
        fresh.insert((kind, id.clone()), path.clone());
        index_children(&self.schema, &node, kind, &mut path.clone(), &mut fresh)?;
        for key in fresh.keys() {
            if let Some(existing) = self.index.get(key) {
                let inside_old = old_path
                    .as_ref()
                    .is_some_and(|old| existing.starts_with(old));
                if !inside_old {
                    return Err(TreeError::DuplicateId {
                        kind: key.0,
                        id: key.1.clone(),
                    });
                }
            }
        }

        // Validation done; from here on nothing fails.
        if let Some(old) = &old_path {
            self.detach(old);
        }
        if let Some(parent) = self.root.node_at_mut(parent_path) {
            parent
                .children
                .entry(edge.key.to_string())
                .or_default()
                .insert(id.clone(), node);
        }
        self.index.extend(fresh);

        let created = old_path.is_none();
        debug!(
            "{} {} {} under {} {}",
            if created { "Inserted" } else { "Updated" },
            kind,
            id,
            edge.parent,
            parent_id
        );

        Ok(MutationOutcome {
            kind,
            id,
            path,
            created,
        })
    }

    fn upsert_root(&mut self, record: Value) -> Result<MutationOutcome, TreeError> {
        let node = build(&self.schema, self.schema.root(), record)?;
        self.splice_root(node)
    }

    fn splice_root(&mut self, mut node: TreeNode) -> Result<MutationOutcome, TreeError> {
        let kind = self.schema.root();
        let id = node.id().ok_or(TreeError::MissingId { kind })?.to_string();
        if id != self.root_id {
            return Err(TreeError::RootMismatch {
                id,
                root: self.root_id.clone(),
            });
        }

        for (key, children) in &self.root.children {
            if !node.children.contains_key(key) {
                node.fields.remove(key);
                node.children.insert(key.clone(), children.clone());
            }
        }
        let mut index = HashMap::new();
        index_children(&self.schema, &node, kind, &mut Vec::new(), &mut index)?;

        self.root = node;
        self.index = index;
        debug!("Updated root {} {}", kind, id);

        Ok(MutationOutcome {
            kind,
            id,
            path: Vec::new(),
            created: false,
        })
    }

    /// The root cannot be removed; drop the whole tree instead.
    fn remove(&mut self, kind: EntityKind, id: &str) -> Result<MutationOutcome, TreeError> {
        let not_found = || TreeError::NodeNotFound {
            kind,
            id: id.to_string(),
        };
        let path = self
            .index
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(not_found)?;

        self.detach(&path);
        debug!("Removed {} {}", kind, id);

        Ok(MutationOutcome {
            kind,
            id: id.to_string(),
            path,
            created: false,
        })
    }

    fn replace(&mut self, record: Value) -> Result<MutationOutcome, TreeError> {
        let rebuilt = Self::new(self.schema.clone(), record)?;
        if rebuilt.root_id != self.root_id {
            return Err(TreeError::RootMismatch {
                id: rebuilt.root_id,
                root: self.root_id.clone(),
            });
        }
        *self = rebuilt;

        Ok(MutationOutcome {
            kind: self.schema.root(),
            id: self.root_id.clone(),
            path: Vec::new(),
            created: false,
        })
    }

    fn parent_path(&self, kind: EntityKind, id: &str) -> Result<TreePath, TreeError> {
        let missing = || TreeError::AncestorNotFound {
            kind,
            id: id.to_string(),
        };
        if kind == self.schema.root() {
            return if id == self.root_id {
                Ok(Vec::new())
            } else {
                Err(missing())
            };
        }
        self.index
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(missing)
    }

    /// Unlink the node at `path` and drop it and its descendants from the index.
    fn detach(&mut self, path: &[PathSegment]) {
        let Some((last, parent_path)) = path.split_last() else {
            return;
        };
        let removed = self
            .root
            .node_at_mut(parent_path)
            .and_then(|parent| parent.children.get_mut(&last.collection))
            .and_then(|siblings| siblings.remove(&last.id));

        if let Some(node) = removed {
            unindex(&self.schema, &node, last.kind, &last.id, &mut self.index);
        }
    }
}

/// The parent id a record points at: its foreign key, or the id of an
/// included parent record.
fn parent_reference(edge: &Collection, record: &Value) -> Option<String> {
    record
        .get(edge.foreign_key)
        .and_then(Value::as_str)
        .or_else(|| {
            record
                .get(edge.parent_field)
                .and_then(|parent| parent.get("id"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
}

fn check_name(
    parent: &TreeNode,
    edge: &Collection,
    id: &str,
    node: &TreeNode,
) -> Result<(), TreeError> {
    if !edge.unique_name {
        return Ok(());
    }
    let (Some(name), Some(siblings)) = (node.name(), parent.collection(edge.key)) else {
        return Ok(());
    };
    let clash = siblings
        .iter()
        .find(|(sibling_id, sibling)| sibling_id.as_str() != id && sibling.name() == Some(name));

    match clash {
        Some((existing, _)) => Err(TreeError::NameConflict {
            kind: edge.child,
            id: id.to_string(),
            existing: existing.clone(),
            name: name.to_string(),
        }),
        None => Ok(()),
    }
}

fn index_children(
    schema: &Schema,
    node: &TreeNode,
    kind: EntityKind,
    prefix: &mut TreePath,
    index: &mut HashMap<(EntityKind, String), TreePath>,
) -> Result<(), TreeError> {
    for collection in schema.collections(kind) {
        let Some(children) = node.children.get(collection.key) else {
            continue;
        };
        for (id, child) in children {
            prefix.push(PathSegment {
                kind: collection.child,
                collection: collection.key.to_string(),
                id: id.clone(),
            });
            if index
                .insert((collection.child, id.clone()), prefix.clone())
                .is_some()
            {
                return Err(TreeError::DuplicateId {
                    kind: collection.child,
                    id: id.clone(),
                });
            }
            index_children(schema, child, collection.child, prefix, index)?;
            prefix.pop();
        }
    }
    Ok(())
}

fn unindex(
    schema: &Schema,
    node: &TreeNode,
    kind: EntityKind,
    id: &str,
    index: &mut HashMap<(EntityKind, String), TreePath>,
) {
    index.remove(&(kind, id.to_string()));
    for collection in schema.collections(kind) {
        if let Some(children) = node.children.get(collection.key) {
            for (child_id, child) in children {
                unindex(schema, child, collection.child, child_id, index);
            }
        }
    }
}
