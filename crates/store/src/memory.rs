//! In-memory document store with branches and commit history
//!
//! ## Transaction model
//!
//! A transaction holds the store's write lock for its whole body. Writes
//! are staged in an overlay map and applied to the base state only when the
//! body returns `Ok`; an `Err` discards the overlay. Reads inside the
//! transaction see the overlay first, then the base.
//!
//! Holding the write lock across the body gives serializable transactions
//! for free; transaction bodies must not block on external work.
//!
//! ## History model
//!
//! Commits form a tree: each commit has at most one parent. A branch points
//! at a head commit; creating a branch copies the parent branch's head, so
//! both share history up to that commit. `lowest_common_ancestor` walks
//! parent pointers.

use ontos_core::{CommitId, Document, OntosError, OntosResult, TxnOps};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// The branch every store starts with.
pub const DEFAULT_BRANCH: &str = "main";

struct CommitRecord {
    parent: Option<CommitId>,
    tree: Value,
    author: String,
    message: String,
}

struct BranchRecord {
    parent: Option<String>,
    head: Option<CommitId>,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<String, Document>>,
    branches: HashMap<String, BranchRecord>,
    commits: HashMap<CommitId, CommitRecord>,
}

/// Process-local `DocStore` implementation.
pub struct MemoryDocStore {
    state: RwLock<StoreState>,
}

impl MemoryDocStore {
    /// Create a store with the default `main` branch and no history.
    pub fn new() -> Self {
        let mut state = StoreState::default();
        state.branches.insert(
            DEFAULT_BRANCH.to_string(),
            BranchRecord {
                parent: None,
                head: None,
            },
        );
        MemoryDocStore {
            state: RwLock::new(state),
        }
    }

    /// Number of committed documents in a collection.
    pub fn collection_len(&self, collection: &str) -> usize {
        self.state
            .read()
            .collections
            .get(collection)
            .map_or(0, |c| c.len())
    }

    /// Parent branch a branch was created from (None for root branches).
    pub fn branch_parent(&self, name: &str) -> OntosResult<Option<String>> {
        let state = self.state.read();
        let record = state
            .branches
            .get(name)
            .ok_or_else(|| OntosError::not_found("branch", name))?;
        Ok(record.parent.clone())
    }

    /// Commit metadata: author and message. Mostly for tests and tooling.
    pub fn commit_info(&self, commit: CommitId) -> OntosResult<(String, String)> {
        let state = self.state.read();
        let record = state
            .commits
            .get(&commit)
            .ok_or_else(|| OntosError::not_found("commit", commit.to_string()))?;
        Ok((record.author.clone(), record.message.clone()))
    }
}

impl Default for MemoryDocStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction scope: overlay of staged writes over the base state.
struct TxnScope<'a> {
    base: &'a mut StoreState,
    // None marks a staged delete
    staged: HashMap<(String, String), Option<Document>>,
}

impl<'a> TxnScope<'a> {
    fn committed_get(&self, collection: &str, id: &str) -> Option<&Document> {
        self.base.collections.get(collection).and_then(|c| c.get(id))
    }

    fn apply(self) {
        for ((collection, id), entry) in self.staged {
            let coll = self.base.collections.entry(collection).or_default();
            match entry {
                Some(doc) => {
                    coll.insert(id, doc);
                }
                None => {
                    coll.remove(&id);
                }
            }
        }
    }
}

impl TxnOps for TxnScope<'_> {
    fn get(&self, collection: &str, id: &str) -> OntosResult<Option<Document>> {
        if let Some(entry) = self.staged.get(&(collection.to_string(), id.to_string())) {
            return Ok(entry.clone());
        }
        Ok(self.committed_get(collection, id).cloned())
    }

    fn insert(&mut self, collection: &str, doc: Document) -> OntosResult<()> {
        if self.get(collection, &doc.id)?.is_some() {
            return Err(OntosError::already_exists(collection, doc.id));
        }
        self.staged
            .insert((collection.to_string(), doc.id.clone()), Some(doc));
        Ok(())
    }

    fn replace(&mut self, collection: &str, doc: Document) -> OntosResult<()> {
        self.staged
            .insert((collection.to_string(), doc.id.clone()), Some(doc));
        Ok(())
    }

    fn delete(&mut self, collection: &str, id: &str) -> OntosResult<bool> {
        let existed = self.get(collection, id)?.is_some();
        if existed {
            self.staged
                .insert((collection.to_string(), id.to_string()), None);
        }
        Ok(existed)
    }
}

impl ontos_core::DocStore for MemoryDocStore {
    fn txn(&self, body: &mut dyn FnMut(&mut dyn TxnOps) -> OntosResult<()>) -> OntosResult<()> {
        let mut state = self.state.write();
        let mut scope = TxnScope {
            base: &mut state,
            staged: HashMap::new(),
        };
        match body(&mut scope) {
            Ok(()) => {
                scope.apply();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn get(&self, collection: &str, id: &str) -> OntosResult<Option<Document>> {
        let state = self.state.read();
        Ok(state
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    fn find(
        &self,
        collection: &str,
        predicate: &dyn Fn(&Document) -> bool,
    ) -> OntosResult<Vec<Document>> {
        let state = self.state.read();
        let Some(coll) = state.collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(coll.values().filter(|d| predicate(d)).cloned().collect())
    }

    fn create_branch(&self, name: &str, parent: &str) -> OntosResult<()> {
        if name.is_empty() {
            return Err(OntosError::invalid_input("branch name cannot be empty"));
        }
        let mut state = self.state.write();
        if state.branches.contains_key(name) {
            return Err(OntosError::already_exists("branches", name));
        }
        let head = state
            .branches
            .get(parent)
            .ok_or_else(|| OntosError::not_found("branch", parent))?
            .head;
        state.branches.insert(
            name.to_string(),
            BranchRecord {
                parent: Some(parent.to_string()),
                head,
            },
        );
        debug!(branch = name, parent = parent, "branch created");
        Ok(())
    }

    fn delete_branch(&self, name: &str) -> OntosResult<bool> {
        let mut state = self.state.write();
        Ok(state.branches.remove(name).is_some())
    }

    fn list_branches(&self) -> OntosResult<Vec<String>> {
        let state = self.state.read();
        let mut names: Vec<String> = state.branches.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn branch_exists(&self, name: &str) -> OntosResult<bool> {
        Ok(self.state.read().branches.contains_key(name))
    }

    fn head(&self, branch: &str) -> OntosResult<Option<CommitId>> {
        let state = self.state.read();
        let record = state
            .branches
            .get(branch)
            .ok_or_else(|| OntosError::not_found("branch", branch))?;
        Ok(record.head)
    }

    fn commit_tree(
        &self,
        branch: &str,
        tree: Value,
        author: &str,
        message: &str,
    ) -> OntosResult<CommitId> {
        let mut state = self.state.write();
        let parent = state
            .branches
            .get(branch)
            .ok_or_else(|| OntosError::not_found("branch", branch))?
            .head;

        let id = CommitId::new();
        state.commits.insert(
            id,
            CommitRecord {
                parent,
                tree,
                author: author.to_string(),
                message: message.to_string(),
            },
        );
        // Branch existence was checked above
        state
            .branches
            .get_mut(branch)
            .expect("branch disappeared under write lock")
            .head = Some(id);

        debug!(branch = branch, commit = %id, author = author, "tree committed");
        Ok(id)
    }

    fn tree_at(&self, commit: CommitId) -> OntosResult<Value> {
        let state = self.state.read();
        let record = state
            .commits
            .get(&commit)
            .ok_or_else(|| OntosError::not_found("commit", commit.to_string()))?;
        Ok(record.tree.clone())
    }

    fn lowest_common_ancestor(&self, a: CommitId, b: CommitId) -> OntosResult<Option<CommitId>> {
        let state = self.state.read();
        for id in [a, b] {
            if !state.commits.contains_key(&id) {
                return Err(OntosError::not_found("commit", id.to_string()));
            }
        }

        let mut seen = HashSet::new();
        let mut cursor = Some(a);
        while let Some(id) = cursor {
            seen.insert(id);
            cursor = state.commits.get(&id).and_then(|c| c.parent);
        }

        let mut cursor = Some(b);
        while let Some(id) = cursor {
            if seen.contains(&id) {
                return Ok(Some(id));
            }
            cursor = state.commits.get(&id).and_then(|c| c.parent);
        }
        Ok(None)
    }
}
