//! External interface traits
//!
//! The core talks to three collaborators it does not implement:
//! a versioned document store, a message bus, and (optionally) a SIEM
//! collector. Each is behind a trait so implementations can be swapped
//! without touching the subsystems.
//!
//! Thread safety: all implementations must be safe to call concurrently
//! from multiple threads (`Send + Sync`).

use crate::error::OntosResult;
use crate::types::{CommitId, Document};
use serde_json::Value;
use std::time::Duration;

/// Operations available inside a DocStore transaction.
///
/// Reads observe both committed state and writes staged earlier in the
/// same transaction. Writes are invisible to other callers until the
/// transaction body returns `Ok`.
pub trait TxnOps {
    /// Get a document by id
    fn get(&self, collection: &str, id: &str) -> OntosResult<Option<Document>>;

    /// Insert a document; fails with `AlreadyExists` if the id is taken.
    ///
    /// This is the uniqueness primitive: collections keyed by a semantic
    /// value (e.g. idempotency keys) rely on insert-time rejection.
    fn insert(&mut self, collection: &str, doc: Document) -> OntosResult<()>;

    /// Insert or overwrite a document
    fn replace(&mut self, collection: &str, doc: Document) -> OntosResult<()>;

    /// Delete a document; returns false if it did not exist
    fn delete(&mut self, collection: &str, id: &str) -> OntosResult<bool>;
}

/// Abstract versioned document store (external collaborator).
///
/// Documents are JSON-like trees organized into named collections.
/// Branch and commit primitives expose just enough history for merges:
/// heads, tree snapshots, and lowest-common-ancestor queries.
pub trait DocStore: Send + Sync {
    /// Execute `body` within a transaction: all writes commit together or
    /// not at all. An `Err` from the body discards every staged write.
    fn txn(&self, body: &mut dyn FnMut(&mut dyn TxnOps) -> OntosResult<()>) -> OntosResult<()>;

    /// Get a committed document by id
    fn get(&self, collection: &str, id: &str) -> OntosResult<Option<Document>>;

    /// All committed documents matching a predicate, in id order
    fn find(
        &self,
        collection: &str,
        predicate: &dyn Fn(&Document) -> bool,
    ) -> OntosResult<Vec<Document>>;

    /// Single-document insert (convenience wrapper over `txn`)
    fn insert(&self, collection: &str, doc: Document) -> OntosResult<()> {
        self.txn(&mut |t| t.insert(collection, doc.clone()))
    }

    /// Single-document replace (convenience wrapper over `txn`)
    fn replace(&self, collection: &str, doc: Document) -> OntosResult<()> {
        self.txn(&mut |t| t.replace(collection, doc.clone()))
    }

    /// Single-document delete (convenience wrapper over `txn`)
    fn delete(&self, collection: &str, id: &str) -> OntosResult<bool> {
        let mut existed = false;
        self.txn(&mut |t| {
            existed = t.delete(collection, id)?;
            Ok(())
        })?;
        Ok(existed)
    }

    /// Create a branch from a parent branch's current head.
    ///
    /// Fails if the branch exists or the parent does not.
    fn create_branch(&self, name: &str, parent: &str) -> OntosResult<()>;

    /// Delete a branch; returns false if it did not exist
    fn delete_branch(&self, name: &str) -> OntosResult<bool>;

    /// Names of all branches
    fn list_branches(&self) -> OntosResult<Vec<String>>;

    /// True if the branch exists
    fn branch_exists(&self, name: &str) -> OntosResult<bool>;

    /// Current head commit of a branch (None for an empty root branch)
    fn head(&self, branch: &str) -> OntosResult<Option<CommitId>>;

    /// Commit a tree snapshot to a branch, advancing its head
    fn commit_tree(
        &self,
        branch: &str,
        tree: Value,
        author: &str,
        message: &str,
    ) -> OntosResult<CommitId>;

    /// Tree snapshot stored at a commit
    fn tree_at(&self, commit: CommitId) -> OntosResult<Value>;

    /// Most recent commit reachable from both `a` and `b`
    fn lowest_common_ancestor(&self, a: CommitId, b: CommitId) -> OntosResult<Option<CommitId>>;
}

/// Minimal message bus contract (external collaborator).
///
/// Delivery is assumed at-least-once; exactly-once producer semantics come
/// from the outbox idempotency key, carried as a protocol header.
pub trait MessageBus: Send + Sync {
    /// Publish a payload to a subject within the deadline.
    ///
    /// `headers` carries protocol metadata outside the payload (notably
    /// the idempotency key). Deadline exceeded is a failure and follows
    /// the caller's retry rules.
    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        headers: &[(&str, &str)],
        deadline: Duration,
    ) -> OntosResult<()>;
}

/// Optional SIEM collector (external collaborator).
///
/// When absent, tamper and integrity events are written to the audit
/// store only.
pub trait SiemSink: Send + Sync {
    /// Forward a security event within the deadline
    fn send_event(&self, event: &Value, deadline: Duration) -> OntosResult<()>;
}
