//! Tamper detection over tracked policy files
//!
//! For each tracked policy we store a `PolicySnapshot` of cryptographic
//! fingerprints. Periodic verification compares the stored fingerprints
//! against the live file; divergence produces `TamperingEvent`s which are
//! forwarded to the SIEM collector when one is configured, and written to
//! the audit store otherwise.

use crate::event::{AuditEvent, AuditTarget};
use crate::store::AuditStore;
use chrono::{DateTime, Utc};
use ontos_core::{canon, now_utc, Actor, DocStore, Document, OntosResult, SiemSink};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::warn;

/// Collection holding policy snapshots, keyed by policy id
pub const POLICY_SNAPSHOTS: &str = "policy_snapshots";

/// Content patterns that should never appear in policy rules.
const DANGEROUS_PATTERNS: &[&str] = &["eval(", "exec(", "system(", "subprocess", "os.system", "`"];

/// Stored fingerprints of a policy file.
///
/// Any change in content, metadata, or file bytes produces a different
/// `snapshot_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Policy identifier
    pub policy_id: String,
    /// Tracked file path
    pub path: PathBuf,
    /// SHA-256 of the policy text
    pub content_hash: String,
    /// SHA-256 of the canonical metadata
    pub metadata_hash: String,
    /// SHA-256 of the raw file bytes
    pub file_hash: String,
    /// File size at capture time
    pub file_size: u64,
    /// File mtime at capture time (unix seconds)
    pub file_mtime: i64,
    /// SHA-256 of the detached signature, when signed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_hash: Option<String>,
    /// Composite hash over all of the above
    pub snapshot_hash: String,
    /// When the snapshot was captured
    pub captured_at: DateTime<Utc>,
}

impl PolicySnapshot {
    /// Fingerprint a policy file as it exists right now.
    pub fn capture(
        policy_id: impl Into<String>,
        path: impl AsRef<Path>,
        metadata: &Value,
        signature: Option<&str>,
    ) -> OntosResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let meta = std::fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let content = String::from_utf8_lossy(&bytes);
        let content_hash = canon::sha256_hex(&content);
        let metadata_hash = canon::hash_value(metadata);
        let file_hash = canon::sha256_hex_bytes(&bytes);
        let signature_hash = signature.map(canon::sha256_hex);

        let snapshot_hash = Self::composite_hash(
            &content_hash,
            &metadata_hash,
            &file_hash,
            signature_hash.as_deref(),
        );

        Ok(PolicySnapshot {
            policy_id: policy_id.into(),
            path: path.to_path_buf(),
            content_hash,
            metadata_hash,
            file_hash,
            file_size: bytes.len() as u64,
            file_mtime: mtime,
            signature_hash,
            snapshot_hash,
            captured_at: now_utc(),
        })
    }

    fn composite_hash(
        content_hash: &str,
        metadata_hash: &str,
        file_hash: &str,
        signature_hash: Option<&str>,
    ) -> String {
        canon::sha256_hex(&format!(
            "{}|{}|{}|{}",
            content_hash,
            metadata_hash,
            file_hash,
            signature_hash.unwrap_or("")
        ))
    }
}

/// Classified tampering subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TamperingKind {
    /// Policy content differs from the stored fingerprint
    UnauthorizedModification,
    /// Detached signature no longer matches
    SignatureMismatch,
    /// Known dangerous patterns appeared in the rules
    ContentInjection,
    /// Policy metadata was altered
    MetadataTampering,
    /// File size or mtime diverged while content was expected unchanged
    FileReplacement,
    /// Same hash over differing content (defensive branch)
    HashCollision,
}

impl TamperingKind {
    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            TamperingKind::UnauthorizedModification => "unauthorized_modification",
            TamperingKind::SignatureMismatch => "signature_mismatch",
            TamperingKind::ContentInjection => "content_injection",
            TamperingKind::MetadataTampering => "metadata_tampering",
            TamperingKind::FileReplacement => "file_replacement",
            TamperingKind::HashCollision => "hash_collision",
        }
    }
}

/// Severity of a tampering event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TamperSeverity {
    /// Informational
    Info,
    /// Suspicious but possibly benign
    Warning,
    /// Definite integrity problem
    Error,
    /// Active attack indicators
    Critical,
}

/// A detected tampering incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TamperingEvent {
    /// What kind of tampering
    pub kind: TamperingKind,
    /// How bad
    pub severity: TamperSeverity,
    /// Which policy
    pub policy_id: String,
    /// Structured evidence
    pub details: Value,
    /// When it was detected
    pub detected_at: DateTime<Utc>,
}

impl TamperingEvent {
    fn new(kind: TamperingKind, severity: TamperSeverity, policy_id: &str, details: Value) -> Self {
        TamperingEvent {
            kind,
            severity,
            policy_id: policy_id.to_string(),
            details,
            detected_at: now_utc(),
        }
    }
}

/// Verifies tracked policies against their stored snapshots.
pub struct PolicyIntegrityChecker<S: DocStore> {
    store: Arc<S>,
    audit: Arc<AuditStore<S>>,
    siem: Option<Arc<dyn SiemSink>>,
    siem_timeout: Duration,
}

impl<S: DocStore> PolicyIntegrityChecker<S> {
    /// Create a checker. Pass `None` for `siem` to log detections to the
    /// audit store only.
    pub fn new(
        store: Arc<S>,
        audit: Arc<AuditStore<S>>,
        siem: Option<Arc<dyn SiemSink>>,
        siem_timeout: Duration,
    ) -> Self {
        PolicyIntegrityChecker {
            store,
            audit,
            siem,
            siem_timeout,
        }
    }

    /// Start tracking a policy file: capture and persist its snapshot.
    ///
    /// Re-tracking an already tracked policy replaces the stored snapshot
    /// (legitimate updates go through here).
    pub fn track_policy(
        &self,
        policy_id: impl Into<String>,
        path: impl AsRef<Path>,
        metadata: &Value,
        signature: Option<&str>,
    ) -> OntosResult<PolicySnapshot> {
        let snapshot = PolicySnapshot::capture(policy_id, path, metadata, signature)?;
        let doc = Document::from_record(snapshot.policy_id.clone(), &snapshot)?;
        self.store.replace(POLICY_SNAPSHOTS, doc)?;
        Ok(snapshot)
    }

    /// Stored snapshot for a policy, if tracked.
    pub fn snapshot(&self, policy_id: &str) -> OntosResult<Option<PolicySnapshot>> {
        match self.store.get(POLICY_SNAPSHOTS, policy_id)? {
            Some(doc) => Ok(Some(doc.to_record()?)),
            None => Ok(None),
        }
    }

    /// Verify one policy against its stored snapshot.
    ///
    /// `live_metadata` and `live_signature` are compared against the stored
    /// hashes when supplied; file-based checks always run. Every detected
    /// event is dispatched (SIEM or audit) before being returned.
    pub fn verify_policy(
        &self,
        policy_id: &str,
        live_metadata: Option<&Value>,
        live_signature: Option<&str>,
    ) -> OntosResult<Vec<TamperingEvent>> {
        let snapshot = self
            .snapshot(policy_id)?
            .ok_or_else(|| ontos_core::OntosError::not_found("policy_snapshot", policy_id))?;

        let mut events = Vec::new();

        match std::fs::read(&snapshot.path) {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes).to_string();
                let live_content_hash = canon::sha256_hex(&content);
                let live_file_hash = canon::sha256_hex_bytes(&bytes);
                let live_size = bytes.len() as u64;
                let live_mtime = std::fs::metadata(&snapshot.path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);

                for pattern in DANGEROUS_PATTERNS {
                    if content.contains(pattern) {
                        events.push(TamperingEvent::new(
                            TamperingKind::ContentInjection,
                            TamperSeverity::Critical,
                            policy_id,
                            json!({"pattern": pattern}),
                        ));
                        break;
                    }
                }

                if live_content_hash != snapshot.content_hash {
                    events.push(TamperingEvent::new(
                        TamperingKind::UnauthorizedModification,
                        TamperSeverity::Error,
                        policy_id,
                        json!({
                            "expected_hash": snapshot.content_hash,
                            "actual_hash": live_content_hash,
                        }),
                    ));
                } else if live_size != snapshot.file_size || live_mtime != snapshot.file_mtime {
                    events.push(TamperingEvent::new(
                        TamperingKind::FileReplacement,
                        TamperSeverity::Warning,
                        policy_id,
                        json!({
                            "expected_size": snapshot.file_size,
                            "actual_size": live_size,
                            "expected_mtime": snapshot.file_mtime,
                            "actual_mtime": live_mtime,
                        }),
                    ));
                }

                if live_file_hash == snapshot.file_hash && live_size != snapshot.file_size {
                    events.push(TamperingEvent::new(
                        TamperingKind::HashCollision,
                        TamperSeverity::Critical,
                        policy_id,
                        json!({"file_hash": live_file_hash}),
                    ));
                }
            }
            Err(e) => {
                events.push(TamperingEvent::new(
                    TamperingKind::UnauthorizedModification,
                    TamperSeverity::Critical,
                    policy_id,
                    json!({"error": format!("policy file unreadable: {}", e)}),
                ));
            }
        }

        if let Some(metadata) = live_metadata {
            if canon::hash_value(metadata) != snapshot.metadata_hash {
                events.push(TamperingEvent::new(
                    TamperingKind::MetadataTampering,
                    TamperSeverity::Error,
                    policy_id,
                    json!({"expected_hash": snapshot.metadata_hash}),
                ));
            }
        }

        if let Some(signature) = live_signature {
            let live_sig_hash = canon::sha256_hex(signature);
            if snapshot.signature_hash.as_deref() != Some(live_sig_hash.as_str()) {
                events.push(TamperingEvent::new(
                    TamperingKind::SignatureMismatch,
                    TamperSeverity::Critical,
                    policy_id,
                    json!({"expected_hash": snapshot.signature_hash}),
                ));
            }
        }

        for event in &events {
            self.dispatch(event);
        }
        Ok(events)
    }

    /// Verify every tracked policy (file-based checks only).
    pub fn verify_all(&self) -> OntosResult<Vec<TamperingEvent>> {
        let docs = self.store.find(POLICY_SNAPSHOTS, &|_| true)?;
        let mut all = Vec::new();
        for doc in docs {
            let snapshot: PolicySnapshot = doc.to_record()?;
            all.extend(self.verify_policy(&snapshot.policy_id, None, None)?);
        }
        Ok(all)
    }

    fn dispatch(&self, event: &TamperingEvent) {
        let payload = serde_json::to_value(event).unwrap_or_else(|_| {
            json!({"kind": event.kind.as_str(), "policy_id": event.policy_id})
        });

        if let Some(siem) = &self.siem {
            match siem.send_event(&payload, self.siem_timeout) {
                Ok(()) => return,
                Err(e) => {
                    warn!(policy = %event.policy_id, error = %e, "SIEM forward failed, falling back to audit");
                }
            }
        }

        let audit_event = AuditEvent::new(
            "security.tampering_detected",
            Actor::system(),
            AuditTarget::new("policy", event.policy_id.clone()),
        )
        .with_metadata(payload);

        if let Err(e) = self.audit.record(audit_event) {
            warn!(policy = %event.policy_id, error = %e, "failed to audit tampering event");
        }
    }
}
