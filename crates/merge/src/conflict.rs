//! Conflict model, severities, and safe-widening tables

use serde_json::Value;
use std::fmt;

/// Kinds of merge conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConflictType {
    /// Both sides modified the same path to different values
    ModifyModify,
    /// One side deleted what the other modified
    DeleteModify,
    /// Both sides added different values at the same path
    AddAdd,
    /// Primitive or structural type diverged
    TypeChange,
    /// Relation cardinality diverged
    Cardinality,
    /// Two distinct entities would share a name post-merge
    NameCollision,
    /// The merged graph contains a reference cycle
    CircularDependency,
    /// Incompatible constraint bounds
    ConstraintConflict,
    /// Same operation with diverged parameter or return types
    InterfaceMismatch,
}

impl ConflictType {
    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ModifyModify => "modify_modify",
            ConflictType::DeleteModify => "delete_modify",
            ConflictType::AddAdd => "add_add",
            ConflictType::TypeChange => "type_change",
            ConflictType::Cardinality => "cardinality",
            ConflictType::NameCollision => "name_collision",
            ConflictType::CircularDependency => "circular_dependency",
            ConflictType::ConstraintConflict => "constraint_conflict",
            ConflictType::InterfaceMismatch => "interface_mismatch",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Conflict severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Safe to auto-resolve silently
    Info,
    /// Auto-resolvable with a warning
    Warn,
    /// Manual resolution required
    Error,
    /// The merge cannot proceed
    Block,
}

impl Severity {
    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Block => "BLOCK",
        }
    }

    /// Parse a severity name (case-insensitive).
    pub fn parse(s: &str) -> Option<Severity> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warn" | "warning" => Some(Severity::Warn),
            "error" => Some(Severity::Error),
            "block" => Some(Severity::Block),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified divergence between source and target.
#[derive(Debug, Clone)]
pub struct Conflict {
    /// Deterministic id: `<type>:<path>`
    pub id: String,
    /// Kind of conflict
    pub conflict_type: ConflictType,
    /// How severe
    pub severity: Severity,
    /// Where in the tree
    pub path: String,
    /// Value in the common ancestor
    pub base_value: Option<Value>,
    /// Value on the source side
    pub source_value: Option<Value>,
    /// Value on the target side
    pub target_value: Option<Value>,
    /// Human-readable description
    pub description: String,
    /// Whether policy may resolve it (severity within the threshold)
    pub auto_resolvable: bool,
    /// Hint for manual resolvers
    pub suggested_resolution: Option<String>,
}

impl Conflict {
    /// Build a conflict with a deterministic id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conflict_type: ConflictType,
        severity: Severity,
        path: impl Into<String>,
        base_value: Option<Value>,
        source_value: Option<Value>,
        target_value: Option<Value>,
        description: impl Into<String>,
    ) -> Self {
        let path = path.into();
        Conflict {
            id: format!("{}:{}", conflict_type.as_str(), path),
            conflict_type,
            severity,
            path,
            base_value,
            source_value,
            target_value,
            description: description.into(),
            auto_resolvable: false,
            suggested_resolution: None,
        }
    }

    /// Attach a resolution hint.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_resolution = Some(suggestion.into());
        self
    }
}

/// Safe primitive widenings: the target type's value set contains the
/// source type's.
const PRIMITIVE_WIDENINGS: &[(&str, &str)] = &[
    ("int", "float"),
    ("int", "long"),
    ("float", "double"),
    ("string", "text"),
    ("boolean", "int"),
];

/// True if `from -> to` is a safe primitive widening.
pub fn is_safe_primitive_widening(from: &str, to: &str) -> bool {
    PRIMITIVE_WIDENINGS.contains(&(from, to))
}

/// The wider of two type names, when one widens to the other.
pub fn widen_type_name<'a>(a: &'a str, b: &'a str) -> Option<&'a str> {
    if a == b {
        return Some(a);
    }
    if is_safe_primitive_widening(a, b) {
        return Some(b);
    }
    if is_safe_primitive_widening(b, a) {
        return Some(a);
    }
    None
}

/// Safe cardinality widenings; the reverse directions require data
/// migration and are errors.
const CARDINALITY_WIDENINGS: &[(&str, &str)] = &[
    ("ONE_TO_ONE", "ONE_TO_MANY"),
    ("ONE_TO_ONE", "MANY_TO_MANY"),
];

/// True if `from -> to` is a safe cardinality widening.
pub fn is_safe_cardinality_widening(from: &str, to: &str) -> bool {
    CARDINALITY_WIDENINGS.contains(&(from, to))
}

/// The wider of two cardinalities, when one widens to the other.
pub fn widen_cardinality<'a>(a: &'a str, b: &'a str) -> Option<&'a str> {
    if a == b {
        return Some(a);
    }
    if is_safe_cardinality_widening(a, b) {
        return Some(b);
    }
    if is_safe_cardinality_widening(b, a) {
        return Some(a);
    }
    None
}

/// Fields whose modification is semantically breaking, elevating
/// modify/modify conflicts to ERROR.
pub const SEMANTIC_FIELDS: &[&str] = &["type", "required", "unique", "cardinality"];
