//! Versioned map entities.
//!
//! An [`Entity`] is a point, a line (an ordered list of child points), or a
//! relation (an ordered list of members). Versions are assigned by the remote
//! authority; entities created locally have no version until committed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable entity identifier such as `n42`, `w7`, `r3`, or `n-1` for an
/// entity created locally and not yet committed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The kind implied by the id prefix (`n`, `w`, `r`), if any.
    pub fn kind(&self) -> Option<EntityKind> {
        match self.0.chars().next() {
            Some('n') => Some(EntityKind::Point),
            Some('w') => Some(EntityKind::Line),
            Some('r') => Some(EntityKind::Relation),
            _ => None,
        }
    }

    /// Whether this id was allocated locally (negative numeric part).
    pub fn is_new(&self) -> bool {
        self.0.get(1..).is_some_and(|rest| rest.starts_with('-'))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Entity type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Point,
    Line,
    Relation,
}

impl EntityKind {
    /// Human-readable label used in conflict names.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Point => "Point",
            Self::Line => "Line",
            Self::Relation => "Relation",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Point => write!(f, "point"),
            Self::Line => write!(f, "line"),
            Self::Relation => write!(f, "relation"),
        }
    }
}

// ---------------------------------------------------------------------------
// Geometry & membership
// ---------------------------------------------------------------------------

/// Tolerance below which two coordinates are considered the same position.
const LOCATION_EPSILON: f64 = 1e-6;

/// A point position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lon: f64,
    pub lat: f64,
}

impl Location {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Equality within [`LOCATION_EPSILON`] on both axes.
    pub fn approx_eq(&self, other: &Location) -> bool {
        (self.lon - other.lon).abs() < LOCATION_EPSILON
            && (self.lat - other.lat).abs() < LOCATION_EPSILON
    }
}

/// A relation member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: EntityId,
    #[serde(default)]
    pub role: String,
}

impl Member {
    pub fn new(id: impl Into<EntityId>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// Tag keys that never make an entity "interesting" on their own.
const UNINTERESTING_TAGS: &[&str] = &["attribution", "created_by", "source", "odbl"];

/// A versioned domain object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Version assigned by the remote authority; `None` for new entities.
    #[serde(default)]
    pub version: Option<u64>,
    /// `false` when the entity is deleted on the remote.
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// Child point ids, in traversal order (lines only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<EntityId>,
    /// Ordered members (relations only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<Member>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Position (points only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<Location>,
    /// Remote user who produced this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

fn default_visible() -> bool {
    true
}

impl Entity {
    fn bare(id: impl Into<EntityId>, kind: EntityKind) -> Self {
        Self {
            id: id.into(),
            kind,
            version: None,
            visible: true,
            nodes: Vec::new(),
            members: Vec::new(),
            tags: BTreeMap::new(),
            loc: None,
            user: None,
        }
    }

    /// Create a point at `loc`.
    pub fn point(id: impl Into<EntityId>, loc: Location) -> Self {
        Self {
            loc: Some(loc),
            ..Self::bare(id, EntityKind::Point)
        }
    }

    /// Create a line traversing `nodes`.
    pub fn line<I, T>(id: impl Into<EntityId>, nodes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityId>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            ..Self::bare(id, EntityKind::Line)
        }
    }

    /// Create a relation with the given members.
    pub fn relation(id: impl Into<EntityId>, members: Vec<Member>) -> Self {
        Self {
            members,
            ..Self::bare(id, EntityKind::Relation)
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Mark as deleted on the remote.
    pub fn deleted(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn is_line(&self) -> bool {
        self.kind == EntityKind::Line
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Whether any tag other than bookkeeping metadata is present.
    pub fn has_interesting_tags(&self) -> bool {
        self.tags
            .keys()
            .any(|k| !UNINTERESTING_TAGS.contains(&k.as_str()) && !k.starts_with("tiger:"))
    }

    /// Name shown for this entity: its `name` or `ref` tag, else its type and id.
    pub fn display_name(&self) -> String {
        self.tag("name")
            .or_else(|| self.tag("ref"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} {}", self.kind.label(), self.id))
    }
}
