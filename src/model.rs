use serde::{Deserialize, Serialize};

/// Person identifier assigned by the remote service. Opaque; equality is
/// exact string equality.
pub type Pid = String;

/// Check a seed id against the service's `XXXX-XXX` shape. Only the CLI
/// validates; ids coming back from the service are trusted as-is.
pub fn is_valid_seed(pid: &str) -> bool {
    let bytes = pid.as_bytes();
    if bytes.len() != 8 || bytes[4] != b'-' {
        return false;
    }
    bytes
        .iter()
        .enumerate()
        .all(|(i, b)| i == 4 || b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Vertex color, stored as INTEGER in the VERTEX table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Unknown = 0,
    Male = 1,
    Female = 2,
}

impl Gender {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Gender::Male,
            2 => Gender::Female,
            _ => Gender::Unknown,
        }
    }

    /// Map a GEDCOM-X gender type URI.
    pub fn from_gedcomx(uri: &str) -> Self {
        match uri {
            "http://gedcomx.org/Male" => Gender::Male,
            "http://gedcomx.org/Female" => Gender::Female,
            _ => Gender::Unknown,
        }
    }
}

/// Parent-child edge type.
///
/// The first three are "biological-ish": downstream graph readers follow
/// them. `Resolve` marks an edge whose type must be authoritatively fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipType {
    UnspecifiedParentType,
    AssumedBiological,
    BiologicalParent,
    NonBiological,
    Resolve,
}

impl RelationshipType {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipType::UnspecifiedParentType => "UnspecifiedParentType",
            RelationshipType::AssumedBiological => "AssumedBiological",
            RelationshipType::BiologicalParent => "BiologicalParent",
            RelationshipType::NonBiological => "NonBiological",
            RelationshipType::Resolve => "Resolve",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UnspecifiedParentType" => Some(RelationshipType::UnspecifiedParentType),
            "AssumedBiological" => Some(RelationshipType::AssumedBiological),
            "BiologicalParent" => Some(RelationshipType::BiologicalParent),
            "NonBiological" => Some(RelationshipType::NonBiological),
            "Resolve" => Some(RelationshipType::Resolve),
            _ => None,
        }
    }

    /// Map a GEDCOM-X parent-child fact type URI to an edge type. Fact URIs
    /// other than BiologicalParent (adoptive, foster, step, ...) are
    /// non-biological for our purposes.
    pub fn from_fact_uri(uri: &str) -> Self {
        match uri.trim_end_matches('/').rsplit('/').next() {
            Some("BiologicalParent") => RelationshipType::BiologicalParent,
            Some("") | None => RelationshipType::UnspecifiedParentType,
            Some(_) => RelationshipType::NonBiological,
        }
    }

    pub fn is_biological_ish(self) -> bool {
        matches!(
            self,
            RelationshipType::UnspecifiedParentType
                | RelationshipType::AssumedBiological
                | RelationshipType::BiologicalParent
        )
    }
}

/// Conflict-resolution policy when multiple sources disagree on an edge
/// type. `rank` is ordered weakest-first; a candidate replaces the current
/// type only when it ranks higher. `NonBiological` sits outside the rank:
/// it wins only when the resolver returns it explicitly.
#[derive(Debug, Clone)]
pub struct ResolutionPolicy {
    pub rank: Vec<RelationshipType>,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self {
            rank: vec![
                RelationshipType::UnspecifiedParentType,
                RelationshipType::AssumedBiological,
                RelationshipType::BiologicalParent,
            ],
        }
    }
}

impl ResolutionPolicy {
    fn rank_of(&self, t: RelationshipType) -> Option<usize> {
        self.rank.iter().position(|&r| r == t)
    }

    /// Pick the winner between a current type and a newly reported one.
    pub fn merge(&self, current: RelationshipType, reported: RelationshipType) -> RelationshipType {
        if reported == RelationshipType::NonBiological {
            return reported;
        }
        match (self.rank_of(current), self.rank_of(reported)) {
            (Some(c), Some(r)) if r > c => reported,
            (None, Some(_)) => reported, // current is Resolve/NonBiological placeholder
            _ => current,
        }
    }

    /// Fold a list of reported fact types into one authoritative type.
    pub fn authoritative(&self, reported: &[RelationshipType]) -> RelationshipType {
        let mut result = RelationshipType::UnspecifiedParentType;
        for &t in reported {
            result = self.merge(result, t);
        }
        result
    }
}

/// The record for one person, as persisted in VERTEX.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vertex {
    pub pid: Pid,
    pub gender: Gender,
    pub surname: String,
    pub given_name: String,
    /// Hop at which this vertex was first promoted from the frontier; 0 for seeds.
    pub iteration: u32,
    pub lifespan: String,
}

/// A directed parent→child link, keyed by (source, destination, rel_id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Parent pid.
    pub source: Pid,
    /// Child pid.
    pub destination: Pid,
    pub rel_id: String,
    pub rel_type: RelationshipType,
}

/// One completed iteration as persisted in LOG. Counts are totals at
/// iteration close; the edge split is by endpoint membership in VERTEX
/// (both in / one in / neither in).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub duration_s: f64,
    pub vertices: u64,
    pub frontier: u64,
    pub edges: u64,
    pub spanning_edges: u64,
    pub frontier_edges: u64,
}

/// Run lifecycle status persisted in JOB_METADATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Resolving,
    Done,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Resolving => "resolving",
            RunStatus::Done => "done",
            RunStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(RunStatus::Idle),
            "running" => Some(RunStatus::Running),
            "paused" => Some(RunStatus::Paused),
            "resolving" => Some(RunStatus::Resolving),
            "done" => Some(RunStatus::Done),
            "aborted" => Some(RunStatus::Aborted),
            _ => None,
        }
    }
}

/// One person record parsed from a `persons` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonRecord {
    pub pid: Pid,
    pub gender: Gender,
    pub surname: String,
    pub given_name: String,
    pub lifespan: String,
}

/// One parent→child relationship parsed from a `persons` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentChildRecord {
    pub parent: Pid,
    pub child: Pid,
    pub rel_id: String,
    /// Type carried by the payload itself, when a typed fact was present.
    pub fact_type: Option<RelationshipType>,
}

/// Parsed `persons` response: the people plus the parent→child links they
/// reference. `couple_members` are pids seen only through Couple
/// relationships; they still feed frontier discovery.
#[derive(Debug, Clone, Default)]
pub struct PersonsPayload {
    pub persons: Vec<PersonRecord>,
    pub parent_child: Vec<ParentChildRecord>,
    pub couple_members: Vec<Pid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_validation() {
        assert!(is_valid_seed("KWZP-8K9"));
        assert!(is_valid_seed("L1X2-ABC"));
        assert!(!is_valid_seed("kwzp-8k9"));
        assert!(!is_valid_seed("KWZP8K9"));
        assert!(!is_valid_seed("KWZP-8K"));
        assert!(!is_valid_seed(""));
    }

    #[test]
    fn test_relationship_type_round_trip() {
        for t in [
            RelationshipType::UnspecifiedParentType,
            RelationshipType::AssumedBiological,
            RelationshipType::BiologicalParent,
            RelationshipType::NonBiological,
            RelationshipType::Resolve,
        ] {
            assert_eq!(RelationshipType::parse(t.as_str()), Some(t));
        }
        assert_eq!(RelationshipType::parse("UntypedCouple"), None);
    }

    #[test]
    fn test_fact_uri_mapping() {
        assert_eq!(
            RelationshipType::from_fact_uri("http://gedcomx.org/BiologicalParent"),
            RelationshipType::BiologicalParent
        );
        assert_eq!(
            RelationshipType::from_fact_uri("http://gedcomx.org/AdoptiveParent"),
            RelationshipType::NonBiological
        );
        assert_eq!(
            RelationshipType::from_fact_uri(""),
            RelationshipType::UnspecifiedParentType
        );
    }

    #[test]
    fn test_precedence_default() {
        let policy = ResolutionPolicy::default();
        assert_eq!(
            policy.merge(
                RelationshipType::UnspecifiedParentType,
                RelationshipType::BiologicalParent
            ),
            RelationshipType::BiologicalParent
        );
        // Higher rank is never downgraded by a weaker report.
        assert_eq!(
            policy.merge(
                RelationshipType::BiologicalParent,
                RelationshipType::AssumedBiological
            ),
            RelationshipType::BiologicalParent
        );
        // Explicit NonBiological always wins.
        assert_eq!(
            policy.merge(
                RelationshipType::BiologicalParent,
                RelationshipType::NonBiological
            ),
            RelationshipType::NonBiological
        );
    }

    #[test]
    fn test_authoritative_fold() {
        let policy = ResolutionPolicy::default();
        assert_eq!(
            policy.authoritative(&[
                RelationshipType::AssumedBiological,
                RelationshipType::BiologicalParent,
            ]),
            RelationshipType::BiologicalParent
        );
        assert_eq!(
            policy.authoritative(&[]),
            RelationshipType::UnspecifiedParentType
        );
    }

    #[test]
    fn test_gender_mapping() {
        assert_eq!(Gender::from_gedcomx("http://gedcomx.org/Male"), Gender::Male);
        assert_eq!(
            Gender::from_gedcomx("http://gedcomx.org/Female"),
            Gender::Female
        );
        assert_eq!(Gender::from_gedcomx("something-else"), Gender::Unknown);
        assert_eq!(Gender::from_i64(Gender::Female.as_i64()), Gender::Female);
    }
}
