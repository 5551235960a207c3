//! The remote tree API: URL construction and GEDCOM-X payload parsing.
//!
//! `TreeApi` is the seam between the iteration engine and the network;
//! production drives [`FamilySearchApi`] over HTTP, the scenario tests
//! drive a canned stub.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CrawlError, Result};
use crate::model::{
    Gender, ParentChildRecord, PersonRecord, PersonsPayload, Pid, RelationshipType,
};
use crate::session::ApiSession;

const PERSONS_PATH: &str = "/platform/tree/persons/.json?pids=";
const RELATIONSHIP_PATH: &str = "/platform/tree/child-and-parents-relationships";

const COUPLE_URI: &str = "http://gedcomx.org/Couple";
const PARENT_CHILD_URI: &str = "http://gedcomx.org/ParentChild";
const GIVEN_URI: &str = "http://gedcomx.org/Given";
const SURNAME_URI: &str = "http://gedcomx.org/Surname";

#[async_trait]
pub trait TreeApi: Send + Sync {
    /// Fetch one batch of persons. Single request, no retry; the engine
    /// owns retry policy.
    async fn fetch_persons(&self, pids: &[Pid]) -> Result<PersonsPayload>;

    /// Fetch the typed facts of one child-and-parents relationship.
    async fn fetch_relationship(&self, rel_id: &str) -> Result<Vec<RelationshipType>>;

    /// Requests issued so far.
    fn request_count(&self) -> u64;
}

pub struct FamilySearchApi {
    session: ApiSession,
}

impl FamilySearchApi {
    pub fn new(session: ApiSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl TreeApi for FamilySearchApi {
    async fn fetch_persons(&self, pids: &[Pid]) -> Result<PersonsPayload> {
        let path = format!("{}{}", PERSONS_PATH, pids.join(","));
        match self.session.get_json(&path).await? {
            Some(json) => parse_persons(&json),
            None => Ok(PersonsPayload::default()),
        }
    }

    async fn fetch_relationship(&self, rel_id: &str) -> Result<Vec<RelationshipType>> {
        let path = format!("{RELATIONSHIP_PATH}/{rel_id}.json");
        match self.session.get_json(&path).await? {
            Some(json) => Ok(parse_relationship_facts(&json)),
            None => Ok(Vec::new()),
        }
    }

    fn request_count(&self) -> u64 {
        self.session.request_count()
    }
}

/// Parse a `persons` response. Individual malformed records are skipped
/// with a warning; a payload that is not an object at all is corrupt.
pub fn parse_persons(json: &Value) -> Result<PersonsPayload> {
    if !json.is_object() {
        return Err(CrawlError::CorruptPayload(
            "persons payload is not an object".to_string(),
        ));
    }

    let mut payload = PersonsPayload::default();

    if let Some(persons) = json.get("persons").and_then(Value::as_array) {
        for person in persons {
            match parse_person(person) {
                Some(record) => payload.persons.push(record),
                None => {
                    tracing::warn!(record = %person, "skipping malformed person record");
                }
            }
        }
    }

    if let Some(relationships) = json.get("relationships").and_then(Value::as_array) {
        for rel in relationships {
            let rel_type = rel.get("type").and_then(Value::as_str).unwrap_or_default();
            let person1 = resource_id(rel.get("person1"));
            let person2 = resource_id(rel.get("person2"));
            match rel_type {
                PARENT_CHILD_URI => {
                    let (Some(parent), Some(child)) = (person1, person2) else {
                        tracing::warn!(record = %rel, "skipping parent-child record without both endpoints");
                        continue;
                    };
                    let Some(rel_id) = relationship_id(rel) else {
                        tracing::warn!(record = %rel, "skipping parent-child record without id");
                        continue;
                    };
                    let fact_type = rel
                        .get("facts")
                        .and_then(Value::as_array)
                        .map(|facts| fact_types(facts))
                        .filter(|types| !types.is_empty())
                        .map(|types| types[0]);
                    payload.parent_child.push(ParentChildRecord {
                        parent,
                        child,
                        rel_id,
                        fact_type,
                    });
                }
                COUPLE_URI => {
                    // Couples carry no parent edge, but both members are
                    // discovered vertices.
                    payload.couple_members.extend(person1);
                    payload.couple_members.extend(person2);
                }
                other => {
                    tracing::warn!(rel_type = other, "unknown relationship type");
                }
            }
        }
    }

    Ok(payload)
}

/// Pull the typed parent facts out of a child-and-parents response, in
/// document order. The resolver folds them through its precedence policy.
pub fn parse_relationship_facts(json: &Value) -> Vec<RelationshipType> {
    let mut types = Vec::new();
    let Some(records) = json
        .get("childAndParentsRelationships")
        .and_then(Value::as_array)
    else {
        return types;
    };
    for record in records {
        for key in ["parent1Facts", "parent2Facts"] {
            if let Some(facts) = record.get(key).and_then(Value::as_array) {
                types.extend(fact_types(facts));
            }
        }
    }
    types
}

fn parse_person(person: &Value) -> Option<PersonRecord> {
    let pid = person.get("id")?.as_str()?.to_string();
    let gender = person
        .get("gender")
        .and_then(|g| g.get("type"))
        .and_then(Value::as_str)
        .map(Gender::from_gedcomx)
        .unwrap_or(Gender::Unknown);
    let lifespan = person
        .get("display")
        .and_then(|d| d.get("lifespan"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let (surname, given_name) = person
        .get("names")
        .and_then(Value::as_array)
        .and_then(|names| preferred_name_parts(names))
        .unwrap_or_default();

    Some(PersonRecord {
        pid,
        gender,
        surname,
        given_name,
        lifespan,
    })
}

/// Pick the preferred name (or the first one) and split it into
/// (surname, given).
fn preferred_name_parts(names: &[Value]) -> Option<(String, String)> {
    let name = names
        .iter()
        .find(|n| n.get("preferred").and_then(Value::as_bool) == Some(true))
        .or_else(|| names.first())?;
    let parts = name
        .get("nameForms")?
        .as_array()?
        .first()?
        .get("parts")?
        .as_array()?;

    let mut surname = String::new();
    let mut given = String::new();
    for part in parts {
        let value = part.get("value").and_then(Value::as_str).unwrap_or_default();
        match part.get("type").and_then(Value::as_str) {
            Some(SURNAME_URI) => surname = value.to_string(),
            Some(GIVEN_URI) => given = value.to_string(),
            _ => {}
        }
    }
    Some((surname, given))
}

fn resource_id(value: Option<&Value>) -> Option<Pid> {
    Some(value?.get("resourceId")?.as_str()?.to_string())
}

/// The relationship id carries a 2-character prefix on the wire.
fn relationship_id(rel: &Value) -> Option<String> {
    let raw = rel.get("id")?.as_str()?;
    let trimmed = raw.get(2..)?;
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

fn fact_types(facts: &[Value]) -> Vec<RelationshipType> {
    facts
        .iter()
        .filter_map(|f| f.get("type").and_then(Value::as_str))
        .map(RelationshipType::from_fact_uri)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person_json(pid: &str) -> Value {
        json!({
            "id": pid,
            "living": false,
            "names": [{
                "preferred": true,
                "nameForms": [{
                    "parts": [
                        {"type": "http://gedcomx.org/Given", "value": "Pat"},
                        {"type": "http://gedcomx.org/Surname", "value": "Tester"}
                    ]
                }]
            }],
            "gender": {"type": "http://gedcomx.org/Female"},
            "display": {"lifespan": "1900-1980"}
        })
    }

    #[test]
    fn test_parse_person_fields() {
        let payload = parse_persons(&json!({"persons": [person_json("P1")]})).unwrap();
        assert_eq!(payload.persons.len(), 1);
        let p = &payload.persons[0];
        assert_eq!(p.pid, "P1");
        assert_eq!(p.gender, Gender::Female);
        assert_eq!(p.surname, "Tester");
        assert_eq!(p.given_name, "Pat");
        assert_eq!(p.lifespan, "1900-1980");
    }

    #[test]
    fn test_parse_parent_child_relationship() {
        let payload = parse_persons(&json!({
            "persons": [],
            "relationships": [{
                "type": "http://gedcomx.org/ParentChild",
                "id": "XXABCD-123",
                "person1": {"resourceId": "PARENT"},
                "person2": {"resourceId": "CHILD"}
            }]
        }))
        .unwrap();
        assert_eq!(payload.parent_child.len(), 1);
        let rel = &payload.parent_child[0];
        assert_eq!(rel.parent, "PARENT");
        assert_eq!(rel.child, "CHILD");
        // The wire id carries a 2-character prefix.
        assert_eq!(rel.rel_id, "ABCD-123");
        assert_eq!(rel.fact_type, None);
    }

    #[test]
    fn test_parse_couple_feeds_discovery_only() {
        let payload = parse_persons(&json!({
            "relationships": [{
                "type": "http://gedcomx.org/Couple",
                "id": "XXCPL-001",
                "person1": {"resourceId": "A"},
                "person2": {"resourceId": "B"}
            }]
        }))
        .unwrap();
        assert!(payload.parent_child.is_empty());
        assert_eq!(payload.couple_members, vec!["A", "B"]);
    }

    #[test]
    fn test_malformed_records_are_skipped_not_fatal() {
        let payload = parse_persons(&json!({
            "persons": [person_json("P1"), {"no_id": true}],
            "relationships": [
                {"type": "http://gedcomx.org/ParentChild", "id": "XXR-1",
                 "person2": {"resourceId": "CHILD"}},
                {"type": "http://gedcomx.org/SomethingElse"}
            ]
        }))
        .unwrap();
        assert_eq!(payload.persons.len(), 1);
        assert!(payload.parent_child.is_empty());
    }

    #[test]
    fn test_non_object_payload_is_corrupt() {
        assert!(matches!(
            parse_persons(&json!([1, 2, 3])),
            Err(CrawlError::CorruptPayload(_))
        ));
    }

    #[test]
    fn test_parse_relationship_facts() {
        let types = parse_relationship_facts(&json!({
            "childAndParentsRelationships": [{
                "parent1": {"resourceId": "P1"},
                "parent2": {"resourceId": "P2"},
                "child": {"resourceId": "C"},
                "parent1Facts": [{"type": "http://gedcomx.org/BiologicalParent"}],
                "parent2Facts": [{"type": "http://gedcomx.org/AdoptiveParent"}]
            }]
        }));
        assert_eq!(
            types,
            vec![
                RelationshipType::BiologicalParent,
                RelationshipType::NonBiological
            ]
        );
        assert!(parse_relationship_facts(&json!({})).is_empty());
    }

    #[test]
    fn test_typed_fact_on_persons_payload() {
        let payload = parse_persons(&json!({
            "relationships": [{
                "type": "http://gedcomx.org/ParentChild",
                "id": "XXR-9",
                "person1": {"resourceId": "P"},
                "person2": {"resourceId": "C"},
                "facts": [{"type": "http://gedcomx.org/BiologicalParent"}]
            }]
        }))
        .unwrap();
        assert_eq!(
            payload.parent_child[0].fact_type,
            Some(RelationshipType::BiologicalParent)
        );
    }
}
