//! JSON schemas sent to the provider, and the validator applied to its answers.
//!
//! Proposed-changes schemas are assembled from [`SCHEMA_TABLE`]: a row keyed by
//! entity type only applies to every subtype of that type, a row keyed by
//! (type, subtype) applies to that subtype alone. Supporting a new subtype means
//! adding a taxonomy row in `session` and, if it has extra fields, a row here.

use serde_json::{Map, Value, json};

use session::{DocumentType, EntityKind, EntitySubType, EntityType};

type SchemaExtension = fn(&mut Map<String, Value>);

pub struct SchemaRow {
    pub entity_type: EntityType,
    pub entity_subtype: Option<EntitySubType>,
    pub extend: SchemaExtension,
}

pub static SCHEMA_TABLE: &[SchemaRow] = &[
    SchemaRow {
        entity_type: EntityType::Person,
        entity_subtype: None,
        extend: person_fields,
    },
    SchemaRow {
        entity_type: EntityType::Organization,
        entity_subtype: Some(EntitySubType::PoliticalParty),
        extend: political_party_fields,
    },
    SchemaRow {
        entity_type: EntityType::Organization,
        entity_subtype: Some(EntitySubType::GovernmentBody),
        extend: government_body_fields,
    },
    SchemaRow {
        entity_type: EntityType::Organization,
        entity_subtype: Some(EntitySubType::Hospital),
        extend: hospital_fields,
    },
    SchemaRow {
        entity_type: EntityType::Location,
        entity_subtype: None,
        extend: location_fields,
    },
];

fn lang_text() -> Value {
    json!({
        "type": "object",
        "properties": {
            "en": {"type": "string"},
            "ne": {"type": "string"}
        }
    })
}

fn address() -> Value {
    json!({
        "type": "object",
        "properties": {
            "district": {"type": "string"},
            "province": {"type": "string"}
        }
    })
}

fn person_fields(props: &mut Map<String, Value>) {
    props.insert(
        "personal_details".into(),
        json!({
            "type": "object",
            "properties": {
                "birth_date": {"type": "string", "description": "YYYY, YYYY-MM, or YYYY-MM-DD"},
                "gender": {"type": "string", "enum": ["male", "female", "other"]},
                "birth_place": address(),
                "father_name": lang_text(),
                "mother_name": lang_text(),
                "spouse_name": lang_text(),
                "positions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": lang_text(),
                            "organization": lang_text(),
                            "start_date": {"type": "string", "format": "date"},
                            "end_date": {"type": "string", "format": "date"}
                        }
                    }
                }
            }
        }),
    );
}

fn political_party_fields(props: &mut Map<String, Value>) {
    props.insert("address".into(), address());
    props.insert("party_chief".into(), lang_text());
    props.insert(
        "registration_date".into(),
        json!({"type": "string", "format": "date"}),
    );
    props.insert(
        "symbol".into(),
        json!({"type": "object", "properties": {"name": lang_text()}}),
    );
}

fn government_body_fields(props: &mut Map<String, Value>) {
    props.insert(
        "government_type".into(),
        json!({"type": "string", "enum": ["federal", "provincial", "local", "other", "unknown"]}),
    );
}

fn hospital_fields(props: &mut Map<String, Value>) {
    props.insert("beds".into(), json!({"type": "integer"}));
    props.insert(
        "services".into(),
        json!({"type": "array", "items": {"type": "string"}}),
    );
    props.insert(
        "ownership".into(),
        json!({"type": "string", "enum": ["Private", "Public", "Government"]}),
    );
    props.insert("address".into(), address());
}

fn location_fields(props: &mut Map<String, Value>) {
    props.insert(
        "parent".into(),
        json!({"type": "string", "description": "Entity ID of parent location"}),
    );
    props.insert(
        "area".into(),
        json!({"type": "number", "description": "Area in square kilometers"}),
    );
    props.insert("lat".into(), json!({"type": "number"}));
    props.insert("lng".into(), json!({"type": "number"}));
}

/// Schema for registry record data (new record or diff) of the given kind.
pub fn proposed_changes_schema(kind: &EntityKind) -> Value {
    let mut props = Map::new();
    props.insert(
        "names".into(),
        json!({
            "type": "array",
            "description": "Entity names in English and Nepali",
            "items": {
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "language": {"type": "string", "enum": ["en", "ne"]},
                    "kind": {"type": "string", "enum": ["primary", "alias", "former"]}
                },
                "required": ["name", "language"]
            }
        }),
    );
    props.insert("short_description".into(), lang_text());
    props.insert("description".into(), lang_text());
    props.insert("tags".into(), json!({"type": "array", "items": {"type": "string"}}));

    SCHEMA_TABLE
        .iter()
        .filter(|row| {
            row.entity_type == kind.entity_type
                && (row.entity_subtype.is_none() || row.entity_subtype == kind.entity_subtype)
        })
        .for_each(|row| (row.extend)(&mut props));

    json!({"type": "object", "properties": props})
}

pub fn metadata_schema() -> Value {
    let document_types: Vec<&str> = DocumentType::ALL.iter().map(|t| t.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            "title": {"type": "string", "description": "Document title in English or Nepali"},
            "summary": {"type": "string", "description": "Brief summary of the document content"},
            "author": {"type": "string", "description": "Document author or publishing entity"},
            "publication_date": {"type": "string", "format": "date", "description": "Publication date (YYYY-MM-DD)"},
            "document_type": {"type": "string", "description": "Type of document", "enum": document_types},
            "source": {"type": "string", "description": "Document source or originating organization"}
        }
    })
}

pub fn resolved_entity_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "entity_type": {
                "type": "string",
                "description": "Combined entity type",
                "enum": EntityKind::combined_names()
            },
            "names": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "language": {"type": "string", "enum": ["en", "ne"]},
                        "is_primary": {"type": "boolean"}
                    },
                    "required": ["name", "language"]
                }
            },
            "attributes": {"type": "object"},
            "mentions": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["entity_type", "names"]
    })
}

/// Metadata and entities in one call.
pub fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "metadata": metadata_schema(),
            "entities": {"type": "array", "items": resolved_entity_schema()}
        },
        "required": ["metadata", "entities"]
    })
}

/// Entities only, used by re-extraction and entity updates.
pub fn entities_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "entities": {"type": "array", "items": resolved_entity_schema()}
        },
        "required": ["entities"]
    })
}

pub fn candidate_evaluation_schema(kind: &EntityKind) -> Value {
    json!({
        "type": "object",
        "properties": {
            "candidates": {
                "type": "array",
                "description": "Confidence scores for each candidate",
                "items": {
                    "type": "object",
                    "properties": {
                        "nes_id": {"type": "string"},
                        "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                        "reasoning": {"type": "string"}
                    },
                    "required": ["nes_id", "confidence"]
                }
            },
            "proposed_changes": proposed_changes_schema(kind)
        },
        "required": ["candidates", "proposed_changes"]
    })
}

/// Check `value` against the subset of JSON schema used above: `type`,
/// `properties`, `required`, `items`, `enum`, `minimum`, `maximum`.
/// Optional properties may be null. Returns the path of the first violation.
pub fn validate(schema: &Value, value: &Value) -> Result<(), String> {
    validate_at(schema, value, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let ok = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            _ => true,
        };
        if !ok {
            return Err(format!("{}: expected {}, got {}", path, expected, kind_of(value)));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{}: {} is not one of the allowed values", path, value));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("{}: {} is below minimum {}", path, n, min));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("{}: {} is above maximum {}", path, n, max));
            }
        }
    }

    if let Some(object) = value.as_object() {
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        for field in &required {
            if object.get(*field).is_none_or(Value::is_null) {
                return Err(format!("{}: missing required field '{}'", path, field));
            }
        }

        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (name, prop_schema) in props {
                match object.get(name) {
                    None | Some(Value::Null) => continue,
                    Some(child) => validate_at(prop_schema, child, &format!("{}.{}", path, name))?,
                }
            }
        }
    }

    if let (Some(items), Some(array)) = (schema.get("items"), value.as_array()) {
        for (i, item) in array.iter().enumerate() {
            validate_at(items, item, &format!("{}[{}]", path, i))?;
        }
    }

    Ok(())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(schema: &Value) -> Vec<String> {
        schema["properties"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }

    #[test]
    fn test_person_schema_has_personal_details() {
        let schema = proposed_changes_schema(&EntityKind::parse("person").unwrap());
        let props = properties(&schema);
        assert!(props.contains(&"personal_details".to_string()));
        assert!(props.contains(&"names".to_string()));
        assert!(!props.contains(&"party_chief".to_string()));
    }

    #[test]
    fn test_subtype_rows_only_apply_to_their_subtype() {
        let party = proposed_changes_schema(&EntityKind::parse("organization/political_party").unwrap());
        assert!(properties(&party).contains(&"symbol".to_string()));
        assert!(!properties(&party).contains(&"government_type".to_string()));

        let ngo = proposed_changes_schema(&EntityKind::parse("organization/ngo").unwrap());
        assert_eq!(properties(&ngo).len(), 4);

        let hospital = proposed_changes_schema(&EntityKind::parse("organization/hospital").unwrap());
        assert!(properties(&hospital).contains(&"beds".to_string()));

        let location = proposed_changes_schema(&EntityKind::parse("location").unwrap());
        assert!(properties(&location).contains(&"lat".to_string()));
    }

    #[test]
    fn test_entity_type_enum_comes_from_taxonomy() {
        let schema = resolved_entity_schema();
        let allowed = schema["properties"]["entity_type"]["enum"].as_array().unwrap();
        assert_eq!(allowed.len(), EntityKind::ALL.len());
        assert!(allowed.contains(&json!("organization/government_body")));
    }

    #[test]
    fn test_validate_accepts_well_formed_extraction() {
        let value = json!({
            "metadata": {"title": "Audit of Melamchi project", "document_type": "audit_report", "author": null},
            "entities": [
                {"entity_type": "person", "names": [{"name": "Ram Bahadur Thapa", "language": "en", "is_primary": true}]}
            ]
        });
        assert!(validate(&extraction_schema(), &value).is_ok());
    }

    #[test]
    fn test_validate_reports_first_violation() {
        let missing = json!({"metadata": {}});
        let err = validate(&extraction_schema(), &missing).unwrap_err();
        assert!(err.contains("entities"), "{}", err);

        let bad_type = json!({"metadata": {}, "entities": [{"entity_type": "company", "names": []}]});
        let err = validate(&extraction_schema(), &bad_type).unwrap_err();
        assert!(err.starts_with("$.entities[0].entity_type"), "{}", err);

        let out_of_range = json!({"candidates": [{"nes_id": "x", "confidence": 1.4}], "proposed_changes": {}});
        let schema = candidate_evaluation_schema(&EntityKind::parse("person").unwrap());
        assert!(validate(&schema, &out_of_range).unwrap_err().contains("maximum"));
    }
}
