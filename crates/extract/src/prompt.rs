use serde_json::Value;

use session::{Conversation, DocumentMetadata, EntityKind, EntityMatchState};

/// Which extraction call a prompt is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionTask {
    /// Metadata plus the first entity pass, in one call.
    Metadata,
    Entities,
    EntityUpdate,
}

impl ExtractionTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionTask::Metadata => "metadata",
            ExtractionTask::Entities => "entities",
            ExtractionTask::EntityUpdate => "entity_update",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            ExtractionTask::Metadata => {
                "Document metadata extraction: title, summary, author, publication date, document type and source, together with every relevant entity"
            }
            ExtractionTask::Entities => {
                "Entity extraction: identify and classify every relevant person, organization and location"
            }
            ExtractionTask::EntityUpdate => {
                "Entity update: refine one entity using reviewer feedback and the document"
            }
        }
    }

    fn instructions(&self) -> &'static str {
        match self {
            ExtractionTask::Metadata => {
                r#"## Task: Metadata Extraction
Read the document below and report:
- the title, in the language it is written in
- a short summary of the key content
- the author or publishing organization
- the publication date
- the document type
- the originating source
Also list the people, organizations and locations the document is about."#
            }
            ExtractionTask::Entities => {
                r#"## Task: Entity Extraction
List every relevant entity in the document below:
- People: politicians, civil servants, business people, activists, journalists
- Organizations: government bodies, political parties, NGOs, media, banks, hospitals
- Locations: provinces, districts, municipalities"#
            }
            ExtractionTask::EntityUpdate => {
                r#"## Task: Entity Update
Return the single entity being updated, corrected according to the reviewer's messages and the document."#
            }
        }
    }
}

fn metadata_lines(metadata: &DocumentMetadata) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(title) = &metadata.title {
        lines.push(format!("- Title: {}", title));
    }
    if let Some(author) = &metadata.author {
        lines.push(format!("- Author: {}", author));
    }
    if let Some(document_type) = &metadata.document_type {
        lines.push(format!("- Document type: {}", document_type.as_str()));
    }
    if let Some(date) = &metadata.publication_date {
        lines.push(format!("- Publication date: {}", date));
    }
    lines
}

fn entity_lines(entity: &EntityMatchState) -> Vec<String> {
    let names: Vec<String> = entity
        .resolved_entity
        .names
        .iter()
        .map(|n| n.name.clone())
        .collect();
    let mut lines = vec![
        format!("- Type: {}", entity.kind),
        format!("- Current names: {}", names.join(", ")),
    ];
    if !entity.resolved_entity.attributes.is_empty() {
        lines.push(format!(
            "- Current attributes: {}",
            Value::Object(entity.resolved_entity.attributes.clone())
        ));
    }
    lines
}

pub fn build_system_prompt(
    task: ExtractionTask,
    guidance: Option<&str>,
    metadata: Option<&DocumentMetadata>,
    entity: Option<&EntityMatchState>,
) -> String {
    let mut context = Vec::new();

    if let Some(guidance) = guidance {
        context.push(format!("## Reviewer Guidance\n{}", guidance));
    }
    if let (ExtractionTask::Entities, Some(metadata)) = (task, metadata) {
        context.push("## Document Context".to_string());
        context.extend(metadata_lines(metadata));
    }
    if let (ExtractionTask::EntityUpdate, Some(entity)) = (task, entity) {
        context.push("## Entity Being Updated".to_string());
        context.extend(entity_lines(entity));
    }

    format!(
        r#"You are a careful research analyst for a civic transparency platform that tracks governance and accountability in Nepal.

You extract structured records from Nepali government documents, court papers, audit reports and news coverage, written in English or Nepali (Devanagari or romanized).

CURRENT TASK: {}

RULES:
- Only record what the document states or clearly implies
- Give names in both English and Nepali when the document provides them
- Mark exactly one name per entity as primary
- Classify every entity with one of these types: {}
- Follow the JSON schema exactly

{}"#,
        task.description(),
        EntityKind::combined_names().join(", "),
        context.join("\n")
    )
}

/// User prompt: task instructions, context, reviewer messages and the document.
/// Only user-authored conversation turns are included.
pub fn build_prompt(
    task: ExtractionTask,
    content: &str,
    guidance: Option<&str>,
    conversation: Option<&Conversation>,
    metadata: Option<&DocumentMetadata>,
    entity: Option<&EntityMatchState>,
) -> String {
    let mut parts = vec![task.instructions().to_string()];

    if let Some(guidance) = guidance {
        parts.push(format!("## Reviewer Guidance\n{}", guidance));
    }

    if let (ExtractionTask::Entities, Some(metadata)) = (task, metadata) {
        let lines = metadata_lines(metadata);
        if !lines.is_empty() {
            parts.push(format!("## Document Metadata\n{}", lines.join("\n")));
        }
    }

    if let (ExtractionTask::EntityUpdate, Some(entity)) = (task, entity) {
        parts.push(format!("## Entity Being Updated\n{}", entity_lines(entity).join("\n")));
    }

    if let Some(conversation) = conversation {
        let messages: Vec<String> = conversation
            .user_messages()
            .enumerate()
            .map(|(i, text)| format!("{}. {}", i + 1, text))
            .collect();
        if !messages.is_empty() {
            parts.push(format!("## Reviewer Messages\n{}", messages.join("\n")));
        }
    }

    parts.push(format!("## Document\n\n{}", content));
    parts.push(
        r#"## Output
- Output only the JSON object described by the schema
- Put positions, amounts and dates under attributes
- Leave a field out rather than guess"#
            .to_string(),
    );

    parts.join("\n\n")
}

pub fn build_evaluate_candidates_system_prompt(kind: &EntityKind) -> String {
    format!(
        r#"You match entities extracted from Nepali governance documents against records already in the Nepal Entity Service (NES).

For the extracted {} entity:
1. Score every candidate record from 0.0 to 1.0 using name similarity, type agreement and context
2. Produce proposed_changes: the fields to add or correct on the best matching record

SCORING:
- 0.95 to 1.0: near-perfect match, name, type and attributes agree
- 0.80 to 0.94: strong match, names agree with minor differences
- 0.60 to 0.79: moderate match, similar names with some doubt
- 0.40 to 0.59: weak match, partial name overlap or a doubtful type
- below 0.40: poor match, probably a different entity

PROPOSED CHANGES:
- Only fields the document supports
- English and Nepali names where available
- Keep existing data the document does not contradict"#,
        kind.describe()
    )
}

pub fn build_evaluate_candidates_prompt(
    entity_context: &Value,
    candidates_context: &Value,
    metadata_context: &Value,
) -> String {
    format!(
        r#"Score the following match candidates.

## Document Context
{}

## Extracted Entity
{}

## Candidate NES Records
{}

Return a score for each candidate and proposed_changes for the best match."#,
        pretty(metadata_context),
        pretty(entity_context),
        pretty(candidates_context)
    )
}

pub fn build_new_entity_system_prompt(kind: &EntityKind) -> String {
    format!(
        r#"You structure entity data for the Nepal Entity Service (NES).

Produce the complete record for a new {} entity from what a document says about it.

RULES:
- Names in English and Nepali where available
- Mark the most common name with kind "primary"
- Fill every attribute the schema defines for this type that the document supports
- Use Nepal's administrative divisions (province, district, municipality) for places
- Leave out fields the document does not support"#,
        kind.describe()
    )
}

pub fn build_new_entity_prompt(entity_context: &Value, metadata_context: &Value) -> String {
    format!(
        r#"Build the record for a new NES entity.

## Document Context
{}

## Extracted Entity
{}

Follow the schema."#,
        pretty(metadata_context),
        pretty(entity_context)
    )
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
