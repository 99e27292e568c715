use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub author: Author,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only message thread used as extraction context.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub thread: Vec<Message>,
}

impl Conversation {
    pub fn add(&mut self, author: Author, text: impl Into<String>) {
        self.thread.push(Message {
            author,
            text: text.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn user_messages(&self) -> impl Iterator<Item = &str> {
        self.thread
            .iter()
            .filter(|m| m.author == Author::User)
            .map(|m| m.text.as_str())
    }

    pub fn len(&self) -> usize {
        self.thread.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thread.is_empty()
    }
}

/// Names of the conversation threads a session can hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    MetadataExtraction,
    EntityExtraction,
    Entity(String),
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::MetadataExtraction => f.write_str("metadata_extraction"),
            ConversationKey::EntityExtraction => f.write_str("entity_extraction"),
            ConversationKey::Entity(entity_id) => write!(f, "entity:{}", entity_id),
        }
    }
}

impl FromStr for ConversationKey {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metadata_extraction" => Ok(ConversationKey::MetadataExtraction),
            "entity_extraction" => Ok(ConversationKey::EntityExtraction),
            other => match other.strip_prefix("entity:") {
                Some(id) if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()) => {
                    Ok(ConversationKey::Entity(id.to_string()))
                }
                _ => Err(SessionError::InvalidConversationKey(other.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parsing() {
        assert_eq!(
            "metadata_extraction".parse::<ConversationKey>().unwrap(),
            ConversationKey::MetadataExtraction
        );
        assert_eq!(
            "entity:ab12cd34".parse::<ConversationKey>().unwrap(),
            ConversationKey::Entity("ab12cd34".to_string())
        );
        assert!("entity:".parse::<ConversationKey>().is_err());
        assert!("general".parse::<ConversationKey>().is_err());
        assert_eq!(ConversationKey::Entity("x1".into()).to_string(), "entity:x1");
    }

    #[test]
    fn test_user_messages_skip_ai_turns() {
        let mut conversation = Conversation::default();
        conversation.add(Author::User, "add the spouse name");
        conversation.add(Author::Ai, "updated");
        conversation.add(Author::User, "birth year is 1965");

        let texts: Vec<_> = conversation.user_messages().collect();
        assert_eq!(texts, vec!["add the spouse name", "birth year is 1965"]);
        assert_eq!(conversation.len(), 3);
    }
}
