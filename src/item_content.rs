//! Typed view of `DashboardItem::content`.
//!
//! Content travels as an opaque JSON string.  It is decoded once, here, into
//! a per-type struct.  Missing fields are default-filled and unknown fields
//! are ignored so older and newer clients can share a board.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::model::ItemType;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteContent {
    #[serde(deserialize_with = "lenient")]
    pub text: String,
    #[serde(deserialize_with = "lenient")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TodoEntry {
    #[serde(deserialize_with = "lenient")]
    pub id: String,
    #[serde(deserialize_with = "lenient")]
    pub text: String,
    #[serde(deserialize_with = "lenient")]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TodoContent {
    #[serde(deserialize_with = "lenient")]
    pub title: String,
    #[serde(deserialize_with = "lenient")]
    pub items: Vec<TodoEntry>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalContent {
    #[serde(deserialize_with = "lenient")]
    pub session_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub name: Option<String>,
    /// Agent preset launched in the terminal (e.g. "claude", "codex"); `None` is a plain shell.
    #[serde(deserialize_with = "lenient")]
    pub agent: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub cols: Option<u16>,
    #[serde(deserialize_with = "lenient")]
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserContent {
    #[serde(deserialize_with = "lenient")]
    pub url: String,
    #[serde(deserialize_with = "lenient")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkContent {
    #[serde(deserialize_with = "lenient")]
    pub url: String,
    #[serde(deserialize_with = "lenient")]
    pub title: String,
    #[serde(deserialize_with = "lenient")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeContent {
    #[serde(deserialize_with = "lenient")]
    pub name: String,
    #[serde(deserialize_with = "lenient")]
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationContent {
    #[serde(deserialize_with = "lenient")]
    pub provider: String,
    #[serde(deserialize_with = "lenient")]
    pub connection_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub settings: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ItemContent {
    Note(NoteContent),
    Todo(TodoContent),
    Terminal(TerminalContent),
    Browser(BrowserContent),
    Link(LinkContent),
    Recipe(RecipeContent),
    Integration(IntegrationContent),
}

impl ItemContent {
    /// Decode `raw` for an item of `item_type`.  Never fails: an empty or
    /// unparseable payload yields the type's default.  A legacy note stored
    /// as plain text becomes its `text`.
    pub fn decode(item_type: ItemType, raw: &str) -> Self {
        let value = if raw.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(value @ Value::Object(_)) => value,
                Ok(_) | Err(_) => {
                    debug!(%item_type, "item content is not a JSON object, default-filling");
                    if item_type == ItemType::Note {
                        return ItemContent::Note(NoteContent {
                            text: raw.to_string(),
                            color: None,
                        });
                    }
                    Value::Object(Default::default())
                }
            }
        };

        match item_type {
            ItemType::Note => ItemContent::Note(from_value_or_default(value)),
            ItemType::Todo => ItemContent::Todo(from_value_or_default(value)),
            ItemType::Terminal => ItemContent::Terminal(from_value_or_default(value)),
            ItemType::Browser => ItemContent::Browser(from_value_or_default(value)),
            ItemType::Link => ItemContent::Link(from_value_or_default(value)),
            ItemType::Recipe => ItemContent::Recipe(from_value_or_default(value)),
            ItemType::Integration => ItemContent::Integration(from_value_or_default(value)),
        }
    }

    pub fn item_type(&self) -> ItemType {
        match self {
            ItemContent::Note(_) => ItemType::Note,
            ItemContent::Todo(_) => ItemType::Todo,
            ItemContent::Terminal(_) => ItemType::Terminal,
            ItemContent::Browser(_) => ItemType::Browser,
            ItemContent::Link(_) => ItemType::Link,
            ItemContent::Recipe(_) => ItemType::Recipe,
            ItemContent::Integration(_) => ItemType::Integration,
        }
    }

    /// Serialize back to the wire string stored in `DashboardItem::content`.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn from_value_or_default<T: DeserializeOwned + Default>(value: Value) -> T {
    serde_json::from_value(value).unwrap_or_default()
}

/// Field-level default fill: a value of the wrong JSON type becomes the
/// field's default without discarding its siblings.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_else(|e| {
        debug!(error = %e, "mistyped content field, default-filled");
        T::default()
    }))
}
