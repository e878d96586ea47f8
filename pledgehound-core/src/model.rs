use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One listing record. `id` and `slug` are typed; everything else the
/// listing returns is carried as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Website {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub domain: String,
}

/// A page of the listing endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingPage {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub has_more: bool,
}

impl Project {
    pub fn new(id: u64, slug: Option<&str>) -> Self {
        Self {
            id,
            slug: slug.map(str::to_string),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Slug, if present and non-blank.
    pub fn graph_slug(&self) -> Option<&str> {
        self.slug.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").and_then(Value::as_str)
    }

    pub fn creator(&self) -> Option<&Map<String, Value>> {
        self.fields.get("creator").and_then(Value::as_object)
    }

    /// The embedded creator object, created empty if missing.
    pub fn creator_mut(&mut self) -> &mut Map<String, Value> {
        let entry = self
            .fields
            .entry("creator")
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("creator was just replaced with an object"),
        }
    }

    pub fn creator_id(&self) -> Option<u64> {
        self.creator()?.get("id").and_then(Value::as_u64)
    }

    pub fn websites(&self) -> Vec<Website> {
        self.creator()
            .and_then(|creator| creator.get("websites"))
            .map(websites_from_value)
            .unwrap_or_default()
    }

    /// Unix seconds of the project's creation, if the listing carried it.
    pub fn created_at(&self) -> Option<i64> {
        self.fields.get("created_at").and_then(Value::as_i64)
    }

    pub fn graph_errors(&self) -> Option<&Value> {
        self.fields.get("graph_errors")
    }
}

/// Lenient parse of a `websites` array: entries that aren't objects are
/// skipped, missing keys become empty strings.
pub fn websites_from_value(value: &Value) -> Vec<Website> {
    value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter(|entry| entry.is_object())
                .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
