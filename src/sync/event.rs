//! Normalized analytics events produced by the transformer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which entity the property bag of an [`OutputEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyScope {
    User,
    Company,
    Meeting,
}

/// One analytics event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_in_analytics: Option<bool>,
    pub scope: PropertyScope,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl OutputEvent {
    pub fn new(name: impl Into<String>, timestamp: DateTime<Utc>, scope: PropertyScope) -> Self {
        Self {
            name: name.into(),
            timestamp,
            identity: None,
            include_in_analytics: None,
            scope,
            properties: Map::new(),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_include_in_analytics(mut self, include: bool) -> Self {
        self.include_in_analytics = Some(include);
        self
    }

    /// Insert a property unless the value is absent or JSON null.
    pub fn with_property<V: Into<Value>>(mut self, key: &str, value: Option<V>) -> Self {
        if let Some(value) = value.map(Into::into)
            && !value.is_null()
        {
            self.properties.insert(key.to_string(), value);
        }
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}
