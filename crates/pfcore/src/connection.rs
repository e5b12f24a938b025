use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// Named credentials and endpoint settings handed to tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,
    /// Class name, e.g. `AzureOpenAIConnection` or `CustomConnection`.
    #[serde(rename = "type")]
    pub connection_type: String,
    #[serde(default)]
    pub configs: IndexMap<String, String>,
    #[serde(default)]
    pub secrets: IndexMap<String, String>,
    /// Strong type a `CustomConnection` is converted to, when a tool asks for one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_type: Option<String>,
}

impl Connection {
    pub fn new(name: impl Into<String>, connection_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_type: connection_type.into(),
            configs: IndexMap::new(),
            secrets: IndexMap::new(),
            custom_type: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configs.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), value.into());
        self
    }

    /// Look up a key in configs, then secrets.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.configs
            .get(key)
            .or_else(|| self.secrets.get(key))
            .map(String::as_str)
    }

    /// Type name a tool input check should compare against.
    pub fn effective_type(&self) -> &str {
        self.custom_type.as_deref().unwrap_or(&self.connection_type)
    }

    /// Encode for passing through tool arguments.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).map(Value::from).unwrap_or_default()
    }

    /// Decode a connection previously encoded with [`Connection::to_value`].
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.to_json()).ok()
    }
}

/// Source of connections by name.
pub trait ConnectionProvider: Send + Sync {
    fn get(&self, name: &str) -> Option<Connection>;
}

/// In-memory connection provider.
#[derive(Debug, Default)]
pub struct ConnectionStore {
    connections: RwLock<HashMap<String, Connection>>,
}

impl ConnectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_connections(connections: impl IntoIterator<Item = Connection>) -> Self {
        let store = Self::new();
        for conn in connections {
            store.insert(conn);
        }
        store
    }

    /// Read a YAML or JSON list of connections.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let connections: Vec<Connection> = serde_yaml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded {} connections from {}", connections.len(), path.display());
        Ok(Self::from_connections(connections))
    }

    pub fn insert(&self, connection: Connection) {
        if let Ok(mut map) = self.connections.write() {
            map.insert(connection.name.clone(), connection);
        }
    }

    /// Snapshot of all connections, used when shipping them to worker processes.
    pub fn to_map(&self) -> HashMap<String, Connection> {
        self.connections.read().map(|m| m.clone()).unwrap_or_default()
    }
}

impl ConnectionProvider for ConnectionStore {
    fn get(&self, name: &str) -> Option<Connection> {
        self.connections.read().ok().and_then(|m| m.get(name).cloned())
    }
}

impl ConnectionProvider for HashMap<String, Connection> {
    fn get(&self, name: &str) -> Option<Connection> {
        HashMap::get(self, name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_value_encoding() {
        let store = ConnectionStore::from_connections([Connection::new("azure", "AzureOpenAIConnection")
            .with_config("api_base", "https://example.openai.azure.com")
            .with_secret("api_key", "k")]);

        let conn = store.get("azure").unwrap();
        assert_eq!(conn.get("api_key"), Some("k"));
        assert!(store.get("missing").is_none());

        let decoded = Connection::from_value(&conn.to_value()).unwrap();
        assert_eq!(decoded, conn);
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("connections.yaml");
        std::fs::write(
            &path,
            "- name: open_ai\n  type: OpenAIConnection\n  secrets:\n    api_key: sk-1\n",
        )
        .unwrap();

        let store = ConnectionStore::load(&path).unwrap();
        let conn = store.get("open_ai").unwrap();
        assert_eq!(conn.connection_type, "OpenAIConnection");
        assert_eq!(conn.get("api_key"), Some("sk-1"));
    }
}
