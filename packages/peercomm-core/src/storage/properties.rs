//! Generic key/value properties.

use rusqlite::{params, Connection};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::database::Handle;
use crate::error::{Entity, Error, Result};

/// A stored property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// Property key
    pub key: String,
    /// Property value
    pub value: String,
    /// When the value was last written (Unix seconds)
    pub modified_at: i64,
}

/// Key/value property repository
#[derive(Clone, Copy)]
pub struct PropertyStore<'a> {
    handle: Handle<'a>,
}

impl<'a> PropertyStore<'a> {
    pub(crate) fn new(handle: Handle<'a>) -> Self {
        Self { handle }
    }

    /// Get a property value, failing with NotFound if it is absent
    pub fn get(&self, key: &str) -> Result<String> {
        self.handle
            .run(|conn| find(conn, key))?
            .ok_or_else(|| Error::not_found(Entity::Property, key))
    }

    /// Get a property value, or `default` if it is absent
    pub fn get_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .handle
            .run(|conn| find(conn, key))?
            .unwrap_or_else(|| default.to_string()))
    }

    /// Check whether a property exists
    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.handle.run(|conn| find(conn, key))?.is_some())
    }

    /// Insert or replace a property value
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let now = crate::time::now_timestamp();
        self.handle.run(|conn| {
            conn.execute(
                "INSERT INTO property (key, value, modified_at) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, modified_at = excluded.modified_at",
                params![key, value, now],
            )
            .map_err(|e| Error::storage(Entity::Property, "set", key, e))?;
            Ok(())
        })
    }

    /// Remove a property. Removing an absent key is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.handle.run(|conn| {
            conn.execute("DELETE FROM property WHERE key = ?", params![key])
                .map_err(|e| Error::storage(Entity::Property, "delete", key, e))?;
            Ok(())
        })
    }

    /// All properties ordered by key
    pub fn list(&self) -> Result<Vec<Property>> {
        self.handle.run(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, value, modified_at FROM property ORDER BY key")
                .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

            let properties = stmt
                .query_map([], |row| {
                    Ok(Property {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        modified_at: row.get(2)?,
                    })
                })
                .map_err(|e| Error::DatabaseError(format!("Failed to query properties: {}", e)))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::DatabaseError(format!("Failed to read property: {}", e)))?;

            Ok(properties)
        })
    }

    /// Read a JSON-encoded property
    ///
    /// Returns `None` if the key is absent and a serialization error if
    /// the stored text does not parse as `T`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.handle.run(|conn| find(conn, key))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Store a value as JSON text
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }
}

fn find(conn: &Connection, key: &str) -> Result<Option<String>> {
    let result = conn.query_row(
        "SELECT value FROM property WHERE key = ?",
        params![key],
        |row| row.get(0),
    );

    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::storage(Entity::Property, "get", key, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::super::Database;
    use std::collections::HashMap;

    #[test]
    fn test_get_missing_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db.properties().get("missing-key").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_get_or_returns_fallback() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(
            db.properties().get_or("missing-key", "fallback").unwrap(),
            "fallback"
        );

        db.properties().set("missing-key", "present").unwrap();
        assert_eq!(
            db.properties().get_or("missing-key", "fallback").unwrap(),
            "present"
        );
    }

    #[test]
    fn test_set_overwrites() {
        let db = Database::open_in_memory().unwrap();
        let props = db.properties();

        props.set("theme", "dark").unwrap();
        props.set("theme", "light").unwrap();

        assert_eq!(props.get("theme").unwrap(), "light");
        assert_eq!(props.list().unwrap().len(), 1);
    }

    #[test]
    fn test_has_and_delete() {
        let db = Database::open_in_memory().unwrap();
        let props = db.properties();

        props.set("k", "v").unwrap();
        assert!(props.has("k").unwrap());

        props.delete("k").unwrap();
        assert!(!props.has("k").unwrap());

        // Deleting again is fine
        props.delete("k").unwrap();
    }

    #[test]
    fn test_list_is_ordered_by_key() {
        let db = Database::open_in_memory().unwrap();
        let props = db.properties();
        props.set("b", "2").unwrap();
        props.set("a", "1").unwrap();
        props.set("c", "3").unwrap();

        let keys: Vec<String> = props.list().unwrap().into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_json_values() {
        let db = Database::open_in_memory().unwrap();
        let props = db.properties();

        let mut limits = HashMap::new();
        limits.insert("keys".to_string(), 20u32);
        props.set_json("limits", &limits).unwrap();

        let loaded: Option<HashMap<String, u32>> = props.get_json("limits").unwrap();
        assert_eq!(loaded, Some(limits));

        let absent: Option<u32> = props.get_json("nope").unwrap();
        assert!(absent.is_none());
    }

    #[test]
    fn test_json_parse_failure() {
        let db = Database::open_in_memory().unwrap();
        db.properties().set("count", "not a number").unwrap();

        let err = db.properties().get_json::<u32>("count").unwrap_err();
        assert_eq!(err.code(), 902);
    }
}
