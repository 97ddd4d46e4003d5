use crate::error::{AgentError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// A tuple-keyed persistent map, encoded on disk as a JSON array of
/// `[key_tuple, value]` pairs rather than a JSON object (object keys must be
/// strings; our keys are `(measurement, service, item)`-style tuples).
/// See SPEC_FULL.md §9.
pub type TupleMap<K, V> = BTreeMap<K, V>;

/// Crash-safe persisted key/value store (C1).
///
/// The whole content is held in memory and is small enough (a few MB at
/// most) that every mutation simply re-serializes and atomically replaces
/// the backing file, the same way the teacher's `KeeperState::save` writes a
/// temp file and renames it over the destination.
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl StateStore {
    /// Load the store from `path`, or start empty if the file does not yet
    /// exist. A malformed file is a fatal startup error (§4.1).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let content = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|source| AgentError::StateRead {
                path: path.display().to_string(),
                source,
            })?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw).map_err(|source| AgentError::StateParse {
                    path: path.display().to_string(),
                    source,
                })?
            }
        } else {
            BTreeMap::new()
        };

        Ok(StateStore {
            path,
            inner: Mutex::new(content),
        })
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn get_typed<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Set `key` to `value` and flush before returning, so the caller never
    /// observes an acknowledged-but-unpersisted write (§3 invariants).
    pub fn set<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let encoded = serde_json::to_value(value).map_err(|source| AgentError::StateParse {
            path: self.path.display().to_string(),
            source,
        })?;
        {
            let mut guard = self.inner.lock().unwrap();
            guard.insert(key.to_string(), encoded);
        }
        self.flush()
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        {
            let mut guard = self.inner.lock().unwrap();
            guard.remove(key);
        }
        self.flush()
    }

    /// Load a tuple-keyed map stored under `key` as an array of pairs.
    pub fn get_map<K, V>(&self, key: &str) -> TupleMap<K, V>
    where
        K: DeserializeOwned + Ord,
        V: DeserializeOwned,
    {
        match self.get(key) {
            Some(value) => {
                let pairs: Vec<(K, V)> = serde_json::from_value(value).unwrap_or_default();
                pairs.into_iter().collect()
            }
            None => BTreeMap::new(),
        }
    }

    /// Persist a tuple-keyed map under `key` as an array of `[key, value]`
    /// pairs, flushed before return.
    pub fn set_map<K, V>(&self, key: &str, map: &TupleMap<K, V>) -> Result<()>
    where
        K: Serialize + Ord,
        V: Serialize,
    {
        let pairs: Vec<(&K, &V)> = map.iter().collect();
        self.set(key, &pairs)
    }

    /// Atomic replace: write to `path.tmp`, fsync, rename over `path`.
    fn flush(&self) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let json = serde_json::to_string(&*guard).map_err(|source| AgentError::StateParse {
            path: self.path.display().to_string(),
            source,
        })?;
        drop(guard);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| AgentError::StateWrite {
                    path: self.path.display().to_string(),
                    source,
                })?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = fs::File::create(&tmp_path).map_err(|source| AgentError::StateWrite {
                path: tmp_path.display().to_string(),
                source,
            })?;
            file.write_all(json.as_bytes())
                .map_err(|source| AgentError::StateWrite {
                    path: tmp_path.display().to_string(),
                    source,
                })?;
            file.sync_all().map_err(|source| AgentError::StateWrite {
                path: tmp_path.display().to_string(),
                source,
            })?;
        }

        fs::rename(&tmp_path, &self.path).map_err(|source| AgentError::StateWrite {
            path: self.path.display().to_string(),
            source,
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "bleemeo-agent-core-test-{name}-{}",
            std::process::id()
        ));
        p
    }

    #[test]
    fn roundtrips_scalar_values() {
        let path = temp_path("scalar");
        let store = StateStore::load(&path).unwrap();
        store.set("agent_uuid", &"abc-123").unwrap();

        let reloaded = StateStore::load(&path).unwrap();
        assert_eq!(
            reloaded.get_typed::<String>("agent_uuid"),
            Some("abc-123".to_string())
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn roundtrips_tuple_keyed_map() {
        use crate::model::ServiceKey;

        let path = temp_path("map");
        let store = StateStore::load(&path).unwrap();

        let mut map: TupleMap<ServiceKey, u32> = BTreeMap::new();
        map.insert(
            ServiceKey {
                name: "nginx".to_string(),
                instance: None,
            },
            1,
        );
        map.insert(
            ServiceKey {
                name: "redis".to_string(),
                instance: Some("web1".to_string()),
            },
            2,
        );
        store.set_map("services_uuid", &map).unwrap();

        let reloaded = StateStore::load(&path).unwrap();
        let loaded: TupleMap<ServiceKey, u32> = reloaded.get_map("services_uuid");
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get(&ServiceKey {
                name: "nginx".to_string(),
                instance: None
            }),
            Some(&1)
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_starts_empty() {
        let path = temp_path("missing");
        let store = StateStore::load(&path).unwrap();
        assert!(store.get("anything").is_none());
    }

    #[test]
    fn malformed_file_is_fatal() {
        let path = temp_path("malformed");
        fs::write(&path, b"{not json").unwrap();
        let result = StateStore::load(&path);
        assert!(result.is_err());
        let _ = fs::remove_file(&path);
    }
}
