//! Script registry of named, immutable script entries.
//!
//! A registered script lives on disk under `<base>/scripts/` as the script
//! body plus a `.desc` sidecar with its description. The registry keeps an
//! in-memory cache of `Arc<Script>` values; re-registering a name swaps in
//! a fresh value wholesale rather than mutating the old one.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{ConfigError, Error, NotFoundError, ValidationError};

/// Script names are path components and environment-safe identifiers.
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid name regex"));

/// A registered executable unit.
#[derive(Debug, Clone)]
pub struct Script {
    /// Unique, immutable registry key.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Location of the registered script body.
    pub source_path: PathBuf,
}

/// Registry of runnable scripts.
pub struct ScriptRegistry {
    scripts_dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<Script>>>,
}

impl ScriptRegistry {
    /// Open (creating if needed) a registry rooted at `scripts_dir`.
    pub async fn open(scripts_dir: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&scripts_dir).await?;
        Ok(Self {
            scripts_dir,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Register a script, replacing any prior entry with the same name.
    pub async fn register(
        &self,
        name: &str,
        description: &str,
        source: &[u8],
    ) -> Result<Arc<Script>, Error> {
        if !NAME_PATTERN.is_match(name) {
            return Err(ValidationError::InvalidScriptName {
                name: name.to_string(),
            }
            .into());
        }

        let source_path = self.scripts_dir.join(name);
        fs::write(&source_path, source).await.map_err(Error::Io)?;
        fs::write(self.desc_path(name), description)
            .await
            .map_err(Error::Io)?;

        let script = Arc::new(Script {
            name: name.to_string(),
            description: description.to_string(),
            source_path,
        });

        let replaced = self
            .cache
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&script))
            .is_some();
        tracing::info!(script = %name, replaced, "Registered script");

        Ok(script)
    }

    /// Resolve a script name to its registered entry.
    ///
    /// Falls back to the on-disk copy for scripts registered by a previous
    /// process; the loaded value is cached.
    pub async fn resolve(&self, name: &str) -> Result<Arc<Script>, Error> {
        if let Some(script) = self.cache.read().await.get(name) {
            return Ok(Arc::clone(script));
        }

        let source_path = self.scripts_dir.join(name);
        if !fs::try_exists(&source_path).await.unwrap_or(false) {
            return Err(NotFoundError::Script {
                name: name.to_string(),
            }
            .into());
        }

        let description = fs::read_to_string(self.desc_path(name))
            .await
            .unwrap_or_default();
        let script = Arc::new(Script {
            name: name.to_string(),
            description,
            source_path,
        });
        self.cache
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&script));
        Ok(script)
    }

    /// Remove a script from the registry and from disk. Unknown names are
    /// a no-op.
    pub async fn unregister(&self, name: &str) -> Result<(), Error> {
        self.cache.write().await.remove(name);
        let _ = fs::remove_file(self.scripts_dir.join(name)).await;
        let _ = fs::remove_file(self.desc_path(name)).await;
        tracing::info!(script = %name, "Unregistered script");
        Ok(())
    }

    /// Names of all registered scripts, sorted. Merges the cache with the
    /// on-disk entries so scripts registered by a previous process are
    /// listed too. Sidecars and stray files are skipped by the name rule.
    pub async fn list(&self) -> Result<Vec<String>, Error> {
        let mut names: BTreeSet<String> = self.cache.read().await.keys().cloned().collect();

        let mut entries = fs::read_dir(&self.scripts_dir).await.map_err(Error::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::Io)? {
            if let Some(name) = entry.file_name().to_str() {
                if NAME_PATTERN.is_match(name) {
                    names.insert(name.to_string());
                }
            }
        }

        Ok(names.into_iter().collect())
    }

    fn desc_path(&self, name: &str) -> PathBuf {
        self.scripts_dir.join(format!("{name}.desc"))
    }
}
