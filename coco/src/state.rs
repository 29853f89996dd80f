//! The controller's persistent state store.
//!
//! The state is a tree of JSON values addressed by slash-separated paths
//! (`"a/b/c"`). Intermediate nodes are objects and are auto-created on write;
//! reading a missing path is an error. Every mutation goes through an atomic
//! commit: the mutated draft is serialised to `<storage>/active` via
//! write-to-temp-and-rename and only then published; if anything fails the
//! previous tree stays in place.
//!
//! Named snapshots live next to the active file (`<storage>/<name>`). Loading
//! a snapshot or resetting to the default state preserves the subtrees listed
//! in `exclude_from_reset`.
//!
//! Committed trees are additionally published through a shared pointer so
//! other tasks (the scheduler's condition checks) can read the last committed
//! snapshot without coordinating with the worker.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use md5::{Digest, Md5};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::errors::Error;

/// Name of the file holding the active state; reserved as a snapshot name.
pub const ACTIVE_STATE_NAME: &str = "active";

/// Look up a path in a JSON tree. An empty path (or `"/"`) is the root.
pub fn tree_get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim_matches('/');
    if path.is_empty() {
        return Some(root);
    }
    let mut node = root;
    for segment in path.split('/') {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// Write a value into a JSON tree, auto-creating intermediate objects.
///
/// With `name` set, `path` addresses the parent object and `name` the entry;
/// otherwise the last path segment is the entry name. Writing through a
/// non-object node is an error.
pub fn tree_write(root: &mut Value, path: &str, name: Option<&str>, value: Value) -> Result<(), Error> {
    let path = path.trim_matches('/');
    let mut segments: Vec<&str> = if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    };
    let entry = match name {
        Some(name) => name,
        None => segments
            .pop()
            .ok_or_else(|| Error::internal("Can't create a state entry at the root level."))?,
    };

    let mut node = root;
    for (i, segment) in segments.iter().enumerate() {
        let object = node.as_object_mut().ok_or_else(|| {
            Error::internal(format!(
                "Part {i} of state path '{path}' is not an object. Can't overwrite it with a sub-state block."
            ))
        })?;
        node = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let object = node.as_object_mut().ok_or_else(|| {
        Error::internal(format!(
            "State path '{path}' points into a non-object value. Can't overwrite it with a sub-state block."
        ))
    })?;
    object.insert(entry.to_string(), value);
    Ok(())
}

/// Build a nested object containing only the path-to-value spine.
pub fn tree_extract(root: &Value, path: &str) -> Option<Value> {
    let value = tree_get(root, path)?.clone();
    let path = path.trim_matches('/');
    if path.is_empty() {
        return Some(value);
    }
    let mut wrapped = value;
    for segment in path.rsplit('/') {
        wrapped = json!({ segment: wrapped });
    }
    Some(wrapped)
}

/// Canonical serialisation: object keys recursively sorted, lists in order,
/// compact encoding. Byte-compatible with
/// `json.dumps(obj, sort_keys=True, separators=(",", ":"))` on the nodes.
fn canonical_json(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                // serialising the key as a JSON string handles escaping
                if let Ok(encoded) = serde_json::to_vec(key) {
                    out.extend_from_slice(&encoded);
                }
                out.push(b':');
                canonical_json(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                canonical_json(item, out);
            }
            out.push(b']');
        }
        other => {
            if let Ok(encoded) = serde_json::to_vec(other) {
                out.extend_from_slice(&encoded);
            }
        }
    }
}

/// MD5 hex digest of a value's canonical serialisation.
pub fn hash_value(value: &Value) -> String {
    let mut buf = Vec::new();
    canonical_json(value, &mut buf);
    let digest = Md5::digest(&buf);
    format!("{digest:x}")
}

/// Cheap cloneable handle onto the last committed state tree.
#[derive(Clone)]
pub struct StateReader {
    published: Arc<RwLock<Arc<Value>>>,
}

impl StateReader {
    /// The last committed tree.
    pub fn snapshot(&self) -> Arc<Value> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A JSON document persisted on disk with atomic commits.
///
/// Mutations happen on a draft copy inside [`update`](Self::update); the draft
/// replaces the in-memory tree only after it has been serialised to disk via
/// write-to-temp-and-rename. On failure the previous tree stays committed.
pub struct PersistentState {
    path: PathBuf,
    committed: Value,
    published: Arc<RwLock<Arc<Value>>>,
}

impl PersistentState {
    /// Open the document at `path`. Starts out as JSON `null` if the file
    /// does not exist yet; check with [`is_initialised`](Self::is_initialised).
    pub fn open(path: PathBuf) -> Result<Self, Error> {
        let committed = if path.exists() {
            let raw = fs::read(&path)
                .map_err(|e| Error::internal(format!("Failed reading {}: {e}", path.display())))?;
            serde_json::from_slice(&raw)
                .map_err(|e| Error::internal(format!("Failed parsing {}: {e}", path.display())))?
        } else {
            Value::Null
        };
        let published = Arc::new(RwLock::new(Arc::new(committed.clone())));
        Ok(PersistentState {
            path,
            committed,
            published,
        })
    }

    pub fn is_initialised(&self) -> bool {
        !self.committed.is_null()
    }

    /// The last committed tree.
    pub fn state(&self) -> &Value {
        &self.committed
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            published: self.published.clone(),
        }
    }

    /// Run a scoped update. The closure mutates a draft copy; on success the
    /// draft is serialised to disk and becomes the committed tree. On any
    /// error the committed tree is left untouched.
    pub fn update<T>(&mut self, f: impl FnOnce(&mut Value) -> Result<T, Error>) -> Result<T, Error> {
        let mut draft = self.committed.clone();
        let out = f(&mut draft)?;
        self.persist(&draft)?;
        self.committed = draft;
        self.publish();
        Ok(out)
    }

    /// Replace the whole committed tree.
    pub fn replace(&mut self, tree: Value) -> Result<(), Error> {
        self.persist(&tree)?;
        self.committed = tree;
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        *self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(self.committed.clone());
    }

    fn persist(&self, tree: &Value) -> Result<(), Error> {
        write_json_atomic(&self.path, tree)
    }
}

/// Serialise `tree` to `path` via write-to-temp-and-rename.
pub fn write_json_atomic(path: &Path, tree: &Value) -> Result<(), Error> {
    let encoded = serde_json::to_vec(tree)
        .map_err(|e| Error::internal(format!("Could not commit state: {e}")))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &encoded)
        .map_err(|e| Error::internal(format!("Could not commit state to {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::internal(format!("Could not commit state to {}: {e}", path.display())))?;
    Ok(())
}

/// The controller's state store: the active document plus named snapshots and
/// the default-state files used by reset.
pub struct State {
    storage: PersistentState,
    storage_dir: PathBuf,
    default_state_files: BTreeMap<String, PathBuf>,
    exclude_from_reset: Vec<String>,
}

impl State {
    /// Open the store under `storage_dir`. If an active state survives from a
    /// previous run it is loaded; otherwise the default-state files are read
    /// and committed.
    pub fn new(
        storage_dir: impl Into<PathBuf>,
        default_state_files: BTreeMap<String, PathBuf>,
        exclude_from_reset: Vec<String>,
    ) -> Result<Self, Error> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir).map_err(|e| {
            Error::config(format!(
                "Could not create storage directory {}: {e}",
                storage_dir.display()
            ))
        })?;
        let storage = PersistentState::open(storage_dir.join(ACTIVE_STATE_NAME))?;
        let mut state = State {
            storage,
            storage_dir,
            default_state_files,
            exclude_from_reset,
        };
        if !state.storage.is_initialised() {
            let defaults = state.default_tree()?;
            state.storage.replace(defaults)?;
        } else {
            debug!("Loaded active state from a previous run.");
        }
        Ok(state)
    }

    /// Read the value at `path`. Missing paths are an error.
    pub fn read(&self, path: &str) -> Result<Value, Error> {
        tree_get(self.storage.state(), path)
            .cloned()
            .ok_or_else(|| Error::internal(format!("Path '{path}' not found in state.")))
    }

    /// Borrow the value at `path`, if present.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        tree_get(self.storage.state(), path)
    }

    /// A nested object containing only the path-to-value spine.
    pub fn extract(&self, path: &str) -> Result<Value, Error> {
        tree_extract(self.storage.state(), path)
            .ok_or_else(|| Error::internal(format!("Path '{path}' not found in state.")))
    }

    /// Write a value, creating intermediate objects as needed.
    pub fn write(&mut self, path: &str, value: Value, name: Option<&str>) -> Result<(), Error> {
        self.storage.update(|tree| tree_write(tree, path, name, value))
    }

    /// Ensure `path` exists as an object and return a copy of it.
    pub fn find_or_create(&mut self, path: &str) -> Result<Value, Error> {
        self.storage.update(|tree| {
            let path = path.trim_matches('/');
            if path.is_empty() {
                return Ok(tree.clone());
            }
            let mut node = &mut *tree;
            for (i, segment) in path.split('/').enumerate() {
                let object = node.as_object_mut().ok_or_else(|| {
                    Error::internal(format!(
                        "Part {i} of state path '{path}' is not an object. Can't overwrite it with a sub-state block."
                    ))
                })?;
                node = object
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            Ok(node.clone())
        })
    }

    /// Run several tree mutations inside a single atomic commit.
    pub fn update<T>(&mut self, f: impl FnOnce(&mut Value) -> Result<T, Error>) -> Result<T, Error> {
        self.storage.update(f)
    }

    /// MD5 hash of the subtree at `path` (the whole state for an empty path).
    pub fn hash(&self, path: &str) -> Result<String, Error> {
        Ok(hash_value(&self.read(path)?))
    }

    /// Handle for other tasks to read the last committed tree.
    pub fn reader(&self) -> StateReader {
        self.storage.reader()
    }

    /// Reload the default-state files, keeping the excluded subtrees.
    pub fn reset(&mut self) -> Result<(), Error> {
        let mut tree = self.default_tree()?;
        self.carry_over_excluded(&mut tree)?;
        self.storage.replace(tree)
    }

    /// Copy the active tree to `<storage>/<name>`.
    pub fn save_snapshot(&mut self, name: &str, overwrite: bool) -> Result<(), Error> {
        let path = self.snapshot_path(name)?;
        if path.exists() && !overwrite {
            return Err(Error::invalid_usage(format!(
                "A saved state named '{name}' already exists. Use overwrite to replace it."
            )));
        }
        write_json_atomic(&path, self.storage.state())
    }

    /// Replace the active tree with the named snapshot, keeping the excluded
    /// subtrees.
    pub fn load_snapshot(&mut self, name: &str) -> Result<(), Error> {
        let path = self.snapshot_path(name)?;
        if !path.exists() {
            return Err(Error::invalid_usage(format!("No saved state named '{name}'.")));
        }
        let raw = fs::read(&path)
            .map_err(|e| Error::internal(format!("Failed reading {}: {e}", path.display())))?;
        let mut tree: Value = serde_json::from_slice(&raw)
            .map_err(|e| Error::internal(format!("Failed parsing {}: {e}", path.display())))?;
        self.carry_over_excluded(&mut tree)?;
        self.storage.replace(tree)
    }

    /// Names of all saved snapshots, sorted.
    pub fn saved_names(&self) -> Result<Vec<String>, Error> {
        let entries = fs::read_dir(&self.storage_dir)
            .map_err(|e| Error::internal(format!("Failed listing saved states: {e}")))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::internal(format!("Failed listing saved states: {e}")))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == ACTIVE_STATE_NAME || name.ends_with(".tmp") {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn snapshot_path(&self, name: &str) -> Result<PathBuf, Error> {
        if name == ACTIVE_STATE_NAME {
            return Err(Error::invalid_usage(format!(
                "The state name '{ACTIVE_STATE_NAME}' is reserved."
            )));
        }
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(Error::invalid_usage(format!("Invalid state name '{name}'.")));
        }
        Ok(self.storage_dir.join(name))
    }

    fn default_tree(&self) -> Result<Value, Error> {
        let mut tree = Value::Object(Map::new());
        for (path, file) in &self.default_state_files {
            debug!("Loading state {} from file {}.", path, file.display());
            let raw = fs::read_to_string(file).map_err(|e| {
                Error::config(format!("Failed reading state file {}: {e}", file.display()))
            })?;
            let value: Value = serde_yaml::from_str(&raw).map_err(|e| {
                Error::config(format!("Failure reading YAML file {}: {e}", file.display()))
            })?;
            tree_write(&mut tree, path, None, value)?;
        }
        Ok(tree)
    }

    /// Install the excluded subtrees of the current active tree into `tree`.
    fn carry_over_excluded(&self, tree: &mut Value) -> Result<(), Error> {
        for path in &self.exclude_from_reset {
            if let Some(value) = tree_get(self.storage.state(), path) {
                tree_write(tree, path, None, value.clone())?;
            }
        }
        Ok(())
    }
}
