//! # Saved Preference
//!
//! Remembers the last Trackmania executable used for a run, as a single JSON
//! object `{ "tm_path": "..." }`. The store is a small provider trait so the
//! file location is resolved once in `main` and tests can swap in memory.
//!
//! A missing, unreadable or malformed file is never an error for the caller:
//! it simply means "no saved preference".

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ShadowError;

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPreference {
    pub tm_path: PathBuf,
}

/// Raw storage for the preference document.
pub trait PreferenceStore {
    /// The stored document, or `None` when nothing has been saved.
    fn read(&self) -> std::io::Result<Option<String>>;

    /// Replace the stored document as a whole.
    fn write(&self, contents: &str) -> Result<()>;

    fn clear(&self) -> Result<()>;

    /// Where the preference lives, for display.
    fn location(&self) -> String;
}

/// JSON file in the per-user configuration directory.
#[derive(Debug, Clone)]
pub struct FilePreferenceStore {
    path: PathBuf,
}

impl FilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/config.json` for this tool, e.g. `%APPDATA%\TrackmaniaShadowCalc\config\config.json`.
    pub fn default_location() -> Option<Self> {
        ProjectDirs::from("", "", "TrackmaniaShadowCalc")
            .map(|dirs| Self::new(dirs.config_dir().join(CONFIG_FILE_NAME)))
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn read(&self) -> std::io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }
        fs::write(&self.path, contents).with_context(|| format!("writing {:?}", self.path))
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {:?}", self.path)),
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory store for tests.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    pub contents: Mutex<Option<String>>,
}

impl PreferenceStore for MemoryPreferenceStore {
    fn read(&self) -> std::io::Result<Option<String>> {
        Ok(self.contents.lock().unwrap().clone())
    }

    fn write(&self, contents: &str) -> Result<()> {
        *self.contents.lock().unwrap() = Some(contents.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.contents.lock().unwrap() = None;
        Ok(())
    }

    fn location(&self) -> String {
        "<memory>".to_string()
    }
}

/// Loads the saved executable path, dropping it if the file no longer exists.
pub fn load_saved_executable(store: &impl PreferenceStore) -> Option<PathBuf> {
    match parse_preference(store) {
        Ok(Some(pref)) if pref.tm_path.exists() => {
            debug!("Loaded saved executable {:?}", pref.tm_path);
            Some(pref.tm_path)
        }
        Ok(Some(pref)) => {
            info!("Saved executable {:?} no longer exists; ignoring it", pref.tm_path);
            None
        }
        Ok(None) => None,
        Err(e) => {
            warn!("{} ({}); ignoring it", e, store.location());
            None
        }
    }
}

fn parse_preference(store: &impl PreferenceStore) -> Result<Option<SavedPreference>, ShadowError> {
    let Some(raw) = store
        .read()
        .map_err(|e| ShadowError::CorruptPreference(e.to_string()))?
    else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| ShadowError::CorruptPreference(e.to_string()))
}

/// Overwrites the saved preference with `path`.
pub fn save_executable(store: &impl PreferenceStore, path: &Path) -> Result<()> {
    let pref = SavedPreference {
        tm_path: path.to_path_buf(),
    };
    let json = serde_json::to_string(&pref)?;
    store.write(&json)?;
    debug!("Saved executable {:?} to {}", path, store.location());
    Ok(())
}
