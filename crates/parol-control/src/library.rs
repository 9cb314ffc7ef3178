//! Program library
//!
//! Plain files in the programs directory. Loading and saving never touch a
//! running program.

use crate::error::ControlError;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::info;

/// Longest accepted program file name.
pub const MAX_NAME_LEN: usize = 128;

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramEntry {
    pub name: String,
    pub size: u64,
    #[serde(skip)]
    pub modified: Option<SystemTime>,
}

/// Program files in one directory.
#[derive(Debug, Clone)]
pub struct ProgramLibrary {
    dir: PathBuf,
}

impl ProgramLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Regular files, sorted by name. A missing directory lists as empty.
    pub fn list(&self) -> Result<Vec<ProgramEntry>, ControlError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut programs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            programs.push(ProgramEntry {
                name,
                size: meta.len(),
                modified: meta.modified().ok(),
            });
        }
        programs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(programs)
    }

    pub fn load(&self, name: &str) -> Result<String, ControlError> {
        let path = self.path_of(name)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ControlError::NotFound(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Write (create or replace) a program file.
    pub fn save(&self, name: &str, text: &str) -> Result<PathBuf, ControlError> {
        let path = self.path_of(name)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, text)?;
        info!(name, bytes = text.len(), "program saved");
        Ok(path)
    }

    /// Path of `name` inside the directory; rejects anything that could escape it.
    pub fn path_of(&self, name: &str) -> Result<PathBuf, ControlError> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }
}

pub fn validate_name(name: &str) -> Result<(), ControlError> {
    let invalid = name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.starts_with('.')
        || name.contains("..")
        || name.contains(['/', '\\', '\0'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(ControlError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_list() {
        let dir = tempfile::tempdir().unwrap();
        let library = ProgramLibrary::new(dir.path().join("programs"));
        assert!(library.list().unwrap().is_empty());

        library.save("b.py", "print('b')\n").unwrap();
        library.save("a.py", "print('a')\n").unwrap();
        fs::create_dir(dir.path().join("programs/sub")).unwrap();

        let names: Vec<String> = library.list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a.py", "b.py"]);
        assert_eq!(library.load("a.py").unwrap(), "print('a')\n");

        library.save("a.py", "print('A')\n").unwrap();
        assert_eq!(library.load("a.py").unwrap(), "print('A')\n");
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let library = ProgramLibrary::new(dir.path());
        assert!(matches!(library.load("none.py"), Err(ControlError::NotFound(_))));
    }

    #[test]
    fn test_rejects_escaping_names() {
        for name in ["", "../x.py", "a/b.py", "a\\b.py", ".hidden", "x..py", "nul\0.py"] {
            assert!(
                matches!(validate_name(name), Err(ControlError::InvalidName(_))),
                "{name:?} accepted"
            );
        }
        assert!(validate_name("pick and place.py").is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
