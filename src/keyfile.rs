//! Minimal `[group]` / `key=value` file format used for the consent mirror
//! and the network send counter.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFile {
    groups: Vec<(String, Vec<(String, String)>)>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let mut file = KeyFile::new();
        let mut current: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .ok_or_else(|| format!("Line {}: unterminated group header", lineno + 1))?;
                current = Some(name.trim().to_string());
                file.group_mut(name.trim());
                continue;
            }

            let group = current
                .as_deref()
                .ok_or_else(|| format!("Line {}: key outside of any group", lineno + 1))?;
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("Line {}: expected key=value", lineno + 1))?;
            file.set(group, key.trim(), value.trim());
        }

        Ok(file)
    }

    /// Loads a key file, returning `None` when it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, String> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(format!("Failed to read {}: {}", path.display(), e)),
        }
    }

    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(name, _)| name == group)
            .and_then(|(_, entries)| entries.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_bool(&self, group: &str, key: &str) -> Result<Option<bool>, String> {
        match self.get(group, key) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(other) => Err(format!(
                "Key '{}:{}' has non-boolean value '{}'",
                group, key, other
            )),
        }
    }

    pub fn get_u64(&self, group: &str, key: &str) -> Result<Option<u64>, String> {
        self.get(group, key)
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|e| format!("Key '{}:{}' is not a number: {}", group, key, e))
            })
            .transpose()
    }

    pub fn set(&mut self, group: &str, key: &str, value: impl ToString) {
        let value = value.to_string();
        let entries = self.group_mut(group);
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key.to_string(), value)),
        }
    }

    fn group_mut(&mut self, group: &str) -> &mut Vec<(String, String)> {
        let idx = match self.groups.iter().position(|(name, _)| name == group) {
            Some(idx) => idx,
            None => {
                self.groups.push((group.to_string(), Vec::new()));
                self.groups.len() - 1
            }
        };
        &mut self.groups[idx].1
    }

    /// Writes the file through a temporary sibling and an atomic rename.
    pub fn save_atomic(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory {}: {}", parent.display(), e))?;
        }

        let tmp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| format!("Create temp failed: {}", e))?;
        file.write_all(self.to_string().as_bytes())
            .map_err(|e| format!("Write failed: {}", e))?;
        file.sync_all().map_err(|e| format!("Sync failed: {}", e))?;
        drop(file);

        fs::rename(&tmp_path, path).map_err(|e| format!("Rename failed: {}", e))
    }
}

impl fmt::Display for KeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (group, entries)) in self.groups.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", group)?;
            for (key, value) in entries {
                writeln!(f, "{}={}", key, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render() {
        let file = KeyFile::parse("# comment\n[global]\nenabled = true\nenvironment=dev\n").unwrap();
        assert_eq!(file.get_bool("global", "enabled").unwrap(), Some(true));
        assert_eq!(file.get("global", "environment"), Some("dev"));
        assert_eq!(file.get("global", "missing"), None);
        assert_eq!(file.to_string(), "[global]\nenabled=true\nenvironment=dev\n");
    }

    #[test]
    fn test_rejects_key_outside_group() {
        assert!(KeyFile::parse("enabled=true\n").is_err());
    }

    #[test]
    fn test_save_atomic_and_load() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("state.conf");

        assert_eq!(KeyFile::load(&path).unwrap(), None);

        let mut file = KeyFile::new();
        file.set("network_send_data", "network_requests_sent", 3);
        file.save_atomic(&path).unwrap();

        let loaded = KeyFile::load(&path).unwrap().unwrap();
        assert_eq!(
            loaded.get_u64("network_send_data", "network_requests_sent").unwrap(),
            Some(3)
        );
    }
}
