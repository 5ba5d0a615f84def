//! GRUB environment block (`grubenv`) encoder and decoder.
//!
//! The block is exactly 1024 bytes: a fixed header line, one `key=value`
//! line per variable, then `#` padding. Backslashes and newlines inside
//! values are escaped with a backslash.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::build::{AtomicStep, Fingerprint, WorkingCopy};
use crate::common::write_file_with_dirs;
use crate::error::DiskError;

pub const GRUBENV_SIZE: usize = 1024;
pub const GRUBENV_HEADER: &str = "# GRUB Environment Block\n";

/// An ordered set of GRUB environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrubEnv {
    vars: Vec<(String, String)>,
}

impl GrubEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `key=value` assignments, as passed to `grub-editenv set`.
    pub fn from_assignments<S: AsRef<str>>(assignments: &[S]) -> Result<Self, DiskError> {
        let mut env = Self::new();
        for assignment in assignments {
            let assignment = assignment.as_ref();
            let (key, value) = assignment.split_once('=').ok_or_else(|| {
                DiskError::InvalidGrubEnv(format!("{:?} is not a key=value assignment", assignment))
            })?;
            env.set(key, value)?;
        }
        Ok(env)
    }

    /// Set `key`, keeping its position if it already exists.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), DiskError> {
        if key.is_empty() || key.contains(['=', '\n', '#']) {
            return Err(DiskError::InvalidGrubEnv(format!("invalid variable name {:?}", key)));
        }
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.vars.push((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Remove `key`; returns whether it was present.
    pub fn unset(&mut self, key: &str) -> bool {
        let before = self.vars.len();
        self.vars.retain(|(k, _)| k != key);
        self.vars.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Encode as a padded 1024-byte block.
    pub fn encode(&self) -> Result<Vec<u8>, DiskError> {
        let mut block = String::from(GRUBENV_HEADER);
        for (key, value) in &self.vars {
            block.push_str(key);
            block.push('=');
            for c in value.chars() {
                if c == '\\' || c == '\n' {
                    block.push('\\');
                }
                block.push(c);
            }
            block.push('\n');
        }
        let mut bytes = block.into_bytes();
        if bytes.len() > GRUBENV_SIZE {
            return Err(DiskError::GrubEnvOverflow {
                needed: bytes.len(),
                capacity: GRUBENV_SIZE,
            });
        }
        bytes.resize(GRUBENV_SIZE, b'#');
        Ok(bytes)
    }

    /// Decode a block produced by this module or by `grub-editenv`.
    pub fn parse(block: &[u8]) -> Result<Self, DiskError> {
        let text = std::str::from_utf8(block)
            .map_err(|_| DiskError::InvalidGrubEnv("block is not valid UTF-8".into()))?;
        let body = text
            .strip_prefix(GRUBENV_HEADER)
            .ok_or_else(|| DiskError::InvalidGrubEnv("missing header line".into()))?;

        let mut env = Self::new();
        for line in split_unescaped_lines(body) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, raw) = line
                .split_once('=')
                .ok_or_else(|| DiskError::InvalidGrubEnv(format!("malformed line {:?}", line)))?;
            env.set(key, &unescape(raw))?;
        }
        Ok(env)
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let block = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&block).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        write_file_with_dirs(path, self.encode()?)
    }
}

/// Write an environment block to `output_file` inside the image.
#[derive(Debug, Clone, Serialize)]
pub struct GrubMkenv {
    pub output_file: String,
    pub variables: Vec<(String, String)>,
}

impl GrubMkenv {
    pub fn new(output_file: impl Into<String>, env: &GrubEnv) -> Self {
        Self {
            output_file: output_file.into(),
            variables: env.vars.clone(),
        }
    }
}

impl AtomicStep for GrubMkenv {
    fn describe(&self) -> String {
        format!("grubenv {} ({} variables)", self.output_file, self.variables.len())
    }

    fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        Fingerprint::of("GRUB-MKENV", self).map(Some)
    }

    fn run(&self, copy: &WorkingCopy) -> Result<()> {
        let mut env = GrubEnv::new();
        for (key, value) in &self.variables {
            env.set(key, value)?;
        }
        env.write_file(&copy.resolve(&self.output_file)?)
    }
}

/// Split on newlines that are not preceded by an escaping backslash.
fn split_unescaped_lines(body: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '\n' => {
                lines.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < body.len() {
        lines.push(&body[start..]);
    }
    lines
}

fn unescape(raw: &str) -> String {
    let mut value = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                value.push(next);
            }
        } else {
            value.push(c);
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let env = GrubEnv::from_assignments(&["abforge_stable=a", "abforge_new=n"]).unwrap();
        let block = env.encode().unwrap();

        assert_eq!(block.len(), GRUBENV_SIZE);
        let expected = "# GRUB Environment Block\nabforge_stable=a\nabforge_new=n\n";
        assert_eq!(&block[..expected.len()], expected.as_bytes());
        assert!(block[expected.len()..].iter().all(|b| *b == b'#'));
    }

    #[test]
    fn test_parse_roundtrip_with_escapes() {
        let mut env = GrubEnv::new();
        env.set("multi", "line one\nline\\two").unwrap();
        env.set("plain", "x").unwrap();

        let parsed = GrubEnv::parse(&env.encode().unwrap()).unwrap();
        assert_eq!(parsed, env);
        assert_eq!(parsed.get("multi"), Some("line one\nline\\two"));
    }

    #[test]
    fn test_set_keeps_position_and_unset() {
        let mut env = GrubEnv::from_assignments(&["a=1", "b=2"]).unwrap();
        env.set("a", "3").unwrap();
        assert_eq!(env.iter().collect::<Vec<_>>(), vec![("a", "3"), ("b", "2")]);
        assert!(env.unset("a"));
        assert!(!env.unset("a"));
        assert_eq!(env.get("b"), Some("2"));
    }

    #[test]
    fn test_overflow() {
        let mut env = GrubEnv::new();
        env.set("big", &"x".repeat(1000)).unwrap();
        assert!(matches!(
            env.encode(),
            Err(DiskError::GrubEnvOverflow { capacity: 1024, .. })
        ));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(GrubEnv::parse(b"not a grubenv").is_err());
        assert!(GrubEnv::from_assignments(&["novalue"]).is_err());
        assert!(GrubEnv::new().set("a=b", "c").is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("efi/grubenv");
        let env = GrubEnv::from_assignments(&["k=v"]).unwrap();
        env.write_file(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 1024);
        assert_eq!(GrubEnv::read_file(&path).unwrap(), env);
    }
}
