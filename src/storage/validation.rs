// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path validation for contained filesystem operations.
//!
//! Every path handed to the rest of the storage layer is a [`ValidatedPath`]:
//! canonical, absolute, and inside the allowed root at the moment it was
//! built. Raw strings go through a fixed, fail-fast sequence of checks:
//!
//! 1. empty / embedded NUL -> `Malformed`
//! 2. raw or percent-encoded `..` (any depth of encoding, either slash) -> `Traversal`
//! 3. bidirectional override controls -> `Spoofing`
//! 4. DOS device names (`CON`, `COM1`, `nul.txt`, ...) -> `ReservedName`
//! 5. a `:` anywhere but the drive letter slot -> `AdsDetected`
//! 6. length limits -> `TooLong`
//! 7. symlinks on the way down, or escaping the root -> `SymlinkDetected` / `OutsideRoot`
//! 8. landing in a reserved top-level directory -> `ReservedDirectory`
//!
//! Anything that mutates the filesystem under a validated path must call
//! [`PathValidator::revalidate`] afterwards; the check is only as fresh as
//! the last walk.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

use crate::error::PathError;

/// Longest path accepted without an extended-length escape.
#[cfg(windows)]
pub const SHORT_PATH_LIMIT: usize = 260;
#[cfg(not(windows))]
pub const SHORT_PATH_LIMIT: usize = 4096;

/// Hard ceiling, even with an extended-length escape.
pub const MAX_EXTENDED_PATH_LEN: usize = 32_767;

/// Longest single component most filesystems will store.
pub const MAX_COMPONENT_LEN: usize = 255;

const EXTENDED_PATH_PREFIX: &str = r"\\?\";

/// `%252e` needs two rounds; a third catches triple encoding.
const PERCENT_DECODE_ROUNDS: usize = 3;

/// Overlong UTF-8 and IIS-style encodings of `.` that plain decoding misses.
const ENCODED_DOT_VARIANTS: &[&str] = &["%c0%ae", "%c0%2e", "%e0%80%ae", "%u002e"];

const RESERVED_NAMES: &[&str] = &["CON", "PRN", "AUX", "NUL"];

/// An absolute path proven to be inside its validator's root.
///
/// Only [`PathValidator`] can build one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidatedPath {
    path: PathBuf,
    root: PathBuf,
}

impl ValidatedPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// Canonical root this path was validated against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path relative to the root.
    pub fn relative(&self) -> &Path {
        self.path.strip_prefix(&self.root).unwrap_or(&self.path)
    }

    pub fn exists(&self) -> bool {
        fs::symlink_metadata(&self.path).is_ok()
    }

    pub fn to_path_buf(&self) -> PathBuf {
        self.path.clone()
    }
}

impl AsRef<Path> for ValidatedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ValidatedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Confines raw path strings to one allowed root.
#[derive(Debug, Clone)]
pub struct PathValidator {
    /// Canonical form of the root.
    root: PathBuf,
    /// Root as configured, used to strip absolute inputs.
    given_root: PathBuf,
    /// Top-level directory names callers may not reach, compared ASCII
    /// case-insensitively.
    reserved: Vec<String>,
}

/// One-shot form of [`PathValidator::validate`].
pub fn validate(raw: &str, allowed_root: impl AsRef<Path>) -> Result<ValidatedPath, PathError> {
    PathValidator::new(allowed_root)?.validate(raw)
}

impl PathValidator {
    /// Build a validator for an existing root directory.
    pub fn new(allowed_root: impl AsRef<Path>) -> Result<Self, PathError> {
        let given_root = allowed_root.as_ref().to_path_buf();
        let root = given_root.canonicalize()?;
        if !root.is_dir() {
            return Err(PathError::Io(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("allowed root is not a directory: {}", root.display()),
            )));
        }
        Ok(Self {
            root,
            given_root,
            reserved: Vec::new(),
        })
    }

    /// Refuse any path whose first component is `name`, and `name` itself.
    pub fn reserve_top_level(mut self, name: &str) -> Self {
        self.reserved.push(name.to_string());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a raw, root-relative (or root-prefixed absolute) path.
    pub fn validate(&self, raw: &str) -> Result<ValidatedPath, PathError> {
        check_malformed(raw)?;
        check_traversal(raw)?;
        check_spoofing(raw)?;
        check_reserved_names(raw)?;
        check_alternate_data_stream(raw)?;
        self.check_length(raw)?;

        let relative = self.relative_part(raw)?;
        let resolved = self.resolve(&relative)?;
        self.contained(resolved)
    }

    /// Re-run the filesystem checks for a path that may have been raced.
    pub fn revalidate(&self, path: &ValidatedPath) -> Result<ValidatedPath, PathError> {
        let relative = path
            .as_path()
            .strip_prefix(&self.root)
            .map_err(|_| PathError::OutsideRoot(path.to_path_buf()))?
            .to_path_buf();
        let resolved = self.resolve(&relative)?;
        self.contained(resolved)
    }

    /// Create the missing parents of `target` one component at a time.
    ///
    /// Unlike `fs::create_dir_all`, a component that is (or becomes) a
    /// symlink stops the walk instead of being followed. A swap between two
    /// steps is still possible; callers revalidate afterwards.
    pub fn create_parent_dirs(&self, target: &ValidatedPath) -> Result<(), PathError> {
        let relative = target
            .as_path()
            .strip_prefix(&self.root)
            .map_err(|_| PathError::OutsideRoot(target.to_path_buf()))?;
        let Some(parent) = relative.parent() else {
            return Ok(());
        };

        let mut current = self.root.clone();
        for component in parent.components() {
            let Component::Normal(name) = component else {
                return Err(PathError::OutsideRoot(target.to_path_buf()));
            };
            current.push(name);
            match fs::symlink_metadata(&current) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => match fs::create_dir(&current) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(PathError::Io(e)),
                },
                Err(e) => return Err(PathError::Io(e)),
            }
            check_plain_dir(&current)?;
        }
        Ok(())
    }

    fn check_length(&self, raw: &str) -> Result<(), PathError> {
        let stripped = raw.strip_prefix(EXTENDED_PATH_PREFIX).unwrap_or(raw);

        for component in stripped.split(['/', '\\']) {
            if component.len() > MAX_COMPONENT_LEN {
                return Err(PathError::TooLong {
                    len: component.len(),
                    limit: MAX_COMPONENT_LEN,
                });
            }
        }

        let len = self.root.join(stripped).as_os_str().len();
        if len > MAX_EXTENDED_PATH_LEN {
            return Err(PathError::TooLong {
                len,
                limit: MAX_EXTENDED_PATH_LEN,
            });
        }
        if len > SHORT_PATH_LIMIT && !extended_escape_available() {
            return Err(PathError::TooLong {
                len,
                limit: SHORT_PATH_LIMIT,
            });
        }
        Ok(())
    }

    /// Strip the root from absolute inputs; relative inputs pass through.
    fn relative_part(&self, raw: &str) -> Result<PathBuf, PathError> {
        let candidate = Path::new(raw);
        if !candidate.is_absolute() && !candidate.has_root() {
            return Ok(candidate.to_path_buf());
        }
        for base in [&self.root, &self.given_root] {
            if let Ok(rest) = candidate.strip_prefix(base) {
                return Ok(rest.to_path_buf());
            }
        }
        Err(PathError::OutsideRoot(candidate.to_path_buf()))
    }

    /// Walk `relative` below the root, refusing to step through a symlink.
    fn resolve(&self, relative: &Path) -> Result<PathBuf, PathError> {
        let mut current = self.root.clone();
        let mut reached_missing = false;

        for component in relative.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => return Err(PathError::Traversal),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathError::OutsideRoot(relative.to_path_buf()));
                }
                Component::Normal(name) => {
                    current.push(name);
                    if reached_missing {
                        continue;
                    }
                    match fs::symlink_metadata(&current) {
                        Ok(meta) if meta.file_type().is_symlink() => {
                            return Err(PathError::SymlinkDetected(current));
                        }
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => reached_missing = true,
                        Err(e) => return Err(PathError::Io(e)),
                    }
                }
            }
        }

        // The existing prefix must canonicalize to itself; anything else is
        // aliasing we did not see on the walk.
        let existing = deepest_existing(&current);
        let canonical = existing.canonicalize()?;
        if !canonical.starts_with(&self.root) {
            return Err(PathError::OutsideRoot(canonical));
        }
        Ok(current)
    }

    fn contained(&self, resolved: PathBuf) -> Result<ValidatedPath, PathError> {
        // Path::starts_with compares whole components, so /data/al is not
        // a prefix of /data/alice.
        if resolved == self.root || !resolved.starts_with(&self.root) {
            return Err(PathError::OutsideRoot(resolved));
        }
        if self.in_reserved_dir(&resolved) {
            return Err(PathError::ReservedDirectory(resolved));
        }
        Ok(ValidatedPath {
            path: resolved,
            root: self.root.clone(),
        })
    }

    fn in_reserved_dir(&self, resolved: &Path) -> bool {
        let first = resolved
            .strip_prefix(&self.root)
            .ok()
            .and_then(|rest| rest.components().next());
        match first {
            Some(Component::Normal(name)) => {
                let name = name.to_string_lossy();
                self.reserved.iter().any(|r| r.eq_ignore_ascii_case(&name))
            }
            _ => false,
        }
    }
}

fn check_plain_dir(path: &Path) -> Result<(), PathError> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Err(PathError::SymlinkDetected(path.to_path_buf()));
    }
    if !meta.is_dir() {
        return Err(PathError::Io(io::Error::new(
            io::ErrorKind::NotADirectory,
            format!("not a directory: {}", path.display()),
        )));
    }
    Ok(())
}

fn extended_escape_available() -> bool {
    // std::fs::canonicalize yields verbatim (`\\?\`) paths on Windows.
    cfg!(windows)
}

fn deepest_existing(path: &Path) -> &Path {
    let mut candidate = path;
    while fs::symlink_metadata(candidate).is_err() {
        match candidate.parent() {
            Some(parent) => candidate = parent,
            None => break,
        }
    }
    candidate
}

fn check_malformed(raw: &str) -> Result<(), PathError> {
    if raw.is_empty() {
        return Err(PathError::Malformed("empty path".to_string()));
    }
    if raw.contains('\0') {
        return Err(PathError::Malformed("embedded NUL byte".to_string()));
    }
    Ok(())
}

/// Every decoding stage of `raw`, starting with `raw` itself.
fn decoding_stages(raw: &str) -> Vec<String> {
    let mut stages = vec![raw.to_string()];
    for _ in 0..PERCENT_DECODE_ROUNDS {
        let Some(last) = stages.last() else { break };
        if !last.contains('%') {
            break;
        }
        let decoded = String::from_utf8_lossy(&percent_decode(last)).into_owned();
        if &decoded == last {
            break;
        }
        stages.push(decoded);
    }
    stages
}

fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn check_traversal(raw: &str) -> Result<(), PathError> {
    let lower = raw.to_ascii_lowercase();
    if ENCODED_DOT_VARIANTS.iter().any(|v| lower.contains(v)) {
        return Err(PathError::Traversal);
    }
    if decoding_stages(raw).iter().any(|stage| stage.contains("..")) {
        return Err(PathError::Traversal);
    }
    Ok(())
}

fn is_bidi_control(c: char) -> bool {
    matches!(c as u32, 0x202A..=0x202E | 0x2066..=0x2069)
}

fn check_spoofing(raw: &str) -> Result<(), PathError> {
    for stage in decoding_stages(raw) {
        if let Some(c) = stage.chars().find(|c| is_bidi_control(*c)) {
            return Err(PathError::Spoofing(c as u32));
        }
    }
    Ok(())
}

/// Device names match on the stem, after NFKC folding so that fullwidth
/// and superscript look-alikes are caught too.
fn is_reserved_component(component: &str) -> bool {
    let folded: String = component.nfkc().collect::<String>().to_uppercase();
    let stem = folded.split('.').next().unwrap_or("").trim_end_matches(' ');

    if RESERVED_NAMES.contains(&stem) {
        return true;
    }
    let mut chars = stem.chars();
    let prefix: String = chars.by_ref().take(3).collect();
    let digit = chars.next();
    (prefix == "COM" || prefix == "LPT")
        && matches!(digit, Some('1'..='9'))
        && chars.next().is_none()
}

fn check_reserved_names(raw: &str) -> Result<(), PathError> {
    for component in raw.split(['/', '\\']).filter(|c| !c.is_empty()) {
        if is_reserved_component(component) {
            return Err(PathError::ReservedName(component.to_string()));
        }
    }
    Ok(())
}

fn check_alternate_data_stream(raw: &str) -> Result<(), PathError> {
    let stripped = raw.strip_prefix(EXTENDED_PATH_PREFIX).unwrap_or(raw);
    let bytes = stripped.as_bytes();
    for (i, c) in stripped.char_indices() {
        if c != ':' {
            continue;
        }
        let drive_letter = i == 1 && bytes[0].is_ascii_alphabetic();
        if !drive_letter {
            return Err(PathError::AdsDetected);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathValidator) {
        let temp = TempDir::new().unwrap();
        let validator = PathValidator::new(temp.path()).unwrap();
        (temp, validator)
    }

    #[test]
    fn accepts_nested_relative_path() {
        let (_temp, validator) = setup();
        let path = validator.validate("docs/notes.enc").unwrap();
        assert_eq!(path.as_path(), validator.root().join("docs/notes.enc"));
        assert_eq!(path.relative(), Path::new("docs/notes.enc"));
        assert!(!path.exists());
    }

    #[test]
    fn accepts_absolute_path_under_root() {
        let (_temp, validator) = setup();
        let raw = validator.root().join("a.enc");
        let path = validator.validate(raw.to_str().unwrap()).unwrap();
        assert_eq!(path.as_path(), raw);
    }

    #[test]
    fn rejects_empty_and_nul() {
        let (_temp, validator) = setup();
        assert!(matches!(validator.validate(""), Err(PathError::Malformed(_))));
        assert!(matches!(
            validator.validate("a\0b"),
            Err(PathError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_traversal_variants() {
        let (_temp, validator) = setup();
        for raw in [
            "../../etc/passwd",
            "%2e%2e%2f%2e%2e%2fshadow",
            "foo/..\\..\\bar",
            "%252e%252e/secret",
            "%25252e%25252e/secret",
            "a/%2E%2E/b",
            ".%2e/x",
            "%c0%ae%c0%ae/x",
        ] {
            assert!(
                matches!(validator.validate(raw), Err(PathError::Traversal)),
                "{raw} should be rejected as traversal"
            );
        }
    }

    #[test]
    fn one_shot_validate_matches_validator() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            validate("../../etc/passwd", temp.path()),
            Err(PathError::Traversal)
        ));
        assert!(validate("ok.txt", temp.path()).is_ok());
    }

    #[test]
    fn rejects_bidi_controls() {
        let (_temp, validator) = setup();
        assert!(matches!(
            validator.validate("invoice\u{202E}fdp.exe"),
            Err(PathError::Spoofing(0x202E))
        ));
        assert!(matches!(
            validator.validate("a\u{2066}b"),
            Err(PathError::Spoofing(0x2066))
        ));
        assert!(matches!(
            validator.validate("x%E2%80%AEy"),
            Err(PathError::Spoofing(0x202E))
        ));
    }

    #[test]
    fn rejects_reserved_device_names() {
        let (_temp, validator) = setup();
        for raw in [
            "CON",
            "con",
            "dir/nul.txt",
            "Aux.tar.gz",
            "COM1",
            "lpt9.log",
            "PRN ",
            "\u{FF23}\u{FF2F}\u{FF2E}",
            "COM\u{00B9}",
        ] {
            assert!(
                matches!(validator.validate(raw), Err(PathError::ReservedName(_))),
                "{raw:?} should be reserved"
            );
        }
    }

    #[test]
    fn allows_names_that_only_resemble_devices() {
        let (_temp, validator) = setup();
        for raw in ["console.txt", "COM0", "COM10", "LPT", "auxiliary/file", "null"] {
            assert!(validator.validate(raw).is_ok(), "{raw:?} should be allowed");
        }
    }

    #[test]
    fn rejects_alternate_data_streams() {
        let (_temp, validator) = setup();
        assert!(matches!(
            validator.validate("notes.txt:hidden"),
            Err(PathError::AdsDetected)
        ));
        assert!(matches!(
            validator.validate("a/b:c:$DATA"),
            Err(PathError::AdsDetected)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn drive_letter_colon_is_not_a_stream() {
        let (_temp, validator) = setup();
        assert!(validator.validate("C:data").is_ok());
    }

    #[test]
    fn rejects_overlong_paths() {
        let (_temp, validator) = setup();
        let huge = "a/".repeat(20_000);
        assert!(matches!(
            validator.validate(&huge),
            Err(PathError::TooLong {
                limit: MAX_EXTENDED_PATH_LEN,
                ..
            })
        ));

        let long_component = "x".repeat(MAX_COMPONENT_LEN + 1);
        assert!(matches!(
            validator.validate(&long_component),
            Err(PathError::TooLong {
                limit: MAX_COMPONENT_LEN,
                ..
            })
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn rejects_paths_over_short_limit_without_escape() {
        let (_temp, validator) = setup();
        let long = "abcdefgh/".repeat(SHORT_PATH_LIMIT / 9 + 1);
        assert!(matches!(
            validator.validate(&long),
            Err(PathError::TooLong {
                limit: SHORT_PATH_LIMIT,
                ..
            })
        ));
    }

    #[test]
    fn rejects_paths_outside_root() {
        let (_temp, validator) = setup();
        assert!(matches!(
            validator.validate("/etc/passwd"),
            Err(PathError::OutsideRoot(_))
        ));
        assert!(matches!(
            validator.validate("."),
            Err(PathError::OutsideRoot(_))
        ));
    }

    #[test]
    fn sibling_with_shared_prefix_is_outside() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("alice")).unwrap();
        fs::create_dir(temp.path().join("alice2")).unwrap();
        let validator = PathValidator::new(temp.path().join("alice")).unwrap();

        let sibling = validator.root().parent().unwrap().join("alice2/file");
        assert!(matches!(
            validator.validate(sibling.to_str().unwrap()),
            Err(PathError::OutsideRoot(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlinked_components() {
        let (temp, validator) = setup();
        let outside = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("real")).unwrap();
        std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("inside")).unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("escape")).unwrap();

        assert!(matches!(
            validator.validate("inside/file"),
            Err(PathError::SymlinkDetected(_))
        ));
        assert!(matches!(
            validator.validate("escape/file"),
            Err(PathError::SymlinkDetected(_))
        ));
        assert!(validator.validate("real/file").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn revalidate_catches_swapped_directory() {
        let (temp, validator) = setup();
        let outside = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("box")).unwrap();
        let path = validator.validate("box/data.enc").unwrap();
        assert!(validator.revalidate(&path).is_ok());

        fs::remove_dir(temp.path().join("box")).unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("box")).unwrap();
        assert!(matches!(
            validator.revalidate(&path),
            Err(PathError::SymlinkDetected(_))
        ));
    }

    #[test]
    fn reserved_top_level_directory_is_refused() {
        let (temp, validator) = setup();
        fs::create_dir(temp.path().join("Temp")).unwrap();
        let plain = validator.validate("Temp/a.tmp").unwrap();

        let validator = validator.reserve_top_level("Temp");
        for raw in ["Temp", "Temp/a.tmp", "tEmP/a.tmp", "./Temp/a.tmp"] {
            assert!(
                matches!(validator.validate(raw), Err(PathError::ReservedDirectory(_))),
                "{raw:?}"
            );
        }
        assert!(matches!(
            validator.revalidate(&plain),
            Err(PathError::ReservedDirectory(_))
        ));
        assert!(validator.validate("Temporary/a.enc").is_ok());
        assert!(validator.validate("deep/Temp/a.enc").is_ok());
    }

    #[test]
    fn create_parent_dirs_builds_missing_chain() {
        let (temp, validator) = setup();
        let path = validator.validate("a/b/c/file.enc").unwrap();
        validator.create_parent_dirs(&path).unwrap();
        assert!(temp.path().join("a/b/c").is_dir());
        assert!(!path.exists());

        // Idempotent, and a top-level file needs nothing.
        validator.create_parent_dirs(&path).unwrap();
        let top = validator.validate("top.enc").unwrap();
        validator.create_parent_dirs(&top).unwrap();
    }

    #[test]
    fn create_parent_dirs_refuses_file_in_the_way() {
        let (temp, validator) = setup();
        let path = validator.validate("a/b.enc").unwrap();
        fs::write(temp.path().join("a"), b"not a dir").unwrap();
        assert!(matches!(
            validator.create_parent_dirs(&path),
            Err(PathError::Io(e)) if e.kind() == io::ErrorKind::NotADirectory
        ));
    }

    #[cfg(unix)]
    #[test]
    fn create_parent_dirs_does_not_follow_planted_symlink() {
        let (temp, validator) = setup();
        let outside = TempDir::new().unwrap();
        let path = validator.validate("a/b/c.enc").unwrap();

        std::os::unix::fs::symlink(outside.path(), temp.path().join("a")).unwrap();
        assert!(matches!(
            validator.create_parent_dirs(&path),
            Err(PathError::SymlinkDetected(_))
        ));
        assert!(!outside.path().join("b").exists());
    }

    #[test]
    fn missing_root_is_an_io_error() {
        let temp = TempDir::new().unwrap();
        let result = PathValidator::new(temp.path().join("absent"));
        assert!(matches!(result, Err(PathError::Io(_))));
    }
}
