//! Fstat records and their line encoding.
//!
//! One record per line:
//!
//! ```text
//! change,path,rev,action,type,size,digest[,extra...]
//! 16713356,build/buildtest.txt,447,edit,text,84,95966F39451957FB9FBCFD8E3CAF3826
//! ```
//!
//! Commas in paths are written as `;.` and semicolons as `;;`. Extra fields are
//! kept verbatim so that any stage can pass a line through unchanged. Decoding
//! is strict: integers must be canonical and escapes must be well-formed, so a
//! decoded record always re-encodes to the exact bytes it came from.

use crate::error::{Result, SyncError};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Number of fixed (non-extra) fields in a record line.
pub const FIXED_FIELDS: usize = 7;

/// Length of a hex-encoded MD5 digest.
pub const DIGEST_LEN: usize = 32;

/// Header written at the top of stored record streams.
pub const COLUMNS_HEADER: &str = "# COLUMNS: change,path,rev,action,type,size,digest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Edit,
    Delete,
    Branch,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Edit => "edit",
            Action::Delete => "delete",
            Action::Branch => "branch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Action::Add),
            "edit" => Some(Action::Edit),
            "delete" => Some(Action::Delete),
            "branch" => Some(Action::Branch),
            _ => None,
        }
    }
}

/// Content type of a depot file. Determines how its digest is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Text,
    Binary,
    Utf8,
    Utf16,
    Symlink,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Text => "text",
            FileType::Binary => "binary",
            FileType::Utf8 => "utf8",
            FileType::Utf16 => "utf16",
            FileType::Symlink => "symlink",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(FileType::Text),
            "binary" => Some(FileType::Binary),
            "utf8" => Some(FileType::Utf8),
            "utf16" => Some(FileType::Utf16),
            "symlink" => Some(FileType::Symlink),
            _ => None,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, FileType::Binary)
    }
}

/// One depot file at one changelist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstatRecord {
    /// Most recent changelist touching this file
    pub change: u64,
    /// Path relative to the depot prefix, `/`-separated, unescaped
    pub path: String,
    /// File revision at `change`
    pub rev: u64,
    pub action: Action,
    pub file_type: FileType,
    /// Size in bytes as recorded by the depot
    pub size: u64,
    /// Hex MD5 of the content; empty when the depot has none (deletes)
    pub digest: String,
    /// Unknown trailing fields, escaped form, preserved verbatim
    pub extra: Vec<String>,
}

impl FstatRecord {
    pub fn new(
        change: u64,
        path: impl Into<String>,
        rev: u64,
        action: Action,
        file_type: FileType,
        size: u64,
        digest: impl Into<String>,
    ) -> Self {
        Self {
            change,
            path: path.into(),
            rev,
            action,
            file_type,
            size,
            digest: digest.into(),
            extra: Vec::new(),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.action == Action::Delete
    }

    /// Location of this record under a local root.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        let mut full = root.to_path_buf();
        for part in self.path.split('/') {
            full.push(part);
        }
        full
    }

    /// `path#rev`, the form used in reports and transfer arguments.
    pub fn spec(&self) -> String {
        format!("{}#{}", self.path, self.rev)
    }

    /// Check the invariants every encoded record must satisfy.
    pub fn validate(&self) -> std::result::Result<(), String> {
        validate_path(&self.path)?;
        if !self.digest.is_empty()
            && (self.digest.len() != DIGEST_LEN
                || !self.digest.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            return Err(format!("invalid digest {:?}", self.digest));
        }
        for field in &self.extra {
            if field.contains(&['\n', '\r', ','][..]) {
                return Err(format!("invalid extra field {:?}", field));
            }
        }
        Ok(())
    }

    /// Encode as a single line, without the trailing newline.
    pub fn encode_line(&self) -> Result<String> {
        self.validate().map_err(|reason| SyncError::malformed(0, reason))?;

        let mut line = format!(
            "{},{},{},{},{},{},{}",
            self.change,
            escape_path(&self.path),
            self.rev,
            self.action.as_str(),
            self.file_type.as_str(),
            self.size,
            self.digest
        );
        for field in &self.extra {
            line.push(',');
            line.push_str(field);
        }
        Ok(line)
    }

    /// Decode one line (without its newline). `line_no` is used for error
    /// reporting only.
    pub fn decode_line(line: &str, line_no: u64) -> Result<Self> {
        let malformed = |reason: String| SyncError::malformed(line_no, reason);

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < FIXED_FIELDS {
            return Err(malformed(format!(
                "expected at least {} fields, got {}",
                FIXED_FIELDS,
                fields.len()
            )));
        }

        let change = parse_canonical(fields[0])
            .ok_or_else(|| malformed(format!("bad changelist {:?}", fields[0])))?;
        let path = unescape_path(fields[1]).map_err(malformed)?;
        let rev = parse_canonical(fields[2])
            .ok_or_else(|| malformed(format!("bad revision {:?}", fields[2])))?;
        let action = Action::parse(fields[3])
            .ok_or_else(|| malformed(format!("unknown action {:?}", fields[3])))?;
        let file_type = FileType::parse(fields[4])
            .ok_or_else(|| malformed(format!("unknown file type {:?}", fields[4])))?;
        let size = parse_canonical(fields[5])
            .ok_or_else(|| malformed(format!("bad size {:?}", fields[5])))?;

        let record = Self {
            change,
            path,
            rev,
            action,
            file_type,
            size,
            digest: fields[6].to_string(),
            extra: fields[FIXED_FIELDS..].iter().map(|s| s.to_string()).collect(),
        };
        record.validate().map_err(malformed)?;
        Ok(record)
    }
}

impl fmt::Display for FstatRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.spec(), self.change, self.action.as_str())
    }
}

/// Whether a line is a comment (stream header) rather than a record.
pub fn is_comment(line: &str) -> bool {
    line.starts_with('#')
}

pub fn escape_path(path: &str) -> String {
    path.replace(';', ";;").replace(',', ";.")
}

pub fn unescape_path(escaped: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != ';' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(';') => out.push(';'),
            Some('.') => out.push(','),
            other => return Err(format!("bad escape ';{}' in path", other.unwrap_or(' '))),
        }
    }
    Ok(out)
}

/// Paths must be relative, non-empty, free of `..` and free of newlines.
fn validate_path(path: &str) -> std::result::Result<(), String> {
    if path.is_empty() {
        return Err("empty path".to_string());
    }
    if path.contains(&['\n', '\r'][..]) {
        return Err(format!("newline in path {:?}", path));
    }
    if path.starts_with('/') {
        return Err(format!("absolute path {:?}", path));
    }
    for component in Path::new(path).components() {
        if matches!(component, Component::ParentDir | Component::Prefix(_)) {
            return Err(format!("path escapes root: {:?}", path));
        }
    }
    Ok(())
}

/// Parse a decimal integer, rejecting signs and leading zeros.
fn parse_canonical(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LINE: &str = "16713356,build/buildtest.txt,447,edit,text,84,95966F39451957FB9FBCFD8E3CAF3826";

    #[test]
    fn test_decode_fields() {
        let r = FstatRecord::decode_line(LINE, 1).unwrap();
        assert_eq!(r.change, 16713356);
        assert_eq!(r.path, "build/buildtest.txt");
        assert_eq!(r.rev, 447);
        assert_eq!(r.action, Action::Edit);
        assert_eq!(r.file_type, FileType::Text);
        assert_eq!(r.size, 84);
        assert!(r.extra.is_empty());
        assert_eq!(r.encode_line().unwrap(), LINE);
    }

    #[test]
    fn test_escaped_path() {
        let line = "16643751,results/test (Spain;.Euro);;x.pcscript,4,add,binary,2456,1AC64FF827B21C29B0CD5A2F1EC8A31C";
        let r = FstatRecord::decode_line(line, 1).unwrap();
        assert_eq!(r.path, "results/test (Spain,Euro);x.pcscript");
        assert_eq!(r.encode_line().unwrap(), line);
    }

    #[test]
    fn test_extra_fields_pass_through() {
        let line = format!("{},opaque,,x;.y", LINE);
        let r = FstatRecord::decode_line(&line, 1).unwrap();
        assert_eq!(r.extra, vec!["opaque", "", "x;.y"]);
        assert_eq!(r.encode_line().unwrap(), line);
    }

    #[test]
    fn test_delete_without_digest() {
        let line = "12,gone.txt,3,delete,text,0,";
        let r = FstatRecord::decode_line(line, 1).unwrap();
        assert!(r.is_delete());
        assert!(r.digest.is_empty());
        assert_eq!(r.encode_line().unwrap(), line);
    }

    #[test]
    fn test_malformed_lines_rejected() {
        let bad = [
            "",
            "12,a.txt,1,edit,text,3",
            "012,a.txt,1,edit,text,3,",
            "+12,a.txt,1,edit,text,3,",
            "12,a;x.txt,1,edit,text,3,",
            "12,a.txt,1,rename,text,3,",
            "12,a.txt,1,edit,ebcdic,3,",
            "12,a.txt,1,edit,text,3,XYZ",
            "12,../etc/passwd,1,edit,text,3,",
            "12,/abs,1,edit,text,3,",
        ];
        for line in bad {
            let err = FstatRecord::decode_line(line, 9).unwrap_err();
            assert!(
                matches!(err, SyncError::MalformedRecord { line: 9, .. }),
                "{:?} should be malformed",
                line
            );
        }
    }

    #[test]
    fn test_newline_in_path_refused_on_encode() {
        let r = FstatRecord::new(1, "a\nb", 1, Action::Add, FileType::Text, 0, "");
        assert!(matches!(
            r.encode_line(),
            Err(SyncError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_local_path() {
        let r = FstatRecord::new(1, "dir/sub/file.c", 1, Action::Add, FileType::Text, 0, "");
        assert_eq!(
            r.local_path(Path::new("/ws")),
            PathBuf::from("/ws/dir/sub/file.c")
        );
        assert_eq!(r.spec(), "dir/sub/file.c#1");
    }

    fn arb_record() -> impl Strategy<Value = FstatRecord> {
        (
            1u64..1_000_000_000,
            "[a-zA-Z0-9_ ;,.-]{1,12}(/[a-zA-Z0-9_ ;,.-]{1,12}){0,3}",
            1u64..10_000,
            prop_oneof![
                Just(Action::Add),
                Just(Action::Edit),
                Just(Action::Delete),
                Just(Action::Branch)
            ],
            0u64..u64::MAX,
            proptest::option::of("[0-9A-F]{32}"),
            proptest::collection::vec("[a-z0-9;.]{0,6}", 0..3),
        )
            .prop_filter("no dot-dot components", |(_, path, ..)| {
                !path.split('/').any(|c| c == "..")
            })
            .prop_map(|(change, path, rev, action, size, digest, extra)| FstatRecord {
                change,
                path,
                rev,
                action,
                file_type: FileType::Binary,
                size,
                digest: digest.unwrap_or_default(),
                extra,
            })
    }

    proptest! {
        #[test]
        fn prop_decode_encode_is_identity(record in arb_record()) {
            let line = record.encode_line().unwrap();
            let decoded = FstatRecord::decode_line(&line, 1).unwrap();
            prop_assert_eq!(decoded.encode_line().unwrap(), line);
        }
    }
}
