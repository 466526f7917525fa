//! Dataset properties as reported by `zfs get -H -p -o property,value all`

use serde::Serialize;

/// Kind of a zfs dataset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    #[default]
    Filesystem,
    Volume,
    Snapshot,
    Bookmark,
}

impl DatasetKind {
    fn parse(value: &str) -> Self {
        match value {
            "volume" => Self::Volume,
            "snapshot" => Self::Snapshot,
            "bookmark" => Self::Bookmark,
            _ => Self::Filesystem,
        }
    }
}

/// The properties the planner and driver care about.
///
/// `None` means the property was absent or reported as `-`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetProperties {
    pub kind: DatasetKind,
    pub guid: Option<u64>,
    pub createtxg: Option<u64>,
    pub written: Option<u64>,
    pub encryption: Option<String>,
    pub encryption_root: Option<String>,
    pub receive_resume_token: Option<String>,
    pub origin: Option<String>,
    pub mountpoint: Option<String>,
    pub canmount: Option<String>,
    pub readonly: Option<bool>,
}

fn value(raw: &str) -> Option<String> {
    match raw.trim() {
        "" | "-" => None,
        other => Some(other.to_string()),
    }
}

impl DatasetProperties {
    /// Build from `(property, value)` rows; unknown properties are ignored
    pub fn from_rows<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut props = Self::default();
        for (name, raw) in rows {
            let parsed = value(raw);
            match name {
                "type" => props.kind = DatasetKind::parse(raw.trim()),
                "guid" => props.guid = parsed.and_then(|v| v.parse().ok()),
                "createtxg" => props.createtxg = parsed.and_then(|v| v.parse().ok()),
                "written" => props.written = parsed.and_then(|v| v.parse().ok()),
                "encryption" => props.encryption = parsed,
                "encryptionroot" => props.encryption_root = parsed,
                "receive_resume_token" => props.receive_resume_token = parsed,
                "origin" => props.origin = parsed,
                "mountpoint" => props.mountpoint = parsed,
                "canmount" => props.canmount = parsed,
                "readonly" => props.readonly = parsed.map(|v| v == "on"),
                _ => {}
            }
        }
        props
    }

    /// Encrypted with any algorithm
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encryption.as_deref().is_some_and(|v| v != "off")
    }

    #[must_use]
    pub fn is_volume(&self) -> bool {
        self.kind == DatasetKind::Volume
    }
}

/// Properties that must not be passed to `zfs recv -x/-o` for a dataset kind
#[must_use]
pub fn illegal_for(kind: DatasetKind) -> &'static [&'static str] {
    match kind {
        DatasetKind::Volume => &["canmount"],
        _ => &[],
    }
}

/// Properties dropped from the stream when encrypting on the target
pub const ENCRYPTION_PROPERTIES: [&str; 4] =
    ["keylocation", "pbkdf2iters", "keyformat", "encryption"];

/// Work out the `-x` and `-o` receive options for a dataset.
///
/// Returns `(filter, set)` with properties illegal for `kind` removed.
#[must_use]
pub fn receive_properties(
    kind: DatasetKind,
    filter: &[String],
    set: &[String],
    encrypt: bool,
) -> (Vec<String>, Vec<String>) {
    let illegal = illegal_for(kind);

    let mut filtered: Vec<String> = filter
        .iter()
        .filter(|name| !illegal.contains(&name.as_str()))
        .cloned()
        .collect();
    if encrypt {
        for name in ENCRYPTION_PROPERTIES {
            if !filtered.iter().any(|f| f == name) {
                filtered.push(name.to_string());
            }
        }
    }

    let set = set
        .iter()
        .filter(|assignment| {
            let name = assignment.split_once('=').map_or(assignment.as_str(), |(n, _)| n);
            !illegal.contains(&name)
        })
        .cloned()
        .collect();

    (filtered, set)
}
