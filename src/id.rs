//! Canonical resource identifiers.
//!
//! A [`ResourceId`] pairs a four-character [`ResourceTypeId`] tag with a [`ResourcePath`]
//! rooted at the virtual `data://` namespace. Two ids that compare equal denote the same
//! artifact; ids are totally ordered and hashable so they can key the record store and the
//! scheduler's request lists.

use std::{fmt, str::FromStr};

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ServerError;

/// The virtual root every [`ResourcePath`] is expressed relative to.
pub const VIRTUAL_ROOT: &str = "data://";

/// A four-character type tag, e.g. `msh`, `nav`, `map`. Stored as four bytes so it is
/// `Copy` and trivially hashable; unused trailing bytes are zero.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceTypeId([u8; 4]);

impl ResourceTypeId {
    /// Builds a type tag from up to four ASCII bytes, e.g. `ResourceTypeId::new(b"msh")`.
    pub const fn new(tag: &[u8]) -> Self {
        let mut bytes = [0u8; 4];
        let mut i = 0;
        while i < tag.len() && i < 4 {
            bytes[i] = tag[i];
            i += 1;
        }
        Self(bytes)
    }

    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(4);
        std::str::from_utf8(&self.0[..len]).unwrap_or("????")
    }
}

impl fmt::Debug for ResourceTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceTypeId({})", self.as_str())
    }
}

impl fmt::Display for ResourceTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceTypeId {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 4 || !s.is_ascii() {
            return Err(ServerError::MalformedResourceId(s.to_string()));
        }
        Ok(Self::new(s.as_bytes()))
    }
}

/// A forward-slash virtual path rooted at [`VIRTUAL_ROOT`], e.g. `data://models/crate.msh`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourcePath(String);

impl ResourcePath {
    /// Creates a path from its `data://`-prefixed virtual form.
    pub fn new(virtual_path: impl Into<String>) -> Result<Self, ServerError> {
        let s = virtual_path.into();
        if !s.starts_with(VIRTUAL_ROOT) {
            return Err(ServerError::MalformedResourceId(s));
        }
        Ok(Self(s.replace('\\', "/")))
    }

    /// Builds a virtual path from a raw-root-relative slash path, e.g. `models/crate.msh`.
    pub fn from_relative(relative: &str) -> Self {
        let relative = relative.replace('\\', "/");
        let relative = relative.trim_start_matches('/');
        Self(format!("{VIRTUAL_ROOT}{relative}"))
    }

    /// The path without the virtual root prefix, e.g. `models/crate.msh`.
    pub fn relative(&self) -> &str {
        &self.0[VIRTUAL_ROOT.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Translates this virtual path to an absolute path under `root` (either the raw or the
    /// compiled root), converting `/` to the platform separator.
    pub fn to_absolute(&self, root: &std::path::Path) -> std::path::PathBuf {
        root.join(path_slash::PathBufExt::from_slash(self.relative()))
    }
}

impl fmt::Debug for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical identifier for a raw/compiled resource pair: a type tag plus a virtual path.
///
/// Serializes as its `type:data://path` string form (rather than as a struct) so a
/// `BTreeMap<ResourceId, _>` round-trips through JSON as an object keyed by that string,
/// which is what the record store and the wire protocol both want.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    resource_type: ResourceTypeId,
    path: ResourcePath,
}

impl ResourceId {
    pub fn new(resource_type: ResourceTypeId, path: ResourcePath) -> Self {
        Self { resource_type, path }
    }

    pub fn resource_type(&self) -> ResourceTypeId {
        self.resource_type
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Derives the type tag from the path's file extension, e.g. `data://a.msh` -> `msh`.
    pub fn from_path(path: ResourcePath) -> Result<Self, ServerError> {
        let ext = path
            .relative()
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .ok_or_else(|| ServerError::MalformedResourceId(path.as_str().to_string()))?;
        let resource_type = ResourceTypeId::from_str(ext)?;
        Ok(Self { resource_type, path })
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.path)
    }
}

impl FromStr for ResourceId {
    type Err = ServerError;

    /// Parses the `type:data://path` round-trip form produced by [`ResourceId::fmt`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, path) =
            s.split_once(':').ok_or_else(|| ServerError::MalformedResourceId(s.to_string()))?;
        let resource_type = ResourceTypeId::from_str(ty)?;
        let path = ResourcePath::new(path)?;
        Ok(Self { resource_type, path })
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
