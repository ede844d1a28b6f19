use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Default location of the aggregate index inside every enabled repository.
pub const DEFAULT_INDEX_ROOT: &str = "/.meta/p2";

pub const ARTIFACTS_XML: &str = "artifacts.xml";
pub const CONTENT_XML: &str = "content.xml";
pub const ARTIFACTS_FRAGMENT_SUFFIX: &str = "-p2artifacts.xml";
pub const CONTENT_FRAGMENT_SUFFIX: &str = "-p2content.xml";

const JAR_EXTENSION: &str = ".jar";
const HIDDEN_MARKER: char = '.';

/// Repository-root relative path inside an artifact store.
///
/// Always starts with `/`, never ends with one (except the root itself) and never
/// contains empty, `.` or `..` segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoPath(String);

impl RepoPath {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let mut segments = Vec::new();
        for segment in raw.split(['/', '\\']) {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(StoreError::InvalidPath {
                        path: raw.to_string(),
                        reason: "parent segments are not allowed".to_string(),
                    });
                }
                other => segments.push(other),
            }
        }
        Ok(Self(format!("/{}", segments.join("/"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }

    /// Appends one or more `/`-separated segments.
    pub fn join(&self, relative: &str) -> Result<Self, StoreError> {
        Self::parse(&format!("{}/{}", self.0, relative))
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let cut = self.0.rfind('/').unwrap_or(0);
        if cut == 0 {
            Some(Self::root())
        } else {
            Some(Self(self.0[..cut].to_string()))
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// True when any segment starts with the hidden-file marker.
    pub fn is_hidden(&self) -> bool {
        self.segments()
            .any(|segment| segment.starts_with(HIDDEN_MARKER))
    }

    /// Path relative to the store root, without the leading slash.
    pub fn relative(&self) -> &str {
        self.0.trim_start_matches('/')
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RepoPath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RepoPath {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RepoPath> for String {
    fn from(value: RepoPath) -> Self {
        value.0
    }
}

/// The two descriptor collections that make up an aggregate index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Artifacts,
    Metadata,
}

impl DescriptorKind {
    pub const ALL: [DescriptorKind; 2] = [DescriptorKind::Artifacts, DescriptorKind::Metadata];

    /// File name of the descriptor inside a repository layout.
    pub fn file_name(self) -> &'static str {
        match self {
            DescriptorKind::Artifacts => ARTIFACTS_XML,
            DescriptorKind::Metadata => CONTENT_XML,
        }
    }

    /// Suffix a published module fragment of this kind carries.
    pub fn fragment_suffix(self) -> &'static str {
        match self {
            DescriptorKind::Artifacts => ARTIFACTS_FRAGMENT_SUFFIX,
            DescriptorKind::Metadata => CONTENT_FRAGMENT_SUFFIX,
        }
    }

    pub fn repository_type(self) -> &'static str {
        match self {
            DescriptorKind::Artifacts => "org.eclipse.equinox.p2.artifact.repository.simpleRepository",
            DescriptorKind::Metadata => {
                "org.eclipse.equinox.internal.p2.metadata.repository.LocalMetadataRepository"
            }
        }
    }

    /// Processing instruction identifying the repository format.
    pub fn processing_instruction(self) -> &'static str {
        match self {
            DescriptorKind::Artifacts => "<?artifactRepository version='1.1.0'?>",
            DescriptorKind::Metadata => "<?metadataRepository version='1.1.0'?>",
        }
    }

    /// Classifies a store path as a module fragment by its file name.
    pub fn classify(path: &RepoPath) -> Option<Self> {
        let name = path.file_name()?;
        Self::ALL
            .into_iter()
            .find(|kind| name.ends_with(kind.fragment_suffix()) && name != kind.fragment_suffix())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DescriptorKind::Artifacts => "artifacts",
            DescriptorKind::Metadata => "metadata",
        }
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a fragment is folded into, or subtracted from, the aggregate index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexOperation {
    Merge,
    Remove,
}

impl IndexOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexOperation::Merge => "update",
            IndexOperation::Remove => "remove",
        }
    }
}

impl fmt::Display for IndexOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactClassifier {
    Bundle,
    Feature,
    Other(String),
}

impl ArtifactClassifier {
    pub const BUNDLE: &'static str = "osgi.bundle";
    pub const FEATURE: &'static str = "org.eclipse.update.feature";

    pub fn parse(raw: &str) -> Self {
        match raw {
            Self::BUNDLE => ArtifactClassifier::Bundle,
            Self::FEATURE => ArtifactClassifier::Feature,
            other => ArtifactClassifier::Other(other.to_string()),
        }
    }

    /// Publish-layout directory links for this classifier live in, if any.
    pub fn link_directory(&self) -> Option<&'static str> {
        match self {
            ArtifactClassifier::Bundle => Some("plugins"),
            ArtifactClassifier::Feature => Some("features"),
            ArtifactClassifier::Other(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ArtifactClassifier::Bundle => Self::BUNDLE,
            ArtifactClassifier::Feature => Self::FEATURE,
            ArtifactClassifier::Other(raw) => raw,
        }
    }
}

/// One artifact described by an artifacts fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstallableArtifact {
    pub id: String,
    pub version: String,
    pub classifier: ArtifactClassifier,
}

impl InstallableArtifact {
    pub fn new(
        id: impl Into<String>,
        version: impl Into<String>,
        classifier: ArtifactClassifier,
    ) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            classifier,
        }
    }

    /// `<index_root>/<plugins|features>/<id>_<version>.jar`, or `None` for
    /// classifiers that are not linked.
    pub fn link_path(&self, index_root: &RepoPath) -> Option<Result<RepoPath, StoreError>> {
        let directory = self.classifier.link_directory()?;
        Some(index_root.join(&format!(
            "{directory}/{}_{}{JAR_EXTENSION}",
            self.id, self.version
        )))
    }
}

/// A module's descriptor fragment as referenced by a store notification.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub repository_id: String,
    pub path: RepoPath,
    /// Snapshot of the fragment bytes; read from the store when absent.
    pub content: Option<Vec<u8>>,
}

impl Fragment {
    pub fn stored(repository_id: impl Into<String>, path: RepoPath) -> Self {
        Self {
            repository_id: repository_id.into(),
            path,
            content: None,
        }
    }

    pub fn with_content(
        repository_id: impl Into<String>,
        path: RepoPath,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            repository_id: repository_id.into(),
            path,
            content: Some(content.into()),
        }
    }

    /// Path of the binary published next to an artifacts fragment.
    ///
    /// `foo/1.0/foo-1.0-p2artifacts.xml` sits beside `foo/1.0/foo-1.0.jar`.
    pub fn physical_artifact_path(&self) -> Result<RepoPath, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidPath {
            path: self.path.to_string(),
            reason: reason.to_string(),
        };
        let stem = self
            .path
            .file_name()
            .and_then(|name| name.strip_suffix(ARTIFACTS_FRAGMENT_SUFFIX))
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| invalid("not an artifacts fragment"))?;
        let parent = self.path.parent().ok_or_else(|| invalid("no parent"))?;
        parent.join(&format!("{stem}{JAR_EXTENSION}"))
    }
}
