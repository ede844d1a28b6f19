use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use super::DescriptorToolkit;
use super::xml::XmlElement;
use crate::error::ToolkitError;
use crate::model::{ArtifactClassifier, DescriptorKind, InstallableArtifact};

const REPOSITORY: &str = "repository";
const SIZE: &str = "size";
const TIMESTAMP_PROPERTY: &str = "p2.timestamp";

/// Output rules a simple artifact repository uses to locate its binaries.
const MAPPING_RULES: [(&str, &str); 3] = [
    (
        "(& (classifier=osgi.bundle))",
        "${repoUrl}/plugins/${id}_${version}.jar",
    ),
    ("(& (classifier=binary))", "${repoUrl}/binary/${id}_${version}"),
    (
        "(& (classifier=org.eclipse.update.feature))",
        "${repoUrl}/features/${id}_${version}.jar",
    ),
];

/// Entry layout of one descriptor kind.
struct Layout {
    container: &'static str,
    entry: &'static str,
    key: &'static [&'static str],
}

fn layout(kind: DescriptorKind) -> Layout {
    match kind {
        DescriptorKind::Artifacts => Layout {
            container: "artifacts",
            entry: "artifact",
            key: &["classifier", "id", "version"],
        },
        DescriptorKind::Metadata => Layout {
            container: "units",
            entry: "unit",
            key: &["id", "version"],
        },
    }
}

type EntryKey = Vec<String>;

/// Toolkit for the simple (uncompressed, single-file) p2 repository layout.
///
/// Entries are identified by their key attributes; everything else inside an
/// entry is carried through verbatim. Merging keeps the destination order and
/// appends new entries, so repeated merges are idempotent.
#[derive(Debug, Default, Clone)]
pub struct SimpleDescriptorToolkit;

impl SimpleDescriptorToolkit {
    pub fn new() -> Self {
        Self
    }

    fn load(path: &Path) -> Result<XmlElement, ToolkitError> {
        let text = fs::read_to_string(path).map_err(|err| ToolkitError::io(path, err))?;
        let root = XmlElement::parse(&text).map_err(|message| ToolkitError::Xml {
            path: path.to_path_buf(),
            message,
        })?;
        if root.name != REPOSITORY {
            return Err(ToolkitError::malformed(
                path,
                format!("root element is <{}>, expected <{REPOSITORY}>", root.name),
            ));
        }
        Ok(root)
    }

    fn store(path: &Path, kind: DescriptorKind, root: &XmlElement) -> Result<(), ToolkitError> {
        let document = root.to_document(&[kind.processing_instruction()]);
        fs::write(path, document).map_err(|err| ToolkitError::io(path, err))
    }

    /// Descriptors present in a fragment directory.
    fn fragment_descriptors(
        fragment_dir: &Path,
    ) -> Result<Vec<(DescriptorKind, PathBuf)>, ToolkitError> {
        let found: Vec<_> = DescriptorKind::ALL
            .into_iter()
            .map(|kind| (kind, fragment_dir.join(kind.file_name())))
            .filter(|(_, path)| path.is_file())
            .collect();
        if found.is_empty() {
            return Err(ToolkitError::malformed(
                fragment_dir,
                "no descriptor found in fragment directory",
            ));
        }
        Ok(found)
    }

    fn entries<'a>(
        root: &'a XmlElement,
        layout: &Layout,
        path: &Path,
    ) -> Result<Vec<(EntryKey, &'a XmlElement)>, ToolkitError> {
        let Some(container) = root.child(layout.container) else {
            return Ok(Vec::new());
        };
        container
            .children
            .iter()
            .filter(|child| child.name == layout.entry)
            .map(|entry| entry_key(entry, layout, path).map(|key| (key, entry)))
            .collect()
    }

    fn rewrite(
        &self,
        fragment_dir: &Path,
        dest_dir: &Path,
        apply: impl Fn(&mut XmlElement, &Layout, Vec<(EntryKey, XmlElement)>),
    ) -> Result<(), ToolkitError> {
        for (kind, fragment_path) in Self::fragment_descriptors(fragment_dir)? {
            let layout = layout(kind);
            let fragment = Self::load(&fragment_path)?;
            let incoming: Vec<(EntryKey, XmlElement)> =
                Self::entries(&fragment, &layout, &fragment_path)?
                    .into_iter()
                    .map(|(key, entry)| (key, entry.clone()))
                    .collect();

            let dest_path = dest_dir.join(kind.file_name());
            let mut dest = match Self::load(&dest_path) {
                Err(ToolkitError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
                    return Err(ToolkitError::malformed(
                        &dest_path,
                        "destination repository has no descriptor",
                    ));
                }
                other => other?,
            };
            // validate destination keys before touching anything
            Self::entries(&dest, &layout, &dest_path)?;

            let count = incoming.len();
            if dest.child(layout.container).is_none() {
                dest.children.push(XmlElement::new(layout.container));
            }
            let Some(container) = dest.child_mut(layout.container) else {
                return Err(ToolkitError::malformed(&dest_path, "entry container vanished"));
            };
            apply(container, &layout, incoming);
            let size = container
                .children
                .iter()
                .filter(|child| child.name == layout.entry)
                .count();
            container.set_attribute(SIZE, size.to_string());

            Self::store(&dest_path, kind, &dest)?;
            trace!(kind = %kind, entries = count, total = size, dest = %dest_path.display(), "rewrote descriptor");
        }
        Ok(())
    }
}

fn entry_key(entry: &XmlElement, layout: &Layout, path: &Path) -> Result<EntryKey, ToolkitError> {
    layout
        .key
        .iter()
        .map(|attribute| {
            entry
                .attribute(attribute)
                .map(str::to_string)
                .ok_or_else(|| {
                    ToolkitError::malformed(
                        path,
                        format!("<{}> without '{attribute}' attribute", layout.entry),
                    )
                })
        })
        .collect()
}

fn artifacts_document(owner_id: &str, timestamp: i64) -> XmlElement {
    let mut mappings = XmlElement::new("mappings").with_attribute(SIZE, MAPPING_RULES.len().to_string());
    for (filter, output) in MAPPING_RULES {
        mappings.children.push(
            XmlElement::new("rule")
                .with_attribute("filter", filter)
                .with_attribute("output", output),
        );
    }
    repository_document(DescriptorKind::Artifacts, owner_id, timestamp, &[("p2.compressed", "false")])
        .with_child(mappings)
        .with_child(XmlElement::new("artifacts").with_attribute(SIZE, "0"))
}

fn metadata_document(owner_id: &str, timestamp: i64) -> XmlElement {
    repository_document(DescriptorKind::Metadata, owner_id, timestamp, &[])
        .with_child(XmlElement::new("units").with_attribute(SIZE, "0"))
}

fn repository_document(
    kind: DescriptorKind,
    owner_id: &str,
    timestamp: i64,
    extra_properties: &[(&str, &str)],
) -> XmlElement {
    let mut properties = XmlElement::new("properties").with_child(
        XmlElement::new("property")
            .with_attribute("name", TIMESTAMP_PROPERTY)
            .with_attribute("value", timestamp.to_string()),
    );
    for (name, value) in extra_properties {
        properties.children.push(
            XmlElement::new("property")
                .with_attribute("name", *name)
                .with_attribute("value", *value),
        );
    }
    properties.set_attribute(SIZE, properties.children.len().to_string());

    XmlElement::new(REPOSITORY)
        .with_attribute("name", owner_id)
        .with_attribute("type", kind.repository_type())
        .with_attribute("version", "1")
        .with_child(properties)
}

impl DescriptorToolkit for SimpleDescriptorToolkit {
    fn write_empty(&self, dir: &Path, owner_id: &str) -> Result<(), ToolkitError> {
        fs::create_dir_all(dir).map_err(|err| ToolkitError::io(dir, err))?;
        let timestamp = chrono::Utc::now().timestamp_millis();
        Self::store(
            &dir.join(DescriptorKind::Artifacts.file_name()),
            DescriptorKind::Artifacts,
            &artifacts_document(owner_id, timestamp),
        )?;
        Self::store(
            &dir.join(DescriptorKind::Metadata.file_name()),
            DescriptorKind::Metadata,
            &metadata_document(owner_id, timestamp),
        )?;
        debug!(owner = owner_id, dir = %dir.display(), "wrote empty repository descriptors");
        Ok(())
    }

    fn merge(&self, fragment_dir: &Path, dest_dir: &Path) -> Result<(), ToolkitError> {
        self.rewrite(fragment_dir, dest_dir, |container, layout, incoming| {
            for (key, entry) in incoming {
                let existing = container.children.iter().position(|child| {
                    child.name == layout.entry
                        && layout
                            .key
                            .iter()
                            .zip(&key)
                            .all(|(attribute, value)| child.attribute(attribute) == Some(value.as_str()))
                });
                match existing {
                    Some(index) => container.children[index] = entry,
                    None => container.children.push(entry),
                }
            }
        })
    }

    fn remove(&self, fragment_dir: &Path, dest_dir: &Path) -> Result<(), ToolkitError> {
        self.rewrite(fragment_dir, dest_dir, |container, layout, incoming| {
            let doomed: HashSet<EntryKey> = incoming.into_iter().map(|(key, _)| key).collect();
            container.children.retain(|child| {
                if child.name != layout.entry {
                    return true;
                }
                let key: EntryKey = layout
                    .key
                    .iter()
                    .map(|attribute| child.attribute(attribute).unwrap_or_default().to_string())
                    .collect();
                !doomed.contains(&key)
            });
        })
    }

    fn installable_artifacts(
        &self,
        fragment_dir: &Path,
    ) -> Result<Vec<InstallableArtifact>, ToolkitError> {
        let path = fragment_dir.join(DescriptorKind::Artifacts.file_name());
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let root = Self::load(&path)?;
        let layout = layout(DescriptorKind::Artifacts);
        Self::entries(&root, &layout, &path)?
            .into_iter()
            .map(|(key, _)| match key.as_slice() {
                [classifier, id, version] => Ok(InstallableArtifact::new(
                    id.clone(),
                    version.clone(),
                    ArtifactClassifier::parse(classifier),
                )),
                _ => Err(ToolkitError::malformed(&path, "unexpected artifact key shape")),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BUNDLE_FRAGMENT: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<?artifactRepository version='1.1.0'?>
<repository name='temporary' type='org.eclipse.equinox.p2.artifact.repository.simpleRepository' version='1'>
  <artifacts size='2'>
    <artifact classifier='osgi.bundle' id='X' version='1.0.0'>
      <properties size='1'>
        <property name='download.size' value='42'/>
      </properties>
    </artifact>
    <artifact classifier='binary' id='X.bin' version='1.0.0'/>
  </artifacts>
</repository>
"#;

    const UNIT_FRAGMENT: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<?metadataRepository version='1.1.0'?>
<repository name='temporary' type='org.eclipse.equinox.internal.p2.metadata.repository.LocalMetadataRepository' version='1'>
  <units size='1'>
    <unit id='X' version='1.0.0'>
      <provides size='1'>
        <provided namespace='osgi.bundle' name='X' version='1.0.0'/>
      </provides>
    </unit>
  </units>
</repository>
"#;

    fn fragment_dir(kind: DescriptorKind, body: &str) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(kind.file_name()), body).unwrap();
        dir
    }

    fn empty_repository() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        SimpleDescriptorToolkit::new()
            .write_empty(dir.path(), "releases")
            .unwrap();
        dir
    }

    fn entry_count(dir: &Path, kind: DescriptorKind) -> usize {
        let root = SimpleDescriptorToolkit::load(&dir.join(kind.file_name())).unwrap();
        let layout = layout(kind);
        SimpleDescriptorToolkit::entries(&root, &layout, dir).unwrap().len()
    }

    #[test]
    fn empty_repository_has_no_entries() {
        let dest = empty_repository();
        assert_eq!(entry_count(dest.path(), DescriptorKind::Artifacts), 0);
        assert_eq!(entry_count(dest.path(), DescriptorKind::Metadata), 0);

        let artifacts = fs::read_to_string(dest.path().join("artifacts.xml")).unwrap();
        assert!(artifacts.contains("<?artifactRepository version='1.1.0'?>"));
        assert!(artifacts.contains("name='releases'"));
    }

    #[test]
    fn merge_is_idempotent_and_remove_inverts_it() {
        let toolkit = SimpleDescriptorToolkit::new();
        let dest = empty_repository();
        let fragment = fragment_dir(DescriptorKind::Artifacts, BUNDLE_FRAGMENT);
        let before = fs::read(dest.path().join("artifacts.xml")).unwrap();

        toolkit.merge(fragment.path(), dest.path()).unwrap();
        toolkit.merge(fragment.path(), dest.path()).unwrap();
        assert_eq!(entry_count(dest.path(), DescriptorKind::Artifacts), 2);

        toolkit.remove(fragment.path(), dest.path()).unwrap();
        assert_eq!(entry_count(dest.path(), DescriptorKind::Artifacts), 0);
        assert_eq!(fs::read(dest.path().join("artifacts.xml")).unwrap(), before);
    }

    #[test]
    fn merges_units_into_content() {
        let toolkit = SimpleDescriptorToolkit::new();
        let dest = empty_repository();
        let fragment = fragment_dir(DescriptorKind::Metadata, UNIT_FRAGMENT);

        toolkit.merge(fragment.path(), dest.path()).unwrap();
        assert_eq!(entry_count(dest.path(), DescriptorKind::Metadata), 1);
        let content = fs::read_to_string(dest.path().join("content.xml")).unwrap();
        assert!(content.contains("<units size='1'>"));
        assert!(content.contains("provided namespace='osgi.bundle'"));
    }

    #[test]
    fn lists_installable_artifacts() {
        let fragment = fragment_dir(DescriptorKind::Artifacts, BUNDLE_FRAGMENT);
        let artifacts = SimpleDescriptorToolkit::new()
            .installable_artifacts(fragment.path())
            .unwrap();
        assert_eq!(
            artifacts,
            vec![
                InstallableArtifact::new("X", "1.0.0", ArtifactClassifier::Bundle),
                InstallableArtifact::new(
                    "X.bin",
                    "1.0.0",
                    ArtifactClassifier::Other("binary".to_string())
                ),
            ]
        );
    }

    #[test]
    fn rejects_headerless_fragment() {
        let toolkit = SimpleDescriptorToolkit::new();
        let dest = empty_repository();
        let fragment = fragment_dir(
            DescriptorKind::Artifacts,
            "<?xml version='1.0'?>\n<artifacts size='0'/>\n",
        );
        let err = toolkit.merge(fragment.path(), dest.path()).unwrap_err();
        assert!(matches!(err, ToolkitError::Malformed { .. }));
    }

    #[test]
    fn rejects_entries_without_key() {
        let toolkit = SimpleDescriptorToolkit::new();
        let dest = empty_repository();
        let fragment = fragment_dir(
            DescriptorKind::Metadata,
            "<repository><units size='1'><unit id='X'/></units></repository>",
        );
        assert!(toolkit.merge(fragment.path(), dest.path()).is_err());
        assert_eq!(entry_count(dest.path(), DescriptorKind::Metadata), 0);
    }

    #[test]
    fn empty_fragment_directory_is_malformed() {
        let toolkit = SimpleDescriptorToolkit::new();
        let dest = empty_repository();
        let fragment = tempfile::tempdir().unwrap();
        assert!(toolkit.merge(fragment.path(), dest.path()).is_err());
    }
}
