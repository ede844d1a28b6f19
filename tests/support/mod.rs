#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use p2_aggregator::error::{StoreError, ToolkitError};
use p2_aggregator::model::InstallableArtifact;
use p2_aggregator::store::{ItemLockGuard, StoreItem};
use p2_aggregator::{
    Aggregator, AggregatorConfiguration, AggregatorConfigurations, ArtifactStore, DescriptorKind,
    DescriptorToolkit, Fragment, FsStore, LockMode, RepoPath, SimpleDescriptorToolkit,
    StoreRegistry,
};
use parking_lot::Mutex;
use tempfile::{TempDir, tempdir};

pub const REPOSITORY_ID: &str = "releases";
pub const BUNDLE: &str = "osgi.bundle";
pub const FEATURE: &str = "org.eclipse.update.feature";

pub fn path(raw: &str) -> RepoPath {
    RepoPath::parse(raw).expect("valid repository path")
}

/// Artifacts fragment as published by Tycho: no `<repository>` root.
pub fn artifacts_fragment(entries: &[(&str, &str, &str)]) -> String {
    let mut out = String::from(
        "<?xml version='1.0' encoding='UTF-8'?>\n<?artifactRepository version='1.1.0'?>\n",
    );
    out.push_str(&format!("<artifacts size='{}'>\n", entries.len()));
    for (classifier, id, version) in entries {
        out.push_str(&format!(
            "  <artifact classifier='{classifier}' id='{id}' version='{version}'>\n    <properties size='1'>\n      <property name='artifact.size' value='1024'/>\n    </properties>\n  </artifact>\n"
        ));
    }
    out.push_str("</artifacts>\n");
    out
}

/// Metadata fragment as published by Tycho: no processing instruction, no root.
pub fn content_fragment(units: &[(&str, &str)]) -> String {
    let mut out = String::from("<?xml version='1.0' encoding='UTF-8'?>\n");
    out.push_str(&format!("<units size='{}'>\n", units.len()));
    for (id, version) in units {
        out.push_str(&format!(
            "  <unit id='{id}' version='{version}'>\n    <provides size='1'>\n      <provided namespace='osgi.bundle' name='{id}' version='{version}'/>\n    </provides>\n  </unit>\n"
        ));
    }
    out.push_str("</units>\n");
    out
}

/// A module published into the test repository.
pub struct PublishedModule {
    pub jar: RepoPath,
    pub artifacts: RepoPath,
    pub content: RepoPath,
}

pub struct TestRepository {
    _tempdir: TempDir,
    root: PathBuf,
    pub store: Arc<FsStore>,
    pub aggregator: Arc<Aggregator>,
}

impl TestRepository {
    pub fn new() -> Self {
        Self::with_toolkit(Arc::new(SimpleDescriptorToolkit::new()))
    }

    pub fn with_toolkit(toolkit: Arc<dyn DescriptorToolkit>) -> Self {
        Self::build(toolkit, None)
    }

    /// The engine sees a store that stalls before granting `Update` locks, as if the
    /// updating thread were preempted right after its enabled check.
    pub fn with_update_lock_delay(delay: Duration) -> Self {
        Self::build(Arc::new(SimpleDescriptorToolkit::new()), Some(delay))
    }

    fn build(toolkit: Arc<dyn DescriptorToolkit>, update_lock_delay: Option<Duration>) -> Self {
        let tempdir = tempdir().expect("tempdir");
        let root = tempdir.path().join(REPOSITORY_ID);
        std::fs::create_dir_all(&root).expect("create repository dir");

        let store = Arc::new(FsStore::new(REPOSITORY_ID, &root));
        let registry = StoreRegistry::new();
        match update_lock_delay {
            Some(delay) => registry.register(Arc::new(StallingStore {
                inner: store.clone(),
                delay,
            })),
            None => registry.register(store.clone()),
        }
        let aggregator = Aggregator::new(
            Arc::new(registry),
            Arc::new(AggregatorConfigurations::new()),
            toolkit,
        )
        .with_staging_dir(Some(tempdir.path().join("staging")));

        Self {
            _tempdir: tempdir,
            root,
            store,
            aggregator: Arc::new(aggregator),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self._tempdir.path().join("staging")
    }

    /// Entries left behind in the staging directory.
    pub fn leftover_staging(&self) -> usize {
        std::fs::read_dir(self.staging_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    pub fn enable(&self) {
        let outcome = self
            .aggregator
            .enable(AggregatorConfiguration::new(REPOSITORY_ID));
        assert_eq!(outcome, p2_aggregator::Outcome::Applied);
    }

    /// Stores jar and both fragments of a module under `/<group>/<id>/<version>/`.
    pub fn publish(
        &self,
        group: &str,
        id: &str,
        version: &str,
        classifier: &str,
    ) -> PublishedModule {
        let dir = format!("/{group}/{id}/{version}");
        let module = PublishedModule {
            jar: path(&format!("{dir}/{id}-{version}.jar")),
            artifacts: path(&format!("{dir}/{id}-{version}-p2artifacts.xml")),
            content: path(&format!("{dir}/{id}-{version}-p2content.xml")),
        };
        let osgi_version = format!("{version}.0");
        self.put(&module.jar, format!("jar of {id}").as_bytes());
        self.put(
            &module.artifacts,
            artifacts_fragment(&[(classifier, id, &osgi_version)]).as_bytes(),
        );
        self.put(
            &module.content,
            content_fragment(&[(id, &osgi_version)]).as_bytes(),
        );
        module
    }

    pub fn put(&self, path: &RepoPath, bytes: &[u8]) {
        self.store
            .put(path, bytes, "application/octet-stream")
            .expect("put");
    }

    pub fn fragment(&self, path: &RepoPath) -> Fragment {
        Fragment::stored(REPOSITORY_ID, path.clone())
    }

    pub fn index_path(&self, kind: DescriptorKind) -> RepoPath {
        self.aggregator
            .index_root()
            .join(kind.file_name())
            .expect("index path")
    }

    pub fn exposed(&self, kind: DescriptorKind) -> Option<Vec<u8>> {
        self.store.get(&self.index_path(kind)).expect("read index")
    }

    pub fn exposed_text(&self, kind: DescriptorKind) -> String {
        String::from_utf8(self.exposed(kind).expect("index exists")).expect("utf-8 index")
    }

    pub fn link(&self, relative: &str) -> RepoPath {
        self.aggregator
            .index_root()
            .join(relative)
            .expect("link path")
    }

    /// Every file under the repository root, hidden sidecars excluded.
    pub fn snapshot(&self) -> Vec<(RepoPath, Vec<u8>)> {
        self.store
            .list_tree()
            .expect("list tree")
            .into_iter()
            .filter(|path| !path.as_str().starts_with("/.nexus"))
            .map(|path| {
                let bytes = self.store.get(&path).expect("get").unwrap_or_default();
                (path, bytes)
            })
            .collect()
    }
}

/// Where a [`FailingToolkit`] gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// After scribbling over the staged descriptor.
    Merge,
    /// After a successful merge, while listing the fragment's artifacts.
    Listing,
}

/// Delegates to the real toolkit but fails at a chosen point.
pub struct FailingToolkit {
    inner: SimpleDescriptorToolkit,
    point: FailurePoint,
}

impl FailingToolkit {
    pub fn new(point: FailurePoint) -> Self {
        Self {
            inner: SimpleDescriptorToolkit::new(),
            point,
        }
    }
}

impl DescriptorToolkit for FailingToolkit {
    fn write_empty(&self, dir: &Path, owner_id: &str) -> Result<(), ToolkitError> {
        self.inner.write_empty(dir, owner_id)
    }

    fn merge(&self, fragment_dir: &Path, dest_dir: &Path) -> Result<(), ToolkitError> {
        if self.point == FailurePoint::Merge {
            for kind in DescriptorKind::ALL {
                let staged = dest_dir.join(kind.file_name());
                if staged.exists() {
                    std::fs::write(&staged, b"<repository><half").expect("scribble");
                }
            }
            return Err(ToolkitError::Malformed {
                path: fragment_dir.to_path_buf(),
                reason: "injected merge failure".to_string(),
            });
        }
        self.inner.merge(fragment_dir, dest_dir)
    }

    fn remove(&self, fragment_dir: &Path, dest_dir: &Path) -> Result<(), ToolkitError> {
        self.inner.remove(fragment_dir, dest_dir)
    }

    fn installable_artifacts(
        &self,
        fragment_dir: &Path,
    ) -> Result<Vec<InstallableArtifact>, ToolkitError> {
        if self.point == FailurePoint::Listing {
            return Err(ToolkitError::Io {
                path: fragment_dir.to_path_buf(),
                source: std::io::Error::other("injected listing failure"),
            });
        }
        self.inner.installable_artifacts(fragment_dir)
    }
}

/// Delegates to the real toolkit, sleeping inside every merge and recording when
/// each merge ran.
pub struct SlowToolkit {
    inner: SimpleDescriptorToolkit,
    delay: Duration,
    pub intervals: Mutex<Vec<(Instant, Instant)>>,
}

impl SlowToolkit {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: SimpleDescriptorToolkit::new(),
            delay,
            intervals: Mutex::new(Vec::new()),
        }
    }
}

impl DescriptorToolkit for SlowToolkit {
    fn write_empty(&self, dir: &Path, owner_id: &str) -> Result<(), ToolkitError> {
        self.inner.write_empty(dir, owner_id)
    }

    fn merge(&self, fragment_dir: &Path, dest_dir: &Path) -> Result<(), ToolkitError> {
        let started = Instant::now();
        thread::sleep(self.delay);
        let result = self.inner.merge(fragment_dir, dest_dir);
        self.intervals.lock().push((started, Instant::now()));
        result
    }

    fn remove(&self, fragment_dir: &Path, dest_dir: &Path) -> Result<(), ToolkitError> {
        self.inner.remove(fragment_dir, dest_dir)
    }

    fn installable_artifacts(
        &self,
        fragment_dir: &Path,
    ) -> Result<Vec<InstallableArtifact>, ToolkitError> {
        self.inner.installable_artifacts(fragment_dir)
    }
}

/// Delegates to a [`FsStore`], sleeping before every `Update` lock acquisition.
pub struct StallingStore {
    inner: Arc<FsStore>,
    delay: Duration,
}

impl ArtifactStore for StallingStore {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn get(&self, path: &RepoPath) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(path)
    }

    fn lookup(&self, path: &RepoPath) -> Result<Option<StoreItem>, StoreError> {
        self.inner.lookup(path)
    }

    fn put(&self, path: &RepoPath, bytes: &[u8], content_type: &str) -> Result<(), StoreError> {
        self.inner.put(path, bytes, content_type)
    }

    fn delete(&self, path: &RepoPath) -> Result<bool, StoreError> {
        self.inner.delete(path)
    }

    fn create_link(&self, link: &RepoPath, target: &StoreItem) -> Result<(), StoreError> {
        self.inner.create_link(link, target)
    }

    fn lock(&self, path: &RepoPath, mode: LockMode) -> ItemLockGuard {
        if mode == LockMode::Update {
            thread::sleep(self.delay);
        }
        self.inner.lock(path, mode)
    }

    fn list_tree(&self) -> Result<Vec<RepoPath>, StoreError> {
        self.inner.list_tree()
    }
}
