use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::{DEFAULT_INDEX_ROOT, RepoPath};

/// One repository hosted on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepositorySettings {
    pub id: String,
    pub path: PathBuf,
    /// Whether aggregation is enabled for this repository.
    #[serde(default = "default_aggregate")]
    pub aggregate: bool,
    /// Extra capability properties handed to the aggregator configuration.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_aggregate() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub index_root: RepoPath,
    pub staging_dir: Option<PathBuf>,
    pub repositories: Vec<RepositorySettings>,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            index_root: RepoPath::parse(DEFAULT_INDEX_ROOT).unwrap_or_else(|_| RepoPath::root()),
            staging_dir: None,
            repositories: Vec::new(),
        }
    }
}

impl AggregatorSettings {
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let file_config = if let Some(path) = args.config.as_ref() {
            load_config_file(path)?
        } else {
            PartialConfig::default()
        };

        let PartialConfig {
            index_root: file_index_root,
            staging_dir: file_staging_dir,
            repositories: file_repositories,
        } = file_config;

        let raw_index_root = args
            .index_root
            .clone()
            .or(file_index_root)
            .unwrap_or_else(|| DEFAULT_INDEX_ROOT.to_string());
        let index_root = RepoPath::parse(&raw_index_root)
            .with_context(|| format!("invalid index root {raw_index_root:?}"))?;

        let base_dir = args
            .config
            .as_ref()
            .and_then(|path| path.parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let staging_dir = args
            .staging_dir
            .clone()
            .or(file_staging_dir)
            .map(|dir| resolve(&base_dir, dir));

        let repositories = file_repositories
            .unwrap_or_default()
            .into_iter()
            .map(|mut repository| {
                repository.id = repository.id.trim().to_string();
                repository.path = resolve(&base_dir, repository.path);
                repository
            })
            .collect();

        Ok(Self {
            index_root,
            staging_dir,
            repositories,
        })
    }

    /// Fail-fast checks run before any repository is touched.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.index_root.is_root(),
            "index root must not be the repository root"
        );
        anyhow::ensure!(
            !self.repositories.is_empty(),
            "at least one repository must be configured"
        );

        let mut seen = HashSet::new();
        for repository in &self.repositories {
            anyhow::ensure!(!repository.id.is_empty(), "repository id must not be empty");
            anyhow::ensure!(
                seen.insert(repository.id.as_str()),
                "repository id {:?} is configured twice",
                repository.id
            );
            anyhow::ensure!(
                repository.path.is_dir(),
                "storage of repository {:?} at {:?} is not a directory",
                repository.id,
                repository.path
            );
        }

        if let Some(dir) = self.staging_dir.as_ref() {
            anyhow::ensure!(
                !dir.exists() || dir.is_dir(),
                "staging directory {:?} is not a directory",
                dir
            );
        }
        Ok(())
    }

    pub fn repository(&self, id: &str) -> Option<&RepositorySettings> {
        self.repositories.iter().find(|repository| repository.id == id)
    }
}

fn resolve(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "p2-aggregator",
    about = "Maintains the aggregate p2 index of artifact repositories",
    version
)]
pub struct CliArgs {
    #[arg(
        long,
        env = "P2_AGGREGATOR_CONFIG",
        value_name = "FILE",
        help = "Path to a configuration file (YAML or JSON)",
        global = true
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "P2_AGGREGATOR_STAGING_DIR",
        value_name = "DIR",
        help = "Directory that holds temporary staging areas",
        global = true
    )]
    pub staging_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "P2_AGGREGATOR_INDEX_ROOT",
        value_name = "PATH",
        help = "Repository path of the aggregate index",
        global = true
    )]
    pub index_root: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Rebuild the aggregate index from every fragment in storage
    Rebuild {
        /// Only rebuild this repository
        #[arg(long, value_name = "ID")]
        repository: Option<String>,
    },
    /// Merge a published fragment into the aggregate index
    Update {
        #[arg(long, value_name = "ID")]
        repository: String,
        /// Repository path of the fragment
        path: String,
    },
    /// Remove a fragment's entries from the aggregate index
    Remove {
        #[arg(long, value_name = "ID")]
        repository: String,
        /// Repository path of the fragment
        path: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    index_root: Option<String>,
    staging_dir: Option<PathBuf>,
    repositories: Option<Vec<RepositorySettings>>,
}

fn load_config_file(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        anyhow::bail!("config file {:?} does not exist", path);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {:?}", path))?;
    let ext = path
        .extension()
        .and_then(|os| os.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let parsed = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML config {:?}", path))?,
        "json" => serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON config {:?}", path))?,
        other => anyhow::bail!("unsupported config extension: {other}"),
    };
    Ok(parsed)
}
