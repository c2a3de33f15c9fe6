use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::catalog::ArchiveCatalog;
use crate::config::ResolvedSettings;
use crate::store::{FsObjectStore, MemoryObjectStore, ObjectStore, SqliteObjectStore, StoreBackend};

pub const STATE_DIR_NAME: &str = ".archivewatch";
pub const CATALOG_FILENAME: &str = "archives.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub store_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub catalog_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\nstore_dir={}\ndb_path={}\nconfig_path={} ({})\ncatalog_path={}",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.store_dir),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            normalize_for_display(&self.catalog_path),
        )
    }

    /// The project's catalog copy when present, else the embedded one.
    pub fn load_catalog(&self) -> Result<ArchiveCatalog> {
        if self.catalog_path.exists() {
            return ArchiveCatalog::load(&self.catalog_path);
        }
        ArchiveCatalog::embedded()
    }

    /// Open the configured object store. Relative store paths resolve against
    /// the project root.
    pub fn open_store(&self, settings: &ResolvedSettings) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = match settings.store_backend {
            StoreBackend::Fs => {
                let dir = settings
                    .store_dir
                    .as_deref()
                    .map(|dir| absolutize(dir, &self.project_root))
                    .unwrap_or_else(|| self.store_dir.clone());
                Arc::new(FsObjectStore::new(dir))
            }
            StoreBackend::Sqlite => {
                let db_path = settings
                    .db_path
                    .as_deref()
                    .map(|path| absolutize(path, &self.project_root))
                    .unwrap_or_else(|| self.db_path.clone());
                if let Some(parent) = db_path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                Arc::new(SqliteObjectStore::open(&db_path)?)
            }
            StoreBackend::Memory => Arc::new(MemoryObjectStore::new()),
        };
        Ok(store)
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub materialize_catalog: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            materialize_catalog: false,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
    pub wrote_catalog: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);
    let state_dir = project_root.join(STATE_DIR_NAME);
    let data_dir = state_dir.join("data");

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("ARCHIVEWATCH_CONFIG") {
        (
            absolutize(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        store_dir: state_dir.join("store"),
        db_path: data_dir.join("archivewatch.db"),
        catalog_path: state_dir.join(CATALOG_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.store_dir, &paths.data_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(&paths.config_path, &render_materialized_config(paths), options.force)?
    } else {
        false
    };
    let wrote_catalog = if options.materialize_catalog {
        write_text_file(&paths.catalog_path, ArchiveCatalog::embedded_json(), options.force)?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
        wrote_catalog,
    })
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    let store_dir = normalize_for_display(&paths.store_dir);
    let db_path = normalize_for_display(&paths.db_path);
    format!(
        "# archivewatch configuration (materialized by `archivewatch init`)\n# Environment variables (ARCHIVEWATCH_*) override these values.\n\n[wiki]\n# url = \"https://uk.wikisource.org\"\n# api_url = \"https://uk.wikisource.org/w/api.php\"\nnamespace = \"Архів\"\n# user_agent = \"archivewatch/0.1 (contact@example.org)\"\n\n[store]\nbackend = \"fs\"\n# dir = \"{store_dir}\"\n# db_path = \"{db_path}\"\n\n[cache]\npage_capacity = 500\npage_window_secs = 3600\nhistory_capacity = 500\nhistory_window_secs = 3600\n\n[translate]\n# endpoint = \"http://localhost:5000/translate\"\nworkers = 2\nchunk_size = 50\n\n[http]\n# timeout_ms = 30000\n# retries = 2\n# retry_delay_ms = 500\n# rate_limit_ms = 300\n",
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = lookup_env("ARCHIVEWATCH_PROJECT_ROOT") {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }
    (detect_project_root_heuristic(&context.cwd), ValueSource::Heuristic)
}

/// Nearest ancestor of `cwd` that already holds a state directory.
fn detect_project_root_heuristic(cwd: &Path) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in cwd.ancestors() {
        if !seen.insert(normalize_for_display(candidate)) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).is_dir() {
            return candidate.to_path_buf();
        }
    }
    cwd.to_path_buf()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
