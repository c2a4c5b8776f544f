//! Project scaffolding under `.baton/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use super::store::SqliteStore;

pub const BATON_DIR: &str = ".baton";

/// All canonical paths within `.baton/` for a project root.
#[derive(Debug, Clone)]
pub struct BatonPaths {
    pub root: PathBuf,
    pub baton_dir: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub marker_path: PathBuf,
}

impl BatonPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let baton_dir = root.join(BATON_DIR);
        let state_dir = baton_dir.join("state");
        Self {
            root,
            baton_dir: baton_dir.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: baton_dir.join(".gitignore"),
            config_path: baton_dir.join("config.toml"),
            db_path: state_dir.join("baton.db"),
            marker_path: state_dir.join("current_session.json"),
        }
    }

    /// Paths for the nearest ancestor of `start` holding `.baton/`, or for
    /// `start` itself when there is none.
    pub fn discover(start: &Path) -> Self {
        let root = start
            .ancestors()
            .find(|dir| dir.join(BATON_DIR).is_dir())
            .unwrap_or(start);
        debug!(root = %root.display(), "resolved project root");
        Self::new(root)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite the config template and `.gitignore` if present.
    pub force: bool,
}

/// Create `.baton/` scaffolding and the state database in `root`.
pub fn init_baton(root: &Path, options: &InitOptions) -> Result<BatonPaths> {
    let paths = BatonPaths::new(root);
    if paths.baton_dir.exists() && !paths.baton_dir.is_dir() {
        return Err(anyhow!("baton init: .baton exists but is not a directory"));
    }
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create directory {}", paths.state_dir.display()))?;

    write_unless_present(&paths.gitignore_path, BATON_GITIGNORE, options.force)?;
    write_unless_present(&paths.config_path, CONFIG_TEMPLATE, options.force)?;
    SqliteStore::open(&paths.db_path)
        .with_context(|| format!("initialize store {}", paths.db_path.display()))?;

    info!(root = %paths.root.display(), "initialized .baton");
    Ok(paths)
}

fn write_unless_present(path: &Path, contents: &str, force: bool) -> Result<()> {
    if path.exists() && !force {
        debug!(path = %path.display(), "keeping existing file");
        return Ok(());
    }
    write_atomic(path, contents)
}

/// Write `contents` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

const BATON_GITIGNORE: &str = "state/\n";

const CONFIG_TEMPLATE: &str = r#"# baton project configuration.
# Values set here win over the user config, which wins over built-in defaults.
# Manage with `baton set-config <key> <value>` or edit by hand.

[thresholds]
# exploration_calls = 5
# circuit_breaker_violations = 3
# violation_decay_seconds = 600
# rapid_sequence_window = 10

[anti_patterns]
# consecutive_bash = 5
# consecutive_read = 5

[enforcement]
# mode = "strict"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_layout_and_is_rerunnable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_baton(temp.path(), &InitOptions::default()).expect("init");
        assert!(paths.gitignore_path.is_file());
        assert!(paths.config_path.is_file());
        assert!(paths.db_path.is_file());

        fs::write(&paths.config_path, "[thresholds]\nexploration_calls = 9\n").expect("edit");
        init_baton(temp.path(), &InitOptions::default()).expect("re-init");
        let kept = fs::read_to_string(&paths.config_path).expect("read");
        assert!(kept.contains("exploration_calls = 9"));

        init_baton(temp.path(), &InitOptions { force: true }).expect("force");
        let reset = fs::read_to_string(&paths.config_path).expect("read");
        assert_eq!(reset, CONFIG_TEMPLATE);
    }

    #[test]
    fn config_template_parses() {
        toml::from_str::<toml::Table>(CONFIG_TEMPLATE).expect("template is valid toml");
    }

    #[test]
    fn discover_walks_up_to_project_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(BATON_DIR)).expect("mkdir");
        let nested = temp.path().join("src").join("deep");
        fs::create_dir_all(&nested).expect("mkdir");
        let paths = BatonPaths::discover(&nested);
        assert_eq!(paths.root, temp.path());
    }

    #[test]
    fn write_atomic_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a").join("file.txt");
        write_atomic(&path, "one").expect("write");
        write_atomic(&path, "two").expect("overwrite");
        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        let entries: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
