//! TW-008: Module source copiers (filesystem and git).

use super::env::EnvProvider;
use super::types::Definition;
use crate::transport::{local::exec_command, CancelToken, CommandSpec};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Files the renderer generates; a module source must not ship them.
pub const RESERVED_FILES: [&str; 4] = [
    "worker-providers.tf",
    "worker-backend.tf",
    "worker-locals.tf",
    "worker.auto.tfvars",
];

/// Skipped when copying a definition.
pub const DEFINITION_IGNORE: [&str; 2] = [".terraform", ".git"];

/// Skipped when copying the shared module directory.
pub const MODULES_IGNORE: [&str; 3] = ["test", ".terraform", "terraform.tfstate*"];

const GIT_PREFIX: &str = "git::";

/// Materializes a module source into a directory.
pub trait Copier {
    /// Human-readable origin for logs.
    fn describe(&self) -> String;

    /// Populate `dest` (which must not exist yet).
    fn copy_to(&self, dest: &Path) -> Result<(), String>;
}

/// Compile ignore patterns; invalid patterns are reported.
pub fn ignore_patterns(raw: &[&str]) -> Result<Vec<glob::Pattern>, String> {
    raw.iter()
        .map(|p| glob::Pattern::new(p).map_err(|e| format!("bad ignore pattern '{}': {}", p, e)))
        .collect()
}

/// Recursive copy skipping entries whose file name matches `ignore`.
pub fn copy_tree(src: &Path, dest: &Path, ignore: &[glob::Pattern]) -> Result<(), String> {
    let walker = WalkDir::new(src)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || {
                let name = e.file_name().to_string_lossy();
                !ignore.iter().any(|p| p.matches(&name))
            }
        });

    for entry in walker {
        let entry = entry.map_err(|e| format!("cannot walk {}: {}", src.display(), e))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| format!("path prefix error: {}", e))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| format!("cannot create {}: {}", target.display(), e))?;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| {
                format!(
                    "cannot copy {} to {}: {}",
                    entry.path().display(),
                    target.display(),
                    e
                )
            })?;
        }
    }
    Ok(())
}

/// Fail if `dir` ships a file the renderer owns.
pub fn check_reserved(dir: &Path) -> Result<(), String> {
    for name in RESERVED_FILES {
        if dir.join(name).exists() {
            return Err(format!(
                "source {} contains reserved file {}",
                dir.display(),
                name
            ));
        }
    }
    Ok(())
}

/// Copies from a local directory.
#[derive(Debug, Clone)]
pub struct FsCopier {
    pub source: PathBuf,
}

impl Copier for FsCopier {
    fn describe(&self) -> String {
        self.source.display().to_string()
    }

    fn copy_to(&self, dest: &Path) -> Result<(), String> {
        if !self.source.is_dir() {
            return Err(format!("source {} is not a directory", self.source.display()));
        }
        check_reserved(&self.source)?;
        copy_tree(&self.source, dest, &ignore_patterns(&DEFINITION_IGNORE)?)
    }
}

/// Shallow-clones a git repository.
#[derive(Debug, Clone)]
pub struct GitCopier {
    pub url: String,
    pub git_ref: Option<String>,
    pub sub_path: Option<String>,
    pub env: Vec<(String, String)>,
}

impl Copier for GitCopier {
    fn describe(&self) -> String {
        match self.git_ref {
            Some(ref r) => format!("{}@{}", self.url, r),
            None => self.url.clone(),
        }
    }

    fn copy_to(&self, dest: &Path) -> Result<(), String> {
        let git = which::which("git").map_err(|e| format!("git not found: {}", e))?;
        let parent = dest
            .parent()
            .ok_or_else(|| format!("{} has no parent", dest.display()))?;
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let checkout = parent.join(format!(".{}-checkout", name));
        let _ = std::fs::remove_dir_all(&checkout);

        let mut spec = CommandSpec::new(git, parent)
            .args(["clone", "--depth", "1", "--quiet"])
            .envs(self.env.clone());
        if let Some(ref r) = self.git_ref {
            spec = spec.arg("--branch").arg(r.as_str());
        }
        spec = spec
            .arg(self.url.as_str())
            .arg(checkout.to_string_lossy().into_owned());

        let out = exec_command(&spec, &CancelToken::new()).map_err(|e| e.to_string())?;
        let result = if out.success() {
            let root = match self.sub_path {
                Some(ref sub) => checkout.join(sub),
                None => checkout.clone(),
            };
            if !root.is_dir() {
                Err(format!("sub_path {} not found in {}", root.display(), self.url))
            } else {
                check_reserved(&root)
                    .and_then(|()| copy_tree(&root, dest, &ignore_patterns(&DEFINITION_IGNORE)?))
            }
        } else {
            Err(format!(
                "git clone of {} failed (exit code {}): {}",
                self.url,
                out.exit_code,
                out.stderr.trim()
            ))
        };
        let _ = std::fs::remove_dir_all(&checkout);
        result
    }
}

/// Whether a definition path names a git repository.
pub fn is_git_source(path: &str) -> bool {
    path.starts_with(GIT_PREFIX)
        || path.starts_with("git@")
        || path.starts_with("git://")
        || ((path.starts_with("https://") || path.starts_with("ssh://")) && path.ends_with(".git"))
}

/// Pick the copier for a definition's `path`. Relative filesystem paths
/// resolve against `repository` first, then as given.
pub fn copier_for(
    def: &Definition,
    repository: &Path,
    env: &dyn EnvProvider,
) -> Result<Box<dyn Copier>, String> {
    if is_git_source(&def.path) {
        let url = def.path.strip_prefix(GIT_PREFIX).unwrap_or(&def.path);
        let options = def.remote_path_options.clone().unwrap_or_default();
        return Ok(Box::new(GitCopier {
            url: url.to_string(),
            git_ref: options.git_ref,
            sub_path: options.sub_path,
            env: env.vars(),
        }));
    }

    let given = Path::new(&def.path);
    let candidates = if given.is_absolute() {
        vec![given.to_path_buf()]
    } else {
        vec![repository.join(given), given.to_path_buf()]
    };
    candidates
        .into_iter()
        .find(|c| c.is_dir())
        .map(|source| Box::new(FsCopier { source }) as Box<dyn Copier>)
        .ok_or_else(|| format!("definition path '{}' not found", def.path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::env::StaticEnv;
    use crate::core::types::RemotePathOptions;
    use std::fs;

    fn module(dir: &Path) {
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::create_dir_all(dir.join(".terraform/providers")).unwrap();
        fs::write(dir.join("main.tf"), "resource \"null_resource\" \"x\" {}\n").unwrap();
        fs::write(dir.join("nested/vars.tf"), "variable \"a\" {}\n").unwrap();
        fs::write(dir.join(".terraform/providers/blob"), "x").unwrap();
    }

    #[test]
    fn test_tw008_copy_tree_ignores() {
        let src = tempfile::tempdir().unwrap();
        module(src.path());
        fs::create_dir_all(src.path().join("test")).unwrap();
        fs::write(src.path().join("test/t.tf"), "").unwrap();
        fs::write(src.path().join("terraform.tfstate.backup"), "").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let out = dest.path().join("copy");
        copy_tree(src.path(), &out, &ignore_patterns(&MODULES_IGNORE).unwrap()).unwrap();
        assert!(out.join("main.tf").exists());
        assert!(out.join("nested/vars.tf").exists());
        assert!(!out.join(".terraform").exists());
        assert!(!out.join("test").exists());
        assert!(!out.join("terraform.tfstate.backup").exists());
    }

    #[test]
    fn test_tw008_fs_copier_resolves_against_repository() {
        let repo = tempfile::tempdir().unwrap();
        module(&repo.path().join("definitions/tags"));
        let def = Definition::new("tags", "definitions/tags");
        let copier = copier_for(&def, repo.path(), &StaticEnv::new()).unwrap();
        assert!(copier.describe().ends_with("definitions/tags"));

        let dest = tempfile::tempdir().unwrap();
        let ws = dest.path().join("tags");
        copier.copy_to(&ws).unwrap();
        assert!(ws.join("main.tf").exists());
        assert!(!ws.join(".terraform").exists());
    }

    #[test]
    fn test_tw008_fs_copier_missing_path() {
        let repo = tempfile::tempdir().unwrap();
        let def = Definition::new("ghost", "definitions/ghost");
        let err = copier_for(&def, repo.path(), &StaticEnv::new())
            .err()
            .unwrap();
        assert!(err.contains("not found"));
    }

    #[test]
    fn test_tw008_reserved_file_rejected() {
        let repo = tempfile::tempdir().unwrap();
        let src = repo.path().join("mod");
        module(&src);
        fs::write(src.join("worker-backend.tf"), "").unwrap();
        let def = Definition::new("m", "mod");
        let copier = copier_for(&def, repo.path(), &StaticEnv::new()).unwrap();
        let err = copier.copy_to(&repo.path().join("out")).unwrap_err();
        assert!(err.contains("reserved file worker-backend.tf"));
    }

    #[test]
    fn test_tw008_git_source_detection() {
        assert!(is_git_source("git::https://example.com/mods"));
        assert!(is_git_source("git@github.com:org/mods.git"));
        assert!(is_git_source("https://github.com/org/mods.git"));
        assert!(!is_git_source("https://github.com/org/mods"));
        assert!(!is_git_source("definitions/network"));
        assert!(!is_git_source("/abs/definitions"));
    }

    #[test]
    fn test_tw008_git_copier_selected_with_options() {
        let mut def = Definition::new("net", "git::https://example.com/mods");
        def.remote_path_options = Some(RemotePathOptions {
            git_ref: Some("v1.2.0".into()),
            sub_path: Some("network".into()),
        });
        let copier = copier_for(&def, Path::new("/repo"), &StaticEnv::new()).unwrap();
        assert_eq!(copier.describe(), "https://example.com/mods@v1.2.0");
    }

    #[test]
    fn test_tw008_git_copier_clones_local_repo() {
        if which::which("git").is_err() {
            return;
        }
        let origin = tempfile::tempdir().unwrap();
        module(&origin.path().join("network"));
        let git = |args: &[&str]| {
            let ok = std::process::Command::new("git")
                .args(["-c", "user.name=t", "-c", "user.email=t@example.com"])
                .args(args)
                .current_dir(origin.path())
                .output()
                .unwrap()
                .status
                .success();
            assert!(ok, "git {:?} failed", args);
        };
        git(&["init", "--quiet"]);
        git(&["add", "network/main.tf", "network/nested/vars.tf"]);
        git(&["commit", "--quiet", "-m", "init"]);

        let copier = GitCopier {
            url: format!("file://{}", origin.path().display()),
            git_ref: None,
            sub_path: Some("network".into()),
            env: StaticEnv::new().with_process_path().vars(),
        };
        let dest = tempfile::tempdir().unwrap();
        let ws = dest.path().join("network");
        copier.copy_to(&ws).unwrap();
        assert!(ws.join("main.tf").exists());
        assert!(ws.join("nested/vars.tf").exists());
        assert!(!dest.path().join(".network-checkout").exists());
    }
}
