//! Write a starter configuration and sandbox image definition.
//!
//! Filesystem access goes through closures so the decision logic can be
//! tested without touching disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::templates;

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Runs the init command, writing `config_path` and the sandbox Dockerfile.
pub(crate) fn run(config_path: &Path, force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    info!("Initializing sandtrap in {}", cwd.display());

    let files = init_files(config_path);

    let results = init_project(
        &files,
        force,
        |path| cwd.join(path).exists(),
        |path| {
            fs::create_dir_all(cwd.join(path))
                .with_context(|| format!("Failed to create directory: {}", path.display()))
        },
        |path, content| {
            fs::write(cwd.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_results(&results, &files, config_path));

    Ok(())
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

/// File to be written during init.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    path: PathBuf,
    content: &'static str,
    description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    /// Already present and `--force` not given.
    Skipped,
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

fn init_files(config_path: &Path) -> Vec<InitFile> {
    vec![
        InitFile {
            path: config_path.to_path_buf(),
            content: templates::SANDTRAP_TOML,
            description: "Honeypot configuration",
        },
        InitFile {
            path: PathBuf::from("docker/target/Dockerfile"),
            content: templates::TARGET_DOCKERFILE,
            description: "Sandbox image definition",
        },
    ]
}

/// Decide per file whether to write it, and write it.
///
/// - `exists`: checks if a path exists
/// - `create_dir`: creates a directory (and parents)
/// - `write_file`: writes content to a path
fn init_project<E, D, W>(
    files: &[InitFile],
    force: bool,
    exists: E,
    create_dir: D,
    mut write_file: W,
) -> Result<Vec<(PathBuf, WriteResult)>>
where
    E: Fn(&Path) -> bool,
    D: Fn(&Path) -> Result<()>,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let mut results = Vec::with_capacity(files.len());

    for file in files {
        let existed = exists(&file.path);
        let result = match (existed, force) {
            (true, false) => WriteResult::Skipped,
            (true, true) => WriteResult::Overwritten,
            (false, _) => WriteResult::Created,
        };

        if result != WriteResult::Skipped {
            if let Some(dir) = file.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                create_dir(dir)?;
            }
            write_file(&file.path, file.content)?;
        }
        results.push((file.path.clone(), result));
    }

    Ok(results)
}

fn format_results(
    results: &[(PathBuf, WriteResult)],
    files: &[InitFile],
    config_path: &Path,
) -> String {
    let mut out = String::new();
    let config = config_path.display().to_string();

    let _ = writeln!(out, "\n{} sandtrap initialized\n", "✓".green().bold());

    for (path, result) in results {
        let desc = files
            .iter()
            .find(|f| &f.path == path)
            .map_or("", |f| f.description);

        let _ = match result {
            WriteResult::Created => {
                writeln!(out, "  {} - {}", path.display().to_string().cyan(), desc)
            }
            WriteResult::Overwritten => {
                writeln!(out, "  {} {} (overwritten)", "↻".blue(), path.display())
            }
            WriteResult::Skipped => writeln!(
                out,
                "  {} {} (already exists, use --force to overwrite)",
                "⊘".yellow(),
                path.display()
            ),
        };
    }

    let _ = writeln!(out, "\n{}", "Next steps:".yellow().bold());
    let _ = writeln!(
        out,
        "  1. Edit {} (credentials, pool size, limits)",
        config.cyan()
    );
    let _ = writeln!(
        out,
        "  2. Build the sandbox image: {}",
        "docker build -t sandtrap-target-ubuntu:latest docker/target".green()
    );
    let _ = writeln!(
        out,
        "  3. Generate the SSH host key: {}",
        "ssh-keygen -t ed25519 -f /data/keys/ssh_host_ed25519_key -N ''".green()
    );
    let _ = writeln!(out, "  4. Run {} to verify", "sandtrap check".green());
    let _ = writeln!(out, "  5. Run {} to start the honeypot", "sandtrap serve".green());

    out
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn test_init_files_include_config() {
        let files = init_files(Path::new("sandtrap.toml"));
        assert!(files
            .iter()
            .any(|f| f.path.as_path() == Path::new("sandtrap.toml")));
        assert!(files.iter().all(|f| !f.content.is_empty()));
    }

    #[test]
    fn test_init_project_creates_files() {
        let files = init_files(Path::new("sandtrap.toml"));
        let written = RefCell::new(HashMap::new());
        let dirs_created = RefCell::new(HashSet::new());

        let results = init_project(
            &files,
            false,
            |_| false,
            |path| {
                dirs_created.borrow_mut().insert(path.to_path_buf());
                Ok(())
            },
            |path, content| {
                written
                    .borrow_mut()
                    .insert(path.to_path_buf(), content.to_string());
                Ok(())
            },
        )
        .unwrap();

        assert!(results.iter().all(|(_, r)| *r == WriteResult::Created));
        assert_eq!(written.borrow().len(), files.len());
        assert!(dirs_created
            .borrow()
            .contains(&PathBuf::from("docker/target")));
        // Bare file names need no directory
        assert_eq!(dirs_created.borrow().len(), 1);
    }

    #[test]
    fn test_init_project_skips_existing_without_force() {
        let files = init_files(Path::new("sandtrap.toml"));
        let written = RefCell::new(HashMap::new());

        let results = init_project(
            &files,
            false,
            |_| true,
            |_| Ok(()),
            |path, content| {
                written
                    .borrow_mut()
                    .insert(path.to_path_buf(), content.to_string());
                Ok(())
            },
        )
        .unwrap();

        assert!(results.iter().all(|(_, r)| *r == WriteResult::Skipped));
        assert!(written.borrow().is_empty());
    }

    #[test]
    fn test_init_project_overwrites_with_force() {
        let files = init_files(Path::new("sandtrap.toml"));
        let written = RefCell::new(HashMap::new());

        let results = init_project(
            &files,
            true,
            |_| true,
            |_| Ok(()),
            |path, content| {
                written
                    .borrow_mut()
                    .insert(path.to_path_buf(), content.to_string());
                Ok(())
            },
        )
        .unwrap();

        assert!(results.iter().all(|(_, r)| *r == WriteResult::Overwritten));
        assert_eq!(written.borrow().len(), files.len());
    }

    #[test]
    fn test_force_on_missing_file_reports_created() {
        let files = init_files(Path::new("conf/honeypot.toml"));
        let results = init_project(&files, true, |_| false, |_| Ok(()), |_, _| Ok(())).unwrap();
        assert_eq!(
            results[0],
            (PathBuf::from("conf/honeypot.toml"), WriteResult::Created)
        );
    }

    #[test]
    fn test_format_results() {
        colored::control::set_override(false);
        let files = init_files(Path::new("sandtrap.toml"));
        let results = vec![
            (PathBuf::from("sandtrap.toml"), WriteResult::Created),
            (
                PathBuf::from("docker/target/Dockerfile"),
                WriteResult::Skipped,
            ),
        ];

        let output = format_results(&results, &files, Path::new("sandtrap.toml"));
        assert!(output.contains("sandtrap initialized"));
        assert!(output.contains("sandtrap.toml - Honeypot configuration"));
        assert!(output.contains("already exists, use --force"));
        assert!(output.contains("sandtrap serve"));
    }
}
