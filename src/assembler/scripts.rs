use crate::error::{BundleResult, IoContext};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Which tree a setup script activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// v1 bundle root: dependencies plus the workspace in `opt/install`.
    Legacy,
    /// v2 dependencies overlay root.
    Dependencies,
    /// v2 workspace overlay root: the workspace in `opt/built_workspace`.
    Workspace,
}

// POSIX sh cannot locate a sourced script, so the caller exports the
// extraction directory as BUNDLE_CURRENT_PREFIX.
const SH_PREAMBLE: &str = r#"#!/bin/sh
if [ -z "$BUNDLE_CURRENT_PREFIX" ]; then
  echo "BUNDLE_CURRENT_PREFIX must point at the extracted overlay" >&2
  return 1 2>/dev/null || exit 1
fi
"#;

const BASH_PREAMBLE: &str = r#"#!/bin/bash
BUNDLE_CURRENT_PREFIX="$(cd "$(dirname "${BASH_SOURCE[0]}")" && pwd)"
export BUNDLE_CURRENT_PREFIX
"#;

const DEPENDENCIES_BODY: &str = r#"
export PATH="$BUNDLE_CURRENT_PREFIX/usr/local/bin:$BUNDLE_CURRENT_PREFIX/usr/bin:$BUNDLE_CURRENT_PREFIX/bin:$PATH"
export LD_LIBRARY_PATH="$BUNDLE_CURRENT_PREFIX/usr/lib:$BUNDLE_CURRENT_PREFIX/usr/lib/x86_64-linux-gnu:$BUNDLE_CURRENT_PREFIX/lib:$BUNDLE_CURRENT_PREFIX/lib/x86_64-linux-gnu:$LD_LIBRARY_PATH"
for site in "$BUNDLE_CURRENT_PREFIX"/usr/lib/python3*/site-packages "$BUNDLE_CURRENT_PREFIX"/usr/lib/python3*/dist-packages "$BUNDLE_CURRENT_PREFIX"/usr/lib/python3/dist-packages; do
  if [ -d "$site" ]; then
    PYTHONPATH="$site${PYTHONPATH:+:$PYTHONPATH}"
  fi
done
export PYTHONPATH
"#;

const WORKSPACE_BODY: &str = r#"
BUNDLE_WORKSPACE="$BUNDLE_CURRENT_PREFIX/opt/built_workspace"
export BUNDLE_WORKSPACE
if [ -f "$BUNDLE_WORKSPACE/local_setup.sh" ]; then
  COLCON_CURRENT_PREFIX="$BUNDLE_WORKSPACE" . "$BUNDLE_WORKSPACE/local_setup.sh"
fi
"#;

const LEGACY_BODY: &str = r#"
BUNDLE_WORKSPACE="$BUNDLE_CURRENT_PREFIX/opt/install"
export BUNDLE_WORKSPACE
if [ -f "$BUNDLE_WORKSPACE/local_setup.sh" ]; then
  COLCON_CURRENT_PREFIX="$BUNDLE_WORKSPACE" . "$BUNDLE_WORKSPACE/local_setup.sh"
fi
"#;

fn body(kind: ScriptKind) -> String {
    match kind {
        ScriptKind::Dependencies => DEPENDENCIES_BODY.to_string(),
        ScriptKind::Workspace => WORKSPACE_BODY.to_string(),
        ScriptKind::Legacy => format!("{DEPENDENCIES_BODY}{LEGACY_BODY}"),
    }
}

pub fn sh_script(kind: ScriptKind) -> String {
    format!("{SH_PREAMBLE}{}", body(kind))
}

pub fn bash_script(kind: ScriptKind) -> String {
    format!("{BASH_PREAMBLE}{}", body(kind))
}

fn write_executable(path: &Path, contents: &str) -> BundleResult<()> {
    fs::write(path, contents).io_context(|| format!("Failed to write {}", path.display()))?;
    let mut perms = fs::metadata(path)
        .io_context(|| format!("Failed to read metadata {}", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
        .io_context(|| format!("Failed to set permissions {}", path.display()))
}

/// Write `setup.sh` into `root`, plus `setup.bash` unless `kind` is legacy.
pub fn install_setup_scripts(root: &Path, kind: ScriptKind) -> BundleResult<()> {
    fs::create_dir_all(root)
        .io_context(|| format!("Failed to create directory: {}", root.display()))?;
    write_executable(&root.join("setup.sh"), &sh_script(kind))?;
    if kind != ScriptKind::Legacy {
        write_executable(&root.join("setup.bash"), &bash_script(kind))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn overlay_scripts_are_executable() {
        let tmp = TempDir::new().unwrap();
        install_setup_scripts(tmp.path(), ScriptKind::Workspace).unwrap();
        for name in ["setup.sh", "setup.bash"] {
            let mode = fs::metadata(tmp.path().join(name)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755, "{name}");
        }
        let sh = fs::read_to_string(tmp.path().join("setup.sh")).unwrap();
        assert!(sh.starts_with("#!/bin/sh"));
        assert!(sh.contains("opt/built_workspace"));
    }

    #[test]
    fn legacy_bundle_gets_single_script() {
        let tmp = TempDir::new().unwrap();
        install_setup_scripts(tmp.path(), ScriptKind::Legacy).unwrap();
        assert!(tmp.path().join("setup.sh").is_file());
        assert!(!tmp.path().join("setup.bash").exists());
        let sh = fs::read_to_string(tmp.path().join("setup.sh")).unwrap();
        assert!(sh.contains("opt/install") && sh.contains("PYTHONPATH"));
    }

    #[test]
    fn bash_script_locates_itself() {
        assert!(bash_script(ScriptKind::Dependencies).contains("BASH_SOURCE"));
        assert!(!sh_script(ScriptKind::Dependencies).contains("BASH_SOURCE"));
    }
}
