//! Cloud-init seed ISO creation.
//!
//! Some guests ignore firmware-delivered credentials and only read
//! provisioning data from a NoCloud seed image: an ISO9660 volume
//! labelled `cidata` attached as a cdrom.

use crate::error::{Error, Result};
use std::path::Path;

/// Volume label the NoCloud datasource looks for.
const CIDATA_LABEL: &str = "cidata";

/// Common install locations for ISO authoring tools.
const ISO_TOOL_PATH_PREFIXES: &[&str] = &[
    "/opt/homebrew/bin", // macOS ARM (Homebrew)
    "/usr/local/bin",    // macOS Intel (Homebrew)
    "/usr/bin",          // Linux
    "/bin",              // Linux alt
];

/// ISO authoring tools in preference order, with the flag spelling each
/// one uses for the volume label.
const ISO_TOOLS: &[(&str, &str)] = &[
    ("xorriso", "-volid"),
    ("mkisofs", "-V"),
    ("genisoimage", "-V"),
];

/// Find an ISO authoring tool, searching common install paths first and
/// then falling back to PATH lookup.
fn find_iso_tool() -> Option<(String, &'static str, &'static str)> {
    for (name, label_flag) in ISO_TOOLS {
        for prefix in ISO_TOOL_PATH_PREFIXES {
            let path = format!("{}/{}", prefix, name);
            if Path::new(&path).exists() {
                return Some((path, name, label_flag));
            }
        }
        if std::process::Command::new(name)
            .arg("--version")
            .output()
            .is_ok()
        {
            return Some((name.to_string(), name, label_flag));
        }
    }
    None
}

/// Pack `source_dir` into a `cidata`-labelled ISO at `out_path`.
///
/// The caller provides the NoCloud files (`user-data`, `meta-data`) in
/// `source_dir`; we only handle the packaging.
pub fn create_iso(source_dir: &Path, out_path: &Path) -> Result<()> {
    let (tool_path, tool_name, label_flag) = find_iso_tool().ok_or_else(|| {
        Error::command_failed(
            "iso tool lookup",
            "no ISO authoring tool found. Install one of: xorriso, mkisofs, genisoimage",
        )
    })?;

    tracing::debug!(
        tool = tool_name,
        out = %out_path.display(),
        "creating cloud-init seed iso"
    );

    let mut cmd = std::process::Command::new(&tool_path);
    if tool_name == "xorriso" {
        cmd.args(["-as", "mkisofs"]);
    }
    cmd.arg("-output")
        .arg(out_path)
        .arg(label_flag)
        .arg(CIDATA_LABEL)
        .args(["-joliet", "-rock"])
        .arg(source_dir);

    let output = cmd
        .output()
        .map_err(|e| Error::command_failed(tool_name, e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::command_failed(tool_name, stderr.trim().to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_iso_produces_file() {
        if find_iso_tool().is_none() {
            eprintln!("skipping: no ISO authoring tool installed");
            return;
        }

        let tmp = tempfile::tempdir().unwrap();
        let seed_dir = tmp.path().join("seed");
        std::fs::create_dir(&seed_dir).unwrap();
        std::fs::write(seed_dir.join("user-data"), "#cloud-config\n").unwrap();
        std::fs::write(seed_dir.join("meta-data"), "instance-id: test\n").unwrap();

        let iso = tmp.path().join("cidata.iso");
        create_iso(&seed_dir, &iso).unwrap();

        let meta = std::fs::metadata(&iso).unwrap();
        assert!(meta.len() > 0);
    }

    #[test]
    fn test_create_iso_missing_source_fails() {
        if find_iso_tool().is_none() {
            eprintln!("skipping: no ISO authoring tool installed");
            return;
        }

        let tmp = tempfile::tempdir().unwrap();
        let iso = tmp.path().join("cidata.iso");
        let missing = tmp.path().join("does-not-exist");
        assert!(create_iso(&missing, &iso).is_err());
    }
}
