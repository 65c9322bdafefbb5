//! Metadata embedded in a system root filesystem.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use regex::Regex;
use serde::Deserialize;

/// Version label of the system, relative to its root.
const VERSION_FILE: &str = "usr/share/vyos/version.json";
/// Module defining the image tooling version, relative to the root.
const TOOLS_FILE: &str = "usr/lib/python3/dist-packages/vyos/system/__init__.py";

#[derive(Debug, Deserialize)]
struct VersionData {
    version: String,
}

/// The human-readable version label of the system rooted at `root`.
#[context("Reading version label from {root}")]
pub(crate) fn image_version(root: &Utf8Path) -> Result<String> {
    let path = root.join(VERSION_FILE);
    let f = std::fs::File::open(&path).with_context(|| format!("Opening {path}"))?;
    let data: VersionData = serde_json::from_reader(std::io::BufReader::new(f))?;
    Ok(data.version)
}

fn parse_tools_version(source: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?m)^SYSTEM_CFG_VER\s*=\s*(\d+)").unwrap());
    re.captures(source)?.get(1)?.as_str().parse().ok()
}

/// The image tooling version of the system rooted at `root`.
///
/// Systems which predate the marker have version 0.
#[context("Reading image tools version from {root}")]
pub(crate) fn tools_version(root: &Utf8Path) -> Result<u32> {
    let path = root.join(TOOLS_FILE);
    let source = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {path}; assuming tools version 0");
            return Ok(0);
        }
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    Ok(parse_tools_version(&source).unwrap_or(0))
}

#[cfg(test)]
pub(crate) fn write_metadata(root: &Utf8Path, version: &str, tools: Option<u32>) {
    let p = root.join(VERSION_FILE);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(&p, format!(r#"{{"version": "{version}", "built_by": "test"}}"#)).unwrap();
    if let Some(tools) = tools {
        let p = root.join(TOOLS_FILE);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, format!("import os\n\nSYSTEM_CFG_VER = {tools}\n")).unwrap();
    }
}
