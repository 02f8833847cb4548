// OpenSCAD launcher
// Finds the executable and opens a generated script without waiting for it

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Environment variable that may point at the executable
pub const OPENSCAD_ENV: &str = "OPENSCAD";

const INSTALL_PATHS: &[&str] = &[
    "C:/Program Files/OpenSCAD/openscad.exe",
    "C:/Program Files/OpenSCAD (Nightly)/openscad.exe",
    "/Applications/OpenSCAD.app/Contents/MacOS/OpenSCAD",
    "/usr/bin/openscad",
    "/usr/local/bin/openscad",
    "/snap/bin/openscad",
];

const EXECUTABLE_NAMES: &[&str] = &["openscad", "openscad.exe", "openscad-nightly"];

/// Candidate locations in lookup order: explicit path, environment, install paths, `PATH`.
pub fn candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut out = Vec::new();

    if let Some(path) = explicit {
        out.push(path.to_path_buf());
    }
    if let Some(path) = env::var_os(OPENSCAD_ENV) {
        out.push(PathBuf::from(path));
    }
    out.extend(INSTALL_PATHS.iter().map(PathBuf::from));
    if let Some(path_var) = env::var_os("PATH") {
        for dir in env::split_paths(&path_var) {
            out.extend(EXECUTABLE_NAMES.iter().map(|name| dir.join(name)));
        }
    }

    out
}

/// First candidate that exists as a file
pub fn find_openscad(explicit: Option<&Path>) -> Result<PathBuf> {
    let candidates = candidates(explicit);

    // An explicit path must exist; no silent fallback to another install.
    if let Some(path) = explicit {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(PipelineError::CadNotFound {
                searched: path.display().to_string(),
            })
        };
    }

    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| PipelineError::CadNotFound {
            searched: format!("{} location(s), ${} and PATH", INSTALL_PATHS.len(), OPENSCAD_ENV),
        })
}

/// Start OpenSCAD on `script` and return immediately.
pub fn launch(executable: &Path, script: &Path) -> Result<()> {
    debug!("spawning {} {}", executable.display(), script.display());

    // The child is detached; its exit status is never collected.
    Command::new(executable)
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| PipelineError::io(executable, e))?;

    info!("opened {} in OpenSCAD", script.display());
    Ok(())
}
