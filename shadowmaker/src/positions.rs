// Placement side channel
// Hands split-piece offsets from the DXF stage to the tray stage as `[[x, y], ...]` JSON

use std::fs;
use std::path::{Path, PathBuf};

use shadowmaker_common::PlacementOffset;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

pub const POSITIONS_FILE: &str = "offset_positions.json";

pub fn positions_path(out_dir: &Path) -> PathBuf {
    out_dir.join(POSITIONS_FILE)
}

pub fn save_positions(path: &Path, offsets: &[PlacementOffset]) -> Result<()> {
    let json = serde_json::to_string_pretty(offsets).map_err(|source| PipelineError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|e| PipelineError::io(path, e))?;
    debug!("saved {} placement offset(s) to {}", offsets.len(), path.display());
    Ok(())
}

/// Read the offsets back for `expected` pieces.
/// A missing, unreadable or mismatched file yields zero offsets.
pub fn load_positions(path: &Path, expected: usize) -> Vec<PlacementOffset> {
    let zeros = || vec![PlacementOffset::default(); expected];

    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("could not read {}: {}; placing pieces at the origin", path.display(), e);
            return zeros();
        }
    };

    match serde_json::from_str::<Vec<PlacementOffset>>(&text) {
        Ok(offsets) if offsets.len() == expected => offsets,
        Ok(offsets) => {
            warn!(
                "{} holds {} offset(s) for {} piece(s); placing pieces at the origin",
                path.display(),
                offsets.len(),
                expected
            );
            zeros()
        }
        Err(e) => {
            warn!("could not parse {}: {}; placing pieces at the origin", path.display(), e);
            zeros()
        }
    }
}
