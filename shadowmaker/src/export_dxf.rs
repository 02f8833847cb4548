// DXF export module
// Writes traced contours as closed LWPOLYLINEs in millimeters

use std::fs;
use std::path::{Path, PathBuf};

use dxf::entities::*;
use dxf::enums::{AcadVersion, Units};
use dxf::{Color, Drawing, LwPolylineVertex};
use rayon::prelude::*;
use shadowmaker_common::{Contour, OutputMode};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::layout::Layout;

/// One DXF file written by an export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DxfArtifact {
    /// 1-based piece number in split mode, 0 for the combined file
    pub index: usize,
    pub path: PathBuf,
}

/// Build a drawing holding one closed polyline per contour.
/// Coordinates are in millimeters.
pub fn build_drawing(contours: &[Contour]) -> Drawing {
    let mut drawing = Drawing::new();
    drawing.header.version = AcadVersion::R2010;
    drawing.header.default_drawing_units = Units::Millimeters;

    for (idx, contour) in contours.iter().enumerate() {
        if contour.points.is_empty() {
            continue;
        }

        let mut polyline = LwPolyline::default();

        for pt in &contour.points {
            polyline.vertices.push(LwPolylineVertex {
                x: pt.x,
                y: pt.y,
                ..Default::default()
            });
        }

        // The first vertex is repeated as the last, and the flag is set as well
        // so readers that honor either convention see a closed shape.
        polyline.set_is_closed(true);

        let mut common = EntityCommon::default();
        common.layer = format!("CONTOUR-{}", idx);
        common.color = Color::from_index(7);

        drawing.add_entity(Entity {
            common,
            specific: EntityType::LwPolyline(polyline),
        });
    }

    drawing
}

/// Save contours to a single DXF file
pub fn write_dxf(contours: &[Contour], output_path: &Path) -> Result<()> {
    let drawing = build_drawing(contours);
    let file_name = output_path.to_string_lossy().into_owned();
    drawing
        .save_file(&file_name)
        .map_err(|source| PipelineError::Dxf {
            path: output_path.to_path_buf(),
            source,
        })?;

    debug!("wrote {} contour(s) to {}", contours.len(), output_path.display());
    Ok(())
}

/// File name of the `index`-th split piece (1-based)
pub fn piece_file_name(name: &str, index: usize) -> String {
    format!("{}_contour_{}.dxf", name, index)
}

/// Write the layout to `out_dir` as one combined file or one file per piece.
/// Split pieces are written in parallel; the returned artifacts are in piece order.
pub fn export(layout: &Layout, out_dir: &Path, name: &str, mode: OutputMode) -> Result<Vec<DxfArtifact>> {
    if name.trim().is_empty() {
        return Err(PipelineError::EmptyProjectName);
    }
    fs::create_dir_all(out_dir).map_err(|e| PipelineError::io(out_dir, e))?;

    let mut artifacts = match mode {
        OutputMode::Combined => {
            let path = out_dir.join(format!("{}.dxf", name));
            write_dxf(&layout.contours, &path)?;
            vec![DxfArtifact { index: 0, path }]
        }
        OutputMode::Split => layout
            .pieces
            .par_iter()
            .enumerate()
            .map(|(i, piece)| -> Result<DxfArtifact> {
                let index = i + 1;
                let path = out_dir.join(piece_file_name(name, index));
                write_dxf(std::slice::from_ref(piece), &path)?;
                Ok(DxfArtifact { index, path })
            })
            .collect::<Result<Vec<_>>>()?,
    };

    artifacts.sort_by_key(|a| a.index);

    info!(
        mode = %mode,
        files = artifacts.len(),
        grid = %layout.grid,
        "exported DXF to {}",
        out_dir.display()
    );

    Ok(artifacts)
}
