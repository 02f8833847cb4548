// Gridfinity tray parameters
// Turns the exported DXF files and the grid size into substitutions for the tray template

use std::fs;
use std::path::{Path, PathBuf};

use shadowmaker_common::{GridSize, OutputMode, PlacementOffset};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::export_dxf::DxfArtifact;
use crate::scad::{ScadParams, ScadTemplate, ScadValue};

/// Tray template shipped with the binary
pub const DEFAULT_TEMPLATE: &str = include_str!("../templates/gridfinity_tray.scad");

pub const SECTION_MARKER: &str = "/* [Section Adjustments] */";

/// Output directories normally live inside the gridfinity-rebuilt-openscad checkout
pub const DEFAULT_LIBRARY_DIR: &str = "..";

/// Cut depths are declared in groups of this size and joined with `concat`
const CUT_DEPTH_CHUNK: usize = 4;

/// Depth-related defaults of the generated tray
#[derive(Debug, Clone, PartialEq)]
pub struct TrayOptions {
    /// Bin height in Gridfinity height units
    pub height_units: u32,
    /// Pocket depth for every cutout, in mm
    pub cut_depth: f64,
    /// Stepped depths of a section cut, in mm
    pub section_cut_depth: [f64; 3],
    /// Width, x and y of a section cut, in mm
    pub section_parameters: [f64; 3],
    pub use_section_cut: bool,
    /// gridfinity-rebuilt-openscad checkout, as seen from the output directory
    pub library_dir: String,
}

impl Default for TrayOptions {
    fn default() -> Self {
        Self {
            height_units: 6,
            cut_depth: 10.0,
            section_cut_depth: [20.0, 15.0, 10.0],
            section_parameters: [40.0, 0.0, 0.0],
            use_section_cut: false,
            library_dir: DEFAULT_LIBRARY_DIR.to_string(),
        }
    }
}

/// Finger slot runs along the longer side: rotated when the tray is taller than wide
pub fn slot_rotation(grid: GridSize) -> i64 {
    if grid.x > grid.y {
        0
    } else {
        90
    }
}

/// Wider finger slot for trays at least three cells in both directions
pub fn slot_width(grid: GridSize) -> i64 {
    if grid.x.min(grid.y) > 2 {
        80
    } else {
        40
    }
}

/// Path as written into the script: relative to the script directory when possible,
/// always with forward slashes.
fn script_path(path: &Path, script_dir: &Path) -> String {
    let relative = path.strip_prefix(script_dir).unwrap_or(path);
    relative.to_string_lossy().replace('\\', "/")
}

fn numbered(prefix: &str, count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("{}_{}", prefix, i)).collect()
}

/// Build the template substitutions for one tray.
/// `artifacts` may arrive in any order; pieces are listed by index.
pub fn tray_params(
    artifacts: &[DxfArtifact],
    grid: GridSize,
    offsets: &[PlacementOffset],
    mode: OutputMode,
    script_dir: &Path,
    options: &TrayOptions,
) -> ScadParams {
    let mut sorted: Vec<&DxfArtifact> = artifacts.iter().collect();
    sorted.sort_by_key(|a| a.index);

    let mut params = ScadParams::new();
    params
        .library_dir(options.library_dir.clone())
        .assign(
            "size",
            ScadValue::List(vec![
                ScadValue::Int(grid.x as i64),
                ScadValue::Int(grid.y as i64),
                ScadValue::Int(options.height_units as i64),
            ]),
        )
        .assign("slot_rotation", ScadValue::Int(slot_rotation(grid)))
        .assign("slot_width", ScadValue::Int(slot_width(grid)))
        .assign("cut_depth", ScadValue::Number(options.cut_depth))
        .assign("multiple_dxf", ScadValue::Bool(mode.is_split()));

    match mode {
        OutputMode::Combined => {
            let path = sorted.first().map(|a| script_path(&a.path, script_dir)).unwrap_or_default();
            params
                .assign("dxf_file_path", ScadValue::Str(path))
                .assign("position", ScadValue::List(vec![ScadValue::numbers([0.0, 0.0, 0.0])]));
        }
        OutputMode::Split => {
            let count = sorted.len();

            let mut files = vec![(
                "dxf_file_paths".to_string(),
                ScadValue::List(
                    sorted
                        .iter()
                        .map(|a| ScadValue::Str(script_path(&a.path, script_dir)))
                        .collect(),
                ),
            )];
            files.extend(cut_depth_lines(count, options.cut_depth));
            params.expand("dxf_file_path", files);

            let position_names = numbered("position", count);
            let mut positions: Vec<(String, ScadValue)> = position_names
                .iter()
                .zip(offsets.iter().copied().chain(std::iter::repeat(PlacementOffset::default())))
                .map(|(name, offset)| (name.clone(), ScadValue::numbers([offset.x, offset.y, 0.0])))
                .collect();
            positions.push(("position".to_string(), ScadValue::idents(position_names)));
            params.expand("position", positions);

            let cut_names = numbered("section_cut_depth", count);
            let parameter_names = numbered("section_parameters", count);
            let mut section = vec![("use_section_cut".to_string(), ScadValue::Bool(options.use_section_cut))];
            for (cut, parameters) in cut_names.iter().zip(&parameter_names) {
                section.push((cut.clone(), ScadValue::numbers(options.section_cut_depth)));
                section.push((parameters.clone(), ScadValue::numbers(options.section_parameters)));
            }
            section.push(("section_cut_depth".to_string(), ScadValue::idents(cut_names)));
            section.push(("section_parameters".to_string(), ScadValue::idents(parameter_names)));
            params.insert_after(SECTION_MARKER, section);
        }
    }

    params
}

/// `dxf_cut_depths`, split in chunks and concatenated when there are many pieces
fn cut_depth_lines(count: usize, depth: f64) -> Vec<(String, ScadValue)> {
    let depths = vec![depth; count];
    let chunks: Vec<&[f64]> = depths.chunks(CUT_DEPTH_CHUNK).collect();

    if chunks.len() <= 1 {
        return vec![("dxf_cut_depths".to_string(), ScadValue::numbers(depths))];
    }

    let names = numbered("dxf_cut_depths", chunks.len());
    let mut lines: Vec<(String, ScadValue)> = names
        .iter()
        .zip(&chunks)
        .map(|(name, chunk)| (name.clone(), ScadValue::numbers(chunk.iter().copied())))
        .collect();
    lines.push((
        "dxf_cut_depths".to_string(),
        ScadValue::Call("concat".to_string(), names.into_iter().map(ScadValue::Ident).collect()),
    ));
    lines
}

/// Render the template and write `<name>.scad` into `out_dir`.
pub fn write_tray_script(
    template: &ScadTemplate,
    params: &ScadParams,
    out_dir: &Path,
    name: &str,
) -> Result<PathBuf> {
    if name.trim().is_empty() {
        return Err(PipelineError::EmptyProjectName);
    }

    let script = template.render(params)?;
    fs::create_dir_all(out_dir).map_err(|e| PipelineError::io(out_dir, e))?;
    let path = out_dir.join(format!("{}.scad", name));
    fs::write(&path, script).map_err(|e| PipelineError::io(&path, e))?;

    info!("wrote tray script {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(dir: &Path, index: usize) -> DxfArtifact {
        DxfArtifact {
            index,
            path: dir.join(format!("tray_contour_{}.dxf", index)),
        }
    }

    #[test]
    fn test_slot_heuristics() {
        assert_eq!(slot_rotation(GridSize { x: 4, y: 2 }), 0);
        assert_eq!(slot_rotation(GridSize { x: 2, y: 2 }), 90);
        assert_eq!(slot_rotation(GridSize { x: 1, y: 3 }), 90);
        assert_eq!(slot_width(GridSize { x: 3, y: 3 }), 80);
        assert_eq!(slot_width(GridSize { x: 5, y: 2 }), 40);
    }

    #[test]
    fn test_combined_render() {
        let dir = Path::new("/work/out");
        let artifacts = vec![DxfArtifact {
            index: 0,
            path: dir.join("tray.dxf"),
        }];
        let params = tray_params(
            &artifacts,
            GridSize { x: 4, y: 3 },
            &[],
            OutputMode::Combined,
            dir,
            &TrayOptions::default(),
        );
        let out = ScadTemplate::new(DEFAULT_TEMPLATE).render(&params).unwrap();

        assert!(out.contains("size = [4, 3, 6];"));
        assert!(out.contains("slot_rotation = 0;"));
        assert!(out.contains("slot_width = 80;"));
        assert!(out.contains("cut_depth = 10;"));
        assert!(out.contains("multiple_dxf = false;"));
        assert!(out.contains("dxf_file_path = \"tray.dxf\";"));
        assert!(out.contains("position = [[0, 0, 0]];"));
        assert!(!out.contains("use_section_cut = false;"));
        assert!(out.contains("include <../src/core/standard.scad>\n"));
        assert!(out.contains("use <../src/core/gridfinity-rebuilt-utility.scad>\n"));
    }

    #[test]
    fn test_library_dir_is_configurable() {
        let dir = Path::new("/work/out");
        let options = TrayOptions {
            library_dir: "/opt/gridfinity-rebuilt-openscad/".to_string(),
            ..TrayOptions::default()
        };
        let params = tray_params(&[artifact(dir, 0)], GridSize { x: 1, y: 1 }, &[], OutputMode::Combined, dir, &options);
        let out = ScadTemplate::new(DEFAULT_TEMPLATE).render(&params).unwrap();

        assert!(out.contains("include </opt/gridfinity-rebuilt-openscad/src/core/standard.scad>\n"));
        assert!(out.contains("use </opt/gridfinity-rebuilt-openscad/src/core/gridfinity-rebuilt-holes.scad>\n"));
    }

    #[test]
    fn test_split_render_orders_pieces_by_index() {
        let dir = Path::new("/work/out");
        let artifacts = vec![artifact(dir, 2), artifact(dir, 1), artifact(dir, 3)];
        let offsets = vec![
            PlacementOffset { x: -10.5, y: 2.0 },
            PlacementOffset { x: 0.0, y: 0.0 },
            PlacementOffset { x: 7.25, y: -3.0 },
        ];
        let params = tray_params(
            &artifacts,
            GridSize { x: 1, y: 2 },
            &offsets,
            OutputMode::Split,
            dir,
            &TrayOptions::default(),
        );
        let out = ScadTemplate::new(DEFAULT_TEMPLATE).render(&params).unwrap();

        assert!(out.contains(
            "dxf_file_paths = [\"tray_contour_1.dxf\", \"tray_contour_2.dxf\", \"tray_contour_3.dxf\"];"
        ));
        assert!(out.contains("dxf_cut_depths = [10, 10, 10];"));
        assert!(out.contains("position_1 = [-10.5, 2, 0];"));
        assert!(out.contains("position_3 = [7.25, -3, 0];"));
        assert!(out.contains("position = [position_1, position_2, position_3];"));
        assert!(out.contains("multiple_dxf = true;"));
        assert!(out.contains("slot_rotation = 90;"));
        assert!(out.contains(
            "/* [Section Adjustments] */\nuse_section_cut = false;\nsection_cut_depth_1 = [20, 15, 10];\nsection_parameters_1 = [40, 0, 0];"
        ));
        assert!(out.contains("section_cut_depth = [section_cut_depth_1, section_cut_depth_2, section_cut_depth_3];"));
    }

    #[test]
    fn test_many_pieces_chunk_cut_depths() {
        let lines = cut_depth_lines(6, 10.0);
        let rendered: Vec<String> = lines.iter().map(|(n, v)| format!("{} = {};", n, v)).collect();
        assert_eq!(
            rendered,
            vec![
                "dxf_cut_depths_1 = [10, 10, 10, 10];",
                "dxf_cut_depths_2 = [10, 10];",
                "dxf_cut_depths = concat(dxf_cut_depths_1, dxf_cut_depths_2);",
            ]
        );
    }

    #[test]
    fn test_short_offsets_are_padded_with_zeros() {
        let dir = Path::new("/work/out");
        let params = tray_params(
            &[artifact(dir, 1), artifact(dir, 2)],
            GridSize { x: 2, y: 1 },
            &[PlacementOffset { x: 1.0, y: 1.0 }],
            OutputMode::Split,
            dir,
            &TrayOptions::default(),
        );
        let out = ScadTemplate::new(DEFAULT_TEMPLATE).render(&params).unwrap();
        assert!(out.contains("position_2 = [0, 0, 0];"));
    }

    #[test]
    fn test_paths_outside_script_dir_stay_absolute() {
        assert_eq!(script_path(Path::new("/a/b/c.dxf"), Path::new("/a/b")), "c.dxf");
        assert_eq!(script_path(Path::new("/x/c.dxf"), Path::new("/a/b")), "/x/c.dxf");
    }

    #[test]
    fn test_write_tray_script() {
        let dir = tempfile::tempdir().unwrap();
        let params = tray_params(
            &[DxfArtifact {
                index: 0,
                path: dir.path().join("demo.dxf"),
            }],
            GridSize { x: 2, y: 2 },
            &[],
            OutputMode::Combined,
            dir.path(),
            &TrayOptions::default(),
        );
        let path = write_tray_script(&ScadTemplate::new(DEFAULT_TEMPLATE), &params, dir.path(), "demo").unwrap();
        assert_eq!(path, dir.path().join("demo.scad"));
        assert!(fs::read_to_string(path).unwrap().contains("dxf_file_path = \"demo.dxf\";"));
    }
}
