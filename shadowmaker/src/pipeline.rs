// Pipeline orchestration
// Photo in, DXF files and a tray script out

use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage};
use shadowmaker_common::{GridSize, OutputMode};
use tracing::{debug, info, warn};

use crate::calibration::{undistort, CameraCalibration};
use crate::config::TraceSettings;
use crate::debug::save_debug_images;
use crate::detection::{find_reference, ReferenceShape};
use crate::error::{PipelineError, Result};
use crate::export_dxf::{export, DxfArtifact};
use crate::growth::{grow, GrowthParams};
use crate::layout::{filter_small, Layout, ScaleFactor};
use crate::outline::Outline;
use crate::positions::{load_positions, positions_path, save_positions};
use crate::scad::ScadTemplate;
use crate::segmentation::{extract_outlines, segment};
use crate::tray::{tray_params, write_tray_script, TrayOptions, DEFAULT_TEMPLATE};

/// Everything one `process` run needs
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub input: PathBuf,
    pub name: String,
    pub out_dir: PathBuf,
    pub settings: TraceSettings,
    /// Tray template file; the built-in template when `None`
    pub template: Option<PathBuf>,
    pub tray: TrayOptions,
    /// Undistort the photo before tracing
    pub calibration: Option<CameraCalibration>,
    /// Save mask and overlay images next to the outputs
    pub debug: bool,
}

/// In-memory result of tracing one photo
#[derive(Debug, Clone)]
pub struct Traced {
    /// The token on the undilated mask; it fixes the scale
    pub reference: ReferenceShape,
    pub scale: ScaleFactor,
    pub growth: GrowthParams,
    /// Mask after growing by the pen offset
    pub grown_mask: GrayImage,
    /// The token as traced on the grown mask, if it was found again
    pub grown_reference: Option<Outline>,
    /// Outlines that made it into the layout, in pixels
    pub outlines: Vec<Outline>,
    pub layout: Layout,
}

/// What a finished run wrote
#[derive(Debug, Clone)]
pub struct TraceOutcome {
    pub traced: Traced,
    pub artifacts: Vec<DxfArtifact>,
    pub positions: PathBuf,
    pub script: PathBuf,
    pub debug_images: Vec<PathBuf>,
}

impl TraceOutcome {
    pub fn grid(&self) -> GridSize {
        self.traced.layout.grid
    }
}

/// Segment, find the token, grow the outlines and lay them out in millimeters.
pub fn trace(image: &DynamicImage, settings: &TraceSettings) -> Result<Traced> {
    let mask = segment(image, settings.threshold)?;
    let outlines = extract_outlines(&mask);
    info!("found {} outline(s) in the mask", outlines.len());

    let reference = find_reference(&outlines).ok_or(PipelineError::NoReferenceShape)?;
    let diameter = reference.diameter_px();
    let scale = ScaleFactor::from_reference(settings.token_mm(), diameter).ok_or(PipelineError::NoReferenceShape)?;
    info!(
        index = reference.index,
        score = reference.score,
        diameter_px = diameter,
        mm_per_px = scale.mm_per_px(),
        "reference token found"
    );

    let grown = grow(&mask, diameter, settings);
    if let Some(token) = grown.reference {
        debug!(score = token.score, diameter_px = token.diameter_px(), "token after growth");
    }
    let outlines = filter_small(grown.outlines, settings.min_area)?;
    let layout = Layout::new(&outlines, scale)?;

    Ok(Traced {
        reference,
        scale,
        growth: grown.params,
        grown_mask: grown.dilated,
        grown_reference: grown.reference_outline,
        outlines,
        layout,
    })
}

/// Build the tray script for already exported DXF files.
/// In split mode the placement offsets are read back from the side channel in `out_dir`.
pub fn generate_tray(
    artifacts: &[DxfArtifact],
    grid: GridSize,
    mode: OutputMode,
    out_dir: &Path,
    name: &str,
    template: &ScadTemplate,
    options: &TrayOptions,
) -> Result<PathBuf> {
    let offsets = if mode.is_split() {
        load_positions(&positions_path(out_dir), artifacts.len())
    } else {
        Vec::new()
    };

    let params = tray_params(artifacts, grid, &offsets, mode, out_dir, options);
    write_tray_script(template, &params, out_dir, name)
}

fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| PipelineError::ImageLoad {
        path: path.to_path_buf(),
        source,
    })
}

/// Run the whole pipeline for one photo.
pub fn run(request: &RunRequest) -> Result<TraceOutcome> {
    if request.name.trim().is_empty() {
        return Err(PipelineError::EmptyProjectName);
    }

    let mut image = load_image(&request.input)?;
    info!(
        width = image.width(),
        height = image.height(),
        "loaded {}",
        request.input.display()
    );

    if let Some(calibration) = &request.calibration {
        image = DynamicImage::ImageRgb8(undistort(&image.to_rgb8(), calibration)?);
    }

    let traced = trace(&image, &request.settings)?;
    let mode = request.settings.output_mode;

    let artifacts = export(&traced.layout, &request.out_dir, &request.name, mode)?;
    let positions = positions_path(&request.out_dir);
    save_positions(&positions, &traced.layout.offsets)?;

    let mut debug_images = Vec::new();
    if request.debug {
        match save_debug_images(
            &request.out_dir,
            &request.name,
            &traced.grown_mask,
            &image.to_rgb8(),
            &traced.outlines,
            Some(&traced.reference),
            traced.grown_reference.as_ref(),
        ) {
            Ok(paths) => debug_images = paths,
            Err(e) => warn!("debug images not saved: {}", e),
        }
    }

    let template = match &request.template {
        Some(path) => ScadTemplate::load(path)?,
        None => ScadTemplate::new(DEFAULT_TEMPLATE),
    };
    let script = generate_tray(
        &artifacts,
        traced.layout.grid,
        mode,
        &request.out_dir,
        &request.name,
        &template,
        &request.tray,
    )?;

    Ok(TraceOutcome {
        traced,
        artifacts,
        positions,
        script,
        debug_images,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{Rgb, RgbImage};
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
    use imageproc::rect::Rect;
    use std::fs;

    const INK: Rgb<u8> = Rgb([20, 20, 20]);

    /// White paper with an 80 px token and two marked tools
    fn photo() -> RgbImage {
        let mut img = RgbImage::from_pixel(400, 300, Rgb([235, 235, 235]));
        draw_filled_circle_mut(&mut img, (80, 150), 40, INK);
        draw_filled_rect_mut(&mut img, Rect::at(200, 40).of_size(120, 60), INK);
        draw_filled_rect_mut(&mut img, Rect::at(220, 180).of_size(100, 40), INK);
        img
    }

    fn request(dir: &Path, mode: OutputMode) -> RunRequest {
        let input = dir.join("photo.png");
        photo().save(&input).unwrap();
        RunRequest {
            input,
            name: "tools".to_string(),
            out_dir: dir.join("out"),
            settings: TraceSettings {
                output_mode: mode,
                ..TraceSettings::default()
            },
            template: None,
            tray: TrayOptions::default(),
            calibration: None,
            debug: false,
        }
    }

    #[test]
    fn test_trace_excludes_token_and_scales_by_it() {
        let traced = trace(&DynamicImage::ImageRgb8(photo()), &TraceSettings::default()).unwrap();

        assert!((traced.reference.diameter_px() - 80.0).abs() < 3.0);
        assert_relative_eq!(
            traced.scale.to_mm(traced.reference.diameter_px()),
            50.8,
            max_relative = 1e-9
        );
        assert_eq!(traced.outlines.len(), 2);
        // kernel = ceil(diameter / (2.0 / 0.1) * 2)
        assert_eq!(traced.growth.kernel_size, (traced.reference.diameter_px() / 10.0).ceil() as u32);

        // Token sits at columns 40..120; nothing retained should reach there.
        let bounds = traced.layout.bounds;
        assert!(bounds.min_x > 150);
    }

    #[test]
    fn test_blank_photo_has_no_reference() {
        let blank = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 100, Rgb([255, 255, 255])));
        assert!(matches!(
            trace(&blank, &TraceSettings::default()),
            Err(PipelineError::NoReferenceShape)
        ));
    }

    #[test]
    fn test_token_only_leaves_nothing() {
        let mut img = RgbImage::from_pixel(200, 200, Rgb([255, 255, 255]));
        draw_filled_circle_mut(&mut img, (100, 100), 40, INK);
        assert!(matches!(
            trace(&DynamicImage::ImageRgb8(img), &TraceSettings::default()),
            Err(PipelineError::NoContoursAfterFilter { .. })
        ));
    }

    #[test]
    fn test_run_combined() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&request(dir.path(), OutputMode::Combined)).unwrap();

        assert_eq!(outcome.artifacts.len(), 1);
        assert!(outcome.artifacts[0].path.ends_with("tools.dxf"));
        assert!(outcome.positions.exists());

        let script = fs::read_to_string(&outcome.script).unwrap();
        let grid = outcome.grid();
        assert!(script.contains(&format!("size = [{}, {}, 6];", grid.x, grid.y)));
        assert!(script.contains("dxf_file_path = \"tools.dxf\";"));
        assert!(script.contains("multiple_dxf = false;"));
    }

    #[test]
    fn test_run_split_reads_offsets_back() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run(&request(dir.path(), OutputMode::Split)).unwrap();

        assert_eq!(outcome.artifacts.len(), 2);
        let script = fs::read_to_string(&outcome.script).unwrap();
        assert!(script.contains("dxf_file_paths = [\"tools_contour_1.dxf\", \"tools_contour_2.dxf\"];"));
        assert!(script.contains("position = [position_1, position_2];"));

        let offset = outcome.traced.layout.offsets[0];
        assert!(script.contains(&format!("position_1 = [{}, {}, 0];", offset.x, offset.y)));
    }

    #[test]
    fn test_run_with_debug_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), OutputMode::Combined);
        req.debug = true;
        let outcome = run(&req).unwrap();
        assert_eq!(outcome.debug_images.len(), 2);
        assert!(outcome.debug_images.iter().all(|p| p.exists()));
    }

    #[test]
    fn test_missing_photo_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), OutputMode::Combined);
        req.input = dir.path().join("missing.png");
        assert!(matches!(run(&req), Err(PipelineError::ImageLoad { .. })));
    }
}
