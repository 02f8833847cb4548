use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use shadowmaker_common::{LengthUnit, OutputMode};
use tracing_subscriber::EnvFilter;

mod calibrate;
mod calibration;
mod chessboard;
mod config;
mod debug;
mod detection;
mod error;
mod export_dxf;
mod growth;
mod layout;
mod lm;
mod openscad;
mod outline;
mod pipeline;
mod positions;
mod scad;
mod segmentation;
mod tray;

use calibrate::Board;
use calibration::CameraCalibration;
use chessboard::BoardSize;
use config::{TraceSettings, DEFAULT_SETTINGS_FILE};
use pipeline::RunRequest;
use tray::TrayOptions;

/// Trace marker outlines around a reference token into DXF files and Gridfinity tray scripts
#[derive(Parser, Debug)]
#[command(name = "shadowmaker")]
#[command(about = "Turn a photo of traced tools into Gridfinity shadow-board inserts", long_about = None)]
struct Cli {
    /// Log debug output from every stage
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Trace a photo, write DXF files and a tray script
    Process(ProcessArgs),
    /// Remove lens distortion from a raw photo
    Undistort(UndistortArgs),
    /// Measure lens distortion from photos of a printed chessboard
    Calibrate(CalibrateArgs),
    /// Show or save the default trace settings
    Defaults(DefaultsArgs),
}

/// Trace settings; anything not given comes from the defaults file
#[derive(Args, Debug, Default)]
struct SettingsArgs {
    /// Gray level separating paper from ink (clamped to 0-255)
    #[arg(long, allow_negative_numbers = true)]
    threshold: Option<f64>,

    /// Pen offset to grow outlines by, in --units
    #[arg(long, allow_negative_numbers = true)]
    offset: Option<f64>,

    /// Reference token diameter, in --units
    #[arg(long, allow_negative_numbers = true)]
    token: Option<f64>,

    /// Simplification divisor (higher keeps more detail)
    #[arg(long, allow_negative_numbers = true)]
    resolution: Option<f64>,

    /// Unit of --offset and --token
    #[arg(long, value_enum)]
    units: Option<UnitsArg>,

    /// Drop outlines smaller than this many square pixels
    #[arg(long, allow_negative_numbers = true)]
    min_area: Option<f64>,

    /// Write one DXF per outline
    #[arg(long, conflicts_with = "combined")]
    split: bool,

    /// Write all outlines to one DXF
    #[arg(long)]
    combined: bool,

    /// Defaults file to start from
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    defaults: PathBuf,
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// Input photo
    input: PathBuf,

    /// Project name used for output files (defaults to the photo's file name)
    #[arg(short, long)]
    name: Option<String>,

    /// Output directory
    #[arg(short, long, default_value = "Design Files")]
    out_dir: PathBuf,

    #[command(flatten)]
    settings: SettingsArgs,

    /// Save the effective settings back to the defaults file
    #[arg(long)]
    save_defaults: bool,

    /// Tray template to fill in instead of the built-in one
    #[arg(long)]
    template: Option<PathBuf>,

    /// Bin height in Gridfinity units
    #[arg(long, default_value = "6")]
    height_units: u32,

    /// Pocket depth in mm
    #[arg(long, default_value = "10")]
    cut_depth: f64,

    /// gridfinity-rebuilt-openscad checkout, relative to the output directory;
    /// the script includes `<library-dir>/src/core/*.scad`
    #[arg(long, default_value = tray::DEFAULT_LIBRARY_DIR)]
    library_dir: String,

    /// Camera calibration JSON; the photo is undistorted before tracing
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Open the tray script in OpenSCAD when done
    #[arg(long)]
    launch: bool,

    /// OpenSCAD executable (otherwise $OPENSCAD, common install paths, PATH)
    #[arg(long)]
    openscad: Option<PathBuf>,

    /// Save mask and overlay images
    #[arg(short, long)]
    debug: bool,
}

#[derive(Args, Debug)]
struct UndistortArgs {
    /// Raw photo
    input: PathBuf,

    /// Camera calibration JSON
    #[arg(short, long)]
    calibration: PathBuf,

    /// Output image (defaults to `<input>_undistorted.png`)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CalibrateArgs {
    /// Photos of the chessboard from different angles
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Inner corners per row and per column
    #[arg(long, default_value = "9x6")]
    board: BoardSize,

    /// Edge length of one square, in mm
    #[arg(long, default_value = "25")]
    square: f64,

    /// Calibration file to write
    #[arg(short, long, default_value = "camera_calibration.json")]
    output: PathBuf,

    /// Save each photo with its detected corners into this directory
    #[arg(short, long)]
    debug: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DefaultsArgs {
    #[command(flatten)]
    settings: SettingsArgs,

    /// Write the settings to the defaults file instead of printing them
    #[arg(long)]
    save: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum UnitsArg {
    Inches,
    Mm,
}

impl From<UnitsArg> for LengthUnit {
    fn from(arg: UnitsArg) -> Self {
        match arg {
            UnitsArg::Inches => LengthUnit::Inches,
            UnitsArg::Mm => LengthUnit::Millimeters,
        }
    }
}

impl SettingsArgs {
    /// Defaults file first, then command-line overrides through the same validation.
    fn resolve(&self) -> Result<TraceSettings> {
        let mut settings = TraceSettings::load(&self.defaults)
            .with_context(|| format!("reading defaults from {}", self.defaults.display()))?;

        if let Some(v) = self.threshold {
            settings.apply("threshold", &v.to_string());
        }
        if let Some(v) = self.offset {
            settings.apply("offset", &v.to_string());
        }
        if let Some(v) = self.token {
            settings.apply("token", &v.to_string());
        }
        if let Some(v) = self.resolution {
            settings.apply("resolution", &v.to_string());
        }
        if let Some(v) = self.min_area {
            settings.apply("min_area", &v.to_string());
        }
        if let Some(units) = self.units {
            settings.units = units.into();
        }
        if self.split {
            settings.output_mode = OutputMode::Split;
        } else if self.combined {
            settings.output_mode = OutputMode::Combined;
        }

        Ok(settings)
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "shadowmaker=debug" } else { "shadowmaker=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn print_settings(settings: &TraceSettings) {
    println!("Threshold: {}", settings.threshold);
    println!("Offset: {} {}", settings.offset, settings.units);
    println!("Token: {} {} ({:.2} mm)", settings.token, settings.units, settings.token_mm());
    println!("Resolution: {}", settings.resolution);
    println!("Min area: {} px²", settings.min_area);
    println!("Output: {}", settings.output_mode);
}

fn project_name(args: &ProcessArgs) -> String {
    args.name.clone().unwrap_or_else(|| {
        args.input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    })
}

fn process(args: ProcessArgs) -> Result<()> {
    let settings = args.settings.resolve()?;
    let name = project_name(&args);

    println!("Shadowmaker - Gridfinity Shadow Boards");
    println!("======================================");
    println!("Input: {}", args.input.display());
    println!("Project: {}", name);
    println!("Output directory: {}", args.out_dir.display());
    print_settings(&settings);
    println!();

    if args.save_defaults {
        settings
            .save(&args.settings.defaults)
            .context("saving defaults")?;
    }

    let calibration = args
        .calibration
        .as_deref()
        .map(CameraCalibration::load)
        .transpose()
        .context("loading camera calibration")?;

    let request = RunRequest {
        input: args.input.clone(),
        name,
        out_dir: args.out_dir.clone(),
        settings,
        template: args.template.clone(),
        tray: TrayOptions {
            height_units: args.height_units,
            cut_depth: args.cut_depth,
            library_dir: args.library_dir.clone(),
            ..TrayOptions::default()
        },
        calibration,
        debug: args.debug,
    };

    let outcome = pipeline::run(&request).with_context(|| format!("processing {}", args.input.display()))?;

    let traced = &outcome.traced;
    println!(
        "Reference token: {:.1} px across (circularity {:.3}), {:.4} mm/px",
        traced.reference.diameter_px(),
        traced.reference.score,
        traced.scale.mm_per_px()
    );
    println!(
        "Growth kernel: {} px, simplification tolerance {:.2} px",
        traced.growth.kernel_size, traced.growth.epsilon
    );
    println!("Contours kept: {}", traced.outlines.len());
    println!("Grid size: {}", outcome.grid());
    for artifact in &outcome.artifacts {
        println!("  - {}", artifact.path.display());
    }
    for image in &outcome.debug_images {
        println!("  - {}", image.display());
    }
    println!("Placement offsets: {}", outcome.positions.display());
    println!("Tray script: {}", outcome.script.display());

    if args.launch {
        // The outputs stay on disk whatever happens here.
        let launched = openscad::find_openscad(args.openscad.as_deref())
            .and_then(|exe| openscad::launch(&exe, &outcome.script));
        if let Err(e) = launched {
            tracing::error!("could not open OpenSCAD: {}", e);
            println!("\nOpen {} manually.", outcome.script.display());
        }
    }

    Ok(())
}

fn default_undistorted_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    input.with_file_name(format!("{}_undistorted.png", stem))
}

fn undistort(args: UndistortArgs) -> Result<()> {
    let calibration = CameraCalibration::load(&args.calibration).context("loading camera calibration")?;
    let photo = image::open(&args.input)
        .with_context(|| format!("opening {}", args.input.display()))?
        .to_rgb8();

    let corrected = calibration::undistort(&photo, &calibration)?;
    let output = args.output.unwrap_or_else(|| default_undistorted_path(&args.input));
    corrected
        .save(&output)
        .with_context(|| format!("saving {}", output.display()))?;

    println!("Saved undistorted image to: {}", output.display());
    Ok(())
}

fn calibrate_camera(args: CalibrateArgs) -> Result<()> {
    if !(args.square.is_finite() && args.square > 0.0) {
        anyhow::bail!("--square must be a positive length, got {}", args.square);
    }
    let board = Board {
        size: args.board,
        square: args.square,
    };

    println!("Camera calibration");
    println!("==================");
    println!("Board: {} inner corners, {} mm squares", board.size, board.square);
    println!("Photos: {}", args.images.len());
    println!();

    let (views, report) = calibrate::calibrate_images(&args.images, &board, args.debug.as_deref())
        .context("calibrating camera")?;

    for view in &views {
        let status = if view.corners.is_some() { "found" } else { "not found" };
        println!("  {} - {}", view.path.display(), status);
    }

    let m = &report.calibration.camera_matrix;
    println!("\nCamera matrix:");
    for row in m {
        println!("  [{:10.3} {:10.3} {:10.3}]", row[0], row[1], row[2]);
    }
    println!("Distortion coefficients: {:?}", report.calibration.distortion_coefficients);
    println!("RMS reprojection error: {:.4} px", report.rms_error);
    for (view, error) in views.iter().filter(|v| v.corners.is_some()).zip(&report.view_errors) {
        println!("  {}: {:.4} px", view.path.display(), error);
    }

    report
        .calibration
        .save(&args.output)
        .with_context(|| format!("saving {}", args.output.display()))?;
    println!("\nSaved calibration to: {}", args.output.display());
    Ok(())
}

fn defaults(args: DefaultsArgs) -> Result<()> {
    let settings = args.settings.resolve()?;

    if args.save {
        settings.save(&args.settings.defaults).context("saving defaults")?;
        println!("Saved defaults to: {}", args.settings.defaults.display());
    } else {
        print!("{}", settings.to_file_contents());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Process(args) => process(args),
        Command::Undistort(args) => undistort(args),
        Command::Calibrate(args) => calibrate_camera(args),
        Command::Defaults(args) => defaults(args),
    }
}
