// Trace settings and the `key=value` defaults file

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use shadowmaker_common::{LengthUnit, OutputMode};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

/// File the defaults are read from when no other path is given
pub const DEFAULT_SETTINGS_FILE: &str = "default_settings.txt";

/// All knobs of one pipeline run.
/// Threaded explicitly through every stage; nothing is kept in globals.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSettings {
    /// Gray level separating paper (brighter) from marker ink (darker), 0-255.
    pub threshold: u8,
    /// Pen offset to grow the traced outline by, in `units`.
    pub offset: f64,
    /// Diameter of the reference token, in `units`.
    pub token: f64,
    /// Simplification divisor; epsilon = dilation kernel size / resolution.
    pub resolution: f64,
    /// Unit of `offset` and `token`.
    pub units: LengthUnit,
    /// Outlines with a smaller pixel area are dropped as noise.
    pub min_area: f64,
    /// One DXF per contour instead of a single combined file.
    pub output_mode: OutputMode,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            threshold: 110,
            offset: 0.1,
            token: 2.0,
            resolution: 10.0,
            units: LengthUnit::Inches,
            min_area: 1000.0,
            output_mode: OutputMode::Combined,
        }
    }
}

impl TraceSettings {
    /// Token diameter converted to millimeters
    pub fn token_mm(&self) -> f64 {
        self.units.to_mm(self.token)
    }

    /// Load settings from a `key=value` file.
    /// A missing file yields the built-in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no defaults file, using built-in settings");
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        info!(path = %path.display(), "loaded defaults");
        Ok(Self::parse(&text))
    }

    /// Parse `key=value` lines. Blank lines and `#` comments are skipped,
    /// unparsable values fall back to the default and out-of-range values are clamped.
    pub fn parse(text: &str) -> Self {
        let mut settings = Self::default();

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!(line = line_no + 1, "ignoring settings line without '='");
                continue;
            };

            settings.apply(key.trim(), value.trim());
        }

        settings
    }

    /// Set one field from its textual form, the way the form fields are validated.
    pub fn apply(&mut self, key: &str, value: &str) {
        let defaults = Self::default();

        match key {
            "threshold" => {
                let threshold = validate_input(value, defaults.threshold as f64, Some(0.0), Some(255.0));
                self.threshold = threshold.round() as u8;
            }
            "offset" => self.offset = validate_positive(value, defaults.offset),
            "token" => self.token = validate_positive(value, defaults.token),
            "resolution" => self.resolution = validate_positive(value, defaults.resolution),
            "min_area" => self.min_area = validate_input(value, defaults.min_area, Some(0.0), None),
            "units" => {
                self.units = value.parse().unwrap_or_else(|e: String| {
                    warn!("{}, keeping {}", e, defaults.units);
                    defaults.units
                });
            }
            "split" => {
                self.output_mode = match value.to_ascii_lowercase().as_str() {
                    "true" | "yes" | "1" => OutputMode::Split,
                    "false" | "no" | "0" => OutputMode::Combined,
                    other => {
                        warn!("invalid split value '{}', using combined output", other);
                        OutputMode::Combined
                    }
                };
            }
            other => warn!("ignoring unknown setting '{}'", other),
        }
    }

    /// Serialize to the `key=value` format read by [`TraceSettings::parse`].
    pub fn to_file_contents(&self) -> String {
        let mut out = String::from("# shadowmaker defaults\n");
        // Writing to a String cannot fail.
        let _ = writeln!(out, "threshold={}", self.threshold);
        let _ = writeln!(out, "offset={}", self.offset);
        let _ = writeln!(out, "token={}", self.token);
        let _ = writeln!(out, "resolution={}", self.resolution);
        let _ = writeln!(out, "units={}", self.units);
        let _ = writeln!(out, "min_area={}", self.min_area);
        let _ = writeln!(out, "split={}", self.output_mode.is_split());
        out
    }

    /// The "save defaults" action.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_file_contents()).map_err(|e| PipelineError::io(path, e))?;
        info!(path = %path.display(), "saved defaults");
        Ok(())
    }
}

/// Parse a number, falling back to `default` when it does not parse
/// and clamping it into `[min, max]` when bounds are given.
pub fn validate_input(value: &str, default: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let mut parsed = match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => {
            warn!("invalid number '{}', using {}", value, default);
            return default;
        }
    };

    if let Some(min) = min {
        parsed = parsed.max(min);
    }
    if let Some(max) = max {
        parsed = parsed.min(max);
    }
    parsed
}

fn validate_positive(value: &str, default: f64) -> f64 {
    let parsed = validate_input(value, default, None, None);
    if parsed > 0.0 {
        parsed
    } else {
        warn!("'{}' must be positive, using {}", value, default);
        default
    }
}
