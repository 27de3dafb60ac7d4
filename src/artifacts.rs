//! Output artifacts: loss traces, estimated trend, plot and checkpoint.
//!
//! Layout under the output directory:
//!
//! ```text
//! trend/trend_loss.csv
//! trend/estimated_trend.csv
//! trend/estimated_trend.png
//! log_likelihood_loss_phase2.csv
//! pretrained_model/<stop_iteration>_pretrained_model.safetensors
//! run_summary.json
//! ```
//!
//! Tables carry a leading unnamed index column.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::Writer;
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{DeepVarError, Result};

/// Paths of every artifact for one run.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    /// Layout rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Create `trend/` and `pretrained_model/`.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.trend_dir())?;
        std::fs::create_dir_all(self.pretrained_dir())?;
        Ok(())
    }

    /// Output directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for trend outputs.
    pub fn trend_dir(&self) -> PathBuf {
        self.root.join("trend")
    }

    /// Directory for checkpoints.
    pub fn pretrained_dir(&self) -> PathBuf {
        self.root.join("pretrained_model")
    }

    /// Phase 1 loss trace.
    pub fn trend_loss(&self) -> PathBuf {
        self.trend_dir().join("trend_loss.csv")
    }

    /// Final trend table.
    pub fn estimated_trend(&self) -> PathBuf {
        self.trend_dir().join("estimated_trend.csv")
    }

    /// Trend-vs-series plot.
    pub fn trend_plot(&self) -> PathBuf {
        self.trend_dir().join("estimated_trend.png")
    }

    /// Phase 2 loss trace.
    pub fn likelihood_loss(&self) -> PathBuf {
        self.root.join("log_likelihood_loss_phase2.csv")
    }

    /// Checkpoint keyed by the zero-based final phase 2 iteration.
    pub fn checkpoint(&self, stop_iteration: usize) -> PathBuf {
        self.pretrained_dir()
            .join(format!("{stop_iteration}_pretrained_model.safetensors"))
    }

    /// JSON run summary.
    pub fn run_summary(&self) -> PathBuf {
        self.root.join("run_summary.json")
    }
}

/// Write a single-column loss trace with an index column.
pub fn write_loss_trace<P: AsRef<Path>>(path: P, column: &str, losses: &[f64]) -> Result<()> {
    let mut writer = Writer::from_path(path)?;
    writer.write_record(["", column])?;
    for (i, loss) in losses.iter().enumerate() {
        writer.write_record([i.to_string(), loss.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a trace written by [`write_loss_trace`].
pub fn read_loss_trace<P: AsRef<Path>>(path: P) -> Result<Vec<f64>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut losses = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let cell = record.get(1).unwrap_or_default();
        let value = cell.trim().parse::<f64>().map_err(|_| {
            DeepVarError::invalid_input(format!("row {row}: cannot parse loss {cell:?}"))
        })?;
        losses.push(value);
    }
    Ok(losses)
}

/// Write `T` rows of `m` values with an index column and numbered headers.
pub fn write_series<P: AsRef<Path>>(path: P, rows: &[Vec<f64>]) -> Result<()> {
    let width = rows.first().map_or(0, Vec::len);
    let mut writer = Writer::from_path(path)?;

    let mut header = vec![String::new()];
    header.extend((0..width).map(|j| j.to_string()));
    writer.write_record(&header)?;

    for (i, row) in rows.iter().enumerate() {
        if row.len() != width {
            return Err(DeepVarError::shape_mismatch(
                format!("{width} values per row"),
                format!("{} values in row {i}", row.len()),
            ));
        }
        let mut record = Vec::with_capacity(width + 1);
        record.push(i.to_string());
        record.extend(row.iter().map(f64::to_string));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Summary of a finished fit, written as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Number of series `m`.
    pub series: usize,
    /// VAR order.
    pub order: usize,
    /// Sequence length `T`.
    pub seq_len: usize,
    /// Phase 1 iterations run.
    pub trend_iterations: usize,
    /// Phase 2 iterations run.
    pub likelihood_iterations: usize,
    /// Zero-based final phase 2 iteration.
    pub stop_iteration: usize,
    /// Whether phase 2 ended on the relative-change rule.
    pub early_stopped: bool,
    /// Last phase 1 loss.
    pub final_trend_loss: Option<f64>,
    /// Last phase 2 loss.
    pub final_likelihood: Option<f64>,
    /// Checkpoint path.
    pub checkpoint: String,
}

impl RunSummary {
    /// Write as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Read a summary written by [`RunSummary::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// Renders observed series against their estimated trends.
pub trait TrendPlotter {
    /// Plot one panel per series. `observed` and `trend` are `T` rows of `m`
    /// values; `names` has `m` entries.
    fn plot(
        &self,
        observed: &[Vec<f64>],
        trend: &[Vec<f64>],
        names: &[String],
        path: &Path,
    ) -> Result<()>;
}

/// Plot colors.
pub mod colors {
    use image::Rgb;

    /// Background.
    pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
    /// Panel frame.
    pub const LIGHT_GRAY: Rgb<u8> = Rgb([200, 200, 200]);
    /// Observed series.
    pub const BLUE: Rgb<u8> = Rgb([33, 150, 243]);
    /// Trend.
    pub const ORANGE: Rgb<u8> = Rgb([255, 152, 0]);
}

/// PNG grid of panels, two per row.
#[derive(Debug, Clone)]
pub struct PngTrendPlotter {
    /// Width of one panel in pixels.
    pub panel_width: u32,
    /// Height of one panel in pixels.
    pub panel_height: u32,
    /// Inner margin of each panel.
    pub margin: u32,
    /// Observed series color.
    pub series_color: Rgb<u8>,
    /// Trend color.
    pub trend_color: Rgb<u8>,
}

impl Default for PngTrendPlotter {
    fn default() -> Self {
        Self {
            panel_width: 480,
            panel_height: 300,
            margin: 20,
            series_color: colors::BLUE,
            trend_color: colors::ORANGE,
        }
    }
}

const GRID_COLUMNS: u32 = 2;

impl PngTrendPlotter {
    /// Draw the grid in memory.
    pub fn render(&self, observed: &[Vec<f64>], trend: &[Vec<f64>], series: usize) -> Result<RgbImage> {
        if observed.len() != trend.len() {
            return Err(DeepVarError::shape_mismatch(
                format!("{} trend rows", observed.len()),
                format!("{} trend rows", trend.len()),
            ));
        }
        if observed.iter().chain(trend).any(|row| row.len() < series) {
            return Err(DeepVarError::shape_mismatch(
                format!("{series} values per row"),
                "a shorter row",
            ));
        }
        if self.panel_width <= 2 * self.margin || self.panel_height <= 2 * self.margin {
            return Err(DeepVarError::config("plot panel smaller than its margins"));
        }

        let grid_rows = (series as u32).div_ceil(GRID_COLUMNS).max(1);
        let mut img = RgbImage::from_pixel(
            GRID_COLUMNS * self.panel_width,
            grid_rows * self.panel_height,
            colors::WHITE,
        );

        for j in 0..series {
            let ys: Vec<f64> = observed.iter().map(|r| r[j]).collect();
            let ts: Vec<f64> = trend.iter().map(|r| r[j]).collect();
            let (lo, hi) = value_range(ys.iter().chain(ts.iter()).copied());

            let x0 = (j as u32 % GRID_COLUMNS) * self.panel_width + self.margin;
            let y0 = (j as u32 / GRID_COLUMNS) * self.panel_height + self.margin;
            let w = self.panel_width - 2 * self.margin;
            let h = self.panel_height - 2 * self.margin;

            draw_frame(&mut img, x0, y0, w, h, colors::LIGHT_GRAY);
            let panel = Panel { x0, y0, w, h, lo, hi };
            draw_polyline(&mut img, &panel, &ys, self.series_color);
            draw_polyline(&mut img, &panel, &ts, self.trend_color);
        }
        Ok(img)
    }
}

impl TrendPlotter for PngTrendPlotter {
    fn plot(
        &self,
        observed: &[Vec<f64>],
        trend: &[Vec<f64>],
        names: &[String],
        path: &Path,
    ) -> Result<()> {
        let img = self.render(observed, trend, names.len())?;
        img.save(path)?;
        tracing::debug!(
            "Wrote trend plot for {} series: {}",
            names.join(", "),
            path.display()
        );
        Ok(())
    }
}

fn value_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (lo, hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() {
        (0.0, 1.0)
    } else if hi - lo < f64::EPSILON {
        (lo - 0.5, hi + 0.5)
    } else {
        (lo, hi)
    }
}

struct Panel {
    x0: u32,
    y0: u32,
    w: u32,
    h: u32,
    lo: f64,
    hi: f64,
}

impl Panel {
    fn point(&self, i: usize, n: usize, v: f64) -> (i64, i64) {
        let fx = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.5 };
        let fy = ((v - self.lo) / (self.hi - self.lo)).clamp(0.0, 1.0);
        let x = self.x0 as f64 + fx * (self.w - 1) as f64;
        let y = self.y0 as f64 + (1.0 - fy) * (self.h - 1) as f64;
        (x.round() as i64, y.round() as i64)
    }
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_frame(img: &mut RgbImage, x0: u32, y0: u32, w: u32, h: u32, color: Rgb<u8>) {
    let (x0, y0, x1, y1) = (x0 as i64, y0 as i64, (x0 + w - 1) as i64, (y0 + h - 1) as i64);
    draw_line(img, (x0, y0), (x1, y0), color);
    draw_line(img, (x0, y1), (x1, y1), color);
    draw_line(img, (x0, y0), (x0, y1), color);
    draw_line(img, (x1, y0), (x1, y1), color);
}

fn draw_polyline(img: &mut RgbImage, panel: &Panel, values: &[f64], color: Rgb<u8>) {
    let n = values.len();
    let mut prev: Option<(i64, i64)> = None;
    for (i, &v) in values.iter().enumerate() {
        if !v.is_finite() {
            prev = None;
            continue;
        }
        let p = panel.point(i, n, v);
        match prev {
            Some(q) => draw_line(img, q, p, color),
            None => put(img, p.0, p.1, color),
        }
        prev = Some(p);
    }
}

// Bresenham
fn draw_line(img: &mut RgbImage, from: (i64, i64), to: (i64, i64), color: Rgb<u8>) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put(img, x, y, color);
        if x == to.0 && y == to.1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}
