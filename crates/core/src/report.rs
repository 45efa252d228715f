//! Latency plots rendered from a [`RecordStore`].
//!
//! One SVG line chart per (batch count, op type): duration against hidden
//! size, one polyline per kernel variant on shared axes.

use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::kernels::KernelName;
use crate::problem::OpType;
use crate::record::{RecordKey, RecordStore};

const WIDTH: f64 = 960.0;
const HEIGHT: f64 = 540.0;
const MARGIN_LEFT: f64 = 80.0;
const MARGIN_RIGHT: f64 = 160.0;
const MARGIN_TOP: f64 = 50.0;
const MARGIN_BOTTOM: f64 = 60.0;
const TICKS: usize = 5;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no records for batch size {batch_count} ({op})")]
    NoData { batch_count: usize, op: OpType },
    #[error("failed to write plot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plot rendering failed: {0}")]
    Render(#[from] std::fmt::Error),
}

/// One named line of a plot.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSeries {
    pub label: String,
    pub color: &'static str,
    pub points: Vec<(f64, f64)>,
}

/// A line chart with shared axes.
#[derive(Debug, Clone, PartialEq)]
pub struct LinePlot {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub series: Vec<PlotSeries>,
}

struct Axis {
    min: f64,
    max: f64,
    start: f64,
    len: f64,
}

impl Axis {
    fn new(min: f64, max: f64, start: f64, len: f64) -> Self {
        let (min, max) = if (max - min).abs() < f64::EPSILON {
            (min - 0.5, max + 0.5)
        } else {
            (min, max)
        };
        Self {
            min,
            max,
            start,
            len,
        }
    }

    fn project(&self, value: f64) -> f64 {
        self.start + (value - self.min) / (self.max - self.min) * self.len
    }

    fn ticks(&self) -> impl Iterator<Item = f64> + '_ {
        (0..=TICKS).map(move |i| self.min + (self.max - self.min) * i as f64 / TICKS as f64)
    }
}

impl LinePlot {
    fn bounds(&self) -> Option<(f64, f64, f64)> {
        let mut points = self.series.iter().flat_map(|s| s.points.iter());
        let &(x0, y0) = points.next()?;
        let (x_min, x_max, y_max) = points.fold((x0, x0, y0), |(lo, hi, top), &(x, y)| {
            (lo.min(x), hi.max(x), top.max(y))
        });
        Some((x_min, x_max, y_max))
    }

    /// Render to a standalone SVG document.
    pub fn render_svg(&self) -> Result<String, std::fmt::Error> {
        let (x_min, x_max, y_max) = self.bounds().unwrap_or((0.0, 1.0, 1.0));
        let plot_w = WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
        let plot_h = HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
        let x_axis = Axis::new(x_min, x_max, MARGIN_LEFT, plot_w);
        // Y grows upwards, so project from the bottom edge with a negative span.
        let y_axis = Axis::new(0.0, y_max * 1.05, MARGIN_TOP + plot_h, -plot_h);

        let mut svg = String::new();
        writeln!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}" font-family="sans-serif" font-size="12">"#
        )?;
        writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#)?;
        writeln!(
            svg,
            r#"<text x="{:.1}" y="28" text-anchor="middle" font-size="16">{}</text>"#,
            MARGIN_LEFT + plot_w / 2.0,
            escape(&self.title)
        )?;

        for tick in x_axis.ticks() {
            let x = x_axis.project(tick);
            writeln!(
                svg,
                r##"<line x1="{x:.1}" y1="{MARGIN_TOP}" x2="{x:.1}" y2="{:.1}" stroke="#e0e0e0"/>"##,
                MARGIN_TOP + plot_h
            )?;
            writeln!(
                svg,
                r#"<text x="{x:.1}" y="{:.1}" text-anchor="middle">{}</text>"#,
                MARGIN_TOP + plot_h + 18.0,
                format_tick(tick)
            )?;
        }
        for tick in y_axis.ticks() {
            let y = y_axis.project(tick);
            writeln!(
                svg,
                r##"<line x1="{MARGIN_LEFT}" y1="{y:.1}" x2="{:.1}" y2="{y:.1}" stroke="#e0e0e0"/>"##,
                MARGIN_LEFT + plot_w
            )?;
            writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="end">{}</text>"#,
                MARGIN_LEFT - 8.0,
                y + 4.0,
                format_tick(tick)
            )?;
        }

        writeln!(
            svg,
            r#"<rect x="{MARGIN_LEFT}" y="{MARGIN_TOP}" width="{plot_w:.1}" height="{plot_h:.1}" fill="none" stroke="black"/>"#
        )?;
        writeln!(
            svg,
            r#"<text x="{:.1}" y="{:.1}" text-anchor="middle">{}</text>"#,
            MARGIN_LEFT + plot_w / 2.0,
            HEIGHT - 16.0,
            escape(&self.x_label)
        )?;
        writeln!(
            svg,
            r#"<text x="20" y="{:.1}" text-anchor="middle" transform="rotate(-90 20 {:.1})">{}</text>"#,
            MARGIN_TOP + plot_h / 2.0,
            MARGIN_TOP + plot_h / 2.0,
            escape(&self.y_label)
        )?;

        for (i, series) in self.series.iter().enumerate() {
            if !series.points.is_empty() {
                let mut path = String::new();
                for &(x, y) in &series.points {
                    write!(path, "{:.1},{:.1} ", x_axis.project(x), y_axis.project(y))?;
                }
                writeln!(
                    svg,
                    r#"<polyline points="{}" fill="none" stroke="{}" stroke-width="2"/>"#,
                    path.trim_end(),
                    series.color
                )?;
                for &(x, y) in &series.points {
                    writeln!(
                        svg,
                        r#"<circle cx="{:.1}" cy="{:.1}" r="3" fill="{}"/>"#,
                        x_axis.project(x),
                        y_axis.project(y),
                        series.color
                    )?;
                }
            }

            let legend_x = MARGIN_LEFT + plot_w + 16.0;
            let legend_y = MARGIN_TOP + 12.0 + 20.0 * i as f64;
            writeln!(
                svg,
                r#"<line x1="{legend_x:.1}" y1="{legend_y:.1}" x2="{:.1}" y2="{legend_y:.1}" stroke="{}" stroke-width="2"/>"#,
                legend_x + 24.0,
                series.color
            )?;
            writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}">{}</text>"#,
                legend_x + 30.0,
                legend_y + 4.0,
                escape(&series.label)
            )?;
        }

        writeln!(svg, "</svg>")?;
        Ok(svg)
    }
}

fn format_tick(value: f64) -> String {
    if value.abs() >= 100.0 || value == 0.0 {
        format!("{value:.0}")
    } else if value.abs() >= 1.0 {
        format!("{value:.2}")
    } else {
        format!("{value:.4}")
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn kernel_color(kernel: KernelName) -> &'static str {
    match kernel {
        KernelName::Segmented => "red",
        KernelName::Indexed => "orange",
        KernelName::Packed => "blue",
    }
}

/// `bgmv_{op}_batchsize{bs}.svg`
pub fn plot_file_name(batch_count: usize, op: OpType) -> String {
    format!("bgmv_{op}_batchsize{batch_count}.svg")
}

/// Renders record plots into an output directory.
#[derive(Debug, Clone)]
pub struct Reporter {
    output_dir: PathBuf,
    rank: usize,
    seq_len: usize,
    stride: usize,
}

impl Reporter {
    pub fn new(output_dir: impl Into<PathBuf>, rank: usize, seq_len: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            rank,
            seq_len,
            stride: 2,
        }
    }

    /// Plot every `stride`-th record (default 2).
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride.max(1);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Build the chart for one (batch count, op type).
    pub fn line_plot(&self, store: &RecordStore, batch_count: usize, op: OpType) -> LinePlot {
        let batch_count = batch_count.max(1);
        let series = KernelName::ALL
            .into_iter()
            .map(|kernel| PlotSeries {
                label: RecordKey::new(kernel, op).to_string(),
                color: kernel_color(kernel),
                points: store
                    .records(RecordKey::new(kernel, op))
                    .iter()
                    .filter(|r| r.batch_count == batch_count)
                    .step_by(self.stride)
                    .map(|r| (r.hidden_size as f64, r.duration_ms))
                    .collect(),
            })
            .collect();

        LinePlot {
            title: format!(
                "bgmv {op}: batch size {batch_count}, rank {}, seq len {}",
                self.rank, self.seq_len
            ),
            x_label: "hidden size".to_string(),
            y_label: "duration (ms)".to_string(),
            series,
        }
    }

    /// Render and write the plot for one (batch count, op type).
    pub fn plot_batch(
        &self,
        store: &RecordStore,
        batch_count: usize,
        op: OpType,
    ) -> Result<PathBuf, ReportError> {
        let batch_count = batch_count.max(1);
        let plot = self.line_plot(store, batch_count, op);
        if plot.series.iter().all(|s| s.points.is_empty()) {
            return Err(ReportError::NoData { batch_count, op });
        }

        let svg = plot.render_svg()?;
        fs::create_dir_all(&self.output_dir).map_err(|source| ReportError::Write {
            path: self.output_dir.clone(),
            source,
        })?;
        let path = self.output_dir.join(plot_file_name(batch_count, op));
        fs::write(&path, svg).map_err(|source| ReportError::Write {
            path: path.clone(),
            source,
        })?;
        tracing::info!(path = %path.display(), "wrote plot");
        Ok(path)
    }

    /// Plot every (batch count, op) pair in `batch_counts × ops` that has data.
    pub fn plot_all(
        &self,
        store: &RecordStore,
        batch_counts: &[usize],
        ops: &[OpType],
    ) -> Result<Vec<PathBuf>, ReportError> {
        let mut batches: Vec<usize> = batch_counts.iter().map(|&b| b.max(1)).collect();
        batches.sort_unstable();
        batches.dedup();

        let mut written = Vec::new();
        for &batch_count in &batches {
            for &op in ops {
                match self.plot_batch(store, batch_count, op) {
                    Ok(path) => written.push(path),
                    Err(ReportError::NoData { .. }) => {
                        tracing::debug!(batch_count, %op, "no records to plot");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::Precision;
    use crate::record::TimingRecord;
    use tempfile::TempDir;

    fn store() -> RecordStore {
        let mut store = RecordStore::new();
        for kernel in KernelName::ALL {
            for (i, hidden) in [128usize, 256, 512, 1024].into_iter().enumerate() {
                store.push(
                    RecordKey::new(kernel, OpType::Shrink),
                    TimingRecord {
                        duration_ms: 0.01 * (i + 1) as f64,
                        batch_count: 1,
                        hidden_size: hidden,
                        dtype: Precision::Half,
                        seed: 0,
                    },
                );
            }
        }
        store
    }

    #[test]
    fn test_plot_file_name() {
        assert_eq!(plot_file_name(8, OpType::Shrink), "bgmv_shrink_batchsize8.svg");
        assert_eq!(plot_file_name(1, OpType::Expand), "bgmv_expand_batchsize1.svg");
    }

    #[test]
    fn test_line_plot_thins_every_other_point() {
        let reporter = Reporter::new("unused", 16, 1);
        let plot = reporter.line_plot(&store(), 1, OpType::Shrink);

        assert_eq!(plot.series.len(), 3);
        let xs: Vec<f64> = plot.series[0].points.iter().map(|p| p.0).collect();
        assert_eq!(xs, vec![128.0, 512.0]);
        assert!(plot.title.contains("rank 16"));
        assert!(plot.title.contains("seq len 1"));
    }

    #[test]
    fn test_batch_zero_plotted_as_one() {
        let reporter = Reporter::new("unused", 16, 1);
        let plot = reporter.line_plot(&store(), 0, OpType::Shrink);
        assert!(plot.series.iter().all(|s| !s.points.is_empty()));
    }

    #[test]
    fn test_render_svg_has_series_and_legend() {
        let reporter = Reporter::new("unused", 16, 1);
        let svg = reporter
            .line_plot(&store(), 1, OpType::Shrink)
            .render_svg()
            .unwrap();

        assert!(svg.starts_with("<svg"));
        assert!(svg.trim_end().ends_with("</svg>"));
        assert_eq!(svg.matches("<polyline").count(), 3);
        assert!(svg.contains("segmented_bgmv_shrink"));
        assert!(svg.contains("stroke=\"orange\""));
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b & \"c\""), "a&lt;b &amp; &quot;c&quot;");
    }

    #[test]
    fn test_plot_batch_writes_file() {
        let dir = TempDir::new().unwrap();
        let reporter = Reporter::new(dir.path().join("plots"), 16, 1);

        let path = reporter.plot_batch(&store(), 1, OpType::Shrink).unwrap();
        assert_eq!(path.file_name().unwrap(), "bgmv_shrink_batchsize1.svg");
        assert!(fs::read_to_string(&path).unwrap().contains("<polyline"));
    }

    #[test]
    fn test_plot_all_skips_empty_pairs() {
        let dir = TempDir::new().unwrap();
        let reporter = Reporter::new(dir.path(), 16, 1);

        let written = reporter
            .plot_all(&store(), &[0, 1, 8], &OpType::ALL)
            .unwrap();
        assert_eq!(written.len(), 1);
        assert!(matches!(
            reporter.plot_batch(&store(), 8, OpType::Shrink),
            Err(ReportError::NoData { batch_count: 8, .. })
        ));
    }
}
