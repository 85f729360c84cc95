//! Log-log SVG charts of benchmark reports.

use crate::bench::{BenchReport, Series};

use itertools::Itertools;
use std::collections::BTreeMap;
use std::fmt::{self, Write};

const WIDTH: f64 = 640.0;
const HEIGHT: f64 = 400.0;
const MARGIN_LEFT: f64 = 70.0;
const MARGIN_RIGHT: f64 = 150.0;
const MARGIN_TOP: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 50.0;
const PALETTE: [&str; 6] = [
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b",
];

/// Maps log10 data coordinates into the plot area.
struct Frame {
    x: (f64, f64),
    y: (f64, f64),
}

impl Frame {
    fn px(&self, channels: f64) -> f64 {
        let (lo, hi) = self.x;
        MARGIN_LEFT + (channels.log10() - lo) / (hi - lo) * (WIDTH - MARGIN_LEFT - MARGIN_RIGHT)
    }

    fn py(&self, secs: f64) -> f64 {
        let (lo, hi) = self.y;
        let plot_height = HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
        HEIGHT - MARGIN_BOTTOM - (secs.log10() - lo) / (hi - lo) * plot_height
    }
}

/// Pad a degenerate range so that it has nonzero width.
fn padded(lo: f64, hi: f64) -> (f64, f64) {
    if hi - lo < 1e-9 {
        (lo - 0.5, hi + 0.5)
    } else {
        (lo, hi)
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Each series' `(log10 channels, log10 seconds)` points, ordered by channel count.
pub fn log_log_points(report: &BenchReport) -> BTreeMap<Series, Vec<(f32, f32)>> {
    report
        .by_series()
        .into_iter()
        .map(|(series, results)| {
            let points = results
                .iter()
                .sorted_by_key(|r| r.size.channels)
                .map(|r| {
                    (
                        f64::from(r.size.channels.get()).log10() as f32,
                        r.elapsed_secs().log10() as f32,
                    )
                })
                .collect();
            (series, points)
        })
        .collect()
}

/// Plot time against channel count, one line per series, both axes logarithmic.
pub fn write_svg<W: Write>(report: &BenchReport, title: &str, out: &mut W) -> fmt::Result {
    let results = report.results();
    let (x_lo, x_hi) = results
        .iter()
        .map(|r| f64::from(r.size.channels.get()).log10())
        .minmax()
        .into_option()
        .unwrap_or((0.0, 1.0));
    let (y_lo, y_hi) = results
        .iter()
        .map(|r| r.elapsed_secs().log10())
        .minmax_by(|a, b| a.total_cmp(b))
        .into_option()
        .unwrap_or((-3.0, 0.0));
    let frame = Frame {
        x: padded(x_lo, x_hi),
        y: padded(y_lo.floor(), y_hi.ceil()),
    };

    writeln!(
        out,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}" font-family="sans-serif" font-size="12">"#
    )?;
    writeln!(out, r#"<rect width="100%" height="100%" fill="white"/>"#)?;
    writeln!(
        out,
        r#"<text x="{}" y="{}" text-anchor="middle" font-size="14">{}</text>"#,
        (WIDTH - MARGIN_RIGHT + MARGIN_LEFT) / 2.0,
        MARGIN_TOP / 2.0 + 5.0,
        escape(title)
    )?;

    // Axes
    let x0 = MARGIN_LEFT;
    let x1 = WIDTH - MARGIN_RIGHT;
    let y0 = HEIGHT - MARGIN_BOTTOM;
    let y1 = MARGIN_TOP;
    writeln!(
        out,
        r#"<path d="M {x0} {y1} L {x0} {y0} L {x1} {y0}" fill="none" stroke="black"/>"#
    )?;
    for size in report.sizes().iter().map(|s| s.channels.get()).dedup() {
        let x = frame.px(f64::from(size));
        writeln!(
            out,
            r#"<line x1="{x:.1}" y1="{y0}" x2="{x:.1}" y2="{}" stroke="black"/><text x="{x:.1}" y="{}" text-anchor="middle">{size}</text>"#,
            y0 + 5.0,
            y0 + 20.0
        )?;
    }
    let (decade_lo, decade_hi) = frame.y;
    for decade in (decade_lo.ceil() as i32)..=(decade_hi.floor() as i32) {
        let y = frame.py(10f64.powi(decade));
        writeln!(
            out,
            r##"<line x1="{}" y1="{y:.1}" x2="{x1}" y2="{y:.1}" stroke="#ddd"/><text x="{}" y="{:.1}" text-anchor="end">1e{decade}</text>"##,
            x0 - 5.0,
            x0 - 8.0,
            y + 4.0
        )?;
    }
    writeln!(
        out,
        r#"<text x="{}" y="{}" text-anchor="middle">channels</text>"#,
        (x0 + x1) / 2.0,
        HEIGHT - 10.0
    )?;
    writeln!(
        out,
        r#"<text x="15" y="{}" text-anchor="middle" transform="rotate(-90 15 {})">seconds</text>"#,
        (y0 + y1) / 2.0,
        (y0 + y1) / 2.0
    )?;

    for (i, (series, group)) in report.by_series().into_iter().enumerate() {
        let color = PALETTE[i % PALETTE.len()];
        let points = group
            .iter()
            .map(|r| {
                (
                    frame.px(f64::from(r.size.channels.get())),
                    frame.py(r.elapsed_secs()),
                )
            })
            .collect::<Vec<_>>();
        let path = points
            .iter()
            .map(|(x, y)| format!("{x:.1},{y:.1}"))
            .join(" ");
        writeln!(
            out,
            r#"<polyline points="{path}" fill="none" stroke="{color}" stroke-width="2"/>"#
        )?;
        for (x, y) in &points {
            writeln!(
                out,
                r#"<circle cx="{x:.1}" cy="{y:.1}" r="3" fill="{color}"/>"#
            )?;
        }
        let legend_y = MARGIN_TOP + 20.0 * i as f64;
        writeln!(
            out,
            r#"<line x1="{}" y1="{legend_y}" x2="{}" y2="{legend_y}" stroke="{color}" stroke-width="2"/><text x="{}" y="{}">{}</text>"#,
            x1 + 10.0,
            x1 + 30.0,
            x1 + 35.0,
            legend_y + 4.0,
            escape(&series.to_string())
        )?;
    }
    writeln!(out, "</svg>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::{Series, TimingResult};
    use crate::common::ProblemSize;
    use crate::scheduling::ScheduleVariant;
    use std::time::Duration;

    fn report(points: &[(Series, i64, u64)]) -> BenchReport {
        points
            .iter()
            .map(|&(series, channels, micros)| TimingResult {
                series,
                size: ProblemSize::new(channels, 28).unwrap(),
                elapsed: Duration::from_micros(micros),
            })
            .collect()
    }

    #[test]
    fn test_one_polyline_per_series() {
        let fused = Series::Scheduled(ScheduleVariant::FusedSplit);
        let svg_report = report(&[
            (fused, 8, 10),
            (fused, 64, 80),
            (Series::Baseline, 8, 20),
            (Series::Baseline, 64, 30),
        ]);
        let mut svg = String::new();
        write_svg(&svg_report, "batch norm <28x28>", &mut svg).unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.trim_end().ends_with("</svg>"));
        assert_eq!(svg.matches("<polyline").count(), 2);
        assert_eq!(svg.matches("<circle").count(), 4);
        assert!(svg.contains("batch norm &lt;28x28&gt;"));
        assert!(svg.contains(">fused_split</text>"));
    }

    #[test]
    fn test_log_log_points_sorted_by_channels() {
        let axis = Series::Scheduled(ScheduleVariant::AxisBinding);
        let points = log_log_points(&report(&[(axis, 100, 1000), (axis, 10, 100)]));
        assert_eq!(points.len(), 1);
        let line = &points[&axis];
        assert_eq!(line.len(), 2);
        assert!((line[0].0 - 1.0).abs() < 1e-6);
        assert!((line[0].1 + 4.0).abs() < 1e-5);
        assert!((line[1].0 - 2.0).abs() < 1e-6);
        assert!((line[1].1 + 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_larger_times_are_drawn_higher() {
        let frame = Frame {
            x: (0.0, 3.0),
            y: (-6.0, -3.0),
        };
        assert!(frame.py(1e-4) < frame.py(1e-5));
        assert!(frame.px(256.0) > frame.px(8.0));
        assert!((frame.px(1.0) - MARGIN_LEFT).abs() < 1e-9);
    }

    #[test]
    fn test_empty_report_still_renders() {
        let mut svg = String::new();
        write_svg(&BenchReport::default(), "empty", &mut svg).unwrap();
        assert_eq!(svg.matches("<polyline").count(), 0);
        assert!(svg.contains("</svg>"));
    }
}
