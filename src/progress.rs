//! Progress reporting for trajectory iteration
//!
//! A single status line on stderr, rewritten in place, showing the current
//! frame and/or percentage, the averaged time per frame and an ETA. Only
//! worker 0 ever owns a reporter.

use crate::engine::AggregatedResult;
use crate::error::ConfigError;
use crate::partition::PartitionMode;
use crate::schema::ResultSchema;
use chrono::{DateTime, Local, TimeDelta};
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Frames averaged over for s/frame and ETA
pub const STATAVG: usize = 100;

/// ETAs longer than this are shown as an absolute time
const ETA_ABSOLUTE_SECS: f64 = 300.0;

/// What the status line shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressFormat {
    /// Frame number (and time, when known)
    Frame,
    /// Percentage of this worker's frames
    Percent,
    /// Frame number and percentage
    Both,
    /// Nothing at all
    Empty,
}

impl ProgressFormat {
    /// Percent for parallel block runs, frame numbers otherwise
    pub fn default_for(parallel: bool, mode: PartitionMode) -> Self {
        if parallel && mode == PartitionMode::Block {
            ProgressFormat::Percent
        } else {
            ProgressFormat::Frame
        }
    }
}

impl FromStr for ProgressFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frame" => Ok(ProgressFormat::Frame),
            "pct" | "percent" => Ok(ProgressFormat::Percent),
            "both" => Ok(ProgressFormat::Both),
            "empty" => Ok(ProgressFormat::Empty),
            other => Err(ConfigError::UnknownProgress(other.to_string())),
        }
    }
}

impl fmt::Display for ProgressFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProgressFormat::Frame => "frame",
            ProgressFormat::Percent => "pct",
            ProgressFormat::Both => "both",
            ProgressFormat::Empty => "empty",
        };
        f.write_str(s)
    }
}

/// Reporter settings shared by every run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSettings {
    pub format: ProgressFormat,
    /// Report every `outstats` frames (and at the last one)
    pub outstats: usize,
    /// Frames averaged over for timing statistics
    pub statavg: usize,
    /// Divide s/frame by this many workers
    pub scale_by: usize,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            format: ProgressFormat::Frame,
            outstats: 1,
            statavg: STATAVG,
            scale_by: 1,
        }
    }
}

/// Rolling per-frame timing statistics
#[derive(Debug)]
pub struct FrameStats {
    window: VecDeque<Duration>,
    capacity: usize,
    last: Instant,
}

impl FrameStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            last: Instant::now(),
        }
    }

    /// Restart the clock without recording anything
    pub fn reset(&mut self) {
        self.last = Instant::now();
    }

    /// Record the time since the previous tick
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let dt = now - self.last;
        self.last = now;
        self.record(dt);
        dt
    }

    pub fn record(&mut self, dt: Duration) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(dt);
    }

    /// Mean seconds per frame over the window
    pub fn mean_secs(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().map(Duration::as_secs_f64).sum::<f64>() / self.window.len() as f64
    }

    /// Estimated seconds until `remaining` more frames are done
    pub fn eta_secs(&self, remaining: usize) -> f64 {
        self.mean_secs() * remaining as f64
    }
}

/// ETA text: relative below five minutes, absolute beyond
pub fn eta_string(eta_secs: f64, now: DateTime<Local>) -> String {
    if eta_secs > ETA_ABSOLUTE_SECS {
        let end = now + TimeDelta::milliseconds((eta_secs * 1000.0) as i64);
        end.format("Will end %Y-%m-%d at %H:%M:%S.").to_string()
    } else {
        format!("Will end in {}s.", eta_secs.round() as u64)
    }
}

/// The part of the status line describing where the iteration is
pub fn position_string(
    format: ProgressFormat,
    frame: usize,
    fraction: f64,
    time: Option<f32>,
) -> String {
    let pct = format!("{:3.0}%", fraction * 100.0);
    let time = |s: &mut String| {
        if let Some(t) = time {
            s.push_str(&format!("  t= {t:.1} ps  "));
        }
    };
    match format {
        ProgressFormat::Frame => {
            let mut s = format!("Frame {frame}");
            time(&mut s);
            s
        }
        ProgressFormat::Percent => format!("{pct}  "),
        ProgressFormat::Both => {
            let mut s = format!("Frame {frame}, {pct}");
            time(&mut s);
            s
        }
        ProgressFormat::Empty => String::new(),
    }
}

/// Full status line
pub fn render_line(position: &str, secs_per_frame: f64, eta: &str) -> String {
    format!("{position}({secs_per_frame:.4} s/frame) \t{eta}")
}

/// Status line for worker 0
pub struct ProgressReporter {
    bar: ProgressBar,
    settings: ProgressSettings,
    total: usize,
    done: usize,
    stats: FrameStats,
}

impl ProgressReporter {
    /// Reporter for `total` emitted frames, drawing to stderr
    pub fn new(settings: ProgressSettings, total: usize) -> Self {
        let target = if settings.format == ProgressFormat::Empty {
            ProgressDrawTarget::hidden()
        } else {
            ProgressDrawTarget::stderr()
        };
        Self::with_target(settings, total, target)
    }

    /// Reporter that renders nothing, for tests and quiet runs
    pub fn hidden(settings: ProgressSettings, total: usize) -> Self {
        Self::with_target(settings, total, ProgressDrawTarget::hidden())
    }

    fn with_target(settings: ProgressSettings, total: usize, target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(Some(total as u64), target);
        // A plain message template cannot fail to parse
        if let Ok(style) = ProgressStyle::with_template("{msg}") {
            bar.set_style(style);
        }
        Self {
            bar,
            settings,
            total,
            done: 0,
            stats: FrameStats::new(settings.statavg),
        }
    }

    /// Mark the start of the emitting phase
    pub fn start(&mut self) {
        if !self.bar.is_hidden() {
            self.bar.println("Iterating through trajectory...");
        }
        self.stats.reset();
    }

    /// Record one emitted frame; returns the status line if one was drawn
    pub fn frame_done(&mut self, frame: usize, time: Option<f32>) -> Option<String> {
        let dt = self.stats.tick();
        self.done += 1;
        self.bar.set_position(self.done as u64);

        let last = self.done == self.total;
        if frame % self.settings.outstats.max(1) != 0 && !last {
            return None;
        }

        let fraction = if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        };
        let eta = eta_string(self.stats.eta_secs(self.total - self.done), Local::now());
        let secs = dt.as_secs_f64() / self.settings.scale_by.max(1) as f64;
        let position = position_string(self.settings.format, frame, fraction, time);
        let line = render_line(&position, secs, &eta);
        self.bar.set_message(line.clone());
        if last {
            self.finish();
        }
        Some(line)
    }

    /// Emitted frames reported so far
    pub fn done(&self) -> usize {
        self.done
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Leave the final line on screen
    pub fn finish(&self) {
        if !self.bar.is_finished() {
            self.bar.finish();
        }
    }
}

/// Format a count with thousands separators
pub fn format_count(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Print the run header
pub fn print_header(mode: &str, workers: usize, frames: usize, partition: PartitionMode) {
    println!();
    println!(
        "{} {}",
        style("trajpar").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Execution:").bold(), mode);
    println!("  {} {} ({})", style("Workers:").bold(), workers, partition);
    println!("  {} {}", style("Frames:").bold(), format_count(frames));
    println!();
}

/// Print a summary of the aggregated results
pub fn print_summary(result: &AggregatedResult, duration: Duration) {
    let secs = duration.as_secs_f64();
    let rate = if secs > 0.0 {
        result.frames.len() as f64 / secs
    } else {
        0.0
    };

    println!();
    println!("{}", style("Run Complete").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Frames:").bold(),
        format_count(result.frames.len())
    );
    println!(
        "  {} {:.2}s ({:.0} frames/sec)",
        style("Duration:").bold(),
        secs,
        rate
    );
    for comp in &result.results {
        let size = match &comp.schema {
            ResultSchema::Opaque => format!("{} values", comp.data.rows()),
            schema => format_size(schema.row_bytes() * comp.data.rows(), BINARY),
        };
        println!(
            "  {} {} ({})",
            style(format!("{}:", comp.name)).bold(),
            comp.schema,
            size
        );
    }
    println!();
}
