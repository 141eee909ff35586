//! Process-wide timing and counters for end-of-run summaries.
//!
//! Recording is a handful of relaxed atomic adds, so it stays on in every
//! build. Besides the named spans and counters, each latent stream keeps its
//! own row: how many passes and positions it quantized and the codebook usage
//! it reported last.

use crate::modules::triple::Triple;
use std::fmt::Write;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Named spans and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    ModelFromConfig,
    ModelEncode,
    ModelDecode,
    ModelDecodeCode,
    ModelForward,
    EncoderForward,
    DecoderForward,
    QuantizerForward,
    CodebookLookup,
    DisentangleLoss,
    SemanticPrediction,
    Images,
    QuantizedPositions,
    LookedUpCodes,
}

impl Metric {
    const ALL: [Metric; 14] = [
        Metric::ModelFromConfig,
        Metric::ModelEncode,
        Metric::ModelDecode,
        Metric::ModelDecodeCode,
        Metric::ModelForward,
        Metric::EncoderForward,
        Metric::DecoderForward,
        Metric::QuantizerForward,
        Metric::CodebookLookup,
        Metric::DisentangleLoss,
        Metric::SemanticPrediction,
        Metric::Images,
        Metric::QuantizedPositions,
        Metric::LookedUpCodes,
    ];

    fn name(self) -> &'static str {
        match self {
            Metric::ModelFromConfig => "model.from_config",
            Metric::ModelEncode => "model.encode",
            Metric::ModelDecode => "model.decode",
            Metric::ModelDecodeCode => "model.decode_code",
            Metric::ModelForward => "model.forward",
            Metric::EncoderForward => "backbone.encoder",
            Metric::DecoderForward => "backbone.decoder",
            Metric::QuantizerForward => "quantizer.forward",
            Metric::CodebookLookup => "codebook.lookup",
            Metric::DisentangleLoss => "loss.disentangle",
            Metric::SemanticPrediction => "semantic.prediction",
            Metric::Images => "model.images",
            Metric::QuantizedPositions => "quantizer.positions",
            Metric::LookedUpCodes => "codebook.codes",
        }
    }

    fn is_counter(self) -> bool {
        matches!(
            self,
            Metric::Images | Metric::QuantizedPositions | Metric::LookedUpCodes
        )
    }
}

#[derive(Default)]
struct Tally {
    micros: AtomicU64,
    hits: AtomicU64,
}

#[derive(Default)]
struct StreamTally {
    passes: AtomicU64,
    positions: AtomicU64,
    /// Bits of the last reported usage fraction.
    usage: AtomicU32,
}

struct Collector {
    start: Instant,
    tallies: [Tally; Metric::ALL.len()],
    streams: [StreamTally; 3],
}

static COLLECTOR: OnceLock<Collector> = OnceLock::new();

fn collector() -> &'static Collector {
    COLLECTOR.get_or_init(|| Collector {
        start: Instant::now(),
        tallies: Default::default(),
        streams: Default::default(),
    })
}

fn tally(metric: Metric) -> &'static Tally {
    &collector().tallies[metric as usize]
}

/// Timer that adds its elapsed time to a metric when dropped.
pub struct PerfSpan {
    metric: Metric,
    start: Instant,
}

impl Drop for PerfSpan {
    fn drop(&mut self) {
        let micros = u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX);
        let tally = tally(self.metric);
        tally.micros.fetch_add(micros, Ordering::Relaxed);
        tally.hits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Begin a named timing span.
pub fn span(metric: Metric) -> PerfSpan {
    PerfSpan {
        metric,
        start: Instant::now(),
    }
}

/// Add `delta` to a counter.
pub fn add_count(metric: Metric, delta: u64) {
    tally(metric).hits.fetch_add(delta, Ordering::Relaxed);
}

/// Record one quantizer pass of latent stream `stream` (visual, mid, high
/// order). Out-of-range streams are ignored.
pub fn record_stream(stream: usize, positions: u64, usage: f32) {
    if let Some(row) = collector().streams.get(stream) {
        row.passes.fetch_add(1, Ordering::Relaxed);
        row.positions.fetch_add(positions, Ordering::Relaxed);
        row.usage.store(usage.to_bits(), Ordering::Relaxed);
    }
}

/// Render everything recorded so far.
pub fn report() -> String {
    let collector = collector();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "tritok perf ({:.3}s since start)",
        collector.start.elapsed().as_secs_f64()
    );

    let mut spans: Vec<(Metric, u64, u64)> = Metric::ALL
        .into_iter()
        .filter(|metric| !metric.is_counter())
        .map(|metric| {
            let tally = tally(metric);
            (
                metric,
                tally.micros.load(Ordering::Relaxed),
                tally.hits.load(Ordering::Relaxed),
            )
        })
        .filter(|&(_, _, hits)| hits > 0)
        .collect();
    spans.sort_by_key(|&(_, micros, _)| std::cmp::Reverse(micros));
    if !spans.is_empty() {
        let _ = writeln!(
            out,
            "  {:<20} {:>7} {:>11} {:>10}",
            "span", "calls", "total ms", "mean ms"
        );
        for (metric, micros, hits) in spans {
            let total_ms = micros as f64 / 1000.0;
            let _ = writeln!(
                out,
                "  {:<20} {:>7} {:>11.3} {:>10.3}",
                metric.name(),
                hits,
                total_ms,
                total_ms / hits as f64
            );
        }
    }

    for metric in Metric::ALL.into_iter().filter(|metric| metric.is_counter()) {
        let value = tally(metric).hits.load(Ordering::Relaxed);
        if value > 0 {
            let _ = writeln!(out, "  {:<20} {value}", metric.name());
        }
    }

    for (name, row) in Triple::<()>::NAMES.into_iter().zip(&collector.streams) {
        let passes = row.passes.load(Ordering::Relaxed);
        if passes == 0 {
            continue;
        }
        let _ = writeln!(
            out,
            "  stream {name:<9} passes={passes} positions={} usage={:.4}",
            row.positions.load(Ordering::Relaxed),
            f32::from_bits(row.usage.load(Ordering::Relaxed))
        );
    }
    out
}
