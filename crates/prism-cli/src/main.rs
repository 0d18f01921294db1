//! Prism command line demo.
//!
//! `prism run` extracts intensity features from a synthetic image through a
//! session cache: pooled sub-computations shared between features, quadrant
//! child caches, scoped invalidation between rounds and a statistics report.
//! `prism resolve` shows identifier resolution on its own.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use prism_session::{
    ChildCacheName, DuplicateFeatureName, EvalError, Evaluator, Feature, FeatureSet,
    IdentifierResolver, Operation, PrefixStage, SessionCache, SessionParams, SessionStatsReport,
};

#[derive(Parser)]
#[command(name = "prism", version, about = "Feature calculation session cache demo")]
struct PrismCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the demo pipeline over a synthetic image.
    Run(RunArgs),
    /// Resolve an identifier through a prefix-stripping chain.
    Resolve(ResolveArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Side length of the synthetic image.
    #[arg(long, default_value_t = 64)]
    size: usize,

    /// Number of evaluation rounds; later rounds hit the cache.
    #[arg(long, default_value_t = 2)]
    rounds: u32,

    /// Session parameters file (JSON).
    #[arg(long)]
    params: Option<PathBuf>,

    /// Invalidate between rounds, protecting the quadrant child caches.
    #[arg(long)]
    invalidate: bool,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ResolveArgs {
    /// Identifier to resolve.
    identifier: String,

    /// Scope prefix to strip; repeat for nested scopes, outermost first.
    #[arg(long = "prefix")]
    prefixes: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = PrismCli::parse();
    match cli.command {
        Command::Run(args) => run(args),
        Command::Resolve(args) => resolve(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.size > 0, "--size must be at least 1");
    anyhow::ensure!(args.rounds > 0, "--rounds must be at least 1");

    let params = match &args.params {
        Some(path) => {
            let params = SessionParams::from_json_file(path)
                .with_context(|| format!("loading session parameters from {}", path.display()))?;
            tracing::debug!(target: "prism.cli", path = %path.display(), "loaded session parameters");
            params
        }
        None => {
            let mut params = SessionParams::with_label("demo");
            params.set("bins", 64.0);
            params
        }
    };

    let catalog = feature_catalog()?;
    let features: Vec<Feature> = catalog.iter().cloned().collect();

    let mut quadrant_features = FeatureSet::new();
    quadrant_features.declare("mean")?;
    let evaluator = ImageEvaluator {
        quadrant_features: Rc::new(quadrant_features),
    };

    let session = SessionCache::new(Rc::new(evaluator), Rc::new(catalog))
        .with_resolver(IdentifierResolver::from_prefixes(["img."]));
    session.init(Rc::new(params.clone()));

    let image = Image::synthetic(args.size);
    let mut values = BTreeMap::new();
    for round in 0..args.rounds {
        if round > 0 && args.invalidate {
            let protected: BTreeSet<ChildCacheName> =
                session.child_names().into_iter().collect();
            session.invalidate_except(&protected);
        }

        let round_values = session
            .calc_each(&features, &image)
            .context("evaluating feature batch")?;
        for (feature, value) in features.iter().zip(&round_values) {
            values.insert(feature.to_string(), *value);
        }

        // Same entry through a scope-prefixed identifier.
        session
            .calc_by_identifier("img.mean", &image)
            .context("resolving prefixed identifier")?;
    }

    let report = RunReport {
        label: params.label.clone(),
        size: args.size,
        rounds: args.rounds,
        values,
        children: session
            .child_names()
            .iter()
            .map(ToString::to_string)
            .collect(),
        stats: session.stats().to_report(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn resolve(args: ResolveArgs) -> anyhow::Result<()> {
    let resolver = args
        .prefixes
        .iter()
        .fold(IdentifierResolver::new(), |resolver, prefix| {
            resolver.with_stage(PrefixStage::new([prefix.as_str()]))
        });
    println!("{} -> {}", args.identifier, resolver.resolve(&args.identifier));
    Ok(())
}

fn feature_catalog() -> Result<FeatureSet, DuplicateFeatureName> {
    let mut set = FeatureSet::new();
    for name in [
        "mean",
        "variance",
        "min",
        "max",
        "range",
        "entropy",
        "uniformity",
        "quadrant_spread",
    ] {
        set.declare(name)?;
    }
    Ok(set)
}

#[derive(Serialize)]
struct RunReport {
    label: Option<String>,
    size: usize,
    rounds: u32,
    values: BTreeMap<String, f64>,
    children: Vec<String>,
    stats: SessionStatsReport,
}

fn print_report(report: &RunReport) {
    match &report.label {
        Some(label) => println!(
            "session `{label}`: {0}x{0} synthetic image, {1} round(s)",
            report.size, report.rounds
        ),
        None => println!(
            "{0}x{0} synthetic image, {1} round(s)",
            report.size, report.rounds
        ),
    }
    println!();
    for (name, value) in &report.values {
        println!("  {name:<18} {value:>14.4}");
    }
    println!();
    let stats = &report.stats;
    println!(
        "  result cache:  {} hits / {} misses",
        stats.result_hits, stats.result_misses
    );
    println!(
        "  evaluations:   {} total, {} failed, {} NaN, {} ms",
        stats.evaluations, stats.failed_evaluations, stats.nan_results, stats.eval_time_total_ms
    );
    println!(
        "  pool:          {} calculations, {} hits / {} misses",
        stats.pool_len, stats.pool_hits, stats.pool_misses
    );
    println!("  invalidations: {}", stats.invalidations);
    if report.children.is_empty() {
        println!("  children:      none");
    } else {
        println!("  children:      {}", report.children.join(", "));
    }
}

/// Synthetic grayscale image: a diagonal gradient with deterministic noise.
struct Image {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl Image {
    fn synthetic(size: usize) -> Self {
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut pixels = Vec::with_capacity(size * size);
        for y in 0..size {
            for x in 0..size {
                seed = seed
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let noise = (seed >> 56) as u8;
                let gradient = (255 * (x + y) / (2 * size)) as u8;
                pixels.push(gradient / 2 + noise / 2);
            }
        }
        Self {
            width: size,
            height: size,
            pixels,
        }
    }

    fn quadrants(&self) -> [Quadrant; 4] {
        let half_w = self.width / 2;
        let half_h = self.height / 2;
        let mut quadrants: [Quadrant; 4] = std::array::from_fn(|_| Quadrant::default());
        for (i, &pixel) in self.pixels.iter().enumerate() {
            let x = i % self.width;
            let y = i / self.width;
            let qx = usize::from(x >= half_w);
            let qy = usize::from(y >= half_h);
            quadrants[qy * 2 + qx].pixels.push(pixel);
        }
        quadrants
    }
}

#[derive(Default)]
struct Quadrant {
    pixels: Vec<u8>,
}

/// Mean of the pixel values raised to `order`. `order` 1 and 2 together
/// yield mean and variance, sharing the first moment through the pool.
#[derive(PartialEq, Eq, Hash)]
struct Moment {
    order: u32,
}

impl Operation<Image> for Moment {
    fn run(&self, input: &Image) -> Result<f64, EvalError> {
        if input.pixels.is_empty() {
            return Err(EvalError::new("empty image"));
        }
        let sum: f64 = input
            .pixels
            .iter()
            .map(|&p| f64::from(p).powi(self.order as i32))
            .sum();
        Ok(sum / input.pixels.len() as f64)
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy)]
enum ExtremeKind {
    Min,
    Max,
}

#[derive(PartialEq, Eq, Hash)]
struct Extreme {
    kind: ExtremeKind,
}

impl Operation<Image> for Extreme {
    fn run(&self, input: &Image) -> Result<f64, EvalError> {
        if input.pixels.is_empty() {
            return Err(EvalError::new("empty image"));
        }
        let iter = input.pixels.iter().map(|&p| f64::from(p));
        Ok(match self.kind {
            ExtremeKind::Min => iter.fold(f64::INFINITY, f64::min),
            ExtremeKind::Max => iter.fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy)]
enum HistKind {
    Entropy,
    Uniformity,
}

/// First-order histogram statistic over `bins` equal-width intensity bins.
#[derive(PartialEq, Eq, Hash)]
struct HistogramStat {
    kind: HistKind,
    bins: u32,
}

impl Operation<Image> for HistogramStat {
    fn run(&self, input: &Image) -> Result<f64, EvalError> {
        if input.pixels.is_empty() {
            return Err(EvalError::new("empty image"));
        }
        let bins = self.bins.max(1) as usize;
        let mut counts = vec![0u64; bins];
        for &pixel in &input.pixels {
            counts[pixel as usize * bins / 256] += 1;
        }
        let total = input.pixels.len() as f64;
        Ok(match self.kind {
            HistKind::Entropy => counts
                .iter()
                .filter(|&&count| count > 0)
                .map(|&count| {
                    let p = count as f64 / total;
                    -(p * p.log2())
                })
                .sum(),
            HistKind::Uniformity => counts
                .iter()
                .map(|&count| {
                    let p = count as f64 / total;
                    p * p
                })
                .sum(),
        })
    }
}

struct ImageEvaluator {
    quadrant_features: Rc<FeatureSet>,
}

impl Evaluator<Image> for ImageEvaluator {
    fn evaluate(
        &self,
        feature: &Feature,
        input: &Image,
        session: &SessionCache<Image>,
    ) -> Result<f64, EvalError> {
        let pool = session.pool();
        // Configured bin counts outside [1, 4096] would allocate absurd
        // histograms; clamp instead of trusting the parameters file.
        let bins = session
            .params()
            .and_then(|params| params.number("bins"))
            .unwrap_or(64.0)
            .clamp(1.0, 4096.0) as u32;

        match feature.to_string().as_str() {
            "mean" => pool.intern(Moment { order: 1 }).evaluate(input),
            "variance" => {
                let m1 = pool.intern(Moment { order: 1 }).evaluate(input)?;
                let m2 = pool.intern(Moment { order: 2 }).evaluate(input)?;
                Ok(m2 - m1 * m1)
            }
            "min" => pool
                .intern(Extreme {
                    kind: ExtremeKind::Min,
                })
                .evaluate(input),
            "max" => pool
                .intern(Extreme {
                    kind: ExtremeKind::Max,
                })
                .evaluate(input),
            "range" => {
                let max = pool
                    .intern(Extreme {
                        kind: ExtremeKind::Max,
                    })
                    .evaluate(input)?;
                let min = pool
                    .intern(Extreme {
                        kind: ExtremeKind::Min,
                    })
                    .evaluate(input)?;
                Ok(max - min)
            }
            "entropy" => pool
                .intern(HistogramStat {
                    kind: HistKind::Entropy,
                    bins,
                })
                .evaluate(input),
            "uniformity" => pool
                .intern(HistogramStat {
                    kind: HistKind::Uniformity,
                    bins,
                })
                .evaluate(input),
            "quadrant_spread" => {
                let mut means = Vec::with_capacity(4);
                for (idx, quadrant) in input.quadrants().into_iter().enumerate() {
                    let features = Rc::clone(&self.quadrant_features);
                    let child = session
                        .child_cache_for(format!("q{idx}"), move || {
                            SessionCache::new(Rc::new(QuadrantEvaluator), features)
                        })
                        .map_err(|err| EvalError::with_source("quadrant cache unavailable", err))?;
                    let mean = child
                        .calc_by_identifier("mean", &quadrant)
                        .map_err(|err| EvalError::with_source("quadrant mean failed", err))?;
                    means.push(mean);
                }
                let min = means.iter().copied().fold(f64::INFINITY, f64::min);
                let max = means.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                Ok(max - min)
            }
            other => Err(EvalError::new(format!(
                "no evaluator rule for feature `{other}`"
            ))),
        }
    }
}

struct QuadrantEvaluator;

impl Evaluator<Quadrant> for QuadrantEvaluator {
    fn evaluate(
        &self,
        feature: &Feature,
        input: &Quadrant,
        _session: &SessionCache<Quadrant>,
    ) -> Result<f64, EvalError> {
        match feature.to_string().as_str() {
            "mean" => {
                if input.pixels.is_empty() {
                    return Ok(f64::NAN);
                }
                Ok(input.pixels.iter().map(|&p| f64::from(p)).sum::<f64>()
                    / input.pixels.len() as f64)
            }
            other => Err(EvalError::new(format!("no quadrant rule for `{other}`"))),
        }
    }
}
