//! powertrace command line interface.
//!
//! Usage:
//!
//! ```text
//!   powertrace info <file.trs>
//!   powertrace stats <file.trs> --out=<json>
//!   powertrace ttest --fixed=<f> --random=<r> [--format=trs|stream]
//!                    [--second-order] [--critical-value=4.5] [--dump=<json>]
//!   powertrace ttest --traces=<t> --mask=<m> [...]
//!   powertrace cpa <file.trs> [--config=<json>] [--expected-key=<hex>] [--dump=<json>]
//!   powertrace simulate --out=<file.trs> [--traces=N] [--samples=L] [--key=<hex>] [--seed=S]
//! ```
//!
//! Exit codes: 0 success, 1 usage error, 2 missing or malformed input,
//! 3 leakage found by `ttest`.

use env_logger::Env;
use powertrace::codec::{read_trs_header_file, write_trs_file, RecordLayout, StreamReader, TrsReader};
use powertrace::synthetic::{cpa_trace_set, SyntheticCpaConfig};
use powertrace::{
    progress_bar, ttest, AnalysisConfig, AnalysisError, CancelToken, CpaEngine, TTestOrder,
    TraceSet, WelchTTest, DEFAULT_CRITICAL_VALUE,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use thiserror::Error;

const EXIT_USAGE: i32 = 1;
const EXIT_INPUT: i32 = 2;
const EXIT_LEAKAGE: i32 = 3;

#[derive(Error, Debug)]
enum CliError {
    #[error("usage: {0}")]
    Usage(String),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) => EXIT_USAGE,
            CliError::Analysis(_) => EXIT_INPUT,
        }
    }
}

type CliResult<T> = std::result::Result<T, CliError>;

/// Positional arguments and `--key=value` options of one invocation.
struct Args {
    positional: Vec<String>,
    options: HashMap<String, String>,
}

impl Args {
    fn parse(args: &[String]) -> Self {
        let mut positional = Vec::new();
        let mut options = HashMap::new();
        for arg in args {
            if let Some(kv) = arg.strip_prefix("--") {
                if let Some((k, v)) = kv.split_once('=') {
                    options.insert(k.to_string(), v.to_string());
                } else {
                    options.insert(kv.to_string(), "true".to_string());
                }
            } else {
                positional.push(arg.clone());
            }
        }
        Self { positional, options }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).map_or(false, |v| v != "false")
    }

    fn require(&self, key: &str) -> CliResult<&str> {
        self.get(key)
            .ok_or_else(|| CliError::Usage(format!("missing --{}=<value>", key)))
    }

    fn input(&self, command: &str) -> CliResult<&str> {
        self.positional
            .first()
            .map(|s| s.as_str())
            .ok_or_else(|| CliError::Usage(format!("{} needs an input file", command)))
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> CliResult<T> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| CliError::Usage(format!("invalid value for --{}: {}", key, v))),
        }
    }
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = raw.split_first() else {
        eprintln!("Usage: powertrace <info|stats|ttest|cpa|simulate> [options]");
        std::process::exit(EXIT_USAGE);
    };
    let args = Args::parse(rest);

    let outcome = match command.as_str() {
        "info" => run_info(&args),
        "stats" => run_stats(&args),
        "ttest" => run_ttest(&args),
        "cpa" => run_cpa(&args),
        "simulate" => run_simulate(&args),
        other => Err(CliError::Usage(format!(
            "unknown command {}. Use info|stats|ttest|cpa|simulate",
            other
        ))),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

fn run_info(args: &Args) -> CliResult<i32> {
    let header = read_trs_header_file(args.input("info")?)?;

    println!("Traces:            {}", header.num_traces);
    println!("Samples per trace: {}", header.samples_per_trace);
    println!("Sample coding:     0x{:02X}", header.sample_coding);
    println!("Aux data length:   {}", header.aux_length);
    println!("Description:       {}", header.description);
    Ok(0)
}

#[derive(Serialize)]
struct TraceStats {
    num_traces: usize,
    average: Vec<f64>,
    standard_deviation: Vec<f64>,
    min: Vec<f64>,
    max: Vec<f64>,
    range: Vec<f64>,
}

fn run_stats(args: &Args) -> CliResult<i32> {
    let set = read_trs(args.input("stats")?)?;
    let out = args.require("out")?;

    let stats = TraceStats {
        num_traces: set.num_traces(),
        average: set.average_trace()?.to_vec(),
        standard_deviation: set.standard_deviation()?.to_vec(),
        min: set.min_trace()?.to_vec(),
        max: set.max_trace()?.to_vec(),
        range: set.range_trace()?.to_vec(),
    };
    write_json(&stats, out)?;

    log::info!("Statistics over {} traces written to {}", stats.num_traces, out);
    Ok(0)
}

fn read_trs(path: &str) -> CliResult<TraceSet> {
    let bar = progress_bar();
    let set = TrsReader::open(path)?.read_trace_set(&bar)?;
    bar.finish_and_clear();
    Ok(set)
}

fn load_set(path: &str, format: &str) -> CliResult<TraceSet> {
    match format {
        "trs" => read_trs(path),
        "stream" => Ok(StreamReader::open(path, RecordLayout::SamplesOnly)?.into_trace_set()?),
        other => Err(CliError::Usage(format!(
            "unknown --format={}, expected trs or stream",
            other
        ))),
    }
}

/// Read a mask file: one `1` (fixed) or `0` (random) per trace, whitespace
/// ignored.
fn load_mask(path: &str) -> CliResult<Vec<bool>> {
    let text = std::fs::read_to_string(path).map_err(|e| AnalysisError::file_io(path, e))?;
    text.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '1' => Ok(true),
            '0' => Ok(false),
            other => Err(AnalysisError::Format(format!("invalid mask character {:?}", other)).into()),
        })
        .collect()
}

#[derive(Serialize)]
struct TTestDump {
    order: TTestOrder,
    fixed_traces: usize,
    random_traces: usize,
    passed: bool,
    #[serde(with = "ttest::t_value")]
    max_t: f64,
    #[serde(with = "ttest::t_value")]
    min_t: f64,
    threshold: f64,
    leaking_samples: Vec<usize>,
    #[serde(with = "ttest::t_values")]
    t: Vec<f64>,
}

fn run_ttest(args: &Args) -> CliResult<i32> {
    let format = args.get("format").unwrap_or("trs");
    let order = if args.flag("second-order") {
        TTestOrder::Second
    } else {
        TTestOrder::First
    };
    let threshold = args.parse_or("critical-value", DEFAULT_CRITICAL_VALUE)?;
    if !(threshold.is_finite() && threshold > 0.0) {
        return Err(CliError::Usage(format!("invalid critical value {}", threshold)));
    }

    let (fixed, random) = match (args.get("traces"), args.get("mask")) {
        (Some(traces), Some(mask)) => {
            let set = load_set(traces, format)?;
            set.partition(&load_mask(mask)?)?
        }
        (None, None) => (
            load_set(args.require("fixed")?, format)?,
            load_set(args.require("random")?, format)?,
        ),
        _ => {
            return Err(CliError::Usage(
                "--traces and --mask must be given together".to_string(),
            ))
        }
    };

    let test = WelchTTest::new(&fixed, &random, order)?;
    let verdict = test.evaluate(threshold);

    println!("max t = {:.4}, min t = {:.4}", verdict.max_t, verdict.min_t);
    if verdict.passed {
        println!("PASS: no sample reaches |t| >= {}", threshold);
    } else {
        println!(
            "FAIL: {} leaking samples, first at {:?}",
            verdict.leaking_samples.len(),
            verdict.leaking_samples.first()
        );
    }

    if let Some(dump) = args.get("dump") {
        let (fixed_traces, random_traces) = test.counts();
        write_json(
            &TTestDump {
                order,
                fixed_traces,
                random_traces,
                passed: verdict.passed,
                max_t: verdict.max_t,
                min_t: verdict.min_t,
                threshold,
                leaking_samples: verdict.leaking_samples.clone(),
                t: test.ttrace().to_vec(),
            },
            dump,
        )?;
    }

    Ok(if verdict.passed { 0 } else { EXIT_LEAKAGE })
}

fn parse_key(hex_key: &str) -> CliResult<Vec<u8>> {
    hex::decode(hex_key).map_err(|e| CliError::Usage(format!("invalid hex key {}: {}", hex_key, e)))
}

fn run_cpa(args: &Args) -> CliResult<i32> {
    let set = read_trs(args.input("cpa")?)?;
    let config = match args.get("config") {
        Some(path) => AnalysisConfig::from_json_file(path)?.cpa,
        None => AnalysisConfig::default().cpa,
    };
    let expected = args.get("expected-key").map(parse_key).transpose()?;

    let engine = CpaEngine::new(&set, config)?;
    log::info!(
        "Attacking {} key bytes over {} traces x {} samples",
        engine.config().key_bytes,
        engine.num_traces(),
        engine.num_samples()
    );
    let bar = progress_bar();
    let attack = engine.attack(&bar, &CancelToken::new())?;
    bar.finish_and_clear();

    println!("{}", attack.hex());
    if let Some(expected) = expected {
        let score = attack.score(&expected)?;
        println!("score: {:.2}%  ranks: {:?}", score, attack.ranks(&expected));
    }

    if let Some(dump) = args.get("dump") {
        write_json(&attack, dump)?;
    }
    Ok(0)
}

fn run_simulate(args: &Args) -> CliResult<i32> {
    let out = args.require("out")?;
    let defaults = SyntheticCpaConfig::default();
    let config = SyntheticCpaConfig {
        num_traces: args.parse_or("traces", defaults.num_traces)?,
        num_samples: args.parse_or("samples", defaults.num_samples)?,
        key: match args.get("key") {
            Some(k) => parse_key(k)?,
            None => defaults.key.clone(),
        },
        seed: args.parse_or("seed", defaults.seed)?,
        ..defaults
    };

    let set = cpa_trace_set(&config)?;
    write_trs_file(&set, out)?;
    log::info!(
        "Wrote {} synthetic traces with key {} to {}",
        set.num_traces(),
        hex::encode(&config.key),
        out
    );
    Ok(0)
}

fn write_json<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> CliResult<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| AnalysisError::file_io(path, e))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value).map_err(AnalysisError::from)?;
    Ok(())
}
