//! # lazy-run
//!
//! Runs a static executable under the demand-paging loader and prints its
//! page statistics.

mod logger;

use crate::logger::{LOG_ENV, StderrLogger};
use loader_runtime::{FragmentationModel, Loader, LoaderConfig, RunMode};
use log::{LevelFilter, debug};
use std::error::Error;
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use std::{env, fmt};

const USAGE: &str = "\
usage: lazy-run [OPTIONS] <binary>

options:
  --mode replay|single-shot          stop after the first fault or replay until the entry returns [default: replay]
  --fragmentation tail-page|per-fault  how internal fragmentation is charged [default: tail-page]
  --log-level LEVEL                  off, error, warn, info, debug, trace [env: LAZY_RUN_LOG, default: info]
  --compare                          also run the binary natively and report its exit status
  -h, --help                         print this help";

struct Args {
    binary: PathBuf,
    config: LoaderConfig,
    log_level: LevelFilter,
    compare: bool,
}

#[derive(Debug)]
enum ArgsError {
    Help,
    Invalid(String),
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Help => f.write_str("help requested"),
            Self::Invalid(msg) => f.write_str(msg),
        }
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, ArgsError> {
    let mut binary = None;
    let mut config = LoaderConfig::default();
    let mut log_level = None;
    let mut compare = false;

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| ArgsError::Invalid(format!("{flag} needs a value")))
        };

        match arg.as_str() {
            "-h" | "--help" => return Err(ArgsError::Help),
            "--compare" => compare = true,
            "--mode" => {
                let mode = value("--mode")?
                    .parse::<RunMode>()
                    .map_err(|e| ArgsError::Invalid(e.to_string()))?;
                config = config.with_mode(mode);
            }
            "--fragmentation" => {
                let model = value("--fragmentation")?
                    .parse::<FragmentationModel>()
                    .map_err(|e| ArgsError::Invalid(e.to_string()))?;
                config = config.with_fragmentation(model);
            }
            "--log-level" => {
                let raw = value("--log-level")?;
                log_level = Some(parse_level(&raw)?);
            }
            flag if flag.starts_with('-') => {
                return Err(ArgsError::Invalid(format!("unknown option {flag}")));
            }
            path => {
                if binary.replace(PathBuf::from(path)).is_some() {
                    return Err(ArgsError::Invalid("only one binary may be given".into()));
                }
            }
        }
    }

    let binary = binary.ok_or_else(|| ArgsError::Invalid("missing <binary>".into()))?;
    let log_level = match log_level {
        Some(level) => level,
        None => match env::var(LOG_ENV) {
            Ok(raw) => parse_level(&raw)?,
            Err(_) => LevelFilter::Info,
        },
    };

    Ok(Args {
        binary,
        config,
        log_level,
        compare,
    })
}

fn parse_level(raw: &str) -> Result<LevelFilter, ArgsError> {
    raw.parse()
        .map_err(|_| ArgsError::Invalid(format!("invalid log level `{raw}`")))
}

fn main() -> ExitCode {
    let args = match parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(ArgsError::Help) => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            eprintln!("lazy-run: {err}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    if let Err(err) = StderrLogger::new(args.log_level).init() {
        eprintln!("lazy-run: failed to install logger: {err}");
    }

    let report = match Loader::prepare(&args.binary, args.config).and_then(Loader::run) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("lazy-run: {} failed: {}", err.phase(), error_chain(&err));
            return ExitCode::FAILURE;
        }
    };

    println!("{}", report.stats);
    debug!(
        "mode={} replays={} completed={}",
        report.mode, report.replays, report.completed
    );

    if args.compare {
        match Command::new(&args.binary).status() {
            Ok(status) => match status.code() {
                Some(code) => println!("Native exit status: {code}"),
                None => println!("Native run terminated by {status}"),
            },
            Err(err) => {
                eprintln!("lazy-run: failed to run {} natively: {err}", args.binary.display());
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

/// `outer: inner: root cause`
fn error_chain(err: &dyn Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
