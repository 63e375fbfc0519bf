//! weir-run: run a pipeline of commands from the command line.
//!
//! Usage:
//!   weir-run [--input FILE] [--capacity N] [--cwd DIR] 'cmd args' ['cmd args' ...]
//!
//! Each positional argument is one stage, split on whitespace. Stages read
//! the previous stage's stdout; the first reads FILE or stdin and the last
//! writes to stdout. The exit code is that of the last stage.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use weir_kernel::{ShellConfig, ShellContext, Source, Stage};

#[derive(Debug, Default, PartialEq)]
struct Invocation {
    input: Option<PathBuf>,
    capacity: Option<usize>,
    cwd: Option<PathBuf>,
    stages: Vec<Vec<String>>,
}

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(ExitCode::SUCCESS);
    }
    let invocation = parse_args(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    let code = runtime.block_on(execute(invocation));
    // A stdin source may still be parked in a blocking read.
    runtime.shutdown_timeout(Duration::from_millis(100));

    Ok(ExitCode::from(exit_status(code?)))
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut invocation = Invocation::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--input" | "-i" => {
                let path = iter.next().context("--input requires a file argument")?;
                invocation.input = Some(PathBuf::from(path));
            }
            "--capacity" => {
                let n = iter.next().context("--capacity requires a number")?;
                let n = n
                    .parse::<usize>()
                    .with_context(|| format!("invalid capacity: {n}"))?;
                invocation.capacity = Some(n);
            }
            "--cwd" => {
                let dir = iter.next().context("--cwd requires a directory")?;
                invocation.cwd = Some(PathBuf::from(dir));
            }
            flag if flag.starts_with("--") => bail!("unknown option: {flag}"),
            stage => {
                let words: Vec<String> = stage.split_whitespace().map(String::from).collect();
                if words.is_empty() {
                    bail!("empty stage");
                }
                invocation.stages.push(words);
            }
        }
    }
    if invocation.stages.is_empty() {
        bail!("no stages given");
    }
    Ok(invocation)
}

async fn execute(invocation: Invocation) -> Result<Option<i32>> {
    let mut config = ShellConfig::named("weir-run");
    if let Some(capacity) = invocation.capacity {
        config = config.with_channel_capacity(capacity);
    }
    let mut shell = ShellContext::new(config);
    if let Some(dir) = &invocation.cwd {
        shell.cd(dir)?;
    }

    let source = match invocation.input {
        Some(path) => Source::file(path),
        None => Source::stream(tokio::io::stdin()),
    };
    let mut pipeline = shell.pipeline(source)?;
    for words in &invocation.stages {
        let (program, args) = words
            .split_first()
            .context("stage has no program")?;
        tracing::debug!(%program, ?args, "adding stage");
        pipeline.through(shell.command(program.as_str(), args.iter().cloned()))?;
    }
    pipeline.to(Stage::stream(tokio::io::stdout()))?;

    pipeline.wait().await?;
    Ok(pipeline.exit_code())
}

/// Process exit status for the last stage's code. A stage that was killed
/// without a code counts as a failure.
fn exit_status(code: Option<i32>) -> u8 {
    match code {
        Some(code) => (code & 0xff) as u8,
        None => 1,
    }
}

fn print_help() {
    println!(
        r#"weir-run {}

Run a pipeline of commands, wired stdout to stdin over bounded channels.

USAGE:
    weir-run [OPTIONS] STAGE [STAGE ...]

Each STAGE is one command line, split on whitespace.

OPTIONS:
    -i, --input FILE    Read the first stage's input from FILE (default: stdin)
    --capacity N        Bytes buffered between stages (default: 512)
    --cwd DIR           Working directory for every stage
    -h, --help          Show this help

EXAMPLE:
    weir-run -i notes.txt 'grep -i todo' 'sort' 'uniq -c'"#,
        env!("CARGO_PKG_VERSION")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_stages_split_on_whitespace() {
        let parsed = parse_args(&args(&["grep -i  orem", "cat"])).unwrap();
        assert_eq!(
            parsed.stages,
            vec![
                vec!["grep".to_string(), "-i".to_string(), "orem".to_string()],
                vec!["cat".to_string()],
            ]
        );
        assert_eq!(parsed.input, None);
    }

    #[test]
    fn test_options() {
        let parsed =
            parse_args(&args(&["--input", "in.txt", "--capacity", "8", "--cwd", "/tmp", "wc -l"]))
                .unwrap();
        assert_eq!(parsed.input, Some(PathBuf::from("in.txt")));
        assert_eq!(parsed.capacity, Some(8));
        assert_eq!(parsed.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(parsed.stages.len(), 1);
    }

    #[test]
    fn test_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["   "])).is_err());
        assert!(parse_args(&args(&["--capacity", "lots", "cat"])).is_err());
        assert!(parse_args(&args(&["--input"])).is_err());
        assert!(parse_args(&args(&["--bogus", "cat"])).is_err());
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(Some(0)), 0);
        assert_eq!(exit_status(Some(137)), 137);
        assert_eq!(exit_status(Some(256 + 3)), 3);
        assert_eq!(exit_status(None), 1);
    }
}
