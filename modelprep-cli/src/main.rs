use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use modelprep::pipeline::{ApproveAll, DeclineAll, Orchestrator, OverwritePrompt, StepSelect};
use modelprep::{PipelineConfig, PipelineRunSummary};

struct Args {
    /// Which pipeline step to run.
    step: StepSelect,

    /// Skip the benchmark and compare stages.
    skip_benchmark: bool,

    /// Directory that receives the produced files.
    out_dir: PathBuf,

    /// Export with a symbolic batch dimension.
    dynamic_batch: bool,

    /// Overwrite existing files without asking.
    yes: bool,

    /// Never overwrite existing files; decline every prompt.
    no_input: bool,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut step = StepSelect::All;
    let mut skip_benchmark = false;
    let mut out_dir = PathBuf::from("public/models");
    let mut dynamic_batch = false;
    let mut yes = false;
    let mut no_input = false;

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Long("step") => {
                step = parser
                    .value()?
                    .string()?
                    .parse()
                    .map_err(lexopt::Error::from)?
            }
            Long("skip-benchmark") => skip_benchmark = true,
            Long("out-dir") => out_dir = PathBuf::from(parser.value()?.string()?),
            Long("dynamic-batch") => dynamic_batch = true,
            Short('y') | Long("yes") => yes = true,
            Long("no-input") => no_input = true,
            Short('h') | Long("help") => {
                println!(
                    "Prepare and benchmark image-classifier artifacts for the web runtime.

Usage: {bin_name} [OPTIONS]

  --step <STEP>     Pipeline step to run: export, simplify, test, labels,
                    config or all (default: all)
  --skip-benchmark  Skip the benchmark and compare stages
  --out-dir <DIR>   Output directory (default: public/models)
  --dynamic-batch   Export with a symbolic batch dimension
  -y, --yes         Overwrite existing files without asking
  --no-input        Decline every overwrite instead of prompting
  -h, --help        Print help
",
                    bin_name = parser.bin_name().unwrap_or("modelprep")
                );
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    Ok(Args {
        step,
        skip_benchmark,
        out_dir,
        dynamic_batch,
        yes,
        no_input,
    })
}

/// Asks on stdin whether a file may be replaced. Anything other than an
/// explicit yes declines.
struct StdinPrompt;

impl OverwritePrompt for StdinPrompt {
    fn allow_overwrite(&mut self, path: &Path) -> bool {
        print!("{} exists. Overwrite? (y/n): ", path.display());
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut line = String::new();
        if io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_summary(summary: &PipelineRunSummary) {
    for report in &summary.stages {
        println!("{}: {}", report.stage, report.outcome);
    }

    if !summary.benchmarks.is_empty() {
        println!("\nlatency:");
        for (name, result) in &summary.benchmarks {
            println!("  {}: {}", name, result.stats);
        }
    }

    if let Some(comparison) = &summary.comparison {
        println!("\ncomparison:");
        for entry in &comparison.entries {
            match &entry.bench {
                Ok(result) => println!(
                    "  {} ({:.2} MB): {}",
                    file_label(&entry.path),
                    entry.size as f64 / BYTES_PER_MB,
                    result.stats
                ),
                Err(err) => println!("  {}: failed - {}", file_label(&entry.path), err),
            }
        }
        for path in &comparison.skipped {
            println!("  {}: skipped - not found", file_label(path));
        }
        if let [first, second, ..] = comparison.entries.as_slice() {
            if let (Ok(a), Ok(b)) = (&first.bench, &second.bench) {
                if b.stats.mean > 0.0 {
                    println!(
                        "  {} runs {:.2}x the speed of {}",
                        file_label(&second.path),
                        a.stats.mean / b.stats.mean,
                        file_label(&first.path)
                    );
                }
            }
        }
    }

    println!("\nfiles:");
    let mut total = 0u64;
    for file in &summary.files {
        match file.size {
            Some(size) => {
                total += size;
                println!(
                    "  {} ({:.2} MB)",
                    file_label(&file.path),
                    size as f64 / BYTES_PER_MB
                );
            }
            None => println!("  {} (missing)", file_label(&file.path)),
        }
    }
    println!("  total: {:.2} MB", total as f64 / BYTES_PER_MB);
}

fn run(args: &Args) -> Result<PipelineRunSummary, Box<dyn Error>> {
    fs::create_dir_all(&args.out_dir)?;

    let mut config = PipelineConfig::new(&args.out_dir);
    if args.dynamic_batch {
        config.input_spec = config.input_spec.with_symbolic_batch();
    }

    println!(
        "preparing {} artifacts in {}\n",
        config.model_name,
        config.out_dir.display()
    );

    let mut approve = ApproveAll;
    let mut decline = DeclineAll;
    let mut ask = StdinPrompt;
    let prompt: &mut dyn OverwritePrompt = if args.yes {
        &mut approve
    } else if args.no_input {
        &mut decline
    } else {
        &mut ask
    };

    let mut orchestrator = Orchestrator::new(config, prompt);
    let summary = orchestrator.run(args.step, args.skip_benchmark);
    print_summary(&summary);
    Ok(summary)
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args()?;
    let summary = run(&args)?;
    if !summary.success() {
        std::process::exit(i32::from(summary.exit_code()));
    }
    Ok(())
}
