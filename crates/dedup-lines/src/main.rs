use anyhow::{Context, Result};
use clap::Parser;
use dispatch_core::{read_lines, DedupReport};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "dedup-lines")]
#[command(about = "Removes blank and duplicate lines from a question file, keeping first-seen order")]
struct Args {
    /// File to read, one entry per line
    #[arg(long, default_value = "questions.txt")]
    input: PathBuf,

    /// File to write the unique lines to
    #[arg(long, default_value = "questionnew.txt")]
    output: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let report = rewrite(&args.input, &args.output)?;
    print_report(&report, &args.output);

    Ok(())
}

fn rewrite(input: &Path, output: &Path) -> Result<DedupReport> {
    let (unique, report) =
        read_lines(input).with_context(|| format!("Failed to read {:?}", input))?;

    let mut contents = unique.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    std::fs::write(output, contents).with_context(|| format!("Failed to write {:?}", output))?;

    Ok(report)
}

fn print_report(report: &DedupReport, output: &Path) {
    println!("\n=== Dedup Summary ===");
    println!("Lines read: {}", report.total_lines);
    println!("Blank lines: {}", report.blank_lines);
    println!("Unique lines: {}", report.unique);
    println!("Duplicates removed: {}", report.duplicates);
    if !report.repeated.is_empty() {
        println!("Repeated values:");
        for value in &report.repeated {
            println!("  {value}");
        }
    }
    println!("Written to {}", output.display());
    println!();
}
