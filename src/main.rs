//! cloud-chamber
//!
//! Trace the execution of programs one machine instruction at a time and
//! emit a control-flow graph of what actually ran. Each non-empty line of
//! the input file names one command to trace; every run feeds the same
//! graph, so divergent paths across runs accumulate.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use env_logger::Env;

use cloud_chamber::blocks::{self, FunctionGraph};
use cloud_chamber::cfg::CfgBuilder;
use cloud_chamber::decoder::{CapstoneDecoder, Syntax};
use cloud_chamber::format::OutputFormat;
use cloud_chamber::parser::inspect_executable;
use cloud_chamber::tracer;
use cloud_chamber::TraceError;

#[derive(Parser)]
#[command(
    name = "cloud-chamber",
    version,
    about = "Trace a program's execution and build a CFG of the instructions it actually ran"
)]
struct Cli {
    /// File listing one command per line: an executable path followed by its arguments
    input: PathBuf,

    /// Write the instruction listing and statistics to FILE (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Write the rendered graph to FILE
    #[arg(short, long, value_name = "FILE", default_value = "cfg.gv")]
    graph: PathBuf,

    /// Disassembly syntax flavor
    #[arg(long, value_enum, default_value_t = Syntax::Att)]
    syntax: Syntax,

    /// Graph output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Dot)]
    format: OutputFormat,

    /// Discovery-order index of the function to render (0 = program entry)
    #[arg(long, default_value_t = 0, conflicts_with = "all")]
    function: usize,

    /// Render every discovered function
    #[arg(long)]
    all: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    if let Err(e) = run(&cli) {
        eprintln!("cloud-chamber: error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), TraceError> {
    let input = fs::read_to_string(&cli.input)?;

    let mut listing: BufWriter<Box<dyn Write>> = BufWriter::new(match &cli.output {
        Some(path) => Box::new(fs::File::create(path)?),
        None => Box::new(io::stdout()),
    });

    let mut builder = CfgBuilder::new();

    for line in input.lines() {
        let argv = tracer::split_command(line);
        if argv.is_empty() {
            continue;
        }

        let target = inspect_executable(Path::new(&argv[0]))?;
        let decoder = CapstoneDecoder::for_architecture(target.architecture, cli.syntax)?;
        log::info!(
            "tracing '{}' ({}, entry 0x{:x})",
            argv.join(" "),
            target.architecture,
            target.entry_point
        );
        writeln!(listing, "cloud-chamber: starting to trace '{}'\n", argv.join(" "))?;

        builder.start_path();
        let stats = tracer::run(&argv, &decoder, &mut builder, &mut listing)?;

        writeln!(
            listing,
            "\n\tStatistics about this run\n\
             \t=========================\n\
             * instructions executed: {}\n\
             * unique instructions:   {}\n\
             * index buckets:         {}\n\
             * index collisions:      {}\n",
            stats.executed,
            builder.index().entries(),
            builder.index().bucket_count(),
            builder.index().collisions(),
        )?;
    }
    listing.flush()?;

    let cfg = builder.finish();
    let graphs: Vec<FunctionGraph> = if cli.all {
        blocks::synthesize_all(&cfg)
    } else {
        let graph = blocks::synthesize_function(&cfg, cli.function).ok_or_else(|| {
            TraceError::Generic(format!(
                "no function with index {} (discovered {})",
                cli.function,
                cfg.roster().len()
            ))
        })?;
        vec![graph]
    };

    let rendered = cli.format.get_formatter().format(&graphs)?;
    fs::write(&cli.graph, rendered)?;
    log::info!(
        "wrote {} function graph(s) to {}",
        graphs.len(),
        cli.graph.display()
    );

    Ok(())
}
