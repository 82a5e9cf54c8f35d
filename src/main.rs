use std::path::PathBuf;

use clap::{AppSettings, Parser};
use log::{error, info};
use vec1::Vec1;

use tbf_mux::{
    buffer::DEFAULT_WINDOW_DEPTH,
    mux::{run_mux, GapPolicy, MuxConfig, DEFAULT_SCAN_FRAMES},
};

/// Given TBF files created by the on-line triggering system on ADP, combine
/// the files together into a single file that can be used like a standard
/// DR-recorded TBF file.
#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// The TBF files to combine.
    #[clap(required = true)]
    files: Vec<PathBuf>,

    /// Write the combined file to the provided filename. If not provided, the
    /// name is worked out from what the input file names have in common.
    /// Required with a single input.
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// The number of time tags to hold while waiting for late frames. Each
    /// is worth 40 microseconds of data.
    #[clap(long, default_value_t = DEFAULT_WINDOW_DEPTH)]
    window_depth: usize,

    /// Sort the frames for each time tag by channel.
    #[clap(long)]
    reorder: bool,

    /// What to do when missing frames can't be filled in because a channel
    /// hasn't been seen yet.
    #[clap(long, arg_enum, default_value = "abort")]
    on_gap: GapPolicy,

    /// The number of frames at the start of each file to look at when working
    /// out which channels the file carries.
    #[clap(long, default_value_t = DEFAULT_SCAN_FRAMES)]
    scan_frames: usize,

    /// Don't fill gaps from a frame more than this many time tag ticks older
    /// than the gap.
    #[clap(long)]
    max_template_age: Option<u64>,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,

    /// Disable progress bars.
    #[clap(long)]
    no_progress_bars: bool,
}

fn main() {
    let args = Args::parse();
    setup_logging(args.verbosity);

    let inputs = match Vec1::try_from_vec(args.files) {
        Ok(i) => i,
        Err(_) => {
            error!("No input files were given");
            std::process::exit(1);
        }
    };
    let config = MuxConfig {
        output: args.output,
        window_depth: args.window_depth,
        reorder: args.reorder,
        gap_policy: args.on_gap,
        scan_frames: args.scan_frames,
        max_template_age: args.max_template_age,
        progress_bars: !args.no_progress_bars,
        ..MuxConfig::new(inputs)
    };

    match run_mux(&config) {
        Ok(summary) => {
            let stats = summary.buffer;
            info!(
                "Wrote {} time tags ({} frames, {} filled) to '{}'",
                summary.written.sets,
                summary.written.frames,
                summary.written.fill_frames,
                summary.output.display()
            );
            info!(
                "Read {} frames; dropped {} malformed, {} duplicate, {} late",
                summary.frames_read, summary.malformed_frames, stats.duplicates, stats.late
            );
            if summary.skipped_gaps > 0 {
                info!("Skipped {} time tags that couldn't be filled", summary.skipped_gaps);
            }
            if summary.truncated {
                info!("The output was truncated at the first gap");
            }
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.init();
}
