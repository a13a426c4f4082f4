//! Command line definitions for the probe-site rewriter.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sdtconvert",
    version,
    about = "Rewrite DTrace SDT probe call sites in relocatable ELF objects"
)]
pub struct Args {
    /// Report each created section, patched call site and matched probe.
    #[arg(short, long)]
    pub verbose: bool,

    /// Relocatable object files to rewrite in place.
    #[arg(required = true, value_name = "OBJ")]
    pub objects: Vec<PathBuf>,
}

impl Args {
    /// Parses the command line. Usage errors print to stderr and exit with
    /// status 1; `--help` and `--version` keep their conventional exit 0.
    pub fn parse_or_exit() -> Args {
        match Args::try_parse() {
            Ok(args) => args,
            Err(error) if error.use_stderr() => {
                let _ = error.print();
                std::process::exit(1);
            }
            Err(error) => error.exit(),
        }
    }
}
