//! Rewrites DTrace SDT probe call sites in relocatable ELF objects.
//!
//! Compilers lower SDT probe macros to plain calls against synthetic
//! `__dtrace_probe_<name>` symbols. This library walks an object's `.text`
//! relocations, replaces each such call with NOPs (or a `ret` for a tail
//! call), neutralizes the relocation, and appends a `set_sdt_instance_set`
//! linker set (plus its RELA companion) recording where each call site lives
//! so the kernel linker can re-enable it at runtime.

use crate::args::Args;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

pub mod args;
pub mod error;

pub(crate) mod arch;
pub(crate) mod elf;
pub(crate) mod instance_set;
pub(crate) mod rewrite;
pub(crate) mod x86_64;

pub use anyhow::bail;
pub use anyhow::ensure;

/// Processes each object in turn, sequentially and in place. The first fatal
/// error aborts the whole run; only the wrong-file-type skip is non-fatal.
pub fn run(args: &Args) -> error::Result {
    init_logging(args);
    for path in &args.objects {
        rewrite::process_object(path)?;
    }
    Ok(())
}

/// `-v` turns on the informational per-step events; otherwise the level comes
/// from the standard environment filter.
fn init_logging(args: &Args) {
    let filter = if args.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::from_default_env()
    };
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().without_time().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
