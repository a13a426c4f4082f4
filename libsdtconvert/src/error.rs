pub use anyhow::Context;
pub use anyhow::Error;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Reports a fatal error and terminates with a non-zero status. There is no
/// per-object recovery: a half-patched object must never survive a failed run.
pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("sdtconvert: error: {error:#}");
    std::process::exit(1);
}

/// Prints a warning. By using our own function for this, it'll be easier to
/// find places that issue warnings if we want to say have a flag to suppress
/// them.
pub(crate) fn warning(message: &str) {
    eprintln!("WARNING: sdtconvert: {message}");
}
