fn main() {
    let args = libsdtconvert::args::Args::parse_or_exit();

    if let Err(error) = libsdtconvert::run(&args) {
        libsdtconvert::error::report_error_and_exit(&error);
    }
}
