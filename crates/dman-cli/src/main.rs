use dman_core::logging;

mod cli;

use crate::cli::Cli;

fn main() {
    if let Err(e) = logging::init_logging() {
        eprintln!("dman: failed to initialize file logging ({e:#}), falling back to stderr");
        logging::init_logging_stderr();
    }

    if let Err(err) = Cli::run_from_args() {
        eprintln!("dman error: {:#}", err);
        std::process::exit(1);
    }
}
