//! modelpack CLI
//!
//! EXIT CODES: 0 success, 1 failure, 2 invalid input

use clap::Parser;

use modelpack::cli::{self, Args};
use modelpack::logging;

fn main() {
    let args = Args::parse();

    if let Err(e) = logging::init(args.log_format, args.verbose) {
        eprintln!("Error: {}", e);
        std::process::exit(cli::EXIT_FAILURE);
    }

    std::process::exit(cli::run(args));
}
