use clap::Parser;
use log::{debug, LevelFilter};

mod args;
mod convert;

use crate::args::Args;

fn main() {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if args.verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
    debug!("args: {:?}", args);

    if let Err(e) = convert::run_cli(&args) {
        eprintln!("An error occured: {}", e);
        if let Some(report) = e.report() {
            eprintln!(
                "{} issues, {} errors, {} files written",
                report.issues.len(),
                report.errors().count(),
                report.files_written.len()
            );
        }
        std::process::exit(1);
    }
}
