use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use polycubes::enumerate::{gen, GenOptions};

#[derive(Parser)]
#[command(name = "polycubes")]
#[command(about = "Enumerate free polycubes of size N with disk-backed caching", long_about = None)]
struct Cli {
    /// Polycube size to compute
    #[arg(short = 'n', value_parser = clap::value_parser!(u8).range(1..=127))]
    n: u8,

    /// Worker threads for expansion
    #[arg(short = 't', default_value_t = 1)]
    threads: usize,

    /// Load cache files for smaller sizes when present
    #[arg(short = 'c', default_value_t = false)]
    use_cache: bool,

    /// Write a cache file for every computed size
    #[arg(short = 'w', default_value_t = false)]
    write_cache: bool,

    /// Write one cache file per output shape
    #[arg(short = 's', default_value_t = false)]
    split_cache: bool,

    /// Read per-shape cache files from the previous size
    #[arg(short = 'u', default_value_t = false)]
    use_split_cache: bool,

    /// Cache directory
    #[arg(short = 'f', default_value = "./cache/")]
    cache_dir: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut opts = GenOptions::new(&cli.cache_dir);
    opts.threads = cli.threads.max(1);
    opts.use_cache = cli.use_cache;
    opts.write_cache = cli.write_cache;
    opts.split_cache = cli.split_cache;
    opts.use_split_cache = cli.use_split_cache;

    match gen(cli.n as usize, &opts) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[cubes] ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}
