use clap::{Parser, Subcommand};
use station_flow::backend::MemoryBackend;
use station_flow::config::StationConfig;
use station_flow::library::Library;
use station_flow::logging;
use station_flow::sound::Sound;
use station_flow::station::{self, Station};
use station_flow::timecode::format_hms;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "stationflow", about = "Broadcast automation engine")]
struct Cli {
    /// Station config file (YAML)
    #[arg(short, long, default_value = "station.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign on, broadcast, and sign off on exit
    Run {
        /// Stop after this many seconds
        #[arg(long = "for")]
        duration: Option<u64>,
        /// Run without an audio device
        #[arg(long)]
        silent: bool,
    },
    /// Loudness-normalize the library and exit
    Normalize,
    /// List library categories with file counts and total length
    Scan,
    /// Print the effective configuration
    Config,
}

fn main() {
    let cli = Cli::parse();
    let config = match StationConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let log_file = config
        .paths
        .log
        .as_ref()
        .map(|dir| logging::log_file_path(dir, &config.station.name));
    if let Err(e) = logging::init(config.log_level(), log_file.as_deref()) {
        eprintln!("Error: cannot open log file: {}", e);
        std::process::exit(1);
    }

    match cli.command {
        Commands::Run { duration, silent } => {
            let opened = if silent {
                Station::new(config, Arc::new(MemoryBackend::new()))
            } else {
                Station::open(config)
            };
            let mut station = match opened {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = station.run(duration.map(Duration::from_secs)) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
            if let Err(e) = station.sign_off() {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }

        Commands::Normalize => match station::normalize_library(&config) {
            Ok(report) => {
                println!(
                    "Normalized: {} | Conformant: {} | Skipped: {} | Failed: {} | Timed out: {}",
                    report.normalized,
                    report.conformant,
                    report.skipped,
                    report.failed,
                    report.timed_out
                );
                if report.aborted {
                    println!("Batch abandoned before every file finished.");
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },

        Commands::Scan => {
            let library = Library::new(&config.paths.lib, &config.audio.formats);
            let categories = library.categories();
            if categories.is_empty() {
                println!("No categories in '{}'.", library.root().display());
                return;
            }
            for category in categories {
                let files = library.list(&category);
                let total: f64 = files
                    .iter()
                    .filter_map(|path| Sound::new(path).duration().ok())
                    .map(|d| d.as_secs_f64())
                    .sum();
                println!(
                    "{:<16} {:>4} file(s)  {}",
                    category,
                    files.len(),
                    format_hms(total).unwrap_or_else(|_| "?:??:??".into())
                );
            }
        }

        Commands::Config => match config.to_yaml() {
            Ok(yaml) => print!("{}", yaml),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
    }
}
