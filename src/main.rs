//! Leafscan, on-device plant disease detection.

pub mod module;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::module::classes::CropType;
use crate::module::define;
use crate::module::scanner::Scanner;
use crate::module::util::init::resource::init;
use crate::module::util::init::LeafscanProperty;
use crate::module::vision::camera::{FrameSource, StillFrames, V4l2Camera};
use crate::module::vision::preprocess::Preprocessor;

#[derive(Parser, Debug)]
#[command(name = "leafscan", version, about = "On-device plant disease detection")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Diagnose a single photo.
    Scan {
        image: PathBuf,
        /// Only accept diseases of this crop.
        #[arg(long)]
        crop: Option<CropType>,
    },
    /// Live detection from the camera.
    Live {
        #[arg(long)]
        crop: CropType,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Replay these images instead of the camera.
        #[arg(long, num_args = 1..)]
        replay: Vec<PathBuf>,
        /// Keep cycling the replayed images.
        #[arg(long = "loop")]
        looped: bool,
    },
    /// Print the remedies for a disease.
    Remedies { disease: String },
}

pub fn main() {
    let cli = Cli::parse();

    let property = match init() {
        Ok(property) => property,
        Err(e) => {
            eprintln!("Can't prepare resources: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = init_log(
        property.path.dir.data.as_str(),
        define::system::NAME,
        &property.conf.system.log_level,
    ) {
        eprintln!("Can't initialize logging: {}", e);
    }
    log::info!("Starting Leafscan...");

    if let Err(e) = run(cli.command, &property) {
        log::error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run(command: Command, property: &LeafscanProperty) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Scan { image, crop } => {
            let scanner = Scanner::from_config(&property.conf, None)?;
            let diagnosis = match scanner.diagnose_path(&image, crop) {
                Ok(diagnosis) => diagnosis,
                Err(e) => {
                    log::error!("Scan failed: {}", e);
                    let status = scanner.registry_status();
                    if !status.unavailable.is_empty() {
                        log::warn!("Unavailable models: {:?}", status.unavailable);
                    }
                    return Err(e.user_message().into());
                }
            };
            match diagnosis {
                Some(diagnosis) => println!("{}", serde_json::to_string_pretty(&diagnosis)?),
                None => println!("No confident detection."),
            }
            scanner.shutdown();
        }
        Command::Live {
            crop,
            seconds,
            replay,
            looped,
        } => {
            let conf = &property.conf;
            let frames: Box<dyn FrameSource> = if replay.is_empty() {
                Box::new(V4l2Camera::new(
                    &conf.camera.device,
                    (conf.camera.width, conf.camera.height),
                    Some(PathBuf::from(&property.path.img.last)),
                )?)
            } else {
                let images = replay
                    .iter()
                    .map(|path| Preprocessor::open(path))
                    .collect::<Result<Vec<_>, _>>()?;
                match looped {
                    true => Box::new(StillFrames::repeating(images)),
                    false => Box::new(StillFrames::once(images)),
                }
            };
            let scanner = Scanner::from_config(conf, Some(frames))?;
            let updates = scanner.subscribe()?;
            scanner.start_live(Some(crop))?;

            let deadline = Instant::now() + Duration::from_secs(seconds);
            while let Some(left) = deadline.checked_duration_since(Instant::now()) {
                let Ok(update) = updates.recv_timeout(left) else {
                    break;
                };
                println!(
                    "#{} {} {} boxes",
                    update.cycle,
                    update.captured_at.format("%H:%M:%S%.3f"),
                    update.boxes.len()
                );
                for b in &update.boxes {
                    let (x, y, w, h) = b.to_display(conf.camera.width, conf.camera.height);
                    println!("  {} {:.2} at ({}, {}) {}x{}", b.label, b.confidence, x, y, w, h);
                }
            }

            println!("last {} boxes", scanner.live_boxes().len());
            if scanner.is_live() {
                scanner.stop_live();
            }
            scanner.shutdown();
            if let Some(stats) = scanner.live_stats() {
                println!(
                    "frames {} with detections {} dropped {} failed {}",
                    stats.frames_processed,
                    stats.frames_with_detections,
                    stats.ticks_dropped,
                    stats.tick_failures
                );
            }
        }
        Command::Remedies { disease } => {
            let resolver = module::remedy::RemedyResolver::new();
            if !resolver.is_known(&disease) {
                println!("No specific advice for '{}', general care:", disease.trim());
            }
            for remedy in resolver.resolve(&disease) {
                println!("- {}", remedy);
            }
        }
    }
    Ok(())
}

/// This function initializes the logger system using the log4rs crate.
///
/// # Arguments
/// * `dir` - Data directory, the log file goes to its `log` subdirectory
/// * `name` - Name of the log file
/// * `level` - Root level, e.g. `INFO`. Unknown values fall back to `INFO`
///
/// # Log Example
/// ```
/// log::debug!("Debug Message");
/// log::info!("Info Message");
/// log::warn!("Warning Message");
/// log::error!("Error Message");
/// ```
fn init_log(dir: &str, name: &str, level: &str) -> Result<(), Box<dyn std::error::Error>> {
    use crate::module::util::path::join;
    use log::LevelFilter;
    use log4rs::append::console::{ConsoleAppender, Target};
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let pattern = "{h({d} - {l}: {m}{n})}";
    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(join(&[
            dir,
            define::path::LOG_DIR,
            &format!("{}.log", name),
        ]))?;
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .target(Target::Stderr)
        .build();

    let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    let config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .appender(Appender::builder().build("console", Box::new(console)))
        .build(
            Root::builder()
                .appender("logfile")
                .appender("console")
                .build(level),
        )?;
    log4rs::init_config(config)?;
    Ok(())
}
