//! Command-line front end: teach classes from folders of photos, analyze new photos.
//!
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::TimestampPrecision;
use reqwest::Client;
use teach_classify::{
    codec,
    history::HistoryStore,
    meter::METER,
    persistence::FileModelStore,
    trainer::TrainingReport,
    utils::fetch_extractor,
    Config, Engine,
};

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// JSON configuration file
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Path of the ONNX feature extractor
    #[clap(long, global = true)]
    extractor: Option<PathBuf>,

    /// URL to download the feature extractor from if it is missing
    #[clap(long, global = true)]
    extractor_url: Option<String>,

    /// Directory for saved classifiers and history
    #[clap(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Project name
    #[clap(long, global = true)]
    project: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a classifier from folders of example photos
    Teach {
        /// `name=dir`, repeated once per class
        #[clap(long = "class", value_parser = parse_class, required = true)]
        classes: Vec<(String, PathBuf)>,

        /// Save the trained classifier under this handle
        #[clap(long)]
        save: Option<String>,
    },
    /// Classify and count objects in photos with a saved classifier
    Analyze {
        /// Handle of the saved classifier
        #[clap(long)]
        load: String,

        #[clap(required = true)]
        photos: Vec<PathBuf>,

        /// Write annotated copies of the photos into this directory
        #[clap(long)]
        annotated_dir: Option<PathBuf>,

        /// Do not record the results in the history
        #[clap(long)]
        no_history: bool,
    },
    /// List or clear past analyses
    History {
        #[clap(long)]
        clear: bool,
    },
    /// Delete a saved classifier
    Forget {
        #[clap(long)]
        handle: String,
    },
}

fn parse_class(arg: &str) -> Result<(String, PathBuf), String> {
    match arg.split_once('=') {
        Some((name, dir)) if !name.trim().is_empty() && !dir.is_empty() => {
            Ok((name.trim().to_owned(), PathBuf::from(dir)))
        }
        _ => Err(format!("expected name=dir, got '{arg}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let config = build_config(&args)?;
    let store = FileModelStore::new(config.storage_dir());
    let history = HistoryStore::in_dir(config.storage_dir());

    match args.command {
        Command::Teach { classes, save } => {
            let engine = ready_engine(config).await?;
            let report = teach(engine.clone(), classes).await?;
            if let Some(last) = report.epochs.last() {
                println!(
                    "Trained on {} samples: loss {:.4}, accuracy {:.1}%",
                    report.samples,
                    last.loss,
                    last.accuracy * 100.0
                );
            }
            if let Some(handle) = save {
                engine.save_model(&store, &handle)?;
                println!("Saved classifier as '{handle}'");
            }
        }
        Command::Analyze {
            load,
            photos,
            annotated_dir,
            no_history,
        } => {
            let engine = ready_engine(config).await?;
            engine.load_model(&store, &load)?;
            if let Some(dir) = &annotated_dir {
                fs::create_dir_all(dir)?;
            }

            for photo in photos {
                let engine = engine.clone();
                let source = format!("photo:{}", photo.display());
                let stem = photo
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "photo".into());
                let (result, annotated) =
                    tokio::task::spawn_blocking(move || -> teach_classify::Result<_> {
                        let image = codec::decode_file(&photo)?;
                        engine.analyze(&image, &source)
                    })
                    .await??;

                if let Some(dir) = &annotated_dir {
                    let target = dir.join(format!("{stem}_annotated.jpg"));
                    annotated
                        .save(&target)
                        .with_context(|| format!("failed to write {}", target.display()))?;
                }
                if !no_history {
                    history.append(&result)?;
                }
                println!("{}: {result}", result.source);
            }
            METER.log_summary();
        }
        Command::History { clear } => match clear {
            true => {
                history.clear()?;
                println!("History cleared");
            }
            false => {
                for result in history.list()? {
                    println!(
                        "{} [{}] {}: {result}",
                        result.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        result.project,
                        result.source
                    );
                }
            }
        },
        Command::Forget { handle } => {
            let engine = Engine::new(config)?;
            engine.delete_model(&store, &handle)?;
            println!("Deleted classifier '{handle}'");
        }
    }

    Ok(())
}

/// Configuration file overlaid with command-line flags.
fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };

    if let Some(path) = &args.extractor {
        config.extractor.path = path.clone();
    }
    if let Some(url) = &args.extractor_url {
        config.extractor.url = Some(url.clone());
    }
    if let Some(dir) = &args.store_dir {
        config.storage.dir = Some(dir.clone());
    }
    if let Some(project) = &args.project {
        config.project = project.clone();
    }
    config.validate()?;

    Ok(config)
}

/// Engine with its extractor downloaded (if needed) and loaded.
async fn ready_engine(config: Config) -> Result<Arc<Engine>> {
    fetch_extractor(&Client::new(), &config.extractor).await?;

    let engine = Arc::new(Engine::new(config)?);
    {
        let engine = engine.clone();
        tokio::task::spawn_blocking(move || engine.load_extractor()).await??;
    }

    Ok(engine)
}

/// Add every photo of every class folder as a sample, then train.
async fn teach(engine: Arc<Engine>, classes: Vec<(String, PathBuf)>) -> Result<TrainingReport> {
    tokio::task::spawn_blocking(move || -> Result<TrainingReport> {
        for (name, dir) in &classes {
            engine.add_class(name)?;
            for path in image_files(dir)? {
                match codec::decode_file(&path) {
                    Ok(image) => {
                        engine.add_sample(name, &image)?;
                    }
                    Err(e) => log::warn!("Skipping {}: {e}", path.display()),
                }
            }
            log::info!("Class '{name}': {} samples", engine.sample_count(name));
        }

        Ok(engine.train()?)
    })
    .await?
}

/// Image files directly inside `dir`, sorted by name.
fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let mut files = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    files.sort();

    Ok(files)
}
