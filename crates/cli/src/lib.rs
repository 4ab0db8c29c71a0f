use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pdf_engine::{default_engine, OpenSource, ThumbnailSize};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use upload_model::{FileRecord, StageKind};
use upload_store::{
    uploaded_files, ParseFailurePolicy, PipelineConfig, UploadPipeline, MAX_PREVIEW_DIMENSION,
};

#[derive(Debug, Parser)]
#[command(name = "pdf-uploads")]
#[command(about = "Register PDF uploads and inspect the resulting file list")]
pub struct Cli {
    /// Log pipeline activity to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload files into a fresh registry and print it as JSON once parsing settles.
    List {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
        /// Skip preview rendering.
        #[arg(long)]
        no_preview: bool,
        /// Drop files that fail to parse instead of listing them as failed.
        #[arg(long)]
        drop_failed: bool,
        /// 1-based page rendered as the preview.
        #[arg(long)]
        preview_page: Option<u32>,
        /// TOML file with pipeline settings.
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Print a line to stderr for every registry change.
        #[arg(long)]
        watch: bool,
    },
    /// Render a preview PNG for a page.
    Preview {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 160, value_parser = preview_dimension())]
        width: u32,
        #[arg(long, default_value_t = 200, value_parser = preview_dimension())]
        height: u32,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct RecordOutput {
    name: String,
    url: String,
    stage: StageKind,
    num_pages: Option<u32>,
    selected_page: Option<u32>,
    has_preview: bool,
    error: Option<String>,
}

impl From<&FileRecord> for RecordOutput {
    fn from(record: &FileRecord) -> Self {
        Self {
            name: record.name.clone(),
            url: record.url.clone(),
            stage: record.stage.kind(),
            num_pages: record.num_pages(),
            selected_page: record.selected_page,
            has_preview: record.preview().is_some(),
            error: record.failure().map(ToOwned::to_owned),
        }
    }
}

struct ListOptions {
    no_preview: bool,
    drop_failed: bool,
    preview_page: Option<u32>,
    config: Option<PathBuf>,
    watch: bool,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_tracing(cli.verbose);

    match cli.command {
        Commands::List { files, no_preview, drop_failed, preview_page, config, watch } => {
            run_list(&files, ListOptions { no_preview, drop_failed, preview_page, config, watch })
        }
        Commands::Preview { file, page, width, height, output } => {
            run_preview(&file, page, width, height, output.as_deref())
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn preview_dimension() -> clap::builder::RangedI64ValueParser<u32> {
    clap::value_parser!(u32).range(1..=i64::from(MAX_PREVIEW_DIMENSION))
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn pipeline_config(options: &ListOptions) -> Result<PipelineConfig> {
    let config = match &options.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let mut config =
        config.apply_env(|key| std::env::var(key).ok()).context("invalid environment settings")?;

    if options.no_preview {
        config = config.with_previews(false);
    }
    if options.drop_failed {
        config = config.with_failure_policy(ParseFailurePolicy::Remove);
    }
    if let Some(page) = options.preview_page {
        if page == 0 {
            anyhow::bail!("--preview-page is 1-based and must be >= 1");
        }
        config = config.with_preview_page(page);
    }

    Ok(config)
}

fn run_list(files: &[PathBuf], options: ListOptions) -> Result<()> {
    for file in files {
        ensure_pdf_exists(file)?;
    }

    let config = pipeline_config(&options)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let records = runtime.block_on(async {
        let registry = uploaded_files();
        let _watch = options.watch.then(|| {
            registry.subscribe(|list: &Vec<FileRecord>| {
                let stages: Vec<&str> =
                    list.iter().map(|record| stage_label(record.stage.kind())).collect();
                eprintln!("files: [{}]", stages.join(", "));
            })
        });

        let pipeline = UploadPipeline::with_lopdf(registry.clone(), config)
            .context("failed to start upload pipeline")?;

        for file in files {
            let bytes =
                fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
            let size = bytes.len();
            let id = pipeline.register_bytes(display_name(file), bytes);
            debug!(record = %id, file = %file.display(), bytes = size, "file registered");
        }

        pipeline.settle().await;
        info!(records = registry.get().len(), "parsing settled");

        let snapshot = registry.get();
        Ok::<_, anyhow::Error>(snapshot.iter().map(RecordOutput::from).collect::<Vec<_>>())
    })?;

    let json = serde_json::to_string_pretty(&records)?;
    println!("{json}");

    Ok(())
}

fn run_preview(
    file: &Path,
    page: u32,
    width: u32,
    height: u32,
    output: Option<&Path>,
) -> Result<()> {
    ensure_pdf_exists(file)?;

    if page == 0 {
        anyhow::bail!("--page is 1-based and must be >= 1");
    }

    let engine = default_engine();
    let document = engine.open_source(OpenSource::from(file)).context("failed to open PDF")?;

    let page_index = page - 1;
    let image = document
        .render_thumbnail(page_index, ThumbnailSize { width_px: width, height_px: height })
        .context("failed to render preview")?;

    let output =
        output.map(ToOwned::to_owned).unwrap_or_else(|| default_preview_output(file, page));

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    image
        .save(&output)
        .with_context(|| format!("failed to write image to {}", output.display()))?;

    println!("{}", output.display());

    Ok(())
}

fn stage_label(kind: StageKind) -> &'static str {
    match kind {
        StageKind::Registered => "registered",
        StageKind::Parsed => "parsed",
        StageKind::Previewed => "previewed",
        StageKind::Failed => "failed",
    }
}

fn ensure_pdf_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn display_name(file: &Path) -> String {
    file.file_name()
        .and_then(|name| name.to_str())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| file.display().to_string())
}

fn default_preview_output(file: &Path, page: u32) -> PathBuf {
    let stem = file.file_stem().and_then(|name| name.to_str()).unwrap_or("preview");

    file.with_file_name(format!("{stem}-page-{page}.png"))
}
