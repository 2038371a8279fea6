use anyhow::{Context, Result};
use clap::Parser;
use converter::{
    config::ConverterConfig,
    session::{InputFile, SessionSnapshot, SessionStatus},
    sidecar, ConverterContext,
};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use tokio::sync::watch;

/// Convert an MKV file to a broadly compatible MP4
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input MKV file
    input: PathBuf,

    /// Output file or directory (defaults to next to the input)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Attempt the conversion even if analysis reports an unsupported codec
    #[arg(long)]
    force: bool,

    /// Print the final session state as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger - use RUST_LOG env var or default to info level
    let mut logger = env_logger::Builder::from_default_env();
    logger.format_timestamp_secs();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(log::LevelFilter::Info);
    }
    logger.init();

    // Load configuration
    let mut cfg = ConverterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if args.force {
        cfg.block_unsupported = false;
    }

    info!("MKV to MP4 converter starting");
    debug!("  FFmpeg binary: {}", cfg.ffmpeg_bin.display());
    debug!("  Accepted extensions: {:?}", cfg.accepted_extensions);
    debug!("  Block unsupported codecs: {}", cfg.block_unsupported);

    let ctx = ConverterContext::new(cfg);
    if let Err(e) = ctx.ensure_ready().await {
        error!("❌ {}", e);
        eprintln!();
        eprintln!("========================================");
        eprintln!("  {}", e);
        eprintln!("  Check that ffmpeg is installed and on PATH,");
        eprintln!("  or set ffmpeg_bin in the config file.");
        eprintln!("========================================");
        std::process::exit(2);
    }

    let bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("Failed to read input: {}", args.input.display()))?;
    let display_name = args
        .input
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    info!("📂 {} ({})", display_name, format_size(bytes.len() as u64, DECIMAL));

    let mut session = ctx.new_session();
    if let Err(e) = session.submit_file(InputFile::new(display_name, bytes)).await {
        error!("❌ {}", e);
        std::process::exit(1);
    }

    let diagnosis = session.diagnosis();
    if diagnosis.is_unsupported() {
        warn!(
            "⚠️  Analysis found a codec the engine cannot decode ({})",
            diagnosis.codec_hint().unwrap_or("unknown")
        );
        if !args.force {
            warn!("   Re-run with --force to attempt the conversion anyway");
        }
    }

    let progress = tokio::spawn(report_progress(session.watch()));
    let outcome = session.convert().await.map(|artifact| artifact.clone());
    progress.abort();

    let snapshot = session.snapshot();
    let exit_code = match outcome {
        Ok(artifact) => {
            let out_path = sidecar::output_path_for(&args.input, &artifact, args.output.as_deref());
            sidecar::write_artifact(&out_path, &artifact)?;
            info!(
                "✅ Wrote {} ({}, {})",
                out_path.display(),
                format_size(artifact.len() as u64, DECIMAL),
                artifact.mime_type()
            );
            0
        }
        Err(e) => {
            error!("❌ Conversion failed: {}", e);
            write_failure_note(&args.input, &e.to_string(), &snapshot);
            1
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    ctx.shutdown();
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Log whole-percent progress steps while the session is processing
async fn report_progress(mut rx: watch::Receiver<SessionSnapshot>) {
    let mut last_reported: i64 = -1;
    while rx.changed().await.is_ok() {
        let (status, progress) = {
            let snap = rx.borrow_and_update();
            (snap.status, snap.progress)
        };
        if status != SessionStatus::Processing {
            continue;
        }
        let percent = progress.floor() as i64;
        if percent / 10 > last_reported / 10 || last_reported < 0 {
            info!("⏳ {}%", percent);
            last_reported = percent;
        }
    }
}

fn write_failure_note(input: &Path, reason: &str, snapshot: &SessionSnapshot) {
    match sidecar::write_why_txt(input, reason, &snapshot.log) {
        Ok(()) => info!("📝 Wrote {}", sidecar::why_txt_path(input).display()),
        Err(e) => warn!("Failed to write failure note: {:#}", e),
    }
}
