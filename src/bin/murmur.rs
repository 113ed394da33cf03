// The murmur command line: model management, one-shot transcription and the
// HTTP server, all over the same local service.

use std::fs::File;
use std::io::{self, Read, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use murmur::schema::ResponseFormat;
use murmur::server::ServerOptions;
use murmur::task::SegmentSink;
use murmur::{CancelToken, Config, Service, Task, TranscribeOptions, WhisperEngine, render};

#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(about = "Speech transcription and translation service", version)]
struct Cli {
    /// Model store directory.
    #[arg(long = "dir", env = "MURMUR_DIR", default_value = "models")]
    dir: PathBuf,

    /// Disable GPU acceleration.
    #[arg(long = "no-gpu", default_value_t = false)]
    no_gpu: bool,

    /// Enable debug output.
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Maximum number of concurrently loaded model contexts.
    #[arg(long = "max-concurrent", default_value_t = 2)]
    max_concurrent: usize,

    /// Silero VAD model used to skip silent segments.
    #[arg(long = "vad-model")]
    vad_model: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List installed models.
    Models,

    /// Download a model from the configured remote.
    Download {
        /// Path relative to the remote, e.g. `ggml-base.en-q5_1.bin`.
        path: String,
    },

    /// Delete an installed model.
    Delete {
        /// Model id (see `murmur models`).
        id: String,
    },

    /// Transcribe an audio file.
    Transcribe(TranscribeArgs),

    /// Translate an audio file to English.
    Translate(TranscribeArgs),

    /// Run the HTTP server.
    Server {
        /// Listen address.
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,

        /// Base path for the API endpoints.
        #[arg(long, default_value = "/v1")]
        endpoint: String,

        /// Maximum request body size (bytes).
        #[arg(long = "max-bytes", default_value_t = 100 * 1024 * 1024)]
        max_bytes: usize,
    },
}

#[derive(clap::Args, Debug)]
struct TranscribeArgs {
    /// Model id (see `murmur models`).
    model: String,

    /// Path to the audio file, or `-` for stdin.
    file: String,

    /// Source language, or `auto` to detect.
    #[arg(long, default_value = "auto")]
    language: String,

    /// Output format.
    #[arg(long, value_enum, default_value_t = ResponseFormat::Text)]
    format: ResponseFormat,

    /// Segment size in seconds.
    #[arg(long = "segment-size")]
    segment_size: Option<f64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    murmur::init_logging(cli.debug);

    let config = Config {
        store_dir: cli.dir.clone(),
        max_concurrent: cli.max_concurrent,
        gpu: if cli.no_gpu { -1 } else { 0 },
        debug: cli.debug,
        vad_model: cli.vad_model.clone(),
        ..Config::default()
    };

    let service = Arc::new(
        Service::new(config, Arc::new(WhisperEngine::new()))
            .context("failed to initialize service")?,
    );
    let cancel = CancelToken::new();

    match cli.command {
        Command::Models => list_models(&service),
        Command::Download { path } => download(&service, &path, &cancel),
        Command::Delete { id } => {
            service.delete_model(&id)?;
            println!("deleted {id}");
            Ok(())
        }
        Command::Transcribe(args) => transcribe(&service, &args, Task::Transcribe, &cancel),
        Command::Translate(args) => transcribe(&service, &args, Task::Translate, &cancel),
        Command::Server {
            listen,
            endpoint,
            max_bytes,
        } => run_server(service, listen, endpoint, max_bytes, cancel),
    }
}

fn list_models(service: &Service) -> Result<()> {
    let models = service.models();
    if models.is_empty() {
        println!("no models installed");
        return Ok(());
    }

    println!("{:<32} {:<40} {:>10}", "ID", "PATH", "SIZE");
    for model in models {
        println!(
            "{:<32} {:<40} {:>10}",
            model.id,
            model.path,
            human_size(model.size)
        );
    }
    Ok(())
}

fn download(service: &Service, path: &str, cancel: &CancelToken) -> Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {bytes}/{total_bytes} {bar:40.cyan/blue} {eta}")
            .expect("valid progress template")
            .progress_chars("#>-"),
    );

    let mut sized = false;
    let model = service.download_model(cancel, path, |current, total| {
        if total > 0 && !sized {
            pb.set_length(total);
            sized = true;
        }
        pb.set_position(current);
    })?;
    pb.finish_and_clear();

    println!("downloaded {} -> {} ({})", model.id, model.path, human_size(model.size));
    Ok(())
}

fn transcribe(
    service: &Service,
    args: &TranscribeArgs,
    task: Task,
    cancel: &CancelToken,
) -> Result<()> {
    let input = open_input(&args.file)?;
    let format = args.format;

    let options = TranscribeOptions {
        task,
        language: Some(args.language.clone()),
        temperature: None,
        initial_prompt: None,
        segment_duration: args.segment_size.map(Duration::from_secs_f64),
        emit_segments: format.wants_segments(),
    };

    // Subtitle and text outputs stream to stdout as segments finalise; the
    // JSON shapes print once at the end.
    let sink: Option<SegmentSink> = match format {
        ResponseFormat::Json | ResponseFormat::VerboseJson => None,
        ResponseFormat::Srt => {
            let mut index = 0u64;
            Some(Box::new(move |segment| {
                index += 1;
                print!("{}", render::srt_block(index, &segment));
                let _ = io::stdout().flush();
            }))
        }
        ResponseFormat::Vtt => {
            print!("{}", render::VTT_HEADER);
            Some(Box::new(|segment| {
                print!("{}", render::vtt_block(&segment));
                let _ = io::stdout().flush();
            }))
        }
        ResponseFormat::Text => Some(Box::new(|segment| {
            print!("{}", render::text_block(&segment));
            let _ = io::stdout().flush();
        })),
    };

    let result = service
        .transcribe(&args.model, input, &options, cancel, sink)
        .context("transcription failed")?;

    if matches!(format, ResponseFormat::Json | ResponseFormat::VerboseJson) {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

fn run_server(
    service: Arc<Service>,
    listen: String,
    endpoint: String,
    max_bytes: usize,
    shutdown: CancelToken,
) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(async {
        let options = ServerOptions {
            base_path: endpoint,
            max_body_bytes: max_bytes,
        };
        let app = murmur::server::router(Arc::clone(&service), shutdown.clone(), &options);

        let listener = tokio::net::TcpListener::bind(&listen)
            .await
            .with_context(|| format!("failed to bind {listen}"))?;
        tracing::info!(%listen, base = %options.base_path, "listening");

        let signal = async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            shutdown.cancel();
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .context("server error")?;

        service.close();
        Ok(())
    })
}

/// Open the input as a boxed reader; `-` streams stdin.
fn open_input(path: &str) -> Result<Box<dyn Read + Send + Sync>> {
    if path == "-" {
        Ok(Box::new(io::stdin()))
    } else {
        let file =
            File::open(path).with_context(|| format!("failed to open input file: {path}"))?;
        Ok(Box::new(file))
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
