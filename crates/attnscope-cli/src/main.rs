use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use attnscope::{
    ChatMessage, Correlated, GenerationOutcome, Heatmap, InspectClient, InspectorBackend,
    InspectorConfig, InspectorSession, RenderMode, StepView, TokenTrack, build_track,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "attnscope")]
#[command(about = "Stream a traced generation and inspect its attention")]
struct Cli {
    /// Base URL of the inference server
    #[arg(long, global = true)]
    url: Option<String>,

    /// Maximum tokens to generate
    #[arg(long, global = true)]
    max_new_tokens: Option<usize>,

    /// Sampling temperature
    #[arg(long, global = true)]
    temperature: Option<f32>,

    /// Top-k sampling cutoff, 0 disables it
    #[arg(long, global = true)]
    top_k: Option<usize>,

    /// Sampling seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Layer whose attention is traced
    #[arg(long, global = true)]
    layer: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the inference server is up
    Health,

    /// Send one message and print the traced reply step by step
    Chat {
        /// Message to send
        prompt: String,

        /// Attention head to display
        #[arg(long, default_value_t = 0)]
        head: usize,

        /// Token rendering: ascii or utf-8
        #[arg(long, default_value = "ascii")]
        mode: RenderMode,

        /// Replay the finished generation at the tick rate
        #[arg(long)]
        replay: bool,

        /// Also fetch the full attention matrix and write it as PNG
        #[arg(long)]
        heatmap: Option<PathBuf>,
    },

    /// Render the full attention matrix of a prompt
    Heatmap {
        /// Prompt whose attention is rendered
        prompt: String,

        /// Attention head to render
        #[arg(long, default_value_t = 0)]
        head: usize,

        /// Output PNG path
        #[arg(long, short, default_value = "attention.png")]
        out: PathBuf,
    },
}

impl Cli {
    fn config(&self) -> anyhow::Result<InspectorConfig> {
        let config = InspectorConfig::from_env().context("Failed to read ATTNSCOPE_* settings")?;
        Ok(self.apply(config))
    }

    /// Flags given on the command line win over the environment.
    fn apply(&self, mut config: InspectorConfig) -> InspectorConfig {
        if let Some(url) = &self.url {
            config = config.api_base_url(url);
        }
        if let Some(max_new_tokens) = self.max_new_tokens {
            config = config.max_new_tokens(max_new_tokens);
        }
        if let Some(temperature) = self.temperature {
            config = config.temperature(temperature);
        }
        if let Some(top_k) = self.top_k {
            config = config.top_k((top_k > 0).then_some(top_k));
        }
        if let Some(seed) = self.seed {
            config = config.seed(seed);
        }
        if let Some(layer) = self.layer {
            config = config.trace_layer(layer);
        }
        config
    }
}

/// Line-oriented output that goes quiet after the first I/O error.
struct Echo<W: Write> {
    out: W,
    broken: bool,
}

impl<W: Write> Echo<W> {
    fn new(out: W) -> Self {
        Self { out, broken: false }
    }

    fn line(&mut self, text: &str) {
        if self.broken {
            return;
        }
        let written = writeln!(self.out, "{text}").and_then(|()| self.out.flush());
        if let Err(err) = written {
            warn!(error = %err, "output closed, no longer echoing");
            self.broken = true;
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = cli.config()?;
    let client = InspectClient::from_config(&config).context("Failed to create HTTP client")?;
    debug!(url = client.base_url(), "using inference server");

    match cli.command {
        Command::Health => {
            if client.health().await {
                println!("ok {}", client.base_url());
                Ok(())
            } else {
                bail!("inference server at {} is not healthy", client.base_url())
            }
        }
        Command::Chat {
            prompt,
            head,
            mode,
            replay,
            heatmap,
        } => run_chat(&client, &config, prompt, head, mode, replay, heatmap).await,
        Command::Heatmap { prompt, head, out } => {
            let request = config.full_attention_request(
                vec![
                    ChatMessage::system(config.system_prompt.clone()),
                    ChatMessage::user(prompt),
                ],
                head,
            );
            let matrix = client.full_attention(&request).await?;
            let heatmap = Heatmap::from_matrix(&matrix)?;
            write_heatmap(&heatmap, &out)
        }
    }
}

async fn run_chat(
    client: &InspectClient,
    config: &InspectorConfig,
    prompt: String,
    head: usize,
    mode: RenderMode,
    replay: bool,
    heatmap: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut session = InspectorSession::from_config(config);
    session.select_head(head);
    session.set_render_mode(mode);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let mut echo = Echo::new(io::stdout());
    let outcome = session
        .send(client, config, prompt, cancel.clone(), |effect, steps| {
            if let Correlated::Steps(range) = effect {
                for pointer in range.clone() {
                    if let Some(view) = StepView::build(steps, pointer, head, mode) {
                        echo.line(&format_step(&view));
                    }
                }
            }
        })
        .await;

    match outcome {
        GenerationOutcome::Completed { reply } => echo.line(&reply),
        GenerationOutcome::Cancelled { partial } => {
            info!(kept = partial.as_ref().map_or(0, String::len), "stopped");
            if let Some(partial) = partial {
                echo.line(&partial);
            }
        }
        GenerationOutcome::Failed { error } => {
            let message = error
                .surface()
                .map_or_else(|| error.to_string(), |surfaced| surfaced.message);
            bail!(message);
        }
    }

    let steps = session.steps().len();
    echo.line(&format!(
        "{steps} steps, layer {} head {head}/{} ({mode})",
        config.trace_layer,
        session.head_count()
    ));

    if replay && steps > 1 {
        let records = session.steps().to_vec();
        session.scrub(0);
        session.play();
        if let Some(track) = build_track(&records, 0, head, mode) {
            echo.line(&format_track(&track));
        }
        let stop = cancel.child_token();
        session
            .play_to_end(&stop, |pointer| {
                if let Some(track) = build_track(&records, pointer, head, mode) {
                    echo.line(&format_track(&track));
                }
            })
            .await;
    }

    if let Some(path) = heatmap {
        let heatmap = session.full_matrix(client, config).await?;
        write_heatmap(&heatmap, &path)?;
    }
    Ok(())
}

fn format_step(view: &StepView<'_>) -> String {
    let insight = &view.insight;
    let candidates: Vec<String> = insight
        .candidates
        .iter()
        .map(|c| {
            let marker = if c.chosen { "*" } else { "" };
            format!("{marker}{}:{:.1}%", c.display, c.percent)
        })
        .collect();
    format!(
        "{:>4} {:<6} H={:.2} conf={:.2} ({}) salient={:?} top=[{}]",
        view.pointer,
        view.record.token_display,
        insight.entropy,
        insight.confidence,
        insight.glow.label(),
        view.track.attention.salient,
        candidates.join(" "),
    )
}

fn format_track(track: &TokenTrack) -> String {
    let cells: String = track
        .cells
        .iter()
        .map(|cell| {
            if cell.current {
                format!("[{}]", cell.label)
            } else if cell.salient {
                format!("({})", cell.label)
            } else {
                cell.label.clone()
            }
        })
        .collect();
    match &track.decoded {
        Some(decoded) => format!("{decoded}\n  {cells}"),
        None => cells,
    }
}

fn write_heatmap(heatmap: &Heatmap, path: &Path) -> anyhow::Result<()> {
    heatmap
        .save_png(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    let labels: Vec<String> = heatmap
        .axis_labels()
        .iter()
        .map(|label| format!("{}={}", heatmap.offset() + label.position, label.text))
        .collect();
    println!(
        "wrote {} ({}x{} of {} tokens, layer {} head {})",
        path.display(),
        heatmap.size(),
        heatmap.size(),
        heatmap.total_tokens(),
        heatmap.layer(),
        heatmap.head(),
    );
    println!("labels: {}", labels.join(" "));
    Ok(())
}
