use std::path::PathBuf;

use anyhow::Context;
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nano_specdec::hub::fetch_tokenizer;
use nano_specdec::{
    spawn_worker, BigramLm, CandleBackend, ChatTokenizer, ChatTurn, Command, EngineConfig, Event,
    EventKind, GenerationMachine, HfChatTokenizer, SessionId, SpeculativeConfig, WordTokenizer,
};

const DEMO_WORDS: &str = "the a cat dog sat ran on under mat rug and then 2+2= 4 5 is . !";

#[derive(Parser, Debug)]
#[command(name = "nano-specdec")]
#[command(about = "Steppable speculative decoding engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve the command/event protocol over stdin/stdout with bigram models
    Run(RunArgs),
    /// Download a chat tokenizer and print the templated prompt tokens
    Tokenize(TokenizeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON engine config; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Start a session with this prompt and run it to completion
    #[arg(short, long)]
    prompt: Option<String>,

    /// Draft tokens per block
    #[arg(short = 'k', long)]
    lookahead: Option<usize>,

    /// Maximum tokens to generate
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Sampling temperature (0 = greedy)
    #[arg(long)]
    temperature: Option<f32>,

    /// RNG seed for sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Demo vocabulary, whitespace separated
    #[arg(long, default_value = DEMO_WORDS)]
    words: String,

    /// Standard deviation of the target model logits
    #[arg(long, default_value = "3.0")]
    scale: f32,

    /// Logit noise separating the draft model from the target
    #[arg(long, default_value = "0.5")]
    noise: f32,
}

#[derive(Args, Debug)]
struct TokenizeArgs {
    /// HuggingFace model ID holding tokenizer.json
    #[arg(short, long)]
    model: Option<String>,

    /// Model revision
    #[arg(long, default_value = "main")]
    revision: String,

    /// Prompt to template
    #[arg(short, long)]
    prompt: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!("nano-specdec v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Mode::Run(args) => run(args).await,
        Mode::Tokenize(args) => tokenize(args).await,
    }
}

fn engine_config(args: &RunArgs) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(k) = args.lookahead {
        config = config.lookahead(k);
    }
    if let Some(n) = args.max_tokens {
        config = config.max_new_tokens(n);
    }
    if let Some(t) = args.temperature {
        config = config.temperature(t);
    }
    if let Some(seed) = args.seed {
        config = config.seed(seed);
    }
    Ok(config)
}

fn print_event(event: &Event) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let tokenizer = WordTokenizer::new(args.words.split_whitespace());
    let config = engine_config(&args)?.eot_from(&tokenizer);

    let device = Device::Cpu;
    let target = BigramLm::random(tokenizer.vocab_size(), args.scale, &device)?;
    let draft = target.perturbed(args.noise)?;
    info!(
        vocab = tokenizer.vocab_size(),
        lookahead = config.speculative.num_speculative_tokens,
        "bigram models ready"
    );

    let machine = GenerationMachine::new(
        CandleBackend::new("draft", draft),
        CandleBackend::new("target", target),
        tokenizer,
        config,
    )?;
    let (commands, mut events, task) = spawn_worker(machine).into_parts();

    // Session the controller is still waiting on
    let mut open: Option<SessionId> = None;
    let mut stdin_open = true;
    if let Some(prompt) = args.prompt {
        commands.start(prompt, 1)?;
        commands.resume()?;
        open = Some(1);
        stdin_open = false;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match Command::from_json(&line) {
                    Ok(command) => {
                        match &command {
                            Command::Start { session_id, .. } => open = Some(*session_id),
                            Command::Stop => open = None,
                            _ => {}
                        }
                        commands.send(command)?;
                    }
                    Err(error) => warn!(%error, line = %line, "invalid command"),
                },
                None => {
                    stdin_open = false;
                    match open {
                        // Finish the open session before exiting
                        Some(_) => commands.resume()?,
                        None => break,
                    }
                }
            },
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event)?;
                if event.is_terminal() && open == Some(event.session_id) {
                    open = None;
                }
                if !stdin_open && open.is_none() {
                    break;
                }
            }
        }
    }

    drop(commands);
    task.await.context("engine worker panicked")?;
    Ok(())
}

async fn tokenize(args: TokenizeArgs) -> anyhow::Result<()> {
    let model = args
        .model
        .unwrap_or_else(|| SpeculativeConfig::default().target_model_id);
    let revision = args.revision;

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let fetch = {
        let model = model.clone();
        tokio::task::spawn_blocking(move || fetch_tokenizer(&model, &revision, tx))
    };
    while let Some(event) = rx.recv().await {
        if let EventKind::ModelLoadProgress { .. } = event.kind {
            print_event(&event)?;
        }
    }
    let path = fetch.await.context("tokenizer download task panicked")??;

    let tokenizer = HfChatTokenizer::from_file(&path)?;
    let tokens = tokenizer.apply_chat_template(&[ChatTurn::user(args.prompt)])?;
    let text = tokenizer.decode(&tokens, false)?;
    println!(
        "{}",
        serde_json::json!({ "model": model, "tokens": tokens, "text": text })
    );
    Ok(())
}
