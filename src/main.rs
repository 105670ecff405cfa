//! ondevice-cli entry point.
//!
//! Demo driver for the session runtime using the echo backend.
//!
//! ## CLI Subcommands
//!
//! - `ondevice-cli echo <name> <text> [--cancel-after N]` - Stream an echo generation
//! - `ondevice-cli tokens <name> <text>` - Print the token estimate for `text`
//! - `ondevice-cli config [--json]` - Print the effective configuration

use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use ondevice_runtime::telemetry::{init_logging, LogConfig};
use ondevice_runtime::{
    BackendKind, Model, ResponseChunk, RuntimeConfig, RuntimeDispatcher,
};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    let log_config = LogConfig::from_env();
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Logging setup failed: {}", e);
        return ExitCode::FAILURE;
    }

    match command {
        "echo" => run_echo(&args[2..]).await,
        "tokens" => run_tokens(&args[2..]).await,
        "config" => {
            let json = args.get(2).map(|s| s.as_str()) == Some("--json");
            run_config(json)
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("ondevice-cli {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    eprintln!(
        "ondevice-cli v{}

USAGE:
    ondevice-cli <COMMAND> [ARGS]

COMMANDS:
    echo <name> <text> [--cancel-after N]   Stream an echo generation
    tokens <name> <text>                    Print the token estimate
    config [--json]                         Print the effective configuration
    version                                 Print version
    help                                    Print this message",
        env!("CARGO_PKG_VERSION")
    );
}

struct EchoArgs {
    name: String,
    text: String,
    cancel_after: Option<usize>,
}

fn parse_echo_args(args: &[String]) -> Result<EchoArgs, String> {
    let mut positional = Vec::new();
    let mut cancel_after = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--cancel-after" {
            let value = iter.next().ok_or("--cancel-after requires a value")?;
            let n = value
                .parse::<usize>()
                .map_err(|_| format!("invalid --cancel-after value: {}", value))?;
            cancel_after = Some(n);
        } else {
            positional.push(arg.clone());
        }
    }
    match positional.as_slice() {
        [name, text] => Ok(EchoArgs { name: name.clone(), text: text.clone(), cancel_after }),
        _ => Err("expected <name> <text>".into()),
    }
}

async fn ready_model(dispatcher: &RuntimeDispatcher, name: &str) -> Option<Arc<Model>> {
    let config = RuntimeConfig::from_env();
    let model = Arc::new(Model::new(name, BackendKind::Echo, config.default_model));
    match dispatcher.initialize(&model).await {
        Ok(()) => Some(model),
        Err(e) => {
            eprintln!("Initialize failed: {}", e.user_message());
            None
        }
    }
}

async fn run_echo(args: &[String]) -> ExitCode {
    let args = match parse_echo_args(args) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let dispatcher = RuntimeDispatcher::new(&RuntimeConfig::from_env());
    let Some(model) = ready_model(&dispatcher, &args.name).await else {
        return ExitCode::FAILURE;
    };

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<ResponseChunk>();
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let started = dispatcher.generate_response(
        &model,
        &args.text,
        &[],
        Box::new(move |chunk| {
            let _ = chunk_tx.send(chunk);
        }),
        Box::new(move || {
            let _ = done_tx.send(());
        }),
    );
    if let Err(e) = started {
        eprintln!("Generation failed: {}", e.user_message());
        return ExitCode::FAILURE;
    }

    let mut received = 0usize;
    let mut failed = false;
    while let Some(chunk) = chunk_rx.recv().await {
        received += 1;
        println!("{}", chunk.text);
        failed |= chunk.is_error();
        if chunk.done {
            break;
        }
        if args.cancel_after == Some(received) {
            if let Err(e) = dispatcher.cancel_generate_response(&model) {
                eprintln!("Cancel failed: {}", e.user_message());
            }
        }
    }

    let _ = done_rx.await;
    dispatcher.clean_up(&model).await;
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run_config(json: bool) -> ExitCode {
    let cfg = RuntimeConfig::from_env();
    let model = &cfg.default_model;
    if json {
        let value = serde_json::json!({
            "echo_char_delay_ms": cfg.echo.char_delay.as_millis() as u64,
            "echo_trailing_pause_ms": cfg.echo.trailing_pause.as_millis() as u64,
            "cleanup_grace_ms": cfg.cleanup_grace.as_millis() as u64,
            "default_model": model,
        });
        match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Failed to encode configuration: {}", e);
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }
    println!("ONDEVICE_ECHO_CHAR_DELAY_MS={}", cfg.echo.char_delay.as_millis());
    println!("ONDEVICE_ECHO_TRAILING_PAUSE_MS={}", cfg.echo.trailing_pause.as_millis());
    println!("ONDEVICE_CLEANUP_GRACE_MS={}", cfg.cleanup_grace.as_millis());
    println!("ONDEVICE_MAX_TOKENS={}", model.max_tokens);
    println!("ONDEVICE_TOP_K={}", model.top_k);
    println!("ONDEVICE_TOP_P={}", model.top_p);
    println!("ONDEVICE_TEMPERATURE={}", model.temperature);
    println!("ONDEVICE_ACCELERATOR={}", model.accelerator);
    ExitCode::SUCCESS
}

async fn run_tokens(args: &[String]) -> ExitCode {
    let [name, text] = args else {
        eprintln!("Error: expected <name> <text>");
        return ExitCode::FAILURE;
    };
    let dispatcher = RuntimeDispatcher::new(&RuntimeConfig::from_env());
    let Some(model) = ready_model(&dispatcher, name).await else {
        return ExitCode::FAILURE;
    };
    println!("{}", dispatcher.size_in_tokens(&model, text).await);
    dispatcher.clean_up(&model).await;
    ExitCode::SUCCESS
}
