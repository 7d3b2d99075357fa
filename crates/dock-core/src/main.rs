use std::io::{self, IsTerminal, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use dock_backend::AgentClient;
use dock_core::config::Config;
use dock_core::dock::{AgentDock, DockHandle};
use dock_core::render::ReplyPrinter;
use dock_core::{logging, Conversation, SessionId};
use dock_protocol::MessageStatus;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

fn print_help() {
    println!("agentdock — streaming client for the portfolio agent");
    println!();
    println!("Usage:");
    println!("  agentdock                     Read questions from stdin, one per line");
    println!("  agentdock \"question\"          Ask once and exit");
    println!();
    println!("While an answer streams, Ctrl-C or a /stop line stops it; /quit exits.");
    println!();
    println!("Options:");
    println!("  --config PATH   Read configuration from PATH");
    println!("  --version       Print version");
    println!("  --help          Print this help");
}

struct Args {
    config: Option<PathBuf>,
    question: Option<String>,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args {
        config: None,
        question: None,
    };
    let mut words = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().ok_or("--config needs a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            flag if flag.starts_with('-') => return Err(format!("unknown option '{flag}'")),
            word => words.push(word),
        }
    }
    if !words.is_empty() {
        parsed.question = Some(words.join(" "));
    }
    Ok(parsed)
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return;
    }

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("agentdock {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("hint: agentdock --help");
            std::process::exit(2);
        }
    };

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        },
        None => Config::load_or_default(),
    };
    config.apply_env();
    logging::init(&config.log);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create async runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(config, args.question));
    std::process::exit(code);
}

async fn run(config: Config, question: Option<String>) -> i32 {
    let client = match AgentClient::new(config.client_options()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };
    tracing::info!(url = %client.stream_url(), "agent endpoint");

    let conversation = Conversation::new(
        SessionId::create(),
        config.pacer_config(),
        config.notices.clone(),
    )
    .with_system_prompt(config.system_prompt());
    let dock = AgentDock::spawn(conversation, client.clone(), client, config.dock_options());

    spawn_interrupt_handler(dock.clone());

    let code = match question {
        Some(question) => match answer(&dock, &question, None).await {
            Some(MessageStatus::Done) => 0,
            _ => 1,
        },
        None => interactive(&dock).await,
    };

    dock.shutdown().await;
    code
}

/// Ctrl-C stops the answer in flight, or exits when there is none.
fn spawn_interrupt_handler(dock: DockHandle) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !dock.stop().await {
                eprintln!();
                std::process::exit(130);
            }
        }
    });
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

async fn interactive(dock: &DockHandle) -> i32 {
    let prompt = io::stdin().is_terminal();
    let mut lines = spawn_stdin_reader();

    loop {
        if prompt {
            eprint!("> ");
            let _ = io::stderr().flush();
        }
        let Some(line) = lines.recv().await else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/stop" => {
                dock.stop().await;
            }
            question => {
                answer(dock, question, Some(&mut lines)).await;
            }
        }
    }
    0
}

async fn next_line(input: &mut Option<&mut mpsc::Receiver<String>>) -> Option<String> {
    match input {
        Some(lines) => lines.recv().await,
        None => std::future::pending().await,
    }
}

/// Ask `question` and print the reply as it is revealed.
///
/// Returns the reply's final status, or `None` if the question was refused.
async fn answer(
    dock: &DockHandle,
    question: &str,
    mut input: Option<&mut mpsc::Receiver<String>>,
) -> Option<MessageStatus> {
    let mut updates = dock.subscribe();
    let reply_index = dock.snapshot().transcript.len() + 1;
    if !dock.submit(question).await {
        eprintln!("[agentdock] still answering; send /stop first");
        return None;
    }

    let mut printer = ReplyPrinter::new(reply_index);
    let mut stdout = tokio::io::stdout();
    loop {
        let snapshot = updates.borrow_and_update().clone();
        let progress = printer.update(&snapshot);
        if let Some(tool) = progress.tool {
            eprintln!("[agentdock] running {tool}...");
        }
        if let Some(text) = progress.text {
            let _ = stdout.write_all(text.as_bytes()).await;
            let _ = stdout.flush().await;
        }
        if let Some(status) = progress.finished {
            let _ = stdout.write_all(b"\n").await;
            let _ = stdout.flush().await;
            return Some(status);
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            line = next_line(&mut input) => match line {
                Some(line) if line.trim() == "/stop" => {
                    dock.stop().await;
                }
                Some(_) => eprintln!("[agentdock] still answering; send /stop first"),
                None => input = None,
            },
        }
    }
}
