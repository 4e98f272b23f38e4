use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use client::{Author, Composer, Effect, PostState, StaffCredentials};
use frames::{Command, Event, Frame, SyncRequest, ThreadId, decode_frame, encode_frame};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, InvalidHeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

type Stream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
    #[error("websocket failed: {0}")]
    Ws(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket closed{0}")]
    WsClosed(String),
    #[error("frame decode failed: {0}")]
    Decode(#[from] frames::CodecError),
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("server returned {code}: {message}")]
    ServerError { code: String, message: String },
    #[error("--staff-role requires --session-token")]
    MissingSessionToken,
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for CliError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Ws(Box::new(error))
    }
}

#[derive(Parser, Debug)]
#[command(name = "liveboard-cli", about = "Live post protocol CLI")]
struct Cli {
    #[arg(long, env = "LIVEBOARD_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    /// Staff session token, sent as the `session` cookie.
    #[arg(long, env = "LIVEBOARD_SESSION_TOKEN")]
    session_token: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Check that the server is up.
    Ping,
    /// Sync to a board and print every event as a JSON line.
    Watch(WatchArgs),
    /// Type text into a live post, then finish it.
    Post(PostArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long)]
    board: String,

    /// Threads to follow. Repeatable.
    #[arg(long = "thread")]
    threads: Vec<ThreadId>,

    /// Follow the whole board instead of individual threads.
    #[arg(long, default_value_t = false)]
    live: bool,

    #[arg(long)]
    client_id: Option<String>,
}

#[derive(Args, Debug)]
struct PostArgs {
    #[arg(long)]
    board: String,

    #[arg(long)]
    thread: ThreadId,

    #[arg(long, default_value = "-", help = "Input file path, or - for stdin")]
    input: String,

    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    email: Option<String>,

    /// Staff role to display; needs --session-token.
    #[arg(long)]
    staff_role: Option<String>,

    /// Upload token of an already uploaded image.
    #[arg(long)]
    image: Option<String>,

    /// Pause between typed characters.
    #[arg(long, default_value_t = 30)]
    delay_ms: u64,
}

#[derive(Debug, Clone)]
struct CliContext {
    base_url: String,
    session_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let ctx = CliContext { base_url: cli.base_url, session_token: cli.session_token };

    match cli.command {
        CliCommand::Ping => run_ping(&ctx).await,
        CliCommand::Watch(args) => run_watch(&ctx, args).await,
        CliCommand::Post(args) => run_post(&ctx, args).await,
    }
}

async fn run_ping(cli: &CliContext) -> Result<(), CliError> {
    let client = reqwest::Client::new();
    let url = format!("{}/healthz", cli.base_url.trim_end_matches('/'));
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerError {
            code: format!("HTTP {}", status.as_u16()),
            message: "health check failed".to_owned(),
        });
    }
    println!("ok");
    Ok(())
}

// =============================================================================
// WATCH
// =============================================================================

async fn run_watch(cli: &CliContext, args: WatchArgs) -> Result<(), CliError> {
    let mut stream = connect(cli).await?;
    let sync = SyncRequest {
        board: args.board,
        syncs: args.threads.iter().map(|&t| (t, 0)).collect::<BTreeMap<_, _>>(),
        live: args.live,
    };
    let id = args.client_id.unwrap_or_else(new_client_id);
    send(&mut stream, &Command::Synchronize { id, sync }).await?;

    loop {
        let frame = recv_next(&mut stream, None).await?;
        println!("{}", serde_json::to_string(&frame)?);
        if let Event::Error { code, message } = Event::from_frame(&frame)? {
            eprintln!("server error {code}: {message}");
        }
    }
}

// =============================================================================
// POST
// =============================================================================

async fn run_post(cli: &CliContext, args: PostArgs) -> Result<(), CliError> {
    let text = read_input(&args.input)?;
    let staff = match args.staff_role {
        Some(role) => {
            let session = cli.session_token.clone().ok_or(CliError::MissingSessionToken)?;
            Some(StaffCredentials { role, session })
        }
        None => None,
    };
    let author = Author { name: args.name, email: args.email, staff };

    let mut stream = connect(cli).await?;
    let sync = SyncRequest {
        board: args.board,
        syncs: BTreeMap::from([(args.thread, 0)]),
        live: false,
    };
    send(&mut stream, &Command::Synchronize { id: new_client_id(), sync }).await?;
    wait_for_synced(&mut stream).await?;

    let mut composer = Composer::new(args.thread, author);
    if let Some(token) = &args.image {
        composer.select_file(token);
        drive(&mut stream, &mut composer).await?;
    }

    let mut typed = String::with_capacity(text.len());
    for ch in text.chars() {
        typed.push(ch);
        composer.input(&typed);
        drive(&mut stream, &mut composer).await?;
        if args.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
        }
    }

    composer.finalize();
    drive(&mut stream, &mut composer).await?;
    match composer.id() {
        Some(id) => println!("{id}"),
        None => eprintln!("nothing was posted"),
    }
    stream.close(None).await?;
    Ok(())
}

/// Execute the composer's effects, then wait out a pending allocation.
async fn drive(stream: &mut Stream, composer: &mut Composer) -> Result<(), CliError> {
    loop {
        for effect in composer.take_effects() {
            match effect {
                Effect::Send(cmd) => send(stream, &cmd).await?,
                Effect::TrimInput(n) => eprintln!("input over the post limit; {n} characters dropped"),
                Effect::ReplaceText { .. } | Effect::Closed => {}
            }
        }
        if composer.state() != PostState::PendingAllocation {
            return Ok(());
        }

        let event = Event::from_frame(&recv_next(stream, Some(Duration::from_secs(5))).await?)?;
        if let Event::Error { code, message } = &event {
            if code != frames::RECLAIM_FAILED {
                return Err(CliError::ServerError { code: code.clone(), message: message.clone() });
            }
        }
        composer.handle_event(&event);
    }
}

async fn wait_for_synced(stream: &mut Stream) -> Result<(), CliError> {
    loop {
        match Event::from_frame(&recv_next(stream, Some(Duration::from_secs(5))).await?)? {
            Event::Synced => return Ok(()),
            Event::Error { code, message } => return Err(CliError::ServerError { code, message }),
            _ => {}
        }
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

async fn connect(cli: &CliContext) -> Result<Stream, CliError> {
    let mut request = ws_url(&cli.base_url)?.into_client_request()?;
    if let Some(token) = &cli.session_token {
        request
            .headers_mut()
            .insert(COOKIE, HeaderValue::from_str(&format!("session={token}"))?);
    }
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}

fn ws_url(base_url: &str) -> Result<String, CliError> {
    let base_url = base_url.trim_end_matches('/');
    if let Some(rest) = base_url.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/api/ws"));
    }
    if let Some(rest) = base_url.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/api/ws"));
    }

    Err(CliError::InvalidBaseUrl(base_url.to_owned()))
}

async fn send(stream: &mut Stream, cmd: &Command) -> Result<(), CliError> {
    stream.send(Message::Binary(encode_frame(&cmd.to_frame()).into())).await?;
    Ok(())
}

/// Next binary frame. `None` waits indefinitely.
async fn recv_next(stream: &mut Stream, timeout: Option<Duration>) -> Result<Frame, CliError> {
    let fut = async {
        loop {
            let Some(message) = stream.next().await else {
                return Err(CliError::WsClosed(String::new()));
            };
            match message? {
                Message::Binary(bytes) => {
                    return decode_frame(&bytes).map_err(CliError::from);
                }
                Message::Close(frame) => {
                    let reason = frame.map(|f| format!(" ({}: {})", u16::from(f.code), f.reason.as_str())).unwrap_or_default();
                    return Err(CliError::WsClosed(reason));
                }
                _ => {}
            }
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| CliError::Timeout)?,
        None => fut.await,
    }
}

fn new_client_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn read_input(path: &str) -> Result<String, CliError> {
    let mut text = String::new();
    if path == "-" {
        io::stdin().read_to_string(&mut text)?;
    } else {
        File::open(path)?.read_to_string(&mut text)?;
    }
    Ok(text.trim_end_matches('\n').to_owned())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
