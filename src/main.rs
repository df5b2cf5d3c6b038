mod server;

use std::net::SocketAddr;

use axum::http::HeaderName;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use gemini_keyring::{
    DEFAULT_ENDPOINT, DEFAULT_NAMESPACE, GeminiClient, KeyRing, KeyringError, Kv, RateLimit,
    Visibility, fallback_keys_from_env, open_backend,
};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::server::ForwardAuthConfig;

#[derive(Debug, Parser)]
#[command(author, version, about = "Gemini API key rotation and usage accounting")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the admin API and the generateContent proxy.
    Serve(ServeArgs),
    /// Send a single prompt through the key ring.
    Generate(GenerateArgs),
    /// Manage stored API keys.
    #[command(subcommand)]
    Keys(KeysCommand),
}

#[derive(Debug, Args)]
struct StoreArgs {
    /// Redis or Upstash URL. When unset the SQLite store is used.
    #[arg(long, env = "REDIS_URL", hide_env_values = true)]
    redis_url: Option<String>,

    /// SQLite database path used when no Redis URL is given.
    #[arg(long, env = "KEYRING_DB_PATH", default_value = "gemini_keys.db")]
    db_path: String,

    /// Prefix for every key written to the store.
    #[arg(long, env = "KEYRING_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Primary environment variable of the fallback key list; `<NAME>_2`,
    /// `<NAME>_3`, … are read after it.
    #[arg(long, env = "KEYRING_FALLBACK_VAR", default_value = "GEMINI_API_KEY")]
    fallback_var: String,
}

impl StoreArgs {
    async fn open(&self) -> Result<KeyRing, KeyringError> {
        let backend = open_backend(self.redis_url.as_deref(), &self.db_path).await?;
        let kv = Kv::new(backend, self.namespace.clone());
        let fallback = fallback_keys_from_env(&self.fallback_var);
        info!(
            namespace = kv.namespace(),
            fallback_keys = fallback.len(),
            "key ring opened"
        );
        Ok(KeyRing::new(kv, fallback))
    }
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Override the Gemini endpoint URL.
    #[arg(long, env = "GEMINI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Copy the fallback environment keys into the store on startup.
    #[arg(long, env = "KEYRING_MIGRATE_ENV_KEYS")]
    migrate_env_keys: bool,

    /// Requests allowed per caller and window; unlimited when unset.
    #[arg(long, env = "KEYRING_CALLER_LIMIT")]
    caller_limit: Option<u64>,

    /// Length of the caller rate window in seconds.
    #[arg(long, env = "KEYRING_CALLER_WINDOW", default_value_t = 60)]
    caller_window: u64,

    /// Header carrying the caller id used for per-user accounting.
    #[arg(long, env = "KEYRING_CALLER_HEADER", default_value = "x-user-id")]
    caller_header: String,

    /// Address to bind the server to.
    #[arg(long, env = "KEYRING_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the server to.
    #[arg(long, env = "KEYRING_PORT", default_value_t = 8080)]
    port: u16,

    /// Header set by the forward-auth proxy with the user identity.
    #[arg(long, env = "FORWARD_AUTH_HEADER")]
    forward_auth_header: Option<String>,

    /// Identity value that grants admin rights.
    #[arg(long, env = "FORWARD_AUTH_ADMIN_VALUE")]
    forward_auth_admin_value: Option<String>,

    /// Header with a display name for the user.
    #[arg(long, env = "FORWARD_AUTH_NICKNAME_HEADER")]
    forward_auth_nickname_header: Option<String>,

    /// Treat every request as this admin (local development only).
    #[arg(long, env = "ADMIN_MODE_NAME")]
    admin_mode_name: Option<String>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Override the Gemini endpoint URL.
    #[arg(long, env = "GEMINI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Model name, e.g. gemini-1.5-flash.
    #[arg(short, long, default_value = "gemini-1.5-flash")]
    model: String,

    /// Caller id recorded in per-user stats.
    #[arg(long)]
    user: Option<String>,

    /// Prompt text.
    prompt: String,
}

#[derive(Debug, Subcommand)]
enum KeysCommand {
    /// Print stored keys with redacted secrets.
    List(StoreArgs),
    /// Store a new key.
    Add {
        #[command(flatten)]
        store: StoreArgs,
        /// The API key secret.
        secret: String,
        /// Display name.
        #[arg(long, default_value = "")]
        name: String,
        /// Store the key disabled.
        #[arg(long)]
        inactive: bool,
    },
    /// Delete a key and its usage stats.
    Remove {
        #[command(flatten)]
        store: StoreArgs,
        id: String,
    },
    /// Enable or disable a key.
    Toggle {
        #[command(flatten)]
        store: StoreArgs,
        id: String,
        #[arg(long, action = clap::ArgAction::Set)]
        active: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(args) => return run_server(args).await,
        Command::Generate(args) => run_generate(args).await,
        Command::Keys(command) => run_keys(command).await,
    };

    if let Err(err) = result {
        report_error(&err);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let keyring = args.store.open().await?;

    if args.migrate_env_keys {
        let keys = fallback_keys_from_env(&args.store.fallback_var);
        let added = keyring.import_keys(&keys).await?;
        info!(added, "migrated environment keys into the store");
    }

    let caller_limit = args.caller_limit.map(|limit| RateLimit {
        limit,
        window_seconds: args.caller_window,
    });
    let client = GeminiClient::new(keyring, &args.endpoint)?.with_caller_limit(caller_limit);

    let forward_auth = ForwardAuthConfig::new(
        parse_header_name(args.forward_auth_header.as_deref())?,
        args.forward_auth_admin_value,
        parse_header_name(args.forward_auth_nickname_header.as_deref())?,
        args.admin_mode_name,
    );
    let caller_header = parse_header_name(Some(&args.caller_header))?;

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    server::serve(addr, client, forward_auth, caller_header).await
}

async fn run_generate(args: GenerateArgs) -> Result<(), KeyringError> {
    let keyring = args.store.open().await?;
    let client = GeminiClient::new(keyring, &args.endpoint)?;

    let body = json!({"contents": [{"parts": [{"text": args.prompt}]}]});
    let response = client
        .generate_content(args.user.as_deref(), &args.model, Bytes::from(body.to_string()))
        .await?;

    match serde_json::from_slice::<serde_json::Value>(&response.body) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", String::from_utf8_lossy(&response.body)),
    }
    if !response.status.is_success() {
        eprintln!("upstream status: {}", response.status);
    }
    Ok(())
}

async fn run_keys(command: KeysCommand) -> Result<(), KeyringError> {
    match command {
        KeysCommand::List(store) => {
            let keyring = store.open().await?;
            for record in keyring.list_keys(Visibility::Redacted).await? {
                println!(
                    "{}\t{}\t{}\t{:?}\t{}",
                    record.id,
                    record.key,
                    if record.active { "active" } else { "inactive" },
                    record.source,
                    record.name
                );
            }
        }
        KeysCommand::Add {
            store,
            secret,
            name,
            inactive,
        } => {
            let record = store.open().await?.add_key(&secret, &name, !inactive).await?;
            println!("{}", record.id);
        }
        KeysCommand::Remove { store, id } => store.open().await?.remove_key(&id).await?,
        KeysCommand::Toggle { store, id, active } => {
            store.open().await?.toggle_key(&id, active).await?;
        }
    }
    Ok(())
}

fn parse_header_name(raw: Option<&str>) -> Result<Option<HeaderName>, Box<dyn std::error::Error>> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => Ok(Some(HeaderName::from_bytes(value.to_ascii_lowercase().as_bytes())?)),
        None => Ok(None),
    }
}

fn report_error(err: &KeyringError) {
    eprintln!("error: {err}");
    match err {
        KeyringError::Http(source) => {
            if let Some(status) = source.status() {
                eprintln!("  status: {status}");
            }
        }
        KeyringError::StoreUnavailable(store_err) => {
            eprintln!("  store: {store_err}");
        }
        KeyringError::NoActiveKeys => {
            eprintln!("  add a key with `keys add` or set GEMINI_API_KEY");
        }
        _ => {}
    }
}
