//! AgenticProtocol: entry point.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use agentic_protocol::config::{
    resolve_request_timeout, resolve_strict_capabilities, ProtocolOptions,
};
use agentic_protocol::types::{
    Capabilities, Implementation, LATEST_PROTOCOL_VERSION, SERVER_NAME, SERVER_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use agentic_protocol::{Protocol, StdioTransport};

#[derive(Parser)]
#[command(
    name = "agentic-protocol",
    about = "Bidirectional JSON-RPC protocol engine for MCP peers",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Default outbound request timeout in milliseconds.
    /// Also reads from AGENTIC_REQUEST_TIMEOUT_MS.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Enforce peer capabilities on every outbound request.
    /// Also reads from AGENTIC_STRICT_CAPABILITIES.
    #[arg(long)]
    strict: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a responder over stdio (default).
    Serve {
        /// Answer every unhandled request with its own params.
        #[arg(long)]
        echo: bool,
    },

    /// Print protocol versions and default capabilities as JSON.
    Info,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   agentic-protocol completions bash > ~/.local/share/bash-completion/completions/agentic-protocol
    ///   agentic-protocol completions zsh > ~/.zfunc/_agentic-protocol
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let options = ProtocolOptions {
        enforce_strict_capabilities: resolve_strict_capabilities(cli.strict.then_some(true)),
        request_timeout: resolve_request_timeout(cli.timeout_ms),
        ..ProtocolOptions::default()
    };

    match cli.command.unwrap_or(Commands::Serve { echo: false }) {
        Commands::Serve { echo } => {
            let server = Protocol::server(
                Implementation::new(SERVER_NAME, SERVER_VERSION),
                Capabilities::server_defaults(),
                options,
            );
            if echo {
                server.set_fallback_request_handler(|method, params, _ctx| async move {
                    tracing::debug!("Echoing {method}");
                    Ok(serde_json::json!({ "method": method, "params": params }))
                });
            }
            server.on_close(|| tracing::info!("Peer disconnected"));

            tracing::info!("AgenticProtocol responder on stdio");
            server.connect(StdioTransport::new()).await?;
            server.closed().await;
        }

        Commands::Info => {
            let info = serde_json::json!({
                "server": Implementation::new(SERVER_NAME, SERVER_VERSION),
                "protocol_version": LATEST_PROTOCOL_VERSION,
                "supported_versions": SUPPORTED_PROTOCOL_VERSIONS,
                "capabilities": Capabilities::server_defaults(),
                "request_timeout_ms": options.request_timeout.as_millis() as u64,
                "strict_capabilities": options.enforce_strict_capabilities,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "agentic-protocol", &mut std::io::stdout());
        }
    }

    Ok(())
}
