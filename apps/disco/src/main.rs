use anyhow::bail;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use disco::config::Config;
use disco::input::IdleInputSource;
use disco::protocol::ProtocolVersion;
use disco::session::{self, PairingSession};

#[derive(Parser, Debug)]
#[command(name = "disco", about = "Pair a motion controller with a dance-game console")]
struct Cli {
    /// Pairing code shown by the console (code pairing).
    #[arg(long, conflicts_with = "console_ip")]
    code: Option<String>,

    /// Console IP address (direct pairing).
    #[arg(long)]
    console_ip: Option<String>,

    /// Console protocol generation.
    #[arg(long, value_enum, default_value_t = ProtocolArg::V2)]
    protocol: ProtocolArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolArg {
    V1,
    V2,
}

impl From<ProtocolArg> for ProtocolVersion {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::V1 => ProtocolVersion::V1,
            ProtocolArg::V2 => ProtocolVersion::V2,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::from_env());

    let pairing = match (&cli.code, &cli.console_ip) {
        (Some(code), None) => PairingSession::with_code(code.as_str(), cli.protocol.into(), &config),
        (None, Some(console_ip)) => PairingSession::direct(console_ip.as_str(), cli.protocol.into()),
        _ => bail!("pass either --code or --console-ip"),
    };

    // One single-attempt session; run again for a fresh attempt.
    session::run(config, pairing, Box::new(IdleInputSource), None).await?;
    Ok(())
}
