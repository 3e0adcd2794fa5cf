use clap::Parser;
use qbt_inhibitord::app::arbitration::DEFAULT_TICK_INTERVAL;
use qbt_inhibitord::{run, Settings};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Throttles qBittorrent uploads while media is streaming", long_about = None)]
struct Cli {
    #[arg(
        long,
        value_name = "PATH",
        help = "Config file (defaults to ./config.json, then the user config directory)"
    )]
    config: Option<PathBuf>,

    #[arg(long, help = "Listen address for the state API (overrides api_ip)")]
    api_address: Option<IpAddr>,

    #[arg(long, help = "Primary API port (overrides api_port)")]
    api_port: Option<u16>,

    #[arg(long, help = "Fallback API port used when the primary is taken")]
    api_alt_port: Option<u16>,

    #[arg(
        long,
        default_value_t = DEFAULT_TICK_INTERVAL.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between arbitration ticks"
    )]
    tick_interval_secs: u64,

    #[arg(long, help = "OTLP endpoint for metrics (e.g., http://localhost:4318)")]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn into_settings(self) -> Settings {
        Settings {
            config_path: self.config,
            api_address: self.api_address,
            api_port: self.api_port,
            api_alt_port: self.api_alt_port,
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            otlp_endpoint: self.otlp_endpoint,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    run(cli.into_settings()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_overrides_unset() {
        let settings = Cli::try_parse_from(["qbt-inhibitord"]).unwrap().into_settings();
        assert!(settings.config_path.is_none());
        assert!(settings.api_port.is_none());
        assert_eq!(settings.tick_interval, DEFAULT_TICK_INTERVAL);
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::try_parse_from([
            "qbt-inhibitord",
            "--config",
            "/etc/qbt-inhibitor/config.json",
            "--api-address",
            "127.0.0.1",
            "--api-port",
            "5000",
            "--api-alt-port",
            "5001",
            "--tick-interval-secs",
            "3",
        ])
        .unwrap();
        let settings = cli.into_settings();
        assert_eq!(
            settings.config_path,
            Some(PathBuf::from("/etc/qbt-inhibitor/config.json"))
        );
        assert_eq!(settings.api_address, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(settings.api_port, Some(5000));
        assert_eq!(settings.api_alt_port, Some(5001));
        assert_eq!(settings.tick_interval, Duration::from_secs(3));
    }

    #[test]
    fn rejects_zero_tick_interval() {
        assert!(Cli::try_parse_from(["qbt-inhibitord", "--tick-interval-secs", "0"]).is_err());
    }
}
