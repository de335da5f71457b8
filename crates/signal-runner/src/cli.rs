use broker_core::types::GlobalDefaults;
use clap::Parser;
use rust_decimal::Decimal;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "signal-runner")]
#[command(about = "Trade a list of signals with martingale progression")]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// JSON array of signals
    #[arg(short, long)]
    pub signals: PathBuf,

    /// JSON object of account name to API token
    #[arg(short, long)]
    pub accounts: Option<PathBuf>,

    /// Account to trade on (defaults to the first one)
    #[arg(long)]
    pub account: Option<String>,

    /// Global stop win; zero disables it
    #[arg(long)]
    pub stop_win: Option<Decimal>,

    /// Global stop loss; zero disables it
    #[arg(long)]
    pub stop_loss: Option<Decimal>,

    /// Enable martingale for signals using the global defaults
    #[arg(long)]
    pub martingale: bool,

    /// Default stake for signals without one
    #[arg(long, default_value = "1")]
    pub stake: Decimal,

    /// Trade against the live broker instead of the paper broker
    #[arg(long)]
    pub live: bool,

    #[arg(long, default_value_t = 30)]
    pub status_interval_secs: u64,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,
}

impl Args {
    pub fn globals(&self) -> GlobalDefaults {
        GlobalDefaults {
            stake: self.stake,
            stop_win: self.stop_win,
            stop_loss: self.stop_loss,
            martingale_enabled: self.martingale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_globals() {
        let args = Args::parse_from([
            "signal-runner",
            "--signals",
            "plan.json",
            "--stop-loss",
            "70",
            "--martingale",
            "--stake",
            "2.5",
        ]);
        let globals = args.globals();
        assert_eq!(globals.stake, Decimal::new(25, 1));
        assert_eq!(globals.stop_loss, Some(Decimal::new(70, 0)));
        assert_eq!(globals.stop_win, None);
        assert!(globals.martingale_enabled);
        assert!(!args.live);
        assert_eq!(args.status_interval_secs, 30);
    }
}
