use std::path::PathBuf;

use clap::{ArgAction, Parser};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "xpost-replay",
    about = "Replays publish decision fixtures through the exactly-once coordinator and audits the ledger",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "XPOST_CONFIG",
        help = "Publish config TOML. Environment kill switches are applied on top of it."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "XPOST_DB",
        default_value = ".xpost/publish.sqlite",
        help = "SQLite database holding permits, ledger rows and audit events"
    )]
    pub db: PathBuf,

    #[arg(
        long,
        env = "XPOST_FIXTURE",
        help = "JSON fixture of decisions and scripted poster outcomes to replay"
    )]
    pub fixture: Option<PathBuf>,

    #[arg(
        long = "job-run-id",
        env = "XPOST_JOB_RUN_ID",
        default_value = "replay",
        help = "Job run id stamped on guards issued during replay"
    )]
    pub job_run_id: String,

    #[arg(
        long = "audit-log",
        env = "XPOST_AUDIT_LOG",
        help = "Append audit events as JSON lines to this file"
    )]
    pub audit_log: Option<PathBuf>,

    #[arg(
        long = "summary-json-out",
        help = "Write the run summary JSON to this path (atomically)"
    )]
    pub summary_json_out: Option<PathBuf>,

    #[arg(
        long = "check-schema",
        default_value_t = false,
        action = ArgAction::SetTrue,
        help = "Fail when the ledger table is missing required columns"
    )]
    pub check_schema: bool,

    #[arg(
        long,
        default_value_t = false,
        action = ArgAction::SetTrue,
        help = "Audit ledger rows against permits after any replay"
    )]
    pub reconcile: bool,

    #[arg(
        long,
        default_value_t = false,
        action = ArgAction::SetTrue,
        requires = "reconcile",
        help = "Apply safe repairs found by --reconcile; never publishes"
    )]
    pub repair: bool,

    #[arg(
        long = "stale-after-secs",
        default_value_t = 900,
        value_parser = parse_positive_u64,
        help = "Age after which a posting_attempt row without a used permit counts as orphaned"
    )]
    pub stale_after_secs: u64,
}

impl Cli {
    pub fn has_work(&self) -> bool {
        self.fixture.is_some() || self.check_schema || self.reconcile
    }
}

#[cfg(test)]
mod tests {
    use super::Cli;
    use clap::Parser;

    #[test]
    fn unit_defaults_parse_without_flags() {
        let cli = Cli::try_parse_from(["xpost-replay", "--db", "state.sqlite"]).expect("parse");
        assert_eq!(cli.job_run_id, "replay");
        assert_eq!(cli.stale_after_secs, 900);
        assert!(!cli.has_work());
    }

    #[test]
    fn regression_repair_requires_reconcile() {
        assert!(Cli::try_parse_from(["xpost-replay", "--repair"]).is_err());
        let cli = Cli::try_parse_from(["xpost-replay", "--reconcile", "--repair"]).expect("parse");
        assert!(cli.repair && cli.has_work());
    }

    #[test]
    fn unit_zero_staleness_window_is_rejected() {
        assert!(Cli::try_parse_from(["xpost-replay", "--stale-after-secs", "0"]).is_err());
    }
}
