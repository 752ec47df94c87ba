use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "fleetgate",
    version,
    about = "Policy-gated diagnostic command broker for a server fleet"
)]
pub struct Args {
    #[arg(long, default_value = "config/config.toml")]
    pub config: PathBuf,
    #[arg(long, default_value = "127.0.0.1:19307")]
    pub listen_addr: String,
    #[arg(long, default_value = "127.0.0.1:19308")]
    pub control_addr: String,
    #[arg(long, default_value = "logs")]
    pub audit_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub log_to_stderr: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults_and_overrides() {
        let args = Args::parse_from(["fleetgate"]);
        assert_eq!(args.listen_addr, "127.0.0.1:19307");
        assert!(!args.log_to_stderr);

        let args = Args::parse_from([
            "fleetgate",
            "--config",
            "/etc/fleetgate/config.toml",
            "--control-addr",
            "0.0.0.0:9000",
            "--log-to-stderr",
        ]);
        assert_eq!(args.config, PathBuf::from("/etc/fleetgate/config.toml"));
        assert_eq!(args.control_addr, "0.0.0.0:9000");
        assert!(args.log_to_stderr);
    }
}
