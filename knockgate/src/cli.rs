use clap::Parser;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Knock sequence the client must reproduce, as ordered
    /// "port:protocol" steps (e.g. "1201:TCP,2301:UDP,3401:TCP").
    #[arg(
        short = 'l',
        long,
        value_name = "SEQUENCE",
        env = "KNOCKGATE_PORT_LIST"
    )]
    pub port_list: String,

    /// Port opened for the client after a successful knock.
    #[arg(short = 'p', long, value_name = "PORT", env = "KNOCKGATE_TARGET_PORT")]
    pub target_port: u16,

    /// Expected payload of the final knock packet (opaque hash, compared
    /// byte-for-byte).
    #[arg(long = "passwd", value_name = "HASH", env = "KNOCKGATE_PASSWORD_HASH")]
    pub password_hash: String,

    /// Maximum seconds allowed between consecutive valid knock steps.
    #[arg(short = 'w', long, value_name = "SECONDS", env = "KNOCKGATE_WINDOW")]
    pub window: u64,

    /// Seconds an installed grant stays open before automatic removal.
    #[arg(short = 't', long, value_name = "SECONDS", env = "KNOCKGATE_TIMEOUT")]
    pub timeout: u64,

    /// Firewall zone the grant is applied within.
    #[arg(
        short = 'z',
        long,
        value_name = "ZONE",
        env = "KNOCKGATE_ZONE",
        default_value = "public"
    )]
    pub zone: String,

    /// Capture device. Defaults to the first device libpcap reports.
    #[arg(short = 'i', long, value_name = "DEVICE", env = "KNOCKGATE_IFACE")]
    pub iface: Option<String>,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(
        long,
        value_name = "LEVEL",
        env = "KNOCKGATE_LOG_LEVEL",
        default_value = "info"
    )]
    pub log_level: Level,
}

#[cfg(test)]
mod tests {
    use std::env;

    use clap::Parser as _;
    use serial_test::serial;
    use tracing::Level;

    use super::Cli;

    const REQUIRED: [&str; 11] = [
        "knockgate",
        "--port-list",
        "1201:TCP,2301:UDP,3401:TCP",
        "--target-port",
        "22",
        "--passwd",
        "5ebe2294ecd0e0f08eab7690d2a6ee69",
        "--window",
        "10",
        "--timeout",
        "30",
    ];

    fn clear_env_vars() {
        // This helper ensures a clean slate before each test.
        unsafe {
            env::remove_var("KNOCKGATE_PORT_LIST");
            env::remove_var("KNOCKGATE_TARGET_PORT");
            env::remove_var("KNOCKGATE_PASSWORD_HASH");
            env::remove_var("KNOCKGATE_WINDOW");
            env::remove_var("KNOCKGATE_TIMEOUT");
            env::remove_var("KNOCKGATE_ZONE");
            env::remove_var("KNOCKGATE_IFACE");
            env::remove_var("KNOCKGATE_LOG_LEVEL");
        }
    }

    #[test]
    #[serial]
    fn parses_long_flags() {
        clear_env_vars();

        let cli = Cli::parse_from(REQUIRED);
        assert_eq!(cli.port_list, "1201:TCP,2301:UDP,3401:TCP");
        assert_eq!(cli.target_port, 22);
        assert_eq!(cli.password_hash, "5ebe2294ecd0e0f08eab7690d2a6ee69");
        assert_eq!(cli.window, 10);
        assert_eq!(cli.timeout, 30);
    }

    #[test]
    #[serial]
    fn parses_short_flags() {
        clear_env_vars();

        let cli = Cli::parse_from([
            "knockgate",
            "-l",
            "9000:UDP",
            "-p",
            "2222",
            "--passwd",
            "hash",
            "-w",
            "5",
            "-t",
            "60",
            "-z",
            "dmz",
            "-i",
            "eth1",
        ]);
        assert_eq!(cli.port_list, "9000:UDP");
        assert_eq!(cli.target_port, 2222);
        assert_eq!(cli.zone, "dmz");
        assert_eq!(cli.iface, Some("eth1".to_string()));
    }

    #[test]
    #[serial]
    fn args_override_env_vars() {
        clear_env_vars();

        unsafe {
            env::set_var("KNOCKGATE_ZONE", "internal");
            env::set_var("KNOCKGATE_LOG_LEVEL", "debug");
        }

        let mut args = REQUIRED.to_vec();
        args.extend(["--zone", "dmz", "--log-level", "warn"]);
        let cli = Cli::parse_from(args);
        assert_eq!(cli.zone, "dmz");
        assert_eq!(cli.log_level, Level::WARN);

        clear_env_vars();
    }

    #[test]
    #[serial]
    fn parses_from_env_when_no_args() {
        clear_env_vars();

        unsafe {
            env::set_var("KNOCKGATE_PORT_LIST", "1201:TCP");
            env::set_var("KNOCKGATE_TARGET_PORT", "22");
            env::set_var("KNOCKGATE_PASSWORD_HASH", "hash");
            env::set_var("KNOCKGATE_WINDOW", "10");
            env::set_var("KNOCKGATE_TIMEOUT", "30");
        }

        let cli = Cli::parse_from(["knockgate"]);
        assert_eq!(cli.port_list, "1201:TCP");
        assert_eq!(cli.target_port, 22);

        clear_env_vars();
    }

    #[test]
    #[serial]
    fn default_zone_is_public() {
        clear_env_vars();
        let cli = Cli::parse_from(REQUIRED);
        assert_eq!(cli.zone, "public");
    }

    #[test]
    #[serial]
    fn default_log_level_is_info() {
        clear_env_vars();
        let cli = Cli::parse_from(REQUIRED);
        assert_eq!(cli.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn missing_required_args_fail_to_parse() {
        clear_env_vars();
        assert!(Cli::try_parse_from(["knockgate"]).is_err());
    }
}
