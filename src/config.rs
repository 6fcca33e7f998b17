//! §6 CLI/config: `prog [options] <can-device>`, parsed with `clap`'s derive
//! API into the `RuntimeConfig` the orchestrator is built from.

use clap::Parser;
use std::path::PathBuf;

/// §6 "usage and exit 0" for a missing `<can-device>`: `clap`'s own default
/// for a missing required positional is exit code 2, so that one error kind
/// is special-cased to print usage and exit 0 instead. Every other parse
/// failure (bad flag value, `--help`, `--version`) keeps `clap`'s default.
pub fn parse_or_usage_exit() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.kind() == clap::error::ErrorKind::MissingRequiredArgument => {
            let _ = e.print();
            std::process::exit(0);
        }
        Err(e) => e.exit(),
    }
}

/// Gateway transport selected by `-c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewaySelection {
    Disabled,
    Stdio,
    Local(PathBuf),
    Tcp(u16),
}

fn parse_gateway(s: &str) -> Result<GatewaySelection, String> {
    if s == "stdio" {
        Ok(GatewaySelection::Stdio)
    } else if let Some(path) = s.strip_prefix("local-") {
        Ok(GatewaySelection::Local(PathBuf::from(path)))
    } else if let Some(port) = s.strip_prefix("tcp-") {
        port.parse::<u16>().map(GatewaySelection::Tcp).map_err(|_| format!("invalid TCP port in '{}'", s))
    } else {
        Err(format!("unrecognized gateway mode '{}' (expected stdio, local-<path>, or tcp-<port>)", s))
    }
}

/// Linux SocketCAN platform integration layer for a CANopen node.
#[derive(Debug, Parser)]
#[command(name = "canopen-link", version, about)]
pub struct Cli {
    /// Node-id: 1..127, or 0xFF for unconfigured (requires LSS slave)
    #[arg(short = 'i', value_parser = parse_node_id)]
    pub node_id: Option<u8>,

    /// RT thread real-time priority, 1..99; -1 keeps the normal scheduler
    #[arg(short = 'p', default_value_t = -1, allow_negative_numbers = true)]
    pub rt_priority: i32,

    /// On NMT reset-app: sync filesystem and request a kernel reboot
    #[arg(short = 'r', default_value_t = false)]
    pub reboot_on_reset_app: bool,

    /// Prefix storage filenames with this path
    #[arg(short = 's')]
    pub storage_prefix: Option<PathBuf>,

    /// Enable the ASCII gateway: stdio, local-<path>, or tcp-<port>
    #[arg(short = 'c', value_parser = parse_gateway)]
    pub gateway: Option<GatewaySelection>,

    /// Gateway idle timeout in milliseconds (socket modes only); 0 = none
    #[arg(short = 'T', default_value_t = 0)]
    pub idle_timeout_ms: u64,

    /// SocketCAN interface name, e.g. can0
    pub can_device: String,
}

fn parse_node_id(s: &str) -> Result<u8, String> {
    let v = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| e.to_string())?
    } else {
        s.parse::<u32>().map_err(|e| e.to_string())?
    };
    if v == 0xFF || (1..=127).contains(&v) {
        Ok(v as u8)
    } else {
        Err("node-id must be 1..127 or 0xFF".to_owned())
    }
}

/// Fully-resolved configuration consumed by the orchestrator.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub can_device: String,
    pub node_id: Option<u8>,
    pub rt_priority: Option<u32>,
    pub reboot_on_reset_app: bool,
    pub storage_prefix: PathBuf,
    pub gateway: GatewaySelection,
    pub idle_timeout_us: u64,
}

impl RuntimeConfig {
    pub fn from_cli(cli: Cli) -> RuntimeConfig {
        RuntimeConfig {
            can_device: cli.can_device,
            node_id: cli.node_id,
            rt_priority: if cli.rt_priority >= 1 && cli.rt_priority <= 99 { Some(cli.rt_priority as u32) } else { None },
            reboot_on_reset_app: cli.reboot_on_reset_app,
            storage_prefix: cli.storage_prefix.unwrap_or_default(),
            gateway: cli.gateway.unwrap_or(GatewaySelection::Disabled),
            idle_timeout_us: cli.idle_timeout_ms * 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["canopen-link", "can0"]);
        let cfg = RuntimeConfig::from_cli(cli);
        assert_eq!(cfg.can_device, "can0");
        assert_eq!(cfg.rt_priority, None);
        assert_eq!(cfg.gateway, GatewaySelection::Disabled);
    }

    #[test]
    fn parses_gateway_local_socket() {
        let cli = Cli::parse_from(["canopen-link", "-c", "local-/run/gw.sock", "can0"]);
        let cfg = RuntimeConfig::from_cli(cli);
        assert_eq!(cfg.gateway, GatewaySelection::Local(PathBuf::from("/run/gw.sock")));
    }

    #[test]
    fn parses_gateway_tcp_port() {
        let cli = Cli::parse_from(["canopen-link", "-c", "tcp-8080", "can0"]);
        let cfg = RuntimeConfig::from_cli(cli);
        assert_eq!(cfg.gateway, GatewaySelection::Tcp(8080));
    }

    #[test]
    fn node_id_accepts_hex_unconfigured_sentinel() {
        let cli = Cli::parse_from(["canopen-link", "-i", "0xFF", "can0"]);
        assert_eq!(cli.node_id, Some(0xFF));
    }

    #[test]
    fn node_id_rejects_out_of_range_value() {
        assert!(parse_node_id("200").is_err());
    }

    #[test]
    fn rt_priority_out_of_range_maps_to_normal_scheduler() {
        let cli = Cli::parse_from(["canopen-link", "-p", "-1", "can0"]);
        let cfg = RuntimeConfig::from_cli(cli);
        assert_eq!(cfg.rt_priority, None);
    }

    #[test]
    fn missing_can_device_is_a_missing_required_argument_error() {
        let err = Cli::try_parse_from(["canopen-link"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
