//! Utility functions shared across the crate.

use crate::network::modules::StatisticsSnapshot;
use log::{info, LevelFilter, SetLoggerError};
use std::fmt::Write as _;
use std::io::Write;

/// Initializes the console logger.
///
/// Lines are formatted as `[HH:MM:SS.mmm] LEVEL - target: message`.
/// `RUST_LOG` overrides `level` when set.
pub fn init_logger(level: LevelFilter) -> Result<(), SetLoggerError> {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} - {}: {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()
}

/// Maps the number of `-v` flags to a log level.
pub fn verbosity_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Logs packet statistics for every hook.
///
/// # Arguments
///
/// * `snapshot` - Counters captured from the running diverter
pub fn log_statistics(snapshot: &StatisticsSnapshot) {
    let failed_percentage = if snapshot.total_received() == 0 {
        0.0
    } else {
        (snapshot.total_failed() as f64 / snapshot.total_received() as f64) * 100.0
    };

    info!(
        "Nonlocal: {} | Incoming: {} | Outgoing: {} | Failed: {:.2}%",
        snapshot.nonlocal, snapshot.incoming, snapshot.outgoing, failed_percentage
    );
    info!(
        "Nonlocal logged: {}, ICMP logged: {}, ports redirected: {}, ports restored: {}, IPs redirected: {}, sources fixed: {}",
        snapshot.nonlocal_logged,
        snapshot.icmp_logged,
        snapshot.ports_redirected,
        snapshot.ports_restored,
        snapshot.ips_redirected,
        snapshot.sources_fixed
    );
}

/// Space separated hex bytes, 16 per line.
pub fn hex_dump(octets: &[u8]) -> String {
    let mut out = String::with_capacity(octets.len() * 3);
    for (i, chunk) in octets.chunks(16).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:04x}:", i * 16);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[]), "");
        assert_eq!(hex_dump(&[0x45, 0x00, 0xff]), "0000: 45 00 ff");

        let dump = hex_dump(&[0u8; 17]);
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "0010: 00");
    }

    #[test]
    fn test_verbosity_level() {
        assert_eq!(verbosity_level(0), LevelFilter::Info);
        assert_eq!(verbosity_level(1), LevelFilter::Debug);
        assert_eq!(verbosity_level(5), LevelFilter::Trace);
    }
}
