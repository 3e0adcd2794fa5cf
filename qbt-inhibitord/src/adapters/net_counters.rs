use crate::ports::network::UploadCounter;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

const PROC_NET_DEV: &str = "/proc/net/dev";
// Transmit bytes is the ninth counter after the interface name.
const TX_BYTES_COLUMN: usize = 8;

/// Reads per-interface counters from the Linux `/proc/net/dev` table.
pub struct ProcNetDev {
    path: PathBuf,
}

impl ProcNetDev {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcNetDev {
    fn default() -> Self {
        Self::new(PROC_NET_DEV)
    }
}

#[async_trait]
impl UploadCounter for ProcNetDev {
    async fn bytes_sent(&self, interface: &str) -> Result<u64> {
        let table = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_tx_bytes(&table, interface)
    }
}

fn parse_tx_bytes(table: &str, interface: &str) -> Result<u64> {
    for line in table.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        if name.trim() != interface {
            continue;
        }
        let raw = counters
            .split_whitespace()
            .nth(TX_BYTES_COLUMN)
            .ok_or_else(|| anyhow!("truncated counters for interface {interface}"))?;
        return raw
            .parse()
            .with_context(|| format!("invalid tx byte counter `{raw}` for {interface}"));
    }
    Err(anyhow!("interface {interface} not found"))
}

/// Bytes per second to megabits per second.
pub fn to_mbit(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 * 8.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  104851     980    0    0    0     0          0         0   104851     980    0    0    0     0       0          0
  eth0: 9876543   12345    0    0    0     0          0         0  5551212    6789    0    0    0     0       0          0
";

    #[test]
    fn parses_transmit_bytes_for_interface() {
        assert_eq!(parse_tx_bytes(SAMPLE, "eth0").unwrap(), 5_551_212);
        assert_eq!(parse_tx_bytes(SAMPLE, "lo").unwrap(), 104_851);
    }

    #[test]
    fn missing_interface_is_an_error() {
        assert!(parse_tx_bytes(SAMPLE, "wlan0").is_err());
    }

    #[test]
    fn converts_to_megabits() {
        assert!((to_mbit(131_072) - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn reads_counters_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let counter = ProcNetDev::new(file.path());
        assert_eq!(counter.bytes_sent("eth0").await.unwrap(), 5_551_212);
    }
}
