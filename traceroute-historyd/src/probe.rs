use std::process::Stdio;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use tokio::process::Command;
use shared::types::{RawCapture, RawHop};
use crate::config::ProbeConfig;

/// Run the configured traceroute command against `address` and parse its output.
/// The child is killed if it outlives `timeout_secs`.
pub async fn run_traceroute(config: &ProbeConfig, address: &str) -> Result<RawCapture> {
    let mut command = Command::new(&config.command);
    command
        .args(&config.args)
        .arg(address)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {}", config.command))?;

    let output = tokio::time::timeout(
        Duration::from_secs(config.timeout_secs),
        child.wait_with_output(),
    )
    .await
    .with_context(|| format!("{} {} timed out after {}s", config.command, address, config.timeout_secs))?
    .with_context(|| format!("Failed to collect output of {}", config.command))?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // traceroute exits non-zero on some unreachable paths but still prints hops
        if stdout.trim().is_empty() {
            bail!("{} {} failed ({}): {}", config.command, address, output.status, stderr.trim());
        }
        tracing::warn!("{} {} exited with {}: {}", config.command, address, output.status, stderr.trim());
    }

    Ok(parse_output(&stdout))
}

/// Split traceroute/tracert output into hops.
///
/// A line whose first token is a number starts a hop. Indented lines without
/// a number continue the previous hop (extra probes answered by another
/// router). Banner lines are ignored.
pub fn parse_output(output: &str) -> RawCapture {
    let mut hops: Vec<RawHop> = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (first, rest) = trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((trimmed, ""));

        if let Ok(index) = first.parse::<u32>() {
            hops.push(RawHop {
                index,
                observation: rest.trim().to_string(),
            });
        } else if line.starts_with(char::is_whitespace) {
            if let Some(last) = hops.last_mut() {
                last.observation.push(' ');
                last.observation.push_str(trimmed);
            }
        }
    }

    RawCapture {
        hops,
        raw: Some(output.to_string()),
        captured_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX_OUTPUT: &str = "\
traceroute to 10.0.0.9 (10.0.0.9), 30 hops max, 60 byte packets
 1  10.0.0.1  0.512 ms  0.430 ms  0.401 ms
 2  10.0.0.2  1.120 ms
    10.0.0.22  1.300 ms  1.250 ms
 3  * * *
 4  10.0.0.9  3.001 ms  2.998 ms  3.010 ms
";

    const WINDOWS_OUTPUT: &str = "\
Tracing route to example.net [192.0.2.9]
over a maximum of 30 hops:

  1    <1 ms    <1 ms    <1 ms  192.168.1.1
  2     *        *        *     Request timed out.
  3    12 ms    11 ms    12 ms  example.net [192.0.2.9]

Trace complete.
";

    #[test]
    fn test_parse_linux_output() {
        let capture = parse_output(LINUX_OUTPUT);

        let indices: Vec<_> = capture.hops.iter().map(|h| h.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
        assert_eq!(capture.hops[1].observation, "10.0.0.2  1.120 ms 10.0.0.22  1.300 ms  1.250 ms");
        assert_eq!(capture.hops[2].observation, "* * *");
        assert_eq!(capture.raw.as_deref(), Some(LINUX_OUTPUT));
    }

    #[test]
    fn test_parse_windows_output() {
        let capture = parse_output(WINDOWS_OUTPUT);

        let indices: Vec<_> = capture.hops.iter().map(|h| h.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(capture.hops[0].observation, "<1 ms    <1 ms    <1 ms  192.168.1.1");
    }

    #[test]
    fn test_parsed_output_normalizes() {
        let hops = crate::capture::normalize(&parse_output(WINDOWS_OUTPUT)).unwrap();
        let path: Vec<_> = hops.iter().map(|h| h.address.as_deref()).collect();
        assert_eq!(path, vec![Some("192.168.1.1"), None, Some("192.0.2.9")]);
        let latencies: Vec<_> = hops.iter().map(|h| h.latency_ms).collect();
        assert_eq!(latencies, vec![Some(1.0), None, Some(12.0)]);

        let hops = crate::capture::normalize(&parse_output(LINUX_OUTPUT)).unwrap();
        assert_eq!(hops[1].address.as_deref(), Some("10.0.0.2"));
        assert_eq!(hops[1].latency_ms, Some(1.12));
    }

    #[test]
    fn test_empty_output() {
        assert!(parse_output("").hops.is_empty());
    }

    #[tokio::test]
    async fn test_run_command_output_is_parsed() {
        let config = ProbeConfig {
            command: "echo".to_string(),
            args: vec!["1".to_string(), "10.0.0.1".to_string(), "0.5".to_string(), "ms".to_string()],
            ..ProbeConfig::default()
        };

        let capture = run_traceroute(&config, "10.0.0.2").await.unwrap();
        assert_eq!(capture.hops.len(), 1);
        assert_eq!(capture.hops[0].observation, "10.0.0.1 0.5 ms 10.0.0.2");
    }

    #[tokio::test]
    async fn test_run_command_times_out() {
        let config = ProbeConfig {
            command: "sleep".to_string(),
            args: Vec::new(),
            timeout_secs: 1,
            ..ProbeConfig::default()
        };

        let result = run_traceroute(&config, "10").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_missing_command() {
        let config = ProbeConfig {
            command: "definitely-not-a-traceroute-binary".to_string(),
            ..ProbeConfig::default()
        };
        assert!(run_traceroute(&config, "10.0.0.1").await.is_err());
    }
}
