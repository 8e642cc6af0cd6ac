use std::net::IpAddr;
use shared::protocol::{FIRST_HOP_INDEX, UNRESPONSIVE_HOP};
use shared::types::{Hop, RawCapture};
use crate::error::{HistoryError, Result};

/// A token found in one hop's observation text.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Timeout,
    Latency(Option<f64>),
    Annotation,
    Ip(IpAddr),
    Host(String),
    Other,
}

/// Turns raw probe hops into canonical hops.
///
/// Hop indices must run `1..=n` without gaps. Each hop keeps one canonical
/// address (or none when it timed out) and the first latency sample seen
/// after that address, or before it when nothing follows. Two captures of the same path normalize to the same
/// addresses regardless of timing text or address spelling.
pub fn normalize(capture: &RawCapture) -> Result<Vec<Hop>> {
    let mut hops = Vec::with_capacity(capture.hops.len());

    for (expected, raw) in (FIRST_HOP_INDEX..).zip(&capture.hops) {
        if raw.index != expected {
            return Err(HistoryError::MalformedCapture(format!(
                "hop {} found where hop {} was expected",
                raw.index, expected
            )));
        }
        hops.push(normalize_hop(raw.index, &raw.observation)?);
    }

    Ok(hops)
}

/// Canonical sequence used for fingerprinting: addresses only, `None` for timeouts.
pub fn canonical_path(hops: &[Hop]) -> Vec<Option<&str>> {
    hops.iter().map(|hop| hop.address.as_deref()).collect()
}

fn normalize_hop(index: u32, observation: &str) -> Result<Hop> {
    let text = observation.trim();

    // tracert prints this instead of per-probe stars
    if text.is_empty() || text.to_ascii_lowercase().contains("timed out") {
        return Ok(Hop { index, address: None, latency_ms: None });
    }

    let tokens: Vec<Token> = text.split_whitespace().map(classify).collect();

    let chosen = tokens
        .iter()
        .enumerate()
        .find_map(|(pos, t)| match t {
            Token::Ip(ip) => Some((pos, ip.to_string())),
            _ => None,
        })
        .or_else(|| {
            tokens.iter().enumerate().find_map(|(pos, t)| match t {
                Token::Host(host) => Some((pos, host.clone())),
                _ => None,
            })
        });

    let Some((pos, address)) = chosen else {
        if tokens.contains(&Token::Timeout) {
            return Ok(Hop { index, address: None, latency_ms: None });
        }
        return Err(HistoryError::MalformedCapture(format!(
            "hop {} has neither an address nor a timeout marker: {:?}",
            index, text
        )));
    };

    // traceroute prints samples after the address, tracert before it
    let first_latency = |slice: &[Token]| {
        slice.iter().find_map(|t| match t {
            Token::Latency(Some(ms)) => Some(*ms),
            _ => None,
        })
    };
    let latency_ms = first_latency(&tokens[pos + 1..]).or_else(|| first_latency(&tokens[..pos]));

    Ok(Hop {
        index,
        address: Some(address),
        latency_ms,
    })
}

fn classify(token: &str) -> Token {
    if !token.is_empty() && token.trim_start_matches(UNRESPONSIVE_HOP).is_empty() {
        return Token::Timeout;
    }
    if token.starts_with('!') {
        return Token::Annotation;
    }

    let lower = token.to_ascii_lowercase();
    if lower == "ms" || lower == "msec" {
        return Token::Latency(None);
    }
    if let Some(ms) = parse_latency(&lower) {
        return Token::Latency(Some(ms));
    }

    // "host (10.0.0.1)" from traceroute, "host [10.0.0.1]" from tracert
    let unwrapped = token
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .or_else(|| token.strip_prefix('[').and_then(|t| t.strip_suffix(']')))
        .unwrap_or(token);

    if let Ok(ip) = unwrapped.parse::<IpAddr>() {
        return Token::Ip(ip);
    }
    if is_hostname(unwrapped) {
        return Token::Host(unwrapped.trim_end_matches('.').to_ascii_lowercase());
    }

    Token::Other
}

fn parse_latency(lower: &str) -> Option<f64> {
    let value = lower
        .strip_suffix("msec")
        .or_else(|| lower.strip_suffix("ms"))
        .unwrap_or(lower);
    let value = value.strip_prefix('<').unwrap_or(value);
    value.parse::<f64>().ok().filter(|ms| ms.is_finite())
}

fn is_hostname(token: &str) -> bool {
    !token.is_empty()
        && token.chars().any(|c| c.is_ascii_alphabetic())
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::RawHop;

    fn capture(lines: &[(u32, &str)]) -> RawCapture {
        RawCapture {
            hops: lines
                .iter()
                .map(|(index, observation)| RawHop {
                    index: *index,
                    observation: observation.to_string(),
                })
                .collect(),
            raw: None,
            captured_at: None,
        }
    }

    fn addresses(hops: &[Hop]) -> Vec<Option<&str>> {
        canonical_path(hops)
    }

    #[test]
    fn test_latency_is_stripped() {
        let a = normalize(&capture(&[(1, "10.0.0.1  0.512 ms  0.430 ms  0.401 ms")])).unwrap();
        let b = normalize(&capture(&[(1, "10.0.0.1  9.100 ms  8.200 ms  7.300 ms")])).unwrap();

        assert_eq!(addresses(&a), addresses(&b));
        assert_eq!(a[0].latency_ms, Some(0.512));
        assert_eq!(b[0].latency_ms, Some(9.1));
    }

    #[test]
    fn test_address_forms_are_canonicalized() {
        let hops = normalize(&capture(&[
            (1, "Router.Example.COM. (10.0.0.1)  1.0 ms"),
            (2, "FE80:0000::0001  2ms"),
            (3, "Core-1.Example.net  3 ms"),
            (4, "gw.example.net [192.0.2.4]  <1 ms  <1 ms"),
        ]))
        .unwrap();

        assert_eq!(
            addresses(&hops),
            vec![
                Some("10.0.0.1"),
                Some("fe80::1"),
                Some("core-1.example.net"),
                Some("192.0.2.4"),
            ]
        );
        assert_eq!(hops[1].latency_ms, Some(2.0));
        assert_eq!(hops[3].latency_ms, Some(1.0));
    }

    #[test]
    fn test_timeouts_are_positional() {
        let truncated = normalize(&capture(&[(1, "10.0.0.1 1 ms"), (2, "* * *")])).unwrap();
        let padded = normalize(&capture(&[
            (1, "10.0.0.1 1 ms"),
            (2, "* * *"),
            (3, "* * *"),
        ]))
        .unwrap();

        assert_eq!(addresses(&truncated), vec![Some("10.0.0.1"), None]);
        assert_eq!(addresses(&padded), vec![Some("10.0.0.1"), None, None]);
        assert_ne!(addresses(&truncated), addresses(&padded));
    }

    #[test]
    fn test_partial_timeouts_keep_the_address() {
        let hops = normalize(&capture(&[(1, "* 10.0.0.7  3.1 ms *")])).unwrap();
        assert_eq!(hops[0].address.as_deref(), Some("10.0.0.7"));
        assert_eq!(hops[0].latency_ms, Some(3.1));
    }

    #[test]
    fn test_windows_timeout_line() {
        let hops = normalize(&capture(&[(1, "*        *        *     Request timed out.")])).unwrap();
        assert_eq!(hops[0].address, None);
    }

    #[test]
    fn test_leading_latency_is_kept() {
        let hops = normalize(&capture(&[
            (1, "<1 ms    <1 ms    <1 ms  192.168.1.1"),
            (2, "12 ms    11 ms    12 ms  example.net [192.0.2.9]"),
        ]))
        .unwrap();

        assert_eq!(hops[0].latency_ms, Some(1.0));
        assert_eq!(hops[1].address.as_deref(), Some("192.0.2.9"));
        assert_eq!(hops[1].latency_ms, Some(12.0));
    }

    #[test]
    fn test_annotations_are_ignored() {
        let hops = normalize(&capture(&[(1, "10.0.0.9  1.2 ms !H  1.3 ms !H")])).unwrap();
        assert_eq!(hops[0].address.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn test_empty_capture_is_valid() {
        let hops = normalize(&RawCapture::default()).unwrap();
        assert!(hops.is_empty());
    }

    #[test]
    fn test_index_gap_is_malformed() {
        let result = normalize(&capture(&[(1, "10.0.0.1"), (3, "10.0.0.3")]));
        assert!(matches!(result, Err(HistoryError::MalformedCapture(_))));
    }

    #[test]
    fn test_index_must_start_at_one() {
        let result = normalize(&capture(&[(0, "10.0.0.1")]));
        assert!(matches!(result, Err(HistoryError::MalformedCapture(_))));
    }

    #[test]
    fn test_duplicate_index_is_malformed() {
        let result = normalize(&capture(&[(1, "10.0.0.1"), (1, "10.0.0.2")]));
        assert!(matches!(result, Err(HistoryError::MalformedCapture(_))));
    }

    #[test]
    fn test_timing_without_address_is_malformed() {
        let result = normalize(&capture(&[(1, "1.234 ms 2.345 ms")]));
        assert!(matches!(result, Err(HistoryError::MalformedCapture(_))));
    }
}
