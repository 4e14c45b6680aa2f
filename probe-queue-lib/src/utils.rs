//! Utility functions for domain extraction and validation.
//!
//! Submissions arrive as free text ("check example.com, https://foo.org/x").
//! These helpers pull out the hostnames, strip schemes, paths and ports, and
//! validate what is left before anything reaches the queue.

use crate::error::QueueError;
use crate::types::DEFAULT_PORT;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Dotted hostname with an alphabetic top-level label.
    static ref HOSTNAME: Regex = Regex::new(
        r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$"
    )
    .expect("hostname pattern is valid");
}

/// A hostname and port pulled out of user input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainInput {
    pub domain: String,
    pub port: u16,
}

/// Result of scanning a submission for domains.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Valid, lowercased, de-duplicated targets in input order
    pub targets: Vec<DomainInput>,
    /// Tokens that looked like input but failed validation
    pub rejected: Vec<String>,
}

/// Validate a domain name format.
///
/// Checks length limits and label syntax; the top-level label must be
/// alphabetic. Expects a bare, lowercased hostname.
pub fn validate_domain(domain: &str) -> Result<(), QueueError> {
    if domain.is_empty() {
        return Err(QueueError::invalid_domain(
            domain,
            "Domain name cannot be empty",
        ));
    }

    if domain.len() > 253 {
        return Err(QueueError::invalid_domain(
            domain,
            "Domain name longer than 253 characters",
        ));
    }

    if !domain.contains('.') {
        return Err(QueueError::invalid_domain(
            domain,
            "Domain name needs at least one dot",
        ));
    }

    if !HOSTNAME.is_match(domain) {
        return Err(QueueError::invalid_domain(
            domain,
            "Domain name contains an invalid label",
        ));
    }

    Ok(())
}

/// Parse one token into a hostname and port.
///
/// Accepts `example.com`, `example.com:8443`, `https://example.com/path`
/// and similar. The result is lowercased and validated.
pub fn parse_target(token: &str) -> Result<DomainInput, QueueError> {
    let original = token.trim();
    let mut rest = original.to_lowercase();

    for scheme in ["https://", "http://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped.to_string();
            break;
        }
    }

    // Drop path, query and fragment
    if let Some(end) = rest.find(['/', '?', '#']) {
        rest.truncate(end);
    }

    // Drop userinfo
    if let Some(at) = rest.rfind('@') {
        rest = rest[at + 1..].to_string();
    }

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| {
                    QueueError::invalid_domain(original, format!("Invalid port '{}'", port_str))
                })?;
            (host.to_string(), port)
        }
        None => (rest, DEFAULT_PORT),
    };

    let host = host.trim_end_matches('.').to_string();
    validate_domain(&host).map_err(|e| match e {
        QueueError::InvalidDomain { reason, .. } => QueueError::invalid_domain(original, reason),
        other => other,
    })?;

    Ok(DomainInput { domain: host, port })
}

/// Extract every domain from a free-text submission.
///
/// Splits on whitespace and commas; duplicates (same host and port) are
/// kept once, in first-seen order.
pub fn extract_domains(text: &str) -> Extraction {
    let mut extraction = Extraction::default();

    for token in text.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
        let token = token.trim_matches(|c: char| matches!(c, '"' | '\'' | '(' | ')' | '<' | '>'));
        if token.is_empty() {
            continue;
        }

        match parse_target(token) {
            Ok(target) => {
                if !extraction.targets.contains(&target) {
                    extraction.targets.push(target);
                }
            }
            Err(_) => extraction.rejected.push(token.to_string()),
        }
    }

    extraction
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("sub.example.co.uk").is_ok());
        assert!(validate_domain("").is_err());
        assert!(validate_domain("localhost").is_err());
        assert!(validate_domain("-example.com").is_err());
        assert!(validate_domain("example-.com").is_err());
        assert!(validate_domain("example.c0m").is_err());
        assert!(validate_domain("exa_mple.com").is_err());
    }

    #[test]
    fn test_parse_target_strips_scheme_path_and_port() {
        assert_eq!(
            parse_target("https://Example.COM/login?x=1").unwrap(),
            DomainInput {
                domain: "example.com".to_string(),
                port: 443
            }
        );
        assert_eq!(
            parse_target("example.com:8443").unwrap(),
            DomainInput {
                domain: "example.com".to_string(),
                port: 8443
            }
        );
        assert_eq!(parse_target("http://a.example.org").unwrap().port, 443);
    }

    #[test]
    fn test_parse_target_rejects_bad_port() {
        assert!(parse_target("example.com:0").is_err());
        assert!(parse_target("example.com:99999").is_err());
        assert!(parse_target("example.com:http").is_err());
    }

    #[test]
    fn test_extract_domains_dedupes_in_order() {
        let extraction = extract_domains("b.com, a.com  B.COM https://a.com/x a.com:8443");
        let domains: Vec<(&str, u16)> = extraction
            .targets
            .iter()
            .map(|t| (t.domain.as_str(), t.port))
            .collect();
        assert_eq!(domains, vec![("b.com", 443), ("a.com", 443), ("a.com", 8443)]);
        assert!(extraction.rejected.is_empty());
    }

    #[test]
    fn test_extract_domains_reports_rejects() {
        let extraction = extract_domains("check example.com please");
        assert_eq!(extraction.targets.len(), 1);
        assert_eq!(extraction.rejected, vec!["check", "please"]);
    }

    #[test]
    fn test_invalid_domain_error_keeps_input() {
        let err = parse_target("not a domain").unwrap_err();
        match err {
            QueueError::InvalidDomain { domain, .. } => assert_eq!(domain, "not a domain"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
