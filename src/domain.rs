//! Domain derivation for websites and email addresses.
//!
//! Domains are never stored; accounts keep their website and the domain is
//! derived here whenever a match or externality check needs it.

/// Derive the domain of a website value.
///
/// Trims, prefixes `https://` when no scheme is present, lowercases the host
/// and strips a leading `www.`. Returns `None` for empty or unparseable input.
pub fn extract_domain(website: &str) -> Option<String> {
    let trimmed = website.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let parsed = url::Url::parse(&candidate).ok()?;
    let host = parsed.host_str()?.trim_end_matches('.').to_lowercase();
    normalize_host(&host)
}

/// Domain of an email address: text after the last `@`.
pub fn email_domain(email: &str) -> Option<String> {
    let (_, domain) = email.trim().rsplit_once('@')?;
    normalize_host(&domain.trim().to_lowercase())
}

fn normalize_host(host: &str) -> Option<String> {
    let host = host.strip_prefix("www.").unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// True when `domain` equals `org_domain` or is one of its subdomains.
/// Both sides compare case-insensitively.
pub fn domain_matches(domain: &str, org_domain: &str) -> bool {
    let domain = domain.to_lowercase();
    let org = org_domain.to_lowercase();
    let org = org.strip_prefix("www.").unwrap_or(&org);
    if org.is_empty() {
        return false;
    }
    domain == org || domain.ends_with(&format!(".{}", org))
}

/// Whether a meeting includes someone outside the organization.
///
/// The syncing user is ignored. With no organization domain every other
/// attendee counts as external. Attendees without a parseable domain are
/// skipped.
pub fn is_external(attendees: &[String], self_email: &str, org_domain: Option<&str>) -> bool {
    attendees
        .iter()
        .filter(|a| !a.trim().eq_ignore_ascii_case(self_email.trim()))
        .filter_map(|a| email_domain(a))
        .any(|domain| match org_domain.filter(|d| !d.trim().is_empty()) {
            Some(org) => !domain_matches(&domain, org),
            None => true,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain_normalizes() {
        assert_eq!(
            extract_domain("HTTPS://WWW.Example.com").as_deref(),
            Some("example.com")
        );
        assert_eq!(extract_domain("acme.com").as_deref(), Some("acme.com"));
        assert_eq!(
            extract_domain("  https://www.acme.com/about?x=1 ").as_deref(),
            Some("acme.com")
        );
        assert_eq!(
            extract_domain("http://shop.acme.co.uk:8080").as_deref(),
            Some("shop.acme.co.uk")
        );
    }

    #[test]
    fn test_extract_domain_is_idempotent() {
        for input in ["HTTPS://WWW.Example.com", "www.acme.io/path", "sub.Foo.org"] {
            let once = extract_domain(input).unwrap();
            assert_eq!(extract_domain(&once).as_deref(), Some(once.as_str()));
        }
    }

    #[test]
    fn test_extract_domain_rejects_junk() {
        assert!(extract_domain("").is_none());
        assert!(extract_domain("   ").is_none());
        assert!(extract_domain("https://").is_none());
        assert!(extract_domain("not a url with spaces").is_none());
    }

    #[test]
    fn test_email_domain() {
        assert_eq!(email_domain("Jane@ACME.com").as_deref(), Some("acme.com"));
        assert_eq!(email_domain("odd@name@www.acme.com").as_deref(), Some("acme.com"));
        assert!(email_domain("no-at-sign").is_none());
        assert!(email_domain("trailing@").is_none());
    }

    #[test]
    fn test_domain_matches_subdomains() {
        assert!(domain_matches("example.com", "example.com"));
        assert!(domain_matches("sub.example.com", "Example.com"));
        assert!(!domain_matches("badexample.com", "example.com"));
        assert!(!domain_matches("example.com", ""));
    }

    #[test]
    fn test_is_external() {
        let internal = vec!["me@seller.io".to_string(), "cto@eu.seller.io".to_string()];
        assert!(!is_external(&internal, "me@seller.io", Some("seller.io")));

        let mixed = vec!["me@seller.io".to_string(), "jane@acme.com".to_string()];
        assert!(is_external(&mixed, "me@seller.io", Some("seller.io")));

        let only_self = vec!["ME@seller.io".to_string()];
        assert!(!is_external(&only_self, "me@seller.io", None));
        assert!(is_external(&internal, "me@seller.io", None));
    }
}
