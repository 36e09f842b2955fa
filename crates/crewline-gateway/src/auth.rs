use crewline_core::config::GatewayConfig;

/// Whether a request presenting `bearer` or `?token=` may use the API.
///
/// With no token configured every request is accepted.
pub fn validate_auth(config: &GatewayConfig, bearer: Option<&str>, query_token: Option<&str>) -> bool {
    let Some(expected) = config.token.as_deref() else {
        return true;
    };
    match bearer {
        Some(value) => value == expected,
        None => query_token == Some(expected),
    }
}

/// Extract token from the query string (?token=...).
pub fn extract_token_from_query(query: &str) -> Option<&str> {
    for pair in query.split('&') {
        if let Some(val) = pair.strip_prefix("token=") {
            return Some(val);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(token: Option<&str>) -> GatewayConfig {
        GatewayConfig {
            bind: "127.0.0.1:18790".to_string(),
            token: token.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_no_token_always_passes() {
        let config = gateway(None);
        assert!(validate_auth(&config, None, None));
        assert!(validate_auth(&config, Some("anything"), None));
    }

    #[test]
    fn test_token_auth() {
        let config = gateway(Some("secret"));
        assert!(!validate_auth(&config, None, None));
        assert!(!validate_auth(&config, Some("wrong"), None));
        assert!(validate_auth(&config, Some("secret"), None));
        assert!(validate_auth(&config, None, Some("secret")));
        // A wrong bearer is not rescued by the query string
        assert!(!validate_auth(&config, Some("wrong"), Some("secret")));
    }

    #[test]
    fn test_extract_token_from_query() {
        assert_eq!(extract_token_from_query("a=1&token=abc"), Some("abc"));
        assert_eq!(extract_token_from_query("a=1"), None);
        assert_eq!(extract_token_from_query(""), None);
    }
}
