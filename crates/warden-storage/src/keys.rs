//! Store keyspace.

/// Cached connection decision for a (client, target) pair.
pub fn conn(client: &str, target: &str) -> String {
    format!("conn:{}:{}", client, target)
}

/// Marker written whenever a pair is relayed without interception.
pub fn passthru(client: &str, target: &str) -> String {
    format!("passthru:{}:{}", client, target)
}

/// Stop-filtering shortcut for one request shape.
pub fn filter_bypass(method: &str, user_agent: &str, url: &str) -> String {
    format!("filter_bypass:{}:{}:{}", method, user_agent, url)
}

pub fn security_level(client: &str) -> String {
    format!("security_level:{}", client)
}

/// Set of fqdns whose apps pin certificates.
pub fn pinned(client: &str) -> String {
    format!("pinned:{}", client)
}

pub fn flex_include(client: &str) -> String {
    format!("flex_include:{}", client)
}

pub fn flex_exclude(client: &str) -> String {
    format!("flex_exclude:{}", client)
}

/// Fqdns a client resolved to `server`, captured from DNS.
pub fn dns(server: &str, client: &str) -> String {
    format!("dns:{}:{}", server, client)
}

pub fn show_block_stats(client: &str) -> String {
    format!("show_block_stats:{}", client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(conn("10.0.0.2", "1.2.3.4"), "conn:10.0.0.2:1.2.3.4");
        assert_eq!(
            filter_bypass("GET", "UNKNOWN", "https://a/b"),
            "filter_bypass:GET:UNKNOWN:https://a/b"
        );
        assert_eq!(dns("1.2.3.4", "10.0.0.2"), "dns:1.2.3.4:10.0.0.2");
    }
}
