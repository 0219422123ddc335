//! Flex domain membership.
//!
//! A client opts domains into flex routing with an include set and carves
//! exceptions out with an exclude set. An include entry covers the name and
//! everything beneath it, so `example.com` covers `img.example.com`; a bare
//! top-level label is never consulted. Exclusions only match the exact name.

/// Iterates a name and each of its dot-separated ancestors.
///
/// `a.b.example.com` yields `a.b.example.com`, `b.example.com`,
/// `example.com`, `com`.
pub fn domain_ancestors(fqdn: &str) -> impl Iterator<Item = &str> {
    let fqdn = fqdn.trim_end_matches('.');
    let mut next = if fqdn.is_empty() { None } else { Some(fqdn) };
    std::iter::from_fn(move || {
        let current = next?;
        next = current.split_once('.').map(|(_, rest)| rest).filter(|r| !r.is_empty());
        Some(current)
    })
}

/// True if `fqdn` or one of its multi-label ancestors satisfies `is_listed`.
pub fn matches_domain_set<F>(fqdn: &str, is_listed: F) -> bool
where
    F: Fn(&str) -> bool,
{
    let fqdn = fqdn.to_lowercase();
    let found = domain_ancestors(&fqdn)
        .take_while(|name| name.contains('.'))
        .any(is_listed);
    found
}

/// Decides flex membership. An excluded name is never flex, but its
/// subdomains still follow the include set.
pub fn is_flex_domain<I, E>(fqdn: &str, included: I, excluded: E) -> bool
where
    I: Fn(&str) -> bool,
    E: Fn(&str) -> bool,
{
    let exact = fqdn.trim_end_matches('.').to_lowercase();
    if exact.is_empty() || excluded(&exact) {
        return false;
    }
    matches_domain_set(&exact, included)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ancestors_walk_to_tld() {
        let names: Vec<&str> = domain_ancestors("a.b.example.com").collect();
        assert_eq!(names, vec!["a.b.example.com", "b.example.com", "example.com", "com"]);
    }

    #[test]
    fn ancestors_of_empty_name() {
        assert_eq!(domain_ancestors("").count(), 0);
        assert_eq!(domain_ancestors("example.com.").count(), 2);
    }

    #[test]
    fn exclusion_matches_exact_name_only() {
        let include = set(&["example.com"]);
        let exclude = set(&["ads.example.com"]);
        let check = |fqdn: &str| {
            is_flex_domain(fqdn, |d| include.contains(d), |d| exclude.contains(d))
        };

        assert!(check("img.example.com"));
        assert!(check("example.com"));
        assert!(!check("ads.example.com"));
        assert!(check("x.ads.example.com"));
        assert!(!check("example.org"));
    }

    #[test]
    fn top_level_label_never_matches() {
        let include = set(&["com"]);
        let check = |fqdn: &str| is_flex_domain(fqdn, |d| include.contains(d), |_| false);

        assert!(!check("example.com"));
        assert!(!check("a.b.example.com"));
        assert!(!check("com"));
    }

    #[test]
    fn membership_is_case_insensitive() {
        let include = set(&["example.com"]);
        assert!(is_flex_domain("IMG.Example.com", |d| include.contains(d), |_| false));
    }
}
