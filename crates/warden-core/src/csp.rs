//! Content-Security-Policy rewriting.
//!
//! Filtered pages get markup injected by the filter backend. For the browser
//! to run it, the page's CSP must allow a nonce the backend knows about. The
//! nonce is derived from the request id, which the backend already has.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Directives that receive the nonce.
const NONCE_DIRECTIVES: &[&str] = &["script-src", "style-src"];

/// Fallback directive when none of [`NONCE_DIRECTIVES`] is present.
const DEFAULT_DIRECTIVE: &str = "default-src";

const UNSAFE_INLINE: &str = "'unsafe-inline'";

/// Nonce for a filtered request: the base64 of its request id.
pub fn request_nonce(request_id: &str) -> String {
    STANDARD.encode(request_id.as_bytes())
}

/// Rewrites a CSP header value so that `'nonce-{nonce}'` is allowed.
///
/// Existing `'nonce-…'` and `'sha…'` sources are kept. A nonce is only added
/// to a directive when it has no `'unsafe-inline'`, or when it lists a hash
/// source but no nonce (browsers ignore `'unsafe-inline'` in that case).
pub fn rewrite_csp(csp: &str, nonce: &str) -> String {
    let directives: Vec<&str> = csp
        .split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .collect();

    let has_specific = directives
        .iter()
        .any(|d| NONCE_DIRECTIVES.contains(&directive_name(d).as_str()));

    directives
        .iter()
        .map(|d| {
            let name = directive_name(d);
            let targeted = if has_specific {
                NONCE_DIRECTIVES.contains(&name.as_str())
            } else {
                name == DEFAULT_DIRECTIVE
            };
            if targeted && needs_nonce(d) {
                format!("{} 'nonce-{}'", d, nonce)
            } else {
                d.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn directive_name(directive: &str) -> String {
    directive
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

fn needs_nonce(directive: &str) -> bool {
    let sources: Vec<String> = directive
        .split_whitespace()
        .skip(1)
        .map(str::to_lowercase)
        .collect();
    let unsafe_inline = sources.iter().any(|s| s == UNSAFE_INLINE);
    let has_nonce = sources.iter().any(|s| s.starts_with("'nonce-"));
    let has_sha = sources.iter().any(|s| s.starts_with("'sha"));
    !unsafe_inline || (has_sha && !has_nonce)
}
