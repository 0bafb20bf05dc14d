//! Input validation for artifact ids, source URLs and destination filenames
//!
//! All checks are pure predicates: malformed input yields `false`, never an
//! error or a panic.

use url::Url;

/// Longest accepted artifact id
pub const MAX_ID_LEN: usize = 150;

/// Filenames must be strictly shorter than this
pub const MAX_FILENAME_LEN: usize = 100;

/// Extension every artifact destination filename must carry
pub const ARTIFACT_EXTENSION: &str = ".gguf";

/// Check artifact id syntax: non-empty, bounded, `[A-Za-z0-9._-]+`
pub fn valid_artifact_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Check that a URL is https and its host is on the allow-list
///
/// A host matches an allow-list entry when it equals the entry or is a
/// subdomain of it (`cdn.example.com` matches `example.com`, `badexample.com`
/// does not).
pub fn valid_url(url: &str, allowed_hosts: &[String]) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };

    if parsed.scheme() != "https" {
        return false;
    }

    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();

    allowed_hosts.iter().any(|allowed| {
        let allowed = allowed.trim().trim_start_matches('.').to_ascii_lowercase();
        !allowed.is_empty()
            && (host == allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.')))
    })
}

/// Check that a filename stays inside its directory and has the artifact extension
pub fn valid_filename(name: &str) -> bool {
    !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
        && name.len() > ARTIFACT_EXTENSION.len()
        && name.len() < MAX_FILENAME_LEN
        && name.ends_with(ARTIFACT_EXTENSION)
}

/// True if the string carries characters a shell would interpret
pub fn has_shell_metachars(s: &str) -> bool {
    s.chars().any(|c| matches!(c, ';' | '&' | '|' | '`'))
}
