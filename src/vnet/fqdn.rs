//! Domain name helpers for matching VNet names against cluster zones

/// Append the trailing root dot if missing.
pub fn fully_qualify(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// Whether `name` lies strictly below `zone` (`a.b.zone` and `b.zone`, not `zone` itself).
pub fn is_descendant_subdomain(name: &str, zone: &str) -> bool {
    if zone.is_empty() {
        return false;
    }
    let name = fully_qualify(name).to_ascii_lowercase();
    let suffix = format!(".{}", fully_qualify(zone).to_ascii_lowercase());
    name.len() > suffix.len() && name.ends_with(&suffix)
}

/// Bare target hostname for `fqdn`, with the root and optional leaf cluster suffix removed.
///
/// `host.leaf.example.com` with leaf `leaf` and root `example.com` yields `host`.
pub fn strip_ssh_suffix(fqdn: &str, leaf_cluster: &str, root_cluster: &str) -> String {
    let fqdn = fully_qualify(fqdn);
    let mut stripped = strip_suffix_ignore_case(&fqdn, &format!(".{}", fully_qualify(root_cluster)));
    if !leaf_cluster.is_empty() {
        stripped = strip_suffix_ignore_case(stripped, &format!(".{leaf_cluster}"));
    }
    stripped.trim_end_matches('.').to_string()
}

fn strip_suffix_ignore_case<'a>(s: &'a str, suffix: &str) -> &'a str {
    if s.len() >= suffix.len() {
        let split = s.len() - suffix.len();
        if s.is_char_boundary(split) && s[split..].eq_ignore_ascii_case(suffix) {
            return &s[..split];
        }
    }
    s
}
