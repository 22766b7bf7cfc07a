//! Signer-name syntax and the trust-bundle name prefix rule.
//!
//! Signer names are qualified identifiers of the form `<domain>/<path>`,
//! e.g. `kubernetes.io/default-workload-certificate`. A trust bundle linked
//! to a signer must carry that signer in its name, with `/` translated to
//! `:` (the translation is bijective because `/` cannot appear in object
//! names and `:` cannot appear in signer names).

const MAX_DOMAIN_LEN: usize = 253;

fn is_dns1123_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let bytes = label.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}

fn is_dns1123_subdomain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= MAX_DOMAIN_LEN
        && domain.split('.').all(is_dns1123_label)
}

fn is_valid_path_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    let bytes = segment.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}

/// Validate signer-name syntax: `<domain>/<path>` with a DNS-compliant,
/// non-empty domain and a non-empty path.
pub fn validate_signer_name(name: &str) -> Result<(), String> {
    let malformed = || {
        Err(format!(
            "{:?} must be a fully qualified domain and path of the form 'example.com/signer-name'",
            name
        ))
    };

    let Some((domain, path)) = name.split_once('/') else {
        return malformed();
    };
    if path.contains('/') {
        return malformed();
    }
    if !is_dns1123_subdomain(domain) {
        return malformed();
    }
    if path.is_empty() || !path.split('.').all(is_valid_path_segment) {
        return malformed();
    }
    Ok(())
}

/// The domain portion of a well-formed signer name.
pub fn signer_domain(signer_name: &str) -> &str {
    signer_name.split_once('/').map_or(signer_name, |(d, _)| d)
}

/// The name prefix required of a trust bundle linked to `signer_name`:
/// the signer name with `/` translated to `:`, plus a trailing `:`.
pub fn required_bundle_name_prefix(signer_name: &str) -> String {
    format!("{}:", signer_name.replace('/', ":"))
}

/// Validate a trust-bundle object name against its signer linkage.
///
/// A bundle with a signer must be named `<prefix><non-empty suffix>` where
/// the prefix derives from the signer name. A bundle without a signer must
/// not carry a name that could be mistaken for a signer-derived one, which
/// the `/` to `:` translation reduces to: no `:` anywhere in the name.
pub fn validate_bundle_name(name: &str, signer_name: &str) -> Result<(), String> {
    if signer_name.is_empty() {
        if name.contains(':') {
            return Err(
                "bundles without a signer name must not contain \":\" in their name".to_string(),
            );
        }
        return Ok(());
    }

    let prefix = required_bundle_name_prefix(signer_name);
    if !name.starts_with(&prefix) || name.len() == prefix.len() {
        return Err(format!(
            "bundle name must begin with {:?} followed by a non-empty suffix",
            prefix
        ));
    }
    Ok(())
}
