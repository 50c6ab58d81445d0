/// Canonicalize a raw layer or image identifier as found in forensic
/// metadata: strip any `<algorithm>:` prefix, cut off path fragments that
/// sometimes trail the hash in carved files, and trim whitespace.
///
/// Never fails; degenerate input yields an empty string, which callers must
/// treat as not-found.
pub fn normalize(raw: &str) -> String {
    let mut id = raw.trim();

    if let Some((_, rest)) = id.split_once(':') {
        id = rest.trim_start();
    }

    if let Some(pos) = id.find(['/', '\\']) {
        id = &id[..pos];
    }

    if let Some(pos) = id.find(char::is_whitespace) {
        id = &id[..pos];
    }

    id.to_string()
}
