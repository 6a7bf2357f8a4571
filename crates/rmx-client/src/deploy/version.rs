//! Loose version parsing for `--version` style output

/// First dotted number in `text`, e.g. `"v18.19.0"` or `"Python 3.11.4"`
pub fn parse_version(text: &str) -> Option<String> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let version: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let version = version.trim_end_matches('.');
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}

fn components(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

/// Component-wise comparison; missing components count as zero
pub fn version_at_least(found: &str, required: &str) -> bool {
    let found = components(found);
    let required = components(required);
    let len = found.len().max(required.len());
    for i in 0..len {
        let a = found.get(i).copied().unwrap_or(0);
        let b = required.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    true
}
