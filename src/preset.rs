use crate::kv_config::KvConfig;

/// A named prediction configuration a client can refer to by identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub identifier: String,
    pub name: String,
    pub config: KvConfig,
}

impl Preset {
    pub fn new(identifier: impl Into<String>, name: impl Into<String>, config: KvConfig) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.into(),
            config,
        }
    }
}

// Case folding here and in `find_preset` is Unicode lowercase, not ASCII-only.
fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Looks a preset up with limited fuzzy matching, from strictest to loosest:
/// exact identifier, identifier compared after Unicode lowercasing,
/// normalized identifier or name (lowercased alphanumerics only), then a
/// normalized prefix that matches exactly one preset.
pub fn find_preset<'a>(presets: &'a [Preset], query: &str) -> Option<&'a Preset> {
    if let Some(preset) = presets.iter().find(|p| p.identifier == query) {
        return Some(preset);
    }
    let lowered = query.to_lowercase();
    if let Some(preset) = presets
        .iter()
        .find(|p| p.identifier.to_lowercase() == lowered)
    {
        return Some(preset);
    }

    let needle = normalize(query);
    if needle.is_empty() {
        return None;
    }
    if let Some(preset) = presets
        .iter()
        .find(|p| normalize(&p.identifier) == needle || normalize(&p.name) == needle)
    {
        return Some(preset);
    }

    let mut prefixed = presets.iter().filter(|p| {
        normalize(&p.identifier).starts_with(&needle) || normalize(&p.name).starts_with(&needle)
    });
    match (prefixed.next(), prefixed.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}
