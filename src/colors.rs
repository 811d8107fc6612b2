// colors.rs
use crate::models::Color;
use std::collections::HashMap;

/// Maps free-form color labels (the arm firmware and the dashboard do not
/// agree on a language) onto [`Color`].
#[derive(Debug, Clone)]
pub struct ColorTable {
    aliases: HashMap<String, Color>,
}

impl ColorTable {
    pub fn new<I, S>(aliases: I) -> Self
    where
        I: IntoIterator<Item = (S, Color)>,
        S: AsRef<str>,
    {
        let aliases = aliases
            .into_iter()
            .map(|(label, color)| (normalize_key(label.as_ref()), color))
            .collect();
        Self { aliases }
    }

    /// Canonical names always resolve to themselves; aliases are matched
    /// ignoring case and surrounding whitespace.
    pub fn normalize(&self, label: &str) -> Option<Color> {
        let key = normalize_key(label);
        if let Some(color) = self.aliases.get(&key) {
            return Some(*color);
        }
        Color::ALL
            .into_iter()
            .find(|color| color.as_str().eq_ignore_ascii_case(&key))
    }
}

impl Default for ColorTable {
    fn default() -> Self {
        Self::new(default_aliases())
    }
}

pub fn default_aliases() -> HashMap<String, Color> {
    [
        ("merah", Color::Red),
        ("hijau", Color::Green),
        ("biru", Color::Blue),
        ("kuning", Color::Yellow),
    ]
    .into_iter()
    .map(|(label, color)| (label.to_string(), color))
    .collect()
}

fn normalize_key(label: &str) -> String {
    label.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_and_indonesian_labels_resolve() {
        let table = ColorTable::default();
        assert_eq!(table.normalize("Red"), Some(Color::Red));
        assert_eq!(table.normalize("yellow"), Some(Color::Yellow));
        assert_eq!(table.normalize(" Merah "), Some(Color::Red));
        assert_eq!(table.normalize("HIJAU"), Some(Color::Green));
        assert_eq!(table.normalize("purple"), None);
    }

    #[test]
    fn configured_aliases_extend_the_table() {
        let table = ColorTable::new([("Rouge", Color::Red), ("bleu", Color::Blue)]);
        assert_eq!(table.normalize("rouge"), Some(Color::Red));
        assert_eq!(table.normalize("BLEU"), Some(Color::Blue));
        assert_eq!(table.normalize("merah"), None);
        assert_eq!(table.normalize("Green"), Some(Color::Green));
    }
}
