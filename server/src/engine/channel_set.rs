use std::collections::HashMap;

/// Maximum channel name length accepted by the upstream service.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 25;

/// Normalize a channel name: trim, strip one leading `#`, lowercase.
/// Returns None if the result is empty or contains anything other than
/// ASCII alphanumerics and underscores.
pub fn normalize_channel_name(raw: &str) -> Option<String> {
    let name = raw.trim();
    let name = name.strip_prefix('#').unwrap_or(name);

    if name.is_empty() || name.len() > MAX_CHANNEL_NAME_LENGTH {
        return None;
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    Some(name.to_ascii_lowercase())
}

/// Ordered, duplicate-free set of joined channel names.
///
/// Iteration follows insertion order until the first removal; removal swaps
/// the last member into the vacated slot.
#[derive(Debug, Default, Clone)]
pub struct ChannelSet {
    names: Vec<String>,
    /// name -> index into `names`
    index: HashMap<String, usize>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from an initial list, skipping duplicates.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for name in names {
            set.add(name);
        }
        set
    }

    /// Returns true if the name was newly added.
    pub fn add(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.index.contains_key(&name) {
            return false;
        }
        self.index.insert(name.clone(), self.names.len());
        self.names.push(name);
        true
    }

    /// Returns true if the name was present and has been removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(idx) = self.index.remove(name) else {
            return false;
        };

        self.names.swap_remove(idx);
        if let Some(moved) = self.names.get(idx) {
            self.index.insert(moved.clone(), idx);
        }
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Visit every current member.
    pub fn for_each<F: FnMut(&str)>(&self, mut visit: F) {
        for name in &self.names {
            visit(name);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}
