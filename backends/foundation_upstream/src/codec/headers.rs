use std::fmt;

/// Ordered header list with case-insensitive lookups.
///
/// Order is preserved exactly as inserted since it is observable on the wire.
/// Pseudo headers (`:status`, `:method`, `:path`, ...) live in the same list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from name/value pairs, keeping duplicates in order.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.append(name, value);
        }
        headers
    }

    /// Adds a header, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Sets a header, replacing every existing value for the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.position(&name) {
            Some(index) => {
                self.entries[index].1 = value;
                let mut seen = 0_usize;
                self.entries.retain(|(existing, _)| {
                    if !existing.eq_ignore_ascii_case(&name) {
                        return true;
                    }
                    seen += 1;
                    seen == 1
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// First value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .map(|index| self.entries[index].1.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Removes every value for `name`, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// The numeric `:status`, if present and well formed.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.get(":status").and_then(|value| value.trim().parse().ok())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self::from_pairs(iter)
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            writeln!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::HeaderMap;

    #[test]
    fn lookups_ignore_case_and_keep_order() {
        let headers = HeaderMap::from_pairs([
            (":status", "200"),
            ("Set-Cookie", "a=1"),
            ("set-cookie", "b=2"),
        ]);

        assert_eq!(headers.get("SET-COOKIE"), Some("a=1"));
        assert_eq!(
            headers.get_all("set-cookie").collect::<Vec<_>>(),
            vec!["a=1", "b=2"]
        );
        assert_eq!(headers.status(), Some(200));
    }

    #[test]
    fn insert_replaces_every_value() {
        let mut headers = HeaderMap::from_pairs([("x-a", "1"), ("x-b", "2"), ("X-A", "3")]);
        headers.insert("x-a", "9");

        assert_eq!(headers.iter().collect::<Vec<_>>(), vec![("x-a", "9"), ("x-b", "2")]);
    }

    #[test]
    fn remove_reports_dropped_count() {
        let mut headers = HeaderMap::from_pairs([("x-a", "1"), ("x-a", "2")]);
        assert_eq!(headers.remove("X-A"), 2);
        assert!(headers.is_empty());
    }
}
