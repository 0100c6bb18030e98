//! Lookup of process-wide configuration variables

use std::{collections::HashMap, fmt};

/// A source of configuration variables
pub trait Env: fmt::Debug + Send + Sync {
    /// The value of `key`, if it is set and non-empty
    fn var(&self, key: &str) -> Option<String>;
}

/// The variables of the current process
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl Env for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

/// A fixed set of variables, independent of the process environment
#[derive(Clone, Debug, Default)]
pub struct MapEnv(HashMap<String, String>);

impl MapEnv {
    /// Sets a variable
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapEnv {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.0.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_values_read_as_unset() {
        let env = MapEnv::default().with("A", "").with("B", "set");
        assert_eq!(env.var("A"), None);
        assert_eq!(env.var("B").as_deref(), Some("set"));
        assert_eq!(env.var("C"), None);
    }
}
