use dashmap::DashMap;
use std::sync::Arc;

/// Redirect cache mapping short_code -> target URL.
///
/// Backed by a DashMap so the redirect path never waits on the URL table's
/// mutex. Warmed from `urls.csv` when the directory first loads, then kept in
/// sync by the directory after every create, update, rename and delete.
#[derive(Clone, Debug, Default)]
pub struct LinkCache {
    inner: Arc<DashMap<String, String>>,
}

impl LinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache with `entries`.
    pub fn warm<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.inner.clear();
        for (short_code, target) in entries {
            self.inner.insert(short_code, target);
        }
        tracing::debug!("Link cache warmed with {} entries", self.inner.len());
    }

    pub fn set(&self, short_code: impl Into<String>, target: impl Into<String>) {
        self.inner.insert(short_code.into(), target.into());
    }

    pub fn get(&self, short_code: &str) -> Option<String> {
        self.inner.get(short_code).map(|v| v.clone())
    }

    /// Move an entry to a new code, keeping its target.
    pub fn rename(&self, old: &str, new: impl Into<String>) {
        if let Some((_, target)) = self.inner.remove(old) {
            self.inner.insert(new.into(), target);
        }
    }

    pub fn remove(&self, short_code: &str) {
        self.inner.remove(short_code);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
