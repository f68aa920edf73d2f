//! Cache key management utilities.

/// Builder for store keys.
pub struct KeyBuilder;

impl KeyBuilder {
    /// Flat key used by the in-process backend for a hash field.
    ///
    /// Hash names and field names are concatenated without a separator, so
    /// `("a", "")` and `("", "a")` both alias the plain key `"a"`.
    pub fn hash_field(hash: &str, field: &str) -> String {
        let mut key = String::with_capacity(hash.len() + field.len());
        key.push_str(hash);
        key.push_str(field);
        key
    }

    /// Apply a namespace prefix. An empty prefix leaves the key untouched.
    pub fn namespaced(prefix: &str, key: &str) -> String {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", prefix, key)
        }
    }
}
