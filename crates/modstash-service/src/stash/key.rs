/// Formats the canonical identity of a (module, version) pair.
///
/// The result is used as the distributed lock name and as the single-flight
/// map key, so this function is the single source of truth for that identity:
/// two requests for the same pair must go through here and nothing else.
pub fn stash_key(module: &str, version: &str) -> String {
    format!("{module}@{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stash_key_format() {
        assert_eq!(
            stash_key("github.com/pkg/errors", "v0.9.1"),
            "github.com/pkg/errors@v0.9.1"
        );
    }

    #[test]
    fn test_stash_key_is_stable() {
        assert_eq!(stash_key("m", "v"), stash_key("m", "v"));
        assert_ne!(stash_key("m", "v1"), stash_key("m", "v2"));
    }
}
