//! Request path normalisation.

/// Normalise a decoded URI path: backslashes become slashes, `//` and
/// `/./` collapse, `/../` pops one component and can never climb above
/// the root.
pub fn normalize(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let cleaned = path.replace('\\', "/");
    for seg in cleaned.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    let mut norm = String::with_capacity(path.len());
    norm.push('/');
    norm.push_str(&out.join("/"));
    // a trailing slash is meaningful (directory request), keep it
    if norm.len() > 1 && (cleaned.ends_with('/') || cleaned.ends_with("/.") || cleaned.ends_with("/..")) {
        norm.push('/');
    }
    norm
}

/// Join two path fragments with exactly one slash, then normalise.
pub fn join(a: &str, b: &str) -> String {
    normalize(&format!("{}/{}", a.trim_end_matches('/'), b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapses_dots_and_slashes() {
        assert_eq!(normalize("/a//b/./c"), "/a/b/c");
        assert_eq!(normalize("/a/b/../c"), "/a/c");
        assert_eq!(normalize("a\\b\\c"), "/a/b/c");
    }

    #[test]
    fn test_cannot_escape_root() {
        assert_eq!(normalize("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize("/.."), "/");
        assert_eq!(normalize("/a/../.."), "/");
    }

    #[test]
    fn test_output_has_no_dot_segments() {
        for p in ["/a/./b/../c//d/", "/../x/./../y", "//.//"] {
            let n = normalize(p);
            assert!(!n.contains("//"), "{n}");
            assert!(!n.contains("/./"), "{n}");
            assert!(!n.contains("/../"), "{n}");
            assert!(n.starts_with('/'));
        }
    }

    #[test]
    fn test_trailing_slash_preserved() {
        assert_eq!(normalize("/docs/"), "/docs/");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/www", "index.html"), "/www/index.html");
        assert_eq!(join("/www/", "/sub/page"), "/www/sub/page");
    }
}
