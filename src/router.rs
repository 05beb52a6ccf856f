//! Path prefix authorization.

/// Outcome of routing a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Forward with this path
    Forward(String),
    /// No allowed prefix matches
    Reject,
}

/// Allow-list of path prefixes. The first prefix, in the order given, that the
/// path starts with decides the route.
#[derive(Debug, Clone, Default)]
pub struct PrefixRouter {
    prefixes: Vec<String>,
    strip: bool,
}

impl PrefixRouter {
    pub fn new(prefixes: Vec<String>, strip: bool) -> Self {
        Self { prefixes, strip }
    }

    /// Route `path` after resolving its dot segments, so the allow-list
    /// sees the same path a normalizing downstream would serve.
    pub fn route(&self, path: &str) -> Route {
        let path = clean_path(path);
        if self.prefixes.is_empty() {
            return Route::Forward(path);
        }

        let Some(prefix) = self.prefixes.iter().find(|p| path.starts_with(p.as_str())) else {
            return Route::Reject;
        };
        if !self.strip {
            return Route::Forward(path);
        }

        let rest = &path[prefix.len()..];
        if rest.starts_with('/') {
            Route::Forward(rest.to_string())
        } else {
            Route::Forward(format!("/{}", rest))
        }
    }
}

/// Resolve `.` and `..` segments, including their `%2e` spellings, and
/// collapse repeated slashes. `..` never climbs above the root. A trailing
/// slash is kept.
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment.to_ascii_lowercase().replace("%2e", ".").as_str() {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    let mut cleaned = format!("/{}", segments.join("/"));
    if path.ends_with('/') && cleaned.len() > 1 {
        cleaned.push('/');
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(prefixes: &[&str], strip: bool) -> PrefixRouter {
        PrefixRouter::new(prefixes.iter().map(|p| p.to_string()).collect(), strip)
    }

    #[test]
    fn test_empty_allow_list_forwards_unchanged() {
        let open = router(&[], true);
        assert_eq!(open.route("/anything/at/all"), Route::Forward("/anything/at/all".into()));
        assert_eq!(open.route("/"), Route::Forward("/".into()));
    }

    #[test]
    fn test_strip_prefix() {
        let api = router(&["/api"], true);
        assert_eq!(api.route("/api/v1/users"), Route::Forward("/v1/users".into()));
        assert_eq!(api.route("/api"), Route::Forward("/".into()));
        assert_eq!(api.route("/api/"), Route::Forward("/".into()));
        assert_eq!(api.route("/other"), Route::Reject);
    }

    #[test]
    fn test_no_strip_keeps_path() {
        let api = router(&["/api"], false);
        assert_eq!(api.route("/api/v1/users"), Route::Forward("/api/v1/users".into()));
        assert_eq!(api.route("/"), Route::Reject);
    }

    #[test]
    fn test_prefix_is_a_string_match() {
        let bare = router(&["/api"], true);
        assert_eq!(bare.route("/apiary"), Route::Forward("/ary".into()));

        let slashed = router(&["/api/"], true);
        assert_eq!(slashed.route("/apiary"), Route::Reject);
        assert_eq!(slashed.route("/api/x"), Route::Forward("/x".into()));
    }

    #[test]
    fn test_first_declared_prefix_wins() {
        let short_first = router(&["/a", "/a/b"], true);
        assert_eq!(short_first.route("/a/b/c"), Route::Forward("/b/c".into()));

        let long_first = router(&["/a/b", "/a"], true);
        assert_eq!(long_first.route("/a/b/c"), Route::Forward("/c".into()));
    }

    #[test]
    fn test_stripped_path_always_starts_with_slash() {
        let catch_all = router(&["/", "/x", "/static/"], true);
        for path in ["/", "/x", "/xyz", "/static/", "/static/app.js", "/deep/nested/path"] {
            match catch_all.route(path) {
                Route::Forward(p) => assert!(p.starts_with('/'), "{path} -> {p}"),
                Route::Reject => panic!("{path} rejected"),
            }
        }
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/a/b/../c"), "/a/c");
        assert_eq!(clean_path("/a/./b"), "/a/b");
        assert_eq!(clean_path("//a///b/"), "/a/b/");
        assert_eq!(clean_path("/../../etc"), "/etc");
        assert_eq!(clean_path("/a/%2e%2E/b"), "/b");
        assert_eq!(clean_path("/a/%2e/b"), "/a/b");
        assert_eq!(clean_path("/a/.hidden/..x"), "/a/.hidden/..x");
    }

    #[test]
    fn test_dot_segments_cannot_escape_prefix() {
        for strip in [true, false] {
            let api = router(&["/api"], strip);
            assert_eq!(api.route("/api/../admin"), Route::Reject, "strip={strip}");
            assert_eq!(api.route("/api/%2e%2e/admin"), Route::Reject, "strip={strip}");
            assert_eq!(api.route("/api/./../admin/"), Route::Reject, "strip={strip}");
        }

        let api = router(&["/api"], false);
        assert_eq!(api.route("/api/v1/../v2"), Route::Forward("/api/v2".into()));
        assert_eq!(api.route("/admin/../api/x"), Route::Forward("/api/x".into()));
    }
}
