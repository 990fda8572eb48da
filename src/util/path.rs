use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: drop `.` components, fold `..` into the
/// preceding component and discard trailing separators. The filesystem is
/// never consulted, so symlinks are not resolved.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `..` above the root stays at the root
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Compute the platform-independent key of `full` relative to `base`.
///
/// The prefix test is done on normalized path components, so `/foo` never
/// claims `/foobar/x`. Components are joined with `/`; only the platform's
/// own separators split components, so a `\` in a unix file name stays in
/// the key. Returns `None` when `full` is not under `base` or is
/// `base` itself.
pub fn object_key(base: &Path, full: &Path) -> Option<String> {
    let full = normalize(full);
    let base = normalize(base);
    let rel = full.strip_prefix(&base).ok()?;

    let segments: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Check whether a relative key matches any of the exclude glob patterns.
pub fn matches_exclude(relative: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| glob_match(p, relative))
}

/// Patterns without a `/` are matched against the file name only. Patterns
/// with a `/` are matched segment by segment and may start at any depth;
/// `**` spans zero or more segments.
fn glob_match(pattern: &str, path: &str) -> bool {
    if !pattern.contains('/') {
        let name = path.rsplit('/').next().unwrap_or(path);
        return wildcard(pattern, name);
    }

    let pattern: Vec<&str> = pattern.trim_start_matches('/').split('/').collect();
    let segments: Vec<&str> = path.split('/').collect();
    (0..segments.len()).any(|start| match_segments(&pattern, &segments[start..]))
}

fn match_segments(pattern: &[&str], segments: &[&str]) -> bool {
    match pattern.split_first() {
        None => segments.is_empty(),
        Some((&"**", rest)) => (0..=segments.len()).any(|i| match_segments(rest, &segments[i..])),
        Some((head, rest)) => match segments.split_first() {
            Some((seg, tail)) => wildcard(head, seg) && match_segments(rest, tail),
            None => false,
        },
    }
}

/// Single-segment match with `*` (any run) and `?` (one char).
fn wildcard(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, mark)) = backtrack {
            pi = star + 1;
            ti = mark + 1;
            backtrack = Some((star, mark + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_dots_and_trailing_slash() {
        assert_eq!(
            normalize(Path::new("/data/./docs/../a.txt")),
            PathBuf::from("/data/a.txt")
        );
        assert_eq!(normalize(Path::new("/data/")), PathBuf::from("/data"));
        assert_eq!(normalize(Path::new("/../x")), PathBuf::from("/x"));
    }

    #[test]
    fn test_object_key_nested() {
        let base = Path::new("/home/user/sync");
        let full = Path::new("/home/user/sync/docs/report.pdf");
        assert_eq!(object_key(base, full).as_deref(), Some("docs/report.pdf"));
    }

    #[test]
    fn test_object_key_root_level() {
        let base = Path::new("/home/user/sync/");
        let full = Path::new("/home/user/sync/file.txt");
        assert_eq!(object_key(base, full).as_deref(), Some("file.txt"));
    }

    #[test]
    fn test_object_key_sibling_prefix_is_not_a_match() {
        let base = Path::new("/foo");
        assert_eq!(object_key(base, Path::new("/foobar/a.txt")), None);
    }

    #[test]
    fn test_object_key_of_root_itself() {
        assert_eq!(object_key(Path::new("/data"), Path::new("/data")), None);
        assert_eq!(object_key(Path::new("/data"), Path::new("/data/.")), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_object_key_keeps_backslash_in_name() {
        // On unix a backslash is an ordinary filename byte, so `a\b.txt` and
        // `a/b.txt` are different files and must not share a key.
        let base = Path::new("/data");
        let escaped = object_key(base, Path::new("/data/a\\b.txt"));
        let nested = object_key(base, Path::new("/data/a/b.txt"));
        assert_eq!(escaped.as_deref(), Some("a\\b.txt"));
        assert_eq!(nested.as_deref(), Some("a/b.txt"));
        assert_ne!(escaped, nested);
    }

    #[test]
    fn test_exclude_glob_star() {
        assert!(matches_exclude("foo.tmp", &["*.tmp".into()]));
        assert!(matches_exclude("a/b/foo.tmp", &["*.tmp".into()]));
        assert!(!matches_exclude("foo.txt", &["*.tmp".into()]));
    }

    #[test]
    fn test_exclude_glob_doublestar() {
        assert!(matches_exclude("deep/nested/.git/config", &[".git/**".into()]));
        assert!(matches_exclude("node_modules/foo/bar.js", &["node_modules/**".into()]));
        assert!(!matches_exclude("src/main.rs", &["node_modules/**".into()]));
        assert!(matches_exclude("a/b/c/x.log", &["a/**/*.log".into()]));
    }

    #[test]
    fn test_exclude_question_mark() {
        assert!(matches_exclude("~lock.1", &["~lock.?".into()]));
        assert!(!matches_exclude("~lock.12", &["~lock.?".into()]));
    }

    #[test]
    fn test_exclude_multibyte_names() {
        let name = "Solidarita\u{308}tsanlass.jpg";
        assert!(matches_exclude(name, &["*.jpg".into()]));
        assert!(!matches_exclude(name, &["*.png".into()]));
    }
}
