use crate::SvnError;

/// Normalizes a repository-relative path for the wire.
///
/// Separators are collapsed, `.` segments dropped, and leading or trailing
/// slashes removed. `..`, NUL bytes and backslashes are rejected. An empty
/// result (the session root) is accepted only when `allow_root` is set.
pub(crate) fn rel_path(path: &str, allow_root: bool) -> Result<String, SvnError> {
    if path.contains('\0') {
        return Err(SvnError::InvalidPath(format!("'{}' contains NUL", path.escape_debug())));
    }
    if path.contains('\\') {
        return Err(SvnError::InvalidPath(format!("'{path}' contains a backslash")));
    }

    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(SvnError::InvalidPath(format!("'{path}' escapes the session root"))),
            other => segments.push(other),
        }
    }

    if segments.is_empty() && !allow_root {
        return Err(SvnError::InvalidPath("empty path".into()));
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn collapses_separators_and_curdir() {
        assert_eq!(rel_path("/trunk//./a.txt/", false).unwrap(), "trunk/a.txt");
        assert_eq!(rel_path("trunk", false).unwrap(), "trunk");
    }

    #[test]
    fn root_is_allowed_only_on_request() {
        assert_eq!(rel_path("/", true).unwrap(), "");
        assert_eq!(rel_path("", true).unwrap(), "");
        assert!(matches!(rel_path("./", false), Err(SvnError::InvalidPath(_))));
    }

    #[test]
    fn rejects_escapes_and_odd_bytes() {
        assert!(rel_path("trunk/../../etc", false).is_err());
        assert!(rel_path("a\0b", false).is_err());
        assert!(rel_path("a\\b", false).is_err());
    }
}
