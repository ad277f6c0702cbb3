use std::path::{Path, PathBuf};

use url::Url;

/// Normalize a path handed over by the host, which may be a `file:` URI.
///
/// `file:/C:/proj/a.go` keeps its drive letter (`C:/proj/a.go`), while
/// `file:/proj/a.go` and `file:///proj/a.go` both become `/proj/a.go`.
/// Plain paths are returned unchanged.
pub fn normalize_file_path(path: &str) -> String {
    let Some(rest) = path.strip_prefix("file:") else {
        return path.to_string();
    };
    let rest = url_decode(rest.trim_start_matches('/'));
    if has_drive_letter(&rest) {
        rest
    } else {
        format!("/{}", rest)
    }
}

fn has_drive_letter(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes.len() == 2 || bytes[2] == b'/' || bytes[2] == b'\\')
}

/// Final component of `path`, or an empty string when there is none.
pub fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Extension used to pick a language server: the text after the last `.`,
/// unless the dot is the first character (`.bashrc` has no extension).
pub fn extension_for_file(name: &str) -> Option<&str> {
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match name.rfind('.') {
        Some(i) if i > 0 => Some(&name[i + 1..]),
        _ => None,
    }
}

pub fn parent_dir(path: &Path) -> Option<PathBuf> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// `rootUri` value sent to the editor for a workspace root.
pub fn root_uri(root: &str) -> String {
    if root.starts_with('/') {
        format!("file://{}", root)
    } else {
        format!("file:///{}", root)
    }
}

/// Convert a `file://` URI to a local file path string. Anything that is not
/// a file URI is returned as is.
pub fn uri_to_file_path(uri: &str) -> String {
    if let Ok(parsed) = Url::parse(uri) {
        if parsed.scheme() == "file" {
            if let Ok(path) = parsed.to_file_path() {
                return path.to_string_lossy().to_string();
            }
            let decoded = url_decode(parsed.path());
            if !decoded.is_empty() {
                return decoded;
            }
        }
    }
    uri.to_string()
}

/// Percent-decode a URI component. Malformed escapes are kept verbatim.
pub fn url_decode(input: &str) -> String {
    let mut bytes = Vec::with_capacity(input.len());
    let mut iter = input.as_bytes().iter();

    while let Some(&b) = iter.next() {
        if b != b'%' {
            bytes.push(b);
            continue;
        }
        let hex: Vec<u8> = iter.by_ref().take(2).copied().collect();
        let decoded = (hex.len() == 2)
            .then(|| u8::from_str_radix(&String::from_utf8_lossy(&hex), 16).ok())
            .flatten();
        match decoded {
            Some(d) => bytes.push(d),
            None => {
                bytes.push(b'%');
                bytes.extend_from_slice(&hex);
            }
        }
    }

    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_windows_drive_letter() {
        assert_eq!(normalize_file_path("file:/C:/proj/a.go"), "C:/proj/a.go");
        assert_eq!(normalize_file_path("file:///C:/proj/a.go"), "C:/proj/a.go");
    }

    #[test]
    fn normalize_unix_uri_forms() {
        assert_eq!(normalize_file_path("file:/proj/a.go"), "/proj/a.go");
        assert_eq!(normalize_file_path("file:///proj/a.go"), "/proj/a.go");
    }

    #[test]
    fn normalize_decodes_escapes() {
        assert_eq!(
            normalize_file_path("file:/home/user/my%20project/a.rs"),
            "/home/user/my project/a.rs"
        );
    }

    #[test]
    fn normalize_plain_path_unchanged() {
        assert_eq!(normalize_file_path("/tmp/foo.txt"), "/tmp/foo.txt");
        assert_eq!(normalize_file_path(""), "");
    }

    #[test]
    fn extension_rules() {
        assert_eq!(extension_for_file("a.go"), Some("go"));
        assert_eq!(extension_for_file("/x/y/archive.tar.gz"), Some("gz"));
        assert_eq!(extension_for_file(".bashrc"), None);
        assert_eq!(extension_for_file("Makefile"), None);
        assert_eq!(extension_for_file("/dir.d/Makefile"), None);
    }

    #[test]
    fn file_name_of_path() {
        assert_eq!(file_name("/proj/src/main.rs"), "main.rs");
        assert_eq!(file_name(""), "");
    }

    #[test]
    fn root_uri_forms() {
        assert_eq!(root_uri("/home/me/proj"), "file:///home/me/proj");
        assert_eq!(root_uri("C:/proj"), "file:///C:/proj");
    }

    #[test]
    fn parent_of_bare_name_is_none() {
        assert_eq!(parent_dir(Path::new("a.txt")), None);
        assert_eq!(
            parent_dir(Path::new("/tmp/a.txt")),
            Some(PathBuf::from("/tmp"))
        );
    }

    #[test]
    fn uri_to_file_path_basic() {
        assert_eq!(
            uri_to_file_path("file:///home/user/project/main.rs"),
            "/home/user/project/main.rs"
        );
        assert_eq!(
            uri_to_file_path("file:///home/user/my%20project/main.rs"),
            "/home/user/my project/main.rs"
        );
    }

    #[test]
    fn uri_to_file_path_non_file_uri_returns_as_is() {
        assert_eq!(uri_to_file_path("https://example.com"), "https://example.com");
        assert_eq!(uri_to_file_path("/tmp/foo.txt"), "/tmp/foo.txt");
    }

    #[test]
    fn url_decode_malformed_kept() {
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
    }
}
