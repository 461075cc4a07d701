//! Virtual path decoding, normalization and translation onto the document root.

use std::fs::{metadata, Metadata};
use std::path::{Path, PathBuf};

/// Decode URL by converting %XX (where XX are hexadecimal digits) to the byte it represents.
///
/// Malformed escapes are passed through unchanged.
pub fn url_decode(url: &str) -> Vec<u8> {
    let url = url.as_bytes();
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'%'
            && i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]));
            i += 3;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Percent-decode a request path and resolve `//`, `/./` and `/../` in it.
///
/// A `..` at the root is dropped, so the result never climbs above `/`.
pub fn normalize(raw: &str) -> String {
    let decoded = url_decode(raw);
    collapse_segments(&String::from_utf8_lossy(&decoded))
}

/// Resolve `//`, `/./` and `/../` without decoding.
pub fn collapse_segments(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    let mut trailing_slash = false;
    for segment in path.split('/') {
        match segment {
            "" => trailing_slash = true,
            "." => trailing_slash = true,
            ".." => {
                segments.pop();
                trailing_slash = true;
            }
            segment => {
                segments.push(segment);
                trailing_slash = false;
            }
        }
    }

    let mut normalized = String::with_capacity(path.len());
    if absolute {
        normalized.push('/');
    }
    normalized.push_str(&segments.join("/"));
    if trailing_slash && !segments.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// A virtual path resolved to a file below the document root.
#[derive(Debug)]
pub struct Translation {
    /// Filesystem path of the resolved file.
    pub path: PathBuf,
    /// Virtual path of the resolved file, without path-info.
    pub vpath: String,
    /// Remainder of the virtual path beyond the resolved file, starting with `/`.
    pub path_info: Option<String>,
    pub metadata: Metadata,
}

/// Map a normalized virtual path onto `document_root`.
///
/// Directories resolve through `index_files`, tried in order. A missing path is shortened one
/// segment at a time until a regular file is found; the stripped suffix becomes path-info.
/// Returns `None` when nothing below the root matches.
pub fn translate<S: AsRef<str>>(
    vpath: &str,
    document_root: &Path,
    index_files: &[S],
) -> Option<Translation> {
    let vpath = vpath.trim_start_matches('/');
    let segments: Vec<&str> = vpath
        .split('/')
        .filter(|s| !matches!(*s, "" | "." | ".."))
        .collect();
    // a file can't have children, so `file.php/` leaves `/` as path-info
    let trailing_slash = vpath.ends_with('/') && !segments.is_empty();

    let full_path = join_segments(document_root, &segments);
    match metadata(&full_path) {
        Ok(meta) if meta.is_file() => {
            return Some(Translation {
                path: full_path,
                vpath: format!("/{}", segments.join("/")),
                path_info: trailing_slash.then(|| "/".to_string()),
                metadata: meta,
            });
        }
        Ok(meta) if meta.is_dir() => {
            for index in index_files {
                let index = index.as_ref();
                let candidate = full_path.join(index);
                if let Ok(meta) = metadata(&candidate) {
                    if meta.is_file() {
                        let mut vpath = String::from("/");
                        for segment in &segments {
                            vpath.push_str(segment);
                            vpath.push('/');
                        }
                        vpath.push_str(index);
                        return Some(Translation {
                            path: candidate,
                            vpath,
                            path_info: None,
                            metadata: meta,
                        });
                    }
                }
            }
            return None;
        }
        Ok(_) => return None,
        Err(_) => {}
    }

    // strip trailing segments, they become path-info
    for len in (1..segments.len()).rev() {
        let candidate = join_segments(document_root, &segments[..len]);
        match metadata(&candidate) {
            Ok(meta) if meta.is_file() => {
                let mut path_info = format!("/{}", segments[len..].join("/"));
                if trailing_slash {
                    path_info.push('/');
                }
                return Some(Translation {
                    path: candidate,
                    vpath: format!("/{}", segments[..len].join("/")),
                    path_info: Some(path_info),
                    metadata: meta,
                });
            }
            Ok(_) => return None,
            Err(_) => continue,
        }
    }
    None
}

fn join_segments(root: &Path, segments: &[&str]) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in segments {
        path.push(segment);
    }
    path
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> std::fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&#039;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}
