//! Path pattern compilation.
//!
//! Patterns are segment-based globs:
//! - a literal segment matches itself,
//! - `*` matches exactly one segment,
//! - `**` matches the rest of the path, including nothing.
//!
//! `/v1/chat/**` therefore matches `/v1/chat`, `/v1/chat/completions`, and
//! `/v1/chat/a/b`, while `/v1/ocr/*/scan` matches `/v1/ocr/img1/scan` but
//! not `/v1/ocr/scan`.

use regex::Regex;

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    /// Compiles a pattern. Fails when `**` appears anywhere but the final
    /// segment, or when the pattern does not start with `/`.
    pub fn compile(pattern: &str) -> Result<Self, String> {
        if !pattern.starts_with('/') {
            return Err("pattern must start with '/'".to_owned());
        }

        let segments: Vec<&str> = pattern[1..].split('/').collect();
        let mut parts = Vec::with_capacity(segments.len());
        for (idx, segment) in segments.iter().enumerate() {
            match *segment {
                "**" => {
                    if idx != segments.len() - 1 {
                        return Err("'**' is only allowed as the final segment".to_owned());
                    }
                    parts.push("(?:/.*)?".to_owned());
                }
                "*" => parts.push("/[^/]+".to_owned()),
                literal => parts.push(format!("/{}", regex::escape(literal))),
            }
        }

        let body = parts.concat();
        let regex = Regex::new(&format!("^{body}$"))
            .map_err(|e| format!("pattern did not compile: {e}"))?;
        Ok(Self {
            source: pattern.to_owned(),
            regex,
        })
    }

    /// Whether `path` matches this pattern.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// The original pattern text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}
