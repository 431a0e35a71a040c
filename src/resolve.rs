//! Image resolution for media records.
//!
//! A record's stored path hint may point at the image itself, at the
//! channel export (sidecar) that mentions the image, or at a file that has
//! since moved under the canonical image root. [`ImageResolver::resolve`]
//! tries, in order, stopping at the first hit:
//!
//! 1. **Direct image**: the hint has an image extension and exists.
//! 2. **Sidecar**: the hint is an existing `.json` container; the entry with
//!    the record's id is located and a file reference extracted with the
//!    rules in [`EXTRACTION_RULES`]. Every reference is tried as-is, then as
//!    `<root>/<file name>`.
//! 3. **Root fallback**: `<root>/<file name of the hint>`.
//!
//! A miss is [`Resolution::NotFound`], never an error. Unreadable or
//! malformed sidecars are logged and treated as a miss for step 2.

use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::ImagesConfig;
use crate::export_files::parse_container;

const SIDECAR_EXTENSIONS: &[&str] = &["json"];

/// How a file reference is pulled out of a sidecar entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionRule {
    /// `entry.file`
    DirectField,
    /// `entry.media.file`
    NestedMediaField,
    /// Any string anywhere in the entry with an image extension. Only tried
    /// when neither field above is present.
    GenericScan,
}

/// Extraction rules in the order they are applied.
pub const EXTRACTION_RULES: [ExtractionRule; 3] = [
    ExtractionRule::DirectField,
    ExtractionRule::NestedMediaField,
    ExtractionRule::GenericScan,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DirectImage,
    Sidecar(ExtractionRule),
    RootFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found { path: PathBuf, strategy: Strategy },
    NotFound,
}

impl Resolution {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Resolution::Found { path, .. } => Some(path),
            Resolution::NotFound => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageResolver {
    root: PathBuf,
    extensions: Vec<String>,
}

impl ImageResolver {
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            root: root.into(),
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &ImagesConfig) -> Self {
        Self::new(config.root.clone(), config.extensions.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Whether `path` carries one of the configured image extensions.
    pub fn is_image_path(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| self.extensions.iter().any(|e| *e == ext))
    }

    pub fn resolve(&self, record_id: i64, hint: Option<&str>) -> Resolution {
        let Some(hint) = hint.filter(|h| !h.trim().is_empty()) else {
            return Resolution::NotFound;
        };
        let hint_path = Path::new(hint);

        if self.is_image_path(hint_path) && hint_path.is_file() {
            return Resolution::Found {
                path: hint_path.to_path_buf(),
                strategy: Strategy::DirectImage,
            };
        }

        if is_sidecar_path(hint_path) && hint_path.is_file() {
            if let Some((path, rule)) = self.resolve_from_sidecar(record_id, hint_path) {
                return Resolution::Found {
                    path,
                    strategy: Strategy::Sidecar(rule),
                };
            }
        }

        if let Some(name) = hint_path.file_name() {
            let candidate = self.root.join(name);
            if candidate.is_file() {
                return Resolution::Found {
                    path: candidate,
                    strategy: Strategy::RootFallback,
                };
            }
        }

        Resolution::NotFound
    }

    fn resolve_from_sidecar(
        &self,
        record_id: i64,
        sidecar: &Path,
    ) -> Option<(PathBuf, ExtractionRule)> {
        let content = match std::fs::read_to_string(sidecar) {
            Ok(content) => content,
            Err(e) => {
                warn!(sidecar = %sidecar.display(), error = %e, "could not read sidecar");
                return None;
            }
        };
        let entries = match parse_container(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(sidecar = %sidecar.display(), error = %e, "could not parse sidecar");
                return None;
            }
        };

        let entry = entries
            .iter()
            .find(|e| e.get("id").and_then(Value::as_i64) == Some(record_id))?;

        for rule in EXTRACTION_RULES {
            match rule {
                ExtractionRule::DirectField | ExtractionRule::NestedMediaField => {
                    if let Some(reference) = field_reference(entry, rule) {
                        // A present reference decides; the generic scan is not consulted
                        return self.check_reference(reference).map(|p| (p, rule));
                    }
                }
                ExtractionRule::GenericScan => {
                    let found = string_values(entry)
                        .into_iter()
                        .filter(|s| self.is_image_path(Path::new(s)))
                        .find_map(|s| self.check_reference(s));
                    if found.is_none() {
                        debug!(record_id, sidecar = %sidecar.display(), "no image reference in sidecar entry");
                    }
                    return found.map(|p| (p, rule));
                }
            }
        }
        None
    }

    /// The reference as given, else its file name under the image root.
    fn check_reference(&self, reference: &str) -> Option<PathBuf> {
        let path = Path::new(reference);
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        let candidate = self.root.join(path.file_name()?);
        candidate.is_file().then_some(candidate)
    }
}

fn field_reference(entry: &Value, rule: ExtractionRule) -> Option<&str> {
    let value = match rule {
        ExtractionRule::DirectField => entry.get("file"),
        ExtractionRule::NestedMediaField => entry.get("media").and_then(|m| m.get("file")),
        ExtractionRule::GenericScan => None,
    }?;
    value.as_str().filter(|s| !s.is_empty())
}

/// All string leaves of `value`, depth first, keys in document order.
fn string_values(value: &Value) -> Vec<&str> {
    let mut out = Vec::new();
    let mut stack = vec![value];
    while let Some(v) = stack.pop() {
        match v {
            Value::String(s) => out.push(s.as_str()),
            Value::Array(items) => stack.extend(items.iter().rev()),
            Value::Object(map) => stack.extend(map.values().rev()),
            _ => {}
        }
    }
    out
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

fn is_sidecar_path(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| SIDECAR_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        resolver: ImageResolver,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            fs::create_dir_all(tmp.path().join("images")).unwrap();
            fs::create_dir_all(tmp.path().join("raw")).unwrap();
            let resolver = ImageResolver::new(
                tmp.path().join("images"),
                vec!["jpg".to_string(), ".PNG".to_string()],
            );
            Self { tmp, resolver }
        }

        fn write(&self, rel: &str, content: &str) -> PathBuf {
            let path = self.tmp.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            path
        }
    }

    fn found(path: PathBuf, strategy: Strategy) -> Resolution {
        Resolution::Found { path, strategy }
    }

    #[test]
    fn direct_image_short_circuits() {
        let fx = Fixture::new();
        let img = fx.write("elsewhere/a.jpg", "x");
        // Same name under the root must not win over the direct hit
        fx.write("images/a.jpg", "y");

        let res = fx.resolver.resolve(1, Some(img.to_str().unwrap()));
        assert_eq!(res, found(img, Strategy::DirectImage));
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let fx = Fixture::new();
        let img = fx.write("elsewhere/B.Png", "x");
        let res = fx.resolver.resolve(1, Some(img.to_str().unwrap()));
        assert_eq!(res, found(img, Strategy::DirectImage));
    }

    #[test]
    fn sidecar_nested_media_field_under_root() {
        let fx = Fixture::new();
        let img = fx.write("images/a.jpg", "x");
        let sidecar = fx.write(
            "raw/chan.json",
            r#"{"messages": [{"id": 41}, {"id": 42, "media": {"file": "a.jpg"}}]}"#,
        );

        let res = fx.resolver.resolve(42, Some(sidecar.to_str().unwrap()));
        assert_eq!(
            res,
            found(img, Strategy::Sidecar(ExtractionRule::NestedMediaField))
        );
    }

    #[test]
    fn sidecar_direct_field_absolute_path() {
        let fx = Fixture::new();
        let img = fx.write("scrape/2025-07-20/chan/photo.jpg", "x");
        let sidecar = fx.write(
            "raw/chan.json",
            &format!(r#"[{{"id": 5, "file": "{}"}}]"#, img.display()),
        );

        let res = fx.resolver.resolve(5, Some(sidecar.to_str().unwrap()));
        assert_eq!(res, found(img, Strategy::Sidecar(ExtractionRule::DirectField)));
    }

    #[test]
    fn sidecar_generic_scan_finds_nested_string() {
        let fx = Fixture::new();
        let img = fx.write("images/deep.png", "x");
        let sidecar = fx.write(
            "raw/chan.json",
            r#"[{"id": 9, "media": {"photo": {"sizes": ["thumb.txt", "/gone/deep.png"]}}}]"#,
        );

        let res = fx.resolver.resolve(9, Some(sidecar.to_str().unwrap()));
        assert_eq!(res, found(img, Strategy::Sidecar(ExtractionRule::GenericScan)));
    }

    #[test]
    fn present_reference_skips_generic_scan() {
        let fx = Fixture::new();
        fx.write("images/other.jpg", "x");
        let sidecar = fx.write(
            "raw/chan.json",
            r#"[{"id": 3, "file": "missing.jpg", "extra": "other.jpg"}]"#,
        );

        assert_eq!(
            fx.resolver.resolve(3, Some(sidecar.to_str().unwrap())),
            Resolution::NotFound
        );
    }

    #[test]
    fn generic_scan_follows_document_order() {
        let fx = Fixture::new();
        fx.write("images/zeta.jpg", "z");
        fx.write("images/alpha.jpg", "a");
        let sidecar = fx.write(
            "raw/chan.json",
            r#"[{"id":4,"thumb":{"src":"zeta.jpg"},"attachment":"alpha.jpg"}]"#,
        );

        let res = fx.resolver.resolve(4, Some(sidecar.to_str().unwrap()));
        assert_eq!(
            res,
            found(
                fx.tmp.path().join("images").join("zeta.jpg"),
                Strategy::Sidecar(ExtractionRule::GenericScan)
            )
        );
    }

    #[test]
    fn malformed_sidecar_is_a_miss() {
        let fx = Fixture::new();
        fx.write("images/a.jpg", "x");
        let sidecar = fx.write("raw/chan.json", r#"[{"id": 1, "file": "a.jpg""#);
        assert_eq!(
            fx.resolver.resolve(1, Some(sidecar.to_str().unwrap())),
            Resolution::NotFound
        );
    }

    #[test]
    fn stale_image_hint_uses_root_fallback() {
        let fx = Fixture::new();
        let img = fx.write("images/photo_1.jpg", "x");
        let res = fx.resolver.resolve(1, Some("/old/location/photo_1.jpg"));
        assert_eq!(res, found(img, Strategy::RootFallback));
    }

    #[test]
    fn missing_everything_is_not_found() {
        let fx = Fixture::new();
        assert_eq!(fx.resolver.resolve(1, None), Resolution::NotFound);
        assert_eq!(fx.resolver.resolve(1, Some("")), Resolution::NotFound);
        assert_eq!(
            fx.resolver.resolve(1, Some("/nope/x.jpg")),
            Resolution::NotFound
        );
    }

    #[test]
    fn unknown_record_in_sidecar_is_a_miss() {
        let fx = Fixture::new();
        fx.write("images/a.jpg", "x");
        let sidecar = fx.write("raw/chan.json", r#"[{"id": 1, "file": "a.jpg"}]"#);
        assert_eq!(
            fx.resolver.resolve(2, Some(sidecar.to_str().unwrap())),
            Resolution::NotFound
        );
    }
}
