//! Path Mapper: bidirectional translation between local (host) and remote
//! (containerized interpreter) filesystem namespaces (spec.md §4.3).
//!
//! Mappings are a short list, like the teacher's `Header::fields` /
//! `HeaderField` list — small, built once, then searched linearly; here the
//! search picks the longest matching prefix instead of the first
//! `ContentLength` field.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::codec::decode_file_uri;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Clone)]
pub struct PathMapper {
    mappings: Vec<PathMapping>,
    project_root: String,
}

impl PathMapper {
    /// Build a mapper from an already-decided, non-empty mapping list.
    /// Guards against empty prefixes per spec.md §9's design note.
    pub fn new(mappings: Vec<(String, String)>, project_root: &Path) -> Self {
        let project_root = normalize(&project_root.to_string_lossy());
        let mappings = mappings
            .into_iter()
            .map(|(local, remote)| PathMapping {
                local: normalize(&local),
                remote: normalize(&remote),
            })
            .filter(|m| !m.local.is_empty() && !m.remote.is_empty())
            .collect();
        PathMapper { mappings, project_root }
    }

    /// Load following the precedence of spec.md §4.3: explicit config, then
    /// editor launch configuration, then compose file volumes, then the
    /// synthesized default `(cwd, /var/www/html)`.
    pub fn load(
        explicit: Option<Vec<(String, String)>>,
        launch_config_json: Option<&str>,
        compose_yaml: Option<&str>,
        project_root: &Path,
    ) -> Self {
        if let Some(mappings) = explicit {
            if !mappings.is_empty() {
                return Self::new(mappings, project_root);
            }
        }

        if let Some(text) = launch_config_json {
            if let Some(mappings) = parse_launch_config(text, &project_root.to_string_lossy()) {
                if !mappings.is_empty() {
                    return Self::new(mappings, project_root);
                }
            }
        }

        if let Some(text) = compose_yaml {
            if let Some(mappings) = parse_compose_volumes(text, &project_root.to_string_lossy()) {
                if !mappings.is_empty() {
                    return Self::new(mappings, project_root);
                }
            }
        }

        Self::new(
            vec![(project_root.to_string_lossy().into_owned(), "/var/www/html".to_string())],
            project_root,
        )
    }

    pub fn mappings(&self) -> &[PathMapping] {
        &self.mappings
    }

    /// Decode a `file://` URI or raw path, normalize it, then translate
    /// remote → local via the longest matching remote prefix. Unmatched
    /// paths are returned normalized but otherwise unchanged.
    pub fn to_local(&self, path: &str) -> String {
        let decoded = decode_file_uri(path);
        let normalized = normalize(&decoded);

        let best = self
            .mappings
            .iter()
            .filter(|m| is_proper_prefix(&m.remote, &normalized))
            .max_by_key(|m| m.remote.len());

        match best {
            Some(m) => join(&m.local, &normalized[m.remote.len()..]),
            None => normalized,
        }
    }

    /// Resolve to absolute against the project root, normalize, then
    /// translate local → remote via the longest matching local prefix.
    pub fn to_remote(&self, path: &str) -> String {
        let decoded = decode_file_uri(path);
        let absolute = if decoded.starts_with('/') {
            decoded
        } else {
            format!("{}/{}", self.project_root, decoded)
        };
        let normalized = normalize(&absolute);

        let best = self
            .mappings
            .iter()
            .filter(|m| is_proper_prefix(&m.local, &normalized))
            .max_by_key(|m| m.local.len());

        match best {
            Some(m) => format!("{}{}", m.remote, &normalized[m.local.len()..]),
            None => normalized,
        }
    }
}

/// Whether `prefix` is a proper prefix of `path` at a path-component
/// boundary (so `/var/www` doesn't spuriously match `/var/wwwroot`).
fn is_proper_prefix(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    if !path.starts_with(prefix) {
        return false;
    }
    path.len() == prefix.len() || path[prefix.len()..].starts_with('/')
}

fn join(prefix: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return prefix.to_string();
    }
    format!("{prefix}{suffix}")
}

/// Unify separators to `/`, collapse `.`/`..`, and strip a trailing
/// separator (never the root `/`).
pub fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let is_absolute = unified.starts_with('/');

    let mut components: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                if components.last().map(|p| *p != "..").unwrap_or(false) {
                    components.pop();
                } else if !is_absolute {
                    components.push("..");
                }
            }
            other => components.push(other),
        }
    }

    let joined = components.join("/");
    if is_absolute {
        if joined.is_empty() {
            "/".to_string()
        } else {
            format!("/{joined}")
        }
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[derive(Debug, Deserialize)]
struct LaunchConfigFile {
    configurations: Vec<LaunchConfiguration>,
}

#[derive(Debug, Deserialize)]
struct LaunchConfiguration {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "pathMappings")]
    path_mappings: Option<HashMap<String, String>>,
}

/// Parse a VS Code-style `launch.json`: tolerate `//`/`/* */` comments and
/// trailing commas, then find the first PHP (xdebug) configuration's
/// `pathMappings` (remote → local). `${workspaceFolder}` is substituted
/// with `project_root`.
fn parse_launch_config(text: &str, project_root: &str) -> Option<Vec<(String, String)>> {
    let stripped = strip_jsonc(text);
    let file: LaunchConfigFile = serde_json::from_str(&stripped).ok()?;

    let config = file
        .configurations
        .into_iter()
        .find(|c| matches!(c.kind.as_deref(), Some("php")))?;

    let mappings = config.path_mappings?;
    let mappings = mappings
        .into_iter()
        .map(|(remote, local)| (local.replace("${workspaceFolder}", project_root), remote))
        .collect();
    Some(mappings)
}

/// Strip `//` and `/* */` comments (outside of string literals) and
/// trailing commas before an array/object close, the minimal JSONC
/// tolerance launch.json needs. No published crate in this stack offers
/// JSONC parsing, so this is a small hand-rolled pre-pass.
fn strip_jsonc(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            _ => out.push(c),
        }
    }

    strip_trailing_commas(&out)
}

fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

#[derive(Debug, Deserialize)]
struct ComposeFile {
    services: HashMap<String, ComposeService>,
}

#[derive(Debug, Deserialize)]
struct ComposeService {
    #[serde(default)]
    volumes: Vec<serde_yaml::Value>,
}

/// Parse a compose file's `volumes:` entries, keeping only short-form bind
/// mounts (`HOST:CONTAINER[:MODE]` where `HOST` starts with `.` or `/`);
/// named volumes and `type: volume` long-form mounts are filtered out.
fn parse_compose_volumes(text: &str, project_root: &str) -> Option<Vec<(String, String)>> {
    let file: ComposeFile = serde_yaml::from_str(text).ok()?;
    let mut mappings = Vec::new();

    for service in file.services.values() {
        for volume in &service.volumes {
            let entry = match volume.as_str() {
                Some(s) => s,
                None => continue, // long-form mapping entry, not a bind-mount string
            };
            let mut parts = entry.split(':');
            let host = parts.next().unwrap_or("");
            let container = parts.next().unwrap_or("");
            if container.is_empty() {
                continue;
            }
            if !(host.starts_with('.') || host.starts_with('/')) {
                continue; // named volume
            }
            let host = if let Some(rest) = host.strip_prefix("./") {
                format!("{project_root}/{rest}")
            } else if host == "." {
                project_root.to_string()
            } else {
                host.to_string()
            };
            mappings.push((host, container.to_string()));
        }
    }

    Some(mappings)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn mapper(local: &str, remote: &str) -> PathMapper {
        PathMapper::new(vec![(local.to_string(), remote.to_string())], &PathBuf::from(local))
    }

    #[test]
    fn normalize_collapses_dot_and_dotdot() {
        assert_eq!(normalize("/a/./b/../c"), "/a/c");
        assert_eq!(normalize("/a/b/"), "/a/b");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("a\\b\\c"), "a/b/c");
    }

    #[test]
    fn to_local_translates_via_longest_remote_prefix() {
        let mapper = mapper("/home/me/project", "/var/www/html");
        assert_eq!(mapper.to_local("/var/www/html/app/x.php"), "/home/me/project/app/x.php");
    }

    #[test]
    fn to_remote_translates_via_longest_local_prefix() {
        let mapper = mapper("/home/me/project", "/var/www/html");
        assert_eq!(mapper.to_remote("/home/me/project/app/x.php"), "/var/www/html/app/x.php");
    }

    #[test]
    fn unmatched_path_is_returned_normalized_unchanged() {
        let mapper = mapper("/home/me/project", "/var/www/html");
        assert_eq!(mapper.to_local("/elsewhere/x.php"), "/elsewhere/x.php");
    }

    #[test]
    fn to_local_decodes_file_uri() {
        let mapper = mapper("/home/me/project", "/var/www/html");
        assert_eq!(mapper.to_local("file:///var/www/html/app/x.php"), "/home/me/project/app/x.php");
    }

    #[test]
    fn round_trip_invariant_for_arbitrary_suffix() {
        // invariant 3: to_remote(to_local(b + s)) == b + s
        let mapper = mapper("/home/me/project", "/var/www/html");
        for suffix in ["/a.php", "/dir/b.php", "/x/y/z.php"] {
            let remote = format!("/var/www/html{suffix}");
            let local = mapper.to_local(&remote);
            assert_eq!(mapper.to_remote(&local), remote);
        }
    }

    #[test]
    fn longest_prefix_wins_with_overlapping_mappings() {
        let mapper = PathMapper::new(
            vec![
                ("/home/me/project".to_string(), "/var/www".to_string()),
                ("/home/me/project/vendor".to_string(), "/var/www/vendor".to_string()),
            ],
            &PathBuf::from("/home/me/project"),
        );
        assert_eq!(
            mapper.to_local("/var/www/vendor/lib.php"),
            "/home/me/project/vendor/lib.php"
        );
        assert_eq!(mapper.to_local("/var/www/app.php"), "/home/me/project/app.php");
    }

    #[test]
    fn prefix_match_respects_component_boundary() {
        let mapper = mapper("/home/me/project", "/var/www");
        // /var/wwwroot must not be treated as under /var/www
        assert_eq!(mapper.to_local("/var/wwwroot/x.php"), "/var/wwwroot/x.php");
    }

    #[test]
    fn load_falls_back_to_default_when_nothing_configured() {
        let root = PathBuf::from("/home/me/project");
        let mapper = PathMapper::load(None, None, None, &root);
        assert_eq!(mapper.mappings().len(), 1);
        assert_eq!(mapper.mappings()[0].remote, "/var/www/html");
        assert_eq!(mapper.mappings()[0].local, "/home/me/project");
    }

    #[test]
    fn load_prefers_explicit_over_launch_config() {
        let root = PathBuf::from("/home/me/project");
        let launch = r#"{ "configurations": [{ "type": "php", "pathMappings": { "/var/www/html": "${workspaceFolder}" } }] }"#;
        let mapper = PathMapper::load(
            Some(vec![("/explicit/local".to_string(), "/explicit/remote".to_string())]),
            Some(launch),
            None,
            &root,
        );
        assert_eq!(mapper.mappings()[0].remote, "/explicit/remote");
    }

    #[test]
    fn parses_launch_config_with_comments_and_trailing_commas() {
        let root = "/home/me/project";
        let launch = r#"{
            // a comment
            "configurations": [
                {
                    "type": "php",
                    /* block comment */
                    "pathMappings": {
                        "/var/www/html": "${workspaceFolder}",
                    },
                },
            ],
        }"#;
        let mappings = parse_launch_config(launch, root).unwrap();
        assert_eq!(mappings, vec![(root.to_string(), "/var/www/html".to_string())]);
    }

    #[test]
    fn parses_compose_volumes_filtering_named_volumes() {
        let compose = r#"
services:
  php:
    volumes:
      - ./src:/var/www/html
      - data:/var/lib/data
"#;
        let mappings = parse_compose_volumes(compose, "/home/me/project").unwrap();
        assert_eq!(mappings, vec![("/home/me/project/src".to_string(), "/var/www/html".to_string())]);
    }
}
