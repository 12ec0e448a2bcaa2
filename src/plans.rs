use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};

const INDEX_VERSION: &str = "2.0.0";
const PREVIEW_MAX_CHARS: usize = 200;
const UNDATED: &str = "0000-00-00";

static FRONTMATTER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9_]+)\s*:\s*(.*)$").expect("frontmatter line pattern"));
static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```.*?```").expect("code fence pattern"));

#[derive(Debug, Clone)]
pub struct PlansIndexConfig {
    pub plans_dir: PathBuf,
    pub out_file: PathBuf,
    pub default_owner: String,
}

/// Build one browsable JSON index out of a folder of Markdown plan
/// documents. Returns the number of indexed plans.
pub fn build_plans_index(config: &PlansIndexConfig, generated_at: DateTime<Utc>) -> Result<usize> {
    let entries = fs::read_dir(&config.plans_dir)
        .with_context(|| format!("plans dir not found: {}", config.plans_dir.display()))?;
    let mut files: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".md"))
        .collect();
    files.sort();

    let mut items = Vec::with_capacity(files.len());
    for file in &files {
        let path = config.plans_dir.join(file);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("unable to read plan {}", path.display()))?;
        items.push(plan_item(file, &text, &path, &config.default_owner));
    }

    // Newest activity first; title keeps equal dates deterministic.
    items.sort_by(|a, b| {
        let a_updated = item_str(a, "updated").unwrap_or(UNDATED);
        let b_updated = item_str(b, "updated").unwrap_or(UNDATED);
        b_updated
            .cmp(a_updated)
            .then_with(|| item_str(a, "title").unwrap_or("").cmp(item_str(b, "title").unwrap_or("")))
    });

    let mut areas: Vec<String> = items
        .iter()
        .filter_map(|item| item_str(item, "area").map(str::to_string))
        .collect();
    areas.sort();
    areas.dedup();

    let index = json!({
        "version": INDEX_VERSION,
        "generated_at": generated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "items": items,
        "areas": areas,
    });

    if let Some(parent) = config.out_file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("unable to create {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(&index).context("unable to serialize plans index")?;
    fs::write(&config.out_file, format!("{text}\n"))
        .with_context(|| format!("unable to write {}", config.out_file.display()))?;
    Ok(files.len())
}

fn item_str<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str)
}

fn plan_item(file: &str, text: &str, path: &Path, default_owner: &str) -> Value {
    let (frontmatter, body) = parse_frontmatter(text);
    let (h1_title, headings) = extract_title_and_headings(body);

    let title = frontmatter
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(h1_title)
        .unwrap_or_else(|| filename_title(file));

    let created = git_file_date(path, "%ad");
    let updated = git_file_date(path, "%cd");

    let id = frontmatter
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "plan-{}-{}",
                created.as_deref().unwrap_or(UNDATED),
                slugify(&title)
            )
        });

    json!({
        "id": id,
        "title": title,
        "area": fm_string(&frontmatter, "area", "general"),
        "priority": fm_string(&frontmatter, "priority", "P3"),
        "status": fm_string(&frontmatter, "status", "inbox"),
        "owner": fm_string(&frontmatter, "owner", default_owner),
        "progress": frontmatter.get("progress").and_then(Value::as_i64).unwrap_or(0),
        "risk": fm_string(&frontmatter, "risk", "medium"),
        "due": frontmatter.get("due").cloned().unwrap_or(Value::Null),
        "tags": fm_list(&frontmatter, "tags"),
        "links": match frontmatter.get("links") {
            Some(Value::Array(links)) => Value::Array(links.clone()),
            _ => json!([]),
        },
        "path": format!("plans/{file}"),
        "created": created,
        "updated": updated,
        "preview": preview_line(body),
        "headings": headings,
    })
}

fn fm_string(frontmatter: &Map<String, Value>, key: &str, default: &str) -> String {
    frontmatter
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

fn fm_list(frontmatter: &Map<String, Value>, key: &str) -> Value {
    match frontmatter.get(key) {
        Some(Value::Array(values)) => Value::Array(values.clone()),
        Some(Value::String(text)) => Value::Array(
            text.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect(),
        ),
        _ => json!([]),
    }
}

/// Split an optional leading `---` block into loosely-typed key/value
/// pairs and the remaining body. Lines that are not `key: value` are
/// ignored.
pub fn parse_frontmatter(text: &str) -> (Map<String, Value>, &str) {
    let mut data = Map::new();
    let Some(rest) = text.strip_prefix("---\n") else {
        return (data, text);
    };
    let Some((block, body)) = rest.split_once("\n---") else {
        return (data, text);
    };
    let body = body.strip_prefix('\n').unwrap_or(body);

    for line in block.lines() {
        if let Some(captures) = FRONTMATTER_LINE.captures(line) {
            let key = captures[1].to_string();
            data.insert(key, coerce_value(captures[2].trim()));
        }
    }
    (data, body)
}

/// Frontmatter values stay plain strings unless they look like a JSON
/// array, a comma list, an integer, a boolean, or null.
fn coerce_value(raw: &str) -> Value {
    if raw.starts_with('[') && raw.ends_with(']')
        && let Ok(parsed) = serde_json::from_str::<Value>(raw)
    {
        return parsed;
    }
    if raw.contains(',') {
        return Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect(),
        );
    }
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(number) = raw.parse::<i64>() {
            return Value::Number(number.into());
        }
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" | "NULL" => Value::Null,
        other => Value::String(other.to_string()),
    }
}

/// First `# H1` becomes the title; every deeper heading is collected in
/// document order.
pub fn extract_title_and_headings(body: &str) -> (Option<String>, Vec<String>) {
    let mut title = None;
    let mut headings = Vec::new();
    for line in body.lines() {
        let hashes = line.bytes().take_while(|b| *b == b'#').count();
        if hashes == 0 || hashes > 6 {
            continue;
        }
        let rest = &line[hashes..];
        if !rest.starts_with(' ') && !rest.starts_with('\t') {
            continue;
        }
        let rest = rest.trim();
        if rest.is_empty() {
            continue;
        }
        if hashes == 1 {
            if title.is_none() {
                title = Some(rest.to_string());
            }
        } else {
            headings.push(rest.to_string());
        }
    }
    (title, headings)
}

fn filename_title(file: &str) -> String {
    file.trim_end_matches(".md")
        .replace(['-', '_'], " ")
        .trim()
        .to_string()
}

pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut last_was_dash = false;
    for ch in input.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_was_dash = false;
        } else if !last_was_dash && !slug.is_empty() {
            slug.push('-');
            last_was_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// First non-empty body line with fenced code blocks removed, capped at
/// 200 characters.
pub fn preview_line(body: &str) -> String {
    let stripped = CODE_FENCE.replace_all(body, "");
    stripped
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(PREVIEW_MAX_CHARS).collect())
        .unwrap_or_default()
}

/// Latest commit date for a file, via the git CLI: `%ad` for the author
/// date, `%cd` for the committer date. None outside a git checkout.
fn git_file_date(path: &Path, format: &str) -> Option<String> {
    let dir = path.parent()?;
    let name = path.file_name()?;
    let output = Command::new("git")
        .arg("log")
        .arg("-1")
        .arg(format!("--format={format}"))
        .arg("--date=short")
        .arg("--")
        .arg(name)
        .current_dir(dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let date = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!date.is_empty()).then_some(date)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn frontmatter_values_coerce_by_shape() {
        let text = "---\n\
                    title: Rebuild the NAS\n\
                    priority: P1\n\
                    progress: 30\n\
                    archived: false\n\
                    due: null\n\
                    tags: storage, backup\n\
                    links: [\"https://example.com\"]\n\
                    not a key line\n\
                    ---\n\
                    Body starts here.\n";
        let (data, body) = parse_frontmatter(text);
        assert_eq!(data.get("title"), Some(&Value::String("Rebuild the NAS".into())));
        assert_eq!(data.get("progress"), Some(&json!(30)));
        assert_eq!(data.get("archived"), Some(&Value::Bool(false)));
        assert_eq!(data.get("due"), Some(&Value::Null));
        assert_eq!(data.get("tags"), Some(&json!(["storage", "backup"])));
        assert_eq!(data.get("links"), Some(&json!(["https://example.com"])));
        assert!(body.starts_with("Body starts here."));
    }

    #[test]
    fn missing_frontmatter_leaves_body_untouched() {
        let text = "# Just a doc\n\nContent.\n";
        let (data, body) = parse_frontmatter(text);
        assert!(data.is_empty());
        assert_eq!(body, text);
    }

    #[test]
    fn title_comes_from_first_h1_and_headings_from_deeper_levels() {
        let body = "# Main title\n\nIntro.\n\n## Step one\n\n### Detail\n\n# Ignored second h1\n";
        let (title, headings) = extract_title_and_headings(body);
        assert_eq!(title.as_deref(), Some("Main title"));
        assert_eq!(headings, vec!["Step one", "Detail"]);
    }

    #[test]
    fn slugify_collapses_non_alphanumeric_runs() {
        assert_eq!(slugify("Rebuild the NAS!"), "rebuild-the-nas");
        assert_eq!(slugify("  Multi   space / slash  "), "multi-space-slash");
        assert_eq!(slugify("???"), "untitled");
    }

    #[test]
    fn preview_skips_code_fences_and_blank_lines() {
        let body = "\n```\nlet hidden = true;\n```\n\nFirst real paragraph line.\nSecond line.\n";
        assert_eq!(preview_line(body), "First real paragraph line.");
    }

    #[test]
    fn preview_is_capped_at_two_hundred_chars() {
        let long = "x".repeat(500);
        assert_eq!(preview_line(&long).chars().count(), 200);
    }

    #[test]
    fn index_is_sorted_by_updated_then_title_with_defaults_applied() {
        let dir = tempdir().expect("tempdir");
        let plans_dir = dir.path().join("plans");
        fs::create_dir_all(&plans_dir).expect("create plans dir");
        fs::write(
            plans_dir.join("beta.md"),
            "---\ntitle: Beta plan\narea: infra\n---\n\nBeta body.\n",
        )
        .expect("write beta");
        fs::write(plans_dir.join("alpha.md"), "# Alpha plan\n\nAlpha body.\n")
            .expect("write alpha");

        let out_file = dir.path().join("out/index.json");
        let config = PlansIndexConfig {
            plans_dir,
            out_file: out_file.clone(),
            default_owner: "unassigned".to_string(),
        };
        let generated_at = Utc.with_ymd_and_hms(2026, 8, 8, 12, 0, 0).single().expect("time");
        let count = build_plans_index(&config, generated_at).expect("build index");
        assert_eq!(count, 2);

        let index: Value =
            serde_json::from_str(&fs::read_to_string(&out_file).expect("read index"))
                .expect("valid index json");
        assert_eq!(index["version"], "2.0.0");
        assert_eq!(index["areas"], json!(["general", "infra"]));

        let items = index["items"].as_array().expect("items array");
        assert_eq!(items.len(), 2);
        // Outside a git checkout both plans are undated, so titles decide.
        let titles: Vec<&str> = items
            .iter()
            .map(|item| item["title"].as_str().expect("title"))
            .collect();
        assert_eq!(titles, vec!["Alpha plan", "Beta plan"]);

        let alpha = &items[0];
        assert_eq!(alpha["area"], "general");
        assert_eq!(alpha["priority"], "P3");
        assert_eq!(alpha["status"], "inbox");
        assert_eq!(alpha["owner"], "unassigned");
        assert_eq!(alpha["progress"], 0);
        assert_eq!(alpha["risk"], "medium");
        assert_eq!(alpha["due"], Value::Null);
        assert_eq!(alpha["preview"], "Alpha body.");
        assert_eq!(alpha["path"], "plans/alpha.md");
        assert_eq!(alpha["id"], "plan-0000-00-00-alpha-plan");

        let beta = &items[1];
        assert_eq!(beta["area"], "infra");
        assert_eq!(beta["title"], "Beta plan");
    }

    #[test]
    fn missing_plans_dir_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let config = PlansIndexConfig {
            plans_dir: dir.path().join("nope"),
            out_file: dir.path().join("index.json"),
            default_owner: "unassigned".to_string(),
        };
        let generated_at = Utc.with_ymd_and_hms(2026, 8, 8, 12, 0, 0).single().expect("time");
        let err = build_plans_index(&config, generated_at).expect_err("should fail");
        assert!(err.to_string().contains("plans dir not found"));
    }
}
