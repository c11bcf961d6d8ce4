//! Mining embedded JSON for event facts. JSON-LD script blocks and
//! intercepted API payloads share the same value-walking helpers.

use chrono::{Datelike, NaiveDate};
use scraper::{Html, Selector};
use serde_json::{Map, Value};

use sideout_core::textdate::{extract_first_date_on, is_multiweek_date_range_on, normalize_ws};

/// Keys that carry an event start date, in lookup order.
pub const START_DATE_KEYS: &[&str] = &["startDate", "dateStart", "start_date"];

const END_DATE_KEYS: &[&str] = &["endDate", "dateEnd", "end_date"];
const RANGE_HINT_KEYS: &[&str] = &["startDate", "endDate", "date", "eventDate"];

/// Multi-week cutoff for a start/end pair, inclusive of both days.
const MULTIWEEK_MIN_DAYS: i64 = 8;

/// Raw JSON-LD block texts in document order.
pub fn json_ld_blocks(doc: &Html) -> Vec<String> {
    let Ok(selector) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    doc.select(&selector)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|raw| !raw.is_empty())
        .collect()
}

/// Parses block texts, dropping anything that is not valid JSON.
pub fn parse_blocks(blocks: &[String]) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|raw| serde_json::from_str(raw.trim()).ok())
        .collect()
}

fn walk<'a>(value: &'a Value, found: &mut Vec<&'a Map<String, Value>>) {
    match value {
        Value::Object(map) => {
            found.push(map);
            for child in map.values() {
                walk(child, found);
            }
        }
        Value::Array(items) => {
            for child in items {
                walk(child, found);
            }
        }
        _ => {}
    }
}

/// Every JSON object in the tree, parents before children.
pub fn collect_objects(value: &Value) -> Vec<&Map<String, Value>> {
    let mut found = Vec::new();
    walk(value, &mut found);
    found
}

/// Top-level objects only: a bare object, or the objects of one
/// top-level array. Nested structure is not searched.
pub fn top_level_objects(values: &[Value]) -> Vec<&Map<String, Value>> {
    let mut found = Vec::new();
    for value in values {
        match value {
            Value::Object(map) => found.push(map),
            Value::Array(items) => found.extend(items.iter().filter_map(Value::as_object)),
            _ => {}
        }
    }
    found
}

/// First non-empty string among `keys`, whitespace-normalized.
pub fn first_str(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(text) = obj.get(*key).and_then(Value::as_str) {
            let cleaned = normalize_ws(text);
            if !cleaned.is_empty() {
                return Some(cleaned);
            }
        }
    }
    None
}

fn first_nonempty_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str).filter(|s| !s.is_empty()))
}

/// First parseable start date anywhere in the parsed blocks.
pub fn first_start_date(values: &[Value], today: NaiveDate) -> Option<NaiveDate> {
    for value in values {
        for obj in collect_objects(value) {
            for key in START_DATE_KEYS {
                if let Some(text) = obj.get(*key).and_then(Value::as_str) {
                    if let Some(date) = extract_first_date_on(text, today) {
                        return Some(date);
                    }
                }
            }
        }
    }
    None
}

/// Every `name` string anywhere in the parsed blocks.
pub fn all_names(values: &[Value]) -> Vec<String> {
    let mut names = Vec::new();
    for value in values {
        for obj in collect_objects(value) {
            if let Some(name) = obj.get("name").and_then(Value::as_str) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// `name` strings from top-level objects only.
pub fn top_level_names(values: &[Value]) -> Vec<String> {
    top_level_objects(values)
        .into_iter()
        .filter_map(|obj| obj.get("name").and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// True when any object carries a start/end pair spanning eight or more
/// days, or a date field that is itself a multi-week textual range. An
/// end date earlier than its start is assumed to have rolled into the
/// next year.
pub fn has_multiweek_range(values: &[Value], today: NaiveDate) -> bool {
    for value in values {
        for obj in collect_objects(value) {
            let pair = (
                first_nonempty_str(obj, START_DATE_KEYS),
                first_nonempty_str(obj, END_DATE_KEYS),
            );
            if let (Some(start_text), Some(end_text)) = pair {
                let start = extract_first_date_on(start_text, today);
                let end = extract_first_date_on(end_text, today);
                if let (Some(start), Some(mut end)) = (start, end) {
                    if end < start {
                        if let Some(rolled) = end.with_year(end.year() + 1) {
                            end = rolled;
                        }
                    }
                    if (end - start).num_days() >= MULTIWEEK_MIN_DAYS {
                        return true;
                    }
                }
            }
            for key in RANGE_HINT_KEYS {
                if let Some(text) = obj.get(*key).and_then(Value::as_str) {
                    if is_multiweek_date_range_on(text, today) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    #[test]
    fn blocks_are_read_from_ld_json_scripts_only() {
        let doc = Html::parse_document(
            r#"<html><head>
            <script type="application/ld+json">{"name": "Open"}</script>
            <script type="text/javascript">var x = 1;</script>
            <script type="application/ld+json">   </script>
            </head></html>"#,
        );
        let blocks = json_ld_blocks(&doc);
        assert_eq!(blocks, vec![r#"{"name": "Open"}"#.to_string()]);
    }

    #[test]
    fn invalid_json_blocks_are_dropped() {
        let blocks = vec!["{broken".to_string(), r#"{"ok": true}"#.to_string()];
        assert_eq!(parse_blocks(&blocks).len(), 1);
    }

    #[test]
    fn collect_objects_walks_nested_arrays_and_maps() {
        let value = json!({"a": [{"b": {"c": 1}}, 2], "d": {"e": []}});
        assert_eq!(collect_objects(&value).len(), 4);
    }

    #[test]
    fn top_level_objects_ignore_nested_structure() {
        let values = vec![json!([{"name": "A"}, {"name": "B"}]), json!({"name": "C", "sub": {"name": "D"}})];
        assert_eq!(top_level_names(&values), vec!["A", "B", "C"]);
        assert_eq!(all_names(&values), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn first_start_date_reads_nested_objects() {
        let values = vec![json!({"@graph": [{"startDate": "2025-06-14T09:00:00"}]})];
        assert_eq!(
            first_start_date(&values, today()),
            NaiveDate::from_ymd_opt(2025, 6, 14)
        );
    }

    #[test]
    fn first_str_normalizes_and_skips_empty_values() {
        let value = json!({"title": "  ", "name": " Summer  Open "});
        let obj = value.as_object().unwrap();
        assert_eq!(first_str(obj, &["title", "name"]).as_deref(), Some("Summer Open"));
        assert_eq!(first_str(obj, &["missing"]), None);
    }

    #[test]
    fn multiweek_detects_long_start_end_pairs() {
        let values = vec![json!({"startDate": "2025-06-01", "endDate": "2025-07-20"})];
        assert!(has_multiweek_range(&values, today()));
        let short = vec![json!({"startDate": "2025-06-01", "endDate": "2025-06-02"})];
        assert!(!has_multiweek_range(&short, today()));
    }

    #[test]
    fn multiweek_rolls_year_when_end_precedes_start() {
        let values = vec![json!({"startDate": "2025-12-20", "endDate": "2025-01-10"})];
        assert!(has_multiweek_range(&values, today()));
    }

    #[test]
    fn multiweek_reads_textual_ranges_in_date_fields() {
        let values = vec![json!({"date": "June 3 - August 5, 2025"})];
        assert!(has_multiweek_range(&values, today()));
        let compact = vec![json!({"date": "June 3 - June 5, 2025"})];
        assert!(!has_multiweek_range(&compact, today()));
    }
}
