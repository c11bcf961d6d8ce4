//! Heuristic title selection. Event pages rarely label their title
//! cleanly, so each source collects every plausible candidate string and
//! scores them against a per-source rule table; the best candidate wins
//! only if it clears a shared acceptance threshold.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use sideout_core::textdate::{normalize_ws, tidy_title};

/// Minimum score a candidate needs to be accepted as a real title.
pub const ACCEPT_THRESHOLD: i32 = 8;

const MIN_LENGTH: usize = 4;
const LENGTH_PENALTY: i32 = -10;
const LOWERCASE_BONUS: i32 = 3;
const GENERIC_SCORE: i32 = -1000;
const EMPTY_SCORE: i32 = -10_000;

static DATE_LIKE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+\d{1,2}\b")
        .unwrap()
});
static BARE_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{4}\b").unwrap());

/// Per-source scoring knobs. A zeroed field disables that rule.
pub struct TitleRules {
    /// Lowercased site-boilerplate phrases that disqualify a candidate.
    pub generic_phrases: &'static [&'static str],
    /// Suffix/prefix patterns removed before scoring.
    pub strip_patterns: Vec<Regex>,
    pub non_title: Regex,
    pub non_title_penalty: i32,
    pub hints: Regex,
    pub hint_bonus: i32,
    /// Bonus for an explicit `tournament:` prefix.
    pub tournament_prefix_bonus: i32,
    /// Penalty when the candidate says league but never tournament.
    pub league_mismatch_penalty: i32,
    pub max_length: usize,
    pub length_bonus: i32,
    pub date_like_penalty: i32,
    pub bare_year_penalty: i32,
}

impl TitleRules {
    /// Normalizes a raw candidate: collapse whitespace, strip calls to
    /// action and site chrome, trim decoration characters.
    pub fn clean(&self, raw: &str) -> String {
        let mut title = tidy_title(raw);
        for pattern in &self.strip_patterns {
            title = pattern.replace_all(&title, "").into_owned();
        }
        let title = title.trim_matches(&[' ', '*', '|', '-', ':', '\t'][..]);
        normalize_ws(title)
    }

    fn is_generic(&self, normalized: &str) -> bool {
        self.generic_phrases.iter().any(|phrase| normalized.contains(phrase))
    }

    /// Scores one cleaned candidate.
    pub fn score(&self, title: &str) -> i32 {
        if title.is_empty() {
            return EMPTY_SCORE;
        }
        let normalized = title.to_lowercase();
        if self.is_generic(&normalized) {
            return GENERIC_SCORE;
        }
        let mut score = 0;
        if self.non_title.is_match(&normalized) {
            score += self.non_title_penalty;
        }
        if self.league_mismatch_penalty != 0
            && normalized.contains("league")
            && !normalized.contains("tournament")
        {
            score += self.league_mismatch_penalty;
        }
        if self.hints.is_match(&normalized) {
            score += self.hint_bonus;
        }
        if self.tournament_prefix_bonus != 0 && normalized.starts_with("tournament:") {
            score += self.tournament_prefix_bonus;
        }
        let length = title.chars().count();
        if (MIN_LENGTH..=self.max_length).contains(&length) {
            score += self.length_bonus;
        } else {
            score += LENGTH_PENALTY;
        }
        if DATE_LIKE_RE.is_match(&normalized) {
            score += self.date_like_penalty;
        }
        if self.bare_year_penalty != 0 && BARE_YEAR_RE.is_match(&normalized) {
            score += self.bare_year_penalty;
        }
        if title.chars().any(|c| c.is_ascii_lowercase()) {
            score += LOWERCASE_BONUS;
        }
        score
    }

    /// Cleans, dedups, and scores candidates in order; earlier candidates
    /// win score ties. Returns `None` when nothing clears the threshold.
    pub fn select_best(&self, candidates: impl IntoIterator<Item = String>) -> Option<String> {
        let mut seen = HashSet::new();
        let mut deduped: Vec<String> = Vec::new();
        for raw in candidates {
            let cleaned = self.clean(&raw);
            if cleaned.is_empty() {
                continue;
            }
            if seen.insert(cleaned.to_lowercase()) {
                deduped.push(cleaned);
            }
        }
        let mut best: Option<(i32, usize)> = None;
        for (idx, title) in deduped.iter().enumerate() {
            let score = self.score(title);
            if best.is_none_or(|(best_score, _)| score > best_score) {
                best = Some((score, idx));
            }
        }
        match best {
            Some((score, idx)) if score >= ACCEPT_THRESHOLD => Some(deduped.swap_remove(idx)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> TitleRules {
        TitleRules {
            generic_phrases: &["demo beach volleyball"],
            strip_patterns: vec![
                Regex::new(r"(?i)\s*[-|•]\s*Demo Beach.*$").unwrap(),
                Regex::new(r"(?i)^\s*tournament:\s*").unwrap(),
            ],
            non_title: Regex::new(r"(?i)\b(register|details|pricing)\b").unwrap(),
            non_title_penalty: -200,
            hints: Regex::new(r"(?i)\b(coed|series|tournament)\b").unwrap(),
            hint_bonus: 40,
            tournament_prefix_bonus: 0,
            league_mismatch_penalty: -120,
            max_length: 100,
            length_bonus: 10,
            date_like_penalty: -8,
            bare_year_penalty: -3,
        }
    }

    #[test]
    fn clean_strips_site_suffix_and_decoration() {
        let rules = rules();
        assert_eq!(rules.clean("  Summer  Open - Demo Beach Volleyball "), "Summer Open");
        assert_eq!(rules.clean("Tournament: King of the Court *"), "King of the Court");
    }

    #[test]
    fn pipe_separators_fold_to_spaces_before_suffix_stripping() {
        // `tidy_title` turns pipes into spaces first, so a pipe-joined
        // site suffix survives cleaning and is left for the generic and
        // scoring checks.
        assert_eq!(
            rules().clean("Summer Open | Demo Beach Volleyball"),
            "Summer Open Demo Beach Volleyball"
        );
    }

    #[test]
    fn clean_drops_call_to_action_text() {
        assert_eq!(rules().clean("Register for Summer Open"), "for Summer Open");
    }

    #[test]
    fn scoring_prefers_hinted_titles_over_chrome() {
        let rules = rules();
        assert!(rules.score("Coed Series Stop 3") > rules.score("Event Pricing Details"));
    }

    #[test]
    fn generic_candidates_score_far_below_threshold() {
        assert_eq!(rules().score("Demo Beach Volleyball Calendar"), -1000);
    }

    #[test]
    fn league_without_tournament_is_penalized() {
        let rules = rules();
        assert!(rules.score("Monday Night League") < 0);
        assert!(rules.score("League Players Tournament") > 0);
    }

    #[test]
    fn length_window_counts_characters() {
        let rules = rules();
        assert!(rules.score("abc") < rules.score("abcd"));
        let long = "x".repeat(120);
        assert!(rules.score(&long) < rules.score("Coed Open"));
    }

    #[test]
    fn date_text_and_bare_years_lose_points() {
        let rules = rules();
        assert!(rules.score("Coed Open June 14") < rules.score("Coed Open"));
        assert!(rules.score("Coed Open 2025") < rules.score("Coed Open"));
    }

    #[test]
    fn select_best_keeps_the_first_of_tied_candidates() {
        let rules = rules();
        let best = rules.select_best(vec![
            "Sand Series Open".to_string(),
            "Series Sand Open".to_string(),
        ]);
        assert_eq!(best.as_deref(), Some("Sand Series Open"));
    }

    #[test]
    fn select_best_rejects_everything_below_threshold() {
        let rules = rules();
        assert_eq!(rules.select_best(vec!["Register".to_string(), String::new()]), None);
    }

    #[test]
    fn select_best_dedups_case_insensitively_before_scoring() {
        let rules = rules();
        let best = rules.select_best(vec![
            "COED OPEN".to_string(),
            "coed open".to_string(),
        ]);
        // The all-caps first occurrence survives dedup and misses the
        // lowercase bonus, but still clears the threshold.
        assert_eq!(best.as_deref(), Some("COED OPEN"));
    }
}
