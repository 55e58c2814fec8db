//! Suggestions for misspelled node, module and parameter names.

use strsim::levenshtein;

/// Maximum edit distance, as a percentage of the target length, for a suggestion.
const SIMILARITY_THRESHOLD_PERCENT: usize = 50;

/// Up to three candidates close to `target`, closest first.
pub fn suggest_similar<'a, I>(target: &str, candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let max_distance = std::cmp::max(1, target.len() * SIMILARITY_THRESHOLD_PERCENT / 100);
    let mut scored: Vec<(usize, &str)> = candidates
        .into_iter()
        .filter(|candidate| *candidate != target)
        .map(|candidate| (levenshtein(target, candidate), candidate))
        .filter(|(distance, _)| *distance <= max_distance)
        .collect();
    scored.sort();
    scored.into_iter().take(3).map(|(_, candidate)| candidate.to_string()).collect()
}

/// `" (did you mean 'x'?)"` or an empty string.
pub fn did_you_mean<'a, I>(target: &str, candidates: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    match suggest_similar(target, candidates).first() {
        Some(best) => format!(" (did you mean '{best}'?)"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggests_close_match() {
        let candidates = ["storage", "search", "openai"];
        assert_eq!(suggest_similar("storgae", candidates), vec!["storage".to_string()]);
        assert_eq!(did_you_mean("serch", candidates), " (did you mean 'search'?)");
    }

    #[test]
    fn test_no_suggestion_for_distant_names() {
        assert!(did_you_mean("eventgrid", ["storage", "search"]).is_empty());
    }
}
