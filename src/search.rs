//! Pluggable web search seam for the /websearch command.

/// A search backend returning an ordered list of result lines.
pub trait SearchProvider: Send + Sync {
    fn search(&self, query: &str) -> Vec<String>;
}

/// Placeholder provider. Swap in a real search API integration here.
pub struct StubSearch;

impl SearchProvider for StubSearch {
    fn search(&self, _query: &str) -> Vec<String> {
        vec![
            "Result 1: Some search result URL".to_string(),
            "Result 2: Another search result URL".to_string(),
            "Result 3: Third search result URL".to_string(),
        ]
    }
}

/// Build the reply text: query echoed, then newline-joined results.
pub fn format_results(query: &str, results: &[String]) -> String {
    format!("Top results for {}:\n\n{}", query, results.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_returns_three_results() {
        let results = StubSearch.search("anything");
        assert_eq!(results.len(), 3);
        assert!(results[0].starts_with("Result 1"));
    }

    #[test]
    fn test_stub_ignores_query() {
        assert_eq!(StubSearch.search("rust"), StubSearch.search("telegram"));
    }

    #[test]
    fn test_format_results() {
        let results = vec!["first".to_string(), "second".to_string()];
        assert_eq!(
            format_results("rust bots", &results),
            "Top results for rust bots:\n\nfirst\nsecond"
        );
    }
}
