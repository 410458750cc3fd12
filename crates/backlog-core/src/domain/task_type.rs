use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::ValidationError;

/// Kind of deferred work. Fixed when the task is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Crawl,
    ParseDocument,
    GenerateSummary,
    IndexPage,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Crawl,
        TaskType::ParseDocument,
        TaskType::GenerateSummary,
        TaskType::IndexPage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Crawl => "CRAWL",
            TaskType::ParseDocument => "PARSE_DOCUMENT",
            TaskType::GenerateSummary => "GENERATE_SUMMARY",
            TaskType::IndexPage => "INDEX_PAGE",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ValidationError::new(format!("unknown task type: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("CRAWL", TaskType::Crawl)]
    #[case("parse_document", TaskType::ParseDocument)]
    #[case("GENERATE_SUMMARY", TaskType::GenerateSummary)]
    #[case("Index_Page", TaskType::IndexPage)]
    fn parses_known_types(#[case] input: &str, #[case] expected: TaskType) {
        assert_eq!(input.parse::<TaskType>().unwrap(), expected);
    }

    #[test]
    fn unknown_type_is_a_validation_error() {
        let err = "TRANSCODE".parse::<TaskType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown task type: TRANSCODE");
    }

    #[test]
    fn serializes_as_screaming_snake_case() {
        let s = serde_json::to_string(&TaskType::GenerateSummary).unwrap();
        assert_eq!(s, "\"GENERATE_SUMMARY\"");
        assert_eq!(TaskType::GenerateSummary.to_string(), "GENERATE_SUMMARY");
    }
}
