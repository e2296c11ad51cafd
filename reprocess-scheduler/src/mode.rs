use std::str::FromStr;

use thiserror::Error;

use reprocess_common::payload::MatchId;

#[derive(Error, Debug, PartialEq)]
pub enum ModeError {
    #[error("invalid scheduler mode: {0}")]
    InvalidMode(String),
    #[error("invalid match id: {0:?}")]
    InvalidMatchId(String),
}

// Mode names, used by config/environment parsing to verify the mode is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    /// Read match ids from stdin and dispatch them.
    Schedule,
    /// Print the size of the dispatch dedup set.
    Count,
    /// Drop the dispatch dedup set, so every id is dispatched again.
    Clear,
}

impl FromStr for SchedulerMode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, ModeError> {
        match s {
            "schedule" => Ok(SchedulerMode::Schedule),
            "count" => Ok(SchedulerMode::Count),
            "clear" => Ok(SchedulerMode::Clear),
            _ => Err(ModeError::InvalidMode(s.to_owned())),
        }
    }
}

/// Parse match ids separated by whitespace and/or commas.
pub fn parse_match_ids(input: &str) -> Result<Vec<MatchId>, ModeError> {
    input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<MatchId>()
                .map_err(|_| ModeError::InvalidMatchId(token.to_owned()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_str() {
        assert_eq!("schedule".parse(), Ok(SchedulerMode::Schedule));
        assert_eq!("count".parse(), Ok(SchedulerMode::Count));
        assert_eq!("clear".parse(), Ok(SchedulerMode::Clear));
        assert_eq!(
            "webhooks".parse::<SchedulerMode>(),
            Err(ModeError::InvalidMode("webhooks".to_owned()))
        );
    }

    #[test]
    fn test_parse_match_ids() {
        let ids = parse_match_ids("10, 11\n12\t13,,\n").unwrap();
        assert_eq!(ids, vec![10, 11, 12, 13]);

        assert!(parse_match_ids("").unwrap().is_empty());
        assert_eq!(
            parse_match_ids("1 two 3"),
            Err(ModeError::InvalidMatchId("two".to_owned()))
        );
        assert!(parse_match_ids("-4").is_err());
    }
}
