//! Channel names shared by schedulers and workers.

pub const PROCESS_MATCH_BATCH: &str = "process_match_batch";
pub const PROCESS_TEAM_DATA: &str = "process_team_data";
pub const PROCESS_LEAGUE_DATA: &str = "process_league_data";
pub const PROCESS_PLAYER_DATA: &str = "process_player_data";

pub const ALL: [&str; 4] = [
    PROCESS_MATCH_BATCH,
    PROCESS_TEAM_DATA,
    PROCESS_LEAGUE_DATA,
    PROCESS_PLAYER_DATA,
];

pub fn is_known(name: &str) -> bool {
    ALL.contains(&name)
}
