const DEFAULT_AGENT_PORT: u16 = 51243;

pub fn get_default_port() -> u16 {
    DEFAULT_AGENT_PORT
}

const MONITOR_PARTITION: &str = "MONITOR_PARTITION";

/// Partition number from the environment, if set and valid
pub fn get_partition() -> Option<u32> {
    let partition_from_env = std::env::var(MONITOR_PARTITION);
    partition_from_env.ok().and_then(|res| res.trim().parse().ok())
}

const MONITOR_DATABASE_URL: &str = "MONITOR_DATABASE_URL";

/// Connection string of the database carrying the peer-partition channel
pub fn get_database_url() -> Option<String> {
    let url_from_env = std::env::var(MONITOR_DATABASE_URL);
    url_from_env.ok().filter(|url| !url.trim().is_empty())
}
