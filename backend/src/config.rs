use std::env;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// When set, groups are snapshotted to this file after every mutation
    /// and loaded back on startup.
    pub persist_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            persist_path: env::var("PERSIST_PATH").ok().map(PathBuf::from),
        }
    }
}
