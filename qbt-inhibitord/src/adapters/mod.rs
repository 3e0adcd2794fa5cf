pub mod github_release;
pub mod net_counters;
pub mod plex;
pub mod qbittorrent;

pub use github_release::GithubReleases;
pub use net_counters::ProcNetDev;
pub use plex::PlexSessions;
pub use qbittorrent::QbittorrentClient;
