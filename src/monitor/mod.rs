pub mod aggregator;
pub mod client;
pub mod ingest;
pub mod keyset;
pub mod loader;
pub mod pipeline;
pub mod status;
pub mod types;

/// Sources served by mock mode, matching the collector's demo endpoints.
pub const MOCK_SOURCES: [&str; 3] = [
    "https://api.github.com",
    "https://httpstat.us/200",
    "https://httpstat.us/503",
];
