//! SEO Jobs — submit long-running analysis jobs to a remote worker and track
//! them to completion.

pub mod config;
pub mod error;
pub mod jobs;
pub mod mock_worker;
