//! GitHub REST client and the remote sources built on it.

mod api_types;
mod cache;
mod client;
mod retry;
mod sources;
mod types;

pub use client::{GitHubClient, RateLimit};
pub use retry::RetryPolicy;
pub use sources::{IssueSource, MilestoneSource, ReleaseSource};
pub use types::{Issue, IssueFilter, ItemState, Milestone, MilestoneRef, NewIssue, Release};
