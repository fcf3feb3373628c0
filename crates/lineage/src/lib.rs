#![forbid(unsafe_code)]

pub mod adapters;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod index;
pub mod models;
pub mod observability;
pub mod rebuild;
pub mod resolve;
pub mod skeleton;
pub mod storage;
pub mod utils;

pub use cache::{CacheOptions, Freshness, SkeletonCache};
pub use cli::app::{Cli, Command};
pub use models::{ConversationSkeleton, RawMessage, ResolutionReport};
pub use storage::{FileTaskStorage, InMemoryStorage, TaskStorage};
