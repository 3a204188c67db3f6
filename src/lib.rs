// ABOUTME: Library root for monday-replicator
// ABOUTME: Exposes the sync engine, its collaborators and configuration

pub mod clock;
pub mod config;
pub mod daemon;
pub mod differ;
pub mod error;
pub mod pager;
pub mod planner;
pub mod remote;
pub mod sink;
pub mod source;
pub mod watermark;

pub use config::{Config, ObjectOptions};
pub use error::{SyncError, SyncResult};
pub use planner::{RunStatus, RunSummary, SyncPlan, SyncPlanner};
pub use source::{MondaySource, ObjectType, Record};
pub use watermark::{SyncMode, Watermark, WatermarkStore};
