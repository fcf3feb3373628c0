pub mod message;
pub mod report;
pub mod skeleton;

pub use message::{MessageOrigin, RawMessage, SignalKind};
pub use report::{
    AmbiguityRecord, Anomaly, AnomalyKind, ResolutionMethod, ResolutionReport, TaskError,
    all_resolution_methods,
};
pub use skeleton::{
    ConversationSkeleton, SKELETON_SCHEMA_VERSION, SkeletonMetadata, TimestampQuality,
    skeleton_json_schema,
};
