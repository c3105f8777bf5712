pub mod feed;
pub mod model;
pub mod prediction;

pub use feed::{BackfillJob, BackfillStatus, FeedIngestionState, FeedRecord, FeedScope};
pub use model::{LeaderboardEntry, LeaderboardRecord, Model};
pub use prediction::{
    CheckpointRecord, CheckpointStatus, InputRecord, InputStatus, PredictionRecord,
    PredictionScope, PredictionStatus, ScheduledPredictionConfig, ScoreOutcome, SnapshotRecord,
};
