//! Guardian Engine
//!
//! Tiered analysis engine for DNS filter traffic.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         GUARDIAN ANALYSIS ENGINE                        │
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────────┐ │
//! │  │   Metadata   │  │  Heuristics  │  │   Anomaly    │  │  Signature  │ │
//! │  │  Classifier  │  │  (entropy,   │  │  (isolation  │  │    Store    │ │
//! │  │ (signatures) │  │ digit ratio) │  │   forest)    │  │  (learned)  │ │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘  └──────┬──────┘ │
//! │         │                 │                 │                 │        │
//! │  ┌──────▼─────────────────▼─────────────────▼─────────────────▼──────┐ │
//! │  │                    DOMAIN FEATURE EXTRACTION                      │ │
//! │  │        length | entropy | digit ratio | vowels | TLD weight       │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! │                                                                         │
//! │  Cheap tiers decide locally; only unresolved names escalate upward.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod anomaly;
pub mod classifier;
pub mod features;
pub mod heuristics;
pub mod signatures;
pub mod validate;
pub mod verdict;

use thiserror::Error;

pub use anomaly::{AnomalyEngine, AnomalyStats, Sample};
pub use classifier::{MetaFinding, MetaOutcome, MetadataClassifier};
pub use features::DomainFeatures;
pub use heuristics::{HeuristicEngine, HeuristicFinding};
pub use signatures::{Signature, SignatureKey, SignatureStore};
pub use validate::ValidateError;
pub use verdict::{Risk, Source, UpstreamEvent, Verdict};

/// Engine error types
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed domain input
    #[error("validation error: {0}")]
    Validation(#[from] validate::ValidateError),
    /// Snapshot read/write failure
    #[error("snapshot error: {0}")]
    Snapshot(#[from] std::io::Error),
}
