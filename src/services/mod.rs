//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `normalizer` - Turns push and poll payloads into location reports
//! - `directory` - Subject and recipient lookup
//! - `geofence_index` - Site snapshots with a bounding-box prefilter
//! - `state_store` - Per subject and site containment state
//! - `detector` - Enter/exit transition detection
//! - `interpolator` - Synthetic gap-fill points between sparse fixes
//! - `scheduler` - Per-report evaluation plus the proactive sweep
//! - `dispatcher` - Async notification delivery with retry

pub mod detector;
pub mod directory;
pub mod dispatcher;
pub mod geofence_index;
pub mod interpolator;
pub mod normalizer;
pub mod scheduler;
pub mod state_store;

// Re-export commonly used types
pub use detector::TransitionDetector;
pub use directory::{RecipientDirectory, StaticDirectory, SubjectDirectory};
pub use dispatcher::{create_dispatcher, DispatchSender, DispatchSettings, Dispatcher};
pub use geofence_index::{CachedSiteIndex, FixedSiteIndex, SiteIndex, SiteSnapshot};
pub use interpolator::GapFill;
pub use normalizer::{Normalizer, RawPayload};
pub use scheduler::{Scheduler, SweepStats};
pub use state_store::ContainmentStore;
