//! wapush-campaign: bulk template dispatch
//!
//! Campaign state transitions, template variable resolution, pacing and the
//! sequential dispatch pass over a campaign's pending recipients.

pub mod engine;
pub mod error;
pub mod pacing;
pub mod sender;
pub mod template;

pub use engine::{DispatchEngine, PassReport, RecipientInput, BLACKLISTED_ERROR};
pub use error::{CampaignError, Result};
pub use pacing::{FixedPacing, PacingPolicy};
pub use sender::TemplateSender;
pub use template::{build_parameters, placeholder_order, resolve_variables};
