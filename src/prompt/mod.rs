// Declare submodules
mod common;
mod gates;
mod summarization;

pub use common::*;
pub use gates::{importance_prompt, region_verification_prompt};
pub use summarization::summary_prompt;
