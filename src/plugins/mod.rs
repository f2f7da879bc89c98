//! Pipeline components.
//!
//! Data flows intake → queue → (external codec via [`worker`]) → compress →
//! partitions ← retention ⟷ holds. Every stage appends to [`audit`].

pub mod audit;
pub mod compress;
pub mod holds;
pub mod intake;
pub mod partitions;
pub mod queue;
pub mod retention;
pub mod worker;
