//! Node vocabulary shared by the engine and the orchestrator.
//!
//! - [`KindInfo`]: What a node kind is and which pads it declares
//! - [`PadTemplate`]: Always, sometimes or request pad declaration
//! - [`PadRef`]: A concrete pad on a named node
//! - [`PropertyValue`]: A node option value

mod kind;
mod pad;
mod property;

pub use kind::{KindInfo, NodeCategory};
pub use pad::{PadDirection, PadPresence, PadRef, PadTemplate};
pub use property::PropertyValue;
