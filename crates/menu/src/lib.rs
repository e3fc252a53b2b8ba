//! Boot menu rendering and the HTTP layer that decides when to serve it.

pub mod decide;
pub mod template;

pub use decide::{menu_or_passthrough, router};
pub use template::{MenuEngine, MenuError};
