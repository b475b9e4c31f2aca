//! Reactive state store: typed cells, observers, and UI-thread marshalling.

pub mod cell;
pub mod scheduler;
#[allow(clippy::module_inception)]
pub mod store;

pub use cell::{Cell, CellValue, ObserverId};
pub use scheduler::{ChannelScheduler, InlineScheduler, UiScheduler, UiTask};
pub use store::{state_store, StateStore};
